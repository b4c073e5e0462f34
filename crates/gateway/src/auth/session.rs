// Session authentication against the external session store.
//
// The gateway never issues credentials; it only resolves the opaque
// session token carried by the WebSocket handshake to an identity, or
// refuses the connection. Failure here is terminal for the attempt —
// there is no retry inside the gateway.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;
use vigil_common::types::Identity;

/// Why a credential failed to resolve. All variants refuse the
/// connection with 401; the distinction is for logs and error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthRejection {
    /// No session row matches the credential, or the session's user has
    /// no linked identity.
    #[error("no session matches the supplied credential")]
    UnknownSession,
    /// The session row exists but its expiry has passed.
    #[error("session has expired")]
    Expired,
}

/// Outcome of resolving a handshake credential.
pub type SessionResolution = Result<Identity, AuthRejection>;

#[derive(Debug, Clone)]
pub struct MemorySessionRecord {
    identity: Identity,
    expires_at: DateTime<Utc>,
}

/// Looks up handshake credentials in the external session store.
///
/// `Postgres` is the production backing; `Memory` serves tests and
/// local development without a database.
#[derive(Clone)]
pub enum SessionStore {
    Postgres(sqlx::PgPool),
    Memory(Arc<RwLock<HashMap<String, MemorySessionRecord>>>),
}

impl SessionStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to initialize gateway PostgreSQL pool for session lookup")?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("gateway PostgreSQL health check failed")?;

        Ok(Self::Postgres(pool))
    }

    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Resolve a raw handshake credential to an identity.
    ///
    /// `Err(anyhow)` is an infrastructure failure (store unreachable),
    /// reported as 500; `Ok(Err(..))` is an ordinary rejection.
    pub async fn resolve_session(&self, credential: &str) -> anyhow::Result<SessionResolution> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, (String, String, DateTime<Utc>)>(
                    r#"
                    SELECT a.id, a.display_name, s.expires_at
                    FROM sessions AS s
                    INNER JOIN analysts AS a
                        ON a.id = s.analyst_id
                    WHERE s.token = $1
                    "#,
                )
                .bind(credential)
                .fetch_optional(pool)
                .await
                .context("failed to query session store for handshake credential")?;

                Ok(match row {
                    None => Err(AuthRejection::UnknownSession),
                    Some((_, _, expires_at)) if Utc::now() > expires_at => {
                        Err(AuthRejection::Expired)
                    }
                    Some((analyst_id, display_name, _)) => {
                        Ok(Identity { analyst_id, display_name })
                    }
                })
            }
            Self::Memory(store) => {
                let guard = store.read().await;
                Ok(match guard.get(credential) {
                    None => Err(AuthRejection::UnknownSession),
                    Some(record) if Utc::now() > record.expires_at => Err(AuthRejection::Expired),
                    Some(record) => Ok(record.identity.clone()),
                })
            }
        }
    }

    /// Seed a session into the memory variant. No-op on Postgres.
    pub async fn insert_memory_session(
        &self,
        token: impl Into<String>,
        identity: Identity,
        expires_at: DateTime<Utc>,
    ) {
        if let Self::Memory(store) = self {
            store
                .write()
                .await
                .insert(token.into(), MemorySessionRecord { identity, expires_at });
        }
    }
}
