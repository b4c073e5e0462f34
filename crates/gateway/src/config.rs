// Gateway server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The session store reads its own connection settings —
// this module covers the core server settings.

use std::net::SocketAddr;

/// Core gateway server configuration.
///
/// Constructed via [`GatewayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string for the session store.
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `vigil_gateway=debug`).
    pub log_filter: String,
}

impl GatewayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `VIGIL_GATEWAY_HOST` | `0.0.0.0` |
    /// | `VIGIL_GATEWAY_PORT` | `8080` |
    /// | `VIGIL_GATEWAY_DATABASE_URL` | *(none — memory session store)* |
    /// | `VIGIL_GATEWAY_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("VIGIL_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("VIGIL_GATEWAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("VIGIL_GATEWAY_DATABASE_URL").ok();

        let log_filter =
            env("VIGIL_GATEWAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, database_url, log_filter }
    }
}
