// Protocol version negotiation.
//
// Clients may send a protocol version string (e.g. "vigil-presence.v1")
// as a query parameter on the WebSocket upgrade. The server rejects
// unsupported versions with an UPGRADE_REQUIRED error before the upgrade
// completes.

use crate::error::{ErrorCode, GatewayError};
use serde_json::json;

/// The current (latest) protocol version.
pub const CURRENT_VERSION: &str = "vigil-presence.v1";

/// All protocol versions the server accepts, newest first.
const SUPPORTED_VERSIONS: &[&str] = &[CURRENT_VERSION];

/// Returns true if the given protocol version string is supported.
pub fn is_supported(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Returns the list of supported protocol versions (newest first).
pub fn supported_versions() -> &'static [&'static str] {
    SUPPORTED_VERSIONS
}

/// Validates a client-supplied protocol version. Returns `Ok(())` if
/// supported, or a `GatewayError` with code `UPGRADE_REQUIRED` and
/// `details.supported_versions` if not.
pub fn require_supported(version: &str) -> Result<(), GatewayError> {
    if is_supported(version) {
        Ok(())
    } else {
        Err(GatewayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported protocol version: {version}"),
        )
        .with_details(json!({
            "requested_version": version,
            "supported_versions": SUPPORTED_VERSIONS,
            "current_version": CURRENT_VERSION,
        })))
    }
}
