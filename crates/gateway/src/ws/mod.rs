pub mod handler;
pub mod session;

pub use handler::{router, GatewayState};
pub use session::ConnectionRegistry;
