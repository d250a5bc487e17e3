//! HTTP surface: router construction, proxy dispatch, request correlation,
//! and server lifecycle.

pub mod proxy;
pub mod router;
pub mod server;
pub mod trace;

pub use router::{GatewayDeps, create_router};
pub use server::Gateway;
