pub mod env;
pub mod error;
pub mod management;
pub mod proxy;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod tls;

pub use error::{GatewayError, Result};
pub use registry::Registry;
pub use state::AppState;
