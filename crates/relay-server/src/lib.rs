pub mod client;
pub mod error;
pub mod server;

pub use error::ServerError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
