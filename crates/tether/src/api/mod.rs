//! HTTP and WebSocket surface of the session broker.

mod error;
mod handlers;
mod proxy;
mod routes;
mod state;
mod ws;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
