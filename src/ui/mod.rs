//! HTTP control surface for a local front end

pub mod handlers;
pub mod server;

pub use handlers::ApiResponse;
pub use server::{router, AppState, ControlApi};
