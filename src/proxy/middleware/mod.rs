// Middleware module - Axum middleware

pub mod cors;
pub mod session;

pub use cors::cors_layer;
pub use session::session_middleware;
