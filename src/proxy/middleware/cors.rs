use tower_http::cors::{Any, CorsLayer};

/// Permissive CORS layer: any origin, method and header.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
