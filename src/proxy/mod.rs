// proxy module - session-aware forwarding proxy core

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod session;
pub mod sweeper;
pub mod upstream;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use server::AxumServer;
pub use session::SessionRegistry;
pub use sweeper::SessionSweeper;
pub use upstream::UpstreamClient;
