use serde::{Deserialize, Serialize};

/// Proxy service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether to allow LAN access
    /// - false: local access only, 127.0.0.1 (default, privacy first)
    /// - true: bind 0.0.0.0
    #[serde(default)]
    pub allow_lan_access: bool,

    /// Idle lifetime of a session before eviction (seconds)
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,

    /// Interval between sweeper ticks (seconds)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,

    /// Hard ceiling on the upstream client timeout (seconds); per-call
    /// timeouts are clamped below this
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Baseline User-Agent attached to forwarded requests when the session
    /// does not define one
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Whether new sessions verify upstream certificates
    #[serde(default)]
    pub verify_ssl: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            allow_lan_access: false,
            session_timeout: default_session_timeout(),
            cleanup_interval: default_cleanup_interval(),
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
            verify_ssl: false,
        }
    }
}

fn default_port() -> u16 {
    8060
}

fn default_session_timeout() -> u64 {
    600 // 10 minutes
}

fn default_cleanup_interval() -> u64 {
    300 // 5 minutes
}

fn default_request_timeout() -> u64 {
    120
}

fn default_user_agent() -> String {
    format!("session-proxy/{}", env!("CARGO_PKG_VERSION"))
}

impl ProxyConfig {
    /// Actual bind address
    /// - allow_lan_access = false: "127.0.0.1" (default, privacy first)
    /// - allow_lan_access = true: "0.0.0.0"
    pub fn get_bind_address(&self) -> &str {
        if self.allow_lan_access {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }
}
