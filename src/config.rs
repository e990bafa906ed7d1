use std::env;
use std::time::Duration;

use reqwest::Client;

pub struct AppConfig {
    pub listen_addr: String,
    /// Default per-engine upstream dispatch timeout, applied via the
    /// shared client's request builder when a KP registration doesn't
    /// override it.
    pub default_upstream_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| {
            tracing::warn!("LISTEN_ADDR not set — defaulting to 0.0.0.0:8000");
            "0.0.0.0:8000".to_string()
        });

        let default_upstream_timeout = env::var("UPSTREAM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| {
                tracing::warn!("UPSTREAM_TIMEOUT_SECS not set — defaulting to 30s");
                Duration::from_secs(30)
            });

        Self {
            listen_addr,
            default_upstream_timeout,
        }
    }
}

/// A single HTTP client reused across every engine, so connection pooling
/// is shared instead of duplicated per KP. `timeout` is the process-wide
/// default; an engine whose `KPInfo` carries its own timeout overrides it
/// per request via the request builder instead of this client setting.
pub fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()
        .expect("failed to build HTTP client")
}
