use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// TOML configuration of the hosted worker node
    pub worker_config: Option<PathBuf>,
    /// Overrides the worker configuration's log level
    pub log_level: Option<String>,
    pub peer_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            worker_config: std::env::var("WORKER_CONFIG").ok().map(PathBuf::from),
            log_level: std::env::var("LOG_LEVEL").ok(),
            peer_timeout: Duration::from_secs(
                std::env::var("PEER_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}
