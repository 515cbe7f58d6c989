//! Environment-driven configuration.

use std::env;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Gateway process configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket/HTTP listen port.
    pub port: u16,
    /// CORS allowlist; `None` allows every origin.
    pub cors_origins: Option<Vec<String>>,
    /// Prometheus exporter port.
    pub metrics_port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .expect("PORT must be a number");
        let metrics_port: u16 = env::var("METRICS_PORT")
            .unwrap_or_else(|_| "9102".to_string())
            .parse()
            .expect("METRICS_PORT must be a number");
        let cors_origins = env::var("CORS_ORIGIN").ok().and_then(|v| parse_origins(&v));
        Self {
            port,
            cors_origins,
            metrics_port,
        }
    }

    /// CORS layer for the configured allowlist; permissive when unset.
    pub fn cors_layer(&self) -> CorsLayer {
        match &self.cors_origins {
            None => CorsLayer::permissive(),
            Some(origins) => {
                let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(origins))
                    .allow_methods(Any)
                    .allow_headers(Any)
            }
        }
    }
}

/// Split a comma-separated allowlist; empty input means "allow all".
fn parse_origins(raw: &str) -> Option<Vec<String>> {
    let origins: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if origins.is_empty() {
        None
    } else {
        Some(origins)
    }
}
