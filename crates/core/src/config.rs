use arc_swap::ArcSwap;
use axum::http::HeaderName;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ─── Config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,

    // Upstream airport location API base URL
    pub airport_api: String,

    // Timeouts (seconds)
    pub connect_timeout: u64,
    pub request_timeout: u64,

    // Request body size limit (MB)
    pub body_limit_mb: usize,

    pub shutdown_timeout: u64,

    // Logging output
    pub logging_to_file: bool,
    pub log_dir: Option<String>,

    // Header names
    pub correlation_header: String,
    pub forwarded_ip_header: String,

    pub logging: HttpLoggingConfig,
    pub idempotency: IdempotencyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            airport_api: String::new(),
            connect_timeout: 10,
            request_timeout: 30,
            body_limit_mb: 1,
            shutdown_timeout: 5,
            logging_to_file: false,
            log_dir: None,
            correlation_header: "x-correlation-id".to_string(),
            forwarded_ip_header: "X-Original-For".to_string(),
            logging: HttpLoggingConfig::default(),
            idempotency: IdempotencyConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a YAML file, sanitize, and validate. A validation
    /// failure here is fatal: the server must not start on a broken config.
    pub fn load(path: &str) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml_ng::from_str(&contents)?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        anyhow::ensure!(!self.airport_api.is_empty(), "airport-api must be set");

        for (key, name) in [
            ("correlation-header", &self.correlation_header),
            ("forwarded-ip-header", &self.forwarded_ip_header),
            ("idempotency.header", &self.idempotency.header),
        ] {
            anyhow::ensure!(
                HeaderName::from_bytes(name.as_bytes()).is_ok(),
                "{key} is not a valid header name: {name:?}"
            );
        }

        if self.logging.log_request_body || self.logging.log_response_body {
            anyhow::ensure!(
                self.logging.max_body_length > 0,
                "max-body-length must be positive when body logging is enabled"
            );
        }

        if self.idempotency.enabled {
            anyhow::ensure!(
                self.idempotency.wait_timeout_ms > 0,
                "idempotency.wait-timeout-ms must be positive"
            );
            anyhow::ensure!(
                self.idempotency.retention_secs > 0,
                "idempotency.retention-secs must be positive"
            );
        }

        Ok(())
    }

    /// Sanitize and normalize configuration.
    pub fn sanitize(&mut self) {
        while self.airport_api.ends_with('/') {
            self.airport_api.pop();
        }

        // Redaction is case-insensitive; normalize once so lookups are cheap.
        for header in self
            .logging
            .skip_request_headers
            .iter_mut()
            .chain(self.logging.skip_response_headers.iter_mut())
        {
            *header = header.to_lowercase();
        }
    }
}

// ─── Sub-configs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HttpLoggingConfig {
    /// Paths excluded from request/response logging (noisy endpoints).
    pub skip_paths: Vec<String>,
    /// Request header names never written to log attributes.
    pub skip_request_headers: Vec<String>,
    /// Response header names never written to log attributes.
    pub skip_response_headers: Vec<String>,
    pub log_request_body: bool,
    pub log_response_body: bool,
    /// Cap, in characters, on logged body text. Never affects what the
    /// client sends or receives.
    pub max_body_length: usize,
}

impl Default for HttpLoggingConfig {
    fn default() -> Self {
        Self {
            skip_paths: Vec::new(),
            skip_request_headers: vec!["authorization".to_string(), "cookie".to_string()],
            skip_response_headers: vec!["set-cookie".to_string()],
            log_request_body: false,
            log_response_body: false,
            max_body_length: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IdempotencyConfig {
    pub enabled: bool,
    /// Header carrying the client-supplied key (UUID).
    pub header: String,
    /// Hard wall-clock bound on waiting for a racing in-flight request.
    pub wait_timeout_ms: u64,
    /// Retention window for stored records.
    pub retention_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            header: "Idempotency-Key".to_string(),
            wait_timeout_ms: 60_000,
            retention_secs: 3_600,
        }
    }
}

// ─── Config Watcher ────────────────────────────────────────────────────────

pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching a config file. On changes (debounced 150ms, SHA256
    /// dedup), reload the config and atomically swap it in via ArcSwap.
    pub fn start(
        path: String,
        config: Arc<ArcSwap<Config>>,
        on_reload: impl Fn(&Config) + Send + Sync + 'static,
    ) -> Result<Self, anyhow::Error> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
            if let Ok(event) = res
                && (event.kind.is_modify() || event.kind.is_create())
            {
                let _ = tx.blocking_send(());
            }
        })?;
        watcher.watch(Path::new(&path), RecursiveMode::NonRecursive)?;

        tokio::spawn(async move {
            let mut last_hash: Option<[u8; 32]> = None;

            while rx.recv().await.is_some() {
                // Debounce bursts of filesystem events for one write.
                tokio::time::sleep(Duration::from_millis(150)).await;
                while rx.try_recv().is_ok() {}

                let Ok(contents) = std::fs::read(&path) else {
                    continue;
                };
                let hash: [u8; 32] = sha2::Sha256::digest(&contents).into();
                if last_hash == Some(hash) {
                    continue;
                }
                last_hash = Some(hash);

                match Config::load(&path) {
                    Ok(new_config) => {
                        on_reload(&new_config);
                        config.store(Arc::new(new_config));
                        tracing::info!("Config reloaded from {path}");
                    }
                    Err(e) => {
                        tracing::error!("Config reload failed, keeping previous config: {e}");
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            airport_api: "https://airports.example.com/api".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.correlation_header, "x-correlation-id");
        assert_eq!(config.forwarded_ip_header, "X-Original-For");
        assert_eq!(config.idempotency.header, "Idempotency-Key");
        assert_eq!(config.idempotency.wait_timeout_ms, 60_000);
        assert!(!config.idempotency.enabled);
        assert!(!config.logging.log_request_body);
    }

    #[test]
    fn test_validate_requires_airport_api() {
        assert!(Config::default().validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_header_name() {
        let config = Config {
            correlation_header: "not a header".to_string(),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_wait_timeout_when_enabled() {
        let config = Config {
            idempotency: IdempotencyConfig {
                enabled: true,
                wait_timeout_ms: 0,
                ..IdempotencyConfig::default()
            },
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sanitize_lowercases_redaction_lists_and_trims_url() {
        let mut config = Config {
            airport_api: "https://airports.example.com/api///".to_string(),
            ..Config::default()
        };
        config.logging.skip_request_headers = vec!["Authorization".to_string()];
        config.logging.skip_response_headers = vec!["Set-Cookie".to_string()];
        config.sanitize();

        assert_eq!(config.airport_api, "https://airports.example.com/api");
        assert_eq!(config.logging.skip_request_headers, vec!["authorization"]);
        assert_eq!(config.logging.skip_response_headers, vec!["set-cookie"]);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
airport-api: "https://airports.example.com/api/"
logging:
  skip-paths: ["/health"]
  log-response-body: true
  max-body-length: 64
idempotency:
  enabled: true
  wait-timeout-ms: 500
"#,
        )
        .expect("write config");

        let config = Config::load(path.to_str().expect("utf-8 path")).expect("load config");
        assert_eq!(config.airport_api, "https://airports.example.com/api");
        assert_eq!(config.logging.skip_paths, vec!["/health"]);
        assert!(config.logging.log_response_body);
        assert_eq!(config.logging.max_body_length, 64);
        assert!(config.idempotency.enabled);
        assert_eq!(config.idempotency.wait_timeout_ms, 500);
        // untouched sections keep defaults
        assert_eq!(config.idempotency.retention_secs, 3_600);
    }

    #[test]
    fn test_load_rejects_invalid_config_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "idempotency:\n  enabled: true\n").expect("write config");

        // airport-api missing → fail fast
        assert!(Config::load(path.to_str().expect("utf-8 path")).is_err());
    }
}
