//! Server settings (JSON file, then environment overrides).

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use audiotag_core::engine::DEFAULT_MAX_DOWNLOAD_BYTES;
use audiotag_core::{EngineConfig, GenreMode, ModelPaths, PipelineConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    /// Browser origins allowed by CORS. `"*"` allows any origin.
    pub cors_origins: Vec<String>,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// Largest audio file accepted from a file URL.
    pub max_download_bytes: u64,
    /// Serve every task with deterministic stand-in models. Development only.
    pub stub_models: bool,
    pub models: ModelPaths,
    pub pipeline: PipelineConfig,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.into(),
            cors_origins: vec![
                "http://localhost:5173".into(),
                "http://127.0.0.1:5173".into(),
            ],
            request_timeout_secs: 120,
            download_timeout_secs: 30,
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            stub_models: false,
            models: ModelPaths::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServerSettings {
    pub fn normalize(&mut self) {
        if self.bind_addr.trim().parse::<SocketAddr>().is_err() {
            warn!(bind_addr = %self.bind_addr, "invalid bind address, using default");
            self.bind_addr = DEFAULT_BIND_ADDR.into();
        } else {
            self.bind_addr = self.bind_addr.trim().to_string();
        }
        self.cors_origins = normalize_cors_origins(&self.cors_origins);
        self.request_timeout_secs = self.request_timeout_secs.clamp(1, 3600);
        self.download_timeout_secs = self.download_timeout_secs.clamp(1, self.request_timeout_secs);
        self.max_download_bytes = self.max_download_bytes.max(1024);
        self.pipeline.normalize();
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8000)))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pipeline: self.pipeline.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            max_download_bytes: self.max_download_bytes,
        }
    }

    /// Environment variables win over the settings file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("AUDIOTAG_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(dir) = var("AUDIOTAG_MODEL_DIR").filter(|d| !d.trim().is_empty()) {
            self.models.dir = PathBuf::from(dir.trim());
        }
        if let Some(raw) = var("AUDIOTAG_REQUEST_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.request_timeout_secs = secs,
                Err(_) => warn!(value = %raw, "ignoring AUDIOTAG_REQUEST_TIMEOUT_SECS"),
            }
        }
        if let Some(raw) = var("AUDIOTAG_MAX_DOWNLOAD_BYTES") {
            match raw.trim().parse::<u64>() {
                Ok(bytes) => self.max_download_bytes = bytes,
                Err(_) => warn!(value = %raw, "ignoring AUDIOTAG_MAX_DOWNLOAD_BYTES"),
            }
        }
        if let Some(raw) = var("AUDIOTAG_GENRE_MODE") {
            match raw.parse::<GenreMode>() {
                Ok(mode) => self.pipeline.genre.mode = mode,
                Err(e) => warn!(error = %e, "ignoring AUDIOTAG_GENRE_MODE"),
            }
        }
        if let Some(raw) = var("AUDIOTAG_TIE_BREAK_SEED") {
            match raw.trim().parse::<u64>() {
                Ok(seed) => self.pipeline.tie_break_seed = Some(seed),
                Err(_) => warn!(value = %raw, "ignoring AUDIOTAG_TIE_BREAK_SEED"),
            }
        }
    }
}

/// Keeps `scheme://host[:port]` origins (and `*`), dropping duplicates and
/// anything with a path.
fn normalize_cors_origins(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for origin in raw {
        let origin = origin.trim().trim_end_matches('/');
        let valid = origin == "*"
            || origin
                .split_once("://")
                .map(|(scheme, host)| {
                    matches!(scheme, "http" | "https") && !host.is_empty() && !host.contains('/')
                })
                .unwrap_or(false);
        if !valid {
            warn!(%origin, "dropping invalid CORS origin");
            continue;
        }
        if !out.iter().any(|o| o.eq_ignore_ascii_case(origin)) {
            out.push(origin.to_string());
        }
    }
    out
}

pub fn default_settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("AUDIOTAG_SETTINGS") {
        return PathBuf::from(path);
    }
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("audiotag")
        .join("settings.json")
}

/// Missing or unparsable files yield defaults.
pub fn load_settings(path: &Path) -> ServerSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<ServerSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "settings file unreadable, using defaults");
            ServerSettings::default()
        }),
        Err(_) => ServerSettings::default(),
    };
    settings.apply_env_overrides();
    settings.normalize();
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings: ServerSettings = serde_json::from_str(
            r#"{"bind_addr": "127.0.0.1:9000", "pipeline": {"genre": {"mode": "plain_mean"}}}"#,
        )
        .unwrap();
        assert_eq!(settings.bind_addr, "127.0.0.1:9000");
        assert_eq!(settings.pipeline.genre.mode, GenreMode::PlainMean);
        assert_eq!(settings.request_timeout_secs, 120);
        assert!(!settings.stub_models);
    }

    #[test]
    fn normalize_repairs_bad_values() {
        let mut settings = ServerSettings {
            bind_addr: "nowhere".into(),
            cors_origins: vec![
                "http://localhost:5173/".into(),
                "http://localhost:5173".into(),
                "localhost:3000".into(),
                "https://app.example.com/path".into(),
            ],
            request_timeout_secs: 0,
            download_timeout_secs: 600,
            max_download_bytes: 0,
            ..ServerSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(settings.cors_origins, vec!["http://localhost:5173".to_string()]);
        assert_eq!(settings.request_timeout_secs, 1);
        assert_eq!(settings.download_timeout_secs, 1);
        assert_eq!(settings.max_download_bytes, 1024);
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("AUDIOTAG_BIND_ADDR", "127.0.0.1:7000"),
            ("AUDIOTAG_MODEL_DIR", "/srv/models"),
            ("AUDIOTAG_REQUEST_TIMEOUT_SECS", "45"),
            ("AUDIOTAG_GENRE_MODE", "plain_mean"),
            ("AUDIOTAG_MAX_DOWNLOAD_BYTES", "5000000"),
            ("AUDIOTAG_TIE_BREAK_SEED", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut settings = ServerSettings::default();
        settings.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.bind_addr, "127.0.0.1:7000");
        assert_eq!(settings.models.dir, PathBuf::from("/srv/models"));
        assert_eq!(settings.request_timeout_secs, 45);
        assert_eq!(settings.pipeline.genre.mode, GenreMode::PlainMean);
        assert_eq!(settings.pipeline.tie_break_seed, None);
        assert_eq!(settings.max_download_bytes, 5_000_000);
    }

    #[test]
    fn engine_config_carries_timeouts() {
        let config = ServerSettings::default().engine_config();
        assert_eq!(config.request_timeout, Duration::from_secs(120));
        assert_eq!(config.download_timeout, Duration::from_secs(30));
        assert_eq!(config.max_download_bytes, DEFAULT_MAX_DOWNLOAD_BYTES);
    }
}
