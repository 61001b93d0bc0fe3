use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use wavelane_core::{
    ChannelLayout, CommonLayout, DEFAULT_SAMPLE_RATE, RoutingPolicy, SessionOptions,
    destination::DEFAULT_MAX_PATH_LEN,
    diagnostics::{DEFAULT_LOG_FILTER, DEFAULT_LOG_PREFIX},
};

pub const CONFIG_FILE_NAME: &str = "wavelane.config.toml";
pub const CONFIG_PATH_ENV: &str = "WAVELANE_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppMode {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub mode: AppMode,
    pub session: SessionConfig,
    pub export: ExportConfig,
    pub diagnostics: DiagnosticsConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub default_title: String,
    pub default_sample_rate: u32,
    pub default_layout: CommonLayout,
    pub routing_policy: RoutingPolicy,
    pub max_path_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
    /// Used for every container other than WAV.
    pub ffmpeg_binary: Option<PathBuf>,
    pub template_dir: PathBuf,
    pub encode_spool_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub rust_log_filter: String,
    pub trace_file_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub logs_dir: PathBuf,
    /// Where `file.save` puts documents that were never saved.
    pub untitled_dir: PathBuf,
    pub encode_temp_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: AppMode::Dev,
            session: SessionConfig::default(),
            export: ExportConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_title: "Untitled".to_string(),
            default_sample_rate: DEFAULT_SAMPLE_RATE,
            default_layout: CommonLayout::Stereo,
            routing_policy: RoutingPolicy::default(),
            max_path_len: DEFAULT_MAX_PATH_LEN,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: Some(PathBuf::from("ffmpeg")),
            template_dir: PathBuf::from("data/templates"),
            encode_spool_dir: PathBuf::from("data/encode-spool"),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            rust_log_filter: DEFAULT_LOG_FILTER.to_string(),
            trace_file_prefix: DEFAULT_LOG_PREFIX.to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("logs"),
            untitled_dir: PathBuf::from("data/untitled"),
            encode_temp_dir: PathBuf::from("data/encode-temp"),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path = discover_config_path().with_context(|| {
            format!("failed to locate {CONFIG_FILE_NAME}; looked in cwd and parent directory")
        })?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config TOML from {}", path.display()))
    }

    /// Falls back to defaults when no config file is found. A file that
    /// exists but does not parse is still an error.
    pub fn load_or_default() -> Result<Self> {
        match discover_config_path() {
            Ok(path) => Self::load_from(&path),
            Err(error) => {
                warn!(%error, "using default configuration");
                Ok(Self::default())
            }
        }
    }

    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            routing_policy: self.session.routing_policy,
            template_dir: self.export.template_dir.clone(),
            ffmpeg_binary: self.export.ffmpeg_binary.clone(),
            max_path_len: self.session.max_path_len,
        }
    }

    #[must_use]
    pub fn default_layout(&self) -> ChannelLayout {
        ChannelLayout::common(self.session.default_layout)
    }
}

fn discover_config_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
    }

    let cwd = env::current_dir().context("failed to resolve current directory")?;
    let candidates = [
        cwd.join(CONFIG_FILE_NAME),
        cwd.join("..").join(CONFIG_FILE_NAME),
    ];

    candidates
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| anyhow::anyhow!("{CONFIG_FILE_NAME} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"
mode = "prod"

[session]
default_sample_rate = 44100
default_layout = "surround51"
routing_policy = "exclusive"

[export]
ffmpeg_binary = "/opt/ffmpeg/bin/ffmpeg"
"#,
        )
        .expect("write config");

        let config = AppConfig::load_from(&path).expect("config should parse");
        assert_eq!(config.mode, AppMode::Prod);
        assert_eq!(config.session.default_sample_rate, 44_100);
        assert_eq!(config.default_layout().channel_count(), 6);
        assert_eq!(config.session.default_title, "Untitled");
        assert_eq!(config.diagnostics, DiagnosticsConfig::default());

        let options = config.session_options();
        assert_eq!(options.routing_policy, RoutingPolicy::Exclusive);
        assert_eq!(
            options.ffmpeg_binary,
            Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg"))
        );
        assert_eq!(options.template_dir, PathBuf::from("data/templates"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[session]\ndefault_sample_rate = \"fast\"\n").expect("write config");
        assert!(AppConfig::load_from(&path).is_err());
    }
}
