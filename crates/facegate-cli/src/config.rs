use anyhow::{ensure, Context, Result};
use facegate_core::{GateConfig, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Gate configuration: defaults, then an optional TOML file, then
/// `FACEGATE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Base directory for the store, the access log and reference images.
    pub data_dir: PathBuf,
    /// Enrollment store; relative paths resolve against `data_dir`.
    pub db_file: PathBuf,
    pub log_file: PathBuf,
    pub train_dir: PathBuf,
    /// Directory holding `det_10g.onnx` and `w600k_r50.onnx`
    /// (default: `<data_dir>/models`).
    pub model_dir: Option<PathBuf>,
    /// Inclusive Euclidean distance threshold for a match.
    pub match_threshold: f32,
    pub feedback_secs: u64,
    pub retry_delay_ms: u64,
    /// Flip the preview horizontally.
    pub mirror: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            data_dir: xdg_dir("XDG_DATA_HOME", ".local/share").join("facegate"),
            db_file: PathBuf::from("authorized_users.csv"),
            log_file: PathBuf::from("access_log.csv"),
            train_dir: PathBuf::from("train"),
            model_dir: None,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            feedback_secs: 3,
            retry_delay_ms: 100,
            mirror: true,
        }
    }
}

impl Config {
    /// Load from `path`, or from the user config file when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_path(), false),
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "reading config file");
                Some(text)
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("reading config {}", path.display()))
            }
        };

        Self::from_sources(text.as_deref(), |key| std::env::var(key).ok())
            .with_context(|| format!("invalid configuration ({})", path.display()))
    }

    /// Layer `toml_text` and the variables returned by `env` over the defaults.
    pub fn from_sources(
        toml_text: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config: Config = match toml_text {
            Some(text) => toml::from_str(text).context("parsing TOML")?,
            None => Config::default(),
        };
        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("FACEGATE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = env("FACEGATE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FACEGATE_DB_FILE") {
            self.db_file = PathBuf::from(v);
        }
        if let Some(v) = env("FACEGATE_LOG_FILE") {
            self.log_file = PathBuf::from(v);
        }
        if let Some(v) = env("FACEGATE_TRAIN_DIR") {
            self.train_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FACEGATE_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(v));
        }
        env_parse(&env, "FACEGATE_MATCH_THRESHOLD", &mut self.match_threshold);
        env_parse(&env, "FACEGATE_FEEDBACK_SECS", &mut self.feedback_secs);
        env_parse(&env, "FACEGATE_RETRY_DELAY_MS", &mut self.retry_delay_ms);
        if let Some(v) = env("FACEGATE_MIRROR") {
            self.mirror = !matches!(v.trim(), "0" | "false" | "no" | "off");
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.match_threshold.is_finite() && self.match_threshold >= 0.0,
            "match_threshold must be a finite, non-negative distance (got {})",
            self.match_threshold
        );
        ensure!(!self.camera_device.is_empty(), "camera_device is empty");
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_file)
    }

    pub fn train_path(&self) -> PathBuf {
        self.data_dir.join(&self.train_dir)
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            threshold: self.match_threshold,
            feedback_window: Duration::from_secs(self.feedback_secs),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

fn default_config_path() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config").join("facegate/config.toml")
}

fn xdg_dir(var: &str, home_relative: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(home_relative)
    })
}

fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else { return };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}
