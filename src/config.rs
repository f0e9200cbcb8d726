//! Environment driven settings.

use crate::error::{FluxViewError, Result};
use crate::image::flux::{FluxEngine, DEFAULT_BASE_URL};
use crate::pipeline::{PipelineConfig, DEFAULT_POLL_INTERVAL};
use std::path::PathBuf;
use std::time::Duration;

/// File under the data root holding the API key.
pub const CREDENTIAL_FILE: &str = "api_key.txt";
/// File under the data root holding the last prompt.
pub const LAST_PROMPT_FILE: &str = "last_prompt.txt";

/// Runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Data root for the key file, last prompt and `outputs/` tree.
    pub home: PathBuf,
    /// API host.
    pub api_base: String,
    /// Generation endpoint.
    pub engine: FluxEngine,
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Upper bound on status polls per run; `None` polls until terminal.
    pub max_poll_attempts: Option<u32>,
    /// Save every finished image to the dated outputs tree.
    pub auto_save: bool,
    /// Allow raw mode requests.
    pub raw_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            home: PathBuf::from("."),
            api_base: DEFAULT_BASE_URL.to_string(),
            engine: FluxEngine::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_attempts: None,
            auto_save: true,
            raw_mode: true,
        }
    }
}

impl Settings {
    /// Reads settings from the process environment.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FLUXVIEW_HOME` | `.` |
    /// | `BFL_API_BASE` | `https://api.bfl.ml` |
    /// | `FLUXVIEW_ENGINE` | `flux-pro-1.1-ultra` |
    /// | `FLUXVIEW_POLL_INTERVAL_MS` | `1000` |
    /// | `FLUXVIEW_MAX_POLLS` | unbounded |
    /// | `FLUXVIEW_AUTO_SAVE` | `true` |
    /// | `FLUXVIEW_RAW_MODE` | `true` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Self::default();

        if let Some(home) = get("FLUXVIEW_HOME") {
            settings.home = PathBuf::from(home);
        }
        if let Some(base) = get("BFL_API_BASE") {
            settings.api_base = base.trim().trim_end_matches('/').to_string();
        }
        if let Some(engine) = get("FLUXVIEW_ENGINE") {
            settings.engine = FluxEngine::from_name(&engine);
        }
        if let Some(ms) = get("FLUXVIEW_POLL_INTERVAL_MS") {
            let ms: u64 = parse_number("FLUXVIEW_POLL_INTERVAL_MS", &ms)?;
            if ms == 0 {
                return Err(FluxViewError::Config(
                    "FLUXVIEW_POLL_INTERVAL_MS must be greater than zero".into(),
                ));
            }
            settings.poll_interval = Duration::from_millis(ms);
        }
        if let Some(max) = get("FLUXVIEW_MAX_POLLS") {
            let max: u32 = parse_number("FLUXVIEW_MAX_POLLS", &max)?;
            settings.max_poll_attempts = (max > 0).then_some(max);
        }
        if let Some(flag) = get("FLUXVIEW_AUTO_SAVE") {
            settings.auto_save = parse_flag("FLUXVIEW_AUTO_SAVE", &flag)?;
        }
        if let Some(flag) = get("FLUXVIEW_RAW_MODE") {
            settings.raw_mode = parse_flag("FLUXVIEW_RAW_MODE", &flag)?;
        }

        Ok(settings)
    }

    /// Path of the API key file.
    pub fn credential_path(&self) -> PathBuf {
        self.home.join(CREDENTIAL_FILE)
    }

    /// Path of the last prompt file.
    pub fn last_prompt_path(&self) -> PathBuf {
        self.home.join(LAST_PROMPT_FILE)
    }

    /// Pipeline behaviour derived from these settings.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            poll_interval: self.poll_interval,
            max_poll_attempts: self.max_poll_attempts,
            auto_save: self.auto_save,
            raw_mode: self.raw_mode,
            ..PipelineConfig::default()
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FluxViewError::Config(format!("{key} must be a number, got {value:?}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(FluxViewError::Config(format!(
            "{key} must be a boolean, got {value:?}"
        ))),
    }
}
