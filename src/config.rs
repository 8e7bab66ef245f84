use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CONFIG_SCHEMA_VERSION: u32 = 1;
const DEFAULT_STALL_SECONDS: u64 = 120;
const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 300;
const DEFAULT_PID_LOG_TIMEOUT_SECONDS: u64 = 8;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const PID_RECHECK_INTERVAL: Duration = Duration::from_millis(500);

pub const DEFAULT_NEW_TITLE: &str = "codex:new";
pub const DEFAULT_RUNNING_TITLE: &str = "codex:running...";
pub const DEFAULT_DONE_TITLE: &str = "codex:✅";
pub const DEFAULT_NO_COMMIT_TITLE: &str = "codex:🚧";
pub const DEFAULT_STALLED_TITLE: &str = "codex:stalled";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TitleConfig {
    pub schema_version: u32,
    pub new_title: String,
    pub running_title: String,
    pub done_title: String,
    pub no_commit_title: String,
    pub stalled_title: String,
    /// Upgrade a no-commit finish to the done title when the repository HEAD
    /// moved during the turn.
    pub verify_head_change: bool,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            new_title: DEFAULT_NEW_TITLE.to_string(),
            running_title: DEFAULT_RUNNING_TITLE.to_string(),
            done_title: DEFAULT_DONE_TITLE.to_string(),
            no_commit_title: DEFAULT_NO_COMMIT_TITLE.to_string(),
            stalled_title: DEFAULT_STALLED_TITLE.to_string(),
            verify_head_change: true,
        }
    }
}

impl TitleConfig {
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut parsed: TitleConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save(path)?;
            }
            Ok(parsed)
        } else {
            let cfg = TitleConfig::default();
            cfg.save(path)?;
            Ok(cfg)
        }
    }

    /// Never fails: an unreadable or unwritable config falls back to the
    /// defaults so the wrapped session still starts.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load_or_init(path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %format!("{err:#}"), "using default config");
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (name, slot) in [
            ("CODEX_TITLE_NEW_TITLE", &mut self.new_title),
            ("CODEX_TITLE_RUNNING_TITLE", &mut self.running_title),
            ("CODEX_TITLE_DONE_TITLE", &mut self.done_title),
            ("CODEX_TITLE_NO_COMMIT_TITLE", &mut self.no_commit_title),
            ("CODEX_TITLE_STALLED_TITLE", &mut self.stalled_title),
        ] {
            if let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) {
                *slot = value;
            }
        }
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        let defaults = TitleConfig::default();
        for (slot, fallback) in [
            (&mut self.new_title, defaults.new_title),
            (&mut self.running_title, defaults.running_title),
            (&mut self.done_title, defaults.done_title),
            (&mut self.no_commit_title, defaults.no_commit_title),
            (&mut self.stalled_title, defaults.stalled_title),
        ] {
            if slot.trim().is_empty() {
                *slot = fallback;
                changed = true;
            }
        }

        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Zero disables the stalled overlay.
    pub stall_timeout: Duration,
    /// Zero trusts every embedded session timestamp.
    pub clock_skew: Duration,
    /// Window for pid-based discovery before fallback runs. Zero disables
    /// pid-based discovery.
    pub pid_log_timeout: Duration,
    pub poll_interval: Duration,
    pub retry_interval: Duration,
    pub pid_recheck_interval: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(DEFAULT_STALL_SECONDS),
            clock_skew: Duration::from_secs(DEFAULT_CLOCK_SKEW_SECONDS),
            pid_log_timeout: Duration::from_secs(DEFAULT_PID_LOG_TIMEOUT_SECONDS),
            poll_interval: POLL_INTERVAL,
            retry_interval: DISCOVERY_RETRY_INTERVAL,
            pid_recheck_interval: PID_RECHECK_INTERVAL,
        }
    }
}

pub fn runtime_settings() -> RuntimeSettings {
    runtime_settings_from(|name| env::var(name).ok())
}

fn runtime_settings_from(lookup: impl Fn(&str) -> Option<String>) -> RuntimeSettings {
    RuntimeSettings {
        stall_timeout: Duration::from_secs(env_u64(
            &lookup,
            "CODEX_TITLE_STALL_SECS",
            DEFAULT_STALL_SECONDS,
        )),
        clock_skew: Duration::from_secs(env_u64(
            &lookup,
            "CODEX_TITLE_CLOCK_SKEW_SECS",
            DEFAULT_CLOCK_SKEW_SECONDS,
        )),
        pid_log_timeout: Duration::from_secs(env_u64(
            &lookup,
            "CODEX_TITLE_PID_LOG_TIMEOUT_SECS",
            DEFAULT_PID_LOG_TIMEOUT_SECONDS,
        )),
        ..RuntimeSettings::default()
    }
}

/// Where Codex keeps its own state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodexPaths {
    pub home: PathBuf,
    pub sessions_root: PathBuf,
    pub tui_log: PathBuf,
    pub history: PathBuf,
}

impl CodexPaths {
    pub fn from_home(home: PathBuf) -> Self {
        Self {
            sessions_root: home.join("sessions"),
            tui_log: home.join("log").join("codex-tui.log"),
            history: home.join("history.jsonl"),
            home,
        }
    }

    pub fn resolve() -> Self {
        Self::from_home(codex_home())
    }
}

pub fn codex_home() -> PathBuf {
    if let Ok(custom) = env::var("CODEX_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".codex")
}

pub fn config_path() -> PathBuf {
    if let Ok(custom) = env::var("CODEX_TITLE_CONFIG") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::config_dir()
        .unwrap_or_else(codex_home)
        .join("codex-title")
        .join("config.json")
}

/// Side log for diagnostics. An empty `CODEX_TITLE_LOG_PATH` turns it off.
pub fn diagnostics_log_path() -> Option<PathBuf> {
    match env::var("CODEX_TITLE_LOG_PATH") {
        Ok(custom) if custom.trim().is_empty() => None,
        Ok(custom) => Some(PathBuf::from(custom.trim())),
        Err(_) => Some(codex_home().join("log").join("codex-title.log")),
    }
}

/// Unlike most knobs, zero is meaningful here (it disables the feature), so
/// only unparsable values fall back to the default.
fn env_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    lookup(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
