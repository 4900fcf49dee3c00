//! Configuration – reads/writes `~/.carscout/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use carscout_kernel::DispatchMode;
use carscout_middleware::ChannelScheme;
use carscout_runtime::ScannerConfig;
use carscout_types::LocationPoint;

/// How added vehicles are matched to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchSetting {
    #[default]
    Proximity,
    Broadcast,
}

impl std::fmt::Display for DispatchSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchSetting::Proximity => write!(f, "proximity"),
            DispatchSetting::Broadcast => write!(f, "broadcast"),
        }
    }
}

impl std::str::FromStr for DispatchSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proximity" => Ok(DispatchSetting::Proximity),
            "broadcast" => Ok(DispatchSetting::Broadcast),
            other => Err(format!("unknown dispatch mode '{other}'")),
        }
    }
}

/// Persisted configuration stored in `~/.carscout/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Leading segment of every channel name.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Appended to inbound channels (e.g. `.GZ`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_suffix: String,

    #[serde(default)]
    pub dispatch_mode: DispatchSetting,

    /// Radius around a watched location that counts as "near", in metres.
    #[serde(default = "default_radius")]
    pub proximity_radius_m: f64,

    /// Seconds to wait for a booking response before giving up on a watcher.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// Keep listening for full snapshots after the first one.
    #[serde(default)]
    pub resnapshot: bool,

    /// SQLite file for the attempt ledger; in-memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<String>,

    /// Coordinates of watchable locations.
    #[serde(default)]
    pub locations: Vec<LocationPoint>,
}

fn default_channel_prefix() -> String {
    "C2G".to_string()
}
fn default_radius() -> f64 {
    150.0
}
fn default_response_timeout() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_prefix: default_channel_prefix(),
            channel_suffix: String::new(),
            dispatch_mode: DispatchSetting::default(),
            proximity_radius_m: default_radius(),
            response_timeout_secs: default_response_timeout(),
            resnapshot: false,
            ledger_path: None,
            locations: Vec::new(),
        }
    }
}

impl Config {
    pub fn channels(&self) -> ChannelScheme {
        ChannelScheme::new(self.channel_prefix.clone()).with_suffix(self.channel_suffix.clone())
    }

    pub fn dispatch(&self) -> DispatchMode {
        match self.dispatch_mode {
            DispatchSetting::Proximity => DispatchMode::Proximity {
                radius_m: self.proximity_radius_m,
            },
            DispatchSetting::Broadcast => DispatchMode::Broadcast,
        }
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            channels: self.channels(),
            dispatch_mode: self.dispatch(),
            locations: self.locations.clone(),
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            resnapshot: self.resnapshot,
            ..ScannerConfig::default()
        }
    }
}

/// Return the path to `~/.carscout/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".carscout").join("config.toml")
}

/// Where the configuration in use came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Read from an existing file.
    File,
    /// No file existed; the defaults were written to disk.
    Created { save_error: Option<String> },
    /// The file could not be read or parsed; defaults are used.
    Fallback(String),
}

/// Load `~/.carscout/config.toml`, writing the defaults on first run.
/// `CARSCOUT_*` overrides are applied on top in every case; they are never
/// written back to disk.
pub fn load_or_init() -> (Config, ConfigSource) {
    load_or_init_at(&config_path())
}

pub(crate) fn load_or_init_at(path: &PathBuf) -> (Config, ConfigSource) {
    let (mut cfg, source) = match load_from(path) {
        Ok(Some(cfg)) => (cfg, ConfigSource::File),
        Ok(None) => {
            let cfg = Config::default();
            let save_error = save_to(&cfg, path).err();
            (cfg, ConfigSource::Created { save_error })
        }
        Err(e) => (Config::default(), ConfigSource::Fallback(e)),
    };
    apply_env_overrides(&mut cfg);
    (cfg, source)
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `CARSCOUT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CARSCOUT_CHANNEL_PREFIX` | `channel_prefix` |
/// | `CARSCOUT_DISPATCH_MODE` | `dispatch_mode` |
/// | `CARSCOUT_PROXIMITY_RADIUS_M` | `proximity_radius_m` |
/// | `CARSCOUT_RESPONSE_TIMEOUT_SECS` | `response_timeout_secs` |
/// | `CARSCOUT_LEDGER_PATH` | `ledger_path` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CARSCOUT_CHANNEL_PREFIX") {
        cfg.channel_prefix = v;
    }
    if let Ok(v) = std::env::var("CARSCOUT_DISPATCH_MODE")
        && let Ok(mode) = v.parse::<DispatchSetting>()
    {
        cfg.dispatch_mode = mode;
    }
    if let Ok(v) = std::env::var("CARSCOUT_PROXIMITY_RADIUS_M")
        && let Ok(radius) = v.parse::<f64>()
        && radius.is_finite()
        && radius >= 0.0
    {
        cfg.proximity_radius_m = radius;
    }
    if let Ok(v) = std::env::var("CARSCOUT_RESPONSE_TIMEOUT_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.response_timeout_secs = secs;
    }
    if let Ok(v) = std::env::var("CARSCOUT_LEDGER_PATH") {
        cfg.ledger_path = if v.is_empty() { None } else { Some(v) };
    }
}

/// Save the config to `path`, creating its directory if necessary.
pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
