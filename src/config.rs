//! Persisted channel settings and runtime options.
//!
//! Channel settings live in a TOML file and are applied once at start-up;
//! edits made through the API are written back to the file and take effect
//! after a restart. Runtime options come from environment variables.

use crate::error::{ChannelError, ConfigError};
use crate::estimator::{NAME_CAPACITY, PULSES_PER_KWH_RANGE_MAX, PULSES_PER_KWH_RANGE_MIN};
use crate::pulse_input::{PIN_RANGE_MAX, PIN_RANGE_MIN};
use crate::registry::MAX_CHANNELS;
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Pulses per kWh used for channels without stored settings.
pub const DEFAULT_PULSES_PER_KWH: u32 = 1000;

/// Settings of one S0 channel as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pin: u8,
    #[serde(default = "default_pulses_per_kwh")]
    pub pulses_per_kwh: u32,
    /// Load to emulate on this channel's input in simulation mode, in W.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulated_watts: Option<u32>,
}

fn default_pulses_per_kwh() -> u32 {
    DEFAULT_PULSES_PER_KWH
}

impl ChannelSettings {
    pub fn default_for(id: u8) -> Self {
        Self {
            enabled: false,
            name: format!("S0-{id}"),
            pin: 0,
            pulses_per_kwh: DEFAULT_PULSES_PER_KWH,
            simulated_watts: None,
        }
    }
}

/// Settings of every channel slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterConfig {
    #[serde(default)]
    pub channels: Vec<ChannelSettings>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            channels: (0..MAX_CHANNELS as u8)
                .map(ChannelSettings::default_for)
                .collect(),
        }
    }
}

impl MeterConfig {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: MeterConfig = toml::from_str(contents)?;
        Ok(config.normalized())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Pads missing slots with defaults and drops slots beyond
    /// [`MAX_CHANNELS`].
    pub fn normalized(mut self) -> Self {
        self.channels.truncate(MAX_CHANNELS);
        for id in self.channels.len()..MAX_CHANNELS {
            self.channels.push(ChannelSettings::default_for(id as u8));
        }
        self
    }

    pub fn channel(&self, id: u8) -> Option<&ChannelSettings> {
        self.channels.get(usize::from(id))
    }

    /// Checks that `candidate` for slot `id` does not share its pin with
    /// another enabled channel. A disabled candidate never conflicts.
    pub fn check_pin_conflict(&self, id: u8, candidate: &ChannelSettings) -> Result<(), ConfigError> {
        if !candidate.enabled {
            return Ok(());
        }
        let conflict = self
            .channels
            .iter()
            .enumerate()
            .find(|(index, other)| *index != usize::from(id) && other.enabled && other.pin == candidate.pin);

        match conflict {
            Some((other, _)) => Err(ConfigError::PinConflict {
                pin: candidate.pin,
                other: other as u8,
            }),
            None => Ok(()),
        }
    }
}

/// Partial channel update as submitted by a client.
///
/// Values arrive as raw strings; anything that is missing, unparsable or
/// out of range leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChannelUpdate {
    #[serde(rename = "isEnabled")]
    pub is_enabled: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "pinS0")]
    pub pin: Option<String>,
    #[serde(rename = "pulsesPerKWH")]
    pub pulses_per_kwh: Option<String>,
}

impl ChannelUpdate {
    /// Applies the update to `settings`. Returns true if anything changed.
    pub fn apply_to(&self, settings: &mut ChannelSettings) -> bool {
        let mut is_dirty = false;

        if let Some(value) = self.is_enabled.as_deref().filter(|v| !v.trim().is_empty()) {
            let enabled = leading_integer(value) != 0;
            if enabled != settings.enabled {
                settings.enabled = enabled;
                is_dirty = true;
            }
        }

        if let Some(name) = self.name.as_deref() {
            let name: String = truncate_name(name.trim());
            if name != settings.name {
                settings.name = name;
                is_dirty = true;
            }
        }

        if let Some(pin) = self.pin.as_deref().and_then(|v| v.trim().parse::<u8>().ok()) {
            if pin != settings.pin && (PIN_RANGE_MIN..=PIN_RANGE_MAX).contains(&pin) {
                settings.pin = pin;
                is_dirty = true;
            }
        }

        if let Some(pulses) = self
            .pulses_per_kwh
            .as_deref()
            .and_then(|v| v.trim().parse::<u32>().ok())
        {
            if pulses != settings.pulses_per_kwh
                && (PULSES_PER_KWH_RANGE_MIN..=PULSES_PER_KWH_RANGE_MAX).contains(&pulses)
            {
                settings.pulses_per_kwh = pulses;
                is_dirty = true;
            }
        }

        is_dirty
    }
}

/// Value of the leading decimal integer in `value`, 0 if there is none.
fn leading_integer(value: &str) -> i64 {
    let value = value.trim_start();
    let (sign, digits) = match value.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, value.strip_prefix('+').unwrap_or(value)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().map_or(0, |number| sign * number)
}

fn truncate_name(name: &str) -> String {
    let mut end = 0;
    for (index, c) in name.char_indices() {
        if index + c.len_utf8() > NAME_CAPACITY {
            break;
        }
        end = index + c.len_utf8();
    }
    name[..end].to_string()
}

/// Result of a settings update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Unchanged,
    Saved,
}

/// Channel settings backed by a TOML file.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: Mutex<MeterConfig>,
}

impl ConfigStore {
    /// Loads settings from `path`. Falls back to defaults if the file is
    /// missing or invalid.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let config = match fs::read_to_string(&path) {
            Ok(contents) => match MeterConfig::from_toml(&contents) {
                Ok(config) => {
                    info!("Loaded channel settings from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("{}, using default channel settings", e);
                    MeterConfig::default()
                }
            },
            Err(_) => {
                info!(
                    "No config file at {}, using default channel settings",
                    path.display()
                );
                MeterConfig::default()
            }
        };
        Self::with_config(path, config)
    }

    pub fn with_config<P: AsRef<Path>>(path: P, config: MeterConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            current: Mutex::new(config.normalized()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> MeterConfig {
        self.lock().clone()
    }

    pub fn channel(&self, id: u8) -> Option<ChannelSettings> {
        self.lock().channel(id).cloned()
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let contents = self.lock().to_toml()?;
        self.write(&contents)
    }

    /// Applies `update` to channel `id` and persists the result when
    /// something changed and the new settings are consistent.
    pub fn update_channel(&self, id: u8, update: &ChannelUpdate) -> Result<UpdateOutcome, ConfigError> {
        let contents = {
            let mut config = self.lock();
            let mut settings = config
                .channel(id)
                .cloned()
                .ok_or(ChannelError::UnknownChannel(id))?;

            if !update.apply_to(&mut settings) {
                return Ok(UpdateOutcome::Unchanged);
            }
            config.check_pin_conflict(id, &settings)?;
            config.channels[usize::from(id)] = settings;
            config.to_toml()?
        };

        self.write(&contents)?;
        info!("Channel {} settings updated, restart to apply", id);
        Ok(UpdateOutcome::Saved)
    }

    fn write(&self, contents: &str) -> Result<(), ConfigError> {
        fs::write(&self.path, contents).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MeterConfig> {
        // A panic while holding the lock cannot leave the config half-written.
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Process options read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub config_path: PathBuf,
    pub http_listen: SocketAddr,
    pub poll_interval: Duration,
    pub sample_interval: Duration,
    pub simulate: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("s0-config.toml"),
            http_listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            poll_interval: Duration::from_millis(100),
            sample_interval: Duration::from_millis(1),
            simulate: false,
        }
    }
}

impl RuntimeSettings {
    /// Reads `S0_CONFIG`, `HTTP_LISTEN`, `POLL_INTERVAL_MS`,
    /// `SAMPLE_INTERVAL_MS` and `S0_SIMULATE`. Unset variables keep their
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Ok(path) = env::var("S0_CONFIG") {
            settings.config_path = PathBuf::from(path);
        }
        if let Ok(addr) = env::var("HTTP_LISTEN") {
            settings.http_listen = addr.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "HTTP_LISTEN",
                value: addr.clone(),
            })?;
        }
        if let Some(interval) = parse_millis("POLL_INTERVAL_MS")? {
            settings.poll_interval = interval;
        }
        if let Some(interval) = parse_millis("SAMPLE_INTERVAL_MS")? {
            settings.sample_interval = interval;
        }
        settings.simulate = parse_bool_safe(env::var("S0_SIMULATE").ok());

        info!("Runtime settings:");
        info!("  Config file: {}", settings.config_path.display());
        info!("  HTTP listen: {}", settings.http_listen);
        info!("  Poll interval: {:?}", settings.poll_interval);
        info!("  Sample interval: {:?}", settings.sample_interval);
        info!("  Simulation: {}", settings.simulate);

        Ok(settings)
    }
}

fn parse_millis(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(Some(Duration::from_millis(ms))),
            _ => Err(ConfigError::InvalidEnv { key, value }),
        },
        Err(_) => Ok(None),
    }
}

/// Safely parses a boolean from an optional string, defaulting to false
fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}
