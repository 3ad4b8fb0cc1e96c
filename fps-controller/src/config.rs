//! # config
//!
//! The single configuration mapping read at startup.
//!
//! Sources, in order of precedence: an explicit path handed to
//! [`FpsConfig::load`], the `FPS_CONFIG` environment variable, or the
//! built-in defaults. The active profile can be overridden with
//! `FPS_PROFILE`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FpsError, Result};

/// Beta limit applied when `safe_mode = true` without an explicit angle.
pub const DEFAULT_MIN_BETA: f64 = 160.0;

// ── Profiles ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// ASCII-framed TCP gateway (`CAN n INIT STD …` / `M n CED …`).
    Cannet,
    /// In-process bus for tests and the simulator.
    Virtual,
}

/// One bus profile: a transport implementation plus its channel addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub channel_type: ChannelType,
    /// Channel addresses. For `cannet` these are `host:port` endpoints;
    /// for `virtual` they are ignored beyond their count.
    pub channels: Vec<String>,
    /// CAN bitrate in bit/s, `cannet` only.
    #[serde(default)]
    pub bitrate: Option<u32>,
    /// Gateway CAN channel number (1-based), `cannet` only.
    #[serde(default = "default_gateway_channel")]
    pub gateway_channel: u8,
}

fn default_gateway_channel() -> u8 {
    1
}

// ── Positioner hardware constants ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionerConfig {
    /// Motor steps per full revolution of the axis output. Protocol-fixed
    /// quantities (trajectory points, goto targets) are converted with
    /// this; it is never hard-coded anywhere else.
    pub motor_steps: u32,
    /// Default (alpha, beta) motor speed in RPM, applied at initialise.
    pub motor_speed: (u32, u32),
    /// Gear reduction between motor and axis output, used to estimate
    /// travel times for goto timeouts.
    pub reduction_ratio: f64,
}

impl Default for PositionerConfig {
    fn default() -> Self {
        Self {
            motor_steps: 1_968_000,
            motor_speed: (2000, 2000),
            reduction_ratio: 1024.0,
        }
    }
}

// ── Controller timings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FpsTimings {
    /// Seconds to wait for GET_ID replies during discovery.
    pub initialise_timeouts: f64,
    /// Seconds between status poller ticks.
    pub status_poller_delay: f64,
    /// Seconds between position poller ticks.
    pub position_poller_delay: f64,
}

impl Default for FpsTimings {
    fn default() -> Self {
        Self {
            initialise_timeouts: 0.5,
            status_poller_delay: 5.0,
            position_poller_delay: 5.0,
        }
    }
}

// ── Safe mode ─────────────────────────────────────────────────────────────────

/// Beta-axis protection. `true` applies [`DEFAULT_MIN_BETA`]; a table with
/// `min_beta` sets an explicit limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "SafeModeRepr", into = "SafeModeRepr")]
pub enum SafeMode {
    Off,
    On { min_beta: f64 },
}

impl SafeMode {
    /// The active beta floor, if safe mode is on.
    pub fn min_beta(&self) -> Option<f64> {
        match self {
            Self::Off => None,
            Self::On { min_beta } => Some(*min_beta),
        }
    }
}

impl Default for SafeMode {
    fn default() -> Self {
        Self::Off
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SafeModeRepr {
    Flag(bool),
    MinBeta { min_beta: f64 },
}

impl From<SafeModeRepr> for SafeMode {
    fn from(repr: SafeModeRepr) -> Self {
        match repr {
            SafeModeRepr::Flag(false) => Self::Off,
            SafeModeRepr::Flag(true) => Self::On { min_beta: DEFAULT_MIN_BETA },
            SafeModeRepr::MinBeta { min_beta } => Self::On { min_beta },
        }
    }
}

impl From<SafeMode> for SafeModeRepr {
    fn from(mode: SafeMode) -> Self {
        match mode {
            SafeMode::Off => Self::Flag(false),
            SafeMode::On { min_beta } => Self::MinBeta { min_beta },
        }
    }
}

// ── Array geometry ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KaijuConfig {
    /// Default fold angles `(alpha, beta)`; `is_folded` compares against
    /// these.
    pub lattice_position: (f64, f64),
}

impl Default for KaijuConfig {
    fn default() -> Self {
        Self { lattice_position: (0.0, 180.0) }
    }
}

// ── Top-level config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FpsConfig {
    /// Name of the profile to use. Overridable with `FPS_PROFILE`.
    pub profile: Option<String>,
    pub profiles: HashMap<String, ProfileConfig>,
    pub positioner: PositionerConfig,
    pub fps: FpsTimings,
    pub safe_mode: SafeMode,
    pub kaiju: KaijuConfig,
}

impl FpsConfig {
    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FpsError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| FpsError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Load from `FPS_CONFIG` if set, otherwise return the defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var("FPS_CONFIG") {
            Ok(path) => Self::load(path),
            Err(_) => Ok(Self::default()),
        }
    }

    /// The profile selected by `FPS_PROFILE`, the `profile` key, or the
    /// single defined profile.
    pub fn active_profile(&self) -> Result<(&str, &ProfileConfig)> {
        let name = std::env::var("FPS_PROFILE").ok();
        let name = name
            .as_deref()
            .or(self.profile.as_deref())
            .or_else(|| (self.profiles.len() == 1).then(|| self.profiles.keys().next().map(String::as_str)).flatten());

        let name = name.ok_or_else(|| {
            FpsError::Config("no profile selected and more than one defined".into())
        })?;
        let (stored_name, profile) = self
            .profiles
            .get_key_value(name)
            .ok_or_else(|| FpsError::Config(format!("profile {name:?} is not defined")))?;
        Ok((stored_name.as_str(), profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_mapping() {
        let cfg: FpsConfig = toml::from_str(
            r#"
            profile = "lab"
            safe_mode = { min_beta = 170.0 }

            [profiles.lab]
            channel_type = "cannet"
            channels = ["10.1.10.110:19228"]
            bitrate = 1000000

            [positioner]
            motor_steps = 1968000
            motor_speed = [2000, 2000]
            reduction_ratio = 1024.0

            [fps]
            initialise_timeouts = 0.5
            status_poller_delay = 5.0
            position_poller_delay = 5.0

            [kaiju]
            lattice_position = [0.0, 180.0]
            "#,
        )
        .unwrap();

        let (name, profile) = cfg.active_profile().unwrap();
        assert_eq!(name, "lab");
        assert_eq!(profile.channel_type, ChannelType::Cannet);
        assert_eq!(profile.gateway_channel, 1);
        assert_eq!(cfg.safe_mode.min_beta(), Some(170.0));
    }

    #[test]
    fn safe_mode_accepts_bool_or_table() {
        let cfg: FpsConfig = toml::from_str("safe_mode = true").unwrap();
        assert_eq!(cfg.safe_mode.min_beta(), Some(DEFAULT_MIN_BETA));

        let cfg: FpsConfig = toml::from_str("safe_mode = false").unwrap();
        assert_eq!(cfg.safe_mode.min_beta(), None);

        let cfg: FpsConfig = toml::from_str("safe_mode = { min_beta = 170.0 }").unwrap();
        assert_eq!(cfg.safe_mode.min_beta(), Some(170.0));
    }

    #[test]
    fn defaults_are_usable() {
        let cfg = FpsConfig::default();
        assert_eq!(cfg.positioner.motor_speed, (2000, 2000));
        assert_eq!(cfg.kaiju.lattice_position, (0.0, 180.0));
        assert!(cfg.profiles.is_empty());
    }
}
