// MIT License - Copyright (c) 2021 TJForc

use std::collections::HashMap;
use std::time::Duration;

use crate::devices::sensor::SensorType;
use crate::error::{Result, VisonicError};
use crate::protocol::encode_code;

/// Arm mode for (dis)arming commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmMode {
    Disarm,
    /// Partial/home arm
    Home,
    /// Full/away arm
    Away,
    HomeInstant,
    AwayInstant,
}

impl ArmMode {
    /// Byte patched into the Arm command template.
    pub fn code(&self) -> u8 {
        match self {
            Self::Disarm => 0x00,
            Self::Home => 0x04,
            Self::Away => 0x05,
            Self::HomeInstant => 0x14,
            Self::AwayInstant => 0x15,
        }
    }
}

/// Protocol timers and thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingConfig {
    /// How long an expected reply may be outstanding before one resend
    pub response_timeout: Duration,
    /// Time allowed for the whole EPROM download
    pub download_timeout: Duration,
    /// Total short-block re-requests allowed during one download
    pub download_retry_limit: u32,
    pub watchdog_timeout: Duration,
    /// Watchdog timeouts tolerated within 24h before giving up on Powerlink
    pub watchdog_max_events: u32,
    /// Enrollment retry period while Powerlink is pending
    pub powerlink_retry_delay: Duration,
    pub crc_error_limit: u32,
    pub crc_error_window: Duration,
    /// Silence allowed after start before the connection is suspended
    pub no_data_at_start: Duration,
    /// Silence allowed once data has been seen
    pub no_data_idle: Duration,
    /// Idle period after which a STATUS poll is sent
    pub keep_alive_period: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(100),
            download_timeout: Duration::from_secs(180),
            download_retry_limit: 30,
            watchdog_timeout: Duration::from_secs(120),
            watchdog_max_events: 10,
            powerlink_retry_delay: Duration::from_secs(180),
            crc_error_limit: 5,
            crc_error_window: Duration::from_secs(600),
            no_data_at_start: Duration::from_secs(60),
            no_data_idle: Duration::from_secs(600),
            keep_alive_period: Duration::from_secs(25),
        }
    }
}

impl TimingConfig {
    /// Overall enrollment deadline: 4.5 retry periods.
    pub fn powerlink_timeout(&self) -> Duration {
        self.powerlink_retry_delay * 9 / 2
    }
}

/// Configuration for a Visonic panel connection.
#[derive(Debug, Clone)]
pub struct PanelConfig {
    /// Code used for EPROM download and enrollment (4 hex digits, default 5650)
    pub download_code: String,
    /// Never attempt download or Powerlink
    pub force_standard: bool,
    /// Attempt auto-enroll on access denied even if the panel type is not known to support it
    pub force_auto_enroll: bool,
    /// Correct the panel clock when it drifts
    pub auto_sync_time: bool,
    /// Send the Init command before downloading
    pub send_init: bool,
    /// How long a motion sensor stays triggered
    pub motion_off_delay: Duration,
    /// Alarm types (lowercase) that mark the siren as active
    pub siren_trigger_list: Vec<String>,
    /// Informational only; text tables are English
    pub language: String,
    /// Vendor sensor code overrides applied on top of the built-in catalog
    pub sensor_overrides: HashMap<u8, SensorType>,
    pub timing: TimingConfig,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            download_code: "5650".to_string(),
            force_standard: false,
            force_auto_enroll: false,
            auto_sync_time: true,
            send_init: true,
            motion_off_delay: Duration::from_secs(120),
            siren_trigger_list: vec!["intruder".to_string()],
            language: "EN".to_string(),
            sensor_overrides: HashMap::new(),
            timing: TimingConfig::default(),
        }
    }
}

impl PanelConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> PanelConfigBuilder {
        PanelConfigBuilder::default()
    }

    /// Check values that the panel would otherwise reject at runtime.
    pub fn validate(&self) -> Result<()> {
        encode_code(&self.download_code).map_err(|_| VisonicError::InvalidConfig {
            details: format!("download code must be 4 hex digits, got {:?}", self.download_code),
        })?;
        if self.timing.crc_error_limit == 0 {
            return Err(VisonicError::InvalidConfig {
                details: "crc_error_limit must be at least 1".into(),
            });
        }
        if self.timing.watchdog_max_events == 0 {
            return Err(VisonicError::InvalidConfig {
                details: "watchdog_max_events must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Apply a runtime update. Returns true if `force_standard` was switched on.
    pub fn apply(&mut self, update: ConfigUpdate) -> Result<bool> {
        if let Some(code) = update.download_code {
            encode_code(&code)?;
            self.download_code = code;
        }
        if let Some(language) = update.language {
            self.language = language;
        }
        if let Some(delay) = update.motion_off_delay {
            self.motion_off_delay = delay;
        }
        if let Some(auto_sync) = update.auto_sync_time {
            self.auto_sync_time = auto_sync;
        }
        if let Some(list) = update.siren_trigger_list {
            self.siren_trigger_list = list.into_iter().map(|s| s.to_lowercase()).collect();
        }
        let mut forced = false;
        if let Some(force) = update.force_standard {
            forced = force && !self.force_standard;
            self.force_standard = force;
        }
        Ok(forced)
    }
}

/// Runtime configuration changes. `None` leaves the current value.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub download_code: Option<String>,
    pub language: Option<String>,
    pub motion_off_delay: Option<Duration>,
    pub force_standard: Option<bool>,
    pub auto_sync_time: Option<bool>,
    pub siren_trigger_list: Option<Vec<String>>,
}

/// Builder for PanelConfig.
#[derive(Debug, Clone, Default)]
pub struct PanelConfigBuilder {
    config: PanelConfig,
}

impl PanelConfigBuilder {
    pub fn download_code(mut self, code: impl Into<String>) -> Self {
        self.config.download_code = code.into();
        self
    }

    pub fn force_standard(mut self, force: bool) -> Self {
        self.config.force_standard = force;
        self
    }

    pub fn force_auto_enroll(mut self, force: bool) -> Self {
        self.config.force_auto_enroll = force;
        self
    }

    pub fn auto_sync_time(mut self, sync: bool) -> Self {
        self.config.auto_sync_time = sync;
        self
    }

    pub fn send_init(mut self, send: bool) -> Self {
        self.config.send_init = send;
        self
    }

    pub fn motion_off_delay(mut self, delay: Duration) -> Self {
        self.config.motion_off_delay = delay;
        self
    }

    pub fn siren_trigger_list<I, S>(mut self, list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.siren_trigger_list = list.into_iter().map(|s| s.into().to_lowercase()).collect();
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.config.language = language.into();
        self
    }

    pub fn sensor_override(mut self, code: u8, sensor_type: SensorType) -> Self {
        self.config.sensor_overrides.insert(code, sensor_type);
        self
    }

    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.config.timing = timing;
        self
    }

    pub fn build(self) -> PanelConfig {
        self.config
    }
}
