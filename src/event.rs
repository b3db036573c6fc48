// MIT License - Copyright (c) 2021 TJForc

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::devices::sensor::SensorStatusFlags;
use crate::mode::Mode;

/// Kinds of panel condition reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    WatchdogTimeoutRetrying,
    WatchdogTimeoutGivingUp,
    DownloadSuccess,
    DownloadTimeout,
    /// Panel asked us to retry the download later
    DownloadRetry,
    PinRejected,
    CommandRejected,
    Tamper,
    AlarmActive,
    AlarmCancelled,
    PanelReset,
    PanelTrouble,
    NoDataFromPanel,
    CrcErrorsExceeded,
    CommandNoResponse,
    EnrollmentFailed,
}

impl ConditionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WatchdogTimeoutRetrying => "WATCHDOG_TIMEOUT_RETRYING",
            Self::WatchdogTimeoutGivingUp => "WATCHDOG_TIMEOUT_GIVINGUP",
            Self::DownloadSuccess => "DOWNLOAD_SUCCESS",
            Self::DownloadTimeout => "DOWNLOAD_TIMEOUT",
            Self::DownloadRetry => "DOWNLOAD_RETRY",
            Self::PinRejected => "PIN_REJECTED",
            Self::CommandRejected => "COMMAND_REJECTED",
            Self::Tamper => "TAMPER",
            Self::AlarmActive => "ALARM_ACTIVE",
            Self::AlarmCancelled => "ALARM_CANCELLED",
            Self::PanelReset => "PANEL_RESET",
            Self::PanelTrouble => "PANEL_TROUBLE",
            Self::NoDataFromPanel => "NO_DATA_FROM_PANEL",
            Self::CrcErrorsExceeded => "CRC_ERRORS_EXCEEDED",
            Self::CommandNoResponse => "COMMAND_NO_RESPONSE",
            Self::EnrollmentFailed => "ENROLLMENT_FAILED",
        }
    }
}

/// A condition with its small structured payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelCondition {
    pub kind: ConditionKind,
    /// 1-based zone number the condition refers to, if any
    pub zone: Option<u32>,
    /// Raw event or mode code
    pub code: u8,
    pub timestamp: DateTime<Utc>,
}

impl PanelCondition {
    pub fn new(kind: ConditionKind) -> Self {
        Self { kind, zone: None, code: 0, timestamp: Utc::now() }
    }

    pub fn with_zone(mut self, zone: u32) -> Self {
        self.zone = Some(zone);
        self
    }

    pub fn with_code(mut self, code: u8) -> Self {
        self.code = code;
        self
    }
}

/// One panel event log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogEntry {
    pub index: u8,
    pub total: u8,
    /// `None` when the panel sent an impossible date
    pub timestamp: Option<NaiveDateTime>,
    pub zone: u8,
    pub event_code: u8,
    pub event_name: &'static str,
    pub partition: u8,
}

/// All events that can be emitted by the panel.
///
/// Users subscribe via `panel.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<PanelEvent>`.
#[derive(Debug, Clone)]
pub enum PanelEvent {
    Condition(PanelCondition),
    ModeChanged {
        old: Mode,
        new: Mode,
    },
    /// Push-change: panel or sensor state changed while handling one message
    StatusUpdated,
    SensorChanged {
        id: u32,
        old_status: SensorStatusFlags,
        new_status: SensorStatusFlags,
        changed: SensorStatusFlags,
    },
    NewSensor {
        id: u32,
    },
    SensorRemoved {
        id: u32,
    },
    NewSwitch {
        id: u32,
    },
    SwitchChanged {
        id: u32,
        state: bool,
    },
    EventLog(EventLogEntry),
    /// All processing stopped (fatal condition or shutdown)
    Suspended,
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<PanelEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<PanelEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
