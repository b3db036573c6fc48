// MIT License - Copyright (c) 2021 TJForc

use std::collections::BTreeMap;

use bitflags::bitflags;
use chrono::{DateTime, NaiveDateTime, Utc};

bitflags! {
    /// System flags byte of the A5/04 status message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SystemFlags: u8 {
        const READY          = 0x01;
        const ALERT_IN_MEMORY = 0x02;
        const TROUBLE        = 0x04;
        const BYPASS_ON      = 0x08;
        /// Last 10 seconds of an entry/exit delay
        const LAST_10_SECS   = 0x10;
        /// d2/d3 carry a zone event
        const ZONE_EVENT     = 0x20;
        const STATUS_CHANGED = 0x40;
        const ALARM_EVENT    = 0x80;
    }
}

impl SystemFlags {
    /// Get the flags that changed between old and new status.
    pub fn changed(old: Self, new: Self) -> Self {
        old ^ new
    }

    /// Flags that only describe the current message, not persistent state.
    pub fn transient() -> Self {
        Self::ZONE_EVENT | Self::STATUS_CHANGED | Self::ALARM_EVENT
    }

    /// Get human-readable event names for flags that became set.
    pub fn set_event_names(changed: Self, new: Self) -> Vec<&'static str> {
        let became_set = changed & new;
        let mut events = Vec::new();
        if became_set.contains(Self::READY) { events.push("Ready"); }
        if became_set.contains(Self::ALERT_IN_MEMORY) { events.push("AlertInMemory"); }
        if became_set.contains(Self::TROUBLE) { events.push("Trouble"); }
        if became_set.contains(Self::BYPASS_ON) { events.push("BypassOn"); }
        if became_set.contains(Self::LAST_10_SECS) { events.push("Last10Seconds"); }
        events
    }

    /// Get human-readable event names for flags that became unset.
    pub fn unset_event_names(changed: Self, new: Self) -> Vec<&'static str> {
        let became_unset = changed & !new;
        let mut events = Vec::new();
        if became_unset.contains(Self::READY) { events.push("NotReady"); }
        if became_unset.contains(Self::ALERT_IN_MEMORY) { events.push("AlertCleared"); }
        if became_unset.contains(Self::TROUBLE) { events.push("TroubleOk"); }
        if became_unset.contains(Self::BYPASS_ON) { events.push("BypassOff"); }
        events
    }
}

/// Logical arm state derived from the raw system status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArmState {
    Disarmed,
    ArmingHome,
    ArmingAway,
    EntryDelay,
    ArmedHome,
    ArmedAway,
    /// User test, programming or installer mode
    Special,
    Downloading,
}

impl ArmState {
    /// Several raw codes alias the same logical state.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 | 0x11 => Self::ArmingHome,
            0x02 | 0x12 => Self::ArmingAway,
            0x03 => Self::EntryDelay,
            0x04 | 0x0A | 0x13 | 0x14 => Self::ArmedHome,
            0x05 | 0x0B | 0x15 => Self::ArmedAway,
            0x06 | 0x08 | 0x09 => Self::Special,
            0x07 => Self::Downloading,
            _ => Self::Disarmed,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disarmed => "Disarmed",
            Self::ArmingHome => "Arming Home",
            Self::ArmingAway => "Arming Away",
            Self::EntryDelay => "Entry Delay",
            Self::ArmedHome => "Armed Home",
            Self::ArmedAway => "Armed Away",
            Self::Special => "Special",
            Self::Downloading => "Downloading",
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self, Self::ArmedHome | Self::ArmedAway | Self::EntryDelay)
    }
}

/// Panel-wide identity and status.
#[derive(Debug, Clone)]
pub struct PanelStatus {
    pub arm_state: ArmState,
    pub status_code: u8,
    pub flags: SystemFlags,
    pub first_status: bool,
    /// Set while a siren-triggering alarm is active
    pub siren_active: Option<DateTime<Utc>>,
    pub tamper_active: bool,
    pub last_trouble: Option<&'static str>,
    pub panel_type: Option<u8>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub eprom_version: Option<String>,
    pub software_version: Option<String>,
    /// Decoded EPROM settings by field name
    pub settings: BTreeMap<String, String>,
    /// Master user code recovered from the EPROM
    pub master_pin: Option<String>,
    pub keypads_1way: usize,
    pub keypads_2way: usize,
    pub sirens: usize,
    pub panel_time: Option<NaiveDateTime>,
}

impl Default for PanelStatus {
    fn default() -> Self {
        Self {
            arm_state: ArmState::Disarmed,
            status_code: 0,
            flags: SystemFlags::empty(),
            first_status: true,
            siren_active: None,
            tamper_active: false,
            last_trouble: None,
            panel_type: None,
            model: None,
            serial: None,
            eprom_version: None,
            software_version: None,
            settings: BTreeMap::new(),
            master_pin: None,
            keypads_1way: 0,
            keypads_2way: 0,
            sirens: 0,
            panel_time: None,
        }
    }
}

impl PanelStatus {
    /// Apply an A5/04 status. Returns the changed persistent flags and
    /// whether the arm state changed.
    pub fn update_status(&mut self, code: u8, flags: SystemFlags) -> (SystemFlags, bool) {
        let flags = flags - SystemFlags::transient();
        let changed = SystemFlags::changed(self.flags, flags);
        let new_state = ArmState::from_code(code);
        let state_changed = new_state != self.arm_state;
        self.status_code = code;
        self.arm_state = new_state;
        self.flags = flags;
        if self.first_status {
            self.first_status = false;
            return (SystemFlags::empty(), false);
        }
        (changed, state_changed)
    }

    pub fn has_pin(&self) -> bool {
        self.master_pin.is_some()
    }

    pub fn is_ready(&self) -> bool { self.flags.contains(SystemFlags::READY) }
    pub fn is_trouble(&self) -> bool { self.flags.contains(SystemFlags::TROUBLE) }
    pub fn is_siren_active(&self) -> bool { self.siren_active.is_some() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_state_aliases() {
        for code in [0x04, 0x0A, 0x13, 0x14] {
            assert_eq!(ArmState::from_code(code), ArmState::ArmedHome);
        }
        for code in [0x05, 0x0B, 0x15] {
            assert_eq!(ArmState::from_code(code), ArmState::ArmedAway);
        }
        assert_eq!(ArmState::from_code(0x03), ArmState::EntryDelay);
        assert_eq!(ArmState::from_code(0x07), ArmState::Downloading);
        assert_eq!(ArmState::from_code(0x08), ArmState::Special);
        assert_eq!(ArmState::from_code(0x00), ArmState::Disarmed);
        assert_eq!(ArmState::from_code(0x42), ArmState::Disarmed);
    }

    #[test]
    fn test_update_status() {
        let mut status = PanelStatus::default();
        // First status seeds silently
        let (changed, state_changed) = status.update_status(0x00, SystemFlags::READY);
        assert!(changed.is_empty());
        assert!(!state_changed);
        assert!(status.is_ready());

        let (changed, state_changed) =
            status.update_status(0x05, SystemFlags::STATUS_CHANGED | SystemFlags::ZONE_EVENT);
        assert_eq!(changed, SystemFlags::READY);
        assert!(state_changed);
        assert_eq!(status.arm_state, ArmState::ArmedAway);
        // Transient bits are not stored
        assert!(status.flags.is_empty());
    }

    #[test]
    fn test_event_names() {
        let old = SystemFlags::READY;
        let new = SystemFlags::TROUBLE;
        let changed = SystemFlags::changed(old, new);
        assert_eq!(SystemFlags::set_event_names(changed, new), vec!["Trouble"]);
        assert_eq!(SystemFlags::unset_event_names(changed, new), vec!["NotReady"]);
    }
}
