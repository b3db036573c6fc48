// MIT License - Copyright (c) 2021 TJForc

//! Handlers for decoded panel messages.
//!
//! Each handler updates engine state and returns true when panel or sensor
//! state visibly changed; the caller turns that into a single
//! `StatusUpdated` per message.

use std::time::{Duration, Instant};

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike, Utc};
use tracing::{debug, info, trace, warn};

use crate::comm::PanelComm;
use crate::constants::{
    alarm_type, log_event_name, panel_capabilities, trouble_type, zone_name, ZoneChime, ZoneType,
    AUTO_ENROLL_MIN_PANEL_TYPE, PANEL_RESET_CODE, SIREN_CANCEL_CODES, SIREN_IGNORE_CODES, TAMPER_CODES,
    TAMPER_RESTORE_CODES, TIME_SYNC_TOLERANCE_SECS,
};
use crate::devices::sensor::{SensorCatalog, SensorStatusFlags};
use crate::devices::system::SystemFlags;
use crate::eprom::{download_ranges, plan_blocks, SWITCH_COUNT};
use crate::event::{ConditionKind, EventLogEntry, PanelCondition, PanelEvent};
use crate::mode::Mode;
use crate::protocol::{
    Command, CommandBuilder, EventLogRecord, PanelMessage, PowerlinkMessage, StatusMessage,
};
use crate::transport::ByteSink;

/// Zone event codes carried in the A5/04 system status.
mod zone_event {
    pub const TAMPER_ALARM: u8 = 1;
    pub const TAMPER_RESTORE: u8 = 2;
    pub const OPEN: u8 = 3;
    pub const CLOSED: u8 = 4;
    pub const VIOLATED: u8 = 5;
    pub const TAMPER_OPEN: u8 = 8;
    pub const LOW_BATTERY: u8 = 13;
    pub const BATTERY_RESTORE: u8 = 14;
}

fn bit(bitmap: u32, id: u32) -> bool {
    id < 32 && bitmap & (1 << id) != 0
}

impl<S: ByteSink> PanelComm<S> {
    pub(crate) fn dispatch(&mut self, msg: PanelMessage, now: Instant) -> bool {
        match msg {
            PanelMessage::Ack => false,
            PanelMessage::Timeout => self.on_timeout(now),
            PanelMessage::AccessDenied => self.on_access_denied(now),
            PanelMessage::Stop => self.on_stop(now),
            PanelMessage::Exit => {
                debug!("Panel left download mode");
                false
            }
            PanelMessage::LegacyPanelInfo { payload } => {
                warn!("Panel uses an unsupported legacy protocol: {:02X?}", payload);
                false
            }
            PanelMessage::PanelInfo { model, panel_type } => self.on_panel_info(model, panel_type, now),
            PanelMessage::DownloadRetry { delay_secs } => self.on_download_retry(delay_secs, now),
            PanelMessage::SettingsBlock { index, page, data } => {
                trace!("Settings block {:02X}{:02X} ({} bytes)", page, index, data.len());
                self.eprom.write(page, index, &data);
                false
            }
            PanelMessage::DownloadBlock { index, page, length, data } => {
                self.on_download_block(page, index, length, &data, now)
            }
            PanelMessage::EventLog(record) => self.on_event_log(record),
            PanelMessage::ZoneNames { page, codes } => self.on_zone_names(page, codes),
            PanelMessage::ZoneTypes { page, codes } => self.on_zone_types(page, codes),
            PanelMessage::X10Names { page, codes } => self.on_x10_names(page, codes),
            PanelMessage::Status(status) => self.on_status(status, now),
            PanelMessage::PanelStatusChange { events } => self.on_status_change(&events),
            PanelMessage::Powerlink(pl) => self.on_powerlink(pl, now),
            PanelMessage::Image { payload } => {
                debug!("Ignoring {} bytes of image data", payload.len());
                false
            }
            PanelMessage::PowerMaster { command, subtype, data } => {
                debug!("PowerMaster message {:02X}/{:02X}: {:02X?}", command, subtype, data);
                false
            }
            PanelMessage::Noise => false,
            PanelMessage::Unknown { msg_type, payload } => {
                debug!("Unhandled message type {:02X}: {:02X?}", msg_type, payload);
                false
            }
        }
    }

    fn on_timeout(&mut self, now: Instant) -> bool {
        if self.mode.current() == Mode::Download && self.download.current.is_some() {
            warn!("Panel timed out during download, re-requesting block");
            self.queue.abandon();
            self.rerequest_block();
            self.request_next_block(now);
        } else {
            debug!("Panel reported a timeout");
        }
        false
    }

    fn on_access_denied(&mut self, now: Instant) -> bool {
        self.queue.abandon();
        match self.last_sent {
            Some(Command::Download | Command::DownloadBlock) => {
                let capable = self.config.force_auto_enroll
                    || self.status.panel_type.is_some_and(|t| t >= AUTO_ENROLL_MIN_PANEL_TYPE);
                if self.mode.current() == Mode::Download && capable && !self.enrollment.auto_enroll_done {
                    info!("Download refused, attempting auto-enroll");
                    self.send_enroll(now);
                    self.request_download();
                } else {
                    warn!("Download code rejected by panel");
                    self.emit_condition(PanelCondition::new(ConditionKind::CommandRejected));
                    self.fallback_to_standard(now);
                }
            }
            Some(Command::Arm | Command::BypassEnable | Command::BypassDisable | Command::EventLog) => {
                warn!("PIN rejected by panel");
                self.emit_condition(PanelCondition::new(ConditionKind::PinRejected));
            }
            Some(other) => {
                warn!("Panel refused {:?}", other);
                self.emit_condition(PanelCondition::new(ConditionKind::CommandRejected));
            }
            None => debug!("Access denied before any command was sent"),
        }
        false
    }

    fn on_stop(&mut self, now: Instant) -> bool {
        if self.mode.current() == Mode::Download && self.download.complete {
            self.enter_pending(now);
        } else {
            debug!("Panel sent STOP");
        }
        false
    }

    fn on_panel_info(&mut self, model: u8, panel_type: u8, now: Instant) -> bool {
        let Some(caps) = panel_capabilities(panel_type) else {
            warn!("Unknown panel type {} (model {})", panel_type, model);
            if self.mode.current() == Mode::Download {
                self.fallback_to_standard(now);
            }
            return false;
        };
        info!("Panel is a {} (type {}, model {})", caps.model, panel_type, model);
        self.caps = Some(caps);
        self.status.panel_type = Some(panel_type);
        self.status.model = Some(caps.model.to_string());
        self.catalog = SensorCatalog::for_panel(caps.powermaster).with_overrides(&self.config.sensor_overrides);

        if self.mode.current() == Mode::Download && !self.download.complete {
            self.download.blocks = plan_blocks(&download_ranges(caps)).into();
            self.download.current = None;
            debug!("Requesting {} EPROM blocks", self.download.blocks.len());
            self.request_next_block(now);
        }
        true
    }

    fn on_download_retry(&mut self, delay_secs: u8, now: Instant) -> bool {
        info!("Panel busy, retrying download in {}s", delay_secs);
        self.emit_condition(PanelCondition::new(ConditionKind::DownloadRetry).with_code(delay_secs));
        if self.mode.current() == Mode::Download {
            self.queue.abandon();
            self.download.retry_at = Some(now + Duration::from_secs(u64::from(delay_secs)));
        }
        false
    }

    fn on_download_block(&mut self, page: u8, index: u8, length: u8, data: &[u8], now: Instant) -> bool {
        trace!("Block {:02X}{:02X}: {} of {} bytes", page, index, data.len(), length);
        self.eprom.write(page, index, data);
        if self.mode.current() != Mode::Download || self.download.complete {
            return false;
        }
        let expected = self.download.current;
        match expected {
            Some(block) if block.page == page && block.index == index => {
                if data.len() < block.len as usize {
                    if self.download.retries < self.config.timing.download_retry_limit {
                        warn!("Short block {:04X}: {} of {} bytes", block.address(), data.len(), block.len);
                        self.download.retries += 1;
                        self.rerequest_block();
                    } else {
                        warn!("Short block {:04X}, retry budget spent", block.address());
                        self.download.current = None;
                    }
                } else {
                    self.download.current = None;
                }
            }
            Some(block) => {
                debug!("Unexpected block {:02X}{:02X}, still waiting for {:04X}", page, index, block.address());
                self.rerequest_block();
            }
            None => {}
        }
        self.request_next_block(now);
        false
    }

    fn on_event_log(&mut self, record: EventLogRecord) -> bool {
        if record.index == 1 || self.event_log_total == 0 {
            self.event_log_total = record.total;
        }
        let timestamp = NaiveDate::from_ymd_opt(
            2000 + i32::from(record.year),
            u32::from(record.month),
            u32::from(record.day),
        )
        .and_then(|d| {
            d.and_hms_opt(u32::from(record.hour), u32::from(record.minute), u32::from(record.second))
        });
        let partition = record
            .zone
            .checked_sub(1)
            .and_then(|id| self.sensors.get(&u32::from(id)))
            .and_then(|s| s.partitions.first().copied())
            .unwrap_or(1);
        let entry = EventLogEntry {
            index: record.index,
            total: self.event_log_total,
            timestamp,
            zone: record.zone,
            event_code: record.event_code,
            event_name: log_event_name(record.event_code),
            partition,
        };
        debug!("Event log {}/{}: {}", entry.index, entry.total, entry.event_name);
        self.emit(PanelEvent::EventLog(entry));
        false
    }

    fn zone_limit(&self) -> u32 {
        self.caps.map_or(30, |c| u32::from(c.zones))
    }

    fn on_zone_names(&mut self, page: u8, codes: [u8; 8]) -> bool {
        let base = u32::from(page.saturating_sub(1)) * 8;
        let limit = self.zone_limit();
        for (i, code) in codes.iter().enumerate() {
            let id = base + i as u32;
            if id >= limit {
                break;
            }
            let label = zone_name(*code).to_string();
            if let Some(sensor) = self.sensors.get_mut(&id) {
                sensor.zone_name = label.clone();
            }
            self.zone_labels.insert(id, label);
        }
        false
    }

    fn on_zone_types(&mut self, page: u8, codes: [u8; 8]) -> bool {
        let base = u32::from(page.saturating_sub(1)) * 8;
        let limit = self.zone_limit();
        for (i, code) in codes.iter().enumerate() {
            let id = base + i as u32;
            if id >= limit {
                break;
            }
            let info = code.wrapping_sub(0x1E);
            let zone_type = ZoneType::from_u8(info);
            let chime = ZoneChime::from_u8(info >> 4);
            if let Some(sensor) = self.sensors.get_mut(&id) {
                sensor.zone_type = zone_type;
                sensor.chime = chime;
            }
            self.zone_types.insert(id, (zone_type, chime));
        }
        false
    }

    fn on_x10_names(&mut self, page: u8, codes: [u8; 8]) -> bool {
        let base = u32::from(page.saturating_sub(1)) * 8;
        for (i, code) in codes.iter().enumerate() {
            let id = base + i as u32;
            if id == 0 || id >= SWITCH_COUNT as u32 {
                continue;
            }
            if let Some(switch) = self.switches.get_mut(&id) {
                switch.location = zone_name(*code).to_string();
            }
        }
        false
    }

    /// Apply one bit per zone to `flag`. Set bits create sensors when `create` is true.
    fn apply_bitmap(&mut self, bitmap: u32, flag: SensorStatusFlags, create: bool, now: Instant) -> bool {
        let mut changed_any = false;
        if create {
            for id in 0..self.zone_limit().min(32) {
                if bit(bitmap, id) {
                    changed_any |= self.ensure_sensor(id);
                }
            }
        }
        let ids: Vec<u32> = self.sensors.keys().copied().filter(|id| *id < 32).collect();
        for id in ids {
            let on = bit(bitmap, id);
            let Some(sensor) = self.sensors.get_mut(&id) else {
                continue;
            };
            let old_status = sensor.status;
            let changed = if flag == SensorStatusFlags::OPEN {
                sensor.set_open(on, now)
            } else {
                sensor.set_flag(flag, on)
            };
            let new_status = sensor.status;
            if !changed.is_empty() {
                changed_any = true;
                self.emit(PanelEvent::SensorChanged { id, old_status, new_status, changed });
            }
        }
        changed_any
    }

    /// Set or clear one flag on one sensor, emitting a change event.
    fn set_sensor_flag(&mut self, id: u32, flag: SensorStatusFlags, on: bool) -> bool {
        let Some(sensor) = self.sensors.get_mut(&id) else {
            return false;
        };
        let old_status = sensor.status;
        let changed = sensor.set_flag(flag, on);
        let new_status = sensor.status;
        if changed.is_empty() {
            return false;
        }
        self.emit(PanelEvent::SensorChanged { id, old_status, new_status, changed });
        true
    }

    fn on_status(&mut self, status: StatusMessage, now: Instant) -> bool {
        match status {
            StatusMessage::ZoneAlarm { alarm, tamper_alarm } => {
                let a = self.apply_bitmap(alarm, SensorStatusFlags::ALARM, false, now);
                let t = self.apply_bitmap(tamper_alarm, SensorStatusFlags::TAMPER_ALARM, false, now);
                a | t
            }
            StatusMessage::ZoneOpen { open, low_battery } => {
                let o = self.apply_bitmap(open, SensorStatusFlags::OPEN, true, now);
                let b = self.apply_bitmap(low_battery, SensorStatusFlags::LOW_BATTERY, false, now);
                o | b
            }
            StatusMessage::Tamper { tamper, tamper_alert } => {
                self.apply_bitmap(tamper | tamper_alert, SensorStatusFlags::TAMPER, false, now)
            }
            StatusMessage::System { status, flags, event_zone, zone_event, x10 } => {
                self.on_system_status(status, flags, event_zone, zone_event, x10, now)
            }
            StatusMessage::Enrolled { enrolled, bypassed } => {
                let mut changed = self.apply_bitmap(enrolled, SensorStatusFlags::ENROLLED, true, now);
                let gone: Vec<u32> = self
                    .sensors
                    .keys()
                    .copied()
                    .filter(|id| *id < 32 && !bit(enrolled, *id))
                    .collect();
                for id in gone {
                    self.sensors.remove(&id);
                    info!("Sensor in zone {} no longer enrolled", id + 1);
                    self.emit(PanelEvent::SensorRemoved { id });
                    changed = true;
                }
                changed | self.apply_bitmap(bypassed, SensorStatusFlags::BYPASS, false, now)
            }
            StatusMessage::Other { subtype } => {
                debug!("Unhandled status subtype {:02X}", subtype);
                false
            }
        }
    }

    fn on_system_status(
        &mut self,
        code: u8,
        flags: u8,
        event_zone: u8,
        zone_event: u8,
        x10: u16,
        now: Instant,
    ) -> bool {
        let raw_flags = SystemFlags::from_bits_truncate(flags);
        let (changed, state_changed) = self.status.update_status(code, raw_flags);
        let mut push = state_changed || !changed.is_empty();
        if state_changed {
            info!("Panel state: {}", self.status.arm_state.name());
        }
        for name in SystemFlags::set_event_names(changed, self.status.flags) {
            debug!("System flag set: {}", name);
        }
        for name in SystemFlags::unset_event_names(changed, self.status.flags) {
            debug!("System flag cleared: {}", name);
        }

        if raw_flags.contains(SystemFlags::ZONE_EVENT) && event_zone > 0 {
            let id = u32::from(event_zone - 1);
            push |= self.on_zone_event(id, zone_event, now);
        }

        for id in 0..SWITCH_COUNT as u32 {
            let on = x10 & (1 << id) != 0;
            if on {
                self.ensure_switch(id);
            }
            if let Some(switch) = self.switches.get_mut(&id)
                && let Some(state) = switch.update_state(on)
            {
                self.emit(PanelEvent::SwitchChanged { id, state });
                push = true;
            }
        }
        push
    }

    fn on_zone_event(&mut self, id: u32, event: u8, now: Instant) -> bool {
        if id >= self.zone_limit() {
            return false;
        }
        self.ensure_sensor(id);
        match event {
            zone_event::TAMPER_ALARM => {
                self.emit_condition(PanelCondition::new(ConditionKind::Tamper).with_zone(id + 1).with_code(event));
                self.set_sensor_flag(id, SensorStatusFlags::TAMPER_ALARM, true)
            }
            zone_event::TAMPER_RESTORE => {
                let a = self.set_sensor_flag(id, SensorStatusFlags::TAMPER_ALARM, false);
                let t = self.set_sensor_flag(id, SensorStatusFlags::TAMPER, false);
                a | t
            }
            zone_event::OPEN | zone_event::CLOSED => {
                let open = event == zone_event::OPEN;
                let Some(sensor) = self.sensors.get_mut(&id) else {
                    return false;
                };
                let old_status = sensor.status;
                let changed = sensor.set_open(open, now);
                let new_status = sensor.status;
                if changed.is_empty() {
                    return false;
                }
                self.emit(PanelEvent::SensorChanged { id, old_status, new_status, changed });
                true
            }
            zone_event::VIOLATED => {
                if let Some(sensor) = self.sensors.get_mut(&id) {
                    sensor.mark_triggered(now);
                }
                true
            }
            zone_event::TAMPER_OPEN => self.set_sensor_flag(id, SensorStatusFlags::TAMPER, true),
            zone_event::LOW_BATTERY => self.set_sensor_flag(id, SensorStatusFlags::LOW_BATTERY, true),
            zone_event::BATTERY_RESTORE => self.set_sensor_flag(id, SensorStatusFlags::LOW_BATTERY, false),
            other => {
                debug!("Zone {} event {}", id + 1, other);
                false
            }
        }
    }

    fn on_status_change(&mut self, events: &[(u8, u8)]) -> bool {
        let mut push = false;
        for &(zone, raw_code) in events {
            let code = raw_code & 0x7F;
            let name = log_event_name(code);
            debug!("Panel event: zone {} code {:02X} ({})", zone, code, name);
            push = true;

            if code == PANEL_RESET_CODE {
                info!("Panel reset");
                self.emit_condition(PanelCondition::new(ConditionKind::PanelReset).with_code(code));
            }
            if TAMPER_CODES.contains(&code) {
                self.status.tamper_active = true;
                self.emit_condition(
                    PanelCondition::new(ConditionKind::Tamper).with_zone(u32::from(zone)).with_code(code),
                );
            } else if TAMPER_RESTORE_CODES.contains(&code) {
                self.status.tamper_active = false;
            }

            if SIREN_CANCEL_CODES.contains(&code) {
                if self.status.siren_active.take().is_some() {
                    info!("Alarm cancelled");
                    self.emit_condition(
                        PanelCondition::new(ConditionKind::AlarmCancelled).with_zone(u32::from(zone)).with_code(code),
                    );
                }
            } else if !SIREN_IGNORE_CODES.contains(&code)
                && let Some(alarm) = alarm_type(code)
            {
                let alarm = alarm.to_lowercase();
                if self.config.siren_trigger_list.iter().any(|t| *t == alarm) {
                    if self.status.siren_active.is_none() {
                        info!("Siren active: {} alarm in zone {}", alarm, zone);
                    }
                    self.status.siren_active = Some(Utc::now());
                    self.emit_condition(
                        PanelCondition::new(ConditionKind::AlarmActive).with_zone(u32::from(zone)).with_code(code),
                    );
                }
            }

            if let Some(trouble) = trouble_type(code) {
                self.status.last_trouble = Some(trouble);
                self.emit_condition(
                    PanelCondition::new(ConditionKind::PanelTrouble).with_zone(u32::from(zone)).with_code(code),
                );
            }
        }
        push
    }

    fn on_powerlink(&mut self, msg: PowerlinkMessage, now: Instant) -> bool {
        match msg {
            PowerlinkMessage::PanelTime { second, minute, hour, day, month, year } => {
                let panel_time = NaiveDate::from_ymd_opt(2000 + i32::from(year), u32::from(month), u32::from(day))
                    .and_then(|d| d.and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second)));
                match panel_time {
                    Some(t) => {
                        self.status.panel_time = Some(t);
                        self.sync_time(t);
                    }
                    None => warn!("Panel sent an invalid time"),
                }
                false
            }
            PowerlinkMessage::KeepAlive => {
                trace!("Powerlink keep-alive");
                self.watchdog.reset(now);
                match self.mode.current() {
                    Mode::PowerlinkPending => {
                        self.send_ack(true, now);
                        self.enter_powerlink(now);
                    }
                    Mode::Powerlink => self.send_ack(true, now),
                    Mode::Problem => {
                        self.send_ack(true, now);
                        info!("Powerlink connection recovered");
                        self.set_mode(Mode::Powerlink);
                    }
                    _ => {}
                }
                false
            }
            PowerlinkMessage::PhoneStatus { data } => {
                debug!("Phone status: {:02X?}", data);
                false
            }
            PowerlinkMessage::Enroll { requested } => {
                if requested && self.enrollment.auto_enroll_done {
                    debug!("Panel requests enrollment, already sent this session");
                } else if requested && !self.config.force_standard {
                    info!("Panel requests Powerlink enrollment");
                    self.send_enroll(now);
                    if self.mode.current() == Mode::Download && self.caps.is_none() {
                        self.request_download();
                    }
                }
                false
            }
            PowerlinkMessage::Other { subtype } => {
                debug!("Unhandled Powerlink subtype {:02X}", subtype);
                false
            }
        }
    }

    fn sync_time(&mut self, panel_time: NaiveDateTime) {
        if !self.config.auto_sync_time {
            return;
        }
        let local = Local::now().naive_local();
        let drift = (local - panel_time).num_seconds();
        if drift.abs() <= TIME_SYNC_TOLERANCE_SECS {
            debug!("Panel clock within {}s", drift.abs());
            return;
        }
        info!("Panel clock is {}s off, correcting", drift);
        let year = u8::try_from(local.year() - 2000).unwrap_or(0);
        let stamp = [
            local.second() as u8,
            local.minute() as u8,
            local.hour() as u8,
            local.day() as u8,
            local.month() as u8,
            year,
        ];
        match CommandBuilder::new(Command::SetTime).patch(3, stamp).build() {
            Ok(cmd) => self.queue.enqueue(cmd),
            Err(e) => warn!("Cannot build time update: {}", e),
        }
    }
}
