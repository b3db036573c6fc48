// MIT License - Copyright (c) 2021 TJForc

//! Protocol engine.
//!
//! `PanelComm` owns all protocol state and never touches a socket or a
//! clock: inbound bytes arrive through [`PanelComm::receive`], time is
//! advanced through [`PanelComm::tick`], and outbound PDUs are written to a
//! [`ByteSink`]. Every operation takes the current [`Instant`], so the whole
//! state machine can be driven deterministically.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use crate::config::{ArmMode, ConfigUpdate, PanelConfig};
use crate::constants::{PanelCapabilities, ZoneChime, ZoneType};
use crate::devices::sensor::{Sensor, SensorCatalog};
use crate::devices::switch::Switch;
use crate::devices::system::PanelStatus;
use crate::eprom::{DecodedEprom, EpromStore, SWITCH_COUNT};
use crate::error::{Result, VisonicError};
use crate::event::{ConditionKind, EventSender, PanelCondition, PanelEvent};
use crate::mode::{DownloadState, Enrollment, Mode, ModeMachine};
use crate::protocol::{
    arm_command, encode_code, msg_type, Command, CommandBuilder, OutboundCommand, PanelMessage, X10Command,
};
use crate::transport::framer::{Frame, Framer, FramerEvent};
use crate::transport::queue::{QueueAction, SendQueue};
use crate::transport::ByteSink;
use crate::watchdog::{CrcErrorTracker, Liveness, Watchdog};

/// Largest zone index addressable by the 32-bit bypass bitmap.
const BYPASS_BITMAP_ZONES: u32 = 32;

pub struct PanelComm<S: ByteSink> {
    pub(crate) config: PanelConfig,
    pub(crate) sink: S,
    pub(crate) events: EventSender,
    pub(crate) framer: Framer,
    pub(crate) queue: SendQueue,
    pub(crate) mode: ModeMachine,
    pub(crate) download: DownloadState,
    pub(crate) enrollment: Enrollment,
    pub(crate) watchdog: Watchdog,
    pub(crate) liveness: Liveness,
    pub(crate) crc: CrcErrorTracker,
    pub(crate) eprom: EpromStore,
    pub(crate) catalog: SensorCatalog,
    pub(crate) caps: Option<&'static PanelCapabilities>,
    pub(crate) status: PanelStatus,
    pub(crate) sensors: BTreeMap<u32, Sensor>,
    pub(crate) switches: BTreeMap<u32, Switch>,
    /// Zone names and types learned from A3/A6 pages
    pub(crate) zone_labels: BTreeMap<u32, String>,
    pub(crate) zone_types: BTreeMap<u32, (ZoneType, ZoneChime)>,
    /// Last command written, used to classify an access-denied reply
    pub(crate) last_sent: Option<Command>,
    pub(crate) event_log_total: u8,
    started: bool,
    suspended: bool,
}

impl<S: ByteSink> PanelComm<S> {
    pub fn new(config: PanelConfig, sink: S, events: EventSender) -> Self {
        let now = Instant::now();
        let timing = config.timing.clone();
        let catalog = SensorCatalog::powermax().with_overrides(&config.sensor_overrides);
        Self {
            sink,
            events,
            framer: Framer::new(),
            queue: SendQueue::new(timing.response_timeout),
            mode: ModeMachine::default(),
            download: DownloadState::default(),
            enrollment: Enrollment::default(),
            watchdog: Watchdog::new(now, timing.watchdog_timeout, timing.watchdog_max_events),
            liveness: Liveness::new(now, timing.no_data_at_start, timing.no_data_idle),
            crc: CrcErrorTracker::new(timing.crc_error_limit, timing.crc_error_window),
            eprom: EpromStore::new(),
            catalog,
            caps: None,
            status: PanelStatus::default(),
            sensors: BTreeMap::new(),
            switches: BTreeMap::new(),
            zone_labels: BTreeMap::new(),
            zone_types: BTreeMap::new(),
            last_sent: None,
            event_log_total: 0,
            started: false,
            suspended: false,
            config,
        }
    }

    /// Begin the session: EPROM download, or straight to Standard mode
    /// when `force_standard` is set.
    pub fn start(&mut self, now: Instant) -> Option<Instant> {
        if self.started || self.suspended {
            return None;
        }
        self.started = true;
        let timing = &self.config.timing;
        self.liveness = Liveness::new(now, timing.no_data_at_start, timing.no_data_idle);
        self.watchdog.reset_all(now);

        if self.config.force_standard {
            info!("Standard mode forced by configuration");
            self.fallback_to_standard(now);
        } else {
            self.begin_download(now);
        }
        self.flush(now)
    }

    /// Feed bytes read from the panel.
    pub fn receive(&mut self, data: &[u8], now: Instant) -> Option<Instant> {
        if self.suspended {
            trace!("Suspended, dropping {} bytes", data.len());
            return None;
        }
        self.liveness.note_receive(now);
        for event in self.framer.push(data) {
            if self.suspended {
                break;
            }
            match event {
                FramerEvent::Message(frame) => self.handle_frame(frame, now),
                FramerEvent::ChecksumError { msg_type: t, raw } => {
                    warn!("Checksum error on {:02X} message: {:02X?}", t, raw);
                    if t != msg_type::NOISE && self.crc.record(now) {
                        error!("Too many checksum errors, suspending");
                        self.suspend(Some(ConditionKind::CrcErrorsExceeded));
                    }
                }
            }
        }
        self.flush(now)
    }

    /// Periodic housekeeping. Call about once a second.
    ///
    /// Returns the earliest instant at which queued output can be sent.
    pub fn tick(&mut self, now: Instant) -> Option<Instant> {
        if self.suspended || !self.started {
            return None;
        }
        if self.liveness.is_dead(now) {
            error!("No data from panel, suspending");
            self.suspend(Some(ConditionKind::NoDataFromPanel));
            return None;
        }
        self.check_mode_timers(now);
        self.expire_triggers(now);
        self.keep_alive(now);
        self.flush(now)
    }

    /// Write whatever the queue allows right now.
    ///
    /// Returns the instant of the next opportunity if output is waiting.
    pub fn flush(&mut self, now: Instant) -> Option<Instant> {
        loop {
            if self.suspended {
                return None;
            }
            match self.queue.poll(now) {
                QueueAction::Send { command, pdu, resend } => {
                    let template = command.template();
                    if resend {
                        debug!("Resending: {}", template.description);
                    } else {
                        debug!("Sending: {}", template.description);
                    }
                    self.last_sent = Some(command.command);
                    if template.download {
                        self.download.active = true;
                    }
                    self.write_pdu(&pdu);
                }
                QueueAction::WaitUntil(at) => return Some(at),
                QueueAction::Escalate { command } => self.handle_no_response(command, now),
                QueueAction::Idle => return None,
            }
        }
    }

    /// Stop all processing and release the connection.
    pub fn shutdown(&mut self) {
        info!("Shutting down protocol engine");
        self.suspend(None);
    }

    // -- Commands --

    /// Arm or disarm. Without a PIN the master code from the EPROM is used.
    pub fn request_arm(&mut self, mode: ArmMode, pin: Option<&str>, now: Instant) -> Result<()> {
        self.ensure_ready()?;
        let pin = self.resolve_pin(pin)?;
        let cmd = arm_command(mode, &pin)?;
        info!("Requesting {:?}", mode);
        self.queue.enqueue(cmd);
        self.flush(now);
        Ok(())
    }

    /// Bypass (or un-bypass) one zone. `zone` is zero-based.
    pub fn set_bypass(&mut self, zone: u32, bypass: bool, pin: Option<&str>, now: Instant) -> Result<()> {
        self.ensure_ready()?;
        let max = self
            .caps
            .map_or(30, |c| u32::from(c.zones))
            .min(BYPASS_BITMAP_ZONES);
        if zone >= max {
            return Err(VisonicError::InvalidDeviceId { id: zone, max });
        }
        let code = encode_code(&self.resolve_pin(pin)?)?;
        let bitmap = (1u32 << zone).to_le_bytes();
        let (command, offset) = if bypass {
            (Command::BypassEnable, 3)
        } else {
            (Command::BypassDisable, 7)
        };
        let cmd = CommandBuilder::new(command)
            .patch(1, code)
            .patch(offset, bitmap)
            .build()?;
        info!("Zone {} bypass {}", zone + 1, if bypass { "on" } else { "off" });
        self.queue.enqueue(cmd);
        self.queue.enqueue(OutboundCommand::plain(Command::BypassStatus));
        self.flush(now);
        Ok(())
    }

    /// Drive the PGM output (id 0) or an X10 unit (1..=15).
    pub fn set_x10(&mut self, id: u32, command: X10Command, now: Instant) -> Result<()> {
        self.ensure_ready()?;
        let max = SWITCH_COUNT as u32;
        if id >= max {
            return Err(VisonicError::InvalidDeviceId { id, max });
        }
        let cmd = CommandBuilder::new(Command::X10Pgm)
            .patch(6, [command.code()])
            .patch(7, (1u16 << id).to_le_bytes())
            .build()?;
        info!("Switch {} -> {:?}", id, command);
        self.queue.enqueue(cmd);
        self.flush(now);
        Ok(())
    }

    /// Ask the panel for its event log. Entries arrive as `PanelEvent::EventLog`.
    pub fn request_event_log(&mut self, pin: Option<&str>, now: Instant) -> Result<()> {
        self.ensure_ready()?;
        let code = encode_code(&self.resolve_pin(pin)?)?;
        let cmd = CommandBuilder::new(Command::EventLog).patch(4, code).build()?;
        self.event_log_total = 0;
        self.queue.enqueue(cmd);
        self.flush(now);
        Ok(())
    }

    /// Camera image retrieval is not implemented.
    pub fn request_jpeg(&mut self, zone: u32) -> Result<()> {
        warn!("Image retrieval requested for zone {} but is not supported", zone + 1);
        Err(VisonicError::NotSupported { operation: "image retrieval".into() })
    }

    /// Apply a runtime configuration change.
    pub fn update_config(&mut self, update: ConfigUpdate, now: Instant) -> Result<()> {
        let forced = self.config.apply(update)?;
        if forced && self.started && !self.mode.current().is_standard() {
            info!("Standard mode forced at runtime");
            self.fallback_to_standard(now);
            self.flush(now);
        }
        Ok(())
    }

    // -- Accessors --

    pub fn mode(&self) -> Mode {
        self.mode.current()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    pub fn panel_status(&self) -> &PanelStatus {
        &self.status
    }

    pub fn capabilities(&self) -> Option<&'static PanelCapabilities> {
        self.caps
    }

    pub fn sensors(&self) -> &BTreeMap<u32, Sensor> {
        &self.sensors
    }

    pub fn sensor(&self, id: u32) -> Option<&Sensor> {
        self.sensors.get(&id)
    }

    pub fn switches(&self) -> &BTreeMap<u32, Switch> {
        &self.switches
    }

    pub fn eprom(&self) -> &EpromStore {
        &self.eprom
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn subscribe(&self) -> crate::event::EventReceiver {
        self.events.subscribe()
    }

    // -- Internals --

    pub(crate) fn emit(&self, event: PanelEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        debug!("Received {:02X?}", frame.raw);
        if frame.ack_needed() {
            self.send_ack(frame.wants_long_ack(), now);
        }
        self.queue.received(frame.msg_type);
        let msg = match PanelMessage::decode(frame.msg_type, &frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping {:02X} message: {}", frame.msg_type, e);
                return;
            }
        };
        if self.dispatch(msg, now) {
            self.emit(PanelEvent::StatusUpdated);
        }
    }

    /// ACKs bypass the queue but still count towards the inter-message gap.
    pub(crate) fn send_ack(&mut self, long: bool, now: Instant) {
        let command = if long { Command::AckLong } else { Command::Ack };
        let pdu = OutboundCommand::plain(command).to_pdu();
        self.write_pdu(&pdu);
        self.queue.note_transmit(now);
    }

    fn write_pdu(&mut self, pdu: &[u8]) {
        trace!("Writing {:02X?}", pdu);
        if let Err(e) = self.sink.write(pdu) {
            error!("Write to panel failed: {}", e);
            self.suspend(None);
        }
    }

    pub(crate) fn suspend(&mut self, reason: Option<ConditionKind>) {
        if self.suspended {
            return;
        }
        self.suspended = true;
        self.queue.clear();
        self.framer.reset();
        self.sink.close();
        if let Some(kind) = reason {
            self.emit_condition(PanelCondition::new(kind));
        }
        self.emit(PanelEvent::Suspended);
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.suspended {
            return Err(VisonicError::Suspended);
        }
        if self.mode.current() == Mode::Download {
            return Err(VisonicError::NotSupported {
                operation: "panel commands during EPROM download".into(),
            });
        }
        Ok(())
    }

    fn resolve_pin(&self, pin: Option<&str>) -> Result<String> {
        match pin {
            Some(pin) => Ok(pin.to_string()),
            None => self.status.master_pin.clone().ok_or(VisonicError::PinRequired),
        }
    }

    fn expire_triggers(&mut self, now: Instant) {
        let delay = self.config.motion_off_delay;
        let mut cleared = false;
        for sensor in self.sensors.values_mut() {
            cleared |= sensor.expire_trigger(now, delay);
        }
        if cleared {
            self.emit(PanelEvent::StatusUpdated);
        }
    }

    fn keep_alive(&mut self, now: Instant) {
        if matches!(self.mode.current(), Mode::Starting | Mode::Download) || !self.queue.is_idle() {
            return;
        }
        let period = self.config.timing.keep_alive_period;
        let due = self
            .queue
            .last_transmit()
            .is_none_or(|last| now.saturating_duration_since(last) >= period);
        if due {
            trace!("Keep-alive status poll");
            self.queue.enqueue(OutboundCommand::plain(Command::Status));
        }
    }

    /// Create a sensor on first sight.
    pub(crate) fn ensure_sensor(&mut self, id: u32) -> bool {
        if self.sensors.contains_key(&id) {
            return false;
        }
        let mut sensor = Sensor::new(id);
        if let Some(label) = self.zone_labels.get(&id) {
            sensor.zone_name = label.clone();
        }
        if let Some(&(zone_type, chime)) = self.zone_types.get(&id) {
            sensor.zone_type = zone_type;
            sensor.chime = chime;
        }
        self.sensors.insert(id, sensor);
        info!("New sensor in zone {}", id + 1);
        self.emit(PanelEvent::NewSensor { id });
        true
    }

    pub(crate) fn ensure_switch(&mut self, id: u32) -> bool {
        if self.switches.contains_key(&id) {
            return false;
        }
        self.switches.insert(id, Switch::new(id));
        info!("New switch {}", id);
        self.emit(PanelEvent::NewSwitch { id });
        true
    }

    /// Rebuild identity, devices and settings from a decoded EPROM.
    pub(crate) fn apply_eprom(&mut self, decoded: DecodedEprom) {
        self.status.eprom_version = decoded.setting("eprom_version").map(str::to_string);
        self.status.software_version = decoded.setting("software_version").map(str::to_string);
        self.status.serial = decoded.setting("panel_serial").map(str::to_string);
        self.status.master_pin = decoded.master_pin.clone();
        self.status.keypads_1way = decoded.keypads_1way;
        self.status.keypads_2way = decoded.keypads_2way;
        self.status.sirens = decoded.sirens;

        for zone in decoded.zones {
            if !zone.enrolled {
                if self.sensors.remove(&zone.id).is_some() {
                    info!("Sensor in zone {} no longer enrolled", zone.id + 1);
                    self.emit(PanelEvent::SensorRemoved { id: zone.id });
                }
                continue;
            }
            self.zone_labels.insert(zone.id, zone.name.clone());
            self.zone_types.insert(zone.id, (zone.zone_type, zone.chime));
            self.ensure_sensor(zone.id);
            let (model, sensor_type) = self.catalog.lookup(zone.sensor_code);
            let model = model.map(str::to_string);
            if let Some(sensor) = self.sensors.get_mut(&zone.id) {
                sensor.zone_name = zone.name;
                sensor.zone_type = zone.zone_type;
                sensor.chime = zone.chime;
                sensor.sensor_type = sensor_type;
                sensor.model = model;
                sensor.partitions = zone.partitions;
            }
        }

        for record in decoded.switches {
            if !record.enabled {
                self.switches.remove(&record.id);
                continue;
            }
            self.ensure_switch(record.id);
            if let Some(switch) = self.switches.get_mut(&record.id) {
                switch.enabled = true;
                switch.location = record.location;
            }
        }

        self.status.settings = decoded.settings;
        info!(
            "EPROM decoded: {} sensors, {} switches, master PIN {}",
            self.sensors.len(),
            self.switches.len(),
            if self.status.has_pin() { "found" } else { "not found" }
        );
    }
}

impl<S: ByteSink> Drop for PanelComm<S> {
    fn drop(&mut self) {
        if !self.suspended {
            self.sink.close();
        }
    }
}
