// Protocol engine tests
//
// These drive PanelComm through whole sessions against a scripted panel
// that answers each PDU the engine writes. Time is simulated: every step
// advances a fake clock and calls tick().

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, NaiveDate, Timelike};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::mpsc;

use visonic_bridge::checksum::{calculate, frame};
use visonic_bridge::constants::zone_name;
use visonic_bridge::event::event_channel;
use visonic_bridge::{
    ArmMode, ByteSink, ChannelSink, ConditionKind, Mode, PanelComm, PanelConfig, PanelEvent,
    SinkMessage, TimingConfig, VisonicError, VisonicPanel, X10Command,
};

const STEP: Duration = Duration::from_millis(100);
const PANEL_TYPE: u8 = 3;

// -- Harness --

#[derive(Clone, Default)]
struct RecordingSink {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl ByteSink for RecordingSink {
    fn write(&mut self, data: &[u8]) -> visonic_bridge::Result<()> {
        self.written.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

type Responder<'a> = &'a mut dyn FnMut(&[u8]) -> Vec<Vec<u8>>;

struct Harness {
    comm: PanelComm<RecordingSink>,
    sink: RecordingSink,
    events: visonic_bridge::EventReceiver,
    now: Instant,
}

impl Harness {
    fn new(config: PanelConfig) -> Self {
        let sink = RecordingSink::default();
        let (tx, events) = event_channel(4096);
        let comm = PanelComm::new(config, sink.clone(), tx);
        Self { comm, sink, events, now: Instant::now() }
    }

    fn start(&mut self) {
        self.comm.start(self.now);
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        self.comm.tick(self.now);
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.comm.receive(bytes, self.now);
    }

    fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sink.written.lock().unwrap())
    }

    fn is_closed(&self) -> bool {
        self.sink.closed.load(Ordering::SeqCst)
    }

    fn events(&mut self) -> Vec<PanelEvent> {
        let mut out = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        out
    }

    /// Run the clock for `duration`, answering everything written with `panel`.
    fn pump(&mut self, duration: Duration, panel: Responder<'_>) -> Vec<Vec<u8>> {
        let end = self.now + duration;
        let mut all = Vec::new();
        loop {
            loop {
                let sent = self.take_sent();
                if sent.is_empty() {
                    break;
                }
                for pdu in sent {
                    for reply in panel(&pdu) {
                        self.feed(&reply);
                    }
                    all.push(pdu);
                }
            }
            if self.now >= end {
                break;
            }
            self.advance(STEP);
        }
        all
    }
}

fn silent() -> impl FnMut(&[u8]) -> Vec<Vec<u8>> {
    |_: &[u8]| Vec::new()
}

fn conditions(events: &[PanelEvent]) -> Vec<ConditionKind> {
    events
        .iter()
        .filter_map(|e| match e {
            PanelEvent::Condition(c) => Some(c.kind),
            _ => None,
        })
        .collect()
}

fn count(kinds: &[ConditionKind], kind: ConditionKind) -> usize {
    kinds.iter().filter(|k| **k == kind).count()
}

fn mode_changes(events: &[PanelEvent]) -> Vec<Mode> {
    events
        .iter()
        .filter_map(|e| match e {
            PanelEvent::ModeChanged { new, .. } => Some(*new),
            _ => None,
        })
        .collect()
}

fn status_updates(events: &[PanelEvent]) -> usize {
    events.iter().filter(|e| matches!(e, PanelEvent::StatusUpdated)).count()
}

/// Message types written, ignoring ACKs.
fn sent_types(sent: &[Vec<u8>]) -> Vec<u8> {
    sent.iter().map(|pdu| pdu[1]).filter(|t| *t != 0x02).collect()
}

// -- Panel messages --

fn ack() -> Vec<u8> {
    frame(&[0x02])
}

fn long_ack() -> Vec<u8> {
    frame(&[0x02, 0x43])
}

fn status(subtype: u8, data: [u8; 8]) -> Vec<u8> {
    let mut body = vec![0xA5, 0x00, subtype];
    body.extend_from_slice(&data);
    body.push(0x43);
    frame(&body)
}

fn bitmaps(first: u32, second: u32) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[..4].copy_from_slice(&first.to_le_bytes());
    data[4..].copy_from_slice(&second.to_le_bytes());
    data
}

fn system_status(code: u8, flags: u8, event_zone: u8, zone_event: u8) -> Vec<u8> {
    status(0x04, [code, flags, event_zone, zone_event, 0, 0, 0, 0])
}

fn panel_event(zone: u8, code: u8) -> Vec<u8> {
    frame(&[0xA7, 0x01, 0x00, zone, code, 0, 0, 0, 0, 0, 0, 0x43])
}

fn keep_alive() -> Vec<u8> {
    frame(&[0xAB, 0x03, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43])
}

fn panel_time(offset_secs: i64) -> Vec<u8> {
    let t = Local::now().naive_local() + chrono::Duration::seconds(offset_secs);
    frame(&[
        0xAB,
        0x01,
        0x00,
        t.second() as u8,
        t.minute() as u8,
        t.hour() as u8,
        t.day() as u8,
        t.month() as u8,
        (t.year() - 2000) as u8,
        0,
        0,
        0x43,
    ])
}

/// Frame with its checksum pushed `delta` away from the correct value.
fn corrupt(body: &[u8], delta: u8) -> Vec<u8> {
    let mut pdu = frame(body);
    let at = pdu.len() - 2;
    pdu[at] = calculate(body).wrapping_add(delta);
    pdu
}

/// EPROM contents served by the fake panel.
fn image_byte(addr: u16) -> u8 {
    match addr {
        // Master PIN 1234
        0x01FA => 0x12,
        0x01FB => 0x34,
        0x0400..=0x0407 => b"JS702412"[(addr - 0x0400) as usize],
        // Zone 1 and zone 2 enrolled
        0x0900 => 0x01,
        0x0902 => 0x2A,
        0x0903 => 0x03,
        0x0904 => 0x01,
        0x0906 => 0x29,
        0x0907 => 0x05,
        // Zone names
        0x0B40 => 0x05,
        0x0B41 => 0x0C,
        _ => 0x00,
    }
}

/// A scripted PowerMax Complete.
#[derive(Default)]
struct FakePanel {
    /// Number of download requests to refuse with access denied
    deny_download: u32,
    /// Answer the first download request with "busy, retry in 30s"
    busy_once: bool,
    deny_arm: bool,
    clock_offset_secs: i64,
    /// Answer the first block request with half the bytes asked for
    short_first_block: bool,
}

impl FakePanel {
    fn reply(&mut self, pdu: &[u8]) -> Vec<Vec<u8>> {
        match pdu[1] {
            // Exit download mode
            0x0F => vec![frame(&[0x0B])],
            0xAB => match pdu[2] {
                0x01 => vec![ack(), panel_time(self.clock_offset_secs)],
                0x06 => vec![ack(), system_status(0x00, 0x01, 0, 0)],
                _ => vec![ack()],
            },
            0xA2 => vec![ack(), system_status(0x00, 0x01, 0, 0)],
            0xA3 => vec![ack(), frame(&[0xA3, 0x00, 0x01, 0x05, 0x0C, 0, 0, 0, 0, 0, 0, 0x43])],
            0xA6 => vec![ack(), frame(&[0xA6, 0x00, 0x01, 0x21, 0x21, 0x21, 0x21, 0x21, 0x21, 0x21, 0x21, 0x43])],
            0xA1 if self.deny_arm => vec![frame(&[0x08])],
            0xA1 | 0xAA | 0xA4 | 0x46 => vec![ack()],
            0xA0 => vec![
                ack(),
                frame(&[0xA0, 0x02, 0x01, 30, 20, 10, 1, 5, 24, 0x03, 0x01, 0x43]),
                frame(&[0xA0, 0x02, 0x02, 0, 0, 0, 31, 2, 24, 0x00, 0x5E, 0x43]),
            ],
            0x24 => {
                if self.deny_download > 0 {
                    self.deny_download -= 1;
                    return vec![frame(&[0x08])];
                }
                if self.busy_once {
                    self.busy_once = false;
                    return vec![frame(&[0x25, 0, 0, 30, 0, 0, 0, 0, 0, 0, 0])];
                }
                vec![frame(&[0x3C, 0, 0, 0, 0, 0x01, PANEL_TYPE, 0, 0, 0, 0])]
            }
            0x3E => {
                let (index, page) = (pdu[2], pdu[3]);
                let len = u16::from_le_bytes([pdu[4], pdu[5]]);
                let start = u16::from_be_bytes([page, index]);
                let len = if self.short_first_block {
                    self.short_first_block = false;
                    len / 2
                } else {
                    len
                };
                let mut body = vec![0x3F, index, page, len as u8];
                body.extend((0..len).map(|i| image_byte(start + i)));
                vec![frame(&body)]
            }
            _ => Vec::new(),
        }
    }
}

fn standard_config() -> PanelConfig {
    PanelConfig::builder().force_standard(true).build()
}

fn patient_timing() -> TimingConfig {
    TimingConfig {
        no_data_at_start: Duration::from_secs(10_000),
        no_data_idle: Duration::from_secs(10_000),
        ..TimingConfig::default()
    }
}

/// Standard mode session with the start-up commands answered.
fn standard_session(config: PanelConfig) -> (Harness, FakePanel) {
    let mut h = Harness::new(config);
    let mut panel = FakePanel::default();
    h.start();
    h.pump(Duration::from_secs(10), &mut |pdu| panel.reply(pdu));
    assert_eq!(h.comm.mode(), Mode::Standard);
    (h, panel)
}

/// Full download followed by Powerlink enrollment.
fn powerlink_session(mut panel: FakePanel) -> (Harness, FakePanel, Vec<PanelEvent>) {
    let mut h = Harness::new(PanelConfig::builder().download_code("5650").build());
    h.start();
    h.pump(Duration::from_secs(60), &mut |pdu| panel.reply(pdu));
    assert_eq!(h.comm.mode(), Mode::PowerlinkPending);
    h.feed(&keep_alive());
    h.pump(Duration::from_secs(5), &mut |pdu| panel.reply(pdu));
    let events = h.events();
    (h, panel, events)
}

// -- Framing and status --

#[test]
fn test_status_messages_update_sensors() {
    let (mut h, _panel) = standard_session(standard_config());
    h.events();
    h.take_sent();

    // Zones 1 and 5 enrolled
    h.feed(&status(0x06, bitmaps(0x11, 0)));
    let events = h.events();
    let new: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            PanelEvent::NewSensor { id } => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(new, vec![0, 4]);
    assert_eq!(status_updates(&events), 1);
    assert_eq!(h.comm.sensor(0).unwrap().zone_name, zone_name(0x05));
    assert!(h.comm.sensor(1).is_none());

    h.feed(&status(0x02, bitmaps(0x11, 0)));
    let events = h.events();
    let changed = events.iter().filter(|e| matches!(e, PanelEvent::SensorChanged { .. })).count();
    assert_eq!(changed, 2);
    assert_eq!(status_updates(&events), 1);
    assert!(h.comm.sensor(4).unwrap().is_open());

    // Every status message was acknowledged
    assert_eq!(h.take_sent(), vec![ack(), ack()]);

    // Zone 1 drops out of the enrolled bitmap
    h.feed(&status(0x06, bitmaps(0x10, 0)));
    let events = h.events();
    assert!(events.iter().any(|e| matches!(e, PanelEvent::SensorRemoved { id: 0 })));
    assert_eq!(h.comm.sensors().len(), 1);
}

#[test]
fn test_zone_event_raises_tamper() {
    let (mut h, _panel) = standard_session(standard_config());
    h.events();

    h.feed(&system_status(0x00, 0x21, 5, 1));
    let events = h.events();
    let tamper = events
        .iter()
        .find_map(|e| match e {
            PanelEvent::Condition(c) if c.kind == ConditionKind::Tamper => Some(c.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(tamper.zone, Some(5));
    assert!(h.comm.sensor(4).is_some());
    assert_eq!(status_updates(&events), 1);
}

#[test]
fn test_siren_follows_alarm_and_cancel() {
    let config = PanelConfig::builder()
        .force_standard(true)
        .siren_trigger_list(["intruder"])
        .build();
    let (mut h, _panel) = standard_session(config);
    h.events();

    h.feed(&panel_event(3, 0x01));
    let kinds = conditions(&h.events());
    assert_eq!(count(&kinds, ConditionKind::AlarmActive), 1);
    assert!(h.comm.panel_status().is_siren_active());

    h.feed(&panel_event(3, 0x1B));
    let kinds = conditions(&h.events());
    assert_eq!(count(&kinds, ConditionKind::AlarmCancelled), 1);
    assert!(!h.comm.panel_status().is_siren_active());
}

#[test]
fn test_alarm_outside_trigger_list_leaves_siren_off() {
    let config = PanelConfig::builder()
        .force_standard(true)
        .siren_trigger_list(["fire"])
        .build();
    let (mut h, _panel) = standard_session(config);
    h.events();

    h.feed(&panel_event(3, 0x01));
    let kinds = conditions(&h.events());
    assert_eq!(count(&kinds, ConditionKind::AlarmActive), 0);
    assert!(!h.comm.panel_status().is_siren_active());
}

#[test]
fn test_checksum_off_by_one_is_accepted() {
    let mut h = Harness::new(standard_config());
    h.start();
    h.events();

    h.feed(&corrupt(&[0xA5, 0x00, 0x06, 0x01, 0, 0, 0, 0, 0, 0, 0, 0x43], 1));
    let events = h.events();
    assert!(events.iter().any(|e| matches!(e, PanelEvent::NewSensor { id: 0 })));
}

#[test]
fn test_checksum_errors_suspend() {
    let mut h = Harness::new(standard_config());
    h.start();
    h.events();
    let bad = corrupt(&[0xA5, 0x00, 0x02, 0x01, 0, 0, 0, 0, 0, 0, 0, 0x43], 5);

    for _ in 0..5 {
        h.feed(&bad);
    }
    assert!(!h.comm.is_suspended());

    h.feed(&bad);
    assert!(h.comm.is_suspended());
    assert!(h.is_closed());
    let events = h.events();
    assert_eq!(conditions(&events), vec![ConditionKind::CrcErrorsExceeded]);
    assert!(matches!(events.last(), Some(PanelEvent::Suspended)));

    // Nothing is processed once suspended
    h.feed(&status(0x06, bitmaps(0x01, 0)));
    assert!(h.comm.sensors().is_empty());
    assert!(h.events().is_empty());
}

#[test]
fn test_noise_checksum_errors_are_not_counted() {
    let mut h = Harness::new(standard_config());
    h.start();

    for _ in 0..20 {
        h.feed(&corrupt(&[0xF1, 0, 0, 0, 0, 0], 5));
    }
    assert!(!h.comm.is_suspended());
}

#[test]
fn test_silent_panel_suspends() {
    let mut h = Harness::new(standard_config());
    h.start();
    h.pump(Duration::from_secs(59), &mut silent());
    assert!(!h.comm.is_suspended());

    h.pump(Duration::from_secs(2), &mut silent());
    assert!(h.comm.is_suspended());
    assert_eq!(conditions(&h.events()), vec![ConditionKind::NoDataFromPanel]);
}

// -- Send queue --

#[test]
fn test_single_flight_resend_then_escalate() {
    let config = PanelConfig::builder().force_standard(true).timing(patient_timing()).build();
    let mut h = Harness::new(config);
    h.start();

    // Init waits for an ACK; nothing else goes out meanwhile
    let sent = h.pump(Duration::from_secs(99), &mut silent());
    assert_eq!(sent_types(&sent), vec![0xAB]);

    let sent = h.pump(Duration::from_secs(2), &mut silent());
    assert_eq!(sent_types(&sent), vec![0xAB]);
    assert!(conditions(&h.events()).is_empty());

    let sent = h.pump(Duration::from_secs(100), &mut silent());
    let kinds = conditions(&h.events());
    assert_eq!(count(&kinds, ConditionKind::CommandNoResponse), 1);
    assert_eq!(sent_types(&sent).first(), Some(&0xA2));
}

#[test]
fn test_keep_alive_polls_status_when_idle() {
    let (mut h, mut panel) = standard_session(standard_config());
    h.take_sent();

    let sent = h.pump(Duration::from_secs(60), &mut |pdu| panel.reply(pdu));
    let polls = sent.iter().filter(|pdu| pdu[1] == 0xA2).count();
    assert_eq!(polls, 2);
    assert!(!h.comm.is_suspended());
}

// -- Download and Powerlink --

#[test]
fn test_download_enrolls_powerlink() {
    let panel = FakePanel { busy_once: true, ..FakePanel::default() };
    let (h, _panel, events) = powerlink_session(panel);

    let kinds = conditions(&events);
    assert_eq!(count(&kinds, ConditionKind::DownloadRetry), 1);
    assert_eq!(count(&kinds, ConditionKind::DownloadSuccess), 1);
    assert_eq!(
        mode_changes(&events),
        vec![Mode::Download, Mode::PowerlinkPending, Mode::Powerlink]
    );
    assert_eq!(h.comm.mode(), Mode::Powerlink);

    let status = h.comm.panel_status();
    assert_eq!(status.master_pin.as_deref(), Some("1234"));
    assert_eq!(status.eprom_version.as_deref(), Some("JS702412"));
    assert_eq!(status.panel_type, Some(PANEL_TYPE));
    assert_eq!(h.comm.capabilities().unwrap().zones, 30);

    let ids: Vec<u32> = h.comm.sensors().keys().copied().collect();
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(h.comm.sensor(1).unwrap().zone_name, zone_name(0x0C));
    assert!(h.comm.eprom().has_page(0x09));
}

#[test]
fn test_download_requests_are_bounded() {
    let mut h = Harness::new(PanelConfig::default());
    let mut panel = FakePanel::default();
    h.start();
    let sent = h.pump(Duration::from_secs(30), &mut |pdu| panel.reply(pdu));

    let blocks: Vec<&Vec<u8>> = sent.iter().filter(|pdu| pdu[1] == 0x3E).collect();
    assert!(blocks.len() > 10);
    for pdu in &blocks {
        let len = u16::from_le_bytes([pdu[4], pdu[5]]);
        assert!(len > 0 && len <= 0xB0);
    }
    // Exactly one download request, sent after Exit, Stop and Init
    let types = sent_types(&sent);
    let download_at = types.iter().position(|t| *t == 0x24).unwrap();
    assert_eq!(&types[..3], &[0x0F, 0x0B, 0xAB]);
    assert!(download_at >= 3);
    assert_eq!(types.iter().filter(|t| **t == 0x24).count(), 1);
}

fn enroll_pdu() -> Vec<u8> {
    frame(&[0xAB, 0x0A, 0x00, 0x00, 0x56, 0x50, 0, 0, 0, 0, 0, 0x43])
}

fn enroll_request() -> Vec<u8> {
    frame(&[0xAB, 0x0A, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0x43])
}

#[test]
fn test_short_block_is_requested_again() {
    let mut h = Harness::new(PanelConfig::default());
    let mut panel = FakePanel { short_first_block: true, ..FakePanel::default() };
    h.start();

    let sent = h.pump(Duration::from_secs(60), &mut |pdu| panel.reply(pdu));
    let first = sent.iter().find(|pdu| pdu[1] == 0x3E).unwrap();
    assert_eq!(sent.iter().filter(|pdu| *pdu == first).count(), 2);
    assert_eq!(count(&conditions(&h.events()), ConditionKind::DownloadSuccess), 1);
    assert_eq!(h.comm.mode(), Mode::PowerlinkPending);
}

#[test]
fn test_enroll_request_answered_once() {
    let (mut h, mut panel, _events) = powerlink_session(FakePanel::default());
    h.take_sent();

    let mut sent = Vec::new();
    for _ in 0..3 {
        h.feed(&enroll_request());
        sent.extend(h.pump(Duration::from_secs(2), &mut |pdu| panel.reply(pdu)));
    }
    assert_eq!(sent.iter().filter(|pdu| **pdu == enroll_pdu()).count(), 1);
    assert_eq!(h.comm.mode(), Mode::Powerlink);
}

#[test]
fn test_enroll_request_ignored_when_forced_standard() {
    let (mut h, mut panel) = standard_session(standard_config());
    h.take_sent();

    h.feed(&enroll_request());
    let sent = h.pump(Duration::from_secs(2), &mut |pdu| panel.reply(pdu));
    assert!(!sent.contains(&enroll_pdu()));
}

#[test]
fn test_pending_enrollment_gives_up() {
    let config = PanelConfig::builder().timing(patient_timing()).build();
    let mut h = Harness::new(config);
    let mut panel = FakePanel::default();
    h.start();
    h.pump(Duration::from_secs(60), &mut |pdu| panel.reply(pdu));
    assert_eq!(h.comm.mode(), Mode::PowerlinkPending);
    h.events();
    h.take_sent();

    // The panel never sends a keep-alive
    let sent = h.pump(Duration::from_secs(900), &mut |pdu| panel.reply(pdu));
    assert_eq!(sent.iter().filter(|pdu| **pdu == enroll_pdu()).count(), 4);
    let events = h.events();
    assert_eq!(count(&conditions(&events), ConditionKind::EnrollmentFailed), 1);
    assert_eq!(mode_changes(&events), vec![Mode::StandardPlus]);
    assert_eq!(h.comm.mode(), Mode::StandardPlus);
}

#[test]
fn test_keep_alive_gets_long_ack() {
    let (mut h, mut panel, _events) = powerlink_session(FakePanel::default());
    h.take_sent();

    h.feed(&keep_alive());
    assert_eq!(h.take_sent(), vec![long_ack()]);
    h.pump(Duration::from_secs(1), &mut |pdu| panel.reply(pdu));
    assert_eq!(h.comm.mode(), Mode::Powerlink);
}

#[test]
fn test_panel_clock_in_tolerance_is_left_alone() {
    let mut h = Harness::new(PanelConfig::default());
    let mut panel = FakePanel::default();
    h.start();
    let mut sent = h.pump(Duration::from_secs(60), &mut |pdu| panel.reply(pdu));
    h.feed(&keep_alive());
    sent.extend(h.pump(Duration::from_secs(5), &mut |pdu| panel.reply(pdu)));

    let types = sent_types(&sent);
    assert!(types.contains(&0xAB));
    assert!(!types.contains(&0x46));
}

#[test]
fn test_panel_clock_drift_is_corrected() {
    let mut h = Harness::new(PanelConfig::default());
    let mut panel = FakePanel { clock_offset_secs: 3600, ..FakePanel::default() };
    h.start();
    h.pump(Duration::from_secs(60), &mut |pdu| panel.reply(pdu));
    h.feed(&keep_alive());
    let sent = h.pump(Duration::from_secs(5), &mut |pdu| panel.reply(pdu));

    assert!(sent_types(&sent).contains(&0x46));
}

#[test]
fn test_watchdog_gives_up_to_standard_plus() {
    let (mut h, mut panel, _events) = powerlink_session(FakePanel::default());

    h.pump(Duration::from_secs(1250), &mut |pdu| panel.reply(pdu));
    let events = h.events();
    let kinds = conditions(&events);
    assert_eq!(count(&kinds, ConditionKind::WatchdogTimeoutRetrying), 9);
    assert_eq!(count(&kinds, ConditionKind::WatchdogTimeoutGivingUp), 1);
    assert_eq!(mode_changes(&events), vec![Mode::StandardPlus]);
    assert_eq!(h.comm.mode(), Mode::StandardPlus);
    assert!(!h.comm.is_suspended());
}

#[test]
fn test_download_timeout_falls_back_once() {
    let config = PanelConfig::builder().timing(patient_timing()).build();
    let mut h = Harness::new(config);
    h.start();

    h.pump(Duration::from_secs(400), &mut silent());
    let events = h.events();
    let kinds = conditions(&events);
    assert_eq!(count(&kinds, ConditionKind::DownloadTimeout), 1);
    assert_eq!(mode_changes(&events), vec![Mode::Download, Mode::Standard]);
    assert_eq!(h.comm.mode(), Mode::Standard);
}

#[test]
fn test_refused_download_auto_enrolls() {
    let config = PanelConfig::builder().force_auto_enroll(true).build();
    let mut h = Harness::new(config);
    let mut panel = FakePanel { deny_download: 1, ..FakePanel::default() };
    h.start();

    let sent = h.pump(Duration::from_secs(30), &mut |pdu| panel.reply(pdu));
    assert!(sent.contains(&enroll_pdu()));
    let kinds = conditions(&h.events());
    assert_eq!(count(&kinds, ConditionKind::CommandRejected), 0);
    assert_eq!(count(&kinds, ConditionKind::DownloadSuccess), 1);
    assert_eq!(h.comm.mode(), Mode::PowerlinkPending);
}

#[test]
fn test_refused_download_falls_back_to_standard() {
    let mut h = Harness::new(PanelConfig::default());
    let mut panel = FakePanel { deny_download: u32::MAX, ..FakePanel::default() };
    h.start();

    h.pump(Duration::from_secs(30), &mut |pdu| panel.reply(pdu));
    let events = h.events();
    let kinds = conditions(&events);
    assert_eq!(count(&kinds, ConditionKind::CommandRejected), 1);
    assert_eq!(mode_changes(&events), vec![Mode::Download, Mode::Standard]);
}

// -- Commands --

#[test]
fn test_rejected_pin() {
    let (mut h, mut panel) = standard_session(standard_config());
    h.events();
    panel.deny_arm = true;

    h.comm.request_arm(ArmMode::Away, Some("1234"), h.now).unwrap();
    let sent = h.pump(Duration::from_secs(1), &mut |pdu| panel.reply(pdu));
    assert!(sent_types(&sent).contains(&0xA1));
    let kinds = conditions(&h.events());
    assert_eq!(kinds, vec![ConditionKind::PinRejected]);
}

#[test]
fn test_pin_required_without_eprom() {
    let (mut h, _panel) = standard_session(standard_config());
    let result = h.comm.request_arm(ArmMode::Home, None, h.now);
    assert!(matches!(result, Err(VisonicError::PinRequired)));
}

#[test]
fn test_master_pin_used_after_download() {
    let (mut h, mut panel, _events) = powerlink_session(FakePanel::default());
    h.take_sent();

    h.comm.request_arm(ArmMode::Disarm, None, h.now).unwrap();
    let sent = h.pump(Duration::from_secs(1), &mut |pdu| panel.reply(pdu));
    let arm = sent.iter().find(|pdu| pdu[1] == 0xA1).unwrap();
    assert!(arm.windows(2).any(|w| w == [0x12, 0x34]));
}

#[test]
fn test_command_limits() {
    let (mut h, _panel) = standard_session(standard_config());
    let now = h.now;

    assert!(matches!(
        h.comm.set_bypass(32, true, Some("1234"), now),
        Err(VisonicError::InvalidDeviceId { .. })
    ));
    assert!(matches!(
        h.comm.set_x10(16, X10Command::On, now),
        Err(VisonicError::InvalidDeviceId { .. })
    ));
    assert!(matches!(h.comm.request_jpeg(1), Err(VisonicError::NotSupported { .. })));
    assert!(h.comm.set_bypass(2, true, Some("1234"), now).is_ok());
    assert!(h.comm.set_x10(3, X10Command::Off, now).is_ok());
}

#[test]
fn test_commands_refused_during_download() {
    let mut h = Harness::new(PanelConfig::default());
    h.start();
    assert_eq!(h.comm.mode(), Mode::Download);

    let result = h.comm.request_arm(ArmMode::Away, Some("1234"), h.now);
    assert!(matches!(result, Err(VisonicError::NotSupported { .. })));
}

#[test]
fn test_event_log_entries() {
    let (mut h, mut panel) = standard_session(standard_config());
    h.events();

    h.comm.request_event_log(Some("1234"), h.now).unwrap();
    h.pump(Duration::from_secs(1), &mut |pdu| panel.reply(pdu));
    let entries: Vec<_> = h
        .events()
        .into_iter()
        .filter_map(|e| match e {
            PanelEvent::EventLog(entry) => Some(entry),
            _ => None,
        })
        .collect();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].total, 2);
    assert_eq!(entries[0].zone, 3);
    assert_eq!(
        entries[0].timestamp,
        NaiveDate::from_ymd_opt(2024, 5, 1).and_then(|d| d.and_hms_opt(10, 20, 30))
    );
    // February 31st
    assert_eq!(entries[1].timestamp, None);
}

#[test]
fn test_shutdown_closes_sink() {
    let (mut h, _panel) = standard_session(standard_config());
    h.comm.shutdown();
    assert!(h.comm.is_suspended());
    assert!(h.is_closed());
    assert!(matches!(
        h.comm.request_arm(ArmMode::Away, Some("1234"), h.now),
        Err(VisonicError::Suspended)
    ));
}

// -- Async front end --

async fn next_data(rx: &mut mpsc::UnboundedReceiver<SinkMessage>) -> Vec<u8> {
    loop {
        match rx.recv().await {
            Some(SinkMessage::Data(data)) => return data,
            Some(SinkMessage::Close) => continue,
            None => panic!("sink channel closed"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_async_panel_session() {
    let (sink, mut outbound) = ChannelSink::new();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let mut panel = VisonicPanel::start(standard_config(), sink, inbound_rx).unwrap();
    let mut events = panel.subscribe();
    assert_eq!(panel.mode().await, Mode::Standard);

    let init = next_data(&mut outbound).await;
    assert_eq!(init[1], 0xAB);
    inbound_tx.send(ack()).unwrap();

    // Status goes out once the Init hold-off has passed
    let poll = next_data(&mut outbound).await;
    assert_eq!(poll[1], 0xA2);

    inbound_tx.send(status(0x06, bitmaps(0x01, 0))).unwrap();
    loop {
        if let PanelEvent::NewSensor { id } = events.recv().await.unwrap() {
            assert_eq!(id, 0);
            break;
        }
    }
    assert_eq!(panel.sensors().await.len(), 1);

    // Bytes handed over directly take the same path
    panel.receive(&status(0x06, bitmaps(0x03, 0))).await;
    assert_eq!(panel.sensors().await.len(), 2);

    panel.shutdown().await;
    assert!(panel.is_suspended().await);
    loop {
        match outbound.recv().await {
            Some(SinkMessage::Close) => break,
            Some(SinkMessage::Data(_)) => continue,
            None => panic!("sink dropped before close"),
        }
    }
}
