// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use visonic_bridge::{
    ArmMode, ConditionKind, EventReceiver, PanelConfig, PanelEvent, SensorStatusFlags, VisonicPanel,
    X10Command,
};

#[derive(Parser)]
#[command(name = "visonic2mqtt", about = "Publish a Visonic PowerMax/PowerMaster panel over MQTT")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = "visonic2mqtt.toml")]
    config: PathBuf,
}

// -- Configuration file --

#[derive(Debug, Clone, Deserialize)]
struct FileConfig {
    panel: PanelSection,
    #[serde(default)]
    mqtt: MqttSection,
    /// Display names keyed by 1-based zone number, overriding the panel's labels
    #[serde(default, deserialize_with = "zone_names_by_number")]
    zone_names: BTreeMap<u32, String>,
}

fn zone_names_by_number<'de, D>(deserializer: D) -> Result<BTreeMap<u32, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
    let mut names = BTreeMap::new();
    for (key, name) in raw {
        let zone = key
            .parse::<u32>()
            .map_err(|_| serde::de::Error::custom(format!("zone_names key {key:?} is not a zone number")))?;
        names.insert(zone, name);
    }
    Ok(names)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct PanelSection {
    /// Serial-to-ethernet adapter wired to the panel's RS-232 port
    host: String,
    port: u16,
    download_code: String,
    /// User code for commands that arrive without one
    pin: Option<String>,
    force_standard: bool,
    force_auto_enroll: bool,
    auto_sync_time: bool,
    send_init: bool,
    motion_off_delay_secs: u64,
    siren_trigger_list: Vec<String>,
    language: String,
    reconnect_delay_ms: u64,
}

impl Default for PanelSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 10628,
            download_code: "5650".into(),
            pin: None,
            force_standard: false,
            force_auto_enroll: false,
            auto_sync_time: true,
            send_init: true,
            motion_off_delay_secs: 120,
            siren_trigger_list: vec!["intruder".into()],
            language: "EN".into(),
            reconnect_delay_ms: 10_000,
        }
    }
}

impl PanelSection {
    fn panel_config(&self) -> Result<PanelConfig> {
        if self.host.is_empty() {
            bail!("panel.host must be set");
        }
        let config = PanelConfig::builder()
            .download_code(&self.download_code)
            .force_standard(self.force_standard)
            .force_auto_enroll(self.force_auto_enroll)
            .auto_sync_time(self.auto_sync_time)
            .send_init(self.send_init)
            .motion_off_delay(Duration::from_secs(self.motion_off_delay_secs))
            .siren_trigger_list(&self.siren_trigger_list)
            .language(&self.language)
            .build();
        config.validate().context("panel section")?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct MqttSection {
    url: String,
    client_id: String,
    command_topic: String,
    state_topic: String,
    snapshot_interval_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".into(),
            client_id: "visonic-bridge".into(),
            command_topic: "visonic/cmd".into(),
            state_topic: "visonic".into(),
            snapshot_interval_secs: 60,
        }
    }
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        self.panel.panel_config()?;
        broker_address(&self.mqtt.url)?;
        Ok(())
    }
}

/// Accepts `mqtt://host:port`, `tcp://host:port` or a bare `host:port`.
fn broker_address(url: &str) -> Result<(String, u16)> {
    let rest = match url.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((scheme, _)) => bail!("unsupported MQTT scheme {scheme:?}"),
        None => url,
    };
    let Some((host, port)) = rest.rsplit_once(':') else {
        bail!("MQTT url {url:?} has no port");
    };
    if host.is_empty() {
        bail!("MQTT url {url:?} has no host");
    }
    let port = port.parse().with_context(|| format!("bad MQTT port in {url:?}"))?;
    Ok((host.to_string(), port))
}

/// What a panel session needs beyond the engine configuration.
#[derive(Debug)]
struct SessionSettings {
    panel: PanelConfig,
    host: String,
    port: u16,
    pin: Option<String>,
    reconnect_delay: Duration,
    zone_names: BTreeMap<u32, String>,
}

impl SessionSettings {
    fn from_file(config: &FileConfig) -> Result<Self> {
        Ok(Self {
            panel: config.panel.panel_config()?,
            host: config.panel.host.clone(),
            port: config.panel.port,
            pin: config.panel.pin.clone(),
            reconnect_delay: Duration::from_millis(config.panel.reconnect_delay_ms.max(100)),
            zone_names: config.zone_names.clone(),
        })
    }

    /// Name shown for a 1-based zone: configured override, panel label, or "Zone N".
    fn zone_label(&self, zone: u32, panel_label: &str) -> String {
        match self.zone_names.get(&zone) {
            Some(name) => name.clone(),
            None if panel_label.is_empty() => format!("Zone {zone}"),
            None => panel_label.to_string(),
        }
    }
}

// -- Published messages --
//
// Every message is a flat object `{now, op, ...}`. Zone numbers are 1-based,
// matching the keypad.

#[derive(Serialize)]
struct Envelope<T> {
    now: u64,
    op: &'static str,
    #[serde(flatten)]
    body: T,
}

#[derive(Serialize)]
struct ZoneBody {
    zone: u32,
}

#[derive(Serialize)]
struct ConditionBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    zone: Option<u32>,
    code: u8,
}

#[derive(Serialize)]
struct ModeBody {
    mode: &'static str,
    previous: &'static str,
}

#[derive(Serialize)]
struct SystemBody {
    #[serde(rename = "armState")]
    arm_state: &'static str,
    ready: bool,
}

#[derive(Serialize)]
struct SwitchBody {
    id: u32,
    state: bool,
}

#[derive(Serialize)]
struct LogBody {
    index: u8,
    total: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    zone: u8,
    event: &'static str,
    partition: u8,
}

#[derive(Serialize)]
struct AckBody {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Serialize)]
struct SnapshotBody {
    state: Snapshot,
}

#[derive(Serialize)]
struct Snapshot {
    panel: PanelView,
    zones: Vec<ZoneView>,
    switches: Vec<SwitchView>,
}

#[derive(Serialize)]
struct PanelView {
    mode: &'static str,
    #[serde(rename = "armState")]
    arm_state: &'static str,
    armed: bool,
    ready: bool,
    trouble: bool,
    siren: bool,
    tamper: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ZoneView {
    id: u32,
    name: String,
    zone_type: &'static str,
    sensor: &'static str,
    open: bool,
    bypass: bool,
    alarm: bool,
    tamper: bool,
    low_battery: bool,
    triggered: bool,
}

#[derive(Serialize)]
struct SwitchView {
    id: u32,
    kind: &'static str,
    location: String,
    state: bool,
}

/// Publishes JSON messages to the state topic.
#[derive(Clone)]
struct Publisher {
    client: AsyncClient,
    topic: String,
}

impl Publisher {
    async fn send<T: Serialize>(&self, op: &'static str, body: T, retain: bool) {
        let message = Envelope { now: Utc::now().timestamp_millis() as u64, op, body };
        let json = match serde_json::to_vec(&message) {
            Ok(json) => json,
            Err(e) => {
                error!("Cannot encode {op} message: {e}");
                return;
            }
        };
        if let Err(e) = self.client.publish(&self.topic, QoS::AtLeastOnce, retain, json).await {
            error!("Publish of {op} to {} failed: {e}", self.topic);
        }
    }

    async fn ack(&self, success: bool, src: Option<Value>, data: Option<Value>) {
        self.send("CMD_ACK", AckBody { success, src, data }, false).await;
    }

    async fn snapshot(&self, snapshot: Snapshot) {
        self.send("SNAPSHOT", SnapshotBody { state: snapshot }, true).await;
    }
}

async fn take_snapshot(panel: &VisonicPanel, settings: &SessionSettings) -> Snapshot {
    let status = panel.panel_status().await;
    let zones = panel
        .sensors()
        .await
        .into_iter()
        .map(|s| ZoneView {
            id: s.id + 1,
            name: settings.zone_label(s.id + 1, &s.zone_name),
            zone_type: s.zone_type.name(),
            sensor: s.sensor_type.name(),
            open: s.is_open(),
            bypass: s.is_bypassed(),
            alarm: s.is_alarm(),
            tamper: s.is_tamper(),
            low_battery: s.is_low_battery(),
            triggered: s.triggered,
        })
        .collect();
    let switches = panel
        .switches()
        .await
        .into_iter()
        .filter(|s| s.enabled)
        .map(|s| SwitchView { id: s.id, kind: s.kind.description(), location: s.location, state: s.state })
        .collect();
    Snapshot {
        panel: PanelView {
            mode: panel.mode().await.name(),
            arm_state: status.arm_state.name(),
            armed: status.arm_state.is_armed(),
            ready: status.is_ready(),
            trouble: status.is_trouble(),
            siren: status.is_siren_active(),
            tamper: status.tamper_active,
            model: status.model,
        },
        zones,
        switches,
    }
}

/// Zone ops for each sensor flag: (flag, op when set, op when cleared).
const ZONE_OPS: [(SensorStatusFlags, &str, &str); 6] = [
    (SensorStatusFlags::OPEN, "ZONE_OPEN", "ZONE_CLOSE"),
    (SensorStatusFlags::ALARM, "ZONE_ALARM", "ZONE_STANDBY"),
    (SensorStatusFlags::TAMPER, "ZONE_TAMPER", "ZONE_HOLD"),
    (SensorStatusFlags::TAMPER_ALARM, "ZONE_TAMPER_ALARM", "ZONE_TAMPER_ALARM_CLEAR"),
    (SensorStatusFlags::LOW_BATTERY, "ZONE_BATTERY_LOW", "ZONE_BATTERY_OK"),
    (SensorStatusFlags::BYPASS, "ZONE_BYPASSED", "ZONE_UNBYPASSED"),
];

fn zone_ops(changed: SensorStatusFlags, status: SensorStatusFlags) -> Vec<&'static str> {
    ZONE_OPS
        .iter()
        .filter(|(flag, _, _)| changed.contains(*flag))
        .map(|&(flag, set, cleared)| if status.contains(flag) { set } else { cleared })
        .collect()
}

async fn forward_event(event: PanelEvent, panel: &VisonicPanel, out: &Publisher, settings: &SessionSettings) {
    match event {
        PanelEvent::SensorChanged { id, new_status, changed, .. } => {
            let zone = id + 1;
            let ops = zone_ops(changed, new_status);
            if let Some(sensor) = panel.sensor(id).await {
                info!("{}: {}", settings.zone_label(zone, &sensor.zone_name), ops.join(" "));
            }
            for op in ops {
                out.send(op, ZoneBody { zone }, false).await;
            }
        }
        PanelEvent::NewSensor { id } => out.send("ZONE_NEW", ZoneBody { zone: id + 1 }, false).await,
        PanelEvent::SensorRemoved { id } => out.send("ZONE_REMOVED", ZoneBody { zone: id + 1 }, false).await,
        PanelEvent::StatusUpdated => {
            let status = panel.panel_status().await;
            let body = SystemBody { arm_state: status.arm_state.name(), ready: status.is_ready() };
            out.send("SYSTEM_STATUS", body, false).await;
        }
        PanelEvent::ModeChanged { old, new } => {
            out.send("MODE_CHANGE", ModeBody { mode: new.name(), previous: old.name() }, true).await;
        }
        PanelEvent::Condition(condition) => {
            info!("Panel reports {}", condition.kind.name());
            let body = ConditionBody { zone: condition.zone, code: condition.code };
            out.send(condition.kind.name(), body, false).await;
            if condition.kind == ConditionKind::DownloadSuccess {
                out.snapshot(take_snapshot(panel, settings).await).await;
            }
        }
        PanelEvent::NewSwitch { id } => debug!("Switch {id} found"),
        PanelEvent::SwitchChanged { id, state } => out.send("SWITCH_CHANGE", SwitchBody { id, state }, false).await,
        PanelEvent::EventLog(entry) => {
            let body = LogBody {
                index: entry.index,
                total: entry.total,
                time: entry.timestamp.map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string()),
                zone: entry.zone,
                event: entry.event_name,
                partition: entry.partition,
            };
            out.send("EVENT_LOG", body, false).await;
        }
        // Reconnect is handled by the session loop
        PanelEvent::Suspended => {}
    }
}

// -- Commands --

/// A command received on the command topic. Unknown fields (`op_id`) are ignored.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
enum Request {
    Snapshot,
    Ping,
    ArmAway { pin: Option<String> },
    ArmHome { pin: Option<String> },
    ArmAwayInstant { pin: Option<String> },
    ArmHomeInstant { pin: Option<String> },
    Disarm { pin: Option<String> },
    ZoneBypassEnable { zone: u32, pin: Option<String> },
    ZoneBypassDisable { zone: u32, pin: Option<String> },
    X10 { id: u32, state: X10Command },
    EventLog { pin: Option<String> },
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Self::Snapshot => "SNAPSHOT",
            Self::Ping => "PING",
            Self::ArmAway { .. } => "ARM_AWAY",
            Self::ArmHome { .. } => "ARM_HOME",
            Self::ArmAwayInstant { .. } => "ARM_AWAY_INSTANT",
            Self::ArmHomeInstant { .. } => "ARM_HOME_INSTANT",
            Self::Disarm { .. } => "DISARM",
            Self::ZoneBypassEnable { .. } => "ZONE_BYPASS_ENABLE",
            Self::ZoneBypassDisable { .. } => "ZONE_BYPASS_DISABLE",
            Self::X10 { .. } => "X10",
            Self::EventLog { .. } => "EVENT_LOG",
        }
    }
}

/// Run one command. `Ok` carries optional data for the acknowledgement.
async fn execute(
    request: Request,
    panel: &VisonicPanel,
    out: &Publisher,
    settings: &SessionSettings,
) -> Result<Option<Value>> {
    let default_pin = settings.pin.as_deref();
    let arm = |mode: ArmMode, pin: Option<String>| async move {
        panel.arm(mode, pin.as_deref().or(default_pin)).await
    };
    match request {
        Request::Snapshot => {
            let snapshot = take_snapshot(panel, settings).await;
            let data = serde_json::to_value(&snapshot).ok();
            out.snapshot(snapshot).await;
            return Ok(data);
        }
        Request::Ping => {}
        Request::ArmAway { pin } => arm(ArmMode::Away, pin).await?,
        Request::ArmHome { pin } => arm(ArmMode::Home, pin).await?,
        Request::ArmAwayInstant { pin } => arm(ArmMode::AwayInstant, pin).await?,
        Request::ArmHomeInstant { pin } => arm(ArmMode::HomeInstant, pin).await?,
        Request::Disarm { pin } => arm(ArmMode::Disarm, pin).await?,
        Request::ZoneBypassEnable { zone, pin } => bypass(panel, zone, true, pin, default_pin).await?,
        Request::ZoneBypassDisable { zone, pin } => bypass(panel, zone, false, pin, default_pin).await?,
        Request::X10 { id, state } => panel.x10(id, state).await?,
        Request::EventLog { pin } => panel.event_log(pin.as_deref().or(default_pin)).await?,
    }
    Ok(None)
}

async fn bypass(
    panel: &VisonicPanel,
    zone: u32,
    enable: bool,
    pin: Option<String>,
    default_pin: Option<&str>,
) -> Result<()> {
    let Some(id) = zone.checked_sub(1) else {
        bail!("zone numbers start at 1");
    };
    if panel.sensor(id).await.is_some_and(|s| s.is_bypassed() == enable) {
        debug!("Zone {zone} bypass already {enable}");
        return Ok(());
    }
    panel.bypass(id, enable, pin.as_deref().or(default_pin)).await?;
    Ok(())
}

async fn handle_message(
    payload: &[u8],
    panel: Option<&VisonicPanel>,
    out: &Publisher,
    settings: &SessionSettings,
) {
    let src = serde_json::from_slice::<Value>(payload).ok();
    let request = match serde_json::from_slice::<Request>(payload) {
        Ok(request) => request,
        Err(e) => {
            warn!("Ignoring MQTT command: {e}");
            out.ack(false, src, None).await;
            return;
        }
    };
    let name = request.name();
    if request == Request::Snapshot {
        debug!("Command {name}");
    } else {
        info!("Command {name}");
    }
    let Some(panel) = panel else {
        warn!("{name}: panel not connected");
        out.ack(false, src, None).await;
        return;
    };
    match execute(request, panel, out, settings).await {
        Ok(data) => out.ack(true, src, data).await,
        Err(e) => {
            error!("{name} failed: {e:#}");
            out.ack(false, src, None).await;
        }
    }
}

// -- Session --

/// Connect to the panel, backing off exponentially until it answers.
async fn connect_panel(settings: Arc<SessionSettings>) -> VisonicPanel {
    let mut failures: u32 = 0;
    loop {
        info!("Connecting to panel at {}:{}", settings.host, settings.port);
        match VisonicPanel::connect(&settings.host, settings.port, settings.panel.clone()).await {
            Ok(panel) => return panel,
            Err(e) => {
                let delay = settings.reconnect_delay * (1u32 << failures.min(4));
                failures += 1;
                warn!("Panel connection failed ({e}), retry {failures} in {:.1}s", delay.as_secs_f64());
                sleep(delay).await;
            }
        }
    }
}

async fn next_event(events: &mut Option<EventReceiver>) -> Result<PanelEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn connected(task: &mut Option<JoinHandle<VisonicPanel>>) -> Result<VisonicPanel, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stop,
    Reload,
}

struct Signals {
    hangup: Signal,
    terminate: Signal,
}

impl Signals {
    fn install() -> Result<Self> {
        Ok(Self { hangup: signal(SignalKind::hangup())?, terminate: signal(SignalKind::terminate())? })
    }

    async fn wait(&mut self) -> Exit {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received");
                Exit::Stop
            }
            _ = self.terminate.recv() => {
                info!("SIGTERM received");
                Exit::Stop
            }
            _ = self.hangup.recv() => {
                info!("SIGHUP received, reloading");
                Exit::Reload
            }
        }
    }
}

/// Run the bridge until a signal arrives. The panel is reconnected whenever
/// its session suspends.
async fn run_session(config: &FileConfig, signals: &mut Signals) -> Result<Exit> {
    let settings = Arc::new(SessionSettings::from_file(config)?);
    let (broker_host, broker_port) = broker_address(&config.mqtt.url)?;
    let mut options = MqttOptions::new(&config.mqtt.client_id, broker_host, broker_port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut mqtt) = AsyncClient::new(options, 64);
    let command_topic = config.mqtt.command_topic.clone();
    let out = Publisher { client: client.clone(), topic: config.mqtt.state_topic.clone() };

    let mut snapshots = interval(Duration::from_secs(config.mqtt.snapshot_interval_secs.max(1)));
    snapshots.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut panel: Option<VisonicPanel> = None;
    let mut events: Option<EventReceiver> = None;
    let mut connecting = Some(tokio::spawn(connect_panel(Arc::clone(&settings))));

    info!("Bridge running; SIGHUP reloads, SIGINT/SIGTERM stop");
    let exit = loop {
        tokio::select! {
            joined = connected(&mut connecting) => {
                connecting = None;
                match joined {
                    Ok(p) => {
                        info!("Panel session started");
                        events = Some(p.subscribe());
                        panel = Some(p);
                    }
                    Err(e) => {
                        error!("Panel connect task failed: {e}");
                        connecting = Some(tokio::spawn(connect_panel(Arc::clone(&settings))));
                    }
                }
            }
            event = next_event(&mut events) => match event {
                Ok(PanelEvent::Suspended) | Err(RecvError::Closed) => {
                    warn!("Panel session ended, reconnecting");
                    if let Some(mut old) = panel.take() {
                        old.shutdown().await;
                    }
                    events = None;
                    connecting = Some(tokio::spawn(connect_panel(Arc::clone(&settings))));
                }
                Ok(event) => {
                    if let Some(p) = &panel {
                        forward_event(event, p, &out, &settings).await;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Dropped {n} panel events"),
            },
            polled = mqtt.poll() => match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // Subscriptions do not survive a broker reconnect
                    info!("MQTT connected, subscribing to {command_topic}");
                    if let Err(e) = client.subscribe(&command_topic, QoS::AtLeastOnce).await {
                        error!("Subscribe to {command_topic} failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(message))) if message.topic == command_topic => {
                    handle_message(&message.payload, panel.as_ref(), &out, &settings).await;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {e}");
                    sleep(Duration::from_secs(1)).await;
                }
            },
            _ = snapshots.tick() => {
                if let Some(p) = &panel {
                    out.snapshot(take_snapshot(p, &settings).await).await;
                }
            }
            exit = signals.wait() => break exit,
        }
    };

    if let Some(task) = connecting {
        task.abort();
    }
    if let Some(mut p) = panel {
        p.shutdown().await;
    }
    if let Err(e) = client.disconnect().await {
        debug!("MQTT disconnect: {e}");
    }
    Ok(exit)
}

fn init_logging() {
    // RUST_LOG overrides, e.g. RUST_LOG=visonic_bridge=trace
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // journald stamps lines itself
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let mut config = FileConfig::load(&args.config)?;
    let mut signals = Signals::install()?;

    while run_session(&config, &mut signals).await? == Exit::Reload {
        match FileConfig::load(&args.config) {
            Ok(fresh) => {
                info!("Configuration reloaded from {}", args.config.display());
                config = fresh;
            }
            Err(e) => warn!("Keeping previous configuration: {e:#}"),
        }
    }

    info!("Stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<FileConfig> {
        Ok(toml::from_str(text)?)
    }

    #[test]
    fn test_broker_address() {
        assert_eq!(broker_address("mqtt://broker:1883").unwrap(), ("broker".to_string(), 1883));
        assert_eq!(broker_address("tcp://10.0.0.2:8883").unwrap(), ("10.0.0.2".to_string(), 8883));
        assert_eq!(broker_address("broker:1").unwrap(), ("broker".to_string(), 1));
        assert!(broker_address("mqtt://broker").is_err());
        assert!(broker_address("mqtt://broker:notaport").is_err());
        assert!(broker_address("ws://broker:80").is_err());
        assert!(broker_address("mqtt://:1883").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = parse(
            r#"
            [panel]
            host = "192.168.0.50"

            [zone_names]
            "3" = "Back door"
            "#,
        )
        .unwrap();
        assert_eq!(config.panel.port, 10628);
        assert_eq!(config.panel.download_code, "5650");
        assert!(config.panel.auto_sync_time);
        assert!(config.panel.send_init);
        assert_eq!(config.panel.siren_trigger_list, vec!["intruder"]);
        assert_eq!(config.mqtt.state_topic, "visonic");
        assert_eq!(config.mqtt.command_topic, "visonic/cmd");
        assert_eq!(config.zone_names.get(&3).map(String::as_str), Some("Back door"));
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let config = parse("[panel]\nhost = \"panel\"\ndownload_code = \"56\"\n").unwrap();
        assert!(config.check().is_err());

        let config = parse("[panel]\nport = 10628\n").unwrap();
        assert!(config.check().is_err());

        assert!(parse("[panel]\nhost = \"panel\"\n[zone_names]\nfront = \"Front door\"\n").is_err());
    }

    #[test]
    fn test_zone_label() {
        let config = parse("[panel]\nhost = \"panel\"\n[zone_names]\n\"2\" = \"Garage\"\n").unwrap();
        let settings = SessionSettings::from_file(&config).unwrap();
        assert_eq!(settings.zone_label(2, "Kitchen"), "Garage");
        assert_eq!(settings.zone_label(1, "Kitchen"), "Kitchen");
        assert_eq!(settings.zone_label(5, ""), "Zone 5");
    }

    #[test]
    fn test_zone_ops() {
        let old = SensorStatusFlags::ENROLLED | SensorStatusFlags::BYPASS;
        let new = SensorStatusFlags::ENROLLED | SensorStatusFlags::OPEN;
        let changed = SensorStatusFlags::changed(old, new);
        assert_eq!(zone_ops(changed, new), vec!["ZONE_OPEN", "ZONE_UNBYPASSED"]);
        assert!(zone_ops(SensorStatusFlags::ENROLLED, new).is_empty());
    }

    #[test]
    fn test_requests() {
        let request: Request = serde_json::from_str(r#"{"op":"X10","id":3,"state":"brighten"}"#).unwrap();
        assert_eq!(request, Request::X10 { id: 3, state: X10Command::Brighten });

        let request: Request =
            serde_json::from_str(r#"{"op":"ZONE_BYPASS_ENABLE","op_id":"7","zone":4,"pin":"1234"}"#).unwrap();
        assert_eq!(request, Request::ZoneBypassEnable { zone: 4, pin: Some("1234".into()) });
        assert_eq!(request.name(), "ZONE_BYPASS_ENABLE");

        let request: Request = serde_json::from_str(r#"{"op":"ARM_HOME_INSTANT"}"#).unwrap();
        assert_eq!(request, Request::ArmHomeInstant { pin: None });

        let request: Request = serde_json::from_str(r#"{"op":"PING","op_id":"x"}"#).unwrap();
        assert_eq!(request, Request::Ping);

        assert!(serde_json::from_str::<Request>(r#"{"op":"X10","state":"toggle"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"op":"ZONE_BYPASS_DISABLE"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"op":"SELF_DESTRUCT"}"#).is_err());
    }

    #[test]
    fn test_message_shapes() {
        let ack = Envelope { now: 1, op: "CMD_ACK", body: AckBody { success: true, src: None, data: None } };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            serde_json::json!({"now": 1, "op": "CMD_ACK", "success": true})
        );

        let condition = Envelope {
            now: 2,
            op: ConditionKind::PinRejected.name(),
            body: ConditionBody { zone: None, code: 0 },
        };
        assert_eq!(
            serde_json::to_value(&condition).unwrap(),
            serde_json::json!({"now": 2, "op": "PIN_REJECTED", "code": 0})
        );

        let zone = ZoneView {
            id: 1,
            name: "Hall".into(),
            zone_type: "Interior",
            sensor: "Motion",
            open: false,
            bypass: false,
            alarm: false,
            tamper: false,
            low_battery: true,
            triggered: false,
        };
        let value = serde_json::to_value(&zone).unwrap();
        assert_eq!(value["zoneType"], "Interior");
        assert_eq!(value["lowBattery"], true);
    }
}
