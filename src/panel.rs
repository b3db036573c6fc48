// MIT License - Copyright (c) 2021 TJForc

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{debug, info, warn};

use crate::comm::PanelComm;
use crate::config::{ArmMode, ConfigUpdate, PanelConfig};
use crate::constants::TICK_INTERVAL;
use crate::devices::sensor::Sensor;
use crate::devices::switch::Switch;
use crate::devices::system::PanelStatus;
use crate::error::{Result, VisonicError};
use crate::event::{event_channel, EventReceiver, EventSender};
use crate::mode::Mode;
use crate::protocol::X10Command;
use crate::transport::tcp::TcpTransport;
use crate::transport::ByteSink;

type SharedComm = Arc<Mutex<PanelComm<Box<dyn ByteSink>>>>;

fn now() -> std::time::Instant {
    TokioInstant::now().into_std()
}

/// Async front end for a Visonic panel.
///
/// Drives a [`PanelComm`] from two tasks: one feeding inbound bytes, one
/// running the periodic tick and draining the send queue.
///
/// # Example
///
/// ```no_run
/// use visonic_bridge::{ArmMode, PanelConfig, VisonicPanel};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = PanelConfig::builder()
///         .download_code("5650")
///         .build();
///
///     let mut panel = VisonicPanel::connect("192.168.0.50", 10628, config).await?;
///
///     let mut events = panel.subscribe();
///     tokio::spawn(async move {
///         while let Ok(event) = events.recv().await {
///             println!("Event: {:?}", event);
///         }
///     });
///
///     panel.arm(ArmMode::Away, Some("1234")).await?;
///
///     tokio::signal::ctrl_c().await?;
///     panel.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct VisonicPanel {
    comm: SharedComm,
    event_tx: EventSender,
    wake: Arc<Notify>,
    transport: Option<TcpTransport>,
    reader_handle: Option<JoinHandle<()>>,
    driver_handle: Option<JoinHandle<()>>,
}

impl VisonicPanel {
    /// Connect over TCP (serial-to-ethernet bridge) and start the session.
    pub async fn connect(host: &str, port: u16, config: PanelConfig) -> Result<Self> {
        config.validate()?;
        let mut transport = TcpTransport::connect(host, port).await?;
        let (Some(sink), Some(inbound)) = (transport.take_sink(), transport.take_inbound()) else {
            return Err(VisonicError::Disconnected);
        };
        let mut panel = Self::start(config, sink, inbound)?;
        panel.transport = Some(transport);
        Ok(panel)
    }

    /// Start the session over any byte sink and inbound chunk channel.
    pub fn start(
        config: PanelConfig,
        sink: impl ByteSink + 'static,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<Self> {
        config.validate()?;
        let (event_tx, _event_rx) = event_channel(256);
        let sink: Box<dyn ByteSink> = Box::new(sink);
        let mut comm = PanelComm::new(config, sink, event_tx.clone());
        comm.start(now());

        let comm = Arc::new(Mutex::new(comm));
        let wake = Arc::new(Notify::new());
        let reader_handle = spawn_reader(comm.clone(), wake.clone(), inbound);
        let driver_handle = spawn_driver(comm.clone(), wake.clone());
        info!("Panel session started");

        Ok(Self {
            comm,
            event_tx,
            wake,
            transport: None,
            reader_handle: Some(reader_handle),
            driver_handle: Some(driver_handle),
        })
    }

    /// Subscribe to panel events.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    /// Feed bytes read from some other source, alongside the inbound channel.
    pub async fn receive(&self, data: &[u8]) {
        let mut comm = self.comm.lock().await;
        if !comm.is_suspended() && comm.receive(data, now()).is_some() {
            self.wake.notify_one();
        }
    }

    // --- Accessors ---

    pub async fn mode(&self) -> Mode {
        self.comm.lock().await.mode()
    }

    pub async fn is_suspended(&self) -> bool {
        self.comm.lock().await.is_suspended()
    }

    /// Snapshot of all known sensors.
    pub async fn sensors(&self) -> Vec<Sensor> {
        self.comm.lock().await.sensors().values().cloned().collect()
    }

    /// One sensor by zero-based zone index.
    pub async fn sensor(&self, id: u32) -> Option<Sensor> {
        self.comm.lock().await.sensor(id).cloned()
    }

    pub async fn switches(&self) -> Vec<Switch> {
        self.comm.lock().await.switches().values().cloned().collect()
    }

    pub async fn panel_status(&self) -> PanelStatus {
        self.comm.lock().await.panel_status().clone()
    }

    // --- Commands ---

    pub async fn arm(&self, mode: ArmMode, pin: Option<&str>) -> Result<()> {
        debug!("Arm request {:?}", mode);
        self.comm.lock().await.request_arm(mode, pin, now())?;
        self.wake.notify_one();
        Ok(())
    }

    pub async fn bypass(&self, zone: u32, bypass: bool, pin: Option<&str>) -> Result<()> {
        self.comm.lock().await.set_bypass(zone, bypass, pin, now())?;
        self.wake.notify_one();
        Ok(())
    }

    pub async fn x10(&self, id: u32, command: X10Command) -> Result<()> {
        self.comm.lock().await.set_x10(id, command, now())?;
        self.wake.notify_one();
        Ok(())
    }

    pub async fn event_log(&self, pin: Option<&str>) -> Result<()> {
        self.comm.lock().await.request_event_log(pin, now())?;
        self.wake.notify_one();
        Ok(())
    }

    /// Always fails with `NotSupported`; image transfer is not implemented.
    pub async fn request_jpeg(&self, zone: u32) -> Result<()> {
        self.comm.lock().await.request_jpeg(zone)
    }

    pub async fn update_config(&self, update: ConfigUpdate) -> Result<()> {
        self.comm.lock().await.update_config(update, now())?;
        self.wake.notify_one();
        Ok(())
    }

    /// Stop the engine and close the connection.
    pub async fn shutdown(&mut self) {
        info!("Shutting down panel session");
        self.comm.lock().await.shutdown();
        if let Some(h) = self.reader_handle.take() {
            h.abort();
        }
        if let Some(h) = self.driver_handle.take() {
            h.abort();
        }
        self.transport = None;
    }
}

impl Drop for VisonicPanel {
    fn drop(&mut self) {
        if let Some(h) = self.reader_handle.take() {
            h.abort();
        }
        if let Some(h) = self.driver_handle.take() {
            h.abort();
        }
    }
}

fn spawn_reader(
    comm: SharedComm,
    wake: Arc<Notify>,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = inbound.recv().await {
            let mut comm = comm.lock().await;
            if comm.is_suspended() {
                break;
            }
            if comm.receive(&data, now()).is_some() {
                wake.notify_one();
            }
        }
        let mut comm = comm.lock().await;
        if !comm.is_suspended() {
            warn!("Connection to panel closed");
            comm.shutdown();
        }
    })
}

fn spawn_driver(comm: SharedComm, wake: Arc<Notify>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next_tick = TokioInstant::now() + TICK_INTERVAL;
        let mut flush_at: Option<TokioInstant> = None;
        loop {
            let deadline = flush_at.map_or(next_tick, |at| at.min(next_tick));
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = wake.notified() => {}
            }
            let mut comm = comm.lock().await;
            if comm.is_suspended() {
                debug!("Driver stopping");
                break;
            }
            let next = if TokioInstant::now() >= next_tick {
                next_tick += TICK_INTERVAL;
                comm.tick(now())
            } else {
                comm.flush(now())
            };
            flush_at = next.map(TokioInstant::from_std);
        }
    })
}
