// MIT License - Copyright (c) 2021 TJForc
//
//! # visonic-bridge
//!
//! Protocol engine for Visonic PowerMax and PowerMaster alarm panels,
//! spoken over the panel's RS-232 port (usually via a serial-to-ethernet
//! bridge).
//!
//! The engine downloads the panel EPROM, enrolls as a Powerlink module and
//! keeps a live model of the panel, its sensors and its switches. If the
//! panel refuses Powerlink it falls back to Standard mode and keeps going
//! with reduced functionality.
//!
//! [`PanelComm`] is the sans-IO core: feed it bytes and clock ticks, and it
//! writes PDUs to a [`ByteSink`]. [`VisonicPanel`] wraps it with tokio
//! tasks and a TCP transport.
//!
//! ## Quick Start
//!
//! ```no_run
//! use visonic_bridge::{ArmMode, PanelConfig, PanelEvent, VisonicPanel};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PanelConfig::builder()
//!         .download_code("5650")
//!         .siren_trigger_list(["intruder", "fire"])
//!         .build();
//!
//!     let mut panel = VisonicPanel::connect("192.168.0.50", 10628, config).await?;
//!
//!     let mut events = panel.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let PanelEvent::ModeChanged { new, .. } = event {
//!                 println!("Mode: {new}");
//!             }
//!         }
//!     });
//!
//!     panel.arm(ArmMode::Home, Some("1234")).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     panel.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod comm;
pub mod config;
pub mod constants;
pub mod devices;
mod dispatch;
pub mod eprom;
pub mod error;
pub mod event;
pub mod mode;
pub mod panel;
pub mod protocol;
pub mod transport;
pub mod watchdog;

// Re-exports for convenience
pub use comm::PanelComm;
pub use config::{ArmMode, ConfigUpdate, PanelConfig, PanelConfigBuilder, TimingConfig};
pub use devices::sensor::{Sensor, SensorCatalog, SensorStatusFlags, SensorType};
pub use devices::switch::{Switch, SwitchKind};
pub use devices::system::{ArmState, PanelStatus, SystemFlags};
pub use error::{Result, VisonicError};
pub use event::{ConditionKind, EventLogEntry, EventReceiver, PanelCondition, PanelEvent};
pub use mode::Mode;
pub use panel::VisonicPanel;
pub use protocol::X10Command;
pub use transport::{ByteSink, ChannelSink, SinkMessage};
