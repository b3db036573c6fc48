// MIT License - Copyright (c) 2021 TJForc

pub mod sensor;
pub mod switch;
pub mod system;

pub use sensor::{Sensor, SensorCatalog, SensorStatusFlags, SensorType};
pub use switch::{Switch, SwitchKind};
pub use system::{ArmState, PanelStatus, SystemFlags};
