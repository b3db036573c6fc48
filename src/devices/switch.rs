// MIT License - Copyright (c) 2021 TJForc

/// Kind of switchable output.
///
/// Device 0 is the panel's own PGM output; 1..=15 are X10 units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchKind {
    Pgm,
    X10,
}

impl SwitchKind {
    pub fn for_id(id: u32) -> Self {
        if id == 0 { Self::Pgm } else { Self::X10 }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Pgm => "PGM",
            Self::X10 => "X10",
        }
    }
}

/// A PGM or X10 switch device.
#[derive(Debug, Clone)]
pub struct Switch {
    pub id: u32,
    pub kind: SwitchKind,
    /// Location name taken from the zone-name table
    pub location: String,
    pub enabled: bool,
    pub state: bool,
    pub first_status: bool,
}

impl Switch {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            kind: SwitchKind::for_id(id),
            location: String::new(),
            enabled: false,
            state: false,
            first_status: true,
        }
    }

    /// Update from the X10 bitmap. Returns the new state if it changed
    /// (the first report only seeds the state).
    pub fn update_state(&mut self, on: bool) -> Option<bool> {
        let prev = self.state;
        self.state = on;
        if self.first_status {
            self.first_status = false;
            return None;
        }
        (prev != on).then_some(on)
    }
}
