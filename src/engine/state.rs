//! Engine lifecycle states.

use std::fmt;

/// `Idle -> Opened -> Running -> Draining -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Opened,
    Running,
    Draining,
    Stopped,
}

impl EngineState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Opened => 1,
            Self::Running => 2,
            Self::Draining => 3,
            Self::Stopped => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Opened,
            2 => Self::Running,
            3 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Opened => "Opened",
            Self::Running => "Running",
            Self::Draining => "Draining",
            Self::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}
