use crate::LifecycleId;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Fatal = 1,
    Error = 2,
    Warn = 3,
    Info = 4,
    Debug = 5,
    Verbose = 6,
}

impl LogLevel {
    pub fn from_mtin(mtin: u8) -> Option<Self> {
        Some(match mtin {
            1 => Self::Fatal,
            2 => Self::Error,
            3 => Self::Warn,
            4 => Self::Info,
            5 => Self::Debug,
            6 => Self::Verbose,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Verbose => "verbose",
        }
    }
}

/// Message type and info, as carried in the DLT extended header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Log(LogLevel),
    AppTrace(u8),
    NwTrace(u8),
    Control(u8),
    Unknown { mstp: u8, mtin: u8 },
}

impl MessageClass {
    pub fn from_wire(mstp: u8, mtin: u8) -> Self {
        match mstp {
            0 => match LogLevel::from_mtin(mtin) {
                Some(level) => Self::Log(level),
                None => Self::Unknown { mstp, mtin },
            },
            1 => Self::AppTrace(mtin),
            2 => Self::NwTrace(mtin),
            3 => Self::Control(mtin),
            _ => Self::Unknown { mstp, mtin },
        }
    }

    pub fn mstp(&self) -> u8 {
        match self {
            Self::Log(_) => 0,
            Self::AppTrace(_) => 1,
            Self::NwTrace(_) => 2,
            Self::Control(_) => 3,
            Self::Unknown { mstp, .. } => *mstp,
        }
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        match self {
            Self::Log(level) => Some(*level),
            _ => None,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log(level) => f.write_str(level.as_str()),
            Self::AppTrace(mtin) => write!(f, "app_trace:{mtin}"),
            Self::NwTrace(mtin) => write!(f, "nw_trace:{mtin}"),
            Self::Control(mtin) => write!(f, "control:{mtin}"),
            Self::Unknown { mstp, mtin } => write!(f, "unknown:{mstp}/{mtin}"),
        }
    }
}

/// One decoded log record. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// Index in the original (unfiltered) recording.
    pub index: u32,
    pub reception_time_us: u64,
    /// Device timestamp in 0.1 ms units, relative to its lifecycle.
    pub timestamp_dms: u32,
    /// Weak reference into the session's lifecycle table.
    pub lifecycle: Option<LifecycleId>,
    pub ecu: String,
    pub apid: String,
    pub ctid: String,
    pub class: MessageClass,
    pub verbose: bool,
    pub payload: String,
}

impl Record {
    pub fn log_level(&self) -> Option<LogLevel> {
        self.class.log_level()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {:>10.4} {:<4} {:<4} {:<4} {:<7} {}",
            self.index,
            self.timestamp_dms as f64 / 10_000.0,
            self.ecu,
            self.apid,
            self.ctid,
            self.class,
            self.payload
        )
    }
}
