use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

/// Sampling granularity of the stored history.
#[derive(
    Copy, Clone, Debug, Eq, Hash, PartialEq, Deserialize, Serialize, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum TimeInterval {
    #[display("second")]
    Second,

    #[display("minute")]
    Minute,

    #[display("hour")]
    Hour,

    #[display("day")]
    Day,
}

impl TimeInterval {
    #[must_use]
    pub const fn seconds(self) -> u32 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3600,
            Self::Day => 86400,
        }
    }

    #[must_use]
    pub fn duration(self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.seconds()))
    }

    /// Value-less query flag selecting the granularity in the XML API.
    #[must_use]
    pub const fn xml_flag(self) -> &'static str {
        match self {
            Self::Second => "S",
            Self::Minute => "m",
            Self::Hour => "h",
            Self::Day => "d",
        }
    }
}
