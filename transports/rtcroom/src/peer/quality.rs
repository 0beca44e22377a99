//! Connection quality levels

use serde::{Deserialize, Serialize};

/// Quality reported by the media server, ordered by severity
///
/// Lower index means worse quality; aggregation takes the minimum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityLevel {
    HighPacketLosses = 0,
    LowPacketLosses = 1,
    #[default]
    Good = 2,
}

impl QualityLevel {
    pub fn name(&self) -> &'static str {
        match self {
            QualityLevel::HighPacketLosses => "high-packet-losses",
            QualityLevel::LowPacketLosses => "low-packet-losses",
            QualityLevel::Good => "good",
        }
    }

    pub fn index(&self) -> u8 {
        *self as u8
    }

    /// Level for a wire index; out-of-range values yield `None`
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(QualityLevel::HighPacketLosses),
            1 => Some(QualityLevel::LowPacketLosses),
            2 => Some(QualityLevel::Good),
            _ => None,
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
