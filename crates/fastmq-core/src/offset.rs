use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Durable address of one message: the segment it lives in and its entry
/// index within that segment.
///
/// Ordering is lexicographic on `(segment_id, entry_id)`, which is the field
/// declaration order, so the derived `Ord` is the log order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Offset {
    /// Segment the entry was written to
    pub segment_id: i64,

    /// Position of the entry within its segment, gapless from 0
    pub entry_id: i64,
}

impl Offset {
    /// The very first offset of a topic's first segment
    pub const EARLIEST: Offset = Offset {
        segment_id: 0,
        entry_id: 0,
    };

    pub const fn new(segment_id: i64, entry_id: i64) -> Self {
        Self {
            segment_id,
            entry_id,
        }
    }

    /// First entry of the given segment
    pub const fn segment_start(segment_id: i64) -> Self {
        Self::new(segment_id, 0)
    }

    /// The offset directly after this one within the same segment
    pub const fn next_entry(&self) -> Self {
        Self::new(self.segment_id, self.entry_id + 1)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.entry_id)
    }
}

impl FromStr for Offset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (segment, entry) = s
            .split_once(':')
            .ok_or_else(|| format!("Offset must be <segment>:<entry>, got {}", s))?;
        let segment_id = segment
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("Invalid segment id '{}': {}", segment, e))?;
        let entry_id = entry
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("Invalid entry id '{}': {}", entry, e))?;
        Ok(Self::new(segment_id, entry_id))
    }
}
