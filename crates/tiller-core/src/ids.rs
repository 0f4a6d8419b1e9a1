//! Time-sortable identifiers for actions and alerts.
//!
//! A `TimeId` is a millisecond timestamp paired with a random UUID, rendered
//! as `<millis>_<uuid>`. Ordering is by timestamp first, UUID second, so a
//! `BTreeMap<TimeId, _>` iterates in creation order and `.rev()` gives
//! newest-first listings.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TillerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeId {
    millis: i64,
    uuid: Uuid,
}

impl TimeId {
    pub fn now() -> Self {
        TimeId {
            millis: Utc::now().timestamp_millis(),
            uuid: Uuid::new_v4(),
        }
    }

    /// Rebuild an id from its parts (used when replaying audit records).
    pub fn from_parts(millis: i64, uuid: Uuid) -> Self {
        TimeId { millis, uuid }
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.millis
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for TimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.millis, self.uuid)
    }
}

impl FromStr for TimeId {
    type Err = TillerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, uuid) = s
            .split_once('_')
            .ok_or_else(|| TillerError::InvalidId(s.to_string()))?;
        let millis = millis
            .parse::<i64>()
            .map_err(|_| TillerError::InvalidId(s.to_string()))?;
        let uuid = Uuid::parse_str(uuid).map_err(|_| TillerError::InvalidId(s.to_string()))?;
        Ok(TimeId { millis, uuid })
    }
}

impl TryFrom<String> for TimeId {
    type Error = TillerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeId> for String {
    fn from(id: TimeId) -> String {
        id.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
