use crate::error::{Error, Result};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Format of the key timestamp token: `YYYYMMDDHHMMSS`, UTC.
const KEY_TOKEN_FORMAT: &str = "%Y%m%d%H%M%S";

/// A point in time, as milliseconds since the UNIX epoch (UTC).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    millis: i64,
}

impl Timestamp {
    pub fn from_millis(millis: i64) -> Timestamp {
        Timestamp { millis }
    }

    pub fn from_sec(sec: i64) -> Timestamp {
        Timestamp {
            millis: sec.saturating_mul(1000),
        }
    }

    /// The current system time.
    pub fn now() -> Timestamp {
        Timestamp {
            millis: Utc::now().timestamp_millis(),
        }
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    /// Milliseconds elapsed from `earlier` to `self`. Negative if `earlier` is in the future.
    pub fn millis_since(&self, earlier: Timestamp) -> i64 {
        self.millis.saturating_sub(earlier.millis)
    }

    pub fn plus_millis(self, millis: i64) -> Timestamp {
        Timestamp {
            millis: self.millis.saturating_add(millis),
        }
    }

    pub fn plus_secs(self, secs: i64) -> Timestamp {
        self.plus_millis(secs.saturating_mul(1000))
    }

    /// Render as the fixed-width `YYYYMMDDHHMMSS` string used to tag published keys.
    pub fn key_token(&self) -> Result<String> {
        Utc.timestamp_millis_opt(self.millis)
            .single()
            .map(|t| t.format(KEY_TOKEN_FORMAT).to_string())
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "timestamp {}ms can't be rendered as a calendar date",
                    self.millis
                ))
            })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.millis)
    }
}
