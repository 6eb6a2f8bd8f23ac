use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wire format for retention deadlines, second granularity.
const KEEP_UNTIL_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, thiserror::Error)]
#[error("malformed keepUntil timestamp: {0}")]
pub struct KeepUntilParseError(String);

/// A retention deadline: content referenced with this stamp must not
/// be garbage-collected before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeepUntil(DateTime<Utc>);

impl KeepUntil {
    pub fn new(at: DateTime<Utc>) -> Self {
        // wire format carries whole seconds only; round partial
        // seconds up so the guarantee is never shortened
        let secs = at.timestamp();
        let rounded = if at.timestamp_subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        KeepUntil(Utc.timestamp_opt(rounded, 0).single().unwrap_or(at))
    }

    /// A deadline the given duration from now, rounded up to the next
    /// whole second.
    pub fn after(duration: Duration) -> Self {
        Self::new(Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn to_wire_string(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub fn parse(s: &str) -> Result<Self, KeepUntilParseError> {
        let parsed = chrono::NaiveDateTime::parse_from_str(s, KEEP_UNTIL_FORMAT)
            .map_err(|e| KeepUntilParseError(format!("{s}: {e}")))?;
        Ok(KeepUntil(Utc.from_utc_datetime(&parsed)))
    }
}

impl fmt::Display for KeepUntil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire_string())
    }
}

impl Serialize for KeepUntil {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire_string())
    }
}

impl<'de> Deserialize<'de> for KeepUntil {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        KeepUntil::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A server-issued token proving a piece of content will be retained
/// until the stamped deadline. Opaque to the client beyond the
/// timestamp; attached verbatim to calls that depend on the guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepUntilReceipt {
    #[serde(rename = "keepUntil")]
    pub keep_until: KeepUntil,
    pub signature: String,
}

/// Child receipts aggregated for a `put_node` call, aligned with the
/// node's child order (gaps allowed for children with no receipt yet).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryKeepUntilReceipt {
    pub receipts: Vec<Option<KeepUntilReceipt>>,
}

impl SummaryKeepUntilReceipt {
    pub fn new(receipts: Vec<Option<KeepUntilReceipt>>) -> Self {
        Self { receipts }
    }

    /// `None` when no child has a receipt; there is nothing to prove.
    pub fn from_children(receipts: &[Option<KeepUntilReceipt>]) -> Option<Self> {
        if receipts.iter().any(|r| r.is_some()) {
            Some(Self::new(receipts.to_vec()))
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.iter().all(|r| r.is_none())
    }

    /// Earliest deadline across the aggregated receipts; the parent's
    /// retention can be proven no further than this.
    pub fn min_keep_until(&self) -> Option<KeepUntil> {
        self.receipts
            .iter()
            .flatten()
            .map(|r| r.keep_until)
            .min()
    }
}
