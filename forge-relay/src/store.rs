use crate::claims::RoutingMetadata;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

/// An independent credential ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// `/forge-token`, stores the bare credential.
    Legacy,
    /// `/forge-token-2`, stores the credential plus its routing claims.
    Successor,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Legacy => "legacy",
            Channel::Successor => "successor",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Channel::Legacy),
            "successor" => Ok(Channel::Successor),
            other => Err(Error::InvalidConfig(format!("unknown channel: {}", other))),
        }
    }
}

/// A credential about to be appended to a ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewCredential {
    Legacy { value: String },
    Routed { value: String, routing: RoutingMetadata },
}

impl NewCredential {
    pub fn channel(&self) -> Channel {
        match self {
            NewCredential::Legacy { .. } => Channel::Legacy,
            NewCredential::Routed { .. } => Channel::Successor,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            NewCredential::Legacy { value } | NewCredential::Routed { value, .. } => value,
        }
    }

    /// Attach the store-assigned capture time.
    pub fn stamp(self, captured_at: DateTime<Utc>) -> CredentialRecord {
        match self {
            NewCredential::Legacy { value } => {
                CredentialRecord::Legacy(LegacyRecord { value, captured_at })
            }
            NewCredential::Routed { value, routing } => CredentialRecord::Routed(RoutedRecord {
                value,
                captured_at,
                routing,
            }),
        }
    }
}

/// Ledger entry on the legacy channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRecord {
    pub value: String,
    pub captured_at: DateTime<Utc>,
}

/// Ledger entry on the successor channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedRecord {
    pub value: String,
    pub captured_at: DateTime<Utc>,
    pub routing: RoutingMetadata,
}

/// A persisted credential. Records are never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRecord {
    Legacy(LegacyRecord),
    Routed(RoutedRecord),
}

impl CredentialRecord {
    pub fn channel(&self) -> Channel {
        match self {
            CredentialRecord::Legacy(_) => Channel::Legacy,
            CredentialRecord::Routed(_) => Channel::Successor,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            CredentialRecord::Legacy(r) => &r.value,
            CredentialRecord::Routed(r) => &r.value,
        }
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        match self {
            CredentialRecord::Legacy(r) => r.captured_at,
            CredentialRecord::Routed(r) => r.captured_at,
        }
    }

    pub fn routing(&self) -> Option<&RoutingMetadata> {
        match self {
            CredentialRecord::Legacy(_) => None,
            CredentialRecord::Routed(r) => Some(&r.routing),
        }
    }
}

/// Append-only storage for captured credentials, one ledger per [`Channel`].
///
/// Implementations must be safe for concurrent use. A `most_recent` racing a
/// `record` may observe either side of the write.
#[async_trait]
pub trait CredentialLedger: Send + Sync {
    /// Append a credential to its channel's ledger, stamping it with a
    /// store-assigned capture time.
    async fn record(&self, credential: NewCredential) -> Result<CredentialRecord>;

    /// Latest record on `channel`, or `None` if nothing was captured yet.
    async fn most_recent(&self, channel: Channel) -> Result<Option<CredentialRecord>>;
}

/// Hands out capture timestamps that strictly increase within the process,
/// even when the wall clock stalls or steps backwards.
///
/// Resolution is one microsecond, matching what the sqlite backend persists.
#[derive(Debug, Default)]
pub struct LedgerClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl LedgerClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> DateTime<Utc> {
        let now = truncate_to_micros(Utc::now());
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        let stamp = match *last {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }

    /// Never hand out a stamp at or before `ts`. Used to resume after a
    /// restart from the newest persisted record.
    pub fn observe(&self, ts: DateTime<Utc>) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if last.is_none_or(|prev| prev < ts) {
            *last = Some(ts);
        }
    }
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// Process-local ledger. Contents are lost on restart.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    ledgers: Arc<RwLock<HashMap<Channel, Vec<CredentialRecord>>>>,
    clock: Arc<LedgerClock>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records on `channel`.
    pub fn len(&self, channel: Channel) -> usize {
        self.ledgers
            .read()
            .map(|l| l.get(&channel).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Snapshot of every record on `channel`, oldest first.
    pub fn records(&self, channel: Channel) -> Vec<CredentialRecord> {
        self.ledgers
            .read()
            .map(|l| l.get(&channel).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CredentialLedger for MemoryLedger {
    async fn record(&self, credential: NewCredential) -> Result<CredentialRecord> {
        let mut ledgers = self
            .ledgers
            .write()
            .map_err(|e| Error::Storage(e.to_string()))?;

        // Stamp under the write lock so append order matches timestamp order.
        let record = credential.stamp(self.clock.next());
        ledgers
            .entry(record.channel())
            .or_default()
            .push(record.clone());

        Ok(record)
    }

    async fn most_recent(&self, channel: Channel) -> Result<Option<CredentialRecord>> {
        let ledgers = self
            .ledgers
            .read()
            .map_err(|e| Error::Storage(e.to_string()))?;

        // Later insertion wins a timestamp tie.
        Ok(ledgers.get(&channel).and_then(|records| {
            records
                .iter()
                .enumerate()
                .max_by_key(|(idx, r)| (r.captured_at(), *idx))
                .map(|(_, r)| r.clone())
        }))
    }
}
