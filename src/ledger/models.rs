use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger id 0 is an unused sentinel slot; real items start at 1.
pub const SENTINEL_ITEM_ID: u64 = 0;

/// Match status value meaning "not matched"
pub const UNMATCHED: u64 = 0;

/// A lost-or-found report as stored on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    /// Reporter address, opaque to the agent
    pub reporter: String,
    pub is_lost: bool,
    pub title: String,
    pub description: String,
    /// Content address of an off-ledger image blob
    pub content_ref: Option<String>,
}

/// Point-in-time partition of the unmatched items, id ascending.
///
/// Built fresh for every run and dropped at its end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub unmatched_lost: Vec<Item>,
    pub unmatched_found: Vec<Item>,
    /// Item count reported by the ledger when the snapshot was taken
    pub item_count: u64,
}

impl Snapshot {
    pub fn has_candidates(&self) -> bool {
        !self.unmatched_lost.is_empty() && !self.unmatched_found.is_empty()
    }
}

/// Oracle confidence tiers, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Only the top tier may be committed
    pub const ACCEPTED: Confidence = Confidence::High;

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A proposed match awaiting commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CandidatePair {
    pub lost_id: u64,
    pub found_id: u64,
    pub confidence: Confidence,
}

/// Signed `recordMatch` submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedMatch {
    pub contract: String,
    pub lost_id: u64,
    pub found_id: u64,
    pub nonce: u64,
    /// Hex-encoded ed25519 verifying key
    pub public_key: String,
    /// Hex-encoded ed25519 signature over the submission digest
    pub signature: String,
}

/// Lifecycle of a submitted ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Notifications emitted by the ledger contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    ItemReported { id: u64 },
    MatchFound { lost_id: u64, found_id: u64 },
}

/// Connection mode, selected from the endpoint scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Streaming,
    Polling,
}

impl ConnectionMode {
    pub fn for_endpoint(url: &str) -> Self {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            ConnectionMode::Streaming
        } else {
            ConnectionMode::Polling
        }
    }
}
