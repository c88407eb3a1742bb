//! Shared types for the delegation reconciliation pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ─── Hex helpers ─────────────────────────────────────────────────────────────

/// Encode bytes as a lowercase `0x…` hex string.
pub fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Decode a hex string (with or without `0x`) into bytes.
/// Returns `None` on odd length or non-hex characters.
pub fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

// ─── Address ─────────────────────────────────────────────────────────────────

/// A 20-byte account or contract address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const LEN: usize = 20;

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Build an address from a byte slice. Returns `None` unless exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(s).ok_or_else(|| format!("invalid hex: {s}"))?;
        Self::from_slice(&bytes).ok_or_else(|| {
            format!("address must be {} bytes, got {}", Self::LEN, bytes.len())
        })
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─── BlockHash ───────────────────────────────────────────────────────────────

/// A 32-byte block hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    pub const LEN: usize = 32;

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build a block hash from a byte slice. Returns `None` unless exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({self})")
    }
}

impl FromStr for BlockHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(s).ok_or_else(|| format!("invalid hex: {s}"))?;
        Self::from_slice(&bytes).ok_or_else(|| {
            format!("block hash must be {} bytes, got {}", Self::LEN, bytes.len())
        })
    }
}

impl Serialize for BlockHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─── TupleKey ────────────────────────────────────────────────────────────────

/// Identifies one delegation relationship's event chain:
/// (delegator, delegate, contract address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleKey {
    pub delegator: Address,
    pub delegate: Address,
    pub contract_address: Address,
}

impl fmt::Display for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.delegator, self.delegate, self.contract_address)
    }
}

// ─── DelegationEvent ─────────────────────────────────────────────────────────

/// A canonical delegation event, one per on-chain log entry. Immutable.
///
/// `expiry_date == 0` marks a revocation; `old_expiry_date == 0` marks
/// "no prior delegation existed". The full field set is the uniqueness key
/// that makes redelivery idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegationEvent {
    pub delegator: Address,
    pub delegate: Address,
    pub contract_address: Address,
    pub host_chain_id: u64,
    pub delegation_counter: u64,
    pub old_expiry_date: u64,
    pub expiry_date: u64,
    pub block_number: u64,
    pub block_hash: BlockHash,
    pub transaction_id: Option<Vec<u8>>,
}

impl DelegationEvent {
    /// The (delegator, delegate, contract) key this event chains under.
    pub fn tuple(&self) -> TupleKey {
        TupleKey {
            delegator: self.delegator,
            delegate: self.delegate,
            contract_address: self.contract_address,
        }
    }

    /// Returns `true` if this event revokes the delegation.
    pub fn is_revocation(&self) -> bool {
        self.expiry_date == 0
    }
}

// ─── ChainHead ───────────────────────────────────────────────────────────────

/// Last known canonical head of a host chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub block_number: u64,
    pub block_hash: BlockHash,
}

// ─── Finality ────────────────────────────────────────────────────────────────

/// Finality classification of a stored row's containing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Finality {
    /// Within the confirmation window; may still be reorged out.
    Provisional,
    /// At or behind the finalized height; participates in the authoritative projection.
    Final,
}

impl Finality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisional => "provisional",
            Self::Final => "final",
        }
    }
}

impl fmt::Display for Finality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Finality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisional" => Ok(Self::Provisional),
            "final" => Ok(Self::Final),
            other => Err(format!("unknown finality: {other}")),
        }
    }
}

// ─── DelegationState ─────────────────────────────────────────────────────────

/// Current delegation state for one tuple, derived by folding accepted events.
/// Never the source of truth — the event log is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationState {
    /// Counter of the last applied event (0 = no history).
    pub last_counter: u64,
    /// Expiry of the current delegation (epoch seconds; 0 after a revocation).
    pub expiry: u64,
    /// Set when the last applied event was a revocation.
    pub revoked: bool,
}

impl DelegationState {
    /// Advance the state with an accepted event.
    pub fn apply(&mut self, event: &DelegationEvent) {
        self.last_counter = event.delegation_counter;
        self.expiry = event.expiry_date;
        self.revoked = event.is_revocation();
    }

    /// Returns `true` if the delegation grants access at `epoch` seconds.
    /// A revoked delegation is never effective, regardless of wall clock.
    pub fn is_effective_at(&self, epoch: u64) -> bool {
        !self.revoked && self.last_counter > 0 && self.expiry > epoch
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
