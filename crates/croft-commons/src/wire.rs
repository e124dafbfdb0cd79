//! Wire types flowing through the replicated log and the lookup path.
//!
//! Proposals and queries are framed with bincode; entity payloads inside a
//! proposal stay JSON (see [`crate::entity`]) so the state machine can
//! extract ids and timestamps without knowing the full schema version.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Encodes any serde value with the standard bincode configuration.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

/// Decodes any serde value with the standard bincode configuration.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// The two mutation kinds a replicated log entry can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalOp {
    Update,
    Delete,
}

/// A mutation proposed through consensus. `data` is the JSON entity payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub op: ProposalOp,
    pub data: Vec<u8>,
}

impl Proposal {
    pub fn update(data: Vec<u8>) -> Self {
        Proposal { op: ProposalOp::Update, data }
    }

    pub fn delete(data: Vec<u8>) -> Self {
        Proposal { op: ProposalOp::Delete, data }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Scan direction for paged queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A page request. Pages are 1-based; page 0 is coerced to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub page: u64,
    pub page_size: u64,
    pub sort_order: SortOrder,
}

impl PageQuery {
    pub fn new(page: u64, page_size: u64, sort_order: SortOrder) -> Self {
        PageQuery { page, page_size, sort_order }
    }

    /// The scan offset of the first record on this page.
    pub fn offset(&self) -> u64 {
        (self.page.max(1) - 1) * self.page_size
    }
}

/// The lookup shapes every state machine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Query {
    /// Point lookup by entity id.
    Get(u64),
    /// Paged scan in key (or timestamp) order.
    Page(PageQuery),
    /// Number of live entities, excluding index keys and the sentinel.
    Count,
}

/// A page of raw entity payloads, before typed decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPage {
    pub entities: Vec<Vec<u8>>,
    /// True when at least one more record exists past this page.
    pub has_more: bool,
}

/// The result of a [`Query`], mirroring its shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryResult {
    Value(Option<Vec<u8>>),
    Page(RawPage),
    Count(u64),
}

/// Read consistency selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Serve from the local replica without a read barrier. May lag.
    Local,
    /// Linearizable read through the leader's read index.
    Quorum,
}
