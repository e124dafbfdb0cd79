//! Entity capability traits and the payload codec.
//!
//! Entities are stored as JSON: self-describing, stable across field
//! reordering, and cheap to inspect in fixtures and logs. The state machine
//! only ever needs the id (and for time-series records, the timestamp), which
//! these traits expose without reflection.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// A record addressable by a `u64` id.
pub trait KeyValueEntity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The record's identifier. Zero means "not yet assigned".
    fn identifier(&self) -> u64;

    /// Sets the identifier, typically right before the first save.
    fn set_identifier(&mut self, id: u64);
}

/// A record that additionally carries an indexed timestamp.
pub trait TimeSeriesEntity: KeyValueEntity {
    /// Micro-second timestamp this record is indexed under.
    fn timestamp(&self) -> u64;

    /// Sets the timestamp; assigned by the gateway at save time.
    fn set_timestamp(&mut self, ts: u64);
}

/// Serializes an entity to its stored payload form.
pub fn to_payload<E: KeyValueEntity>(entity: &E) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(entity)?)
}

/// Deserializes a stored payload back into an entity.
pub fn from_payload<E: KeyValueEntity>(bytes: &[u8]) -> Result<E> {
    Ok(serde_json::from_slice(bytes)?)
}
