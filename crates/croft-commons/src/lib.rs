//! Shared building blocks for the croft replicated entity store.
//!
//! This crate carries everything the storage and consensus crates agree on:
//! the identifier service, the key codec, entity capability traits, the
//! proposal/query wire types, the unified error domain, the record families
//! and the well-known table registry.

pub mod entity;
pub mod error;
pub mod ids;
pub mod keys;
pub mod models;
pub mod tables;
pub mod wire;

pub use entity::{from_payload, to_payload, KeyValueEntity, TimeSeriesEntity};
pub use error::{Error, Result};
pub use wire::{
    decode, encode, Consistency, PageQuery, Proposal, ProposalOp, Query, QueryResult, RawPage,
    SortOrder,
};
