//! Record families stored in the well-known tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::{KeyValueEntity, TimeSeriesEntity};
use crate::ids;

macro_rules! impl_key_value_entity {
    ($ty:ty) => {
        impl KeyValueEntity for $ty {
            fn identifier(&self) -> u64 {
                self.id
            }
            fn set_identifier(&mut self, id: u64) {
                self.id = id;
            }
        }
    };
}

macro_rules! impl_time_series_entity {
    ($ty:ty) => {
        impl TimeSeriesEntity for $ty {
            fn timestamp(&self) -> u64 {
                self.timestamp
            }
            fn set_timestamp(&mut self, ts: u64) {
                self.timestamp = ts;
            }
        }
    };
}

/// An access role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: u64,
    pub name: String,
}

impl Role {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Role { id, name: name.into() }
    }
}

impl_key_value_entity!(Role);

/// A customer record, content-addressed by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: u64,
    pub email: String,
    pub name: String,
}

impl Customer {
    /// Builds a customer whose id derives deterministically from the email,
    /// so a lookup by email needs no secondary index.
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        let email = email.into();
        Customer { id: Self::id_for_email(&email), email, name: name.into() }
    }

    pub fn id_for_email(email: &str) -> u64 {
        ids::id_from_str(email)
    }
}

impl_key_value_entity!(Customer);

/// A processing algorithm definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Algorithm {
    pub id: u64,
    pub name: String,
}

impl Algorithm {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Algorithm { id, name: name.into() }
    }
}

impl_key_value_entity!(Algorithm);

/// One entry in a farm's append-mostly event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: u64,
    pub timestamp: u64,
    pub farm_id: u64,
    pub event_type: String,
    pub message: String,
}

impl EventLogEntry {
    pub fn new(farm_id: u64, event_type: impl Into<String>, message: impl Into<String>) -> Self {
        EventLogEntry {
            id: 0,
            timestamp: 0,
            farm_id,
            event_type: event_type.into(),
            message: message.into(),
        }
    }
}

impl_key_value_entity!(EventLogEntry);
impl_time_series_entity!(EventLogEntry);

/// A device telemetry sample: named metric readings at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: u64,
    pub timestamp: u64,
    pub device_id: u64,
    pub metrics: BTreeMap<String, f64>,
}

impl DeviceState {
    pub fn new(device_id: u64) -> Self {
        DeviceState { id: 0, timestamp: 0, device_id, metrics: BTreeMap::new() }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

impl_key_value_entity!(DeviceState);
impl_time_series_entity!(DeviceState);

/// A farm's live runtime state, published through a concurrent group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmState {
    pub id: u64,
    pub running: bool,
    pub updated_at: u64,
}

impl FarmState {
    pub fn new(farm_id: u64, running: bool) -> Self {
        FarmState { id: farm_id, running, updated_at: ids::next_micros() }
    }
}

impl_key_value_entity!(FarmState);
