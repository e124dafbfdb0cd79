//! Per-device telemetry groups.
//!
//! Each device streams its samples into its own replication group, created
//! on demand, so one chatty device never contends with another. Group ids
//! derive deterministically from the device id.

use std::sync::Arc;

use croft_commons::error::{Error, Result};
use croft_commons::ids;
use croft_commons::models::DeviceState;
use croft_commons::wire::{Consistency, PageQuery, SortOrder};

use crate::gateway::Repository;
use crate::host::NodeHost;
use crate::state_machine::TsStateMachine;

/// How many most-recent samples a history query fetches: one sample per
/// minute for 30 days.
pub const HISTORY_FETCH_LIMIT: u64 = 30 * 1440;

/// Telemetry facade over one node host.
pub struct DeviceTelemetry {
    host: Arc<NodeHost>,
}

impl DeviceTelemetry {
    pub fn new(host: Arc<NodeHost>) -> Self {
        DeviceTelemetry { host }
    }

    /// The replication group id backing `device_id`'s telemetry stream.
    pub fn group_id(device_id: u64) -> u64 {
        ids::telemetry_group_id(device_id)
    }

    /// Makes sure the device's group exists on this host, creating it with
    /// a time-series state machine when absent. Returns the group id.
    pub async fn ensure_group(&self, device_id: u64, join: bool) -> Result<u64> {
        let cluster_id = Self::group_id(device_id);
        if !self.host.has_group(cluster_id) {
            self.host
                .create_on_disk_group(cluster_id, join, |ctx| {
                    Ok(Arc::new(TsStateMachine::<DeviceState>::new(ctx.cluster_id, ctx.dir)))
                })
                .await?;
        }
        Ok(cluster_id)
    }

    /// Typed repository for the device's stream. The group must exist.
    pub fn repository(&self, device_id: u64) -> Repository<DeviceState> {
        Repository::new(Self::group_id(device_id), self.host.clone())
    }

    /// Records a sample, stamping it with the monotonic clock.
    pub async fn record(&self, device_id: u64, state: &mut DeviceState) -> Result<()> {
        self.repository(device_id).save_with_time_series_index(state).await
    }

    /// Values of one metric across the most recent samples, newest first.
    ///
    /// Fetches up to [`HISTORY_FETCH_LIMIT`] records in descending timestamp
    /// order; the nominal 30-day boundary is not enforced. Samples missing
    /// the metric are skipped; if no sample carries it the result is
    /// [`Error::MetricKeyNotFound`].
    pub async fn metric_history(
        &self,
        device_id: u64,
        metric: &str,
        consistency: Consistency,
    ) -> Result<Vec<f64>> {
        let page = self
            .repository(device_id)
            .get_page(PageQuery::new(1, HISTORY_FETCH_LIMIT, SortOrder::Desc), consistency)
            .await?;
        let mut values = Vec::new();
        let mut seen = false;
        for state in &page.entities {
            if let Some(value) = state.metrics.get(metric) {
                values.push(*value);
                seen = true;
            }
        }
        if !seen {
            return Err(Error::MetricKeyNotFound(metric.to_string()));
        }
        Ok(values)
    }
}
