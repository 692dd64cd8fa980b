//! Periodic connection and bandwidth report.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::info;

use crate::{
    cancel::CancelToken,
    config::MIN_STATS_INTERVAL,
    network::{BandwidthTotals, NetworkHost},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
/// Connected peers and bandwidth at a point in time.
pub struct StatsSnapshot {
    pub connected_peers: usize,
    pub bandwidth: BandwidthTotals,
}

impl StatsSnapshot {
    pub(crate) fn collect(host: &dyn NetworkHost) -> Self {
        Self {
            connected_peers: host.peers().len(),
            bandwidth: host.bandwidth(),
        }
    }
}

/// Log a [StatsSnapshot] every `interval`, at least [MIN_STATS_INTERVAL],
/// until `cancel` is cancelled. Returns the number of reports.
pub(crate) fn run(host: Arc<dyn NetworkHost>, interval: Duration, cancel: CancelToken) -> usize {
    let interval = interval.max(MIN_STATS_INTERVAL);
    let mut reports = 0;

    while !cancel.wait_timeout(interval) {
        report(host.as_ref());
        reports += 1;
    }

    info!("Stopping stats service");

    reports
}

fn report(host: &dyn NetworkHost) -> StatsSnapshot {
    let stats = StatsSnapshot::collect(host);
    let bandwidth = stats.bandwidth;

    info!(
        connected_peers = stats.connected_peers,
        total_in = bandwidth.total_in,
        total_out = bandwidth.total_out,
        rate_in = bandwidth.rate_in,
        rate_out = bandwidth.rate_out,
        "Network stats"
    );

    stats
}
