//! Observable counters (§6): a typed snapshot rather than a packed ABI
//! buffer, since nothing outside this process reads it over the wire.

use uuid::Uuid;

use crate::cert::CertStats;
use crate::gcache::GCacheStats;
use crate::gsn::{Gsn, UNDEFINED};
use crate::monitor::MonitorStats;

/// A point-in-time snapshot of everything the replicator tracks.
#[derive(Debug, Clone)]
pub struct ReplicatorStats {
    pub state_uuid: Uuid,
    pub protocol_version: i32,
    pub last_applied: Gsn,
    pub last_committed: Gsn,

    pub replicated_count: u64,
    pub replicated_keys: u64,
    pub replicated_data_bytes: u64,
    pub replicated_other_bytes: u64,

    pub received_count: u64,
    pub received_bytes: u64,

    pub local_commits: u64,
    pub local_cert_failures: u64,
    pub local_replays: u64,

    pub local_send_queue_len: usize,
    pub local_send_queue_avg: f64,
    pub local_recv_queue_len: usize,
    pub local_recv_queue_avg: f64,

    pub flow_control_paused_ns: u64,
    pub flow_control_sent_pause: u64,
    pub flow_control_sent_resume: u64,

    pub local: MonitorStats,
    pub apply: MonitorStats,
    pub commit: MonitorStats,

    pub cert: CertStats,
    pub cert_index_size: usize,

    pub gcache: GCacheStats,

    pub open_transactions: usize,
    pub open_connections: usize,

    pub extended: Option<ExtendedStats>,
}

impl Default for ReplicatorStats {
    fn default() -> Self {
        Self {
            state_uuid: Uuid::nil(),
            protocol_version: 1,
            last_applied: UNDEFINED,
            last_committed: UNDEFINED,
            replicated_count: 0,
            replicated_keys: 0,
            replicated_data_bytes: 0,
            replicated_other_bytes: 0,
            received_count: 0,
            received_bytes: 0,
            local_commits: 0,
            local_cert_failures: 0,
            local_replays: 0,
            local_send_queue_len: 0,
            local_send_queue_avg: 0.0,
            local_recv_queue_len: 0,
            local_recv_queue_avg: 0.0,
            flow_control_paused_ns: 0,
            flow_control_sent_pause: 0,
            flow_control_sent_resume: 0,
            local: MonitorStats::default(),
            apply: MonitorStats::default(),
            commit: MonitorStats::default(),
            cert: CertStats::default(),
            cert_index_size: 0,
            gcache: GCacheStats::default(),
            open_transactions: 0,
            open_connections: 0,
            extended: None,
        }
    }
}

/// Stats beyond the core set, gated behind the `extended-stats` feature
/// (§9 Open Question): causal-read counts and IST donor/receiver progress,
/// which most deployments never query and which would otherwise add
/// always-on bookkeeping cost to the hot path.
#[cfg(feature = "extended-stats")]
#[derive(Debug, Clone, Default)]
pub struct ExtendedStats {
    pub causal_reads: u64,
    pub ist_receive_current_gsn: Gsn,
    pub ist_receive_total: u64,
    pub incoming_addresses: Vec<String>,
}

#[cfg(not(feature = "extended-stats"))]
#[derive(Debug, Clone, Default)]
pub struct ExtendedStats {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_snapshot_has_no_extended_stats() {
        let stats = ReplicatorStats::default();
        assert!(stats.extended.is_none());
        assert_eq!(stats.last_applied, UNDEFINED);
    }
}
