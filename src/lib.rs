//! RepCore - synchronous multi-master replication core.
//!
//! A certification-based replication engine: a ring-buffer writeset cache,
//! GSN-ordered monitors, a certification index, and a transaction FSM,
//! driven by a replicator that sits between the database and the
//! group-communication layer.

pub mod cert;
pub mod error;
pub mod gcache;
pub mod gsn;
pub mod monitor;
pub mod replicator;
pub mod stats;
pub mod trx;
pub mod writeset;

pub use error::{RepError, Result};
pub use gsn::Gsn;

use std::path::PathBuf;

/// Tuning knobs for a [`replicator::Replicator`] instance.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Path to the memory-mapped ring-buffer cache file.
    pub gcache_path: PathBuf,
    /// Total size in bytes of the ring-buffer cache, including the
    /// preamble and header.
    pub gcache_size: usize,
    /// Maximum number of in-flight GSNs an ordering monitor keeps
    /// bookkeeping for before it must be told to forget old slots.
    pub monitor_window: usize,
    /// Maximum span, in GSNs, that the certification index retains for
    /// conflict checking before trimming.
    pub cert_index_window: usize,
    /// Worker threads in the apply pool.
    pub apply_pool_size: usize,
    /// Local send-queue length, in bytes, at which flow control requests
    /// the group to pause.
    pub flow_control_high_watermark: usize,
    /// Local send-queue length, in bytes, at which flow control allows
    /// the group to resume.
    pub flow_control_low_watermark: usize,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            gcache_path: PathBuf::from("./gcache.db"),
            gcache_size: 128 * 1024 * 1024,
            monitor_window: 16_384,
            cert_index_window: 16_384,
            apply_pool_size: num_cpus::get().max(1),
            flow_control_high_watermark: 16 * 1024 * 1024,
            flow_control_low_watermark: 4 * 1024 * 1024,
        }
    }
}
