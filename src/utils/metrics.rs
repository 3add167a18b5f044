//! Relay metrics for the hub.
//!
//! Every counter is an atomic so hot paths (receiver threads, the hub loop,
//! the publisher) never take a lock. Per-stream packet counts live in a
//! `DashMap` keyed by stream. `snapshot()` copies everything out for export.

use dashmap::DashMap;
use serde::Serialize;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use crate::core::protocol::StreamKind;

pub struct HubMetrics {
    started: Instant,
    commands_accepted: AtomicU64,
    commands_rejected: AtomicU64,
    statuses_relayed: AtomicU64,
    listeners_pruned: AtomicU64,
    tracked_published: AtomicU64,
    tracked_dropped: AtomicU64,
    multicast_failures: AtomicU64,
    simulated_frames: AtomicU64,
    source_switches: AtomicU64,
    packets: DashMap<StreamKind, u64>,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub commands_accepted: u64,
    pub commands_rejected: u64,
    pub statuses_relayed: u64,
    pub listeners_pruned: u64,
    pub tracked_published: u64,
    pub tracked_dropped: u64,
    pub multicast_failures: u64,
    pub simulated_frames: u64,
    pub source_switches: u64,
    pub vision_packets: u64,
    pub referee_packets: u64,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            commands_accepted: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            statuses_relayed: AtomicU64::new(0),
            listeners_pruned: AtomicU64::new(0),
            tracked_published: AtomicU64::new(0),
            tracked_dropped: AtomicU64::new(0),
            multicast_failures: AtomicU64::new(0),
            simulated_frames: AtomicU64::new(0),
            source_switches: AtomicU64::new(0),
            packets: DashMap::new(),
        }
    }

    #[inline]
    pub fn record_packet(&self, stream: StreamKind) {
        *self.packets.entry(stream).or_insert(0) += 1;
    }

    #[inline]
    pub fn record_command(&self, accepted: bool) {
        let counter = if accepted {
            &self.commands_accepted
        } else {
            &self.commands_rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_relay(&self) {
        self.statuses_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pruned(&self, count: usize) {
        self.listeners_pruned
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// One tracked frame went out on `delivered` sockets; `failed` writes were lost.
    pub fn record_tracked_published(&self, delivered: usize, failed: usize) {
        if delivered > 0 {
            self.tracked_published.fetch_add(1, Ordering::Relaxed);
        }
        self.multicast_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn record_tracked_dropped(&self) {
        self.tracked_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_simulated_frame(&self) {
        self.simulated_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_switch(&self) {
        self.source_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets(&self, stream: StreamKind) -> u64 {
        self.packets.get(&stream).map(|v| *v).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs_f64(),
            commands_accepted: self.commands_accepted.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            statuses_relayed: self.statuses_relayed.load(Ordering::Relaxed),
            listeners_pruned: self.listeners_pruned.load(Ordering::Relaxed),
            tracked_published: self.tracked_published.load(Ordering::Relaxed),
            tracked_dropped: self.tracked_dropped.load(Ordering::Relaxed),
            multicast_failures: self.multicast_failures.load(Ordering::Relaxed),
            simulated_frames: self.simulated_frames.load(Ordering::Relaxed),
            source_switches: self.source_switches.load(Ordering::Relaxed),
            vision_packets: self.packets(StreamKind::Vision),
            referee_packets: self.packets(StreamKind::Referee),
        }
    }
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self::new()
    }
}
