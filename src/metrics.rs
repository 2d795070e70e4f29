//! Process-wide counters for link and commit health.
//!
//! Counters are plain atomics so the codec and every connection task can bump them without
//! coordination. [`snapshot`] gives a consistent-enough view for logs and the CLI.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

static FRAMES_DECODED: AtomicU64 = AtomicU64::new(0);
static FRAMES_MALFORMED: AtomicU64 = AtomicU64::new(0);
static NOISE_BYTES: AtomicU64 = AtomicU64::new(0);
static PACKETS_SENT: AtomicU64 = AtomicU64::new(0);
static GROUPS_ACKED: AtomicU64 = AtomicU64::new(0);
static GROUPS_REJECTED: AtomicU64 = AtomicU64::new(0);
static GROUPS_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static GROUPS_LOST: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_decoded() {
    FRAMES_DECODED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_frames_malformed() {
    FRAMES_MALFORMED.fetch_add(1, Ordering::Relaxed);
}
pub fn add_noise_bytes(n: u64) {
    NOISE_BYTES.fetch_add(n, Ordering::Relaxed);
}
pub fn inc_packets_sent() {
    PACKETS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_groups_acked() {
    GROUPS_ACKED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_groups_rejected() {
    GROUPS_REJECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_groups_timed_out() {
    GROUPS_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_groups_lost() {
    GROUPS_LOST.fetch_add(1, Ordering::Relaxed);
}
pub fn observe_ack_latency(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    ACK_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub frames_decoded: u64,
    pub frames_malformed: u64,
    pub noise_bytes_skipped: u64,
    pub packets_sent: u64,
    pub commit_groups_acked: u64,
    pub commit_groups_rejected: u64,
    pub commit_groups_timed_out: u64,
    pub commit_groups_lost: u64,
    pub ack_latency_avg_ms: Option<u64>,
}

pub fn snapshot() -> Snapshot {
    let sum = ACK_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = ACK_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        frames_decoded: FRAMES_DECODED.load(Ordering::Relaxed),
        frames_malformed: FRAMES_MALFORMED.load(Ordering::Relaxed),
        noise_bytes_skipped: NOISE_BYTES.load(Ordering::Relaxed),
        packets_sent: PACKETS_SENT.load(Ordering::Relaxed),
        commit_groups_acked: GROUPS_ACKED.load(Ordering::Relaxed),
        commit_groups_rejected: GROUPS_REJECTED.load(Ordering::Relaxed),
        commit_groups_timed_out: GROUPS_TIMED_OUT.load(Ordering::Relaxed),
        commit_groups_lost: GROUPS_LOST.load(Ordering::Relaxed),
        ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
    }
}
