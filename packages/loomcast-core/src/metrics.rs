//! Metrics snapshots.

use serde::Serialize;

use crate::time::Ticks;

/// Point-in-time stream metrics, assembled under the stream lock.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamMetrics {
    /// Duration of the not-yet-uploaded window.
    pub current_view_duration: Ticks,
    /// Duration of the whole retained window.
    pub overall_view_duration: Ticks,
    /// Bytes of the not-yet-uploaded window.
    pub current_view_bytes: u64,
    /// Bytes of the whole retained window.
    pub overall_view_bytes: u64,
    /// Exponential moving average of the ingest frame rate.
    pub current_frame_rate: f64,
    /// Exponential moving average of the upload transfer rate in bytes/s.
    pub current_transfer_rate: u64,
    /// Total bytes handed to upload sessions.
    pub transferred_bytes: u64,
    /// Failed put-frame calls.
    pub put_frame_errors: u64,
    /// Frames skipped (non-key skipping and error-ACK skipping).
    pub skipped_frames: u64,
    /// Frames evicted before upload.
    pub dropped_frames: u64,
    /// Storage pressure notifications fired.
    pub storage_pressures: u64,
    /// Buffer duration pressure notifications fired.
    pub buffer_duration_pressures: u64,
    /// Latency pressure notifications fired.
    pub latency_pressures: u64,
    /// Connection staleness detections.
    pub stale_events: u64,
    /// Buffering ACKs applied.
    pub buffering_acks: u64,
    /// Received ACKs applied.
    pub received_acks: u64,
    /// Persisted ACKs applied.
    pub persisted_acks: u64,
    /// Error ACKs applied.
    pub error_acks: u64,
    /// Idle ACKs observed.
    pub idle_acks: u64,
    /// Upload sessions created over the stream's lifetime.
    pub total_sessions: u64,
    /// Upload sessions that reached the streaming state.
    pub total_active_sessions: u64,
    /// EMA latency of control-plane calls.
    pub control_plane_call_latency: Ticks,
    /// EMA latency of the put-stream call.
    pub data_plane_call_latency: Ticks,
}

/// Point-in-time client metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientMetrics {
    /// Configured content store budget.
    pub storage_capacity: u64,
    /// Bytes currently allocated in the content store.
    pub storage_in_use: u64,
    /// Streams currently registered.
    pub stream_count: usize,
}
