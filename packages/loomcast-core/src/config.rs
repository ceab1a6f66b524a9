//! Stream and client configuration types.
//!
//! [`StreamInfo`] is an immutable snapshot: it is validated once at stream
//! creation and never mutated afterwards. Run-time state derived from it
//! (segment UUID, codec private data installed later) lives in the MKV
//! generator, not here.

use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};
use crate::protocol_constants::DEFAULT_TIMECODE_SCALE;
use crate::time::{Ticks, TICKS_PER_SECOND};

/// Ingestion mode of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    /// Live ingestion; drops content under pressure per the store policy.
    Realtime,
    /// Near-real-time: the view is sized in fragments rather than frames.
    NearRealtime,
    /// Offline ingestion: `put_frame` blocks until buffer space frees up.
    Offline,
}

impl StreamingMode {
    /// Whether the producer blocks on buffer availability.
    #[must_use]
    pub fn is_offline(self) -> bool {
        matches!(self, Self::Offline)
    }
}

/// What to do when the content store cannot satisfy an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorePressurePolicy {
    /// Evict the oldest buffered items until the allocation succeeds.
    DropTailItem,
    /// Fail the put with a store-out-of-memory error.
    OutOfMemory,
}

/// Frame ordering applied before packaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOrderMode {
    /// Frames go straight to the packager in arrival order.
    PassThrough,
    /// Multi-track interleaving by presentation timestamp, with one-unit
    /// compensation when a key frame ties a non-key frame on another track.
    MultiTrackByPts,
    /// Same, comparing decoding timestamps; an end-of-fragment sentinel is
    /// re-armed as a key-frame marker for the following frame.
    MultiTrackByDts,
}

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    /// Video track.
    Video,
    /// Audio track.
    Audio,
}

/// NAL stream adaptation applied during packaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NalAdaptation {
    /// Payloads pass through untouched.
    #[default]
    None,
    /// Convert Annex-B start codes to AVCC length prefixes, extracting
    /// codec private data from in-band parameter sets.
    AnnexBToAvcc,
    /// Convert AVCC length prefixes to Annex-B start codes.
    AvccToAnnexB,
}

/// Video-specific track parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoTrackParams {
    /// Frame width in pixels.
    pub width: u16,
    /// Frame height in pixels.
    pub height: u16,
}

/// Audio-specific track parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioTrackParams {
    /// Sampling frequency in Hz.
    pub sampling_frequency: f64,
    /// Channel count.
    pub channels: u8,
}

/// Per-track type parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackParams {
    /// Video dimensions.
    Video(VideoTrackParams),
    /// Audio format.
    Audio(AudioTrackParams),
}

/// One declared media track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Caller-chosen track id referenced by [`crate::Frame::track_id`].
    pub track_id: u64,
    /// Track kind.
    pub track_type: TrackType,
    /// Codec id written into the container (e.g. `V_MPEG4/ISO/AVC`).
    pub codec_id: String,
    /// Human-readable track name.
    pub track_name: String,
    /// Codec initialization data, if known at creation time. May also be
    /// installed later via `stream_format_changed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_private_data: Option<Vec<u8>>,
    /// Type-specific parameters.
    pub params: TrackParams,
}

/// Immutable stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Stream name; unique within a client.
    pub name: String,
    /// Retention period for server-side persistence. Zero disables
    /// persisted-ACK based retention.
    pub retention: Ticks,
    /// KMS key id, empty for the service default key.
    #[serde(default)]
    pub kms_key_id: String,
    /// Tags applied to the stream resource after creation.
    #[serde(default)]
    pub tags: Vec<(String, String)>,
    /// Ingestion mode.
    pub streaming_mode: StreamingMode,
    /// MIME content type reported to the control plane.
    pub content_type: String,
    /// Whether cluster timecodes are absolute or relative to stream start.
    pub absolute_fragment_times: bool,
    /// Whether the host delivers fragment ACKs on the upload connection.
    pub fragment_acks: bool,
    /// Whether key frames open new fragments.
    pub key_frame_fragmentation: bool,
    /// Whether frame timecodes are carried in-stream.
    pub frame_timecodes: bool,
    /// Whether the state machine re-primes itself after errors.
    pub recover_on_error: bool,
    /// Whether frame/transfer rate EMAs are maintained.
    pub recalculate_metrics: bool,
    /// NAL adaptation performed by the packager.
    #[serde(default)]
    pub nal_adaptation: NalAdaptation,
    /// Nominal frame rate used to size the content view.
    pub frame_rate: u32,
    /// Total buffered duration retained in the content view.
    pub buffer_duration: Ticks,
    /// How far the view rolls back after a connection loss.
    pub replay_duration: Ticks,
    /// Buffering-ACK silence span that counts as a stale connection.
    /// Zero disables staleness detection.
    #[serde(default)]
    pub connection_staleness: Ticks,
    /// MKV timecode scale in ticks.
    pub timecode_scale: Ticks,
    /// Target cluster duration when neither key frames nor sentinels
    /// bound fragments first.
    pub fragment_duration: Ticks,
    /// Latency pressure threshold; zero disables the check.
    #[serde(default)]
    pub max_latency: Ticks,
    /// Store exhaustion policy.
    pub store_pressure_policy: StorePressurePolicy,
    /// Frame ordering applied ahead of the packager.
    pub frame_order_mode: FrameOrderMode,
    /// Declared tracks, at least one.
    pub tracks: Vec<TrackInfo>,
    /// Pinned container segment UUID; a random one is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_uuid: Option<[u8; 16]>,
}

impl StreamInfo {
    /// Validates the configuration.
    pub fn validate(&self) -> StreamResult<()> {
        if self.name.is_empty() {
            return Err(StreamError::InvalidArgument("stream name is empty".into()));
        }
        if self.tracks.is_empty() {
            return Err(StreamError::InvalidArgument(
                "at least one track is required".into(),
            ));
        }
        for (i, track) in self.tracks.iter().enumerate() {
            if self.tracks[..i].iter().any(|t| t.track_id == track.track_id) {
                return Err(StreamError::DuplicateTrackId(track.track_id));
            }
            if track.codec_id.is_empty() {
                return Err(StreamError::InvalidArgument(format!(
                    "track {} has an empty codec id",
                    track.track_id
                )));
            }
        }
        if self.timecode_scale == 0 {
            return Err(StreamError::InvalidArgument(
                "timecode scale must be non-zero".into(),
            ));
        }
        if self.fragment_duration == 0 {
            return Err(StreamError::InvalidArgument(
                "fragment duration must be non-zero".into(),
            ));
        }
        if self.frame_rate == 0 {
            return Err(StreamError::InvalidArgument(
                "frame rate must be non-zero".into(),
            ));
        }
        if self.buffer_duration == 0 || self.buffer_duration < self.replay_duration {
            return Err(StreamError::InvalidArgument(
                "buffer duration must cover the replay duration".into(),
            ));
        }
        if self.frame_order_mode != FrameOrderMode::PassThrough && self.tracks.len() < 2 {
            return Err(StreamError::InvalidArgument(
                "multi-track ordering requires at least two tracks".into(),
            ));
        }
        Ok(())
    }

    /// Looks up a declared track by id.
    pub fn track(&self, track_id: u64) -> StreamResult<&TrackInfo> {
        self.tracks
            .iter()
            .find(|t| t.track_id == track_id)
            .ok_or(StreamError::TrackInfoNotFound(track_id))
    }

    /// Number of view items to provision for the buffering window.
    #[must_use]
    pub fn view_item_capacity(&self) -> usize {
        let capacity = match self.streaming_mode {
            StreamingMode::Realtime | StreamingMode::Offline => {
                self.frame_rate as u64 * (self.buffer_duration / TICKS_PER_SECOND)
            }
            StreamingMode::NearRealtime => self.buffer_duration / self.fragment_duration.max(1),
        };
        capacity.max(2) as usize
    }
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            retention: 0,
            kms_key_id: String::new(),
            tags: Vec::new(),
            streaming_mode: StreamingMode::Realtime,
            content_type: "video/h264".into(),
            absolute_fragment_times: false,
            fragment_acks: true,
            key_frame_fragmentation: true,
            frame_timecodes: true,
            recover_on_error: true,
            recalculate_metrics: true,
            nal_adaptation: NalAdaptation::None,
            frame_rate: 25,
            buffer_duration: 120 * TICKS_PER_SECOND,
            replay_duration: 40 * TICKS_PER_SECOND,
            connection_staleness: 20 * TICKS_PER_SECOND,
            timecode_scale: DEFAULT_TIMECODE_SCALE,
            fragment_duration: 2 * TICKS_PER_SECOND,
            max_latency: 0,
            store_pressure_policy: StorePressurePolicy::DropTailItem,
            frame_order_mode: FrameOrderMode::PassThrough,
            tracks: Vec::new(),
            segment_uuid: None,
        }
    }
}

/// Client-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Device name reported in create-stream calls.
    pub device_name: String,
    /// Client id written into the container muxing metadata.
    pub client_id: String,
    /// Tags applied to the device resource.
    #[serde(default)]
    pub device_tags: Vec<(String, String)>,
    /// Content store budget in bytes, shared by all streams of the client.
    pub storage_size: u64,
    /// Directory for the disk-spill store. In-memory only when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spill_dir: Option<std::path::PathBuf>,
    /// How long an offline `put_frame` waits for buffer availability
    /// before timing out.
    pub offline_buffer_availability_timeout: Ticks,
    /// How long `stop_stream_sync` waits for the stream-closed signal.
    pub stop_stream_timeout: Ticks,
    /// How long `create_stream_sync` waits for the ready signal.
    pub create_stream_timeout: Ticks,
    /// How long teardown waits for in-flight entry points to drain.
    pub shutdown_timeout: Ticks,
}

impl ClientConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> StreamResult<()> {
        if self.device_name.is_empty() {
            return Err(StreamError::InvalidArgument("device name is empty".into()));
        }
        if self.storage_size == 0 {
            return Err(StreamError::InvalidArgument(
                "storage size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_name: "loomcast-device".into(),
            client_id: "loomcast".into(),
            device_tags: Vec::new(),
            storage_size: 64 * 1024 * 1024,
            spill_dir: None,
            offline_buffer_availability_timeout: 15 * TICKS_PER_SECOND,
            stop_stream_timeout: 15 * TICKS_PER_SECOND,
            create_stream_timeout: 15 * TICKS_PER_SECOND,
            shutdown_timeout: 15 * TICKS_PER_SECOND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_track() -> TrackInfo {
        TrackInfo {
            track_id: 1,
            track_type: TrackType::Video,
            codec_id: "V_MPEG4/ISO/AVC".into(),
            track_name: "video".into(),
            codec_private_data: None,
            params: TrackParams::Video(VideoTrackParams {
                width: 1280,
                height: 720,
            }),
        }
    }

    #[test]
    fn default_info_with_track_validates() {
        let info = StreamInfo {
            name: "cam-0".into(),
            tracks: vec![h264_track()],
            ..StreamInfo::default()
        };
        assert!(info.validate().is_ok());
    }

    #[test]
    fn duplicate_track_ids_rejected() {
        let info = StreamInfo {
            name: "cam-0".into(),
            tracks: vec![h264_track(), h264_track()],
            ..StreamInfo::default()
        };
        assert!(matches!(
            info.validate(),
            Err(StreamError::DuplicateTrackId(1))
        ));
    }

    #[test]
    fn view_capacity_scales_with_frame_rate() {
        let info = StreamInfo {
            name: "cam-0".into(),
            frame_rate: 30,
            buffer_duration: 10 * TICKS_PER_SECOND,
            replay_duration: 5 * TICKS_PER_SECOND,
            tracks: vec![h264_track()],
            ..StreamInfo::default()
        };
        assert_eq!(info.view_item_capacity(), 300);
    }

    #[test]
    fn near_realtime_capacity_counts_fragments() {
        let info = StreamInfo {
            name: "cam-0".into(),
            streaming_mode: StreamingMode::NearRealtime,
            buffer_duration: 60 * TICKS_PER_SECOND,
            replay_duration: 10 * TICKS_PER_SECOND,
            fragment_duration: 2 * TICKS_PER_SECOND,
            tracks: vec![h264_track()],
            ..StreamInfo::default()
        };
        assert_eq!(info.view_item_capacity(), 30);
    }
}
