//! Wire-level constants shared with the ingestion service.
//!
//! These values are part of the service protocol and must not drift: the
//! backend matches them byte for byte.

use crate::time::{Ticks, TICKS_PER_MILLISECOND, TICKS_PER_MINUTE, TICKS_PER_SECOND};

/// Container type reported in the put-stream call.
pub const MKV_CONTAINER_TYPE: &str = "video/x-matroska";

/// API name passed to the get-endpoint call for realtime ingestion.
pub const PUT_MEDIA_API_NAME: &str = "PUT_MEDIA";

/// Name of the tag appended as the final element of a fragment run to signal
/// end-of-fragment to the backend when ACK-based retention is in effect.
pub const EOFR_METADATA_NAME: &str = "AWS_KINESISVIDEO_EOFR";

/// Reserved prefix for service-internal metadata names. Application metadata
/// with this prefix is rejected.
pub const INTERNAL_METADATA_PREFIX: &str = "AWS";

/// Maximum byte length of a single ACK segment fed to the parser.
pub const MAX_ACK_FRAGMENT_LEN: usize = 1024;

/// Maximum length of the ACK fragment sequence number string.
pub const MAX_FRAGMENT_SEQUENCE_NUMBER_LEN: usize = 128;

/// Maximum number of queued fragment metadata entries per stream.
pub const MAX_FRAGMENT_METADATA_COUNT: usize = 10;

/// Maximum length of a metadata name or value.
pub const MAX_METADATA_STRING_LEN: usize = 256;

/// Default MKV timecode scale: 1 ms expressed in ticks. The SimpleBlock
/// timecode is a signed 16-bit value, so a millisecond base keeps the
/// representable intra-cluster range at ~32 seconds.
pub const DEFAULT_TIMECODE_SCALE: Ticks = TICKS_PER_MILLISECOND;

/// Grace period before streaming-token expiration during which the library
/// proactively rotates credentials.
pub const TOKEN_EXPIRATION_GRACE_PERIOD: Ticks = 3 * TICKS_PER_SECOND;

/// Minimum acceptable remaining lifetime for a freshly issued streaming token.
pub const MIN_TOKEN_EXPIRATION_DURATION: Ticks = 30 * TICKS_PER_SECOND;

/// Hard cap on the token expiration horizon; rotation happens no later than
/// this even if the issued token lives longer.
pub const MAX_ENFORCED_TOKEN_EXPIRATION_DURATION: Ticks = 40 * TICKS_PER_MINUTE;

/// Remaining lifetime below which no expiration jitter is applied.
pub const TOKEN_JITTER_THRESHOLD: Ticks = 5 * TICKS_PER_MINUTE;

/// Upper bound on the randomized expiration jitter.
pub const MAX_TOKEN_JITTER: Ticks = 3 * TICKS_PER_MINUTE;

/// Fraction of the remaining token lifetime eligible for jitter.
pub const TOKEN_JITTER_RATIO: f64 = 0.1;

/// Control-plane states retry a failed service call this many times before
/// the state machine surfaces the state's failure error.
pub const SERVICE_CALL_MAX_RETRY_COUNT: u32 = 5;

/// Base delay unit for the exponential control-plane retry backoff.
pub const SERVICE_CALL_RETRY_DELAY_BASE: Ticks = 100 * TICKS_PER_MILLISECOND;

/// Default control-plane call timeout handed to the service backend.
pub const SERVICE_CALL_DEFAULT_TIMEOUT: Ticks = 5 * TICKS_PER_SECOND;

/// Remaining-storage percentage at or below which the storage pressure
/// notification fires.
pub const STORAGE_PRESSURE_NOTIFICATION_THRESHOLD: u64 = 5;

/// Remaining-buffer-duration percentage at or below which the buffer
/// duration pressure notification fires.
pub const BUFFER_DURATION_PRESSURE_NOTIFICATION_THRESHOLD: u64 = 5;

/// Multiplier applied to the largest frame seen when computing the store
/// fragmentation reserve.
pub const FRAME_ALLOC_FRAGMENTATION_FACTOR: f64 = 1.8;

/// Fixed per-allocation overhead reserved in the content store budget.
pub const MAX_ALLOCATION_OVERHEAD_SIZE: u64 = 16 * 1024;

/// Bound on the per-track reorder queue depth in the frame-order coordinator.
pub const MAX_FRAME_QUEUE_SIZE_PER_TRACK: usize = 100;

/// Minimum interval between transfer-rate measurements, in seconds. Shorter
/// windows alias with burst reads into the uploader's transfer buffer.
pub const TRANSFER_RATE_INTERVAL_EPSILON_SECS: f64 = 0.2;
