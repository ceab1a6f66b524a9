//! Centralized error types for the Loomcast core library.
//!
//! Two layers of failure live here:
//! - [`StreamError`]: errors surfaced by library entry points, built with
//!   `thiserror` and carrying a stable machine-readable `code()`.
//! - [`ServiceCallResult`]: wire-level results reported by the host for
//!   control-plane calls and carried inside error ACKs. Classification
//!   helpers decide retriability and recovery routing.

use serde::Serialize;
use thiserror::Error;

/// Convenient Result alias for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Application-facing error type for the producer library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A caller-supplied argument failed validation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The content store could not satisfy an allocation.
    #[error("Not enough memory for allocation of {0} bytes")]
    NotEnoughMemory(usize),

    /// The content store budget is exhausted and the pressure policy does
    /// not permit evicting buffered content.
    #[error("Content store is out of memory")]
    StoreOutOfMemory,

    /// The stream was stopped and no longer accepts frames.
    #[error("Stream has been stopped")]
    StreamHasBeenStopped,

    /// A blocking put was interrupted by stream shutdown.
    #[error("Blocking put interrupted by stream termination")]
    BlockingPutInterrupted,

    /// A synchronous wait ran out of time.
    #[error("Operation timed out")]
    OperationTimedOut,

    /// The state machine rejected a transition or an event arrived in a
    /// state that does not accept it.
    #[error("Invalid stream state")]
    InvalidStreamState,

    /// The stream never reached the ready state.
    #[error("Invalid stream ready state")]
    InvalidStreamReadyState,

    /// The backend reports the stream as being deleted; not recoverable
    /// from within the library.
    #[error("Stream is being deleted")]
    StreamIsBeingDeleted,

    /// A stream with the same name already exists in this client.
    #[error("Duplicate stream name: {0}")]
    DuplicateStreamName(String),

    /// Two tracks in the stream configuration share an id.
    #[error("Duplicate track id: {0}")]
    DuplicateTrackId(u64),

    /// The frame names a track id absent from the stream configuration.
    #[error("Track info not found for track id {0}")]
    TrackInfoNotFound(u64),

    /// An end-of-fragment sentinel arrived while key-frame fragmentation
    /// is enabled and no explicit fragmentation is in effect.
    #[error("End-of-fragment frame in invalid state")]
    EofrFrameInvalidState,

    /// Two end-of-fragment sentinels arrived back to back.
    #[error("Multiple consecutive end-of-fragment frames")]
    MultipleConsecutiveEofr,

    /// A key-frame flag was observed while the stream fragments on explicit
    /// end-of-fragment sentinels.
    #[error("Key frame flag set while using end-of-fragment markers")]
    KeyFrameFlagWhileUsingEofr,

    /// A track's reorder queue overflowed: the inter-track timestamp delta
    /// exceeds what the coordinator is allowed to buffer.
    #[error("Max frame timestamp delta between tracks exceeded")]
    MaxFrameTimestampDeltaBetweenTracks,

    /// The ACK byte stream violated the ACK grammar.
    #[error("Invalid ACK format: {0}")]
    InvalidAckFormat(AckFormatError),

    /// An ACK carried a timecode outside the buffered window.
    #[error("ACK timestamp not within the buffered window")]
    AckTimestampNotInView,

    /// The streaming token expiration is in the past or below the minimum.
    #[error("Invalid streaming token expiration")]
    InvalidTokenExpiration,

    /// A describe-stream response was missing required fields.
    #[error("Invalid describe stream response")]
    InvalidDescribeStreamResponse,

    /// A create-stream response was missing required fields.
    #[error("Invalid create stream response")]
    InvalidCreateStreamResponse,

    /// A control-plane state exhausted its retry budget.
    #[error("Service call failed in state {state}: {result:?}")]
    ServiceCallFailed {
        /// Human-readable name of the control-plane step that failed.
        state: &'static str,
        /// The last result reported by the host for that step.
        result: ServiceCallResult,
    },

    /// A classified control-plane or ACK error.
    #[error("Service call error: {0:?}")]
    ServiceCall(ServiceCallResult),

    /// An upload handle is unknown or was aborted.
    #[error("Upload handle aborted")]
    UploadHandleAborted,

    /// A session terminated before the persisted ACK of its final
    /// fragment arrived.
    #[error("Last persisted ACK not received before termination")]
    PersistedAckNotReceived,

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// Returns a stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotEnoughMemory(_) => "not_enough_memory",
            Self::StoreOutOfMemory => "store_out_of_memory",
            Self::StreamHasBeenStopped => "stream_stopped",
            Self::BlockingPutInterrupted => "blocking_put_interrupted",
            Self::OperationTimedOut => "operation_timed_out",
            Self::InvalidStreamState => "invalid_stream_state",
            Self::InvalidStreamReadyState => "invalid_stream_ready_state",
            Self::StreamIsBeingDeleted => "stream_being_deleted",
            Self::DuplicateStreamName(_) => "duplicate_stream_name",
            Self::DuplicateTrackId(_) => "duplicate_track_id",
            Self::TrackInfoNotFound(_) => "track_info_not_found",
            Self::EofrFrameInvalidState => "eofr_invalid_state",
            Self::MultipleConsecutiveEofr => "multiple_consecutive_eofr",
            Self::KeyFrameFlagWhileUsingEofr => "key_frame_flag_with_eofr",
            Self::MaxFrameTimestampDeltaBetweenTracks => "max_track_timestamp_delta",
            Self::InvalidAckFormat(_) => "invalid_ack_format",
            Self::AckTimestampNotInView => "ack_timestamp_not_in_view",
            Self::InvalidTokenExpiration => "invalid_token_expiration",
            Self::InvalidDescribeStreamResponse => "invalid_describe_response",
            Self::InvalidCreateStreamResponse => "invalid_create_response",
            Self::ServiceCallFailed { .. } => "service_call_failed",
            Self::ServiceCall(_) => "service_call_error",
            Self::UploadHandleAborted => "upload_handle_aborted",
            Self::PersistedAckNotReceived => "persisted_ack_not_received",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Sub-kinds of ACK grammar violations. Any of these resets the parser
/// without tearing down the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckFormatError {
    /// The segment is longer than the protocol allows.
    SegmentTooLong,
    /// A key did not start with a quote.
    KeyStart,
    /// A value started with an unexpected character.
    ValueStart,
    /// A numeric value terminated with an unexpected character.
    ValueEnd,
    /// The same key appeared twice in one ACK object.
    DuplicateKey,
    /// A token overflowed the accumulator.
    TokenTooLong,
    /// A numeric token did not parse as an unsigned integer.
    InvalidNumber,
    /// The completed ACK had no event type.
    MissingEventType,
    /// An error ACK carried no error id.
    MissingErrorId,
}

impl std::fmt::Display for AckFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SegmentTooLong => "segment too long",
            Self::KeyStart => "malformed key start",
            Self::ValueStart => "malformed value start",
            Self::ValueEnd => "malformed value end",
            Self::DuplicateKey => "duplicate key",
            Self::TokenTooLong => "token too long",
            Self::InvalidNumber => "invalid numeric value",
            Self::MissingEventType => "missing event type",
            Self::MissingErrorId => "missing error id",
        };
        f.write_str(s)
    }
}

/// Wire-level result of a control-plane call or an error ACK.
///
/// The host maps transport/HTTP failures onto these before reporting call
/// results; error ACKs carry the numeric id directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCallResult {
    /// No result reported yet for the in-flight call.
    NotSet,
    /// Call completed successfully.
    Ok,
    /// Invalid arguments in the request.
    InvalidArg,
    /// Device does not exist.
    DeviceNotFound,
    /// Device exists but has not been provisioned.
    DeviceNotProvisioned,
    /// Credentials rejected.
    NotAuthorized,
    /// Access denied.
    Forbidden,
    /// Named resource does not exist.
    ResourceNotFound,
    /// Named resource is in use by another writer.
    ResourceInUse,
    /// Named resource was deleted.
    ResourceDeleted,
    /// Request-level timeout.
    RequestTimeout,
    /// Gateway timeout.
    GatewayTimeout,
    /// Socket read timed out.
    NetworkReadTimeout,
    /// Connection establishment timed out.
    NetworkConnectionTimeout,
    /// Account-level client limit reached.
    ClientLimit,
    /// Device limit reached.
    DeviceLimit,
    /// Stream limit reached.
    StreamLimit,
    /// Internal pseudo-result driving proactive token rotation.
    StreamAuthInGracePeriod,
    /// Unclassified failure.
    Unknown,

    // Error ACK codes reported by the ingestion backend.
    /// The backend failed reading the stream.
    AckStreamReadError,
    /// A fragment exceeded the size limit.
    AckFragmentSizeReached,
    /// A fragment exceeded the duration limit.
    AckFragmentDurationReached,
    /// The connection hit its maximum allowed duration.
    AckConnectionDurationReached,
    /// Fragment timecodes were not monotonically increasing.
    AckFragmentTimecodeNotMonotonic,
    /// Multi-track MKV rejected by the backend.
    AckMultiTrackMkv,
    /// The MKV byte stream failed validation.
    AckInvalidMkvData,
    /// Producer timestamp rejected.
    AckInvalidProducerTimestamp,
    /// The stream is not in the active state server-side.
    AckStreamNotActive,
    /// Per-fragment metadata limit exceeded.
    AckFragmentMetadataLimitReached,
    /// Track numbers did not match the declared track set.
    AckTrackNumberMismatch,
    /// A declared track had no frames in the fragment.
    AckFramesMissingForTrack,
    /// More tracks than the backend allows.
    AckMoreThanAllowedTracksFound,
    /// KMS key access denied.
    AckKmsKeyAccessDenied,
    /// KMS key disabled.
    AckKmsKeyDisabled,
    /// KMS key failed validation.
    AckKmsKeyValidationError,
    /// KMS key unavailable.
    AckKmsKeyUnavailable,
    /// KMS key used for an invalid operation.
    AckKmsKeyInvalidUsage,
    /// KMS key in an invalid state.
    AckKmsKeyInvalidState,
    /// KMS key not found.
    AckKmsKeyNotFound,
    /// The stream was deleted mid-upload.
    AckStreamDeleted,
    /// Internal backend error while processing the fragment.
    AckInternalError,
    /// The fragment could not be archived.
    AckArchivalError,
    /// Error id not recognized by this library version.
    AckUnknownError,
}

impl ServiceCallResult {
    /// Maps the numeric error id of an error ACK onto a typed result.
    /// Unrecognized ids collapse to [`ServiceCallResult::AckUnknownError`].
    #[must_use]
    pub fn from_ack_error_id(error_id: u64) -> Self {
        match error_id {
            4000 => Self::AckStreamReadError,
            4001 => Self::AckFragmentSizeReached,
            4002 => Self::AckFragmentDurationReached,
            4003 => Self::AckConnectionDurationReached,
            4004 => Self::AckFragmentTimecodeNotMonotonic,
            4005 => Self::AckMultiTrackMkv,
            4006 => Self::AckInvalidMkvData,
            4007 => Self::AckInvalidProducerTimestamp,
            4008 => Self::AckStreamNotActive,
            4009 => Self::AckFragmentMetadataLimitReached,
            4010 => Self::AckTrackNumberMismatch,
            4011 => Self::AckFramesMissingForTrack,
            4012 => Self::AckMoreThanAllowedTracksFound,
            4500 => Self::AckKmsKeyAccessDenied,
            4501 => Self::AckKmsKeyDisabled,
            4502 => Self::AckKmsKeyValidationError,
            4503 => Self::AckKmsKeyUnavailable,
            4504 => Self::AckKmsKeyInvalidUsage,
            4505 => Self::AckKmsKeyInvalidState,
            4506 => Self::AckKmsKeyNotFound,
            4507 => Self::AckStreamDeleted,
            5000 => Self::AckInternalError,
            5001 => Self::AckArchivalError,
            _ => Self::AckUnknownError,
        }
    }

    /// Whether this result represents a transport or gateway timeout.
    #[must_use]
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            Self::RequestTimeout
                | Self::GatewayTimeout
                | Self::NetworkReadTimeout
                | Self::NetworkConnectionTimeout
        )
    }

    /// Whether the failure is worth retrying by walking the state machine
    /// back to an earlier control-plane state. Non-retriable results are
    /// surfaced through the stream error callback and their fragments are
    /// marked for skipping.
    #[must_use]
    pub fn is_retriable(self) -> bool {
        !matches!(
            self,
            Self::InvalidArg
                | Self::DeviceNotFound
                | Self::DeviceNotProvisioned
                | Self::NotAuthorized
                | Self::Forbidden
                | Self::ResourceDeleted
                | Self::ClientLimit
                | Self::DeviceLimit
                | Self::StreamLimit
                | Self::AckFragmentSizeReached
                | Self::AckFragmentDurationReached
                | Self::AckFragmentTimecodeNotMonotonic
                | Self::AckInvalidMkvData
                | Self::AckMultiTrackMkv
                | Self::AckInvalidProducerTimestamp
                | Self::AckFragmentMetadataLimitReached
                | Self::AckTrackNumberMismatch
                | Self::AckFramesMissingForTrack
                | Self::AckMoreThanAllowedTracksFound
                | Self::AckKmsKeyAccessDenied
                | Self::AckKmsKeyDisabled
                | Self::AckKmsKeyValidationError
                | Self::AckKmsKeyUnavailable
                | Self::AckKmsKeyInvalidUsage
                | Self::AckKmsKeyInvalidState
                | Self::AckKmsKeyNotFound
                | Self::AckStreamNotActive
                | Self::AckStreamDeleted
        )
    }

    /// Whether a dropped connection carrying this result indicates the
    /// remote host was alive when it dropped. With ACKs enabled this lets
    /// the reconnect rollback stop at the last persisted fragment instead
    /// of replaying the full replay window.
    #[must_use]
    pub fn host_alive_on_drop(self) -> bool {
        matches!(
            self,
            Self::NotSet
                | Self::Ok
                | Self::ClientLimit
                | Self::DeviceLimit
                | Self::StreamLimit
                | Self::NotAuthorized
                | Self::AckStreamReadError
                | Self::AckConnectionDurationReached
                | Self::AckStreamNotActive
                | Self::AckKmsKeyAccessDenied
                | Self::AckKmsKeyDisabled
                | Self::AckKmsKeyValidationError
                | Self::AckKmsKeyUnavailable
                | Self::AckKmsKeyInvalidUsage
                | Self::AckKmsKeyInvalidState
                | Self::AckKmsKeyNotFound
                | Self::AckStreamDeleted
                | Self::AckInternalError
                | Self::AckArchivalError
        )
    }

    /// Classifies the result into a library error, or `Ok(())` for results
    /// that do not indicate failure.
    pub fn check(self) -> StreamResult<()> {
        match self {
            Self::Ok | Self::StreamAuthInGracePeriod => Ok(()),
            other => Err(StreamError::ServiceCall(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_error_id_mapping_round_trips_known_codes() {
        assert_eq!(
            ServiceCallResult::from_ack_error_id(4006),
            ServiceCallResult::AckInvalidMkvData
        );
        assert_eq!(
            ServiceCallResult::from_ack_error_id(5000),
            ServiceCallResult::AckInternalError
        );
        assert_eq!(
            ServiceCallResult::from_ack_error_id(99999),
            ServiceCallResult::AckUnknownError
        );
    }

    #[test]
    fn timeouts_are_retriable() {
        assert!(ServiceCallResult::RequestTimeout.is_retriable());
        assert!(ServiceCallResult::RequestTimeout.is_timeout());
        assert!(!ServiceCallResult::Ok.is_timeout());
    }

    #[test]
    fn validation_errors_are_not_retriable() {
        assert!(!ServiceCallResult::AckInvalidMkvData.is_retriable());
        assert!(!ServiceCallResult::StreamLimit.is_retriable());
        assert!(ServiceCallResult::AckInternalError.is_retriable());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(StreamError::StoreOutOfMemory.code(), "store_out_of_memory");
        assert_eq!(
            StreamError::InvalidAckFormat(AckFormatError::DuplicateKey).code(),
            "invalid_ack_format"
        );
    }
}
