//! Loomcast core - embedded-friendly media producer for cloud ingestion.
//!
//! This crate packages a live sequence of media frames into a streaming
//! MKV container, buffers it in a bounded content store, and serves it to
//! a host-owned long-lived upload connection while honoring per-fragment
//! acknowledgments from the ingestion service.
//!
//! # Architecture
//!
//! - [`client`]: client object, shared content store, device provisioning
//! - [`stream`]: per-stream runtime (`put_frame`, `get_stream_data`,
//!   control-plane events)
//! - [`view`]: time-indexed rolling buffer between producer and uploader
//! - [`mkv`]: MKV/EBML packager with NAL adaptation
//! - [`ack`]: streaming fragment-ACK parser
//! - [`coordinator`]: multi-track frame interleaving
//! - [`store`]: bounded content store (in-memory and disk-spill)
//! - [`callbacks`]: host integration traits (transport, credentials,
//!   notifications)
//!
//! The library owns no sockets, credentials, or threads: the host calls
//! `put_frame` from its producer thread, `get_stream_data` from its
//! uploader thread, and reports control-plane results and ACKs through
//! the event methods as they arrive.

#![warn(clippy::all)]

pub mod ack;
pub mod callbacks;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod frame;
mod gate;
pub mod handles;
mod machine;
pub mod metrics;
pub mod mkv;
pub mod protocol_constants;
pub mod store;
pub mod stream;
pub mod time;
pub mod view;

// Re-export commonly used types at the crate root
pub use ack::{AckType, FragmentAck, FragmentAckParser};
pub use callbacks::{
    AnonymousCredentials, AuthInfo, CredentialProvider, NullObserver, ProducerObserver,
    ServiceBackend, ServiceCallContext, StreamDescription, StreamStatus,
};
pub use client::Client;
pub use config::{
    AudioTrackParams, ClientConfig, FrameOrderMode, NalAdaptation, StorePressurePolicy,
    StreamInfo, StreamingMode, TrackInfo, TrackParams, TrackType, VideoTrackParams,
};
pub use error::{AckFormatError, ServiceCallResult, StreamError, StreamResult};
pub use frame::{
    Frame, FRAME_FLAG_DISCARDABLE, FRAME_FLAG_END_OF_FRAGMENT, FRAME_FLAG_KEY_FRAME,
    FRAME_FLAG_NONE,
};
pub use handles::{HandleState, UploadHandle};
pub use metrics::{ClientMetrics, StreamMetrics};
pub use stream::{DataOutcome, Stream, StreamDataRead};
pub use time::{Clock, SystemClock, Ticks};
