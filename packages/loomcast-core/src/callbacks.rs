//! Host integration traits.
//!
//! The library owns no sockets and no credentials. The host implements
//! [`ServiceBackend`] to carry control-plane calls and the upload
//! connection, [`CredentialProvider`] to supply authentication material,
//! and [`ProducerObserver`] to receive notifications. Backend calls are
//! asynchronous by contract: the library invokes them outside its locks
//! and the host answers later through the corresponding `*_result` event
//! method, on any thread.

use std::sync::Arc;

use bytes::Bytes;

use crate::ack::FragmentAck;
use crate::client::Client;
use crate::error::{ServiceCallResult, StreamError};
use crate::handles::UploadHandle;
use crate::stream::Stream;
use crate::time::Ticks;

/// Authentication material with an expiration.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    /// Opaque credential bytes.
    pub data: Bytes,
    /// Absolute expiration time in ticks.
    pub expiration: Ticks,
}

/// Per-call context handed to the backend.
#[derive(Debug, Clone)]
pub struct ServiceCallContext {
    /// Earliest wall-clock time the call should be issued at; encodes the
    /// control-plane retry backoff.
    pub call_after: Ticks,
    /// Call timeout.
    pub timeout: Ticks,
    /// Credential to authenticate with, when one is available.
    pub auth: Option<AuthInfo>,
}

/// Backend stream status reported by describe-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Resource creation in progress.
    Creating,
    /// Ready for ingestion.
    Active,
    /// Being updated.
    Updating,
    /// Being deleted; fatal for the producer.
    Deleting,
}

/// Describe-stream response payload.
#[derive(Debug, Clone)]
pub struct StreamDescription {
    /// Stream name echoed by the backend.
    pub stream_name: String,
    /// Resource identifier.
    pub stream_arn: String,
    /// Content type registered for the stream.
    pub content_type: String,
    /// KMS key id in effect.
    pub kms_key_id: String,
    /// Retention period in effect.
    pub retention: Ticks,
    /// Current resource status.
    pub status: StreamStatus,
}

/// Control-plane and data-plane calls implemented by the host.
///
/// Every method must return promptly; the actual network work happens on
/// the host's own threads, which then deliver the result via the matching
/// event on [`Stream`] or [`Client`]. The device-level methods default to
/// an immediate success for hosts whose backend has no device registry.
pub trait ServiceBackend: Send + Sync {
    /// Resolve the stream's description.
    /// Answer via [`Stream::describe_stream_result`].
    fn describe_stream(&self, stream: &Arc<Stream>, stream_name: &str, ctx: &ServiceCallContext);

    /// Create the stream resource.
    /// Answer via [`Stream::create_stream_result`].
    #[allow(clippy::too_many_arguments)]
    fn create_stream(
        &self,
        stream: &Arc<Stream>,
        device_name: &str,
        stream_name: &str,
        content_type: &str,
        kms_key_id: &str,
        retention: Ticks,
        ctx: &ServiceCallContext,
    );

    /// Apply tags to the stream resource.
    /// Answer via [`Stream::tag_stream_result`].
    fn tag_stream(
        &self,
        stream: &Arc<Stream>,
        stream_arn: &str,
        tags: &[(String, String)],
        ctx: &ServiceCallContext,
    );

    /// Resolve the ingestion endpoint.
    /// Answer via [`Stream::get_streaming_endpoint_result`].
    fn get_streaming_endpoint(
        &self,
        stream: &Arc<Stream>,
        stream_name: &str,
        api_name: &str,
        ctx: &ServiceCallContext,
    );

    /// Obtain a streaming token.
    /// Answer via [`Stream::get_streaming_token_result`].
    fn get_streaming_token(&self, stream: &Arc<Stream>, stream_name: &str, ctx: &ServiceCallContext);

    /// Open the long-lived upload request. The host owns the connection,
    /// answers via [`Stream::put_stream_result`] with a fresh upload
    /// handle, and from then on drives [`Stream::get_stream_data`] with
    /// that handle whenever the data-available notification fires.
    #[allow(clippy::too_many_arguments)]
    fn put_stream(
        &self,
        stream: &Arc<Stream>,
        stream_name: &str,
        container_type: &str,
        start_time: Ticks,
        absolute_fragment_times: bool,
        ack_enabled: bool,
        endpoint: &str,
        ctx: &ServiceCallContext,
    );

    /// Register the device. Answer via [`Client::create_device_result`].
    fn create_device(&self, client: &Arc<Client>, device_name: &str, ctx: &ServiceCallContext) {
        let _ = ctx;
        let _ = client.create_device_result(ServiceCallResult::Ok, device_name);
    }

    /// Apply tags to the device resource.
    /// Answer via [`Client::tag_device_result`].
    fn tag_device(
        &self,
        client: &Arc<Client>,
        device_arn: &str,
        tags: &[(String, String)],
        ctx: &ServiceCallContext,
    ) {
        let _ = (device_arn, tags, ctx);
        let _ = client.tag_device_result(ServiceCallResult::Ok);
    }
}

/// Source of authentication material. The default implementation is
/// anonymous: no token, no certificate.
pub trait CredentialProvider: Send + Sync {
    /// Current security token, when the integration has one.
    fn security_token(&self) -> Option<AuthInfo> {
        None
    }

    /// Device certificate for token exchange, when the integration uses
    /// certificate-based provisioning.
    fn device_certificate(&self) -> Option<AuthInfo> {
        None
    }
}

/// Anonymous credential provider.
#[derive(Debug, Default)]
pub struct AnonymousCredentials;

impl CredentialProvider for AnonymousCredentials {}

/// Producer notifications. All methods default to no-ops; hosts override
/// what they care about.
///
/// Notifications are delivered outside the library's locks, but on the
/// thread that triggered them; implementations should hand off long work.
pub trait ProducerObserver: Send + Sync {
    /// The client finished provisioning.
    fn client_ready(&self, client: &Arc<Client>) {
        let _ = client;
    }

    /// The stream reached the ready state.
    fn stream_ready(&self, stream: &Arc<Stream>) {
        let _ = stream;
    }

    /// Buffered data is available for an upload session. The host should
    /// schedule a `get_stream_data` call on the session's connection.
    fn data_available(
        &self,
        stream: &Arc<Stream>,
        handle: UploadHandle,
        buffered_duration: Ticks,
        buffered_bytes: u64,
    ) {
        let _ = (stream, handle, buffered_duration, buffered_bytes);
    }

    /// All buffered data drained after a stop; the stream is closed.
    fn stream_closed(&self, stream: &Arc<Stream>, handle: Option<UploadHandle>) {
        let _ = (stream, handle);
    }

    /// A frame was evicted before it was uploaded.
    fn dropped_frame(&self, stream: &Arc<Stream>, timestamp: Ticks) {
        let _ = (stream, timestamp);
    }

    /// A whole fragment was evicted before it was uploaded.
    fn dropped_fragment(&self, stream: &Arc<Stream>, timestamp: Ticks) {
        let _ = (stream, timestamp);
    }

    /// Remaining content-store budget dropped below the threshold.
    fn storage_pressure(&self, stream: &Arc<Stream>, remaining_bytes: u64) {
        let _ = (stream, remaining_bytes);
    }

    /// Remaining buffer duration dropped below the threshold.
    fn buffer_duration_pressure(&self, stream: &Arc<Stream>, remaining: Ticks) {
        let _ = (stream, remaining);
    }

    /// The unsent window exceeds the configured maximum latency.
    fn latency_pressure(&self, stream: &Arc<Stream>, buffered_duration: Ticks) {
        let _ = (stream, buffered_duration);
    }

    /// No buffering ACK was observed within the staleness window.
    fn connection_stale(&self, stream: &Arc<Stream>, since_last_ack: Ticks) {
        let _ = (stream, since_last_ack);
    }

    /// A non-recoverable condition was reported for a fragment.
    fn stream_error(
        &self,
        stream: &Arc<Stream>,
        handle: Option<UploadHandle>,
        fragment_timestamp: Option<Ticks>,
        error: &StreamError,
    ) {
        let _ = (stream, handle, fragment_timestamp, error);
    }

    /// A fragment ACK was applied (or attempted). Fired for every ACK,
    /// including idle ones.
    fn fragment_ack_received(&self, stream: &Arc<Stream>, handle: UploadHandle, ack: &FragmentAck) {
        let _ = (stream, handle, ack);
    }

    /// The stream is shutting down (or resetting).
    fn stream_shutdown(&self, stream: &Arc<Stream>, is_reset: bool) {
        let _ = (stream, is_reset);
    }

    /// The client is shutting down.
    fn client_shutdown(&self, client: &Arc<Client>) {
        let _ = client;
    }
}

/// Observer that ignores every notification.
#[derive(Debug, Default)]
pub struct NullObserver;

impl ProducerObserver for NullObserver {}
