//! Per-stream runtime.
//!
//! A [`Stream`] is the meeting point of three actors: the producer thread
//! calling [`Stream::put_frame`], the uploader thread(s) calling
//! [`Stream::get_stream_data`], and the host's networking threads
//! delivering control-plane results and fragment ACKs. All shared state
//! lives behind one stream lock; the client's content store is a separate,
//! innermost lock.
//!
//! Outbound work (service calls, notifications) is never performed under
//! the stream lock. Internal code appends [`Effect`]s to the locked state
//! and the public entry point dispatches them after unlocking.

mod data;
mod events;
mod metadata;
mod put_frame;
mod state;

pub use data::{DataOutcome, StreamDataRead};

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::ack::{FragmentAck, FragmentAckParser};
use crate::callbacks::{AuthInfo, ServiceCallContext, StreamDescription, StreamStatus};
use crate::client::Client;
use crate::config::{FrameOrderMode, StreamInfo};
use crate::coordinator::FrameOrderCoordinator;
use crate::error::{ServiceCallResult, StreamError, StreamResult};
use crate::frame::Frame;
use crate::gate::EntryGate;
use crate::handles::{UploadHandle, UploadHandleList, HANDLE_STATE_ACTIVE};
use crate::machine::MachineCore;
use crate::metrics::StreamMetrics;
use crate::mkv::MkvGenerator;
use crate::protocol_constants::{
    MKV_CONTAINER_TYPE, PUT_MEDIA_API_NAME, SERVICE_CALL_DEFAULT_TIMEOUT,
};
use crate::store::AllocHandle;
use crate::time::{ema_next, ticks_to_duration, Ticks};
use crate::view::{ContentView, ViewItem};

/// Pre-generated byte blob drained by the uploader (pending metadata, EOS
/// tag) with a send offset.
#[derive(Debug, Default)]
pub(crate) struct BlobTracker {
    pub data: Bytes,
    pub offset: usize,
    pub send: bool,
}

/// One queued fragment metadata entry.
#[derive(Debug, Clone)]
pub(crate) struct SerializedMetadata {
    pub name: String,
    pub value: String,
    pub persistent: bool,
    /// Whether the entry has been packaged into the stream already.
    pub applied: bool,
    /// Byte size of the packaged Tag element.
    pub packaged_size: usize,
}

/// Copy of the view item currently being served plus the intra-item send
/// offset.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CurrentItem {
    pub item: ViewItem,
    pub offset: usize,
}

/// Upload connection condition observed by the next `get_stream_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// Nothing special pending.
    Ok,
    /// The previous session produced bytes and dropped; roll back and
    /// re-emit a stream start.
    RollbackNeeded,
    /// A session ended without serving bytes; restart cleanly.
    CleanRestart,
}

/// Condition variables of one stream. Notification never requires the
/// stream lock; waiting always uses the stream lock's guard.
#[derive(Default)]
pub(crate) struct StreamSignals {
    pub ready: Condvar,
    pub closed: Condvar,
    pub buffer_availability: Condvar,
}

/// Deferred outbound call, dispatched after the stream lock is released.
pub(crate) enum Effect {
    DescribeStream {
        call_after: Ticks,
    },
    CreateStream {
        call_after: Ticks,
    },
    TagStream {
        call_after: Ticks,
        arn: String,
    },
    GetEndpoint {
        call_after: Ticks,
    },
    GetToken {
        call_after: Ticks,
    },
    PutStream {
        call_after: Ticks,
        start_time: Ticks,
        endpoint: String,
        auth: Option<AuthInfo>,
    },
    /// Free content-store allocations evicted under the stream lock, then
    /// wake any producer blocked on buffer availability.
    ReleaseStorage {
        allocations: Vec<AllocHandle>,
    },
    Notify(Notification),
}

/// Deferred observer notification.
pub(crate) enum Notification {
    StreamReady,
    DataAvailable {
        handle: UploadHandle,
        duration: Ticks,
        bytes: u64,
    },
    DroppedFrame {
        ts: Ticks,
    },
    DroppedFragment {
        ts: Ticks,
    },
    StoragePressure {
        remaining: u64,
    },
    BufferDurationPressure {
        remaining: Ticks,
    },
    LatencyPressure {
        duration: Ticks,
    },
    ConnectionStale {
        since: Ticks,
    },
    StreamError {
        handle: Option<UploadHandle>,
        ts: Option<Ticks>,
        error: StreamError,
    },
    AckReceived {
        handle: UploadHandle,
        ack: FragmentAck,
    },
    StreamClosed {
        handle: Option<UploadHandle>,
    },
}

/// Per-stream diagnostics accumulators.
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    pub put_frame_errors: u64,
    pub skipped_frames: u64,
    pub dropped_frames: u64,
    pub storage_pressures: u64,
    pub buffer_pressures: u64,
    pub latency_pressures: u64,
    pub stale_events: u64,
    pub buffering_acks: u64,
    pub received_acks: u64,
    pub persisted_acks: u64,
    pub error_acks: u64,
    pub idle_acks: u64,
    pub transferred_bytes: u64,
    pub accumulated_bytes: u64,
    pub total_sessions: u64,
    pub total_active_sessions: u64,
    pub current_frame_rate: f64,
    pub last_frame_rate_ts: Option<Ticks>,
    pub current_transfer_rate: f64,
    pub last_transfer_rate_ts: Option<Ticks>,
    pub control_plane_call_latency: f64,
    pub data_plane_call_latency: f64,
}

/// Mutable stream state, guarded by the stream lock.
pub(crate) struct StreamInner {
    pub info: Arc<StreamInfo>,
    pub signals: Arc<StreamSignals>,
    /// Wall clock reading taken at the current public entry point.
    pub now: Ticks,

    pub machine: MachineCore,
    /// Out-of-band state indicator feeding the machine's selectors.
    pub indicator: u32,
    pub last_result: ServiceCallResult,
    /// `call_after` of the last emitted service call, for latency EMAs.
    pub last_call_after: Ticks,

    pub view: ContentView,
    pub generator: MkvGenerator,
    pub handles: UploadHandleList,
    pub metadata_queue: VecDeque<SerializedMetadata>,
    pub eos_tracker: BlobTracker,
    pub metadata_tracker: BlobTracker,
    pub ack_parser: FragmentAckParser,
    pub ack_parser_handle: Option<UploadHandle>,
    pub cur_item: Option<CurrentItem>,

    pub connection_state: ConnectionState,
    pub connection_dropped_result: ServiceCallResult,
    pub streaming_auth: Option<AuthInfo>,
    pub streaming_endpoint: String,
    pub arn: String,
    pub stream_status: Option<StreamStatus>,
    /// Effective retention; updated from the describe response.
    pub retention: Ticks,

    pub stream_stopped: bool,
    pub stream_closed: bool,
    pub stream_ready: bool,
    pub shutdown: bool,
    pub grace_period: bool,
    pub eofr_frame: bool,
    pub skip_non_key_frames: bool,
    pub reset_generator_on_key_frame: bool,
    pub reset_generator_time: Option<Ticks>,
    pub new_session_ts: Option<Ticks>,
    pub new_session_index: Option<u64>,
    pub max_frame_size_seen: u64,

    pub diagnostics: Diagnostics,
    pub effects: Vec<Effect>,
}

impl StreamInner {
    pub(crate) fn emit(&mut self, notification: Notification) {
        self.effects.push(Effect::Notify(notification));
    }

    /// Whether the stream awaits the persisted ACK of its last fragment
    /// before finishing an upload session.
    pub(crate) fn wait_for_persisted_ack(&self) -> bool {
        self.info.fragment_acks && self.retention != 0
    }

    /// Duration and byte size still to upload: the current-to-head window
    /// plus the partially served item and any pending blob bytes.
    pub(crate) fn available_view_size(&self) -> (Ticks, u64) {
        let (duration, _) = self.view.window_duration();
        let (mut bytes, _) = self.view.window_byte_size();
        if let Some(cur) = &self.cur_item {
            bytes += u64::from(cur.item.length) - cur.offset as u64;
        }
        if self.metadata_tracker.send {
            bytes += self.metadata_tracker.data.len() as u64;
        }
        if self.eos_tracker.send {
            bytes += self.eos_tracker.data.len() as u64;
        }
        (duration, bytes)
    }

    /// Feeds one sample into the control/data plane latency EMA.
    pub(crate) fn record_call_latency(&mut self, control_plane: bool) {
        let latency = self.now.saturating_sub(self.last_call_after) as f64;
        if control_plane {
            self.diagnostics.control_plane_call_latency =
                ema_next(self.diagnostics.control_plane_call_latency, latency);
        } else {
            self.diagnostics.data_plane_call_latency =
                ema_next(self.diagnostics.data_plane_call_latency, latency);
        }
    }
}

/// One producer stream.
///
/// Created through [`Client::create_stream`]; the client retains ownership
/// and hands out `Arc`s.
pub struct Stream {
    name: String,
    info: Arc<StreamInfo>,
    client: Weak<Client>,
    self_ref: Weak<Stream>,
    inner: Mutex<StreamInner>,
    coordinator: Option<Mutex<FrameOrderCoordinator>>,
    signals: Arc<StreamSignals>,
    gate: EntryGate,
}

impl Stream {
    pub(crate) fn new(client: &Arc<Client>, info: StreamInfo) -> StreamResult<Arc<Self>> {
        info.validate()?;
        let info = Arc::new(info);
        let signals = Arc::new(StreamSignals::default());
        let generator = MkvGenerator::new(&info, client.config().client_id.as_str());

        let mut inner = StreamInner {
            info: info.clone(),
            signals: signals.clone(),
            now: client.clock().now(),
            machine: MachineCore::new(),
            indicator: state::STREAM_STATE_NEW,
            last_result: ServiceCallResult::NotSet,
            last_call_after: 0,
            view: ContentView::new(info.view_item_capacity()),
            generator,
            handles: UploadHandleList::new(),
            metadata_queue: VecDeque::new(),
            eos_tracker: BlobTracker::default(),
            metadata_tracker: BlobTracker::default(),
            ack_parser: FragmentAckParser::new(),
            ack_parser_handle: None,
            cur_item: None,
            connection_state: ConnectionState::Ok,
            connection_dropped_result: ServiceCallResult::NotSet,
            streaming_auth: None,
            streaming_endpoint: String::new(),
            arn: String::new(),
            stream_status: None,
            retention: info.retention,
            stream_stopped: false,
            stream_closed: false,
            stream_ready: false,
            shutdown: false,
            grace_period: false,
            eofr_frame: false,
            skip_non_key_frames: false,
            reset_generator_on_key_frame: false,
            reset_generator_time: None,
            new_session_ts: None,
            new_session_index: None,
            max_frame_size_seen: 0,
            diagnostics: Diagnostics::default(),
            effects: Vec::new(),
        };
        metadata::regenerate_eos_blob(&mut inner)?;

        let coordinator = if info.frame_order_mode == FrameOrderMode::PassThrough {
            None
        } else {
            Some(Mutex::new(FrameOrderCoordinator::new(&info)))
        };

        let stream = Arc::new_cyclic(|weak: &Weak<Stream>| Self {
            name: info.name.clone(),
            info,
            client: Arc::downgrade(client),
            self_ref: weak.clone(),
            inner: Mutex::new(inner),
            coordinator,
            signals,
            gate: EntryGate::new(),
        });

        // Prime the control plane: New -> Describe.
        let effects = {
            let mut inner = stream.inner.lock();
            inner.now = client.clock().now();
            state::step_stream(&mut inner)?;
            std::mem::take(&mut inner.effects)
        };
        stream.dispatch(client, effects);
        Ok(stream)
    }

    /// Stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Immutable stream configuration.
    #[must_use]
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn self_arc(&self) -> Arc<Stream> {
        self.self_ref
            .upgrade()
            .expect("a live stream always has an owner")
    }

    pub(crate) fn client(&self) -> StreamResult<Arc<Client>> {
        self.client
            .upgrade()
            .ok_or(StreamError::StreamHasBeenStopped)
    }

    /// Ingests one frame (or an end-of-fragment sentinel).
    pub fn put_frame(&self, frame: Frame) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;

        let released = match &self.coordinator {
            Some(coordinator) => match coordinator.lock().put(frame) {
                Ok(frames) => frames,
                Err(err) => {
                    self.inner.lock().diagnostics.put_frame_errors += 1;
                    return Err(err);
                }
            },
            None => vec![frame],
        };

        for frame in released {
            self.put_ordered_frame(&client, frame)?;
        }
        Ok(())
    }

    fn put_ordered_frame(&self, client: &Arc<Client>, frame: Frame) -> StreamResult<()> {
        let (result, effects) = {
            let mut guard = self.inner.lock();
            guard.now = client.clock().now();
            let result = put_frame::put_frame_locked(client, &mut guard, frame);
            if result.is_err() {
                guard.diagnostics.put_frame_errors += 1;
            }
            (result, std::mem::take(&mut guard.effects))
        };
        self.dispatch(client, effects);
        result
    }

    /// Fills `buf` with stream bytes for one upload session.
    pub fn get_stream_data(
        &self,
        handle: UploadHandle,
        buf: &mut [u8],
    ) -> StreamResult<StreamDataRead> {
        let _permit = self.gate.enter()?;
        if buf.is_empty() {
            return Err(StreamError::InvalidArgument("zero-sized buffer".into()));
        }
        let client = self.client()?;
        let (result, effects) = {
            let mut guard = self.inner.lock();
            guard.now = client.clock().now();
            let result = data::get_stream_data_locked(&client, &mut guard, handle, buf);
            (result, std::mem::take(&mut guard.effects))
        };
        self.dispatch(&client, effects);
        result
    }

    /// Queues a fragment metadata Tag for the next cluster boundary.
    pub fn put_fragment_metadata(
        &self,
        name: &str,
        value: &str,
        persistent: bool,
    ) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        self.with_locked(&client, |inner| {
            metadata::put_fragment_metadata(inner, name, value, persistent)
        })
    }

    /// Installs codec private data for a track. Rejected while streaming.
    pub fn stream_format_changed(
        &self,
        track_id: u64,
        codec_private_data: Vec<u8>,
    ) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        self.with_locked(&client, |inner| {
            let allowed = state::STREAM_STATE_NEW
                | state::STREAM_STATE_DESCRIBE
                | state::STREAM_STATE_CREATE
                | state::STREAM_STATE_GET_ENDPOINT
                | state::STREAM_STATE_GET_TOKEN
                | state::STREAM_STATE_READY
                | state::STREAM_STATE_STOPPED;
            if !state::machine_accepts(inner, allowed) {
                return Err(StreamError::InvalidStreamState);
            }
            inner
                .generator
                .set_codec_private_data(track_id, codec_private_data)
        })
    }

    /// Feeds raw ACK bytes from the upload connection into the parser,
    /// applying every completed acknowledgment.
    pub fn parse_fragment_ack(&self, handle: UploadHandle, segment: &[u8]) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        self.with_locked(&client, |inner| {
            if inner.ack_parser_handle != Some(handle) {
                inner.ack_parser.reset();
                inner.ack_parser_handle = Some(handle);
            }
            let acks = inner.ack_parser.feed(segment)?;
            for ack in acks {
                events::fragment_ack_locked(inner, handle, &ack)?;
            }
            Ok(())
        })
    }

    /// Applies one already-decoded fragment ACK.
    pub fn fragment_ack(&self, handle: UploadHandle, ack: &FragmentAck) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        self.with_locked(&client, |inner| {
            events::fragment_ack_locked(inner, handle, ack)
        })
    }

    /// Reports the result of a describe-stream call.
    pub fn describe_stream_result(
        &self,
        result: ServiceCallResult,
        description: Option<&StreamDescription>,
    ) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        self.with_locked(&client, |inner| {
            events::describe_stream_result_locked(inner, result, description)
        })
    }

    /// Reports the result of a create-stream call.
    pub fn create_stream_result(
        &self,
        result: ServiceCallResult,
        stream_arn: Option<&str>,
    ) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        self.with_locked(&client, |inner| {
            events::create_stream_result_locked(inner, result, stream_arn)
        })
    }

    /// Reports the result of a tag-resource call for the stream.
    pub fn tag_stream_result(&self, result: ServiceCallResult) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        self.with_locked(&client, |inner| {
            events::tag_stream_result_locked(inner, result)
        })
    }

    /// Reports the result of a get-streaming-endpoint call.
    pub fn get_streaming_endpoint_result(
        &self,
        result: ServiceCallResult,
        endpoint: Option<&str>,
    ) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        self.with_locked(&client, |inner| {
            events::get_streaming_endpoint_result_locked(inner, result, endpoint)
        })
    }

    /// Reports the result of a get-streaming-token call.
    pub fn get_streaming_token_result(
        &self,
        result: ServiceCallResult,
        token: Option<AuthInfo>,
    ) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        self.with_locked(&client, |inner| {
            events::get_streaming_token_result_locked(inner, result, token)
        })
    }

    /// Reports the result of a put-stream call; on success registers the
    /// host-issued upload handle.
    pub fn put_stream_result(
        &self,
        result: ServiceCallResult,
        handle: Option<UploadHandle>,
    ) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        self.with_locked(&client, |inner| {
            events::put_stream_result_locked(inner, result, handle)
        })
    }

    /// Reports that an upload connection terminated.
    pub fn stream_terminated(
        &self,
        handle: Option<UploadHandle>,
        result: ServiceCallResult,
        connection_still_alive: bool,
    ) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        self.with_locked(&client, |inner| {
            events::stream_terminated_locked(inner, handle, result, connection_still_alive)
        })
    }

    /// Tears down every upload session and re-primes the control plane.
    /// Used by hosts that detect a wedged connection.
    pub fn reset_connection(&self) -> StreamResult<()> {
        self.stream_terminated(None, ServiceCallResult::Ok, true)
    }

    /// Stops the stream: flushes the coordinator, packages any unsent
    /// metadata, and lets active upload sessions drain to end-of-stream.
    pub fn stop(&self) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;

        if let Some(coordinator) = &self.coordinator {
            let released = coordinator.lock().flush();
            for frame in released {
                if let Err(err) = self.put_ordered_frame(&client, frame) {
                    log::error!("[Stream] {}: flush during stop failed: {err}", self.name);
                }
            }
        }

        self.with_locked(&client, |inner| {
            if inner.stream_stopped {
                return Ok(());
            }
            inner.stream_stopped = true;
            log::info!("[Stream] {} stopping", inner.info.name);

            if inner.info.streaming_mode.is_offline() {
                inner.signals.buffer_availability.notify_all();
            }

            if metadata::has_unsent_metadata(inner) {
                metadata::package_unsent_metadata(inner)?;
            }

            let (mut duration, mut bytes) = inner.available_view_size();
            if inner.metadata_tracker.send && duration == 0 {
                // Keep the upload connection open for the trailing bytes.
                duration = 1;
                bytes = (inner.metadata_tracker.data.len() + inner.eos_tracker.data.len()) as u64;
            }

            let mut pulsed = false;
            if let Some(info) = inner.handles.first_in_state(HANDLE_STATE_ACTIVE) {
                let handle = info.handle;
                inner.emit(Notification::DataAvailable {
                    handle,
                    duration,
                    bytes,
                });
                pulsed = true;
            }

            if !pulsed
                && bytes == 0
                && inner.handles.is_empty()
                && !inner.metadata_tracker.send
                && !inner.eos_tracker.send
            {
                events::notify_stream_closed(inner, None);
            }
            Ok(())
        })
    }

    /// Stops the stream and waits until every buffered byte drained (or
    /// the stop timeout elapses).
    pub fn stop_sync(&self) -> StreamResult<()> {
        self.stop()?;
        let client = self.client()?;
        let timeout = client.config().stop_stream_timeout;

        let mut guard = self.inner.lock();
        while !guard.stream_closed && !guard.shutdown {
            if self
                .signals
                .closed
                .wait_for(&mut guard, ticks_to_duration(timeout))
                .timed_out()
            {
                log::error!("[Stream] {} stop timed out", self.name);
                return Err(StreamError::OperationTimedOut);
            }
        }
        Ok(())
    }

    /// Drops all buffered content and restarts the stream from a fresh
    /// container and control-plane pass, preserving the configuration.
    pub fn reset(&self) -> StreamResult<()> {
        let _permit = self.gate.enter()?;
        let client = self.client()?;
        client.observer().stream_shutdown(&self.self_arc(), true);

        if let Some(coordinator) = &self.coordinator {
            let _ = coordinator.lock().flush();
        }

        let effects = {
            let mut inner = self.inner.lock();
            inner.now = client.clock().now();

            let evicted = inner.view.remove_all();
            {
                let mut store = client.store().lock();
                for e in &evicted {
                    let _ = store.free(e.item.handle);
                }
            }
            inner.cur_item = None;

            inner.handles = UploadHandleList::new();
            inner.metadata_queue.retain(|m| m.persistent);
            for entry in inner.metadata_queue.iter_mut() {
                entry.applied = false;
            }
            inner.metadata_tracker = BlobTracker::default();
            inner.ack_parser.reset();
            inner.ack_parser_handle = None;
            inner.generator.reset();
            metadata::regenerate_eos_blob(&mut inner)?;

            inner.machine.reset();
            inner.indicator = state::STREAM_STATE_NEW;
            inner.last_result = ServiceCallResult::NotSet;
            inner.connection_state = ConnectionState::Ok;
            inner.connection_dropped_result = ServiceCallResult::NotSet;
            inner.streaming_auth = None;
            inner.grace_period = false;
            inner.eofr_frame = false;
            inner.skip_non_key_frames = false;
            inner.reset_generator_on_key_frame = false;
            inner.reset_generator_time = None;
            inner.new_session_ts = None;
            inner.new_session_index = None;
            inner.stream_stopped = false;
            inner.stream_closed = false;
            inner.stream_ready = false;

            state::step_stream(&mut inner)?;
            std::mem::take(&mut inner.effects)
        };
        self.dispatch(&client, effects);
        Ok(())
    }

    /// Current stream metrics.
    pub fn metrics(&self) -> StreamResult<StreamMetrics> {
        let _permit = self.gate.enter()?;
        let inner = self.inner.lock();
        let (current_dur, overall_dur) = inner.view.window_duration();
        let (current_bytes, overall_bytes) = inner.view.window_byte_size();
        let d = &inner.diagnostics;
        Ok(StreamMetrics {
            current_view_duration: current_dur,
            overall_view_duration: overall_dur,
            current_view_bytes: current_bytes,
            overall_view_bytes: overall_bytes,
            current_frame_rate: d.current_frame_rate,
            current_transfer_rate: d.current_transfer_rate as u64,
            transferred_bytes: d.transferred_bytes,
            put_frame_errors: d.put_frame_errors,
            skipped_frames: d.skipped_frames,
            dropped_frames: d.dropped_frames,
            storage_pressures: d.storage_pressures,
            buffer_duration_pressures: d.buffer_pressures,
            latency_pressures: d.latency_pressures,
            stale_events: d.stale_events,
            buffering_acks: d.buffering_acks,
            received_acks: d.received_acks,
            persisted_acks: d.persisted_acks,
            error_acks: d.error_acks,
            idle_acks: d.idle_acks,
            total_sessions: d.total_sessions,
            total_active_sessions: d.total_active_sessions,
            control_plane_call_latency: d.control_plane_call_latency as Ticks,
            data_plane_call_latency: d.data_plane_call_latency as Ticks,
        })
    }

    /// Waits for the stream to reach the ready state.
    pub(crate) fn await_ready(&self, timeout: Ticks) -> StreamResult<()> {
        let mut guard = self.inner.lock();
        while !guard.stream_ready {
            if guard.shutdown {
                return Err(StreamError::StreamHasBeenStopped);
            }
            if self
                .signals
                .ready
                .wait_for(&mut guard, ticks_to_duration(timeout))
                .timed_out()
            {
                return Err(StreamError::InvalidStreamReadyState);
            }
        }
        Ok(())
    }

    /// Marks the stream for teardown: locks the entry gate, wakes every
    /// blocked waiter, and drains in-flight calls.
    pub(crate) fn shutdown(&self, client: &Arc<Client>) {
        {
            let mut inner = self.inner.lock();
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
        }
        client.observer().stream_shutdown(&self.self_arc(), false);
        self.gate.lock();
        self.signals.ready.notify_all();
        self.signals.buffer_availability.notify_all();
        self.signals.closed.notify_all();
        if let Err(err) = self.gate.wait_until_clear(client.config().shutdown_timeout) {
            log::warn!("[Stream] {}: shutdown drain incomplete: {err}", self.name);
        }

        // Release remaining buffered storage.
        let mut inner = self.inner.lock();
        let evicted = inner.view.remove_all();
        let mut store = client.store().lock();
        for e in &evicted {
            let _ = store.free(e.item.handle);
        }
        inner.cur_item = None;
    }

    fn with_locked<R>(
        &self,
        client: &Arc<Client>,
        f: impl FnOnce(&mut StreamInner) -> StreamResult<R>,
    ) -> StreamResult<R> {
        let (result, effects) = {
            let mut inner = self.inner.lock();
            inner.now = client.clock().now();
            let result = f(&mut inner);
            (result, std::mem::take(&mut inner.effects))
        };
        self.dispatch(client, effects);
        result
    }

    /// Runs queued outbound calls with no stream lock held.
    fn dispatch(&self, client: &Arc<Client>, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }
        let this = self.self_arc();
        for effect in effects {
            match effect {
                Effect::DescribeStream { call_after } => {
                    let ctx = self.control_ctx(client, call_after);
                    client.backend().describe_stream(&this, &self.name, &ctx);
                }
                Effect::CreateStream { call_after } => {
                    let ctx = self.control_ctx(client, call_after);
                    client.backend().create_stream(
                        &this,
                        &client.config().device_name,
                        &self.name,
                        &self.info.content_type,
                        &self.info.kms_key_id,
                        self.info.retention,
                        &ctx,
                    );
                }
                Effect::TagStream { call_after, arn } => {
                    let ctx = self.control_ctx(client, call_after);
                    client
                        .backend()
                        .tag_stream(&this, &arn, &self.info.tags, &ctx);
                }
                Effect::GetEndpoint { call_after } => {
                    let ctx = self.control_ctx(client, call_after);
                    client.backend().get_streaming_endpoint(
                        &this,
                        &self.name,
                        PUT_MEDIA_API_NAME,
                        &ctx,
                    );
                }
                Effect::GetToken { call_after } => {
                    let ctx = self.control_ctx(client, call_after);
                    client.backend().get_streaming_token(&this, &self.name, &ctx);
                }
                Effect::PutStream {
                    call_after,
                    start_time,
                    endpoint,
                    auth,
                } => {
                    let ctx = ServiceCallContext {
                        call_after,
                        timeout: Ticks::MAX,
                        auth,
                    };
                    client.backend().put_stream(
                        &this,
                        &self.name,
                        MKV_CONTAINER_TYPE,
                        start_time,
                        self.info.absolute_fragment_times,
                        self.info.fragment_acks,
                        &endpoint,
                        &ctx,
                    );
                }
                Effect::ReleaseStorage { allocations } => {
                    {
                        let mut store = client.store().lock();
                        for handle in allocations {
                            let _ = store.free(handle);
                        }
                    }
                    self.signals.buffer_availability.notify_all();
                }
                Effect::Notify(notification) => {
                    self.dispatch_notification(client, &this, notification)
                }
            }
        }
    }

    fn control_ctx(&self, client: &Arc<Client>, call_after: Ticks) -> ServiceCallContext {
        ServiceCallContext {
            call_after,
            timeout: SERVICE_CALL_DEFAULT_TIMEOUT,
            auth: client.credentials().security_token(),
        }
    }

    fn dispatch_notification(
        &self,
        client: &Arc<Client>,
        this: &Arc<Stream>,
        notification: Notification,
    ) {
        let observer = client.observer();
        match notification {
            Notification::StreamReady => observer.stream_ready(this),
            Notification::DataAvailable {
                handle,
                duration,
                bytes,
            } => observer.data_available(this, handle, duration, bytes),
            Notification::DroppedFrame { ts } => observer.dropped_frame(this, ts),
            Notification::DroppedFragment { ts } => observer.dropped_fragment(this, ts),
            Notification::StoragePressure { remaining } => observer.storage_pressure(this, remaining),
            Notification::BufferDurationPressure { remaining } => {
                observer.buffer_duration_pressure(this, remaining)
            }
            Notification::LatencyPressure { duration } => observer.latency_pressure(this, duration),
            Notification::ConnectionStale { since } => observer.connection_stale(this, since),
            Notification::StreamError { handle, ts, error } => {
                observer.stream_error(this, handle, ts, &error)
            }
            Notification::AckReceived { handle, ack } => {
                observer.fragment_ack_received(this, handle, &ack)
            }
            Notification::StreamClosed { handle } => observer.stream_closed(this, handle),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("name", &self.name).finish()
    }
}
