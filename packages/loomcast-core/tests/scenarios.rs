//! End-to-end scenarios against an in-process loopback control plane.
//!
//! The mock backend answers every control-plane call synchronously, so a
//! stream walks describe -> create -> get-endpoint -> get-token -> ready
//! -> put-stream -> streaming during `create_stream_sync` and the first
//! `put_frame`. Tests then drive the uploader side directly through
//! `get_stream_data` and inject ACKs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use loomcast_core::ack::{AckType, FragmentAck};
use loomcast_core::callbacks::{
    AnonymousCredentials, AuthInfo, ProducerObserver, ServiceBackend, ServiceCallContext,
    StreamDescription, StreamStatus,
};
use loomcast_core::client::Client;
use loomcast_core::config::{
    ClientConfig, StreamInfo, StreamingMode, TrackInfo, TrackParams, TrackType, VideoTrackParams,
};
use loomcast_core::error::{ServiceCallResult, StreamError};
use loomcast_core::frame::{Frame, FRAME_FLAG_KEY_FRAME, FRAME_FLAG_NONE};
use loomcast_core::stream::{DataOutcome, Stream};
use loomcast_core::time::{Clock, Ticks, TICKS_PER_MILLISECOND, TICKS_PER_SECOND};
use loomcast_core::UploadHandle;

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
const CLUSTER_MAGIC: [u8; 4] = [0x1F, 0x43, 0xB6, 0x75];

/// Controllable wall clock.
struct TestClock(AtomicU64);

impl TestClock {
    fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(1_000_000 * TICKS_PER_SECOND)))
    }

    fn advance(&self, ticks: Ticks) {
        self.0.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Ticks {
        self.0.load(Ordering::SeqCst)
    }
}

/// Backend that completes every call inline with a success.
struct LoopbackBackend {
    clock: Arc<TestClock>,
    next_handle: AtomicU64,
    token_lifetime: Ticks,
}

impl LoopbackBackend {
    fn new(clock: Arc<TestClock>) -> Self {
        Self {
            clock,
            next_handle: AtomicU64::new(1),
            token_lifetime: 60 * TICKS_PER_SECOND,
        }
    }
}

impl ServiceBackend for LoopbackBackend {
    fn describe_stream(&self, stream: &Arc<Stream>, stream_name: &str, _ctx: &ServiceCallContext) {
        let description = StreamDescription {
            stream_name: stream_name.to_string(),
            stream_arn: format!("arn:test:stream/{stream_name}"),
            content_type: stream.info().content_type.clone(),
            kms_key_id: String::new(),
            retention: stream.info().retention,
            status: StreamStatus::Active,
        };
        stream
            .describe_stream_result(ServiceCallResult::Ok, Some(&description))
            .expect("describe result");
    }

    fn create_stream(
        &self,
        stream: &Arc<Stream>,
        _device_name: &str,
        stream_name: &str,
        _content_type: &str,
        _kms_key_id: &str,
        _retention: Ticks,
        _ctx: &ServiceCallContext,
    ) {
        stream
            .create_stream_result(
                ServiceCallResult::Ok,
                Some(&format!("arn:test:stream/{stream_name}")),
            )
            .expect("create result");
    }

    fn tag_stream(
        &self,
        stream: &Arc<Stream>,
        _stream_arn: &str,
        _tags: &[(String, String)],
        _ctx: &ServiceCallContext,
    ) {
        stream
            .tag_stream_result(ServiceCallResult::Ok)
            .expect("tag result");
    }

    fn get_streaming_endpoint(
        &self,
        stream: &Arc<Stream>,
        _stream_name: &str,
        _api_name: &str,
        _ctx: &ServiceCallContext,
    ) {
        stream
            .get_streaming_endpoint_result(ServiceCallResult::Ok, Some("https://ingest.loopback"))
            .expect("endpoint result");
    }

    fn get_streaming_token(
        &self,
        stream: &Arc<Stream>,
        _stream_name: &str,
        _ctx: &ServiceCallContext,
    ) {
        let token = AuthInfo {
            data: Bytes::from_static(b"loopback-token"),
            expiration: self.clock.now() + self.token_lifetime,
        };
        stream
            .get_streaming_token_result(ServiceCallResult::Ok, Some(token))
            .expect("token result");
    }

    fn put_stream(
        &self,
        stream: &Arc<Stream>,
        _stream_name: &str,
        _container_type: &str,
        _start_time: Ticks,
        _absolute_fragment_times: bool,
        _ack_enabled: bool,
        _endpoint: &str,
        _ctx: &ServiceCallContext,
    ) {
        let handle = UploadHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        stream
            .put_stream_result(ServiceCallResult::Ok, Some(handle))
            .expect("put stream result");
    }
}

/// Observer that records interesting notifications.
#[derive(Default)]
struct RecordingObserver {
    data_available: Mutex<Vec<(u64, u64)>>,
    acks: Mutex<Vec<AckType>>,
    errors: Mutex<Vec<StreamError>>,
    dropped_frames: AtomicU64,
    closed: AtomicU64,
}

impl ProducerObserver for RecordingObserver {
    fn data_available(
        &self,
        _stream: &Arc<Stream>,
        handle: UploadHandle,
        _buffered_duration: Ticks,
        buffered_bytes: u64,
    ) {
        self.data_available.lock().unwrap().push((handle.0, buffered_bytes));
    }

    fn fragment_ack_received(&self, _stream: &Arc<Stream>, _handle: UploadHandle, ack: &FragmentAck) {
        self.acks.lock().unwrap().push(ack.ack_type);
    }

    fn stream_error(
        &self,
        _stream: &Arc<Stream>,
        _handle: Option<UploadHandle>,
        _fragment_timestamp: Option<Ticks>,
        error: &StreamError,
    ) {
        self.errors.lock().unwrap().push(error.clone());
    }

    fn dropped_frame(&self, _stream: &Arc<Stream>, _timestamp: Ticks) {
        self.dropped_frames.fetch_add(1, Ordering::SeqCst);
    }

    fn stream_closed(&self, _stream: &Arc<Stream>, _handle: Option<UploadHandle>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    clock: Arc<TestClock>,
    observer: Arc<RecordingObserver>,
    client: Arc<Client>,
}

fn harness() -> Harness {
    let clock = TestClock::new();
    let observer = Arc::new(RecordingObserver::default());
    let backend = Arc::new(LoopbackBackend::new(clock.clone()));
    let client = Client::with_parts(
        ClientConfig {
            storage_size: 16 * 1024 * 1024,
            ..ClientConfig::default()
        },
        backend,
        observer.clone(),
        Arc::new(AnonymousCredentials),
        clock.clone(),
    )
    .expect("client");
    Harness {
        clock,
        observer,
        client,
    }
}

fn video_info(name: &str) -> StreamInfo {
    StreamInfo {
        name: name.into(),
        retention: 24 * 3600 * TICKS_PER_SECOND,
        streaming_mode: StreamingMode::Realtime,
        absolute_fragment_times: true,
        fragment_acks: true,
        key_frame_fragmentation: true,
        frame_rate: 30,
        buffer_duration: 120 * TICKS_PER_SECOND,
        replay_duration: 40 * TICKS_PER_SECOND,
        segment_uuid: Some([0x42; 16]),
        tracks: vec![TrackInfo {
            track_id: 1,
            track_type: TrackType::Video,
            codec_id: "V_MPEG4/ISO/AVC".into(),
            track_name: "video".into(),
            codec_private_data: None,
            params: TrackParams::Video(VideoTrackParams {
                width: 1280,
                height: 720,
            }),
        }],
        ..StreamInfo::default()
    }
}

fn frame(n: u64, key_every: u64) -> Frame {
    let key = n % key_every == 0;
    Frame {
        track_id: 1,
        flags: if key { FRAME_FLAG_KEY_FRAME } else { FRAME_FLAG_NONE },
        presentation_ts: n * 33 * TICKS_PER_MILLISECOND,
        decoding_ts: n * 33 * TICKS_PER_MILLISECOND,
        duration: 33 * TICKS_PER_MILLISECOND,
        data: Bytes::from(vec![(n % 251) as u8; 512]),
    }
}

fn first_pulsed_handle(observer: &RecordingObserver) -> UploadHandle {
    let pulses = observer.data_available.lock().unwrap();
    UploadHandle(pulses.first().expect("a data-available pulse").0)
}

/// Reads until the stream signals something other than a full buffer.
fn read_until_signal(stream: &Arc<Stream>, handle: UploadHandle) -> (Vec<u8>, DataOutcome) {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = stream.get_stream_data(handle, &mut buf).expect("read");
        out.extend_from_slice(&buf[..read.filled]);
        if read.outcome != DataOutcome::Filled {
            return (out, read.outcome);
        }
    }
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

#[test]
fn handshake_reaches_streaming_and_serves_mkv() {
    let h = harness();
    let stream = h.client.create_stream_sync(video_info("cam-0")).unwrap();

    for n in 0..30 {
        stream.put_frame(frame(n, 30)).unwrap();
    }
    let handle = first_pulsed_handle(&h.observer);
    let (bytes, outcome) = read_until_signal(&stream, handle);

    assert_eq!(outcome, DataOutcome::NoMoreData);
    assert!(bytes.starts_with(&EBML_MAGIC), "stream begins with a header");
    assert_eq!(count_occurrences(&bytes, &CLUSTER_MAGIC), 1);

    let metrics = stream.metrics().unwrap();
    assert_eq!(metrics.current_view_bytes, 0, "everything was served");
    assert!(metrics.overall_view_bytes as usize <= bytes.len());
}

/// S1: persisted ACK for the first fragment trims it; the reader resumes
/// at the next fragment boundary with continuous bytes.
#[test]
fn persisted_ack_trims_first_fragment() {
    let h = harness();
    let stream = h.client.create_stream_sync(video_info("cam-s1")).unwrap();

    for n in 0..46 {
        stream.put_frame(frame(n, 30)).unwrap();
    }
    let handle = first_pulsed_handle(&h.observer);
    let in_use_before = h.client.metrics().storage_in_use;

    // Fragment F1 starts at timecode 0 (1 ms timecode scale).
    stream
        .fragment_ack(
            handle,
            &FragmentAck {
                ack_type: AckType::Persisted,
                timecode: Some(0),
                sequence_number: None,
                result: ServiceCallResult::Ok,
            },
        )
        .unwrap();

    assert!(
        h.client.metrics().storage_in_use < in_use_before,
        "trimmed allocations were released"
    );

    for n in 46..90 {
        stream.put_frame(frame(n, 30)).unwrap();
    }

    let metrics = stream.metrics().unwrap();
    // Items 0..30 left the window: 60 frames of 33 ms remain.
    assert_eq!(
        metrics.overall_view_duration,
        60 * 33 * TICKS_PER_MILLISECOND
    );
    assert_eq!(metrics.persisted_acks, 1);

    let (bytes, outcome) = read_until_signal(&stream, handle);
    assert_eq!(outcome, DataOutcome::NoMoreData);
    // Serving resumes at the fragment boundary of frame 30: a cluster,
    // not a stream header.
    assert!(bytes.starts_with(&CLUSTER_MAGIC));
    assert_eq!(count_occurrences(&bytes, &CLUSTER_MAGIC), 2);
}

/// S3: a persisted ACK covers every fragment up to and including itself.
#[test]
fn persisted_ack_covers_preceding_fragments() {
    let h = harness();
    let stream = h.client.create_stream_sync(video_info("cam-s3")).unwrap();

    // Five fragments of ten frames each.
    for n in 0..50 {
        stream.put_frame(frame(n, 10)).unwrap();
    }
    let handle = first_pulsed_handle(&h.observer);

    // F3 starts at frame 20.
    stream
        .fragment_ack(
            handle,
            &FragmentAck {
                ack_type: AckType::Persisted,
                timecode: Some(20 * 33),
                sequence_number: None,
                result: ServiceCallResult::Ok,
            },
        )
        .unwrap();

    let metrics = stream.metrics().unwrap();
    // F1..F3 trimmed; F4 and F5 remain (20 frames).
    assert_eq!(
        metrics.overall_view_duration,
        20 * 33 * TICKS_PER_MILLISECOND
    );
}

/// S4: a non-retriable error ACK poisons the failed fragment, reports the
/// error, and the next session skips the poisoned items.
#[test]
fn non_retriable_error_ack_skips_fragment() {
    let h = harness();
    let stream = h.client.create_stream_sync(video_info("cam-s4")).unwrap();

    // Three fragments of ten frames.
    for n in 0..30 {
        stream.put_frame(frame(n, 10)).unwrap();
    }
    let h1 = first_pulsed_handle(&h.observer);
    // Serve everything once so the session is live.
    let (_, outcome) = read_until_signal(&stream, h1);
    assert_eq!(outcome, DataOutcome::NoMoreData);

    // Backend rejects F2 (starts at frame 10) with invalid-MKV-data.
    stream
        .fragment_ack(
            h1,
            &FragmentAck {
                ack_type: AckType::Error,
                timecode: Some(10 * 33),
                sequence_number: None,
                result: ServiceCallResult::from_ack_error_id(4006),
            },
        )
        .unwrap();

    assert!(
        h.observer
            .errors
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, StreamError::ServiceCall(ServiceCallResult::AckInvalidMkvData))),
        "stream error was reported"
    );
    let metrics = stream.metrics().unwrap();
    assert_eq!(metrics.error_acks, 1);
    assert_eq!(metrics.skipped_frames, 10, "all of F2 was poisoned");

    // The termination spawned a fresh session; the old handle drains to
    // its end-of-stream and the new one replays without F2.
    let (_, outcome) = read_until_signal(&stream, h1);
    assert_eq!(outcome, DataOutcome::EndOfStream);

    let h2 = {
        let pulses = h.observer.data_available.lock().unwrap();
        UploadHandle(pulses.last().expect("new session pulse").0)
    };
    assert_ne!(h2, h1);
    let (bytes, _) = read_until_signal(&stream, h2);
    assert!(bytes.starts_with(&EBML_MAGIC), "replay starts a new container");
    // F1 and F3 replay; the poisoned F2 cluster is absent.
    assert_eq!(count_occurrences(&bytes, &CLUSTER_MAGIC), 2);
}

/// S5: byte-at-a-time ACK feeding produces exactly one decoded ACK.
#[test]
fn ack_parser_handles_partial_feed_through_stream() {
    let h = harness();
    let stream = h.client.create_stream_sync(video_info("cam-s5")).unwrap();
    for n in 0..10 {
        stream.put_frame(frame(n, 10)).unwrap();
    }
    let handle = first_pulsed_handle(&h.observer);

    let payload = br#"{"EventType":"RECEIVED","FragmentTimecode":0}"#;
    for byte in payload.iter() {
        stream
            .parse_fragment_ack(handle, std::slice::from_ref(byte))
            .unwrap();
    }
    assert_eq!(h.observer.acks.lock().unwrap().as_slice(), &[AckType::Received]);
    assert_eq!(stream.metrics().unwrap().received_acks, 1);
}

/// S2: token rotation rolls the container over at the next key frame and
/// hands the stream from the old session to the new one.
#[test]
fn token_rotation_rotates_upload_sessions() {
    let h = harness();
    let mut info = video_info("cam-s2");
    // No retention: the draining session terminates without awaiting ACKs.
    info.retention = 0;
    let stream = h.client.create_stream_sync(info).unwrap();

    for n in 0..10 {
        stream.put_frame(frame(n, 10)).unwrap();
    }
    let h1 = first_pulsed_handle(&h.observer);
    let (bytes, _) = read_until_signal(&stream, h1);
    assert!(bytes.starts_with(&EBML_MAGIC));

    // Enter the grace window (token lives 60 s, grace is 3 s).
    h.clock.advance(58 * TICKS_PER_SECOND);
    stream.put_frame(frame(10, 10)).unwrap();

    // Past the scheduled generator reset: the next key frame opens a new
    // container and a second upload session exists.
    h.clock.advance(5 * TICKS_PER_SECOND);
    for n in 11..21 {
        stream.put_frame(frame(n, 10)).unwrap();
    }

    // The old session serves up to the new container boundary, then ends.
    let (tail_bytes, outcome) = read_until_signal(&stream, h1);
    assert_eq!(outcome, DataOutcome::EndOfStream);
    assert!(
        !tail_bytes.is_empty(),
        "old session drained its remaining frames and trailing tags"
    );

    // The new session starts at the fresh stream header.
    let handles: Vec<u64> = h
        .observer
        .data_available
        .lock()
        .unwrap()
        .iter()
        .map(|(h, _)| *h)
        .collect();
    let h2 = UploadHandle(*handles.iter().max().unwrap());
    assert_ne!(h2, h1);
    let (bytes, _) = read_until_signal(&stream, h2);
    assert!(bytes.starts_with(&EBML_MAGIC));
}

/// Invariant 7: after a stop, live sessions drain and report end-of-stream.
#[test]
fn stop_drains_to_end_of_stream_and_closes() {
    let h = harness();
    let mut info = video_info("cam-stop");
    info.retention = 0;
    let stream = h.client.create_stream_sync(info).unwrap();

    for n in 0..12 {
        stream.put_frame(frame(n, 10)).unwrap();
    }
    let handle = first_pulsed_handle(&h.observer);
    stream.stop().unwrap();

    let (bytes, outcome) = read_until_signal(&stream, handle);
    assert_eq!(outcome, DataOutcome::EndOfStream);
    assert!(bytes.starts_with(&EBML_MAGIC));
    assert_eq!(h.observer.closed.load(Ordering::SeqCst), 1);

    // Synchronous stop returns immediately once closed.
    stream.stop_sync().unwrap();

    // A stopped stream rejects further frames.
    assert!(matches!(
        stream.put_frame(frame(99, 10)),
        Err(StreamError::StreamHasBeenStopped)
    ));
}

/// Round-trip law: reset followed by the same frames produces the same
/// bytes as a fresh stream when the segment UUID is pinned.
#[test]
fn reset_replays_identically_with_pinned_uuid() {
    let produce = |stream: &Arc<Stream>, observer: &RecordingObserver| {
        for n in 0..10 {
            stream.put_frame(frame(n, 10)).unwrap();
        }
        let handle = {
            let pulses = observer.data_available.lock().unwrap();
            UploadHandle(pulses.last().expect("pulse").0)
        };
        read_until_signal(stream, handle).0
    };

    let h1 = harness();
    let stream = h1.client.create_stream_sync(video_info("cam-rt")).unwrap();
    let first = produce(&stream, &h1.observer);

    stream.reset().unwrap();
    let after_reset = produce(&stream, &h1.observer);

    let h2 = harness();
    let fresh_stream = h2.client.create_stream_sync(video_info("cam-rt")).unwrap();
    let fresh = produce(&fresh_stream, &h2.observer);

    assert_eq!(first, fresh);
    assert_eq!(after_reset, fresh);
}

/// Offline mode: a blocked producer is interrupted by stream shutdown.
#[test]
fn offline_blocked_put_interrupted_by_stop() {
    let clock = TestClock::new();
    let observer = Arc::new(RecordingObserver::default());
    let backend = Arc::new(LoopbackBackend::new(clock.clone()));
    let client = Client::with_parts(
        ClientConfig {
            // Small enough that a few frames exhaust the budget.
            storage_size: 96 * 1024,
            offline_buffer_availability_timeout: 30 * TICKS_PER_SECOND,
            ..ClientConfig::default()
        },
        backend,
        observer,
        Arc::new(AnonymousCredentials),
        clock,
    )
    .unwrap();

    let mut info = video_info("cam-offline");
    info.streaming_mode = StreamingMode::Offline;
    let stream = client.create_stream_sync(info).unwrap();

    let producer = {
        let stream = stream.clone();
        std::thread::spawn(move || {
            for n in 0..1000 {
                // 64 KiB frames against a 96 KiB budget block quickly.
                let big = Frame {
                    data: Bytes::from(vec![0u8; 64 * 1024]),
                    ..frame(n, 10)
                };
                if let Err(err) = stream.put_frame(big) {
                    return err;
                }
            }
            panic!("producer never blocked");
        })
    };

    std::thread::sleep(std::time::Duration::from_millis(100));
    stream.stop().unwrap();
    let err = producer.join().unwrap();
    assert!(matches!(
        err,
        StreamError::BlockingPutInterrupted | StreamError::StreamHasBeenStopped
    ));
}

/// Boundary behavior: two end-of-fragment sentinels in a row are rejected.
#[test]
fn consecutive_eofr_is_rejected() {
    let h = harness();
    let stream = h.client.create_stream_sync(video_info("cam-eofr")).unwrap();

    stream.put_frame(frame(0, 1)).unwrap();
    stream.put_frame(Frame::eofr()).unwrap();
    assert!(matches!(
        stream.put_frame(Frame::eofr()),
        Err(StreamError::MultipleConsecutiveEofr)
    ));
    assert!(stream.metrics().unwrap().put_frame_errors >= 1);
}

/// Boundary behavior: a zero-sized read buffer is an invalid argument.
#[test]
fn zero_sized_read_buffer_is_invalid() {
    let h = harness();
    let stream = h.client.create_stream_sync(video_info("cam-zb")).unwrap();
    stream.put_frame(frame(0, 10)).unwrap();
    let handle = first_pulsed_handle(&h.observer);
    assert!(matches!(
        stream.get_stream_data(handle, &mut []),
        Err(StreamError::InvalidArgument(_))
    ));
}

/// Boundary behavior: ACKs older than the retained window are surfaced as
/// out-of-window but still reach the ack-received notification.
#[test]
fn stale_ack_is_counted_but_not_correlated() {
    let h = harness();
    let stream = h.client.create_stream_sync(video_info("cam-stale")).unwrap();
    for n in 30..40 {
        stream.put_frame(frame(n, 10)).unwrap();
    }
    let handle = first_pulsed_handle(&h.observer);

    let result = stream.fragment_ack(
        handle,
        &FragmentAck {
            ack_type: AckType::Buffering,
            timecode: Some(1), // predates the tail at frame 30
            sequence_number: None,
            result: ServiceCallResult::Ok,
        },
    );
    assert!(matches!(result, Err(StreamError::AckTimestampNotInView)));
    assert_eq!(h.observer.acks.lock().unwrap().len(), 1);
    assert_eq!(stream.metrics().unwrap().buffering_acks, 0);
}

/// Fragment metadata is emitted ahead of the next cluster.
#[test]
fn fragment_metadata_flushes_at_cluster_boundary() {
    let h = harness();
    let stream = h.client.create_stream_sync(video_info("cam-meta")).unwrap();

    stream.put_frame(frame(0, 10)).unwrap();
    stream
        .put_fragment_metadata("SCENE", "parking-lot", false)
        .unwrap();
    // Reserved names are rejected.
    assert!(stream
        .put_fragment_metadata("AWS_INTERNAL", "x", false)
        .is_err());

    // Next fragment boundary carries the tag.
    for n in 1..11 {
        stream.put_frame(frame(n, 10)).unwrap();
    }
    let handle = first_pulsed_handle(&h.observer);
    let (bytes, _) = read_until_signal(&stream, handle);

    let needle = b"SCENE";
    assert_eq!(count_occurrences(&bytes, needle), 1, "tag emitted once");
    let tag_pos = bytes
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap();
    let second_cluster = bytes
        .windows(4)
        .enumerate()
        .filter(|(_, w)| *w == CLUSTER_MAGIC)
        .nth(1)
        .map(|(i, _)| i)
        .unwrap();
    assert!(
        tag_pos < second_cluster,
        "metadata precedes the cluster it announces"
    );
}
