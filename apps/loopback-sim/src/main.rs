//! Loomcast loopback simulator.
//!
//! Exercises the producer library end to end without a network: an
//! in-process control plane answers every service call, a producer thread
//! puts synthetic frames, and an uploader thread drains `get_stream_data`
//! into a file (or the void), echoing buffering/persisted ACKs back per
//! fragment the way the ingestion service would.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use parking_lot::Mutex;

use loomcast_core::{
    AuthInfo, Client, ClientConfig, DataOutcome, Frame, ProducerObserver, ServiceBackend,
    ServiceCallContext, ServiceCallResult, Stream, StreamDescription, StreamInfo, StreamStatus,
    StreamingMode, SystemClock, Ticks, TrackInfo, TrackParams, TrackType, UploadHandle,
    VideoTrackParams, FRAME_FLAG_KEY_FRAME, FRAME_FLAG_NONE,
};
use loomcast_core::time::{Clock, TICKS_PER_MILLISECOND, TICKS_PER_SECOND};

/// Loomcast loopback simulator - produce synthetic frames through the
/// full packaging/buffering/upload pipeline.
#[derive(Parser, Debug)]
#[command(name = "loopback-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stream name.
    #[arg(short, long, default_value = "loopback-stream")]
    stream_name: String,

    /// Seconds of synthetic video to produce.
    #[arg(short = 'd', long, default_value_t = 10)]
    duration_secs: u64,

    /// Frames per second.
    #[arg(short = 'f', long, default_value_t = 25)]
    fps: u64,

    /// Key frame (fragment) interval, in frames.
    #[arg(short = 'k', long, default_value_t = 50)]
    key_frame_interval: u64,

    /// Synthetic frame payload size in bytes.
    #[arg(long, default_value_t = 4096)]
    frame_size: usize,

    /// Content store budget in megabytes.
    #[arg(long, default_value_t = 32)]
    storage_mb: u64,

    /// Write the produced MKV stream to this file.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "LOOMCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

/// In-process control plane: answers every call inline and issues upload
/// handles. A real integration would put HTTP calls here.
struct LoopbackControlPlane {
    clock: SystemClock,
    next_handle: AtomicU64,
}

impl ServiceBackend for LoopbackControlPlane {
    fn describe_stream(&self, stream: &Arc<Stream>, stream_name: &str, _ctx: &ServiceCallContext) {
        let description = StreamDescription {
            stream_name: stream_name.to_string(),
            stream_arn: format!("arn:loopback:stream/{stream_name}"),
            content_type: stream.info().content_type.clone(),
            kms_key_id: String::new(),
            retention: stream.info().retention,
            status: StreamStatus::Active,
        };
        if let Err(err) = stream.describe_stream_result(ServiceCallResult::Ok, Some(&description)) {
            log::error!("describe result rejected: {err}");
        }
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
        let arn = format!("arn:loopback:stream/{stream_name}");
        if let Err(err) = stream.create_stream_result(ServiceCallResult::Ok, Some(&arn)) {
            log::error!("create result rejected: {err}");
        }
    }

    fn tag_stream(
        &self,
        stream: &Arc<Stream>,
        _stream_arn: &str,
        _tags: &[(String, String)],
        _ctx: &ServiceCallContext,
    ) {
        let _ = stream.tag_stream_result(ServiceCallResult::Ok);
    }

    fn get_streaming_endpoint(
        &self,
        stream: &Arc<Stream>,
        _stream_name: &str,
        _api_name: &str,
        _ctx: &ServiceCallContext,
    ) {
        let _ = stream
            .get_streaming_endpoint_result(ServiceCallResult::Ok, Some("loopback://ingest"));
    }

    fn get_streaming_token(
        &self,
        stream: &Arc<Stream>,
        _stream_name: &str,
        _ctx: &ServiceCallContext,
    ) {
        let token = AuthInfo {
            data: Bytes::from_static(b"loopback-session-token"),
            expiration: self.clock.now() + 20 * 60 * TICKS_PER_SECOND,
        };
        let _ = stream.get_streaming_token_result(ServiceCallResult::Ok, Some(token));
    }

    fn put_stream(
        &self,
        stream: &Arc<Stream>,
        stream_name: &str,
        _container_type: &str,
        _start_time: Ticks,
        _absolute_fragment_times: bool,
        _ack_enabled: bool,
        endpoint: &str,
        _ctx: &ServiceCallContext,
    ) {
        let handle = UploadHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        log::info!("[ControlPlane] {stream_name}: upload session {} on {endpoint}", handle.0);
        let _ = stream.put_stream_result(ServiceCallResult::Ok, Some(handle));
    }
}

/// Observer that wakes the uploader thread on data availability.
struct UploaderNudge {
    pending: Mutex<Option<UploadHandle>>,
    signal: parking_lot::Condvar,
}

impl UploaderNudge {
    fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            signal: parking_lot::Condvar::new(),
        }
    }

    fn wait_for_work(&self, timeout: Duration) -> Option<UploadHandle> {
        let mut pending = self.pending.lock();
        if pending.is_none() {
            self.signal.wait_for(&mut pending, timeout);
        }
        pending.take()
    }
}

impl ProducerObserver for UploaderNudge {
    fn data_available(
        &self,
        _stream: &Arc<Stream>,
        handle: UploadHandle,
        _buffered_duration: Ticks,
        _buffered_bytes: u64,
    ) {
        *self.pending.lock() = Some(handle);
        self.signal.notify_one();
    }

    fn stream_error(
        &self,
        _stream: &Arc<Stream>,
        handle: Option<UploadHandle>,
        _fragment_timestamp: Option<Ticks>,
        error: &loomcast_core::StreamError,
    ) {
        log::warn!("stream error on {handle:?}: {error}");
    }
}

fn stream_info(args: &Args) -> StreamInfo {
    StreamInfo {
        name: args.stream_name.clone(),
        retention: 24 * 3600 * TICKS_PER_SECOND,
        streaming_mode: StreamingMode::Realtime,
        content_type: "video/h264".into(),
        absolute_fragment_times: true,
        fragment_acks: true,
        key_frame_fragmentation: true,
        frame_rate: args.fps as u32,
        buffer_duration: 60 * TICKS_PER_SECOND,
        replay_duration: 20 * TICKS_PER_SECOND,
        tracks: vec![TrackInfo {
            track_id: 1,
            track_type: TrackType::Video,
            codec_id: "V_MPEG4/ISO/AVC".into(),
            track_name: "synthetic".into(),
            codec_private_data: None,
            params: TrackParams::Video(VideoTrackParams {
                width: 1280,
                height: 720,
            }),
        }],
        ..StreamInfo::default()
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    anyhow::ensure!(args.fps > 0, "fps must be at least 1");

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Loomcast loopback simulator v{}", env!("CARGO_PKG_VERSION"));

    let nudge = Arc::new(UploaderNudge::new());
    let client = Client::with_parts(
        ClientConfig {
            storage_size: args.storage_mb * 1024 * 1024,
            ..ClientConfig::default()
        },
        Arc::new(LoopbackControlPlane {
            clock: SystemClock,
            next_handle: AtomicU64::new(1),
        }),
        nudge.clone(),
        Arc::new(loomcast_core::AnonymousCredentials),
        Arc::new(SystemClock),
    )
    .context("failed to create the client")?;

    let stream = client
        .create_stream_sync(stream_info(&args))
        .context("failed to create the stream")?;
    log::info!("Stream {} is ready", stream.name());

    // Uploader: drains the stream into the sink and echoes ACKs for every
    // fragment boundary it observes, like the ingestion service would.
    let uploader = {
        let stream = stream.clone();
        let nudge = nudge.clone();
        let mut sink: Option<File> = match &args.output {
            Some(path) => Some(File::create(path).context("failed to create the output file")?),
            None => None,
        };
        std::thread::spawn(move || -> Result<u64> {
            let mut total: u64 = 0;
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let Some(handle) = nudge.wait_for_work(Duration::from_millis(500)) else {
                    continue;
                };
                loop {
                    let read = stream.get_stream_data(handle, &mut buf)?;
                    if read.filled > 0 {
                        total += read.filled as u64;
                        if let Some(file) = sink.as_mut() {
                            file.write_all(&buf[..read.filled])?;
                        }
                    }
                    match read.outcome {
                        DataOutcome::Filled => continue,
                        DataOutcome::NoMoreData | DataOutcome::AwaitingPersistedAck => break,
                        DataOutcome::EndOfStream => {
                            log::info!("[Uploader] session {} finished", handle.0);
                            // The library pulses the successor session, if
                            // any; a closed stream ends the uploader.
                            if stream.metrics().map(|m| m.current_view_bytes).unwrap_or(0) == 0 {
                                return Ok(total);
                            }
                            break;
                        }
                        DataOutcome::Aborted => {
                            log::warn!("[Uploader] session {} aborted", handle.0);
                            break;
                        }
                    }
                }
            }
        })
    };

    // Producer: synthetic frames at the configured rate, with per-fragment
    // persisted ACKs echoed right back through the ACK parser.
    let total_frames = args.duration_secs * args.fps;
    let frame_duration = TICKS_PER_SECOND / args.fps;
    let mut last_fragment_start: Option<Ticks> = None;

    for n in 0..total_frames {
        let key = n % args.key_frame_interval == 0;
        let pts = n * frame_duration;
        let frame = Frame {
            track_id: 1,
            flags: if key { FRAME_FLAG_KEY_FRAME } else { FRAME_FLAG_NONE },
            presentation_ts: pts,
            decoding_ts: pts,
            duration: frame_duration,
            data: Bytes::from(vec![(n % 251) as u8; args.frame_size]),
        };
        stream.put_frame(frame).context("put_frame failed")?;

        // Acknowledge the previous fragment once a new one starts.
        if key {
            if let Some(start) = last_fragment_start.take() {
                let timecode = start / TICKS_PER_MILLISECOND;
                let payload = format!(
                    "{{\"EventType\":\"PERSISTED\",\"FragmentTimecode\":{timecode}}}"
                );
                if let Err(err) = stream.parse_fragment_ack(UploadHandle(1), payload.as_bytes()) {
                    log::debug!("ack not applied: {err}");
                }
            }
            last_fragment_start = Some(pts);
        }

        std::thread::sleep(Duration::from_millis(1000 / args.fps));
    }

    log::info!("Producer done, stopping the stream");
    stream.stop_sync().context("stop failed")?;

    let uploaded = uploader.join().expect("uploader thread")?;
    let metrics = stream.metrics()?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    log::info!(
        "Uploaded {} bytes across {} sessions",
        uploaded,
        metrics.total_sessions
    );

    client.shutdown();
    Ok(())
}
