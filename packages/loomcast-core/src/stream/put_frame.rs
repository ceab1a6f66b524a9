//! Frame ingestion pipeline.
//!
//! `put_frame` packages a frame (plus any metadata due at the fragment
//! boundary) into one content-store allocation and appends a view item for
//! the uploader. Storage acquisition follows the availability protocol:
//! realtime streams evict the view tail under pressure, offline streams
//! block the producer until the uploader trims the tail.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::client::Client;
use crate::config::StorePressurePolicy;
use crate::error::{StreamError, StreamResult};
use crate::frame::Frame;
use crate::handles::HandleState;
use crate::mkv::GeneratorState;
use crate::protocol_constants::{
    BUFFER_DURATION_PRESSURE_NOTIFICATION_THRESHOLD, FRAME_ALLOC_FRAGMENTATION_FACTOR,
    MAX_ALLOCATION_OVERHEAD_SIZE, STORAGE_PRESSURE_NOTIFICATION_THRESHOLD,
    TOKEN_EXPIRATION_GRACE_PERIOD,
};
use crate::store::AllocHandle;
use crate::time::{ema_next, ticks_to_duration, Ticks, TICKS_PER_SECOND};
use crate::view::{
    EvictedItem, ITEM_FLAG_FRAGMENT_END, ITEM_FLAG_FRAGMENT_START, ITEM_FLAG_NONE,
    ITEM_FLAG_STREAM_START,
};

use super::{events, metadata, state, Notification, StreamInner};

pub(crate) fn put_frame_locked(
    client: &Arc<Client>,
    guard: &mut MutexGuard<'_, StreamInner>,
    mut frame: Frame,
) -> StreamResult<()> {
    let inner = &mut **guard;
    if !frame.is_eofr() {
        inner.info.track(frame.track_id)?;
    }
    if inner.stream_stopped {
        return Err(StreamError::StreamHasBeenStopped);
    }
    frame.fixup();

    // After an explicit end-of-fragment the next fragment starts on a key
    // frame; two sentinels in a row are a caller bug.
    if inner.eofr_frame {
        inner.skip_non_key_frames = true;
        if frame.is_eofr() {
            return Err(StreamError::MultipleConsecutiveEofr);
        }
    }
    if !inner.info.key_frame_fragmentation && frame.is_eofr() {
        return Err(StreamError::EofrFrameInvalidState);
    }

    check_streaming_token_expiration(inner)?;

    if let Some(reset_at) = inner.reset_generator_time {
        if inner.now >= reset_at {
            inner.reset_generator_time = None;
            inner.reset_generator_on_key_frame = true;
        }
    }

    // Self-prime after a parked stop: the machine resumes on new content.
    if inner.indicator == state::STREAM_STATE_NEW && inner.stream_ready {
        state::step_stream(inner)?;
    }

    if inner.reset_generator_on_key_frame && frame.is_key_frame() {
        inner.generator.reset();
        inner.reset_generator_on_key_frame = false;
    }

    if inner.skip_non_key_frames {
        if frame.is_key_frame() {
            inner.skip_non_key_frames = false;
        } else if !frame.is_eofr() {
            inner.diagnostics.skipped_frames += 1;
            return Ok(());
        }
    }

    // Measure the packaged size, plus metadata due at a cluster boundary.
    let (packaged_size, metadata_size) = if frame.is_eofr() {
        if inner.view.is_empty() {
            return Err(StreamError::EofrFrameInvalidState);
        }
        let eos_len = inner.eos_tracker.data.len();
        metadata::append_validated(
            inner,
            crate::protocol_constants::EOFR_METADATA_NAME,
            "",
            false,
            eos_len,
        );
        (metadata::pending_metadata_size(inner, true), 0usize)
    } else {
        let (bytes, info) = inner.generator.package_frame(&frame, frame.track_id, false)?;
        let metadata_size = match info.generator_state {
            GeneratorState::StartStream | GeneratorState::StartCluster => {
                metadata::pending_metadata_size(inner, false)
            }
            GeneratorState::StartBlock => 0,
        };
        (bytes.len(), metadata_size)
    };

    let overall_size = packaged_size + metadata_size;
    inner.max_frame_size_seen = inner.max_frame_size_seen.max(overall_size as u64);

    let alloc = acquire_storage(client, guard, overall_size)?;
    let inner = &mut **guard;

    // Package into the acquired region. Failures from here on must release
    // the allocation; once the view owns the item it is collected there.
    let write_result = write_packaged_frame(client, inner, &frame, alloc);
    let encoded = match write_result {
        Ok(encoded) => encoded,
        Err(err) => {
            let _ = client.store().lock().free(alloc);
            return Err(err);
        }
    };

    report_pressures(client, inner);

    // Derive view flags from the generator position of this frame.
    let mut item_flags = match encoded.state {
        GeneratorState::StartStream => ITEM_FLAG_STREAM_START | ITEM_FLAG_FRAGMENT_START,
        GeneratorState::StartCluster => ITEM_FLAG_FRAGMENT_START,
        GeneratorState::StartBlock => ITEM_FLAG_NONE,
    };
    if frame.is_eofr() {
        item_flags |= ITEM_FLAG_FRAGMENT_END;
    } else if item_flags & ITEM_FLAG_FRAGMENT_START != 0 {
        inner.eofr_frame = false;
    }

    let append_result = inner.view.append(
        encoded.timestamp,
        encoded.ack_timestamp,
        frame.duration,
        alloc,
        encoded.data_offset,
        encoded.length,
        item_flags,
    );
    let (index, evicted) = match append_result {
        Ok(v) => v,
        Err(err) => {
            let _ = client.store().lock().free(alloc);
            return Err(err);
        }
    };
    if let Some(evicted) = evicted {
        release_evicted(client, inner, &evicted);
    }

    if item_flags & ITEM_FLAG_STREAM_START != 0 {
        inner.new_session_ts = Some(encoded.stream_start_ts);
        inner.new_session_index = Some(index);
    }
    if frame.is_eofr() {
        inner.eofr_frame = true;
    }

    // Latency pressure: unsent window ahead of the configured maximum.
    if inner.info.max_latency != 0 {
        let (current_duration, _) = inner.view.window_duration();
        if current_duration > inner.info.max_latency {
            inner.diagnostics.latency_pressures += 1;
            inner.emit(Notification::LatencyPressure {
                duration: current_duration,
            });
        }
    }

    // Wake the uploader.
    if let Some(info) = inner
        .handles
        .first_in_state(HandleState::Ready.mask() | HandleState::Streaming.mask())
    {
        let handle = info.handle;
        let (duration, bytes) = inner.available_view_size();
        inner.emit(Notification::DataAvailable {
            handle,
            duration,
            bytes,
        });
    }

    if inner.info.recalculate_metrics {
        if item_flags & ITEM_FLAG_STREAM_START == 0 {
            if let Some(last) = inner.diagnostics.last_frame_rate_ts {
                let delta_secs =
                    inner.now.saturating_sub(last) as f64 / TICKS_PER_SECOND as f64;
                if delta_secs > 0.0 {
                    inner.diagnostics.current_frame_rate =
                        ema_next(inner.diagnostics.current_frame_rate, 1.0 / delta_secs);
                }
            }
        }
        inner.diagnostics.last_frame_rate_ts = Some(inner.now);
    }

    Ok(())
}

/// Result of writing the packaged bytes into the allocation.
struct PackagedItem {
    state: GeneratorState,
    stream_start_ts: Ticks,
    timestamp: Ticks,
    ack_timestamp: Ticks,
    data_offset: u32,
    length: u32,
}

fn write_packaged_frame(
    client: &Arc<Client>,
    inner: &mut StreamInner,
    frame: &Frame,
    alloc: AllocHandle,
) -> StreamResult<PackagedItem> {
    if frame.is_eofr() {
        // Tag run only: pending metadata plus the end-of-fragment tag.
        // Committing the tags forces the next frame onto a fresh cluster.
        let blob = metadata::package_metadata(inner, true, true)?;
        client.store().lock().write(alloc, 0, &blob)?;

        let (stream_start_ts, _, _) = inner.generator.current_timestamps();
        let head = *inner.view.head()?;
        Ok(PackagedItem {
            state: GeneratorState::StartBlock,
            stream_start_ts,
            timestamp: head.timestamp + head.duration,
            ack_timestamp: head.ack_timestamp + head.duration,
            data_offset: 0,
            length: blob.len() as u32,
        })
    } else {
        let (bytes, info) = inner.generator.package_frame(frame, frame.track_id, true)?;
        let metadata_blob = match info.generator_state {
            GeneratorState::StartStream | GeneratorState::StartCluster => {
                metadata::package_metadata(inner, false, false)?
            }
            GeneratorState::StartBlock => bytes::Bytes::new(),
        };

        let data_offset = info.data_offset as usize;
        {
            let mut store = client.store().lock();
            if metadata_blob.is_empty() {
                store.write(alloc, 0, &bytes)?;
            } else {
                // Metadata sits between the stream header and the cluster.
                store.write(alloc, 0, &bytes[..data_offset])?;
                store.write(alloc, data_offset, &metadata_blob)?;
                store.write(alloc, data_offset + metadata_blob.len(), &bytes[data_offset..])?;
            }
        }

        Ok(PackagedItem {
            state: info.generator_state,
            stream_start_ts: info.stream_start_ts,
            timestamp: info.cluster_dts + info.frame_dts,
            ack_timestamp: info.cluster_pts + info.frame_pts,
            data_offset: info.data_offset,
            length: (bytes.len() + metadata_blob.len()) as u32,
        })
    }
}

/// Acquires storage for `size` bytes per the availability protocol.
fn acquire_storage(
    client: &Arc<Client>,
    guard: &mut MutexGuard<'_, StreamInner>,
    size: usize,
) -> StreamResult<AllocHandle> {
    loop {
        let offline = guard.info.streaming_mode.is_offline();

        let view_has_room = !offline || !guard.view.at_capacity();
        if view_has_room {
            if let Some(handle) = try_alloc(client, guard, size) {
                return Ok(handle);
            }
        }

        if !offline {
            if guard.info.store_pressure_policy != StorePressurePolicy::DropTailItem {
                return Err(StreamError::StoreOutOfMemory);
            }
            let inner = &mut **guard;
            match inner.view.trim_tail_item() {
                Some(evicted) => release_evicted(client, inner, &evicted),
                None => return Err(StreamError::StoreOutOfMemory),
            }
        } else {
            let timeout = client.config().offline_buffer_availability_timeout;
            let signals = guard.signals.clone();
            if signals
                .buffer_availability
                .wait_for(guard, ticks_to_duration(timeout))
                .timed_out()
            {
                return Err(StreamError::OperationTimedOut);
            }
            if guard.stream_stopped || guard.shutdown {
                return Err(StreamError::BlockingPutInterrupted);
            }
        }
    }
}

fn try_alloc(
    client: &Arc<Client>,
    guard: &MutexGuard<'_, StreamInner>,
    size: usize,
) -> Option<AllocHandle> {
    let mut store = client.store().lock();
    let in_use = store.bytes_in_use();
    let fragmentation_reserve =
        (guard.max_frame_size_seen as f64 * FRAME_ALLOC_FRAGMENTATION_FACTOR) as u64;
    let reserved = in_use + MAX_ALLOCATION_OVERHEAD_SIZE + fragmentation_reserve;
    if store.capacity() <= reserved {
        return None;
    }
    if store.capacity() - reserved < size as u64 {
        return None;
    }
    store.alloc(size)
}

/// Releases an evicted item's storage and accounts for the drop.
pub(crate) fn release_evicted(client: &Arc<Client>, inner: &mut StreamInner, evicted: &EvictedItem) {
    let _ = client.store().lock().free(evicted.item.handle);

    if let Some(cur) = &inner.cur_item {
        if cur.item.index == evicted.item.index {
            inner.cur_item = None;
        }
    }
    if evicted.current_removed {
        // The drop overtook the read cursor; the next read must hunt for
        // a fragment boundary before resuming.
        inner.cur_item = None;
    }

    inner.diagnostics.dropped_frames += 1;
    inner.emit(Notification::DroppedFrame {
        ts: evicted.item.timestamp,
    });
    if evicted.item.has_flag(ITEM_FLAG_FRAGMENT_START) {
        inner.emit(Notification::DroppedFragment {
            ts: evicted.item.timestamp,
        });
    }
}

/// Reports storage and buffer-duration pressure in realtime modes.
fn report_pressures(client: &Arc<Client>, inner: &mut StreamInner) {
    if inner.info.streaming_mode.is_offline() {
        return;
    }

    let (capacity, in_use) = {
        let store = client.store().lock();
        (store.capacity(), store.bytes_in_use())
    };
    let remaining = capacity.saturating_sub(in_use);
    if capacity > 0 && remaining * 100 / capacity <= STORAGE_PRESSURE_NOTIFICATION_THRESHOLD {
        inner.diagnostics.storage_pressures += 1;
        inner.emit(Notification::StoragePressure { remaining });
    }

    // Without retention the tail drops continuously and the window never
    // approaches the configured buffer duration.
    if inner.retention != 0 {
        let (_, window_duration) = inner.view.window_duration();
        let remaining_duration = inner.info.buffer_duration.saturating_sub(window_duration);
        if remaining_duration * 100 / inner.info.buffer_duration
            <= BUFFER_DURATION_PRESSURE_NOTIFICATION_THRESHOLD
        {
            inner.diagnostics.buffer_pressures += 1;
            inner.emit(Notification::BufferDurationPressure {
                remaining: remaining_duration,
            });
        }
    }
}

/// Initiates token rotation once the remaining streaming-token lifetime
/// enters the grace period.
fn check_streaming_token_expiration(inner: &mut StreamInner) -> StreamResult<()> {
    if inner.grace_period {
        return Ok(());
    }
    let Some(expiration) = inner.streaming_auth.as_ref().map(|a| a.expiration) else {
        return Ok(());
    };
    if inner.now < expiration
        && expiration - inner.now > TOKEN_EXPIRATION_GRACE_PERIOD
    {
        return Ok(());
    }

    log::info!(
        "[Stream] {} entering streaming-token grace period",
        inner.info.name
    );
    inner.grace_period = true;
    events::stream_terminated_locked(
        inner,
        None,
        crate::error::ServiceCallResult::StreamAuthInGracePeriod,
        true,
    )?;

    if inner.info.streaming_mode.is_offline() {
        inner.reset_generator_on_key_frame = true;
    } else {
        inner.reset_generator_time = Some(inner.now + TOKEN_EXPIRATION_GRACE_PERIOD);
    }
    Ok(())
}
