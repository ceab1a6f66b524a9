//! Upload data path.
//!
//! `get_stream_data` serves the next stream bytes to one upload session:
//! view-item payloads in append order, then any trailing metadata and the
//! end-of-stream tag once the session drains past a stream boundary or the
//! stream stops. Reconnects rewind the read cursor by the replay window
//! and rewrite the resume item to start with a fresh container header.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::client::Client;
use crate::error::{ServiceCallResult, StreamError, StreamResult};
use crate::handles::{HandleState, UploadHandle, HANDLE_STATE_ACTIVE, HANDLE_STATE_SENDING_EOS};
use crate::time::{ema_next, TICKS_PER_SECOND};
use crate::view::{
    ViewItem, ITEM_FLAG_BUFFERING_ACK, ITEM_FLAG_FRAGMENT_END, ITEM_FLAG_FRAGMENT_START,
    ITEM_FLAG_RECEIVED_ACK, ITEM_FLAG_SKIP, ITEM_FLAG_STREAM_START,
};
use crate::protocol_constants::TRANSFER_RATE_INTERVAL_EPSILON_SECS;

use super::{events, ConnectionState, CurrentItem, Notification, StreamInner};

/// Terminal condition of one `get_stream_data` call. All of these are
/// ordinary protocol signals, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// The buffer was filled completely; call again for more.
    Filled,
    /// The buffered content is exhausted; wait for the data-available
    /// notification.
    NoMoreData,
    /// The session served everything it ever will; close the connection.
    EndOfStream,
    /// The session drained but awaits the persisted ACK of its last
    /// fragment before it can finish.
    AwaitingPersistedAck,
    /// The handle is unknown or failed; abandon the connection.
    Aborted,
}

/// Result of one `get_stream_data` call.
#[derive(Debug, Clone, Copy)]
pub struct StreamDataRead {
    /// Bytes written into the caller's buffer.
    pub filled: usize,
    /// Why the call returned.
    pub outcome: DataOutcome,
}

pub(crate) fn get_stream_data_locked(
    client: &Arc<Client>,
    guard: &mut MutexGuard<'_, StreamInner>,
    handle: UploadHandle,
    buf: &mut [u8],
) -> StreamResult<StreamDataRead> {
    let inner = &mut **guard;
    let mut restarted = false;

    // Roll back after a dropped connection that had served bytes.
    if inner.connection_state == ConnectionState::RollbackNeeded {
        if inner.info.streaming_mode.is_offline() {
            let tail = inner.view.tail_index();
            inner.view.set_current(tail)?;
        } else {
            let to_last_ack = inner.info.fragment_acks
                && inner.connection_dropped_result.host_alive_on_drop();
            inner
                .view
                .rollback_current(inner.info.replay_duration, to_last_ack);
        }
        stream_start_fixup_on_reconnect(client, inner)?;
        restarted = true;
    }
    inner.connection_state = ConnectionState::Ok;

    let mut filled = 0usize;
    let outcome = serve(client, inner, handle, buf, &mut filled);

    // Post-step housekeeping runs regardless of how the fill ended.
    if filled > 0 {
        check_connection_staleness(inner);
    }
    let outcome = outcome?;
    record_transfer_rate(inner, filled, restarted);

    // A stopped stream wraps up once its last session drained and nothing
    // remains buffered.
    if inner.stream_stopped && outcome == DataOutcome::EndOfStream {
        let terminated = inner
            .handles
            .get(handle)
            .map(|h| h.state == HandleState::Terminated)
            .unwrap_or(true);
        if !inner.wait_for_persisted_ack() || terminated {
            let (_, bytes) = inner.available_view_size();
            if bytes == 0 && inner.handles.len() <= 1 {
                events::notify_stream_closed(inner, Some(handle));
            }
        }
    }

    // Hand over to the next session once this one finished its part.
    let state_now = inner.handles.get(handle).map(|h| h.state);
    let finished = matches!(state_now, Some(HandleState::AwaitingAck))
        || (!inner.wait_for_persisted_ack() && matches!(state_now, Some(HandleState::Terminated)));
    if finished {
        let next = inner
            .handles
            .first_in_state(
                HandleState::New.mask() | HandleState::Ready.mask() | HandleState::Streaming.mask(),
            )
            .map(|h| h.handle);
        if let Some(next_handle) = next {
            let (duration, bytes) = inner.available_view_size();
            if bytes == 0 && inner.stream_stopped {
                if let Some(info) = inner.handles.get_mut(next_handle) {
                    info.state = HandleState::Terminated;
                }
            }
            inner.emit(Notification::DataAvailable {
                handle: next_handle,
                duration,
                bytes,
            });
        }
    }

    // Drop a terminated handle; if buffered bytes remain with no session
    // left to carry them, force a reconnect.
    if matches!(
        inner.handles.get(handle).map(|h| h.state),
        Some(HandleState::Terminated)
    ) {
        inner.handles.remove(handle);
        if inner.handles.first_in_state(HANDLE_STATE_ACTIVE).is_none() {
            let (_, bytes) = inner.available_view_size();
            if bytes != 0 {
                log::info!(
                    "[Stream] {}: no active upload session with {} bytes buffered, resetting connection",
                    inner.info.name,
                    bytes
                );
                events::stream_terminated_locked(inner, None, ServiceCallResult::Ok, true)?;
            }
        }
    }

    Ok(StreamDataRead { filled, outcome })
}

/// Dispatches on the handle state, then runs the fill loop.
fn serve(
    client: &Arc<Client>,
    inner: &mut StreamInner,
    handle: UploadHandle,
    buf: &mut [u8],
    filled: &mut usize,
) -> StreamResult<DataOutcome> {
    let Some(info) = inner.handles.get(handle) else {
        log::warn!(
            "[Stream] {}: read on unknown upload handle {}",
            inner.info.name,
            handle.0
        );
        return Ok(DataOutcome::Aborted);
    };

    match info.state {
        HandleState::Ready => {
            if inner.stream_stopped {
                let (_, bytes) = inner.available_view_size();
                if bytes == 0 {
                    inner.handles.get_mut(handle).expect("checked").state = HandleState::Terminated;
                    return Ok(DataOutcome::EndOfStream);
                }
            }
            if let Some(session_ts) = inner.new_session_ts.take() {
                inner.new_session_index = None;
                let info = inner.handles.get_mut(handle).expect("checked");
                info.session_start_ts = Some(session_ts);
                info.state = HandleState::Streaming;
            } else if !inner.info.absolute_fragment_times {
                // Relative timecode streams cannot correlate ACKs without
                // a session start timestamp.
                return Ok(DataOutcome::NoMoreData);
            } else {
                inner.handles.get_mut(handle).expect("checked").state = HandleState::Streaming;
            }
            inner.diagnostics.total_active_sessions += 1;
        }
        HandleState::AwaitingAck => {
            let acked = info.last_fragment_acked();
            if acked {
                inner.handles.get_mut(handle).expect("checked").state = HandleState::Terminated;
                return Ok(DataOutcome::EndOfStream);
            }
            return Ok(DataOutcome::AwaitingPersistedAck);
        }
        HandleState::AckReceived => {
            inner.handles.get_mut(handle).expect("checked").state = HandleState::Terminated;
            log::info!(
                "[Stream] {}: end-of-stream after final persisted ACK on handle {}",
                inner.info.name,
                handle.0
            );
            return Ok(DataOutcome::EndOfStream);
        }
        HandleState::Terminated => {
            log::warn!(
                "[Stream] {}: end-of-stream for terminated handle {}",
                inner.info.name,
                handle.0
            );
            return Ok(DataOutcome::EndOfStream);
        }
        HandleState::Error => {
            log::warn!(
                "[Stream] {}: abort for errored handle {}",
                inner.info.name,
                handle.0
            );
            return Ok(DataOutcome::Aborted);
        }
        _ => {}
    }

    fill_loop(client, inner, handle, buf, filled)
}

fn fill_loop(
    client: &Arc<Client>,
    inner: &mut StreamInner,
    handle: UploadHandle,
    buf: &mut [u8],
    filled: &mut usize,
) -> StreamResult<DataOutcome> {
    while *filled < buf.len() {
        let sending_eos = inner
            .handles
            .get(handle)
            .map(|h| h.in_state(HANDLE_STATE_SENDING_EOS))
            .unwrap_or(false);

        if sending_eos && inner.metadata_tracker.send {
            if inner.metadata_tracker.offset == inner.metadata_tracker.data.len() {
                inner.metadata_tracker.offset = 0;
                inner.metadata_tracker.send = false;
                inner.eos_tracker.send = true;
            } else {
                let n = copy_blob(&mut inner.metadata_tracker, buf, filled);
                debug_assert!(n > 0);
            }
        } else if sending_eos && inner.eos_tracker.send {
            if inner.eos_tracker.offset == inner.eos_tracker.data.len() {
                inner.eos_tracker.offset = 0;
                inner.eos_tracker.send = false;

                let wait = inner.wait_for_persisted_ack();
                let info = inner.handles.get_mut(handle).expect("sending eos");
                if wait {
                    if info.last_fragment_acked() {
                        info.state = HandleState::Terminated;
                        return Ok(DataOutcome::EndOfStream);
                    }
                    info.state = HandleState::AwaitingAck;
                    log::info!(
                        "[Stream] handle {} awaiting persisted ACK for fragment at {:?}",
                        handle.0,
                        info.last_fragment_ts
                    );
                    return Ok(DataOutcome::AwaitingPersistedAck);
                }
                info.state = HandleState::Terminated;
                return Ok(DataOutcome::EndOfStream);
            }
            copy_blob(&mut inner.eos_tracker, buf, filled);
        } else if inner.cur_item.is_none() {
            // The read cursor lost its item (first read, or the item fell
            // off the window); hunt for the next fragment boundary.
            match next_boundary_view_item(inner) {
                Some(mut item) => {
                    clear_replay_ack_flags(inner, &mut item);
                    inner.cur_item = Some(CurrentItem { item, offset: 0 });
                }
                None => return Ok(DataOutcome::NoMoreData),
            }
        } else if current_exhausted(inner) {
            let eos_sent = inner
                .cur_item
                .as_ref()
                .map(|c| c.item.has_flag(ITEM_FLAG_FRAGMENT_END))
                .unwrap_or(false);

            reset_current_item_stream_start(client, inner)?;

            match next_view_item(inner) {
                None => {
                    if !inner.stream_stopped {
                        return Ok(DataOutcome::NoMoreData);
                    }
                    // Stopped and drained: kick off the EOS sequence.
                    let info = inner.handles.get_mut(handle).expect("streaming");
                    info.state = HandleState::Terminating;
                    arm_eos(inner, eos_sent);
                }
                Some(mut item) => {
                    clear_replay_ack_flags(inner, &mut item);
                    let starts_new_stream = item.has_flag(ITEM_FLAG_STREAM_START);
                    inner.cur_item = Some(CurrentItem { item, offset: 0 });

                    if starts_new_stream {
                        // This session's container ends where the next one
                        // begins; finish with trailing metadata and EOS.
                        let wait = inner.wait_for_persisted_ack();
                        let info = inner.handles.get_mut(handle).expect("streaming");
                        info.state = if wait {
                            HandleState::Terminating
                        } else {
                            HandleState::Terminated
                        };
                        arm_eos(inner, eos_sent);
                    }
                }
            }
        } else {
            let cur = inner.cur_item.as_ref().expect("checked");
            if cur
                .item
                .has_flag(ITEM_FLAG_FRAGMENT_START | ITEM_FLAG_STREAM_START)
                && cur.offset == 0
            {
                let ack_ts = cur.item.ack_timestamp;
                inner.handles.get_mut(handle).expect("streaming").last_fragment_ts = Some(ack_ts);
            }

            let cur = inner.cur_item.as_mut().expect("checked");
            let remaining_item = cur.item.length as usize - cur.offset;
            let n = remaining_item.min(buf.len() - *filled);
            client
                .store()
                .lock()
                .read(cur.item.handle, cur.offset, &mut buf[*filled..*filled + n])?;
            cur.offset += n;
            *filled += n;
        }
    }
    Ok(DataOutcome::Filled)
}

fn arm_eos(inner: &mut StreamInner, eos_sent: bool) {
    inner.eos_tracker.send = true;
    inner.eos_tracker.offset = if eos_sent {
        // An explicit end-of-fragment already closed the container; the
        // pre-generated tag must not repeat.
        inner.eos_tracker.data.len()
    } else {
        0
    };
    if eos_sent {
        inner.metadata_tracker.send = false;
    }
}

fn copy_blob(tracker: &mut super::BlobTracker, buf: &mut [u8], filled: &mut usize) -> usize {
    let n = (tracker.data.len() - tracker.offset).min(buf.len() - *filled);
    buf[*filled..*filled + n].copy_from_slice(&tracker.data[tracker.offset..tracker.offset + n]);
    tracker.offset += n;
    *filled += n;
    n
}

fn current_exhausted(inner: &StreamInner) -> bool {
    inner
        .cur_item
        .as_ref()
        .map(|c| c.offset == c.item.length as usize)
        .unwrap_or(false)
}

/// Next unserved item, skipping entries poisoned by non-retriable error
/// ACKs.
fn next_view_item(inner: &mut StreamInner) -> Option<ViewItem> {
    loop {
        let item = inner.view.get_next()?;
        if !item.has_flag(ITEM_FLAG_SKIP) {
            return Some(item);
        }
    }
}

/// Next unserved fragment boundary item.
fn next_boundary_view_item(inner: &mut StreamInner) -> Option<ViewItem> {
    loop {
        let item = next_view_item(inner)?;
        if item.is_boundary() {
            return Some(item);
        }
    }
}

/// Clears per-session ACK flags from a (possibly replayed) item, both on
/// the view record and on the copy about to be served.
fn clear_replay_ack_flags(inner: &mut StreamInner, item: &mut ViewItem) {
    item.flags &= !(ITEM_FLAG_BUFFERING_ACK | ITEM_FLAG_RECEIVED_ACK);
    if let Ok(stored) = inner.view.item_at_mut(item.index) {
        stored.flags &= !(ITEM_FLAG_BUFFERING_ACK | ITEM_FLAG_RECEIVED_ACK);
    }
}

/// Rewrites the resume item to begin with a fresh stream header after a
/// reconnect. The replacement allocation is swapped in atomically: the old
/// bytes are freed only once the new allocation is fully written.
fn stream_start_fixup_on_reconnect(
    client: &Arc<Client>,
    inner: &mut StreamInner,
) -> StreamResult<()> {
    reset_current_item_stream_start(client, inner)?;

    inner.cur_item = None;
    inner.eos_tracker.send = false;
    inner.eos_tracker.offset = 0;
    inner.new_session_index = None;
    inner.new_session_ts = None;

    // Nothing to resume from.
    if inner.view.current_index() >= inner.view.head_index() {
        return Ok(());
    }

    let resume_index = inner.view.current_index();
    let item = *inner.view.item_at(resume_index)?;
    let (header, stream_start_ts) = inner.generator.generate_header();

    inner.new_session_index = Some(item.index);
    inner.new_session_ts = Some(stream_start_ts);

    // Already a stream start; its header is still in place.
    if item.has_flag(ITEM_FLAG_STREAM_START) {
        return Ok(());
    }

    let old_len = item.length as usize;
    let overall = header.len() + old_len;
    let mut store = client.store().lock();

    let Some(new_alloc) = store.alloc(overall) else {
        return Err(StreamError::StoreOutOfMemory);
    };
    let fixup = (|| -> StreamResult<()> {
        store.write(new_alloc, 0, &header)?;
        let mut body = vec![0u8; old_len];
        store.read(item.handle, 0, &mut body)?;
        store.write(new_alloc, header.len(), &body)
    })();

    match fixup {
        Ok(()) => {
            let old_alloc = item.handle;
            let stored = inner.view.item_at_mut(resume_index)?;
            stored.handle = new_alloc;
            stored.flags |= ITEM_FLAG_STREAM_START;
            stored.data_offset = header.len() as u32;
            stored.length = overall as u32;
            let _ = store.free(old_alloc);
            Ok(())
        }
        Err(err) => {
            let _ = store.free(new_alloc);
            Err(err)
        }
    }
}

/// Strips the container header from the current item once it has been
/// consumed, so a later session resuming here gets a freshly generated
/// header instead of a stale one.
fn reset_current_item_stream_start(
    client: &Arc<Client>,
    inner: &mut StreamInner,
) -> StreamResult<()> {
    let Some(cur) = inner.cur_item else {
        return Ok(());
    };
    if !cur.item.has_flag(ITEM_FLAG_STREAM_START) {
        return Ok(());
    }
    // The item may have fallen off the window already.
    let Ok(stored) = inner.view.item_at_mut(cur.item.index) else {
        return Ok(());
    };

    let data_offset = stored.data_offset as usize;
    if data_offset == 0 {
        return Ok(());
    }
    let old_len = stored.length as usize;
    let new_len = old_len - data_offset;
    let handle = stored.handle;

    {
        let mut store = client.store().lock();
        let mut body = vec![0u8; new_len];
        store.read(handle, data_offset, &mut body)?;
        store.write(handle, 0, &body)?;
    }

    let stored = inner.view.item_at_mut(cur.item.index)?;
    stored.flags &= !ITEM_FLAG_STREAM_START;
    stored.data_offset = 0;
    stored.length = new_len as u32;
    let updated = *stored;

    let cur_mut = inner.cur_item.as_mut().expect("checked");
    if cur_mut.offset == old_len {
        cur_mut.offset = new_len;
    }
    cur_mut.item = updated;
    Ok(())
}

/// Fires the staleness notification when no buffering ACK covers the
/// recently served window.
fn check_connection_staleness(inner: &mut StreamInner) {
    let staleness = inner.info.connection_staleness;
    if staleness == 0 || !inner.info.fragment_acks {
        return;
    }
    let Some(cur) = &inner.cur_item else {
        return;
    };
    let served_ts = cur.item.timestamp;

    let mut index = cur.item.index;
    loop {
        let Ok(item) = inner.view.item_at(index) else {
            return;
        };
        if item.has_flag(ITEM_FLAG_BUFFERING_ACK) {
            return;
        }
        let since = served_ts.saturating_sub(item.timestamp);
        if since > staleness {
            inner.diagnostics.stale_events += 1;
            inner.emit(Notification::ConnectionStale { since });
            return;
        }
        if index == 0 {
            return;
        }
        index -= 1;
    }
}

fn record_transfer_rate(inner: &mut StreamInner, filled: usize, restarted: bool) {
    if !inner.info.recalculate_metrics || filled == 0 {
        return;
    }
    inner.diagnostics.accumulated_bytes += filled as u64;
    inner.diagnostics.transferred_bytes += filled as u64;

    if restarted {
        inner.diagnostics.last_transfer_rate_ts = Some(inner.now);
        return;
    }
    let Some(last) = inner.diagnostics.last_transfer_rate_ts else {
        inner.diagnostics.last_transfer_rate_ts = Some(inner.now);
        return;
    };
    let delta_secs = inner.now.saturating_sub(last) as f64 / TICKS_PER_SECOND as f64;
    if delta_secs > TRANSFER_RATE_INTERVAL_EPSILON_SECS {
        let rate = inner.diagnostics.accumulated_bytes as f64 / delta_secs;
        inner.diagnostics.current_transfer_rate =
            ema_next(inner.diagnostics.current_transfer_rate, rate);
        inner.diagnostics.accumulated_bytes = 0;
        inner.diagnostics.last_transfer_rate_ts = Some(inner.now);
    }
}
