//! Control-plane result events and ACK application.
//!
//! The host reports every service-call completion and every fragment ACK
//! through these handlers. Each result event validates that the machine is
//! in a state that accepts it, stores the outcome, and steps the machine;
//! ACKs are correlated to view items by their fragment timecode.

use rand::Rng;

use crate::ack::{AckType, FragmentAck};
use crate::callbacks::{AuthInfo, StreamDescription, StreamStatus};
use crate::error::{ServiceCallResult, StreamError, StreamResult};
use crate::handles::{
    HandleState, UploadHandle, UploadHandleInfo, HANDLE_STATE_ACTIVE, HANDLE_STATE_NOT_IN_USE,
};
use crate::protocol_constants::{
    MAX_ENFORCED_TOKEN_EXPIRATION_DURATION, MAX_TOKEN_JITTER, MIN_TOKEN_EXPIRATION_DURATION,
    TOKEN_JITTER_RATIO, TOKEN_JITTER_THRESHOLD,
};
use crate::time::{Ticks, TICKS_PER_SECOND};
use crate::view::{
    ITEM_FLAG_BUFFERING_ACK, ITEM_FLAG_FRAGMENT_END, ITEM_FLAG_FRAGMENT_START,
    ITEM_FLAG_PERSISTED_ACK, ITEM_FLAG_RECEIVED_ACK, ITEM_FLAG_SKIP, ITEM_FLAG_STREAM_START,
};

use super::{state, ConnectionState, Notification, StreamInner};

/// Validates that the machine can accept a result for `target_state` and
/// that the result itself is one the state tolerates.
fn accept_result(
    inner: &StreamInner,
    target_state: u32,
    result: ServiceCallResult,
    tolerated: &[ServiceCallResult],
) -> StreamResult<()> {
    if !state::machine_accepts(inner, state::accept_mask_of(target_state)) {
        return Err(StreamError::InvalidStreamState);
    }
    if result == ServiceCallResult::Ok || tolerated.contains(&result) || result.is_timeout() {
        Ok(())
    } else {
        result.check()
    }
}

pub(crate) fn describe_stream_result_locked(
    inner: &mut StreamInner,
    result: ServiceCallResult,
    description: Option<&StreamDescription>,
) -> StreamResult<()> {
    accept_result(
        inner,
        state::STREAM_STATE_DESCRIBE,
        result,
        &[
            ServiceCallResult::ResourceNotFound,
            ServiceCallResult::Unknown,
            ServiceCallResult::NotAuthorized,
        ],
    )?;
    inner.record_call_latency(true);
    inner.last_result = result;

    if result == ServiceCallResult::Ok {
        let description = description.ok_or(StreamError::InvalidDescribeStreamResponse)?;
        if description.status == StreamStatus::Deleting {
            return Err(StreamError::StreamIsBeingDeleted);
        }
        if description.stream_arn.is_empty() {
            return Err(StreamError::InvalidDescribeStreamResponse);
        }
        inner.arn = description.stream_arn.clone();

        if !inner.info.kms_key_id.is_empty() && inner.info.kms_key_id != description.kms_key_id {
            log::warn!(
                "[Stream] {}: KMS key from describe does not match the configuration",
                inner.info.name
            );
        }
        if inner.info.retention != description.retention {
            log::warn!(
                "[Stream] {}: retention from describe does not match the configuration",
                inner.info.name
            );
        }
        if inner.info.content_type != description.content_type {
            log::warn!(
                "[Stream] {}: content type from describe does not match the configuration",
                inner.info.name
            );
        }
        inner.stream_status = Some(description.status);
        inner.retention = description.retention;
    }

    state::step_stream(inner)
}

pub(crate) fn create_stream_result_locked(
    inner: &mut StreamInner,
    result: ServiceCallResult,
    stream_arn: Option<&str>,
) -> StreamResult<()> {
    accept_result(
        inner,
        state::STREAM_STATE_CREATE,
        result,
        &[ServiceCallResult::Unknown, ServiceCallResult::NotAuthorized],
    )?;
    inner.record_call_latency(true);
    inner.last_result = result;

    if result == ServiceCallResult::Ok {
        let arn = stream_arn
            .filter(|a| !a.is_empty())
            .ok_or(StreamError::InvalidCreateStreamResponse)?;
        inner.arn = arn.to_string();
        // A freshly created stream is active by definition.
        inner.stream_status = Some(StreamStatus::Active);
    }

    state::step_stream(inner)
}

pub(crate) fn tag_stream_result_locked(
    inner: &mut StreamInner,
    result: ServiceCallResult,
) -> StreamResult<()> {
    accept_result(
        inner,
        state::STREAM_STATE_TAG_STREAM,
        result,
        &[ServiceCallResult::Unknown, ServiceCallResult::NotAuthorized],
    )?;
    inner.record_call_latency(true);
    inner.last_result = result;

    match state::step_stream(inner) {
        Err(err @ StreamError::ServiceCallFailed { state: "tag-stream", .. }) => {
            // Tagging is not load-bearing; report and move on.
            log::warn!(
                "[Stream] {}: tagging failed ({err}), continuing without tags",
                inner.info.name
            );
            inner.emit(Notification::StreamError {
                handle: None,
                ts: None,
                error: err,
            });
            inner.last_result = ServiceCallResult::Ok;
            state::step_stream(inner)
        }
        other => other,
    }
}

pub(crate) fn get_streaming_endpoint_result_locked(
    inner: &mut StreamInner,
    result: ServiceCallResult,
    endpoint: Option<&str>,
) -> StreamResult<()> {
    accept_result(
        inner,
        state::STREAM_STATE_GET_ENDPOINT,
        result,
        &[ServiceCallResult::Unknown, ServiceCallResult::NotAuthorized],
    )?;
    inner.record_call_latency(true);
    inner.last_result = result;

    if result == ServiceCallResult::Ok {
        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .ok_or_else(|| StreamError::InvalidArgument("empty streaming endpoint".into()))?;
        inner.streaming_endpoint = endpoint.to_string();
    }

    state::step_stream(inner)
}

pub(crate) fn get_streaming_token_result_locked(
    inner: &mut StreamInner,
    result: ServiceCallResult,
    token: Option<AuthInfo>,
) -> StreamResult<()> {
    accept_result(
        inner,
        state::STREAM_STATE_GET_TOKEN,
        result,
        &[ServiceCallResult::Unknown],
    )?;
    // The token path usually terminates in a cached credential provider,
    // so its latency would skew the control-plane numbers.
    inner.last_result = result;

    if result == ServiceCallResult::Ok {
        match token {
            Some(token) => {
                if token.expiration <= inner.now
                    || token.expiration - inner.now < MIN_TOKEN_EXPIRATION_DURATION
                {
                    return Err(StreamError::InvalidTokenExpiration);
                }
                let capped = token
                    .expiration
                    .min(inner.now + MAX_ENFORCED_TOKEN_EXPIRATION_DURATION);
                let expiration = randomize_token_expiration(capped, inner.now);
                inner.streaming_auth = Some(AuthInfo {
                    data: token.data,
                    expiration,
                });
            }
            None => {
                // Anonymous streaming: no token, no rotation deadline.
                inner.streaming_auth = None;
            }
        }
        inner.grace_period = false;
    }

    state::step_stream(inner)
}

/// Subtracts a bounded random jitter from the token expiration so a fleet
/// of producers does not rotate in lockstep.
fn randomize_token_expiration(expiration: Ticks, now: Ticks) -> Ticks {
    let remaining = expiration.saturating_sub(now);
    if remaining <= TOKEN_JITTER_THRESHOLD {
        return expiration;
    }
    let jitter_window_secs =
        (remaining as f64 * TOKEN_JITTER_RATIO / TICKS_PER_SECOND as f64) as u64;
    if jitter_window_secs == 0 {
        return expiration;
    }
    let jitter_secs = rand::thread_rng().gen_range(0..jitter_window_secs);
    let jitter = (jitter_secs * TICKS_PER_SECOND).min(MAX_TOKEN_JITTER);
    expiration - jitter
}

pub(crate) fn put_stream_result_locked(
    inner: &mut StreamInner,
    result: ServiceCallResult,
    handle: Option<UploadHandle>,
) -> StreamResult<()> {
    accept_result(
        inner,
        state::STREAM_STATE_PUT_STREAM,
        result,
        &[ServiceCallResult::Unknown, ServiceCallResult::NotAuthorized],
    )?;
    inner.record_call_latency(false);
    inner.last_result = result;

    if result == ServiceCallResult::Ok {
        let handle =
            handle.ok_or_else(|| StreamError::InvalidArgument("missing upload handle".into()))?;
        inner
            .handles
            .push(UploadHandleInfo::new(handle, inner.now));
        inner.diagnostics.total_sessions += 1;
        log::debug!(
            "[Stream] {}: upload handle {} created",
            inner.info.name,
            handle.0
        );
    }

    state::step_stream(inner)
}

/// Applies an upload-connection termination.
///
/// With no handle given, every session is torn down and the machine spawns
/// a fresh one. With a specific handle, the rollback indicator is armed
/// only if that session had served bytes and no other session is active
/// (rolling back under an active session would corrupt its byte stream).
pub(crate) fn stream_terminated_locked(
    inner: &mut StreamInner,
    handle: Option<UploadHandle>,
    result: ServiceCallResult,
    connection_still_alive: bool,
) -> StreamResult<()> {
    let mut spawn_new_session = true;

    if result != ServiceCallResult::StreamAuthInGracePeriod {
        inner.connection_state = ConnectionState::RollbackNeeded;

        match handle {
            None => {
                let handles: Vec<UploadHandle> =
                    inner.handles.iter().map(|h| h.handle).collect();
                for h in handles {
                    if let Some(info) = inner.handles.get_mut(h) {
                        info.state = HandleState::Terminated;
                    }
                    // Pulse so the host collects the end-of-stream status.
                    inner.emit(Notification::DataAvailable {
                        handle: h,
                        duration: 0,
                        bytes: 0,
                    });
                }
            }
            Some(h) => match inner.handles.get(h) {
                None => {
                    log::warn!(
                        "[Stream] {}: termination for unknown upload handle {}",
                        inner.info.name,
                        h.0
                    );
                }
                Some(info) => {
                    let unused = info.in_state(HANDLE_STATE_NOT_IN_USE);
                    let was_awaiting = info.state == HandleState::AwaitingAck;
                    let last_fragment_ts = info.last_fragment_ts;

                    inner.handles.get_mut(h).expect("checked").state = HandleState::Terminated;

                    if unused {
                        inner.connection_state = ConnectionState::CleanRestart;
                    } else if inner.handles.first_in_state(HANDLE_STATE_ACTIVE).is_some() {
                        inner.connection_state = ConnectionState::CleanRestart;
                        log::warn!(
                            "[Stream] {}: last fragment at {:?} on handle {} might not be fully persisted",
                            inner.info.name,
                            last_fragment_ts,
                            h.0
                        );
                        if was_awaiting {
                            inner.emit(Notification::StreamError {
                                handle: Some(h),
                                ts: last_fragment_ts,
                                error: StreamError::PersistedAckNotReceived,
                            });
                        }
                    }

                    if connection_still_alive {
                        // Let the handle observe its terminal status.
                        inner.emit(Notification::DataAvailable {
                            handle: h,
                            duration: 0,
                            bytes: 0,
                        });
                    } else {
                        inner.handles.remove(h);
                    }

                    if let Some(active) = inner.handles.first_in_state(HANDLE_STATE_ACTIVE) {
                        spawn_new_session = false;
                        let next = active.handle;
                        inner.emit(Notification::DataAvailable {
                            handle: next,
                            duration: 0,
                            bytes: 0,
                        });
                    }
                }
            },
        }
    }

    // Already renegotiating the control plane.
    let renegotiating = state::STREAM_STATE_DESCRIBE
        | state::STREAM_STATE_CREATE
        | state::STREAM_STATE_TAG_STREAM
        | state::STREAM_STATE_GET_TOKEN
        | state::STREAM_STATE_GET_ENDPOINT
        | state::STREAM_STATE_READY;
    if state::machine_accepts(inner, renegotiating) {
        return Ok(());
    }

    if spawn_new_session {
        inner.indicator = state::STREAM_STATE_STOPPED;
        if !state::machine_accepts(inner, state::accept_mask_of(state::STREAM_STATE_STOPPED)) {
            return Err(StreamError::InvalidStreamState);
        }
        inner.last_result = result;
        state::step_stream(inner)?;
    }
    Ok(())
}

/// Applies one fragment ACK.
pub(crate) fn fragment_ack_locked(
    inner: &mut StreamInner,
    handle: UploadHandle,
    ack: &FragmentAck,
) -> StreamResult<()> {
    let result = apply_fragment_ack(inner, handle, ack);
    // The ACK-received notification fires even when correlation failed.
    inner.emit(Notification::AckReceived {
        handle,
        ack: ack.clone(),
    });
    result
}

fn apply_fragment_ack(
    inner: &mut StreamInner,
    handle: UploadHandle,
    ack: &FragmentAck,
) -> StreamResult<()> {
    if ack.ack_type == AckType::Idle {
        inner.diagnostics.idle_acks += 1;
        return Ok(());
    }

    let Some(info) = inner.handles.get(handle) else {
        log::warn!(
            "[Stream] {}: ACK for expired upload handle {}",
            inner.info.name,
            handle.0
        );
        return Ok(());
    };
    if matches!(info.state, HandleState::Terminated | HandleState::Error) {
        log::warn!(
            "[Stream] {}: ACK for closed upload handle {}",
            inner.info.name,
            handle.0
        );
        return Ok(());
    }
    let session_start_ts = info.session_start_ts;
    let last_persisted = info.last_persisted_ack_ts;

    // Resolve the ACK timecode into an absolute item timestamp.
    let (timestamp, error_skip_start) = match ack.timecode {
        Some(timecode) => {
            let mut ts = inner.generator.timecode_to_ticks(timecode);
            if !inner.info.absolute_fragment_times {
                if let Some(start) = session_start_ts {
                    ts += start;
                }
            }
            (ts, Some(ts))
        }
        None => {
            // No timecode: best effort against the item being served.
            if inner.view.is_empty() {
                return Err(StreamError::AckTimestampNotInView);
            }
            let head = inner.view.head()?.index;
            let index = inner.view.current_index().min(head);
            let ts = inner.view.item_at(index)?.ack_timestamp;
            (ts, last_persisted.or(session_start_ts))
        }
    };

    let in_view = inner.view.timestamp_in_range(timestamp, true);

    match ack.ack_type {
        AckType::Buffering => {
            if in_view {
                let item = view_item_for_ack(inner, timestamp)?;
                item.flags |= ITEM_FLAG_BUFFERING_ACK;
                inner.diagnostics.buffering_acks += 1;
            }
        }
        AckType::Received => {
            if in_view {
                let item = view_item_for_ack(inner, timestamp)?;
                item.flags |= ITEM_FLAG_RECEIVED_ACK;
                inner.diagnostics.received_acks += 1;
            }
        }
        AckType::Persisted => {
            if in_view {
                persisted_ack(inner, handle, timestamp)?;
            }
        }
        AckType::Error => {
            // Error ACKs are processed even out of view: their side effect
            // is the connection teardown.
            let timestamp = if in_view {
                timestamp
            } else {
                inner.view.tail()?.ack_timestamp
            };
            error_ack(inner, error_skip_start, timestamp, ack.result)?;
        }
        AckType::Idle => unreachable!("handled above"),
    }

    if !in_view {
        // Counted in metrics via the ack-received notification, but not
        // correlated to an item.
        return Err(StreamError::AckTimestampNotInView);
    }
    Ok(())
}

fn view_item_for_ack<'a>(
    inner: &'a mut StreamInner,
    timestamp: Ticks,
) -> StreamResult<&'a mut crate::view::ViewItem> {
    let index = inner.view.item_with_timestamp(timestamp, true)?.index;
    inner.view.item_at_mut(index)
}

/// Applies a persisted ACK: records it on the session, completes an
/// awaiting session when it covers the last fragment, and trims the view
/// tail past the persisted fragment when no older session still needs the
/// data.
fn persisted_ack(
    inner: &mut StreamInner,
    handle: UploadHandle,
    timestamp: Ticks,
) -> StreamResult<()> {
    inner.diagnostics.persisted_acks += 1;
    {
        let info = inner.handles.get_mut(handle).expect("validated");
        info.last_persisted_ack_ts = Some(timestamp);
    }

    let acked_index = {
        let item = view_item_for_ack(inner, timestamp)?;
        item.flags |= ITEM_FLAG_PERSISTED_ACK;
        item.index
    };

    // An awaiting session whose final fragment just persisted can finish;
    // pulse it so it collects its end-of-stream.
    let (awaiting_done, sizes) = {
        let info = inner.handles.get(handle).expect("validated");
        let done = inner.wait_for_persisted_ack()
            && info.state == HandleState::AwaitingAck
            && info.last_fragment_ts == Some(timestamp);
        (done, inner.available_view_size())
    };
    if awaiting_done {
        inner.handles.get_mut(handle).expect("validated").state = HandleState::AckReceived;
        inner.emit(Notification::DataAvailable {
            handle,
            duration: sizes.0,
            bytes: sizes.1,
        });
    }

    if !inner.handles.eligible_to_trim(handle) {
        return Ok(());
    }

    // Walk from the acked fragment to the start of the next unpersisted
    // fragment; everything before it can leave the buffer.
    let saved_current = inner.view.current_index();
    inner.view.set_current(acked_index + 1)?;
    let mut boundary = None;
    loop {
        let Some(item) = next_boundary_item_raw(inner) else {
            break;
        };
        if item.has_flag(ITEM_FLAG_FRAGMENT_START) && item.has_flag(ITEM_FLAG_PERSISTED_ACK) {
            continue;
        }
        boundary = Some(item);
        break;
    }

    let trim_result = if let Some(boundary) = boundary {
        let mut trim_to = boundary.index;
        if boundary.has_flag(ITEM_FLAG_FRAGMENT_END) {
            trim_to += 1;
        }
        inner.view.trim_tail(trim_to).map(Some)
    } else {
        Ok(None)
    };

    // Put the read cursor back before acting on the trim outcome; the trim
    // may have moved the tail past the saved position.
    let restored = saved_current.max(inner.view.tail_index());
    inner.view.set_current(restored)?;

    if let Some(evicted) = trim_result? {
        inner.effects.push(super::Effect::ReleaseStorage {
            allocations: evicted.iter().map(|e| e.item.handle).collect(),
        });
        log::debug!(
            "[Stream] {}: persisted ACK trimmed {} items",
            inner.info.name,
            evicted.len()
        );
    }
    Ok(())
}

/// Boundary walk that does not skip errored items (persisted-trim must see
/// every fragment boundary).
fn next_boundary_item_raw(inner: &mut StreamInner) -> Option<crate::view::ViewItem> {
    loop {
        let item = inner.view.get_next()?;
        if item.is_boundary() {
            return Some(item);
        }
    }
}

/// Applies an error ACK: rewinds the read cursor to the failed fragment
/// for retransmission, poisons the fragment's items when the error is not
/// retriable, reports the error, and tears the connection down.
fn error_ack(
    inner: &mut StreamInner,
    skip_start: Option<Ticks>,
    timestamp: Ticks,
    call_result: ServiceCallResult,
) -> StreamResult<()> {
    inner.diagnostics.error_acks += 1;

    let err_index = inner.view.item_with_timestamp(timestamp, true)?.index;
    let err_item_ts = inner.view.item_at(err_index)?.timestamp;
    inner.view.set_current(err_index)?;

    if !call_result.is_retriable() {
        // Poison backwards to the start of the failed span.
        if let Some(start) = skip_start {
            if start != timestamp {
                let mut index = err_index;
                while index > inner.view.tail_index() {
                    index -= 1;
                    let item = inner.view.item_at_mut(index)?;
                    if item.ack_timestamp < start {
                        break;
                    }
                    item.flags |= ITEM_FLAG_SKIP;
                    inner.diagnostics.skipped_frames += 1;
                }
            }
        }

        // Poison forward through the whole failed fragment.
        let mut resume_index = None;
        loop {
            let Some(item) = inner.view.get_next() else {
                // The failed fragment is still being assembled; keep
                // poisoning through put-frame until the next key frame,
                // which also re-emits the container header.
                inner.reset_generator_on_key_frame = true;
                inner.skip_non_key_frames = true;
                break;
            };
            if item.index != err_index
                && item.has_flag(
                    ITEM_FLAG_FRAGMENT_START | ITEM_FLAG_STREAM_START | ITEM_FLAG_FRAGMENT_END,
                )
            {
                resume_index = Some(item.index);
                break;
            }
            let stored = inner.view.item_at_mut(item.index)?;
            stored.flags |= ITEM_FLAG_SKIP;
            inner.diagnostics.skipped_frames += 1;
        }
        if let Some(index) = resume_index {
            inner.view.set_current(index)?;
        }
    }

    let current_handle = inner
        .handles
        .first_in_state(HandleState::Streaming.mask())
        .map(|h| h.handle);

    inner.emit(Notification::StreamError {
        handle: current_handle,
        ts: Some(err_item_ts),
        error: StreamError::ServiceCall(call_result),
    });

    // The backend drops the connection after an error ACK; terminate
    // proactively since the transport may not notice.
    if let Some(handle) = current_handle {
        stream_terminated_locked(inner, Some(handle), call_result, true)?;
    }
    Ok(())
}

/// Marks the stream closed and signals everyone waiting on it.
pub(crate) fn notify_stream_closed(inner: &mut StreamInner, handle: Option<UploadHandle>) {
    if inner.stream_closed {
        return;
    }
    inner.stream_closed = true;
    inner.signals.closed.notify_all();
    inner.emit(Notification::StreamClosed { handle });
    log::info!("[Stream] {} closed", inner.info.name);
}
