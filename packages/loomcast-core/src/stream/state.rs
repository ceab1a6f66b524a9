//! Stream control-plane state machine.
//!
//! Drives the handshake `describe -> create -> tag -> get-endpoint ->
//! get-token -> ready -> put-stream -> streaming` and the recovery routing
//! out of `stopped`. Service calls are emitted as effects; the machine is
//! advanced again when the host reports each call's result.

use crate::error::{ServiceCallResult, StreamError, StreamResult};
use crate::handles::HandleState;
use crate::machine::{self, MachineCore, StateSpec};
use crate::protocol_constants::SERVICE_CALL_MAX_RETRY_COUNT;
use crate::time::Ticks;

use super::{Effect, Notification, StreamInner};

pub(crate) const STREAM_STATE_NEW: u32 = 1 << 0;
pub(crate) const STREAM_STATE_DESCRIBE: u32 = 1 << 1;
pub(crate) const STREAM_STATE_CREATE: u32 = 1 << 2;
pub(crate) const STREAM_STATE_TAG_STREAM: u32 = 1 << 3;
pub(crate) const STREAM_STATE_GET_TOKEN: u32 = 1 << 4;
pub(crate) const STREAM_STATE_GET_ENDPOINT: u32 = 1 << 5;
pub(crate) const STREAM_STATE_READY: u32 = 1 << 6;
pub(crate) const STREAM_STATE_PUT_STREAM: u32 = 1 << 7;
pub(crate) const STREAM_STATE_STREAMING: u32 = 1 << 8;
pub(crate) const STREAM_STATE_STOPPED: u32 = 1 << 9;

/// Advances the stream machine one step.
pub(crate) fn step_stream(inner: &mut StreamInner) -> StreamResult<()> {
    let now = inner.now;
    machine::step(
        STREAM_TABLE,
        |i: &mut StreamInner| &mut i.machine,
        |i: &StreamInner| i.last_result,
        "Stream",
        inner,
        now,
    )
}

/// Whether the machine currently sits in one of `mask`'s states.
pub(crate) fn machine_accepts(inner: &StreamInner, mask: u32) -> bool {
    inner.machine.accepts(STREAM_TABLE, mask)
}

/// Accept mask of a state: the set of states allowed to transition there.
/// Events validate against this before applying a call result.
pub(crate) fn accept_mask_of(state: u32) -> u32 {
    STREAM_TABLE
        .iter()
        .find(|s| s.state == state)
        .map(|s| s.accept)
        .unwrap_or(0)
}

fn from_new(inner: &mut StreamInner) -> StreamResult<u32> {
    Ok(if inner.indicator == STREAM_STATE_STOPPED {
        STREAM_STATE_STOPPED
    } else {
        STREAM_STATE_DESCRIBE
    })
}

fn execute_new(inner: &mut StreamInner, _call_after: Ticks) -> StreamResult<()> {
    step_stream(inner)
}

fn execute_describe(inner: &mut StreamInner, call_after: Ticks) -> StreamResult<()> {
    inner.last_result = ServiceCallResult::NotSet;
    inner.last_call_after = call_after;
    inner.effects.push(Effect::DescribeStream { call_after });
    Ok(())
}

fn from_describe(inner: &mut StreamInner) -> StreamResult<u32> {
    if inner.indicator == STREAM_STATE_STOPPED {
        return Ok(STREAM_STATE_STOPPED);
    }
    match inner.last_result {
        ServiceCallResult::Ok => {
            if inner.stream_status == Some(crate::callbacks::StreamStatus::Deleting) {
                return Err(StreamError::StreamIsBeingDeleted);
            }
            if inner.stream_status == Some(crate::callbacks::StreamStatus::Active) {
                if inner.info.tags.is_empty() {
                    Ok(STREAM_STATE_GET_ENDPOINT)
                } else {
                    Ok(STREAM_STATE_TAG_STREAM)
                }
            } else {
                Ok(STREAM_STATE_DESCRIBE)
            }
        }
        ServiceCallResult::ResourceNotFound => Ok(STREAM_STATE_CREATE),
        _ => Ok(STREAM_STATE_DESCRIBE),
    }
}

fn execute_create(inner: &mut StreamInner, call_after: Ticks) -> StreamResult<()> {
    inner.last_result = ServiceCallResult::NotSet;
    inner.last_call_after = call_after;
    inner.effects.push(Effect::CreateStream { call_after });
    Ok(())
}

fn from_create(inner: &mut StreamInner) -> StreamResult<u32> {
    if inner.indicator == STREAM_STATE_STOPPED {
        return Ok(STREAM_STATE_STOPPED);
    }
    if inner.last_result == ServiceCallResult::Ok {
        if inner.info.tags.is_empty() {
            Ok(STREAM_STATE_GET_ENDPOINT)
        } else {
            Ok(STREAM_STATE_TAG_STREAM)
        }
    } else {
        Ok(STREAM_STATE_CREATE)
    }
}

fn execute_tag(inner: &mut StreamInner, call_after: Ticks) -> StreamResult<()> {
    inner.last_result = ServiceCallResult::NotSet;
    inner.last_call_after = call_after;
    let arn = inner.arn.clone();
    inner.effects.push(Effect::TagStream { call_after, arn });
    Ok(())
}

fn from_tag(inner: &mut StreamInner) -> StreamResult<u32> {
    if inner.indicator == STREAM_STATE_STOPPED {
        return Ok(STREAM_STATE_STOPPED);
    }
    if inner.last_result == ServiceCallResult::Ok {
        Ok(STREAM_STATE_GET_ENDPOINT)
    } else {
        Ok(STREAM_STATE_TAG_STREAM)
    }
}

fn execute_get_endpoint(inner: &mut StreamInner, call_after: Ticks) -> StreamResult<()> {
    inner.last_result = ServiceCallResult::NotSet;
    inner.last_call_after = call_after;
    inner.effects.push(Effect::GetEndpoint { call_after });
    Ok(())
}

fn from_get_endpoint(inner: &mut StreamInner) -> StreamResult<u32> {
    if inner.indicator == STREAM_STATE_STOPPED {
        return Ok(STREAM_STATE_STOPPED);
    }
    if inner.last_result == ServiceCallResult::Ok {
        Ok(STREAM_STATE_GET_TOKEN)
    } else {
        Ok(STREAM_STATE_GET_ENDPOINT)
    }
}

fn execute_get_token(inner: &mut StreamInner, call_after: Ticks) -> StreamResult<()> {
    inner.last_result = ServiceCallResult::NotSet;
    inner.last_call_after = call_after;
    inner.effects.push(Effect::GetToken { call_after });
    Ok(())
}

fn from_get_token(inner: &mut StreamInner) -> StreamResult<u32> {
    if inner.indicator == STREAM_STATE_STOPPED {
        return Ok(STREAM_STATE_STOPPED);
    }
    if inner.last_result == ServiceCallResult::Ok {
        Ok(STREAM_STATE_READY)
    } else {
        Ok(STREAM_STATE_GET_TOKEN)
    }
}

fn execute_ready(inner: &mut StreamInner, _call_after: Ticks) -> StreamResult<()> {
    inner.stream_ready = true;
    inner.signals.ready.notify_all();
    inner.emit(Notification::StreamReady);

    // Move on to put-stream right away when resuming after a stop or when
    // content is already buffered. On the initial bring-up the machine
    // idles here until the first frame arrives.
    let (_, bytes) = inner.available_view_size();
    if inner.indicator == STREAM_STATE_READY
        || inner.indicator == STREAM_STATE_STOPPED
        || bytes != 0
    {
        step_stream(inner)?;
    }
    Ok(())
}

fn from_ready(inner: &mut StreamInner) -> StreamResult<u32> {
    Ok(if inner.indicator == STREAM_STATE_STOPPED {
        STREAM_STATE_STOPPED
    } else {
        STREAM_STATE_PUT_STREAM
    })
}

fn execute_put_stream(inner: &mut StreamInner, call_after: Ticks) -> StreamResult<()> {
    if inner.indicator != STREAM_STATE_PUT_STREAM {
        inner.last_result = ServiceCallResult::NotSet;
        inner.last_call_after = call_after;
        inner.effects.push(Effect::PutStream {
            call_after,
            start_time: inner.now,
            endpoint: inner.streaming_endpoint.clone(),
            auth: inner.streaming_auth.clone(),
        });
        inner.indicator = STREAM_STATE_PUT_STREAM;
    }
    Ok(())
}

fn from_put_stream(inner: &mut StreamInner) -> StreamResult<u32> {
    if inner.indicator == STREAM_STATE_STOPPED {
        return Ok(STREAM_STATE_STOPPED);
    }
    match inner.last_result {
        ServiceCallResult::Ok => {
            // Promote the freshly issued handle. If nothing else is mid
            // stream, pulse it: an intermittent producer may have no
            // further put-frame calls to drive the first read.
            if let Some(info) = inner.handles.first_in_state_mut(HandleState::New.mask()) {
                info.state = HandleState::Ready;

                let ongoing = HandleState::Streaming.mask()
                    | HandleState::Terminating.mask()
                    | HandleState::AwaitingAck.mask()
                    | HandleState::AckReceived.mask();
                if inner.handles.first_in_state(ongoing).is_none() {
                    if let Some(ready) = inner.handles.first_in_state(HandleState::Ready.mask()) {
                        let handle = ready.handle;
                        let (duration, bytes) = inner.available_view_size();
                        inner.emit(Notification::DataAvailable {
                            handle,
                            duration,
                            bytes,
                        });
                    }
                }
            }
            Ok(STREAM_STATE_STREAMING)
        }
        result if result.is_timeout() => Ok(STREAM_STATE_GET_ENDPOINT),
        ServiceCallResult::NotAuthorized | ServiceCallResult::Forbidden => {
            Ok(STREAM_STATE_GET_TOKEN)
        }
        _ => Ok(STREAM_STATE_DESCRIBE),
    }
}

fn execute_streaming(inner: &mut StreamInner, _call_after: Ticks) -> StreamResult<()> {
    inner.indicator = STREAM_STATE_STREAMING;
    Ok(())
}

fn from_streaming(inner: &mut StreamInner) -> StreamResult<u32> {
    Ok(if inner.indicator == STREAM_STATE_STOPPED {
        STREAM_STATE_STOPPED
    } else {
        STREAM_STATE_STREAMING
    })
}

fn execute_stopped(inner: &mut StreamInner, _call_after: Ticks) -> StreamResult<()> {
    inner.connection_dropped_result = inner.last_result;

    // After a timeout with nothing buffered, stay parked: the next key
    // frame self-primes the machine and becomes a fresh stream start.
    if inner.connection_dropped_result.is_timeout() {
        let (_, bytes) = inner.available_view_size();
        if bytes == 0 {
            inner.reset_generator_on_key_frame = true;
            inner.skip_non_key_frames = true;
            inner.indicator = STREAM_STATE_NEW;
            return Ok(());
        }
    }

    step_stream(inner)
}

fn from_stopped(inner: &mut StreamInner) -> StreamResult<u32> {
    // Leaving the stopped state; no longer coming from new.
    inner.indicator = STREAM_STATE_READY;

    let check = inner.last_result.check();
    if !inner.info.recover_on_error {
        check?;
    }

    Ok(match inner.last_result {
        ServiceCallResult::Ok
        | ServiceCallResult::NotSet
        | ServiceCallResult::StreamAuthInGracePeriod
        | ServiceCallResult::DeviceLimit
        | ServiceCallResult::StreamLimit => STREAM_STATE_GET_ENDPOINT,
        ServiceCallResult::NotAuthorized | ServiceCallResult::Forbidden => STREAM_STATE_GET_TOKEN,
        ServiceCallResult::ResourceInUse
        | ServiceCallResult::Unknown
        | ServiceCallResult::AckInternalError
        | ServiceCallResult::ResourceNotFound
        | ServiceCallResult::ResourceDeleted => STREAM_STATE_DESCRIBE,
        result if result.is_timeout() => STREAM_STATE_READY,
        _ => STREAM_STATE_NEW,
    })
}

static STREAM_TABLE: &[StateSpec<StreamInner>] = &[
    StateSpec {
        state: STREAM_STATE_NEW,
        accept: STREAM_STATE_NEW | STREAM_STATE_STOPPED,
        next: from_new,
        execute: execute_new,
        retry_limit: None,
        name: "new",
    },
    StateSpec {
        state: STREAM_STATE_DESCRIBE,
        accept: STREAM_STATE_NEW | STREAM_STATE_STOPPED | STREAM_STATE_DESCRIBE,
        next: from_describe,
        execute: execute_describe,
        retry_limit: Some(SERVICE_CALL_MAX_RETRY_COUNT),
        name: "describe",
    },
    StateSpec {
        state: STREAM_STATE_CREATE,
        accept: STREAM_STATE_STOPPED | STREAM_STATE_DESCRIBE | STREAM_STATE_CREATE,
        next: from_create,
        execute: execute_create,
        retry_limit: Some(SERVICE_CALL_MAX_RETRY_COUNT),
        name: "create",
    },
    StateSpec {
        state: STREAM_STATE_TAG_STREAM,
        accept: STREAM_STATE_STOPPED
            | STREAM_STATE_DESCRIBE
            | STREAM_STATE_CREATE
            | STREAM_STATE_TAG_STREAM,
        next: from_tag,
        execute: execute_tag,
        retry_limit: Some(SERVICE_CALL_MAX_RETRY_COUNT),
        name: "tag-stream",
    },
    StateSpec {
        state: STREAM_STATE_GET_ENDPOINT,
        accept: STREAM_STATE_STOPPED
            | STREAM_STATE_DESCRIBE
            | STREAM_STATE_CREATE
            | STREAM_STATE_TAG_STREAM
            | STREAM_STATE_GET_ENDPOINT,
        next: from_get_endpoint,
        execute: execute_get_endpoint,
        retry_limit: Some(SERVICE_CALL_MAX_RETRY_COUNT),
        name: "get-endpoint",
    },
    StateSpec {
        state: STREAM_STATE_GET_TOKEN,
        accept: STREAM_STATE_STOPPED | STREAM_STATE_GET_ENDPOINT | STREAM_STATE_GET_TOKEN,
        next: from_get_token,
        execute: execute_get_token,
        retry_limit: Some(SERVICE_CALL_MAX_RETRY_COUNT),
        name: "get-token",
    },
    StateSpec {
        state: STREAM_STATE_READY,
        accept: STREAM_STATE_STOPPED
            | STREAM_STATE_GET_TOKEN
            | STREAM_STATE_READY
            | STREAM_STATE_PUT_STREAM
            | STREAM_STATE_STREAMING,
        next: from_ready,
        execute: execute_ready,
        retry_limit: Some(SERVICE_CALL_MAX_RETRY_COUNT),
        name: "ready",
    },
    StateSpec {
        state: STREAM_STATE_PUT_STREAM,
        accept: STREAM_STATE_STOPPED | STREAM_STATE_READY | STREAM_STATE_PUT_STREAM,
        next: from_put_stream,
        execute: execute_put_stream,
        retry_limit: None,
        name: "put-stream",
    },
    StateSpec {
        state: STREAM_STATE_STREAMING,
        accept: STREAM_STATE_STOPPED | STREAM_STATE_PUT_STREAM | STREAM_STATE_STREAMING,
        next: from_streaming,
        execute: execute_streaming,
        retry_limit: None,
        name: "streaming",
    },
    StateSpec {
        state: STREAM_STATE_STOPPED,
        accept: STREAM_STATE_STOPPED
            | STREAM_STATE_CREATE
            | STREAM_STATE_DESCRIBE
            | STREAM_STATE_TAG_STREAM
            | STREAM_STATE_GET_ENDPOINT
            | STREAM_STATE_GET_TOKEN
            | STREAM_STATE_READY
            | STREAM_STATE_PUT_STREAM
            | STREAM_STATE_STREAMING,
        next: from_stopped,
        execute: execute_stopped,
        retry_limit: None,
        name: "stopped",
    },
];

/// Bit value of the machine's current state.
#[allow(dead_code)]
pub(crate) fn current_state(core: &MachineCore) -> u32 {
    core.state(STREAM_TABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_states_are_unique_bits() {
        let mut seen = 0u32;
        for spec in STREAM_TABLE {
            assert_eq!(spec.state.count_ones(), 1, "{} is a single bit", spec.name);
            assert_eq!(seen & spec.state, 0, "{} is unique", spec.name);
            seen |= spec.state;
        }
    }

    #[test]
    fn every_state_accepts_itself_or_documents_why_not() {
        for spec in STREAM_TABLE {
            // Self-transitions implement retries everywhere in this table.
            assert_ne!(spec.accept & spec.state, 0, "{} accepts itself", spec.name);
        }
    }

    #[test]
    fn accept_masks_reference_known_states() {
        let all: u32 = STREAM_TABLE.iter().map(|s| s.state).fold(0, |a, s| a | s);
        for spec in STREAM_TABLE {
            assert_eq!(spec.accept & !all, 0, "{} accepts only known states", spec.name);
        }
    }

    #[test]
    fn stopped_accepts_every_post_new_state() {
        let stopped = accept_mask_of(STREAM_STATE_STOPPED);
        for state in [
            STREAM_STATE_DESCRIBE,
            STREAM_STATE_CREATE,
            STREAM_STATE_TAG_STREAM,
            STREAM_STATE_GET_ENDPOINT,
            STREAM_STATE_GET_TOKEN,
            STREAM_STATE_READY,
            STREAM_STATE_PUT_STREAM,
            STREAM_STATE_STREAMING,
        ] {
            assert_ne!(stopped & state, 0);
        }
        assert_eq!(stopped & STREAM_STATE_NEW, 0, "new never stops directly");
    }
}
