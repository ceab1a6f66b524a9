//! Producer client.
//!
//! A [`Client`] owns the shared content store, the registry of its
//! streams, and the device-level provisioning state machine. Streams are
//! created through the client and hold a weak reference back to it; the
//! store outlives every stream.

mod state;

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::callbacks::{
    AnonymousCredentials, CredentialProvider, NullObserver, ProducerObserver, ServiceBackend,
    ServiceCallContext,
};
use crate::config::{ClientConfig, StreamInfo};
use crate::error::{ServiceCallResult, StreamError, StreamResult};
use crate::gate::EntryGate;
use crate::machine::MachineCore;
use crate::metrics::ClientMetrics;
use crate::protocol_constants::SERVICE_CALL_DEFAULT_TIMEOUT;
use crate::store::{ContentStore, InMemoryStore, SpillStore};
use crate::stream::Stream;
use crate::time::{Clock, SystemClock, Ticks};

/// Deferred client-level outbound call.
pub(crate) enum ClientEffect {
    CreateDevice { call_after: Ticks },
    TagDevice { call_after: Ticks, arn: String },
    NotifyReady,
}

/// Client state guarded by the client lock.
pub(crate) struct ClientInner {
    pub machine: MachineCore,
    pub last_result: ServiceCallResult,
    pub device_arn: String,
    pub client_ready: bool,
    pub has_token: bool,
    pub has_certificate: bool,
    pub device_tag_count: usize,
    pub now: Ticks,
    pub effects: Vec<ClientEffect>,
}

/// Producer client owning streams and the shared content store.
pub struct Client {
    config: ClientConfig,
    self_ref: Weak<Client>,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn ServiceBackend>,
    observer: Arc<dyn ProducerObserver>,
    credentials: Arc<dyn CredentialProvider>,
    store: Mutex<Box<dyn ContentStore>>,
    streams: DashMap<String, Arc<Stream>>,
    inner: Mutex<ClientInner>,
    ready: Condvar,
    gate: EntryGate,
}

impl Client {
    /// Creates a client with the default observer, anonymous credentials,
    /// and the system clock.
    pub fn new(config: ClientConfig, backend: Arc<dyn ServiceBackend>) -> StreamResult<Arc<Self>> {
        Self::with_parts(
            config,
            backend,
            Arc::new(NullObserver),
            Arc::new(AnonymousCredentials),
            Arc::new(SystemClock),
        )
    }

    /// Creates a fully parameterized client.
    pub fn with_parts(
        config: ClientConfig,
        backend: Arc<dyn ServiceBackend>,
        observer: Arc<dyn ProducerObserver>,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
    ) -> StreamResult<Arc<Self>> {
        config.validate()?;

        let store: Box<dyn ContentStore> = match &config.spill_dir {
            Some(dir) => {
                // Half the budget stays resident; the rest spills.
                let mem_limit = config.storage_size / 2;
                Box::new(SpillStore::new(config.storage_size, mem_limit, dir)?)
            }
            None => Box::new(InMemoryStore::new(config.storage_size)),
        };

        let now = clock.now();
        let device_tag_count = config.device_tags.len();
        let client = Arc::new_cyclic(|weak: &Weak<Client>| Self {
            config,
            self_ref: weak.clone(),
            clock,
            backend,
            observer,
            credentials,
            store: Mutex::new(store),
            streams: DashMap::new(),
            inner: Mutex::new(ClientInner {
                machine: MachineCore::new(),
                last_result: ServiceCallResult::NotSet,
                device_arn: String::new(),
                client_ready: false,
                has_token: false,
                has_certificate: false,
                device_tag_count,
                now,
                effects: Vec::new(),
            }),
            ready: Condvar::new(),
            gate: EntryGate::new(),
        });

        client.step_machine()?;
        Ok(client)
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn self_arc(&self) -> Arc<Client> {
        self.self_ref
            .upgrade()
            .expect("a live client always has an owner")
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn backend(&self) -> &Arc<dyn ServiceBackend> {
        &self.backend
    }

    pub(crate) fn observer(&self) -> &Arc<dyn ProducerObserver> {
        &self.observer
    }

    pub(crate) fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    pub(crate) fn store(&self) -> &Mutex<Box<dyn ContentStore>> {
        &self.store
    }

    /// Creates a stream and starts its control-plane handshake.
    pub fn create_stream(&self, info: StreamInfo) -> StreamResult<Arc<Stream>> {
        let _permit = self.gate.enter()?;
        if self.streams.contains_key(&info.name) {
            return Err(StreamError::DuplicateStreamName(info.name));
        }
        let name = info.name.clone();
        let stream = Stream::new(&self.self_arc(), info)?;
        // A racing create with the same name loses here.
        match self.streams.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StreamError::DuplicateStreamName(name));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(stream.clone());
            }
        }
        log::info!("[Client] Stream {name} created");
        Ok(stream)
    }

    /// Creates a stream and blocks until it reaches the ready state.
    pub fn create_stream_sync(&self, info: StreamInfo) -> StreamResult<Arc<Stream>> {
        let stream = self.create_stream(info)?;
        stream.await_ready(self.config.create_stream_timeout)?;
        Ok(stream)
    }

    /// Looks up a stream by name.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.get(name).map(|s| Arc::clone(s.value()))
    }

    /// Names of all registered streams.
    #[must_use]
    pub fn stream_names(&self) -> Vec<String> {
        self.streams.iter().map(|s| s.key().clone()).collect()
    }

    /// Tears one stream down and removes it from the registry. Repeated
    /// calls for the same name are no-ops.
    pub fn free_stream(&self, name: &str) -> StreamResult<()> {
        let Some((_, stream)) = self.streams.remove(name) else {
            return Ok(());
        };
        stream.shutdown(&self.self_arc());
        log::info!("[Client] Stream {name} freed");
        Ok(())
    }

    /// Tears down every stream and the client itself.
    pub fn shutdown(&self) {
        let names = self.stream_names();
        for name in names {
            let _ = self.free_stream(&name);
        }
        self.gate.lock();
        self.ready.notify_all();
        if let Err(err) = self.gate.wait_until_clear(self.config.shutdown_timeout) {
            log::warn!("[Client] Shutdown drain incomplete: {err}");
        }
        self.observer.client_shutdown(&self.self_arc());
    }

    /// Blocks until the client-level provisioning machine reaches ready.
    pub fn await_ready(&self, timeout: Ticks) -> StreamResult<()> {
        let mut inner = self.inner.lock();
        while !inner.client_ready {
            if self
                .ready
                .wait_for(&mut inner, crate::time::ticks_to_duration(timeout))
                .timed_out()
            {
                return Err(StreamError::OperationTimedOut);
            }
        }
        Ok(())
    }

    /// Current storage metrics.
    #[must_use]
    pub fn metrics(&self) -> ClientMetrics {
        let store = self.store.lock();
        ClientMetrics {
            storage_capacity: store.capacity(),
            storage_in_use: store.bytes_in_use(),
            stream_count: self.streams.len(),
        }
    }

    /// Reports the result of a create-device call.
    pub fn create_device_result(
        &self,
        result: ServiceCallResult,
        device_arn: &str,
    ) -> StreamResult<()> {
        self.with_locked(|inner| {
            if !inner.machine.accepts(state::CLIENT_TABLE, state::CLIENT_STATE_CREATE) {
                return Err(StreamError::InvalidStreamState);
            }
            inner.last_result = result;
            if result == ServiceCallResult::Ok {
                inner.device_arn = device_arn.to_string();
            }
            state::step_client(inner)
        })
    }

    /// Reports the result of a tag-resource call for the device.
    pub fn tag_device_result(&self, result: ServiceCallResult) -> StreamResult<()> {
        self.with_locked(|inner| {
            if !inner
                .machine
                .accepts(state::CLIENT_TABLE, state::CLIENT_STATE_TAG_CLIENT)
            {
                return Err(StreamError::InvalidStreamState);
            }
            inner.last_result = result;
            state::step_client(inner)
        })
    }

    /// Advances the provisioning machine, refreshing the credential
    /// snapshot first.
    pub(crate) fn step_machine(&self) -> StreamResult<()> {
        let has_token = self.credentials.security_token().is_some();
        let has_certificate = self.credentials.device_certificate().is_some();
        self.with_locked(|inner| {
            inner.has_token = has_token;
            inner.has_certificate = has_certificate;
            state::step_client(inner)
        })
    }

    fn with_locked<R>(
        &self,
        f: impl FnOnce(&mut ClientInner) -> StreamResult<R>,
    ) -> StreamResult<R> {
        let (result, effects) = {
            let mut inner = self.inner.lock();
            inner.now = self.clock.now();
            let result = f(&mut inner);
            (result, std::mem::take(&mut inner.effects))
        };
        self.dispatch(effects);
        result
    }

    fn dispatch(&self, effects: Vec<ClientEffect>) {
        for effect in effects {
            match effect {
                ClientEffect::CreateDevice { call_after } => {
                    let ctx = ServiceCallContext {
                        call_after,
                        timeout: SERVICE_CALL_DEFAULT_TIMEOUT,
                        auth: self.credentials.security_token(),
                    };
                    self.backend
                        .create_device(&self.self_arc(), &self.config.device_name, &ctx);
                }
                ClientEffect::TagDevice { call_after, arn } => {
                    let ctx = ServiceCallContext {
                        call_after,
                        timeout: SERVICE_CALL_DEFAULT_TIMEOUT,
                        auth: self.credentials.security_token(),
                    };
                    self.backend
                        .tag_device(&self.self_arc(), &arn, &self.config.device_tags, &ctx);
                }
                ClientEffect::NotifyReady => {
                    self.ready.notify_all();
                    self.observer.client_ready(&self.self_arc());
                }
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("device_name", &self.config.device_name)
            .field("streams", &self.streams.len())
            .finish()
    }
}
