use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::debug;

use crate::backoff::{Backoff, BackoffOptions};
use crate::http2::client::{Http2ClientTransport, Http2Options};
use crate::http2::types::Http2ErrorCode;
use crate::status::Status;
use crate::transport::delayed::DelayedTransport;
use crate::transport::{
    AddressGroup, ClientTransport, Connector, FailingClientTransport, TransportLifecycle,
};

/// Channel-side callbacks from a TransportSet, keyed by address group so
/// the set never holds a back-pointer to the channel.
pub trait TransportSetCallback: Send + Sync {
    fn on_in_use(&self, group: &AddressGroup, in_use: bool);
    fn on_all_addresses_failed(&self, group: &AddressGroup);
    fn on_connection_closed_by_server(&self, group: &AddressGroup, status: &Status);
    fn on_terminated(&self, group: &AddressGroup);
}

#[derive(Clone)]
pub struct TransportSetOptions {
    pub backoff: BackoffOptions,
    pub http2: Http2Options,
    pub connect_timeout: Duration,
}

impl Default for TransportSetOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffOptions::default(),
            http2: Http2Options::default(),
            connect_timeout: Duration::from_secs(20),
        }
    }
}

struct SetState {
    shutdown: bool,
    terminated: bool,
    /// The one READY transport, if any (id, transport).
    ready: Option<(u64, Arc<Http2ClientTransport>)>,
    /// Whether a connect episode is running. Combined with 'ready' this
    /// maintains the <= 1 connecting-or-connected invariant.
    connecting: bool,
    connect_task: Option<tokio::task::JoinHandle<()>>,
    /// All live transports (ready or draining), until each terminates.
    transports: HashMap<u64, Arc<Http2ClientTransport>>,
    next_transport_id: u64,
    /// Streams created while no transport is READY buffer here.
    delayed: Arc<DelayedTransport>,
    /// Delayed transport instances that have not yet terminated.
    live_delayed: usize,
    /// Aggregated in-use sources (transport streams, buffered streams).
    in_use_sources: usize,
    set_in_use: bool,
}

struct SetShared {
    group: AddressGroup,
    connector: Arc<dyn Connector>,
    callback: Arc<dyn TransportSetCallback>,
    options: TransportSetOptions,
    state: Mutex<SetState>,
}

/// Owns connections to one address group: at most one connecting or
/// connected transport at any time, re-established on demand with
/// exponential backoff across whole address-list passes.
pub struct TransportSet {
    shared: Arc<SetShared>,
}

impl TransportSet {
    pub fn new(
        group: AddressGroup,
        connector: Arc<dyn Connector>,
        callback: Arc<dyn TransportSetCallback>,
        options: TransportSetOptions,
    ) -> Arc<TransportSet> {
        let shared = Arc::new_cyclic(|weak: &Weak<SetShared>| {
            let delayed = DelayedTransport::new(Arc::new(DelayedLifecycle {
                shared: weak.clone(),
            }));
            SetShared {
                group,
                connector,
                callback,
                options,
                state: Mutex::new(SetState {
                    shutdown: false,
                    terminated: false,
                    ready: None,
                    connecting: false,
                    connect_task: None,
                    transports: HashMap::new(),
                    next_transport_id: 0,
                    delayed,
                    live_delayed: 1,
                    in_use_sources: 0,
                    set_in_use: false,
                }),
            }
        });
        Arc::new(TransportSet { shared })
    }

    pub fn group(&self) -> &AddressGroup {
        &self.shared.group
    }

    /// The READY transport if one exists, otherwise the delayed transport
    /// (starting a connect episode if none is running).
    pub fn obtain_active_transport(&self) -> Arc<dyn ClientTransport> {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return Arc::new(FailingClientTransport::new(Status::unavailable(
                "transport set is shut down",
            )));
        }
        if let Some((_, transport)) = &state.ready {
            return transport.clone();
        }
        SetShared::ensure_connecting(&self.shared, &mut state);
        state.delayed.clone()
    }

    /// Allows existing streams (including buffered ones) to finish;
    /// refuses new streams; keeps connecting only while buffered streams
    /// still need a transport.
    pub fn shutdown(&self) {
        let (transports, delayed, abort_connect) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let abort_connect = if !state.delayed.has_pending_streams() {
                state.connecting = false;
                state.connect_task.take()
            } else {
                None
            };
            (
                state.transports.values().cloned().collect::<Vec<_>>(),
                state.delayed.clone(),
                abort_connect,
            )
        };

        if let Some(task) = abort_connect {
            task.abort();
        }
        delayed.shutdown();
        for transport in transports {
            transport.shutdown();
        }
        self.shared.maybe_terminate();
    }

    /// Fails everything, buffered and active.
    pub fn shutdown_now(&self, status: Status) {
        let (transports, delayed, connect_task) = {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            state.connecting = false;
            (
                state.transports.values().cloned().collect::<Vec<_>>(),
                state.delayed.clone(),
                state.connect_task.take(),
            )
        };

        if let Some(task) = connect_task {
            task.abort();
        }
        delayed.shutdown_now(status.clone());
        for transport in transports {
            transport.shutdown_now(status.clone());
        }
        self.shared.maybe_terminate();
    }
}

impl SetShared {
    fn ensure_connecting(shared: &Arc<SetShared>, state: &mut SetState) {
        if state.connecting || state.shutdown {
            return;
        }
        state.connecting = true;
        let task = tokio::spawn(connect_loop(shared.clone()));
        state.connect_task = Some(task);
    }

    fn adjust_in_use(&self, delta: isize) {
        let edge = {
            let mut state = self.state.lock().unwrap();
            state.in_use_sources = (state.in_use_sources as isize + delta).max(0) as usize;
            let now_in_use = state.in_use_sources > 0;
            if now_in_use != state.set_in_use {
                state.set_in_use = now_in_use;
                Some(now_in_use)
            } else {
                None
            }
        };
        if let Some(in_use) = edge {
            self.callback.on_in_use(&self.group, in_use);
        }
    }

    fn maybe_terminate(&self) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            if !state.terminated
                && state.shutdown
                && state.transports.is_empty()
                && state.live_delayed == 0
            {
                state.terminated = true;
                true
            } else {
                false
            }
        };
        if fire {
            self.callback.on_terminated(&self.group);
        }
    }
}

/// One pass per iteration over the address list; backoff applies only
/// after a whole pass fails. Ends as soon as one connection is READY
/// (reconnection is on demand).
async fn connect_loop(shared: Arc<SetShared>) {
    let mut backoff = Backoff::new(shared.options.backoff.clone());

    loop {
        for address in shared.group.addresses.clone() {
            {
                let state = shared.state.lock().unwrap();
                if state.shutdown && !state.delayed.has_pending_streams() {
                    return;
                }
            }

            let connected = tokio::time::timeout(
                shared.options.connect_timeout,
                shared.connector.connect(address),
            )
            .await
            .unwrap_or_else(|_| {
                Err(Status::unavailable(format!(
                    "connect timeout to {}",
                    address
                )))
            });

            match connected {
                Ok(codec) => {
                    on_connected(&shared, codec);
                    backoff.reset();
                    return;
                }
                Err(status) => {
                    debug!(%address, %status, "connect attempt failed");
                }
            }
        }

        shared.callback.on_all_addresses_failed(&shared.group);

        let delay = backoff.next_delay();
        tokio::time::sleep(delay).await;

        {
            // Buffered streams keep the reconnect loop alive even after a
            // graceful shutdown; shutdown_now is what abandons them.
            let state = shared.state.lock().unwrap();
            if state.shutdown && !state.delayed.has_pending_streams() {
                return;
            }
        }
    }
}

fn on_connected(shared: &Arc<SetShared>, codec: crate::http2::codec::CodecPair) {
    let (transport, old_delayed, shutting_down) = {
        let mut state = shared.state.lock().unwrap();

        let id = state.next_transport_id;
        state.next_transport_id += 1;

        let lifecycle = Arc::new(SetTransportLifecycle {
            shared: Arc::downgrade(shared),
            transport_id: id,
        });
        let transport =
            Http2ClientTransport::spawn(codec, shared.options.http2.clone(), lifecycle);

        state.transports.insert(id, transport.clone());
        state.ready = Some((id, transport.clone()));
        state.connecting = false;
        state.connect_task = None;

        // Buffered streams drain onto the new transport; a fresh delayed
        // transport takes over buffering for the next outage.
        let old_delayed = state.delayed.clone();
        state.delayed = DelayedTransport::new(Arc::new(DelayedLifecycle {
            shared: Arc::downgrade(shared),
        }));
        state.live_delayed += 1;

        (transport, old_delayed, state.shutdown)
    };

    old_delayed.set_transport(transport.clone());
    old_delayed.shutdown();

    if shutting_down {
        // The set was shut down while we connected to serve buffered
        // streams; the connection drains them and nothing else.
        transport.shutdown();
        let mut state = shared.state.lock().unwrap();
        let delayed = state.delayed.clone();
        drop(state);
        delayed.shutdown();
    }
}

/// Lifecycle adapter for one transport, identified by id so late events
/// from an old transport never clobber a newer one.
struct SetTransportLifecycle {
    shared: Weak<SetShared>,
    transport_id: u64,
}

impl TransportLifecycle for SetTransportLifecycle {
    fn on_ready(&self) {}

    fn on_in_use(&self, in_use: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.adjust_in_use(if in_use { 1 } else { -1 });
        }
    }

    fn on_shutdown(&self, _status: &Status) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock().unwrap();
            if matches!(&state.ready, Some((id, _)) if *id == self.transport_id) {
                state.ready = None;
            }
        }
    }

    fn on_goaway(&self, code: Http2ErrorCode, status: &Status) {
        if code != Http2ErrorCode::NoError {
            if let Some(shared) = self.shared.upgrade() {
                shared
                    .callback
                    .on_connection_closed_by_server(&shared.group, status);
            }
        }
    }

    fn on_terminated(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let reconnect = {
                let mut state = shared.state.lock().unwrap();
                state.transports.remove(&self.transport_id);
                if matches!(&state.ready, Some((id, _)) if *id == self.transport_id) {
                    state.ready = None;
                }
                !state.shutdown && state.delayed.has_pending_streams()
            };
            if reconnect {
                let mut state = shared.state.lock().unwrap();
                SetShared::ensure_connecting(&shared, &mut state);
            }
            shared.maybe_terminate();
        }
    }
}

struct DelayedLifecycle {
    shared: Weak<SetShared>,
}

impl TransportLifecycle for DelayedLifecycle {
    fn on_ready(&self) {}

    fn on_in_use(&self, in_use: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.adjust_in_use(if in_use { 1 } else { -1 });
        }
    }

    fn on_shutdown(&self, _status: &Status) {}

    fn on_terminated(&self) {
        if let Some(shared) = self.shared.upgrade() {
            {
                let mut state = shared.state.lock().unwrap();
                state.live_delayed = state.live_delayed.saturating_sub(1);
            }
            shared.maybe_terminate();
        }
    }
}
