//! The managed channel: call entry point owning name resolution, load
//! balancing, transport pools, idle mode, and shutdown orchestration.

pub mod call;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::balancer::{
    LoadBalancer, LoadBalancerFactory, PickFirstBalancerFactory, TransportManager,
};
use crate::call_options::CallOptions;
use crate::channel::call::{ClientCall, ClientTransportProvider};
use crate::resolver::{NameResolver, ResolverListener, ResolverRegistry};
use crate::status::Status;
use crate::transport::delayed::DelayedTransport;
use crate::transport::set::{TransportSet, TransportSetCallback, TransportSetOptions};
use crate::transport::{
    AddressGroup, ClientTransport, Connector, FailingClientTransport, TransportLifecycle,
};

#[derive(Clone)]
pub struct ChannelOptions {
    /// Application user agent, prefixed to the library's own.
    pub user_agent: Option<String>,

    /// Idle timeout: with no in-use transports for this long, the channel
    /// drops its balancer and resolver until the next call. None disables
    /// idle mode.
    pub idle_timeout: Option<Duration>,

    pub transport: TransportSetOptions,

    pub resolvers: Arc<ResolverRegistry>,

    pub balancer_factory: Arc<dyn LoadBalancerFactory>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            user_agent: None,
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            transport: TransportSetOptions::default(),
            resolvers: ResolverRegistry::with_defaults(),
            balancer_factory: Arc::new(PickFirstBalancerFactory),
        }
    }
}

struct ChannelState {
    shutdown: bool,
    terminated: bool,
    /// None while the channel is in idle mode.
    balancer: Option<Arc<dyn LoadBalancer>>,
    resolver: Option<Arc<dyn NameResolver>>,
    /// Every live TransportSet by id. Sets indexed in by_group serve new
    /// calls; the rest are decommissioned (idle-mode leftovers draining
    /// their existing streams).
    all_sets: HashMap<u64, Arc<TransportSet>>,
    by_group: HashMap<AddressGroup, u64>,
    /// Interim (delayed) transports created for the balancer.
    delayed: HashMap<u64, Arc<DelayedTransport>>,
    next_id: u64,
    /// How many owned objects currently report in-use.
    in_use_sources: usize,
    /// Bumped to invalidate a pending idle timer; the timer task compares
    /// generations before entering idle.
    idle_generation: u64,
    idle_timer: Option<tokio::task::JoinHandle<()>>,
}

struct ChannelInner {
    target: String,
    authority: String,
    connector: Arc<dyn Connector>,
    options: ChannelOptions,
    lock: Mutex<ChannelState>,
    terminated_notify: Notify,
}

/// Client-side entry point for calls on one target.
///
/// Cheap to clone. The channel oscillates between IDLE (no balancer) and
/// ACTIVE while alive; shutdown() starts the walk towards TERMINATED.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl Channel {
    /// Builds a channel for the target. Fails only if no name resolver
    /// accepts the target.
    pub fn new(
        target: &str,
        connector: Arc<dyn Connector>,
        options: ChannelOptions,
    ) -> Result<Channel, Status> {
        // Resolve the factory eagerly so a bad target fails here, not on
        // the first call. The instance is kept for the first idle exit.
        let resolver = options.resolvers.create_for_target(target)?;
        let authority = resolver.authority();

        Ok(Channel {
            inner: Arc::new(ChannelInner {
                target: target.to_string(),
                authority,
                connector,
                options,
                lock: Mutex::new(ChannelState {
                    shutdown: false,
                    terminated: false,
                    balancer: None,
                    resolver: Some(resolver),
                    all_sets: HashMap::new(),
                    by_group: HashMap::new(),
                    delayed: HashMap::new(),
                    next_id: 0,
                    in_use_sources: 0,
                    idle_generation: 0,
                    idle_timer: None,
                }),
                terminated_notify: Notify::new(),
            }),
        })
    }

    /// Creates (but does not start) a call. Never blocks and never fails;
    /// on a shut-down channel the call fails at start with UNAVAILABLE.
    pub fn new_call(&self, method: &str, options: CallOptions) -> ClientCall {
        ChannelInner::exit_idle(&self.inner);
        ClientCall::new(
            Arc::new(ProviderHandle(self.inner.clone())),
            method.to_string(),
            options,
        )
    }

    /// Starts a graceful shutdown: existing calls complete, new transports
    /// are refused. Idempotent, returns immediately.
    pub fn shutdown(&self) {
        let (timer, balancer, resolver, sets, delayed) = {
            let mut state = self.inner.lock.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.idle_generation += 1;
            (
                state.idle_timer.take(),
                state.balancer.take(),
                state.resolver.take(),
                state.all_sets.values().cloned().collect::<Vec<_>>(),
                state.delayed.values().cloned().collect::<Vec<_>>(),
            )
        };

        // Slow work happens after the lock is released.
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(balancer) = balancer {
            balancer.shutdown();
        }
        if let Some(resolver) = resolver {
            resolver.shutdown();
        }
        for set in sets {
            set.shutdown();
        }
        for delayed in delayed {
            delayed.shutdown();
        }
        self.inner.maybe_terminate();
    }

    /// shutdown() plus failing all delayed and active transports.
    pub fn shutdown_now(&self) {
        self.shutdown();
        let status = Status::unavailable("Channel shutdownNow invoked");

        let (sets, delayed) = {
            let state = self.inner.lock.lock().unwrap();
            (
                state.all_sets.values().cloned().collect::<Vec<_>>(),
                state.delayed.values().cloned().collect::<Vec<_>>(),
            )
        };
        for set in sets {
            set.shutdown_now(status.clone());
        }
        for delayed in delayed {
            delayed.shutdown_now(status.clone());
        }
        self.inner.maybe_terminate();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock.lock().unwrap().shutdown
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock.lock().unwrap().terminated
    }

    /// Blocks the caller until the channel is TERMINATED or the timeout
    /// elapses. Returns whether termination was reached.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.terminated_notify.notified();
                if self.is_terminated() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    pub fn authority(&self) -> &str {
        &self.inner.authority
    }
}

impl ChannelInner {
    /// Builds the balancer and starts a resolver if the channel is idle.
    fn exit_idle(inner: &Arc<ChannelInner>) {
        let start = {
            let mut state = inner.lock.lock().unwrap();
            if state.shutdown || state.balancer.is_some() {
                None
            } else {
                let manager: Arc<dyn TransportManager> = Arc::new(ManagerHandle {
                    channel: Arc::downgrade(inner),
                });
                let balancer = inner.options.balancer_factory.create(manager);
                state.balancer = Some(balancer.clone());

                // The first exit reuses the constructor-validated resolver;
                // later exits get a fresh instance.
                let resolver = match state.resolver.take() {
                    Some(resolver) => Ok(resolver),
                    None => inner.options.resolvers.create_for_target(&inner.target),
                };
                if let Ok(resolver) = &resolver {
                    state.resolver = Some(resolver.clone());
                }

                // A channel that exits idle with nothing in use starts its
                // idle clock immediately.
                if state.in_use_sources == 0 {
                    ChannelInner::arm_idle_timer_locked(inner, &mut state);
                }

                Some((balancer, resolver))
            }
        };

        if let Some((balancer, resolver)) = start {
            match resolver {
                Ok(resolver) => {
                    resolver.start(Arc::new(BalancerResolverListener {
                        balancer: balancer.clone(),
                    }));
                }
                Err(status) => {
                    balancer.handle_name_resolution_error(status);
                }
            }
        }
    }

    fn arm_idle_timer_locked(inner: &Arc<ChannelInner>, state: &mut ChannelState) {
        let timeout = match inner.options.idle_timeout {
            Some(timeout) => timeout,
            None => return,
        };
        if state.shutdown || state.balancer.is_none() {
            return;
        }
        state.idle_generation += 1;
        let generation = state.idle_generation;
        let weak = Arc::downgrade(inner);
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                ChannelInner::enter_idle(&inner, generation);
            }
        }));
    }

    /// Timer-driven entry into idle mode. The generation check resolves
    /// the race between the timer firing and new use.
    fn enter_idle(inner: &Arc<ChannelInner>, generation: u64) {
        let teardown = {
            let mut state = inner.lock.lock().unwrap();
            if state.idle_generation != generation
                || state.shutdown
                || state.in_use_sources > 0
                || state.balancer.is_none()
            {
                None
            } else {
                debug!(target = %inner.target, "channel entering idle mode");
                state.idle_timer = None;
                let balancer = state.balancer.take();
                let resolver = state.resolver.take();
                // Active sets become decommissioned: they keep serving
                // whatever they still have but no longer serve new calls.
                let ids: Vec<u64> = state.by_group.drain().map(|(_, id)| id).collect();
                let decommissioned: Vec<Arc<TransportSet>> = ids
                    .into_iter()
                    .filter_map(|id| state.all_sets.get(&id).cloned())
                    .collect();
                Some((balancer, resolver, decommissioned))
            }
        };

        if let Some((balancer, resolver, decommissioned)) = teardown {
            if let Some(balancer) = balancer {
                balancer.shutdown();
            }
            if let Some(resolver) = resolver {
                resolver.shutdown();
            }
            for set in decommissioned {
                set.shutdown();
            }
        }
    }

    /// Edge-triggered in-use accounting: 0 -> 1 cancels the idle timer
    /// and wakes the channel; 1 -> 0 starts the idle clock.
    fn adjust_in_use(inner: &Arc<ChannelInner>, delta: isize) {
        enum Effect {
            None,
            BecameActive(Option<tokio::task::JoinHandle<()>>),
        }

        let effect = {
            let mut state = inner.lock.lock().unwrap();
            let was = state.in_use_sources;
            state.in_use_sources = (was as isize + delta).max(0) as usize;

            if was == 0 && state.in_use_sources > 0 {
                state.idle_generation += 1;
                Effect::BecameActive(state.idle_timer.take())
            } else if was > 0 && state.in_use_sources == 0 {
                ChannelInner::arm_idle_timer_locked(inner, &mut state);
                Effect::None
            } else {
                Effect::None
            }
        };

        if let Effect::BecameActive(timer) = effect {
            if let Some(timer) = timer {
                timer.abort();
            }
            ChannelInner::exit_idle(inner);
        }
    }

    fn refresh_resolver(&self) {
        let resolver = self.lock.lock().unwrap().resolver.clone();
        if let Some(resolver) = resolver {
            resolver.refresh();
        }
    }

    /// TERMINATED iff shut down and every owned object is gone.
    fn maybe_terminate(&self) {
        let fire = {
            let mut state = self.lock.lock().unwrap();
            if !state.terminated
                && state.shutdown
                && state.all_sets.is_empty()
                && state.delayed.is_empty()
            {
                state.terminated = true;
                true
            } else {
                false
            }
        };
        if fire {
            self.terminated_notify.notify_waiters();
        }
    }

    fn pick_transport(inner: &Arc<ChannelInner>, wait_for_ready: bool) -> Arc<dyn ClientTransport> {
        ChannelInner::exit_idle(inner);
        let balancer = {
            let state = inner.lock.lock().unwrap();
            if state.shutdown {
                None
            } else {
                state.balancer.clone()
            }
        };
        match balancer {
            Some(balancer) => balancer.pick_transport(wait_for_ready),
            None => Arc::new(FailingClientTransport::new(Status::unavailable(
                "Channel is shutdown",
            ))),
        }
    }
}

/// The call-facing view of the channel.
struct ProviderHandle(Arc<ChannelInner>);

impl ClientTransportProvider for ProviderHandle {
    fn pick_transport(&self, wait_for_ready: bool) -> Arc<dyn ClientTransport> {
        ChannelInner::pick_transport(&self.0, wait_for_ready)
    }

    fn default_authority(&self) -> String {
        self.0.authority.clone()
    }

    fn user_agent_prefix(&self) -> Option<String> {
        self.0.options.user_agent.clone()
    }
}

/// The balancer-facing view of the channel.
struct ManagerHandle {
    channel: Weak<ChannelInner>,
}

impl TransportManager for ManagerHandle {
    fn get_transport(&self, group: &AddressGroup) -> Arc<dyn ClientTransport> {
        let inner = match self.channel.upgrade() {
            Some(inner) => inner,
            None => {
                return Arc::new(FailingClientTransport::new(Status::unavailable(
                    "Channel was dropped",
                )))
            }
        };

        let set = {
            let mut state = inner.lock.lock().unwrap();
            if state.shutdown {
                return Arc::new(FailingClientTransport::new(Status::unavailable(
                    "Channel is shutdown",
                )));
            }
            match state.by_group.get(group) {
                Some(id) => state.all_sets[id].clone(),
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    let set = TransportSet::new(
                        group.clone(),
                        inner.connector.clone(),
                        Arc::new(SetCallbackHandle {
                            channel: self.channel.clone(),
                            set_id: id,
                        }),
                        inner.options.transport.clone(),
                    );
                    state.all_sets.insert(id, set.clone());
                    state.by_group.insert(group.clone(), id);
                    set
                }
            }
        };

        set.obtain_active_transport()
    }

    fn create_interim_transport(&self) -> Arc<DelayedTransport> {
        let inner = match self.channel.upgrade() {
            Some(inner) => inner,
            None => return DelayedTransport::new(Arc::new(crate::transport::NullLifecycle)),
        };

        let mut state = inner.lock.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let delayed = DelayedTransport::new(Arc::new(DelayedLifecycleHandle {
            channel: self.channel.clone(),
            delayed_id: id,
        }));
        state.delayed.insert(id, delayed.clone());
        delayed
    }
}

/// TransportSet events routed back to the channel by set id, never by
/// pointer.
struct SetCallbackHandle {
    channel: Weak<ChannelInner>,
    set_id: u64,
}

impl TransportSetCallback for SetCallbackHandle {
    fn on_in_use(&self, _group: &AddressGroup, in_use: bool) {
        if let Some(inner) = self.channel.upgrade() {
            ChannelInner::adjust_in_use(&inner, if in_use { 1 } else { -1 });
        }
    }

    fn on_all_addresses_failed(&self, group: &AddressGroup) {
        if let Some(inner) = self.channel.upgrade() {
            debug!(?group, "all addresses failed; refreshing name resolution");
            inner.refresh_resolver();
        }
    }

    fn on_connection_closed_by_server(&self, group: &AddressGroup, status: &Status) {
        if let Some(inner) = self.channel.upgrade() {
            debug!(?group, %status, "connection closed by server; refreshing name resolution");
            inner.refresh_resolver();
        }
    }

    fn on_terminated(&self, group: &AddressGroup) {
        if let Some(inner) = self.channel.upgrade() {
            {
                let mut state = inner.lock.lock().unwrap();
                state.all_sets.remove(&self.set_id);
                if state.by_group.get(group) == Some(&self.set_id) {
                    state.by_group.remove(group);
                }
            }
            inner.maybe_terminate();
        }
    }
}

struct DelayedLifecycleHandle {
    channel: Weak<ChannelInner>,
    delayed_id: u64,
}

impl TransportLifecycle for DelayedLifecycleHandle {
    fn on_ready(&self) {}

    fn on_in_use(&self, in_use: bool) {
        if let Some(inner) = self.channel.upgrade() {
            ChannelInner::adjust_in_use(&inner, if in_use { 1 } else { -1 });
        }
    }

    fn on_shutdown(&self, _status: &Status) {}

    fn on_terminated(&self) {
        if let Some(inner) = self.channel.upgrade() {
            {
                let mut state = inner.lock.lock().unwrap();
                state.delayed.remove(&self.delayed_id);
            }
            inner.maybe_terminate();
        }
    }
}

/// Feeds resolver updates to the balancer the channel owned when the
/// resolver was started.
struct BalancerResolverListener {
    balancer: Arc<dyn LoadBalancer>,
}

impl ResolverListener for BalancerResolverListener {
    fn on_addresses(&self, groups: Vec<AddressGroup>) {
        self.balancer.handle_resolved_addresses(groups);
    }

    fn on_error(&self, status: Status) {
        self.balancer.handle_name_resolution_error(status);
    }
}
