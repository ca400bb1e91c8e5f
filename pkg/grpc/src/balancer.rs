use std::sync::{Arc, Mutex};

use crate::status::Status;
use crate::transport::delayed::DelayedTransport;
use crate::transport::{AddressGroup, ClientTransport, FailingClientTransport};

/// Channel-side services available to a load balancer. The balancer never
/// touches TransportSets directly; it asks for transports by address
/// group.
pub trait TransportManager: Send + Sync {
    /// Active transport of the set owning the group (the set is created on
    /// first use).
    fn get_transport(&self, group: &AddressGroup) -> Arc<dyn ClientTransport>;

    /// A delayed transport registered with the channel for in-use and
    /// termination tracking. Used to park calls that arrive before the
    /// balancer has addresses.
    fn create_interim_transport(&self) -> Arc<DelayedTransport>;
}

/// Picks a transport for each new call and absorbs name resolution
/// updates.
pub trait LoadBalancer: Send + Sync {
    fn pick_transport(&self, wait_for_ready: bool) -> Arc<dyn ClientTransport>;
    fn handle_resolved_addresses(&self, groups: Vec<AddressGroup>);
    fn handle_name_resolution_error(&self, status: Status);
    fn shutdown(&self);
}

pub trait LoadBalancerFactory: Send + Sync {
    fn create(&self, manager: Arc<dyn TransportManager>) -> Arc<dyn LoadBalancer>;
}

struct PickFirstState {
    /// All resolved addresses flattened into one group: pick-first treats
    /// the whole list as one logical backend and walks it in order.
    addresses: Option<AddressGroup>,
    resolution_error: Option<Status>,
    interim: Option<Arc<DelayedTransport>>,
    closed: bool,
}

/// Default balancer: directs every call at a single TransportSet holding
/// the full resolved address list.
pub struct PickFirstBalancer {
    manager: Arc<dyn TransportManager>,
    state: Mutex<PickFirstState>,
}

impl PickFirstBalancer {
    pub fn new(manager: Arc<dyn TransportManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            state: Mutex::new(PickFirstState {
                addresses: None,
                resolution_error: None,
                interim: None,
                closed: false,
            }),
        })
    }
}

pub struct PickFirstBalancerFactory;

impl LoadBalancerFactory for PickFirstBalancerFactory {
    fn create(&self, manager: Arc<dyn TransportManager>) -> Arc<dyn LoadBalancer> {
        PickFirstBalancer::new(manager)
    }
}

impl LoadBalancer for PickFirstBalancer {
    fn pick_transport(&self, wait_for_ready: bool) -> Arc<dyn ClientTransport> {
        enum Pick {
            Group(AddressGroup),
            Fail(Status),
            Interim(Arc<DelayedTransport>),
        }

        let pick = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                Pick::Fail(Status::unavailable("load balancer is shut down"))
            } else if let Some(group) = &state.addresses {
                Pick::Group(group.clone())
            } else if let Some(error) = &state.resolution_error {
                if wait_for_ready {
                    Pick::Interim(interim(&mut state, &self.manager))
                } else {
                    Pick::Fail(
                        Status::unavailable("name resolution failed").with_cause(error.clone()),
                    )
                }
            } else {
                // Still waiting for the first resolution pass.
                Pick::Interim(interim(&mut state, &self.manager))
            }
        };

        match pick {
            // The manager may take the channel lock; called outside ours.
            Pick::Group(group) => self.manager.get_transport(&group),
            Pick::Fail(status) => Arc::new(FailingClientTransport::new(status)),
            Pick::Interim(interim) => interim,
        }
    }

    fn handle_resolved_addresses(&self, groups: Vec<AddressGroup>) {
        let flattened = AddressGroup::new(
            groups
                .into_iter()
                .flat_map(|g| g.addresses.into_iter())
                .collect(),
        );
        if flattened.addresses.is_empty() {
            self.handle_name_resolution_error(Status::unavailable(
                "name resolver returned no addresses",
            ));
            return;
        }

        let interim = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.addresses = Some(flattened.clone());
            state.resolution_error = None;
            state.interim.take()
        };

        if let Some(interim) = interim {
            let transport = self.manager.get_transport(&flattened);
            interim.set_transport(transport);
            interim.shutdown();
        }
    }

    fn handle_name_resolution_error(&self, status: Status) {
        let interim = {
            let mut state = self.state.lock().unwrap();
            if state.closed || state.addresses.is_some() {
                // A previously good address list keeps serving; transient
                // refresh failures don't tear calls down.
                return;
            }
            state.resolution_error = Some(status.clone());
            state.interim.take()
        };

        if let Some(interim) = interim {
            interim.shutdown_now(
                Status::unavailable("name resolution failed").with_cause(status),
            );
        }
    }

    fn shutdown(&self) {
        let interim = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.interim.take()
        };
        if let Some(interim) = interim {
            interim.shutdown_now(Status::unavailable("load balancer is shut down"));
        }
    }
}

fn interim(
    state: &mut PickFirstState,
    manager: &Arc<dyn TransportManager>,
) -> Arc<DelayedTransport> {
    if let Some(interim) = &state.interim {
        return interim.clone();
    }
    let interim = manager.create_interim_transport();
    state.interim = Some(interim.clone());
    interim
}
