use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::debug;
use url::Url;

use crate::status::Status;
use crate::transport::AddressGroup;

/// Receives asynchronous updates from a name resolver.
pub trait ResolverListener: Send + Sync {
    fn on_addresses(&self, groups: Vec<AddressGroup>);
    fn on_error(&self, status: Status);
}

/// Tracks the addresses behind one target. Results are pushed to the
/// listener; refresh() asks for a new resolution pass (e.g. after all
/// addresses failed).
pub trait NameResolver: Send + Sync {
    /// Authority calls on this channel advertise by default.
    fn authority(&self) -> String;

    fn start(&self, listener: Arc<dyn ResolverListener>);

    fn refresh(&self);

    fn shutdown(&self);
}

pub trait NameResolverFactory: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn create(&self, target: &Url) -> Result<Arc<dyn NameResolver>, Status>;
}

impl std::fmt::Debug for dyn NameResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameResolver")
            .field("authority", &self.authority())
            .finish()
    }
}

/// Scheme-keyed resolver factories.
///
/// A target is first parsed as a URI. If no factory claims its scheme (or
/// it doesn't parse as a URI at all), the default scheme is prepended and
/// the original string becomes the authority.
pub struct ResolverRegistry {
    factories: Vec<Arc<dyn NameResolverFactory>>,
}

impl ResolverRegistry {
    pub fn new(factories: Vec<Arc<dyn NameResolverFactory>>) -> Arc<Self> {
        Arc::new(Self { factories })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(vec![
            Arc::new(DnsResolverFactory),
            Arc::new(StaticResolverFactory),
        ])
    }

    pub fn default_scheme(&self) -> &'static str {
        self.factories.first().map(|f| f.scheme()).unwrap_or("dns")
    }

    fn factory_for(&self, scheme: &str) -> Option<&Arc<dyn NameResolverFactory>> {
        self.factories.iter().find(|f| f.scheme() == scheme)
    }

    pub fn create_for_target(&self, target: &str) -> Result<Arc<dyn NameResolver>, Status> {
        if let Ok(url) = Url::parse(target) {
            if let Some(factory) = self.factory_for(url.scheme()) {
                return factory.create(&url);
            }
        }

        // Not a URI any factory understands: treat the whole string as an
        // authority under the default scheme.
        let fallback = format!("{}://{}", self.default_scheme(), target);
        let url = Url::parse(&fallback).map_err(|e| {
            Status::invalid_argument(format!("invalid channel target {:?}: {}", target, e))
        })?;
        match self.factory_for(url.scheme()) {
            Some(factory) => factory.create(&url),
            None => Err(Status::invalid_argument(format!(
                "no name resolver for target {:?}",
                target
            ))),
        }
    }
}

const DEFAULT_PORT: u16 = 443;

struct DnsResolverState {
    listener: Option<Arc<dyn ResolverListener>>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown: bool,
}

/// Resolver using the system's host lookup through tokio.
pub struct DnsResolver {
    host: String,
    port: u16,
    state: Mutex<DnsResolverState>,
}

impl DnsResolver {
    pub fn new(host: String, port: u16) -> Arc<Self> {
        Arc::new(Self {
            host,
            port,
            state: Mutex::new(DnsResolverState {
                listener: None,
                task: None,
                shutdown: false,
            }),
        })
    }

    fn resolve(&self) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        let listener = match &state.listener {
            Some(listener) => listener.clone(),
            None => return,
        };

        let host = self.host.clone();
        let port = self.port;
        state.task = Some(tokio::spawn(async move {
            match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addresses) => {
                    let groups: Vec<AddressGroup> =
                        addresses.map(AddressGroup::single).collect();
                    if groups.is_empty() {
                        listener.on_error(Status::unavailable(format!(
                            "no addresses for {}",
                            host
                        )));
                    } else {
                        listener.on_addresses(groups);
                    }
                }
                Err(e) => {
                    debug!(host = %host, error = %e, "DNS resolution failed");
                    listener.on_error(
                        Status::unavailable(format!("failed to resolve {}", host))
                            .with_cause(e),
                    );
                }
            }
        }));
    }
}

impl NameResolver for DnsResolver {
    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn start(&self, listener: Arc<dyn ResolverListener>) {
        self.state.lock().unwrap().listener = Some(listener);
        self.resolve();
    }

    fn refresh(&self) {
        self.resolve();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }
}

pub struct DnsResolverFactory;

impl NameResolverFactory for DnsResolverFactory {
    fn scheme(&self) -> &'static str {
        "dns"
    }

    fn create(&self, target: &Url) -> Result<Arc<dyn NameResolver>, Status> {
        let host = target
            .host_str()
            .ok_or_else(|| {
                Status::invalid_argument(format!("dns target missing host: {}", target))
            })?
            .to_string();
        let port = target.port().unwrap_or(DEFAULT_PORT);
        Ok(DnsResolver::new(host, port))
    }
}

/// Resolver over a fixed comma-separated list of socket addresses, e.g.
/// 'static:10.0.0.1:50051,10.0.0.2:50051'. No I/O; useful for tests and
/// point-to-point channels.
pub struct StaticResolver {
    groups: Vec<AddressGroup>,
    authority: String,
}

impl NameResolver for StaticResolver {
    fn authority(&self) -> String {
        self.authority.clone()
    }

    fn start(&self, listener: Arc<dyn ResolverListener>) {
        listener.on_addresses(self.groups.clone());
    }

    fn refresh(&self) {}

    fn shutdown(&self) {}
}

pub struct StaticResolverFactory;

impl NameResolverFactory for StaticResolverFactory {
    fn scheme(&self) -> &'static str {
        "static"
    }

    fn create(&self, target: &Url) -> Result<Arc<dyn NameResolver>, Status> {
        let list = target.path().trim_start_matches('/');
        let list = if list.is_empty() {
            // 'static://host:port' form puts the list in the authority.
            target.authority().to_string()
        } else {
            list.to_string()
        };

        let mut addresses = Vec::new();
        for part in list.split(',') {
            let address: SocketAddr = part.parse().map_err(|_| {
                Status::invalid_argument(format!(
                    "invalid socket address in static target: {:?}",
                    part
                ))
            })?;
            addresses.push(address);
        }
        if addresses.is_empty() {
            return Err(Status::invalid_argument("empty static target"));
        }

        let authority = addresses[0].to_string();
        Ok(Arc::new(StaticResolver {
            groups: vec![AddressGroup::new(addresses)],
            authority,
        }))
    }
}
