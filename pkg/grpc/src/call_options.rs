use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::exec::Executor;
use crate::metadata::Metadata;

/// Typed key for a custom call option or attribute. The key instance
/// carries the default returned when the option was never set.
pub struct OptionKey<T> {
    id: u64,
    name: &'static str,
    default: Option<Arc<T>>,
    _type: PhantomData<fn(T) -> T>,
}

static NEXT_OPTION_ID: AtomicU64 = AtomicU64::new(1);

impl<T: Send + Sync + 'static> OptionKey<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_OPTION_ID.fetch_add(1, Ordering::Relaxed),
            name,
            default: None,
            _type: PhantomData,
        }
    }

    pub fn with_default(name: &'static str, default: T) -> Self {
        Self {
            id: NEXT_OPTION_ID.fetch_add(1, Ordering::Relaxed),
            name,
            default: Some(Arc::new(default)),
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Immutable bag of typed values, shared by cheap clone.
#[derive(Clone, Default)]
pub struct Attributes {
    entries: Arc<Vec<(u64, Arc<dyn Any + Send + Sync>)>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Send + Sync + 'static>(&self, key: &OptionKey<T>, value: T) -> Self {
        let mut entries: Vec<_> = (*self.entries).clone();
        entries.retain(|(id, _)| *id != key.id);
        entries.push((key.id, Arc::new(value) as Arc<dyn Any + Send + Sync>));
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &OptionKey<T>) -> Option<Arc<T>> {
        self.entries
            .iter()
            .find(|(id, _)| *id == key.id)
            .and_then(|(_, v)| v.clone().downcast::<T>().ok())
            .or_else(|| key.default.clone())
    }
}

/// Extra per-call credentials applied as request metadata at call start.
pub trait CallCredentials: Send + Sync {
    fn request_metadata(&self, method: &str, authority: &str) -> Result<Metadata, crate::status::Status>;
}

/// Per-call configuration.
///
/// Every with_*() returns a modified copy; a CallOptions value handed to a
/// call can therefore be reused for other calls without aliasing effects.
#[derive(Clone, Default)]
pub struct CallOptions {
    deadline: Option<Deadline>,
    authority: Option<String>,
    compressor: Option<String>,
    wait_for_ready: bool,
    executor: Option<Arc<dyn Executor>>,
    credentials: Option<Arc<dyn CallCredentials>>,
    affinity: Attributes,
    custom: Attributes,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(&self, deadline: Deadline) -> Self {
        let mut o = self.clone();
        o.deadline = Some(deadline);
        o
    }

    pub fn with_authority<S: Into<String>>(&self, authority: S) -> Self {
        let mut o = self.clone();
        o.authority = Some(authority.into());
        o
    }

    pub fn with_compressor<S: Into<String>>(&self, compressor: S) -> Self {
        let mut o = self.clone();
        o.compressor = Some(compressor.into());
        o
    }

    /// Calls with wait_for_ready queue on a transport that is still being
    /// established instead of failing fast on transient unavailability.
    pub fn with_wait_for_ready(&self, wait_for_ready: bool) -> Self {
        let mut o = self.clone();
        o.wait_for_ready = wait_for_ready;
        o
    }

    pub fn with_executor(&self, executor: Arc<dyn Executor>) -> Self {
        let mut o = self.clone();
        o.executor = Some(executor);
        o
    }

    pub fn with_credentials(&self, credentials: Arc<dyn CallCredentials>) -> Self {
        let mut o = self.clone();
        o.credentials = Some(credentials);
        o
    }

    pub fn with_affinity<T: Send + Sync + 'static>(&self, key: &OptionKey<T>, value: T) -> Self {
        let mut o = self.clone();
        o.affinity = o.affinity.with(key, value);
        o
    }

    pub fn with_option<T: Send + Sync + 'static>(&self, key: &OptionKey<T>, value: T) -> Self {
        let mut o = self.clone();
        o.custom = o.custom.with(key, value);
        o
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn compressor(&self) -> Option<&str> {
        self.compressor.as_deref()
    }

    pub fn wait_for_ready(&self) -> bool {
        self.wait_for_ready
    }

    pub fn executor(&self) -> Option<&Arc<dyn Executor>> {
        self.executor.as_ref()
    }

    pub fn credentials(&self) -> Option<&Arc<dyn CallCredentials>> {
        self.credentials.as_ref()
    }

    pub fn affinity<T: Send + Sync + 'static>(&self, key: &OptionKey<T>) -> Option<Arc<T>> {
        self.affinity.get(key)
    }

    pub fn option<T: Send + Sync + 'static>(&self, key: &OptionKey<T>) -> Option<Arc<T>> {
        self.custom.get(key)
    }
}
