use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::Notify;

use crate::deadline::{min_deadline, Deadline};
use crate::status::{Code, Status};

/// Typed key for a context value. Each key instance is distinct; two keys
/// created with the same name never alias.
pub struct ContextKey<T> {
    id: u64,
    name: &'static str,
    _type: PhantomData<fn(T) -> T>,
}

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

impl<T: Send + Sync + 'static> ContextKey<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

type CancelListener = Box<dyn FnOnce(&Status) + Send>;

struct CancelInner {
    cancelled: Option<Status>,
    listeners: Vec<CancelListener>,
    deadline_timer: Option<tokio::task::JoinHandle<()>>,
}

/// Shared cancellation flag for one cancellable node of the context tree.
/// Non-cancellable children (with_value) share their parent's state.
struct CancelState {
    inner: Mutex<CancelInner>,
    notify: Notify,
}

impl CancelState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CancelInner {
                cancelled: None,
                listeners: Vec::new(),
                deadline_timer: None,
            }),
            notify: Notify::new(),
        })
    }

    /// First cancellation wins. Listeners run outside the lock, after the
    /// flag is visible.
    fn cancel(&self, status: Status) -> bool {
        let (listeners, timer) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelled.is_some() {
                return false;
            }
            inner.cancelled = Some(status.clone());
            (
                std::mem::take(&mut inner.listeners),
                inner.deadline_timer.take(),
            )
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        self.notify.notify_waiters();
        for listener in listeners {
            listener(&status);
        }
        true
    }

}

struct ContextNode {
    parent: Option<Arc<ContextNode>>,
    value: Option<(u64, Arc<dyn Any + Send + Sync>)>,
    deadline: Option<Deadline>,
    cancel: Arc<CancelState>,
    cancellable: bool,
}

impl Drop for CancelState {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.get_mut().unwrap().deadline_timer.take() {
            timer.abort();
        }
    }
}

/// A node in the cancellation tree that accompanies every call.
///
/// A context carries an optional deadline, typed values, and a cancellation
/// flag. Children created with with_cancellation()/with_deadline() get
/// their own flag that is also tripped when any ancestor's flag trips.
/// Children created with with_value() share the parent's flag.
///
/// Cloning is cheap (Arc bump); all clones observe the same cancellation.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextNode>,
}

thread_local! {
    static ATTACHED: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

impl Context {
    /// The never-cancelled root of the tree.
    pub fn root() -> Context {
        static ROOT: OnceLock<Arc<ContextNode>> = OnceLock::new();
        Context {
            inner: ROOT
                .get_or_init(|| {
                    Arc::new(ContextNode {
                        parent: None,
                        value: None,
                        deadline: None,
                        cancel: CancelState::new(),
                        cancellable: false,
                    })
                })
                .clone(),
        }
    }

    /// The context attached to the current thread, or the root.
    pub fn current() -> Context {
        ATTACHED
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_else(Context::root)
    }

    /// Runs 'f' with this context attached as Context::current().
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        ATTACHED.with(|stack| stack.borrow_mut().push(self.clone()));
        // Pop on unwind too, so a panicking callback doesn't leave the
        // thread with a stale attachment.
        struct Detach;
        impl Drop for Detach {
            fn drop(&mut self) {
                ATTACHED.with(|stack| {
                    stack.borrow_mut().pop();
                });
            }
        }
        let _detach = Detach;
        f()
    }

    pub fn with_value<T: Send + Sync + 'static>(&self, key: &ContextKey<T>, value: T) -> Context {
        Context {
            inner: Arc::new(ContextNode {
                parent: Some(self.inner.clone()),
                value: Some((key.id, Arc::new(value))),
                deadline: self.inner.deadline,
                cancel: self.inner.cancel.clone(),
                cancellable: self.inner.cancellable,
            }),
        }
    }

    pub fn value<T: Send + Sync + 'static>(&self, key: &ContextKey<T>) -> Option<Arc<T>> {
        let mut node = Some(&self.inner);
        while let Some(n) = node {
            if let Some((id, value)) = &n.value {
                if *id == key.id {
                    return value.clone().downcast::<T>().ok();
                }
            }
            node = n.parent.as_ref();
        }
        None
    }

    /// Child with its own cancellation flag, additionally tripped by this
    /// context's cancellation.
    pub fn with_cancellation(&self) -> Context {
        self.new_cancellable_child(self.inner.deadline)
    }

    /// Child cancelled with DEADLINE_EXCEEDED when the deadline expires.
    ///
    /// The effective deadline never extends an inherited one: the earlier
    /// of the two wins. Must be called from within a tokio runtime (a
    /// timer is installed).
    pub fn with_deadline(&self, deadline: Deadline) -> Context {
        let effective = min_deadline(self.inner.deadline, Some(deadline))
            .unwrap_or(deadline);

        let child = self.new_cancellable_child(Some(effective));

        let weak: Weak<CancelState> = Arc::downgrade(&child.inner.cancel);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(effective.instant()).await;
            if let Some(state) = weak.upgrade() {
                state.cancel(
                    Status::new(Code::DeadlineExceeded).with_message("context deadline exceeded"),
                );
            }
        });

        child.inner.cancel.inner.lock().unwrap().deadline_timer = Some(timer);
        child
    }

    fn new_cancellable_child(&self, deadline: Option<Deadline>) -> Context {
        let cancel = CancelState::new();

        // Parent cancellation propagates down. The listener holds a strong
        // reference to the child state; it is consumed when the parent
        // fires.
        let child_state = cancel.clone();
        self.add_cancellation_listener(move |status| {
            child_state.cancel(status.clone());
        });

        Context {
            inner: Arc::new(ContextNode {
                parent: Some(self.inner.clone()),
                value: None,
                deadline,
                cancel,
                cancellable: true,
            }),
        }
    }

    /// Cancels this context and all descendants. Returns false if this
    /// context is not cancellable (root or a plain value child shares its
    /// parent's flag and cannot cancel it) or was already cancelled.
    pub fn cancel(&self, status: Status) -> bool {
        if !self.inner.cancellable {
            return false;
        }
        self.inner.cancel.cancel(status)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.inner.lock().unwrap().cancelled.is_some()
    }

    pub fn cancellation_cause(&self) -> Option<Status> {
        self.inner.cancel.inner.lock().unwrap().cancelled.clone()
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.inner.deadline
    }

    /// Registers a listener invoked exactly once on cancellation. If the
    /// context is already cancelled the listener runs immediately on the
    /// calling thread.
    pub fn add_cancellation_listener(&self, listener: impl FnOnce(&Status) + Send + 'static) {
        let status = {
            let mut inner = self.inner.cancel.inner.lock().unwrap();
            match inner.cancelled.clone() {
                Some(status) => status,
                None => {
                    inner.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&status);
    }

    /// Resolves when the context is cancelled.
    pub async fn cancelled(&self) -> Status {
        loop {
            let notified = self.inner.cancel.notify.notified();
            if let Some(status) = self.cancellation_cause() {
                return status;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn values_inherit_and_shadow() {
        let key: ContextKey<u32> = ContextKey::new("n");
        let other: ContextKey<u32> = ContextKey::new("n");

        let base = Context::root().with_value(&key, 1);
        let child = base.with_value(&key, 2);

        assert_eq!(*base.value(&key).unwrap(), 1);
        assert_eq!(*child.value(&key).unwrap(), 2);
        // Same name, different key: no aliasing.
        assert_eq!(child.value(&other), None);
    }

    #[tokio::test]
    async fn cancelling_parent_cancels_descendants() {
        let parent = Context::root().with_cancellation();
        let child = parent.with_cancellation();
        let grandchild = child.with_value(&ContextKey::<u8>::new("x"), 0);

        assert!(parent.cancel(Status::cancelled("stop")));
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert_eq!(
            grandchild.cancellation_cause().unwrap().code(),
            Code::Cancelled
        );
    }

    #[tokio::test]
    async fn first_cancellation_wins() {
        let ctx = Context::root().with_cancellation();
        assert!(ctx.cancel(Status::cancelled("first")));
        assert!(!ctx.cancel(Status::internal("second")));
        assert_eq!(ctx.cancellation_cause().unwrap().message(), Some("first"));
    }

    #[tokio::test]
    async fn root_is_not_cancellable() {
        assert!(!Context::root().cancel(Status::cancelled("nope")));
        let value_child = Context::root().with_value(&ContextKey::<u8>::new("k"), 1);
        assert!(!value_child.cancel(Status::cancelled("nope")));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_with_deadline_exceeded() {
        let ctx = Context::root().with_deadline(Deadline::after(Duration::from_millis(50)));
        assert!(!ctx.is_cancelled());

        tokio::time::advance(Duration::from_millis(80)).await;
        let status = ctx.cancelled().await;
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn child_deadline_cannot_extend_parent() {
        let parent = Context::root().with_deadline(Deadline::after(Duration::from_millis(50)));
        let child = parent.with_deadline(Deadline::after(Duration::from_secs(10)));
        assert!(child.deadline().unwrap() <= Deadline::after(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn listener_fires_immediately_when_already_cancelled() {
        let ctx = Context::root().with_cancellation();
        ctx.cancel(Status::cancelled("done"));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        ctx.add_cancellation_listener(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attach_makes_context_current() {
        let key: ContextKey<&'static str> = ContextKey::new("who");
        let ctx = Context::root().with_value(&key, "inner");

        assert!(Context::current().value(&key).is_none());
        ctx.run(|| {
            assert_eq!(*Context::current().value(&key).unwrap(), "inner");
        });
        assert!(Context::current().value(&key).is_none());
    }
}
