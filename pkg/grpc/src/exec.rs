use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Task = Box<dyn FnOnce() + Send>;

/// Something that can run short callback tasks. Callers either supply their
/// own or check one out of the shared pool below.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Executor spawning each task onto a tokio runtime.
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Executor for the runtime the caller is currently inside.
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) {
        self.handle.spawn(async move {
            task();
        });
    }
}

struct SerialState {
    queue: VecDeque<Task>,
    // True while a drain pass is scheduled or running on the delegate.
    draining: bool,
}

/// Runs tasks on a delegate executor one at a time, in submission order.
///
/// This is what gives a call its linear callback sequence: the transport
/// may hand over headers, messages and the close from an I/O task, but the
/// application observes them serially.
#[derive(Clone)]
pub struct SerialExecutor {
    shared: Arc<SerialShared>,
}

struct SerialShared {
    delegate: Arc<dyn Executor>,
    state: Mutex<SerialState>,
}

impl SerialExecutor {
    pub fn new(delegate: Arc<dyn Executor>) -> Self {
        Self {
            shared: Arc::new(SerialShared {
                delegate,
                state: Mutex::new(SerialState {
                    queue: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        let schedule = {
            let mut state = self.shared.state.lock().unwrap();
            state.queue.push_back(Box::new(task));
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if schedule {
            let shared = self.shared.clone();
            self.shared.delegate.execute(Box::new(move || {
                SerialExecutor::drain(&shared);
            }));
        }
    }

    fn drain(shared: &Arc<SerialShared>) {
        loop {
            let task = {
                let mut state = shared.state.lock().unwrap();
                match state.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            task();
        }
    }
}

/// Lazily created process-wide resource handed out under reference
/// counting. The resource is dropped once the last handle is released, so
/// an idle process holds nothing.
pub struct SharedResource<T: Send + Sync + 'static> {
    create: fn() -> T,
    state: Mutex<SharedResourceState<T>>,
}

struct SharedResourceState<T> {
    value: Option<Arc<T>>,
    refs: usize,
}

pub struct SharedHandle<T: Send + Sync + 'static> {
    resource: &'static SharedResource<T>,
    value: Arc<T>,
}

impl<T: Send + Sync + 'static> SharedResource<T> {
    pub const fn new(create: fn() -> T) -> Self {
        Self {
            create,
            state: Mutex::new(SharedResourceState {
                value: None,
                refs: 0,
            }),
        }
    }

    pub fn checkout(&'static self) -> SharedHandle<T> {
        let mut state = self.state.lock().unwrap();
        let value = match &state.value {
            Some(value) => value.clone(),
            None => {
                let value = Arc::new((self.create)());
                state.value = Some(value.clone());
                value
            }
        };
        state.refs += 1;
        SharedHandle {
            resource: self,
            value,
        }
    }
}

impl<T: Send + Sync + 'static> std::ops::Deref for SharedHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Send + Sync + 'static> Clone for SharedHandle<T> {
    fn clone(&self) -> Self {
        let mut state = self.resource.state.lock().unwrap();
        state.refs += 1;
        Self {
            resource: self.resource,
            value: self.value.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Drop for SharedHandle<T> {
    fn drop(&mut self) {
        let mut state = self.resource.state.lock().unwrap();
        state.refs -= 1;
        if state.refs == 0 {
            state.value = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn serial_executor_preserves_order() {
        let serial = SerialExecutor::new(Arc::new(TokioExecutor::current()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let done_tx = Arc::new(Mutex::new(Some(done_tx)));

        const N: usize = 200;
        for i in 0..N {
            let log = log.clone();
            let done_tx = done_tx.clone();
            serial.execute(move || {
                log.lock().unwrap().push(i);
                if i == N - 1 {
                    if let Some(tx) = done_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                }
            });
        }

        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();
        let log = log.lock().unwrap();
        assert_eq!(*log, (0..N).collect::<Vec<_>>());
    }

    #[test]
    fn shared_resource_is_recreated_after_release() {
        static COUNTER: SharedResource<AtomicUsize> =
            SharedResource::new(|| AtomicUsize::new(0));

        let a = COUNTER.checkout();
        a.fetch_add(1, Ordering::SeqCst);
        let b = COUNTER.checkout();
        assert_eq!(b.load(Ordering::SeqCst), 1);

        drop(a);
        drop(b);

        // Last handle released the resource; a new checkout starts fresh.
        let c = COUNTER.checkout();
        assert_eq!(c.load(Ordering::SeqCst), 0);
    }
}
