use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::call_options::CallOptions;
use crate::context::Context;
use crate::deadline::{min_deadline, Deadline};
use crate::exec::{Executor, SerialExecutor, TokioExecutor};
use crate::http2::headers::RESERVED_HEADERS;
use crate::metadata::Metadata;
use crate::status::{Code, Status};
use crate::transport::{
    ClientStreamHandle, ClientStreamListener, ClientTransport, NewStreamArgs,
};

/// User agent advertised by this library, appended after any
/// application-supplied prefix.
pub const LIBRARY_USER_AGENT: &str = concat!("grpc-rust-h2/", env!("CARGO_PKG_VERSION"));

/// Application-facing callbacks of a call. Any Err return cancels the
/// call: the close is then CANCELLED with the returned status as cause,
/// regardless of what the server later says.
pub trait CallListener: Send + 'static {
    fn on_headers(&mut self, metadata: Metadata) -> Result<(), Status>;
    fn on_message(&mut self, message: Bytes) -> Result<(), Status>;
    fn on_ready(&mut self) -> Result<(), Status> {
        Ok(())
    }
    fn on_close(&mut self, status: Status, trailers: Metadata);
}

/// What a call needs from its channel. A trait so the call never holds a
/// concrete channel reference.
pub(crate) trait ClientTransportProvider: Send + Sync {
    fn pick_transport(&self, wait_for_ready: bool) -> Arc<dyn ClientTransport>;
    fn default_authority(&self) -> String;
    fn user_agent_prefix(&self) -> Option<String>;
}

struct CallState {
    started: bool,
    cancelled: bool,
    half_closed: bool,
    /// Terminal: on_close delivered to the application.
    closed: bool,
    stream: Option<Box<dyn ClientStreamHandle>>,
    deadline_timer: Option<tokio::task::JoinHandle<()>>,
}

pub(crate) struct CallInner {
    provider: Arc<dyn ClientTransportProvider>,
    method: String,
    options: CallOptions,
    state: Mutex<CallState>,
    adapter: Mutex<Option<Arc<AdapterShared>>>,
}

/// One RPC in flight: CREATED -> STARTED -> (half-closed | cancelled) ->
/// CLOSED.
///
/// All methods are non-blocking. Listener callbacks are serialized and run
/// with the context captured at start() attached.
pub struct ClientCall {
    inner: Arc<CallInner>,
}

impl ClientCall {
    pub(crate) fn new(
        provider: Arc<dyn ClientTransportProvider>,
        method: String,
        options: CallOptions,
    ) -> ClientCall {
        ClientCall {
            inner: Arc::new(CallInner {
                provider,
                method,
                options,
                state: Mutex::new(CallState {
                    started: false,
                    cancelled: false,
                    half_closed: false,
                    closed: false,
                    stream: None,
                    deadline_timer: None,
                }),
                adapter: Mutex::new(None),
            }),
        }
    }

    /// Starts the call. Exactly once; must run inside a tokio runtime.
    pub fn start(
        &self,
        listener: impl CallListener,
        metadata: Metadata,
    ) -> Result<(), Status> {
        self.start_boxed(Box::new(listener), metadata)
    }

    pub fn start_boxed(
        &self,
        listener: Box<dyn CallListener>,
        mut metadata: Metadata,
    ) -> Result<(), Status> {
        let inner = &self.inner;
        let context = Context::current();

        let cancelled_early = {
            let mut state = inner.state.lock().unwrap();
            if state.started {
                return Err(Status::internal("ClientCall::start called twice"));
            }
            state.started = true;
            state.cancelled
        };

        let callback_executor: Arc<dyn Executor> = match inner.options.executor() {
            Some(executor) => executor.clone(),
            None => Arc::new(TokioExecutor::current()),
        };
        let adapter = Arc::new(AdapterShared {
            serial: SerialExecutor::new(callback_executor),
            context: context.clone(),
            call: Arc::downgrade(inner),
            state: Mutex::new(AdapterState {
                listener,
                closed: false,
                override_status: None,
            }),
        });
        *inner.adapter.lock().unwrap() = Some(adapter.clone());

        if cancelled_early {
            adapter.schedule_close(Status::cancelled("call cancelled before start"));
            return Ok(());
        }

        // The effective deadline is the earlier of the context's and the
        // call options'.
        let deadline = min_deadline(context.deadline(), inner.options.deadline());
        if let Some(deadline) = deadline {
            if deadline.expired() {
                // Dead on arrival: complete without touching a transport.
                adapter.schedule_close(
                    Status::deadline_exceeded("deadline expired before the call was started"),
                );
                return Ok(());
            }
        }

        // The transport owns these headers; user values are scrubbed and
        // canonical ones re-added on the wire.
        for name in RESERVED_HEADERS {
            metadata.remove_all(name);
        }

        let authority = inner
            .options
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| inner.provider.default_authority());

        if let Some(credentials) = inner.options.credentials() {
            match credentials.request_metadata(&inner.method, &authority) {
                Ok(extra) => metadata.merge(extra),
                Err(status) => {
                    adapter.schedule_close(status);
                    return Ok(());
                }
            }
        }

        let user_agent = match inner.provider.user_agent_prefix() {
            Some(prefix) => format!("{} {}", prefix, LIBRARY_USER_AGENT),
            None => LIBRARY_USER_AGENT.to_string(),
        };

        let transport = inner
            .provider
            .pick_transport(inner.options.wait_for_ready());
        let stream = transport.new_stream(NewStreamArgs {
            method: inner.method.clone(),
            authority,
            timeout: deadline.and_then(|d| d.time_remaining()),
            metadata,
            user_agent,
            message_encoding: inner.options.compressor().map(|c| c.to_string()),
            listener: Box::new(CallAdapter {
                shared: adapter.clone(),
            }),
        });

        {
            let mut state = inner.state.lock().unwrap();
            if state.cancelled {
                // Raced with cancel(): the stream was created after the
                // cancel ran, so reset it now.
                stream.cancel(Status::cancelled("call was cancelled"));
            } else {
                state.stream = Some(stream);
                if let Some(deadline) = deadline {
                    state.deadline_timer = Some(spawn_deadline_timer(
                        Arc::downgrade(inner),
                        deadline,
                    ));
                }
            }
        }

        // Listener callbacks run under the start-time context; cancelling
        // that context cancels the call.
        let weak = Arc::downgrade(inner);
        context.add_cancellation_listener(move |status| {
            if let Some(call) = weak.upgrade() {
                call.cancel_with(
                    Status::cancelled("context cancelled").with_cause(status.clone()),
                );
            }
        });

        Ok(())
    }

    /// Enqueues one message. INTERNAL if the call was never started, was
    /// half-closed, or is already done.
    pub fn send_message(&self, message: Bytes) -> Result<(), Status> {
        let state = self.inner.state.lock().unwrap();
        if !state.started {
            return Err(Status::internal("sendMessage before start"));
        }
        if state.half_closed {
            return Err(Status::internal("sendMessage after halfClose"));
        }
        if state.cancelled || state.closed {
            return Err(Status::internal("sendMessage on a dead call"));
        }
        if let Some(stream) = &state.stream {
            stream.send_message(message);
        }
        Ok(())
    }

    /// Permits up to n more messages to be delivered to the listener.
    pub fn request(&self, n: u32) {
        let state = self.inner.state.lock().unwrap();
        if let Some(stream) = &state.stream {
            stream.request(n);
        }
    }

    /// Signals that no further messages will be sent. Idempotent.
    pub fn half_close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.half_closed || state.cancelled || state.closed {
            return;
        }
        state.half_closed = true;
        if let Some(stream) = &state.stream {
            stream.half_close();
        }
    }

    /// Cancels the call. The first cancellation wins; later ones (and
    /// cancels racing other operations) are no-ops.
    pub fn cancel(&self, message: &str, cause: Option<Status>) {
        let mut status = Status::cancelled(message.to_string());
        if let Some(cause) = cause {
            status = status.with_cause(cause);
        }
        self.inner.cancel_with(status);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().unwrap().cancelled
    }
}

impl CallInner {
    fn cancel_with(&self, status: Status) {
        let stream = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled || state.closed {
                return;
            }
            state.cancelled = true;
            if let Some(timer) = state.deadline_timer.take() {
                timer.abort();
            }
            state.stream.take()
        };

        match stream {
            Some(stream) => {
                // The transport reflects the cancel back as the close.
                stream.cancel(status);
            }
            None => {
                // Never reached a transport (not started yet, or failed
                // pre-flight): close directly if the adapter exists.
                let adapter = self.adapter.lock().unwrap().clone();
                if let Some(adapter) = adapter {
                    adapter.schedule_close(status);
                }
            }
        }
    }

    /// Terminal bookkeeping once on_close has been handed to the
    /// application.
    fn on_terminal(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        if let Some(timer) = state.deadline_timer.take() {
            timer.abort();
        }
        state.stream = None;
    }
}

fn spawn_deadline_timer(
    call: Weak<CallInner>,
    deadline: Deadline,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline.instant()).await;
        if let Some(call) = call.upgrade() {
            call.cancel_with(Status::deadline_exceeded(format!(
                "deadline exceeded after {:?}",
                deadline.overdue()
            )));
        }
    })
}

struct AdapterState {
    listener: Box<dyn CallListener>,
    closed: bool,
    /// Set when an application callback failed: the eventual close is
    /// replaced by this status no matter what the transport reports.
    override_status: Option<Status>,
}

struct AdapterShared {
    serial: SerialExecutor,
    context: Context,
    call: Weak<CallInner>,
    state: Mutex<AdapterState>,
}

impl AdapterShared {
    /// Runs one fallible callback on the serial executor.
    fn dispatch(
        self: &Arc<Self>,
        f: impl FnOnce(&mut dyn CallListener) -> Result<(), Status> + Send + 'static,
    ) {
        let shared = self.clone();
        self.serial.execute(move || {
            let failure = {
                let mut state = shared.state.lock().unwrap();
                if state.closed || state.override_status.is_some() {
                    // Already terminal (or poisoned by an earlier listener
                    // error): everything but the close is suppressed.
                    return;
                }
                let context = shared.context.clone();
                match context.run(|| f(&mut *state.listener)) {
                    Ok(()) => None,
                    Err(status) => {
                        let cancel_status = Status::new(Code::Cancelled)
                            .with_message("application listener failed")
                            .with_cause(status);
                        state.override_status = Some(cancel_status.clone());
                        Some(cancel_status)
                    }
                }
            };

            if let Some(status) = failure {
                if let Some(call) = shared.call.upgrade() {
                    call.cancel_with(status);
                }
            }
        });
    }

    /// Delivers the terminal close, exactly once, after everything queued
    /// before it.
    fn deliver_close(self: &Arc<Self>, status: Status, trailers: Metadata) {
        let shared = self.clone();
        self.serial.execute(move || {
            let (status, trailers) = {
                let mut state = shared.state.lock().unwrap();
                if state.closed {
                    return;
                }
                state.closed = true;
                match state.override_status.take() {
                    Some(override_status) => (override_status, Metadata::new()),
                    None => (status, trailers),
                }
            };

            if let Some(call) = shared.call.upgrade() {
                call.on_terminal();
            }

            let mut state = shared.state.lock().unwrap();
            let context = shared.context.clone();
            let listener = &mut state.listener;
            context.run(|| listener.on_close(status, trailers));
        });
    }

    fn schedule_close(self: &Arc<Self>, status: Status) {
        self.deliver_close(status, Metadata::new());
    }
}

/// Transport-side listener feeding the application listener through the
/// serial executor.
struct CallAdapter {
    shared: Arc<AdapterShared>,
}

impl ClientStreamListener for CallAdapter {
    fn on_headers(&mut self, metadata: Metadata) {
        self.shared.dispatch(move |l| l.on_headers(metadata));
    }

    fn on_message(&mut self, message: Bytes) {
        self.shared.dispatch(move |l| l.on_message(message));
    }

    fn on_ready(&mut self) {
        self.shared.dispatch(|l| l.on_ready());
    }

    fn on_close(&mut self, status: Status, trailers: Metadata) {
        self.shared.deliver_close(status, trailers);
    }
}
