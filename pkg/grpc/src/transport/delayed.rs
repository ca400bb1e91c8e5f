use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::http2::ping::PingCallback;
use crate::metadata::Metadata;
use crate::status::Status;
use crate::transport::{
    ClientStreamHandle, ClientTransport, NewStreamArgs, TransportLifecycle,
};

enum BufferedOp {
    SendMessage(Bytes),
    HalfClose,
    Request(u32),
}

struct PendingInner {
    /// Present until the stream is either created on a real transport or
    /// failed. Owns the listener.
    args: Option<NewStreamArgs>,
    ops: Vec<BufferedOp>,
    real: Option<Box<dyn ClientStreamHandle>>,
    closed: bool,
}

struct PendingStream {
    inner: Mutex<PendingInner>,
}

/// Handle for a stream that may still be buffered. Operations are queued
/// and replayed, in order, once the stream is created on a real transport.
struct DelayedStreamHandle {
    pending: Arc<PendingStream>,
}

impl ClientStreamHandle for DelayedStreamHandle {
    fn send_message(&self, message: Bytes) {
        let mut inner = self.pending.inner.lock().unwrap();
        if let Some(real) = &inner.real {
            real.send_message(message);
        } else if !inner.closed {
            inner.ops.push(BufferedOp::SendMessage(message));
        }
    }

    fn half_close(&self) {
        let mut inner = self.pending.inner.lock().unwrap();
        if let Some(real) = &inner.real {
            real.half_close();
        } else if !inner.closed {
            inner.ops.push(BufferedOp::HalfClose);
        }
    }

    fn request(&self, n: u32) {
        let mut inner = self.pending.inner.lock().unwrap();
        if let Some(real) = &inner.real {
            real.request(n);
        } else if !inner.closed {
            inner.ops.push(BufferedOp::Request(n));
        }
    }

    fn cancel(&self, status: Status) {
        let args = {
            let mut inner = self.pending.inner.lock().unwrap();
            if let Some(real) = &inner.real {
                real.cancel(status);
                return;
            }
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.args.take()
        };
        // The stream never reached a transport; the exactly-once close is
        // delivered here. Outside the lock: the listener may call back
        // into the handle.
        if let Some(mut args) = args {
            args.listener.on_close(status, Metadata::new());
        }
    }
}

struct DelayedState {
    real: Option<Arc<dyn ClientTransport>>,
    shutdown: Option<Status>,
    pending: Vec<Arc<PendingStream>>,
    terminated: bool,
}

/// A transport that buffers stream creations until a real transport is
/// supplied.
///
/// While the TransportSet is still connecting, calls land here; once a
/// connection is READY the buffered streams are created against it in
/// arrival order. After that, new streams pass straight through.
pub struct DelayedTransport {
    state: Mutex<DelayedState>,
    lifecycle: Arc<dyn TransportLifecycle>,
}

impl DelayedTransport {
    pub fn new(lifecycle: Arc<dyn TransportLifecycle>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DelayedState {
                real: None,
                shutdown: None,
                pending: Vec::new(),
                terminated: false,
            }),
            lifecycle,
        })
    }

    pub fn has_pending_streams(&self) -> bool {
        !self.state.lock().unwrap().pending.is_empty()
    }

    /// Supplies the real transport, draining buffered streams onto it in
    /// arrival order.
    pub fn set_transport(&self, transport: Arc<dyn ClientTransport>) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.real = Some(transport.clone());
            std::mem::take(&mut state.pending)
        };

        let had_pending = !pending.is_empty();
        for stream in pending {
            let mut inner = stream.inner.lock().unwrap();
            if inner.closed {
                continue;
            }
            let args = match inner.args.take() {
                Some(args) => args,
                None => continue,
            };
            let handle = transport.new_stream(args);
            for op in inner.ops.drain(..) {
                match op {
                    BufferedOp::SendMessage(message) => handle.send_message(message),
                    BufferedOp::HalfClose => handle.half_close(),
                    BufferedOp::Request(n) => handle.request(n),
                }
            }
            inner.real = Some(handle);
        }

        if had_pending {
            self.lifecycle.on_in_use(false);
        }
        self.maybe_terminate();
    }

    /// Stops accepting new streams. Already-buffered streams keep waiting
    /// for a real transport (or for shutdown_now).
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.shutdown.is_some() {
                return;
            }
            state.shutdown = Some(Status::unavailable("transport shutdown"));
        }
        self.maybe_terminate();
    }

    /// Fails every buffered stream with the error.
    pub fn shutdown_now(&self, status: Status) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            if state.shutdown.is_none() {
                state.shutdown = Some(status.clone());
            }
            std::mem::take(&mut state.pending)
        };

        let had_pending = !pending.is_empty();
        for stream in pending {
            let args = {
                let mut inner = stream.inner.lock().unwrap();
                if inner.closed {
                    continue;
                }
                inner.closed = true;
                inner.args.take()
            };
            if let Some(mut args) = args {
                args.listener.on_close(status.clone(), Metadata::new());
            }
        }

        if had_pending {
            self.lifecycle.on_in_use(false);
        }
        self.maybe_terminate();
    }

    fn maybe_terminate(&self) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            if !state.terminated && state.shutdown.is_some() && state.pending.is_empty() {
                state.terminated = true;
                true
            } else {
                false
            }
        };
        if fire {
            self.lifecycle.on_terminated();
        }
    }
}

impl ClientTransport for DelayedTransport {
    fn new_stream(&self, args: NewStreamArgs) -> Box<dyn ClientStreamHandle> {
        let mut state = self.state.lock().unwrap();

        // Already drained onto a real transport: pass straight through.
        if let Some(real) = state.real.clone() {
            drop(state);
            return real.new_stream(args);
        }

        if let Some(status) = state.shutdown.clone() {
            drop(state);
            let mut args = args;
            args.listener.on_close(status, Metadata::new());
            return Box::new(crate::transport::NoopStreamHandle);
        }

        let pending = Arc::new(PendingStream {
            inner: Mutex::new(PendingInner {
                args: Some(args),
                ops: Vec::new(),
                real: None,
                closed: false,
            }),
        });
        state.pending.push(pending.clone());
        let first_pending = state.pending.len() == 1;
        drop(state);

        if first_pending {
            self.lifecycle.on_in_use(true);
        }
        Box::new(DelayedStreamHandle { pending })
    }

    fn ping(&self, callback: PingCallback) {
        let real = {
            let state = self.state.lock().unwrap();
            state.real.clone()
        };
        match real {
            Some(real) => real.ping(callback),
            None => callback(Err(Status::unavailable("transport not ready"))),
        }
    }

    fn shutdown(&self) {
        DelayedTransport::shutdown(self);
    }

    fn shutdown_now(&self, status: Status) {
        DelayedTransport::shutdown_now(self, status);
    }
}
