//! The managed server: accepts transport connections and dispatches
//! inbound streams to a method registry.

pub mod registry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

use crate::context::Context;
use crate::deadline::Deadline;
use crate::exec::{SerialExecutor, TokioExecutor};
use crate::http2::client::Http2Options;
use crate::http2::server::Http2ServerTransport;
use crate::metadata::Metadata;
use crate::server::registry::{MethodRegistry, ServerCall, ServerCallListener};
use crate::status::{Code, Status};
use crate::timeout::decode_timeout;
use crate::transport::{
    ServerStreamHandle, ServerStreamListener, ServerTransportListener, TransportAcceptor,
};

#[derive(Clone)]
pub struct ServerOptions {
    pub http2: Http2Options,

    /// Consulted when the primary registry has no entry for a method.
    pub fallback_registry: Option<MethodRegistry>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            http2: Http2Options::default(),
            fallback_registry: None,
        }
    }
}

struct ServerState {
    started: bool,
    shutdown: bool,
    terminated: bool,
    accept_closed: bool,
    accept_task: Option<tokio::task::JoinHandle<()>>,
    transports: HashMap<u64, Arc<Http2ServerTransport>>,
    next_id: u64,
}

struct ServerInner {
    registry: MethodRegistry,
    options: ServerOptions,
    /// Parent of every per-call context; cancelling it reaches all calls.
    root_context: Context,
    state: Mutex<ServerState>,
    terminated_notify: Notify,
}

/// Serves registered methods over accepted transport connections.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(registry: MethodRegistry, options: ServerOptions) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                registry,
                options,
                root_context: Context::root().with_cancellation(),
                state: Mutex::new(ServerState {
                    started: false,
                    shutdown: false,
                    terminated: false,
                    accept_closed: false,
                    accept_task: None,
                    transports: HashMap::new(),
                    next_id: 0,
                }),
                terminated_notify: Notify::new(),
            }),
        }
    }

    /// Binds the acceptor and starts serving. Exactly once.
    pub fn start(&self, acceptor: Box<dyn TransportAcceptor>) -> Result<(), Status> {
        let mut state = self.inner.state.lock().unwrap();
        if state.started {
            return Err(Status::new(Code::FailedPrecondition)
                .with_message("Server::start called twice"));
        }
        if state.shutdown {
            return Err(Status::new(Code::FailedPrecondition)
                .with_message("Server::start after shutdown"));
        }
        state.started = true;
        state.accept_task = Some(tokio::spawn(accept_loop(
            Arc::downgrade(&self.inner),
            acceptor,
        )));
        Ok(())
    }

    /// Stops accepting connections; existing streams run to completion.
    pub fn shutdown(&self) {
        let (accept_task, transports) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.accept_closed = true;
            (
                state.accept_task.take(),
                state.transports.values().cloned().collect::<Vec<_>>(),
            )
        };

        if let Some(task) = accept_task {
            task.abort();
        }
        for transport in transports {
            transport.shutdown();
        }
        self.inner.maybe_terminate();
    }

    /// shutdown() plus forcefully closing every transport.
    pub fn shutdown_now(&self, status: Status) {
        self.shutdown();
        let transports: Vec<_> = {
            let state = self.inner.state.lock().unwrap();
            state.transports.values().cloned().collect()
        };
        for transport in transports {
            transport.shutdown_now(status.clone());
        }
        self.inner.maybe_terminate();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().unwrap().shutdown
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().unwrap().terminated
    }

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
}

impl ServerInner {
    fn maybe_terminate(&self) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            if !state.terminated
                && state.shutdown
                && state.accept_closed
                && state.transports.is_empty()
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
}

async fn accept_loop(server: Weak<ServerInner>, mut acceptor: Box<dyn TransportAcceptor>) {
    loop {
        match acceptor.accept().await {
            Ok(codec) => {
                let inner = match server.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let mut state = inner.state.lock().unwrap();
                if state.shutdown {
                    // Refuse by dropping the connection.
                    continue;
                }
                let id = state.next_id;
                state.next_id += 1;
                let transport = Http2ServerTransport::spawn(
                    codec,
                    inner.options.http2.clone(),
                    Box::new(TransportBridge {
                        server: server.clone(),
                        transport_id: id,
                    }),
                );
                state.transports.insert(id, transport);
            }
            Err(status) => {
                debug!(%status, "server listener closed");
                if let Some(inner) = server.upgrade() {
                    inner.state.lock().unwrap().accept_closed = true;
                    inner.maybe_terminate();
                }
                return;
            }
        }
    }
}

/// Receives streams from one server transport and dispatches them against
/// the registry.
struct TransportBridge {
    server: Weak<ServerInner>,
    transport_id: u64,
}

impl ServerTransportListener for TransportBridge {
    fn stream_created(
        &mut self,
        stream: Box<dyn ServerStreamHandle>,
        method: String,
        mut metadata: Metadata,
    ) -> Box<dyn ServerStreamListener> {
        let stream: Arc<dyn ServerStreamHandle> = Arc::from(stream);

        let server = match self.server.upgrade() {
            Some(server) => server,
            None => {
                stream.cancel(Status::unavailable("server is gone"));
                return Box::new(NoopServerStreamListener);
            }
        };

        // The per-call context: a cancellable child of the server root,
        // with a deadline when the client sent grpc-timeout.
        let timeout_header = metadata
            .remove_all("grpc-timeout")
            .into_iter()
            .next()
            .and_then(|v| v.as_str().map(str::to_string));
        let context = match timeout_header {
            Some(value) => match decode_timeout(&value) {
                Ok(timeout) => server
                    .root_context
                    .with_deadline(Deadline::after(timeout)),
                Err(e) => {
                    stream.cancel(
                        Status::internal(format!("malformed grpc-timeout header: {}", e)),
                    );
                    return Box::new(NoopServerStreamListener);
                }
            },
            None => server.root_context.with_cancellation(),
        };

        // Deadline expiry kills the stream, not just the context.
        let deadline_stream = stream.clone();
        context.add_cancellation_listener(move |status| {
            if status.code() == Code::DeadlineExceeded {
                deadline_stream.cancel(status.clone());
            }
        });

        let handler = server.registry.lookup(&method).or_else(|| {
            server
                .options
                .fallback_registry
                .as_ref()
                .and_then(|fallback| fallback.lookup(&method))
        });
        let handler = match handler {
            Some(handler) => handler,
            None => {
                stream.close(
                    Status::unimplemented(format!("Method not found: {}", method)),
                    Metadata::new(),
                );
                return Box::new(NoopServerStreamListener);
            }
        };

        let call = ServerCall::new(stream.clone(), context.clone(), method);
        let listener = handler.start_call(call, metadata);

        Box::new(SerializedStreamListener::new(listener, context, stream))
    }

    fn transport_terminated(&mut self) {
        if let Some(inner) = self.server.upgrade() {
            {
                let mut state = inner.state.lock().unwrap();
                state.transports.remove(&self.transport_id);
            }
            inner.maybe_terminate();
        }
    }
}

struct NoopServerStreamListener;

impl ServerStreamListener for NoopServerStreamListener {
    fn on_message(&mut self, _message: Bytes) {}
    fn on_half_close(&mut self) {}
    fn on_ready(&mut self) {}
    fn on_cancel(&mut self, _status: Status) {}
    fn on_complete(&mut self) {}
}

struct StreamAdapterState {
    listener: Box<dyn ServerCallListener>,
    terminal: bool,
    failed: bool,
}

struct StreamAdapterShared {
    serial: SerialExecutor,
    context: Context,
    stream: Arc<dyn ServerStreamHandle>,
    state: Mutex<StreamAdapterState>,
}

/// Runs application callbacks on a serializing executor, preserving the
/// per-stream event order, with the call context attached.
struct SerializedStreamListener {
    shared: Arc<StreamAdapterShared>,
}

impl SerializedStreamListener {
    fn new(
        listener: Box<dyn ServerCallListener>,
        context: Context,
        stream: Arc<dyn ServerStreamHandle>,
    ) -> Self {
        Self {
            shared: Arc::new(StreamAdapterShared {
                serial: SerialExecutor::new(Arc::new(TokioExecutor::current())),
                context,
                stream,
                state: Mutex::new(StreamAdapterState {
                    listener,
                    terminal: false,
                    failed: false,
                }),
            }),
        }
    }

    fn dispatch(
        &self,
        f: impl FnOnce(&mut dyn ServerCallListener) -> Result<(), Status> + Send + 'static,
    ) {
        let shared = self.shared.clone();
        self.shared.serial.execute(move || {
            let failure = {
                let mut state = shared.state.lock().unwrap();
                if state.terminal || state.failed {
                    return;
                }
                let context = shared.context.clone();
                match context.run(|| f(&mut *state.listener)) {
                    Ok(()) => None,
                    Err(status) => {
                        state.failed = true;
                        Some(
                            Status::new(Code::Cancelled)
                                .with_message("application listener failed")
                                .with_cause(status),
                        )
                    }
                }
            };

            if let Some(status) = failure {
                shared.context.cancel(status.clone());
                shared.stream.cancel(status);
            }
        });
    }

    fn terminal(&self, f: impl FnOnce(&mut dyn ServerCallListener) + Send + 'static) {
        let shared = self.shared.clone();
        self.shared.serial.execute(move || {
            let mut state = shared.state.lock().unwrap();
            if state.terminal {
                return;
            }
            state.terminal = true;
            let context = shared.context.clone();
            context.run(|| f(&mut *state.listener));
        });
    }
}

impl ServerStreamListener for SerializedStreamListener {
    fn on_message(&mut self, message: Bytes) {
        self.dispatch(move |l| l.on_message(message));
    }

    fn on_half_close(&mut self) {
        self.dispatch(|l| l.on_half_close());
    }

    fn on_ready(&mut self) {
        self.dispatch(|l| l.on_ready());
    }

    fn on_cancel(&mut self, status: Status) {
        self.shared.context.cancel(status.clone());
        self.terminal(move |l| l.on_cancel(status));
    }

    fn on_complete(&mut self) {
        self.terminal(|l| l.on_complete());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_options::CallOptions;
    use crate::channel::call::CallListener;
    use crate::channel::{Channel, ChannelOptions};
    use crate::http2::pipe;
    use crate::server::registry::ServerCallHandler;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    /// Echoes each request message back, tagging trailers with whether the
    /// call carried a deadline.
    struct EchoHandler;

    struct EchoListener {
        call: ServerCall,
        received: Vec<Bytes>,
    }

    impl ServerCallHandler for EchoHandler {
        fn start_call(&self, call: ServerCall, _metadata: Metadata) -> Box<dyn ServerCallListener> {
            call.request(10);
            Box::new(EchoListener {
                call,
                received: Vec::new(),
            })
        }
    }

    impl ServerCallListener for EchoListener {
        fn on_message(&mut self, message: Bytes) -> Result<(), Status> {
            self.received.push(message);
            Ok(())
        }

        fn on_half_close(&mut self) -> Result<(), Status> {
            self.call.send_headers(Metadata::new());
            for message in self.received.drain(..) {
                self.call.send_message(message);
            }
            let mut trailers = Metadata::new();
            let had_deadline = self.call.context().deadline().is_some();
            trailers
                .add_ascii("had-deadline", if had_deadline { "true" } else { "false" })
                .unwrap();
            self.call.close(Status::OK, trailers);
            Ok(())
        }

        fn on_cancel(&mut self, _status: Status) {}
        fn on_complete(&mut self) {}
    }

    #[derive(Debug)]
    enum Event {
        Headers,
        Message(Bytes),
        Close(Status, Metadata),
    }

    struct ClientProbe {
        tx: UnboundedSender<Event>,
    }

    impl CallListener for ClientProbe {
        fn on_headers(&mut self, _metadata: Metadata) -> Result<(), Status> {
            let _ = self.tx.send(Event::Headers);
            Ok(())
        }
        fn on_message(&mut self, message: Bytes) -> Result<(), Status> {
            let _ = self.tx.send(Event::Message(message));
            Ok(())
        }
        fn on_close(&mut self, status: Status, trailers: Metadata) {
            let _ = self.tx.send(Event::Close(status, trailers));
        }
    }

    fn client_probe() -> (ClientProbe, UnboundedReceiver<Event>) {
        let (tx, rx) = unbounded_channel();
        (ClientProbe { tx }, rx)
    }

    async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("closed")
    }

    fn echo_registry() -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        registry.add_method("pkg.Echo/Say", Arc::new(EchoHandler));
        registry
    }

    fn start_stack(registry: MethodRegistry) -> (Server, Channel) {
        let (connector, acceptor) = pipe::link();
        let server = Server::new(registry, ServerOptions::default());
        server.start(Box::new(acceptor)).unwrap();
        let channel = Channel::new(
            "static:127.0.0.1:50051",
            Arc::new(connector),
            ChannelOptions::default(),
        )
        .unwrap();
        (server, channel)
    }

    #[tokio::test]
    async fn unary_round_trip_through_the_whole_stack() {
        let (_server, channel) = start_stack(echo_registry());

        let call = channel.new_call("pkg.Echo/Say", CallOptions::new());
        let (listener, mut events) = client_probe();
        call.start(listener, Metadata::new()).unwrap();
        call.request(2);
        call.send_message(Bytes::from_static(b"hello over pipes"))
            .unwrap();
        call.half_close();

        assert!(matches!(next_event(&mut events).await, Event::Headers));
        match next_event(&mut events).await {
            Event::Message(m) => assert_eq!(&m[..], b"hello over pipes"),
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut events).await {
            Event::Close(status, trailers) => {
                assert!(status.is_ok(), "close status: {}", status);
                assert_eq!(trailers.get_ascii("had-deadline"), Some("false"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_method_closes_with_unimplemented() {
        let (_server, channel) = start_stack(echo_registry());

        let call = channel.new_call("pkg.Echo/Missing", CallOptions::new());
        let (listener, mut events) = client_probe();
        call.start(listener, Metadata::new()).unwrap();
        call.half_close();

        match next_event(&mut events).await {
            Event::Close(status, _) => {
                assert_eq!(status.code(), Code::Unimplemented);
                assert!(status.message().unwrap().contains("pkg.Echo/Missing"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn fallback_registry_is_consulted_after_the_primary() {
        let mut fallback = MethodRegistry::new();
        fallback.add_method("pkg.Echo/Say", Arc::new(EchoHandler));
        let (connector, acceptor) = pipe::link();
        let server = Server::new(
            MethodRegistry::new(),
            ServerOptions {
                fallback_registry: Some(fallback),
                ..ServerOptions::default()
            },
        );
        server.start(Box::new(acceptor)).unwrap();
        let channel = Channel::new(
            "static:127.0.0.1:50051",
            Arc::new(connector),
            ChannelOptions::default(),
        )
        .unwrap();

        let call = channel.new_call("pkg.Echo/Say", CallOptions::new());
        let (listener, mut events) = client_probe();
        call.start(listener, Metadata::new()).unwrap();
        call.request(1);
        call.send_message(Bytes::from_static(b"via fallback")).unwrap();
        call.half_close();

        assert!(matches!(next_event(&mut events).await, Event::Headers));
        assert!(matches!(next_event(&mut events).await, Event::Message(_)));
        match next_event(&mut events).await {
            Event::Close(status, _) => assert!(status.is_ok()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn client_deadline_becomes_a_server_context_deadline() {
        let (_server, channel) = start_stack(echo_registry());

        let call = channel.new_call(
            "pkg.Echo/Say",
            CallOptions::new().with_deadline(Deadline::after(Duration::from_secs(30))),
        );
        let (listener, mut events) = client_probe();
        call.start(listener, Metadata::new()).unwrap();
        call.request(1);
        call.send_message(Bytes::from_static(b"x")).unwrap();
        call.half_close();

        loop {
            match next_event(&mut events).await {
                Event::Close(status, trailers) => {
                    assert!(status.is_ok(), "close status: {}", status);
                    assert_eq!(trailers.get_ascii("had-deadline"), Some("true"));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn start_twice_and_start_after_shutdown_fail() {
        let (connector, acceptor) = pipe::link();
        let _ = connector;
        let server = Server::new(echo_registry(), ServerOptions::default());
        server.start(Box::new(acceptor)).unwrap();

        let (_, second) = pipe::link();
        assert_eq!(
            server.start(Box::new(second)).unwrap_err().code(),
            Code::FailedPrecondition
        );

        server.shutdown();
        let (_, third) = pipe::link();
        assert_eq!(
            server.start(Box::new(third)).unwrap_err().code(),
            Code::FailedPrecondition
        );
    }

    #[tokio::test]
    async fn shutdown_reaches_terminated_and_implies_shutdown() {
        let (server, channel) = start_stack(echo_registry());

        // One full call so at least one transport exists.
        let call = channel.new_call("pkg.Echo/Say", CallOptions::new());
        let (listener, mut events) = client_probe();
        call.start(listener, Metadata::new()).unwrap();
        call.request(1);
        call.send_message(Bytes::from_static(b"bye")).unwrap();
        call.half_close();
        loop {
            if matches!(next_event(&mut events).await, Event::Close(..)) {
                break;
            }
        }

        channel.shutdown();
        server.shutdown();
        assert!(server.await_termination(Duration::from_secs(5)).await);
        assert!(server.is_terminated());
        assert!(server.is_shutdown());
    }
}
