use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::framing::{encode_frame, MessageDeframer};
use crate::http2::codec::{CodecPair, Frame, FrameSender, HeaderField};
use crate::http2::flow_control::{ReceiveWindow, SendWindow};
use crate::http2::headers::{
    build_request_headers, parse_response_headers, parse_trailers, RequestHeaders, ResponseHeaders,
};
use crate::http2::ping::{PingAck, PingCallback, PingTracker};
use crate::http2::types::{
    Http2ErrorCode, StreamId, WindowSize, DEFAULT_WINDOW_SIZE, MAX_STREAM_ID,
};
use crate::metadata::Metadata;
use crate::status::Status;
use crate::transport::{
    ClientStreamHandle, ClientStreamListener, ClientTransport, NewStreamArgs, TransportLifecycle,
};

#[derive(Clone)]
pub struct Http2Options {
    /// First locally allocated stream id. Must be odd. 3 by default: 1 is
    /// reserved for the HTTP/1.1 upgrade path.
    pub initial_stream_id: StreamId,

    /// Largest DATA payload written in one frame; bigger writes fragment.
    pub max_frame_size: usize,

    /// Hard cap on a single inbound message.
    pub max_inbound_message_size: usize,

    /// ':scheme' used on outgoing requests.
    pub scheme: String,
}

impl Default for Http2Options {
    fn default() -> Self {
        Self {
            initial_stream_id: 3,
            max_frame_size: 16_384,
            max_inbound_message_size: 4 * 1024 * 1024,
            scheme: "http".to_string(),
        }
    }
}

/// Binds a stream handle to the id the connection task will allocate for
/// it. 0 until the CreateStream command is processed; commands are handled
/// in submission order so the id is always set before it is needed.
struct StreamCell {
    id: AtomicU32,
}

enum Command {
    CreateStream {
        cell: Arc<StreamCell>,
        args: NewStreamArgs,
    },
    SendMessage {
        cell: Arc<StreamCell>,
        message: Bytes,
    },
    HalfClose {
        cell: Arc<StreamCell>,
    },
    Request {
        cell: Arc<StreamCell>,
        n: u32,
    },
    CancelStream {
        cell: Arc<StreamCell>,
        status: Status,
    },
    Ping {
        callback: PingCallback,
    },
    Shutdown,
    ShutdownNow {
        status: Status,
    },
}

/// Client side gRPC transport over one HTTP/2 connection.
///
/// A single connection task owns all HTTP/2 state: it interleaves frames
/// from the codec with commands submitted through the write queue, so no
/// state is shared across threads. Cross-thread operations only enqueue.
pub struct Http2ClientTransport {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl Http2ClientTransport {
    /// Spawns the connection task over the given codec halves.
    pub fn spawn(
        codec: CodecPair,
        options: Http2Options,
        lifecycle: Arc<dyn TransportLifecycle>,
    ) -> Arc<Http2ClientTransport> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let connection = ClientConnection {
            options: options.clone(),
            lifecycle,
            streams: HashMap::new(),
            next_stream_id: options.initial_stream_id,
            goaway_received: None,
            draining: None,
            goaway_enqueued: false,
            shutdown_reported: false,
            conn_recv: ReceiveWindow::default(),
            conn_send: SendWindow::default(),
            initial_send_window: DEFAULT_WINDOW_SIZE,
            ping: PingTracker::new(),
            in_use: false,
            writes: Vec::new(),
        };

        tokio::spawn(run_connection(codec, command_rx, connection));

        Arc::new(Http2ClientTransport { command_tx })
    }

    fn send(&self, command: Command) {
        // A closed channel means the connection task already terminated;
        // the stream listeners were failed there.
        let _ = self.command_tx.send(command);
    }
}

impl ClientTransport for Http2ClientTransport {
    fn new_stream(&self, args: NewStreamArgs) -> Box<dyn ClientStreamHandle> {
        let cell = Arc::new(StreamCell {
            id: AtomicU32::new(0),
        });

        // If the connection task is already gone the listener must still
        // see its exactly-once close.
        if self.command_tx.is_closed() {
            let mut listener = args.listener;
            listener.on_close(
                Status::unavailable("connection terminated"),
                Metadata::new(),
            );
            return Box::new(crate::transport::NoopStreamHandle);
        }

        self.send(Command::CreateStream {
            cell: cell.clone(),
            args,
        });

        Box::new(Http2StreamHandle {
            cell,
            command_tx: self.command_tx.clone(),
        })
    }

    fn ping(&self, callback: PingCallback) {
        if self.command_tx.is_closed() {
            callback(Err(Status::unavailable("connection terminated")));
            return;
        }
        self.send(Command::Ping { callback });
    }

    fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn shutdown_now(&self, status: Status) {
        self.send(Command::ShutdownNow { status });
    }
}

struct Http2StreamHandle {
    cell: Arc<StreamCell>,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl ClientStreamHandle for Http2StreamHandle {
    fn send_message(&self, message: Bytes) {
        let _ = self.command_tx.send(Command::SendMessage {
            cell: self.cell.clone(),
            message,
        });
    }

    fn half_close(&self) {
        let _ = self.command_tx.send(Command::HalfClose {
            cell: self.cell.clone(),
        });
    }

    fn request(&self, n: u32) {
        let _ = self.command_tx.send(Command::Request {
            cell: self.cell.clone(),
            n,
        });
    }

    fn cancel(&self, status: Status) {
        let _ = self.command_tx.send(Command::CancelStream {
            cell: self.cell.clone(),
            status,
        });
    }
}

struct ClientStream {
    listener: Box<dyn ClientStreamListener>,
    deframer: MessageDeframer,
    recv_window: ReceiveWindow,
    send_window: SendWindow,
    send_buffer: BytesMut,
    half_close_pending: bool,
    end_stream_sent: bool,
    headers_received: bool,
    /// Trailers (or an equivalent terminal condition) waiting for buffered
    /// messages to drain before the close is delivered.
    pending_close: Option<(Status, Metadata)>,
}

struct ClientConnection {
    options: Http2Options,
    lifecycle: Arc<dyn TransportLifecycle>,
    streams: HashMap<StreamId, ClientStream>,
    next_stream_id: StreamId,
    goaway_received: Option<StreamId>,
    /// Set once no new streams are accepted (local shutdown, id
    /// exhaustion, or received GOAWAY). Holds the status new streams fail
    /// with.
    draining: Option<Status>,
    goaway_enqueued: bool,
    shutdown_reported: bool,
    conn_recv: ReceiveWindow,
    conn_send: SendWindow,
    initial_send_window: WindowSize,
    ping: PingTracker,
    in_use: bool,
    writes: Vec<Frame>,
}

async fn run_connection(
    codec: CodecPair,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    mut conn: ClientConnection,
) {
    let CodecPair {
        mut receiver,
        mut sender,
    } = codec;

    conn.lifecycle.on_ready();

    let mut commands_open = true;
    let result: Result<(), Status> = loop {
        if let Err(status) = flush_writes(&mut sender, &mut conn).await {
            break Err(status);
        }
        if conn.finished() {
            break Ok(());
        }

        tokio::select! {
            frame = receiver.recv() => match frame {
                Ok(Some(frame)) => {
                    if let Err(status) = conn.handle_frame(frame) {
                        break Err(status);
                    }
                }
                Ok(None) => {
                    break Err(Status::unavailable(
                        "connection terminated for unknown reason",
                    ));
                }
                Err(e) => {
                    break Err(Status::unavailable("connection read failure").with_cause(e));
                }
            },
            command = command_rx.recv(), if commands_open => match command {
                Some(command) => conn.handle_command(command),
                None => {
                    commands_open = false;
                    conn.drain(Status::unavailable("transport released"));
                }
            },
        }
    };

    // Last chance to get a GOAWAY out; the connection may already be dead.
    let _ = flush_writes(&mut sender, &mut conn).await;
    conn.terminate(result);
}

async fn flush_writes(
    sender: &mut Box<dyn FrameSender>,
    conn: &mut ClientConnection,
) -> Result<(), Status> {
    for frame in std::mem::take(&mut conn.writes) {
        sender
            .send(frame)
            .await
            .map_err(|e| Status::unavailable("connection write failure").with_cause(e))?;
    }
    Ok(())
}

impl ClientConnection {
    fn finished(&self) -> bool {
        (self.draining.is_some() || self.goaway_received.is_some()) && self.streams.is_empty()
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), Status> {
        match frame {
            Frame::Headers {
                stream_id,
                headers,
                end_stream,
            } => self.handle_headers(stream_id, headers, end_stream),
            Frame::Data {
                stream_id,
                data,
                end_stream,
            } => self.handle_data(stream_id, data, end_stream),
            Frame::RstStream { stream_id, code } => {
                self.close_stream(stream_id, code.to_status(), Metadata::new(), None);
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                code,
                ..
            } => self.handle_goaway(last_stream_id, code),
            Frame::Ping { payload, ack } => {
                self.handle_ping(payload, ack);
                Ok(())
            }
            Frame::Settings {
                initial_window_size,
                ack,
                ..
            } => self.handle_settings(initial_window_size, ack),
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.handle_window_update(stream_id, increment),
        }
    }

    fn handle_headers(
        &mut self,
        stream_id: StreamId,
        headers: Vec<HeaderField>,
        end_stream: bool,
    ) -> Result<(), Status> {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => {
                // Stream already gone (e.g. cancelled); nothing to do.
                debug!(stream_id, "headers for unknown stream");
                return Ok(());
            }
        };

        if !stream.headers_received {
            match parse_response_headers(&headers, end_stream) {
                ResponseHeaders::Initial { metadata } => {
                    stream.headers_received = true;
                    stream.listener.on_headers(metadata);
                }
                ResponseHeaders::Closed { status, metadata } => {
                    let rst = if end_stream {
                        None
                    } else {
                        Some(Http2ErrorCode::Cancel)
                    };
                    self.close_stream(stream_id, status, metadata, rst);
                }
            }
            return Ok(());
        }

        // Trailers.
        let (status, trailers) = parse_trailers(&headers);
        stream.deframer.close();
        stream.pending_close = Some((status, trailers));
        self.pump_stream(stream_id);
        Ok(())
    }

    fn handle_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), Status> {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => {
                // Credit data on dead streams right away so the connection
                // window doesn't leak.
                if let Some(increment) = self.conn_recv.bytes_processed(data.len()) {
                    self.writes.push(Frame::WindowUpdate {
                        stream_id: 0,
                        increment,
                    });
                }
                return Ok(());
            }
        };

        if !stream.headers_received {
            self.stream_error(
                stream_id,
                Status::internal("DATA received before response headers"),
            );
            return Ok(());
        }

        stream.deframer.feed(&data);
        if end_stream {
            stream.deframer.close();
        }
        self.pump_stream(stream_id);
        Ok(())
    }

    fn handle_goaway(
        &mut self,
        last_stream_id: StreamId,
        code: Http2ErrorCode,
    ) -> Result<(), Status> {
        self.goaway_received = Some(last_stream_id);

        let shutdown_status = if code == Http2ErrorCode::NoError {
            Status::unavailable("connection is being drained")
        } else {
            Status::unavailable(format!("connection aborted by peer: {:?}", code))
        };
        self.lifecycle.on_goaway(code, &shutdown_status);
        self.report_shutdown(&shutdown_status);

        // Streams the peer never processed are safe to fail (and for the
        // caller, safe to retry elsewhere). A stream whose id equals
        // last_stream_id was processed and completes normally.
        let abandoned: Vec<StreamId> = self
            .streams
            .keys()
            .copied()
            .filter(|id| *id > last_stream_id)
            .collect();
        for stream_id in abandoned {
            self.close_stream(
                stream_id,
                Status::unavailable(format!(
                    "stream abandoned by GOAWAY (last processed stream: {})",
                    last_stream_id
                )),
                Metadata::new(),
                None,
            );
        }
        Ok(())
    }

    fn handle_ping(&mut self, payload: [u8; 8], ack: bool) {
        if !ack {
            self.writes.push(Frame::Ping { payload, ack: true });
            return;
        }
        match self.ping.on_ack(payload) {
            PingAck::Matched(callbacks) => {
                for (callback, rtt) in callbacks {
                    callback(Ok(rtt));
                }
            }
            PingAck::Unexpected(payload) => {
                warn!(?payload, "PING ack with unexpected payload");
            }
        }
    }

    fn handle_settings(
        &mut self,
        initial_window_size: Option<u32>,
        ack: bool,
    ) -> Result<(), Status> {
        if ack {
            return Ok(());
        }

        if let Some(size) = initial_window_size {
            let delta = size as i64 - self.initial_send_window as i64;
            self.initial_send_window = size as WindowSize;
            let ids: Vec<StreamId> = self.streams.keys().copied().collect();
            for id in ids {
                if let Some(stream) = self.streams.get_mut(&id) {
                    if stream.send_window.adjust(delta).is_err() {
                        return Err(self.connection_error(
                            Http2ErrorCode::FlowControlError,
                            "SETTINGS overflowed a stream window",
                        ));
                    }
                }
                self.try_flush(id);
            }
        }

        self.writes.push(Frame::Settings {
            initial_window_size: None,
            max_concurrent_streams: None,
            ack: true,
        });
        Ok(())
    }

    fn handle_window_update(
        &mut self,
        stream_id: StreamId,
        increment: u32,
    ) -> Result<(), Status> {
        if stream_id == 0 {
            if self.conn_send.adjust(increment as i64).is_err() {
                return Err(self.connection_error(
                    Http2ErrorCode::FlowControlError,
                    "connection window overflow",
                ));
            }
            let ids: Vec<StreamId> = self.streams.keys().copied().collect();
            for id in ids {
                self.try_flush(id);
            }
        } else if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.send_window.adjust(increment as i64).is_err() {
                self.stream_error(
                    stream_id,
                    Status::internal("stream window overflow"),
                );
                return Ok(());
            }
            self.try_flush(stream_id);
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateStream { cell, args } => self.create_stream(cell, args),
            Command::SendMessage { cell, message } => {
                let stream_id = cell.id.load(Ordering::Acquire);
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    let frame = encode_frame(&message, false);
                    stream.send_buffer.extend_from_slice(&frame);
                    self.try_flush(stream_id);
                }
            }
            Command::HalfClose { cell } => {
                let stream_id = cell.id.load(Ordering::Acquire);
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.half_close_pending = true;
                    self.try_flush(stream_id);
                }
            }
            Command::Request { cell, n } => {
                let stream_id = cell.id.load(Ordering::Acquire);
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.deframer.request(n);
                    self.pump_stream(stream_id);
                }
            }
            Command::CancelStream { cell, status } => {
                let stream_id = cell.id.load(Ordering::Acquire);
                self.close_stream(
                    stream_id,
                    status,
                    Metadata::new(),
                    Some(Http2ErrorCode::Cancel),
                );
            }
            Command::Ping { callback } => {
                if let Some(payload) = self.ping.start(callback) {
                    self.writes.push(Frame::Ping {
                        payload,
                        ack: false,
                    });
                }
            }
            Command::Shutdown => {
                self.drain(Status::unavailable("transport shutdown invoked"));
            }
            Command::ShutdownNow { status } => {
                self.drain(status.clone());
                let ids: Vec<StreamId> = self.streams.keys().copied().collect();
                for id in ids {
                    self.close_stream(id, status.clone(), Metadata::new(), None);
                }
            }
        }
    }

    fn create_stream(&mut self, cell: Arc<StreamCell>, args: NewStreamArgs) {
        let mut listener = args.listener;

        if let Some(status) = &self.draining {
            listener.on_close(status.clone(), Metadata::new());
            return;
        }
        if self.goaway_received.is_some() {
            listener.on_close(
                Status::unavailable("connection is being drained"),
                Metadata::new(),
            );
            return;
        }

        let stream_id = self.next_stream_id;
        if stream_id > MAX_STREAM_ID {
            listener.on_close(
                Status::unavailable("Stream IDs have been exhausted"),
                Metadata::new(),
            );
            self.drain(Status::unavailable("Stream IDs have been exhausted"));
            return;
        }
        self.next_stream_id = stream_id.saturating_add(2);
        cell.id.store(stream_id, Ordering::Release);

        let headers = build_request_headers(RequestHeaders {
            method: args.method,
            authority: args.authority,
            scheme: self.options.scheme.clone(),
            timeout: args.timeout,
            user_agent: args.user_agent,
            message_encoding: args.message_encoding,
            metadata: args.metadata,
        });
        self.writes.push(Frame::Headers {
            stream_id,
            headers,
            end_stream: false,
        });

        let mut stream = ClientStream {
            listener,
            deframer: MessageDeframer::new(self.options.max_inbound_message_size),
            recv_window: ReceiveWindow::default(),
            send_window: SendWindow::new(self.initial_send_window),
            send_buffer: BytesMut::new(),
            half_close_pending: false,
            end_stream_sent: false,
            headers_received: false,
            pending_close: None,
        };
        stream.listener.on_ready();

        self.streams.insert(stream_id, stream);
        if self.streams.len() == 1 && !self.in_use {
            self.in_use = true;
            self.lifecycle.on_in_use(true);
        }
    }

    /// Starts refusing new streams and announces it to the peer. Existing
    /// streams run to completion.
    fn drain(&mut self, status: Status) {
        if self.draining.is_none() {
            self.draining = Some(status.clone());
            self.report_shutdown(&status);
        }
        if !self.goaway_enqueued {
            self.goaway_enqueued = true;
            // Clients never accept server initiated streams, so the last
            // processed remote stream is always 0.
            self.writes.push(Frame::GoAway {
                last_stream_id: 0,
                code: Http2ErrorCode::NoError,
                debug_data: Bytes::new(),
            });
        }
    }

    fn report_shutdown(&mut self, status: &Status) {
        if !self.shutdown_reported {
            self.shutdown_reported = true;
            self.lifecycle.on_shutdown(status);
        }
    }

    /// Delivers deframed messages (bounded by permits) and, once drained,
    /// the pending close.
    fn pump_stream(&mut self, stream_id: StreamId) {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        let mut deframe_error = None;
        loop {
            match stream.deframer.next() {
                Ok(Some(message)) => {
                    stream.listener.on_message(message.payload);
                }
                Ok(None) => break,
                Err(status) => {
                    deframe_error = Some(status);
                    break;
                }
            }
        }
        let processed = stream.deframer.take_processed_bytes();

        if let Some(status) = deframe_error {
            self.stream_error(stream_id, status);
            return;
        }

        if processed > 0 {
            if let Some(increment) = stream.recv_window.bytes_processed(processed) {
                self.writes.push(Frame::WindowUpdate {
                    stream_id,
                    increment,
                });
            }
            if let Some(increment) = self.conn_recv.bytes_processed(processed) {
                self.writes.push(Frame::WindowUpdate {
                    stream_id: 0,
                    increment,
                });
            }
        }

        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        if stream.deframer.is_drained() {
            match stream.pending_close.take() {
                Some((status, trailers)) => {
                    self.close_stream(stream_id, status, trailers, None);
                }
                // DATA carried END_STREAM but no trailers followed.
                None if stream.headers_received => {
                    self.close_stream(
                        stream_id,
                        Status::internal("stream closed without trailers"),
                        Metadata::new(),
                        None,
                    );
                }
                None => {}
            }
        }
    }

    /// Writes as much buffered data as the windows allow.
    fn try_flush(&mut self, stream_id: StreamId) {
        loop {
            let conn_available = self.conn_send.available().max(0) as usize;
            let stream = match self.streams.get_mut(&stream_id) {
                Some(stream) => stream,
                None => return,
            };

            if stream.send_buffer.is_empty() {
                if stream.half_close_pending && !stream.end_stream_sent {
                    stream.end_stream_sent = true;
                    self.writes.push(Frame::Data {
                        stream_id,
                        data: Bytes::new(),
                        end_stream: true,
                    });
                }
                return;
            }

            let stream_available = stream.send_window.available().max(0) as usize;
            let allowed = stream
                .send_buffer
                .len()
                .min(self.options.max_frame_size)
                .min(stream_available)
                .min(conn_available);
            if allowed == 0 {
                return;
            }

            stream.send_window.take(allowed);
            let chunk = stream.send_buffer.split_to(allowed).freeze();
            let end_stream = stream.half_close_pending && stream.send_buffer.is_empty();
            if end_stream {
                stream.end_stream_sent = true;
            }
            self.conn_send.take(allowed);
            self.writes.push(Frame::Data {
                stream_id,
                data: chunk,
                end_stream,
            });
            if end_stream {
                return;
            }
        }
    }

    /// Fails one stream with INTERNAL after a per-stream protocol
    /// violation, resetting it towards the peer.
    fn stream_error(&mut self, stream_id: StreamId, status: Status) {
        self.close_stream(
            stream_id,
            status,
            Metadata::new(),
            Some(Http2ErrorCode::InternalError),
        );
    }

    /// Escalates to a connection error: GOAWAY and failure of the whole
    /// connection (run loop tears everything down with the returned
    /// status).
    fn connection_error(&mut self, code: Http2ErrorCode, message: &str) -> Status {
        self.writes.push(Frame::GoAway {
            last_stream_id: 0,
            code,
            debug_data: Bytes::copy_from_slice(message.as_bytes()),
        });
        Status::internal(message.to_string())
    }

    /// Removes the stream and delivers its exactly-once on_close.
    fn close_stream(
        &mut self,
        stream_id: StreamId,
        status: Status,
        trailers: Metadata,
        rst: Option<Http2ErrorCode>,
    ) {
        let mut stream = match self.streams.remove(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        if let Some(code) = rst {
            self.writes.push(Frame::RstStream { stream_id, code });
        }
        stream.listener.on_close(status, trailers);

        if self.streams.is_empty() && self.in_use {
            self.in_use = false;
            self.lifecycle.on_in_use(false);
        }
    }

    fn terminate(mut self, result: Result<(), Status>) {
        let status = match &result {
            Ok(()) => Status::unavailable("connection closed"),
            Err(status) => status.clone(),
        };

        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            self.close_stream(id, status.clone(), Metadata::new(), None);
        }
        self.ping.fail(status.clone());

        self.report_shutdown(&status);
        self.lifecycle.on_terminated();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http2::pipe::pipe;
    use crate::status::Code;
    use crate::transport::NullLifecycle;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    #[derive(Debug)]
    enum Event {
        Headers(Metadata),
        Message(Bytes),
        Ready,
        Close(Status, Metadata),
    }

    struct ChannelListener {
        tx: UnboundedSender<Event>,
    }

    impl ClientStreamListener for ChannelListener {
        fn on_headers(&mut self, metadata: Metadata) {
            let _ = self.tx.send(Event::Headers(metadata));
        }
        fn on_message(&mut self, message: Bytes) {
            let _ = self.tx.send(Event::Message(message));
        }
        fn on_ready(&mut self) {
            let _ = self.tx.send(Event::Ready);
        }
        fn on_close(&mut self, status: Status, trailers: Metadata) {
            let _ = self.tx.send(Event::Close(status, trailers));
        }
    }

    fn listener() -> (Box<dyn ClientStreamListener>, UnboundedReceiver<Event>) {
        let (tx, rx) = unbounded_channel();
        (Box::new(ChannelListener { tx }), rx)
    }

    fn stream_args(listener: Box<dyn ClientStreamListener>) -> NewStreamArgs {
        NewStreamArgs {
            method: "pkg.Echo/Say".into(),
            authority: "example.com".into(),
            timeout: None,
            metadata: Metadata::new(),
            user_agent: "grpc-rust-h2/test".into(),
            message_encoding: None,
            listener,
        }
    }

    async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for listener event")
            .expect("listener channel closed")
    }

    /// Reads frames from the peer end until a HEADERS frame arrives,
    /// returning its stream id.
    async fn expect_request_headers(peer: &mut CodecPair) -> (StreamId, Vec<HeaderField>) {
        loop {
            match peer.receiver.recv().await.unwrap().unwrap() {
                Frame::Headers {
                    stream_id, headers, ..
                } => return (stream_id, headers),
                _ => continue,
            }
        }
    }

    fn ok_trailers(stream_id: StreamId) -> Frame {
        Frame::Headers {
            stream_id,
            headers: crate::http2::headers::build_trailers(
                &Status::OK,
                &Metadata::new(),
                false,
            ),
            end_stream: true,
        }
    }

    fn response_headers(stream_id: StreamId) -> Frame {
        Frame::Headers {
            stream_id,
            headers: crate::http2::headers::build_response_headers(&Metadata::new()),
            end_stream: false,
        }
    }

    #[tokio::test]
    async fn full_call_round_trip() {
        let (client_end, mut peer) = pipe();
        let transport = Http2ClientTransport::spawn(
            client_end,
            Http2Options::default(),
            Arc::new(NullLifecycle),
        );

        let (l, mut events) = listener();
        let handle = transport.new_stream(stream_args(l));
        handle.request(2);
        handle.send_message(Bytes::from_static(b"hi there"));
        handle.half_close();

        let (stream_id, headers) = expect_request_headers(&mut peer).await;
        assert_eq!(stream_id, 3);
        assert!(headers.iter().any(|h| h.name == ":path"
            && h.value_str() == Some("/pkg.Echo/Say")));

        // Collect DATA until end_stream; expect one framed message.
        let mut data = BytesMut::new();
        loop {
            match peer.receiver.recv().await.unwrap().unwrap() {
                Frame::Data {
                    data: chunk,
                    end_stream,
                    ..
                } => {
                    data.extend_from_slice(&chunk);
                    if end_stream {
                        break;
                    }
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(&data[..], &encode_frame(b"hi there", false)[..]);

        peer.sender.send(response_headers(stream_id)).await.unwrap();
        peer.sender
            .send(Frame::Data {
                stream_id,
                data: encode_frame(b"reply", false),
                end_stream: false,
            })
            .await
            .unwrap();
        peer.sender.send(ok_trailers(stream_id)).await.unwrap();

        assert!(matches!(next_event(&mut events).await, Event::Ready));
        assert!(matches!(next_event(&mut events).await, Event::Headers(_)));
        match next_event(&mut events).await {
            Event::Message(m) => assert_eq!(&m[..], b"reply"),
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut events).await {
            Event::Close(status, _) => assert!(status.is_ok()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn messages_wait_for_flow_control_permits() {
        let (client_end, mut peer) = pipe();
        let transport = Http2ClientTransport::spawn(
            client_end,
            Http2Options::default(),
            Arc::new(NullLifecycle),
        );

        let (l, mut events) = listener();
        let handle = transport.new_stream(stream_args(l));

        let (stream_id, _) = expect_request_headers(&mut peer).await;
        peer.sender.send(response_headers(stream_id)).await.unwrap();
        peer.sender
            .send(Frame::Data {
                stream_id,
                data: encode_frame(b"gated", false),
                end_stream: false,
            })
            .await
            .unwrap();

        assert!(matches!(next_event(&mut events).await, Event::Ready));
        assert!(matches!(next_event(&mut events).await, Event::Headers(_)));

        // No permit yet: nothing may be delivered.
        assert!(tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err());

        handle.request(1);
        match next_event(&mut events).await {
            Event::Message(m) => assert_eq!(&m[..], b"gated"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_ids_are_odd_and_increasing() {
        let (client_end, mut peer) = pipe();
        let transport = Http2ClientTransport::spawn(
            client_end,
            Http2Options::default(),
            Arc::new(NullLifecycle),
        );

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (l, _events) = listener();
            let _handle = transport.new_stream(stream_args(l));
            let (stream_id, _) = expect_request_headers(&mut peer).await;
            seen.push(stream_id);
        }
        assert_eq!(seen, vec![3, 5, 7]);
        assert!(seen.iter().all(|id| id % 2 == 1));
    }

    #[tokio::test]
    async fn exhausted_stream_ids_fail_and_send_goaway() {
        let (client_end, mut peer) = pipe();
        let mut options = Http2Options::default();
        options.initial_stream_id = MAX_STREAM_ID - 1;
        let transport =
            Http2ClientTransport::spawn(client_end, options, Arc::new(NullLifecycle));

        let (l1, _events1) = listener();
        let _h1 = transport.new_stream(stream_args(l1));
        let (first_id, _) = expect_request_headers(&mut peer).await;
        assert_eq!(first_id, MAX_STREAM_ID - 1);

        let (l2, mut events2) = listener();
        let _h2 = transport.new_stream(stream_args(l2));

        match next_event(&mut events2).await {
            Event::Close(status, _) => {
                assert_eq!(status.code(), Code::Unavailable);
                assert_eq!(
                    status.message(),
                    Some("Stream IDs have been exhausted")
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }

        loop {
            match peer.receiver.recv().await.unwrap().unwrap() {
                Frame::GoAway { code, .. } => {
                    assert_eq!(code, Http2ErrorCode::NoError);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn goaway_fails_streams_above_last_id_only() {
        let (client_end, mut peer) = pipe();
        let transport = Http2ClientTransport::spawn(
            client_end,
            Http2Options::default(),
            Arc::new(NullLifecycle),
        );

        let (l1, mut events1) = listener();
        let _h1 = transport.new_stream(stream_args(l1));
        let (id1, _) = expect_request_headers(&mut peer).await;
        let (l2, mut events2) = listener();
        let _h2 = transport.new_stream(stream_args(l2));
        let (id2, _) = expect_request_headers(&mut peer).await;
        assert_eq!((id1, id2), (3, 5));

        peer.sender
            .send(Frame::GoAway {
                last_stream_id: 3,
                code: Http2ErrorCode::NoError,
                debug_data: Bytes::new(),
            })
            .await
            .unwrap();

        assert!(matches!(next_event(&mut events2).await, Event::Ready));
        match next_event(&mut events2).await {
            Event::Close(status, _) => assert_eq!(status.code(), Code::Unavailable),
            other => panic!("unexpected event: {:?}", other),
        }

        // Stream 3 still completes normally.
        peer.sender.send(response_headers(id1)).await.unwrap();
        peer.sender.send(ok_trailers(id1)).await.unwrap();

        assert!(matches!(next_event(&mut events1).await, Event::Ready));
        assert!(matches!(next_event(&mut events1).await, Event::Headers(_)));
        match next_event(&mut events1).await {
            Event::Close(status, _) => assert!(status.is_ok()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_sends_rst_stream_and_closes_once() {
        let (client_end, mut peer) = pipe();
        let transport = Http2ClientTransport::spawn(
            client_end,
            Http2Options::default(),
            Arc::new(NullLifecycle),
        );

        let (l, mut events) = listener();
        let handle = transport.new_stream(stream_args(l));
        let (stream_id, _) = expect_request_headers(&mut peer).await;

        handle.cancel(Status::cancelled("caller gave up"));
        handle.cancel(Status::cancelled("second cancel is a no-op"));

        loop {
            match peer.receiver.recv().await.unwrap().unwrap() {
                Frame::RstStream {
                    stream_id: rst_id,
                    code,
                } => {
                    assert_eq!(rst_id, stream_id);
                    assert_eq!(code, Http2ErrorCode::Cancel);
                    break;
                }
                _ => continue,
            }
        }

        assert!(matches!(next_event(&mut events).await, Event::Ready));
        match next_event(&mut events).await {
            Event::Close(status, _) => {
                assert_eq!(status.code(), Code::Cancelled);
                assert_eq!(status.message(), Some("caller gave up"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // Exactly once: no further events.
        assert!(tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn bad_content_type_closes_with_unknown() {
        let (client_end, mut peer) = pipe();
        let transport = Http2ClientTransport::spawn(
            client_end,
            Http2Options::default(),
            Arc::new(NullLifecycle),
        );

        let (l, mut events) = listener();
        let _handle = transport.new_stream(stream_args(l));
        let (stream_id, _) = expect_request_headers(&mut peer).await;

        peer.sender
            .send(Frame::Headers {
                stream_id,
                headers: vec![
                    HeaderField::new(":status", "200"),
                    HeaderField::new("content-type", "application/bad"),
                ],
                end_stream: false,
            })
            .await
            .unwrap();

        assert!(matches!(next_event(&mut events).await, Event::Ready));
        match next_event(&mut events).await {
            Event::Close(status, metadata) => {
                assert_eq!(status.code(), Code::Unknown);
                assert!(status.message().unwrap().contains("content-type"));
                assert_eq!(metadata.get_ascii("content-type"), Some("application/bad"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // A later server OK must not produce a second close.
        peer.sender.send(ok_trailers(stream_id)).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn ping_round_trip_and_peer_ping_ack() {
        let (client_end, mut peer) = pipe();
        let transport = Http2ClientTransport::spawn(
            client_end,
            Http2Options::default(),
            Arc::new(NullLifecycle),
        );

        let (tx, mut rx) = unbounded_channel();
        transport.ping(Box::new(move |result| {
            let _ = tx.send(result);
        }));

        let payload = loop {
            match peer.receiver.recv().await.unwrap().unwrap() {
                Frame::Ping { payload, ack } => {
                    assert!(!ack);
                    break payload;
                }
                _ => continue,
            }
        };
        peer.sender
            .send(Frame::Ping { payload, ack: true })
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        // Peer-initiated ping is acked with the same payload.
        peer.sender
            .send(Frame::Ping {
                payload: [9; 8],
                ack: false,
            })
            .await
            .unwrap();
        loop {
            match peer.receiver.recv().await.unwrap().unwrap() {
                Frame::Ping { payload, ack } => {
                    assert!(ack);
                    assert_eq!(payload, [9; 8]);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn connection_loss_fails_active_streams() {
        let (client_end, peer) = pipe();
        let transport = Http2ClientTransport::spawn(
            client_end,
            Http2Options::default(),
            Arc::new(NullLifecycle),
        );

        let (l, mut events) = listener();
        let _handle = transport.new_stream(stream_args(l));
        assert!(matches!(next_event(&mut events).await, Event::Ready));

        drop(peer);

        match next_event(&mut events).await {
            Event::Close(status, _) => {
                assert_eq!(status.code(), Code::Unavailable);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn outbound_data_respects_peer_window() {
        let (client_end, mut peer) = pipe();
        let transport = Http2ClientTransport::spawn(
            client_end,
            Http2Options::default(),
            Arc::new(NullLifecycle),
        );

        // Shrink the stream window to 10 bytes via SETTINGS.
        peer.sender
            .send(Frame::Settings {
                initial_window_size: Some(10),
                max_concurrent_streams: None,
                ack: false,
            })
            .await
            .unwrap();

        // Wait for the settings ack so the new window is in effect before
        // the stream is created.
        loop {
            match peer.receiver.recv().await.unwrap().unwrap() {
                Frame::Settings { ack: true, .. } => break,
                _ => continue,
            }
        }

        let (l, _events) = listener();
        let handle = transport.new_stream(stream_args(l));
        handle.send_message(Bytes::from_static(b"0123456789abcdef"));

        let (stream_id, _) = expect_request_headers(&mut peer).await;

        // Only 10 bytes may flow.
        let first = loop {
            match peer.receiver.recv().await.unwrap().unwrap() {
                Frame::Data { data, .. } => break data,
                _ => continue,
            }
        };
        assert_eq!(first.len(), 10);

        // Window update releases the rest (5 byte header + 16 payload =
        // 21 framed bytes total).
        peer.sender
            .send(Frame::WindowUpdate {
                stream_id,
                increment: 100,
            })
            .await
            .unwrap();
        let second = loop {
            match peer.receiver.recv().await.unwrap().unwrap() {
                Frame::Data { data, .. } => break data,
                _ => continue,
            }
        };
        assert_eq!(second.len(), 11);
    }
}
