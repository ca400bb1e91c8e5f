use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::framing::{encode_frame, MessageDeframer};
use crate::http2::client::Http2Options;
use crate::http2::codec::{CodecPair, Frame, FrameSender, HeaderField};
use crate::http2::flow_control::{ReceiveWindow, SendWindow};
use crate::http2::headers::{build_response_headers, build_trailers, parse_request_headers};
use crate::http2::types::{Http2ErrorCode, StreamId, WindowSize, DEFAULT_WINDOW_SIZE};
use crate::metadata::Metadata;
use crate::status::Status;
use crate::transport::{ServerStreamHandle, ServerStreamListener, ServerTransportListener};

enum Command {
    SendHeaders {
        stream_id: StreamId,
        metadata: Metadata,
    },
    SendMessage {
        stream_id: StreamId,
        message: Bytes,
    },
    Close {
        stream_id: StreamId,
        status: Status,
        trailers: Metadata,
    },
    CancelStream {
        stream_id: StreamId,
        status: Status,
    },
    Request {
        stream_id: StreamId,
        n: u32,
    },
    Shutdown,
    ShutdownNow {
        status: Status,
    },
}

/// Server side gRPC transport over one accepted HTTP/2 connection.
///
/// Mirrors the client handler: one connection task owns all state, fed by
/// codec frames and a command queue.
pub struct Http2ServerTransport {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl Http2ServerTransport {
    pub fn spawn(
        codec: CodecPair,
        options: Http2Options,
        listener: Box<dyn ServerTransportListener>,
    ) -> Arc<Http2ServerTransport> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let connection = ServerConnection {
            options,
            listener,
            command_tx: command_tx.clone(),
            streams: HashMap::new(),
            last_stream_id: 0,
            draining: false,
            goaway_enqueued: false,
            te_warned: false,
            conn_recv: ReceiveWindow::default(),
            conn_send: SendWindow::default(),
            initial_send_window: DEFAULT_WINDOW_SIZE,
            writes: Vec::new(),
            force_close: false,
        };

        tokio::spawn(run_connection(codec, command_rx, connection));

        Arc::new(Http2ServerTransport { command_tx })
    }

    /// Graceful: stops accepting new streams, serves the rest out.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }

    /// Abrupt: resets every stream and closes the connection.
    pub fn shutdown_now(&self, status: Status) {
        let _ = self.command_tx.send(Command::ShutdownNow { status });
    }
}

struct ServerStreamHandleImpl {
    stream_id: StreamId,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl ServerStreamHandle for ServerStreamHandleImpl {
    fn send_headers(&self, metadata: Metadata) {
        let _ = self.command_tx.send(Command::SendHeaders {
            stream_id: self.stream_id,
            metadata,
        });
    }

    fn send_message(&self, message: Bytes) {
        let _ = self.command_tx.send(Command::SendMessage {
            stream_id: self.stream_id,
            message,
        });
    }

    fn close(&self, status: Status, trailers: Metadata) {
        let _ = self.command_tx.send(Command::Close {
            stream_id: self.stream_id,
            status,
            trailers,
        });
    }

    fn cancel(&self, status: Status) {
        let _ = self.command_tx.send(Command::CancelStream {
            stream_id: self.stream_id,
            status,
        });
    }

    fn request(&self, n: u32) {
        let _ = self.command_tx.send(Command::Request {
            stream_id: self.stream_id,
            n,
        });
    }
}

struct ServerStream {
    listener: Box<dyn ServerStreamListener>,
    deframer: MessageDeframer,
    recv_window: ReceiveWindow,
    send_window: SendWindow,
    send_buffer: BytesMut,
    headers_sent: bool,
    /// Trailers waiting behind window-blocked DATA.
    pending_trailers: Option<Vec<HeaderField>>,
    half_close_delivered: bool,
}

struct ServerConnection {
    options: Http2Options,
    listener: Box<dyn ServerTransportListener>,
    command_tx: mpsc::UnboundedSender<Command>,
    streams: HashMap<StreamId, ServerStream>,
    last_stream_id: StreamId,
    draining: bool,
    goaway_enqueued: bool,
    te_warned: bool,
    conn_recv: ReceiveWindow,
    conn_send: SendWindow,
    initial_send_window: WindowSize,
    writes: Vec<Frame>,
    force_close: bool,
}

async fn run_connection(
    codec: CodecPair,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    mut conn: ServerConnection,
) {
    let CodecPair {
        mut receiver,
        mut sender,
    } = codec;

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
                }
            },
        }
    };

    let _ = flush_writes(&mut sender, &mut conn).await;
    conn.terminate(result);
}

async fn flush_writes(
    sender: &mut Box<dyn FrameSender>,
    conn: &mut ServerConnection,
) -> Result<(), Status> {
    for frame in std::mem::take(&mut conn.writes) {
        sender
            .send(frame)
            .await
            .map_err(|e| Status::unavailable("connection write failure").with_cause(e))?;
    }
    Ok(())
}

impl ServerConnection {
    fn finished(&self) -> bool {
        self.force_close || (self.draining && self.streams.is_empty())
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
            Frame::RstStream { stream_id, .. } => {
                // The client walked away; report it upward and send
                // nothing further on this stream.
                self.finish_stream_abnormally(
                    stream_id,
                    Status::cancelled("stream reset by client"),
                    None,
                );
                Ok(())
            }
            Frame::GoAway { .. } => {
                // The client will not open further streams. Existing ones
                // run to completion; nothing to write.
                self.draining = true;
                Ok(())
            }
            Frame::Ping { payload, ack } => {
                if !ack {
                    self.writes.push(Frame::Ping { payload, ack: true });
                } else {
                    debug!("ignoring unsolicited PING ack");
                }
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
        if self.streams.contains_key(&stream_id) {
            // gRPC clients never send trailing headers; a second HEADERS
            // frame is a per-stream protocol violation.
            self.finish_stream_abnormally(
                stream_id,
                Status::internal("unexpected trailing headers from client"),
                Some(Http2ErrorCode::ProtocolError),
            );
            return Ok(());
        }

        // New stream: client initiated ids are odd and increasing.
        if stream_id % 2 == 0 || stream_id <= self.last_stream_id {
            return Err(self.connection_error(
                Http2ErrorCode::ProtocolError,
                &format!("invalid client stream id {}", stream_id),
            ));
        }

        if self.draining {
            self.writes.push(Frame::RstStream {
                stream_id,
                code: Http2ErrorCode::RefusedStream,
            });
            return Ok(());
        }

        let parsed = match parse_request_headers(&headers) {
            Ok(parsed) => parsed,
            Err(rejection) => {
                debug!(stream_id, reason = %rejection.reason, "refusing stream");
                self.writes.push(Frame::RstStream {
                    stream_id,
                    code: Http2ErrorCode::RefusedStream,
                });
                return Ok(());
            }
        };

        if parsed.te_missing && !self.te_warned {
            // Intermediate proxies strip 'te'; log once per connection
            // rather than reject.
            self.te_warned = true;
            warn!("inbound request stream without 'te: trailers' header");
        }

        self.last_stream_id = stream_id;

        let handle = Box::new(ServerStreamHandleImpl {
            stream_id,
            command_tx: self.command_tx.clone(),
        });
        let stream_listener = self
            .listener
            .stream_created(handle, parsed.method, parsed.metadata);

        let mut stream = ServerStream {
            listener: stream_listener,
            deframer: MessageDeframer::new(self.options.max_inbound_message_size),
            recv_window: ReceiveWindow::default(),
            send_window: SendWindow::new(self.initial_send_window),
            send_buffer: BytesMut::new(),
            headers_sent: false,
            pending_trailers: None,
            half_close_delivered: false,
        };
        stream.listener.on_ready();
        if end_stream {
            stream.deframer.close();
        }
        self.streams.insert(stream_id, stream);

        if end_stream {
            self.pump_stream(stream_id);
        }
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
                if let Some(increment) = self.conn_recv.bytes_processed(data.len()) {
                    self.writes.push(Frame::WindowUpdate {
                        stream_id: 0,
                        increment,
                    });
                }
                return Ok(());
            }
        };

        stream.deframer.feed(&data);
        if end_stream {
            stream.deframer.close();
        }
        self.pump_stream(stream_id);
        Ok(())
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
                self.finish_stream_abnormally(
                    stream_id,
                    Status::internal("stream window overflow"),
                    Some(Http2ErrorCode::FlowControlError),
                );
                return Ok(());
            }
            self.try_flush(stream_id);
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendHeaders {
                stream_id,
                metadata,
            } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    if !stream.headers_sent {
                        stream.headers_sent = true;
                        self.writes.push(Frame::Headers {
                            stream_id,
                            headers: build_response_headers(&metadata),
                            end_stream: false,
                        });
                    }
                }
            }
            Command::SendMessage { stream_id, message } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    let frame = encode_frame(&message, false);
                    stream.send_buffer.extend_from_slice(&frame);
                    self.try_flush(stream_id);
                }
            }
            Command::Close {
                stream_id,
                status,
                trailers,
            } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    if stream.pending_trailers.is_some() {
                        return;
                    }
                    let trailers_only = !stream.headers_sent;
                    stream.pending_trailers =
                        Some(build_trailers(&status, &trailers, trailers_only));
                    self.try_flush(stream_id);
                }
            }
            Command::CancelStream { stream_id, status } => {
                self.finish_stream_abnormally(
                    stream_id,
                    status,
                    Some(Http2ErrorCode::Cancel),
                );
            }
            Command::Request { stream_id, n } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.deframer.request(n);
                    self.pump_stream(stream_id);
                }
            }
            Command::Shutdown => {
                self.draining = true;
                if !self.goaway_enqueued {
                    self.goaway_enqueued = true;
                    self.writes.push(Frame::GoAway {
                        last_stream_id: self.last_stream_id,
                        code: Http2ErrorCode::NoError,
                        debug_data: Bytes::new(),
                    });
                }
            }
            Command::ShutdownNow { status } => {
                self.draining = true;
                if !self.goaway_enqueued {
                    self.goaway_enqueued = true;
                    self.writes.push(Frame::GoAway {
                        last_stream_id: self.last_stream_id,
                        code: Http2ErrorCode::NoError,
                        debug_data: Bytes::new(),
                    });
                }
                let ids: Vec<StreamId> = self.streams.keys().copied().collect();
                for id in ids {
                    self.finish_stream_abnormally(
                        id,
                        status.clone(),
                        Some(Http2ErrorCode::Cancel),
                    );
                }
                self.force_close = true;
            }
        }
    }

    /// Delivers deframed inbound messages, then the half-close once the
    /// client's END_STREAM has been consumed.
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
            self.finish_stream_abnormally(
                stream_id,
                status,
                Some(Http2ErrorCode::InternalError),
            );
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
        if stream.deframer.is_drained() && !stream.half_close_delivered {
            stream.half_close_delivered = true;
            stream.listener.on_half_close();
        }
    }

    /// Flushes buffered DATA within the windows, then any pending
    /// trailers. A stream whose trailers were flushed completes and is
    /// removed.
    fn try_flush(&mut self, stream_id: StreamId) {
        loop {
            let conn_available = self.conn_send.available().max(0) as usize;
            let stream = match self.streams.get_mut(&stream_id) {
                Some(stream) => stream,
                None => return,
            };

            if stream.send_buffer.is_empty() {
                if let Some(trailers) = stream.pending_trailers.take() {
                    self.writes.push(Frame::Headers {
                        stream_id,
                        headers: trailers,
                        end_stream: true,
                    });
                    let mut stream = self.streams.remove(&stream_id).unwrap();
                    stream.listener.on_complete();
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
            self.conn_send.take(allowed);
            self.writes.push(Frame::Data {
                stream_id,
                data: chunk,
                end_stream: false,
            });
        }
    }

    /// Removes a stream without completing it: reports on_cancel and
    /// optionally resets towards the client.
    fn finish_stream_abnormally(
        &mut self,
        stream_id: StreamId,
        status: Status,
        rst: Option<Http2ErrorCode>,
    ) {
        let mut stream = match self.streams.remove(&stream_id) {
            Some(stream) => stream,
            None => return,
        };
        if let Some(code) = rst {
            self.writes.push(Frame::RstStream { stream_id, code });
        }
        stream.listener.on_cancel(status);
    }

    /// Escalates to a connection error: the GOAWAY is flushed and the run
    /// loop fails the connection with the returned status.
    fn connection_error(&mut self, code: Http2ErrorCode, message: &str) -> Status {
        self.writes.push(Frame::GoAway {
            last_stream_id: self.last_stream_id,
            code,
            debug_data: Bytes::copy_from_slice(message.as_bytes()),
        });
        Status::internal(message.to_string())
    }

    fn terminate(mut self, result: Result<(), Status>) {
        let status = match &result {
            Ok(()) => Status::unavailable("connection closed"),
            Err(status) => status.clone(),
        };

        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            self.finish_stream_abnormally(id, status.clone(), None);
        }
        self.listener.transport_terminated();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http2::headers::{build_request_headers, RequestHeaders};
    use crate::http2::pipe::pipe;
    use crate::status::Code;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    #[derive(Debug)]
    enum Event {
        Stream(String, Metadata),
        Message(Bytes),
        HalfClose,
        Cancel(Status),
        Complete,
        TransportTerminated,
    }

    struct TestStreamListener {
        tx: UnboundedSender<Event>,
    }

    impl ServerStreamListener for TestStreamListener {
        fn on_message(&mut self, message: Bytes) {
            let _ = self.tx.send(Event::Message(message));
        }
        fn on_half_close(&mut self) {
            let _ = self.tx.send(Event::HalfClose);
        }
        fn on_ready(&mut self) {}
        fn on_cancel(&mut self, status: Status) {
            let _ = self.tx.send(Event::Cancel(status));
        }
        fn on_complete(&mut self) {
            let _ = self.tx.send(Event::Complete);
        }
    }

    struct TestTransportListener {
        events: UnboundedSender<Event>,
        handles: UnboundedSender<Box<dyn ServerStreamHandle>>,
    }

    impl ServerTransportListener for TestTransportListener {
        fn stream_created(
            &mut self,
            stream: Box<dyn ServerStreamHandle>,
            method: String,
            metadata: Metadata,
        ) -> Box<dyn ServerStreamListener> {
            let _ = self.events.send(Event::Stream(method, metadata));
            let _ = self.handles.send(stream);
            Box::new(TestStreamListener {
                tx: self.events.clone(),
            })
        }

        fn transport_terminated(&mut self) {
            let _ = self.events.send(Event::TransportTerminated);
        }
    }

    struct Harness {
        peer: CodecPair,
        events: UnboundedReceiver<Event>,
        handles: UnboundedReceiver<Box<dyn ServerStreamHandle>>,
        transport: Arc<Http2ServerTransport>,
    }

    fn start_server() -> Harness {
        let (server_end, peer) = pipe();
        let (events_tx, events) = unbounded_channel();
        let (handles_tx, handles) = unbounded_channel();
        let transport = Http2ServerTransport::spawn(
            server_end,
            Http2Options::default(),
            Box::new(TestTransportListener {
                events: events_tx,
                handles: handles_tx,
            }),
        );
        Harness {
            peer,
            events,
            handles,
            transport,
        }
    }

    async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for server event")
            .expect("event channel closed")
    }

    fn request_headers(method: &str) -> Vec<HeaderField> {
        build_request_headers(RequestHeaders {
            method: method.to_string(),
            authority: "example.com".to_string(),
            scheme: "http".to_string(),
            timeout: None,
            user_agent: "grpc-rust-h2/test".to_string(),
            message_encoding: None,
            metadata: Metadata::new(),
        })
    }

    #[tokio::test]
    async fn dispatches_valid_request_and_completes_response() {
        let mut h = start_server();

        h.peer
            .sender
            .send(Frame::Headers {
                stream_id: 3,
                headers: request_headers("pkg.Echo/Say"),
                end_stream: false,
            })
            .await
            .unwrap();
        h.peer
            .sender
            .send(Frame::Data {
                stream_id: 3,
                data: encode_frame(b"question", false),
                end_stream: true,
            })
            .await
            .unwrap();

        match next_event(&mut h.events).await {
            Event::Stream(method, _) => assert_eq!(method, "pkg.Echo/Say"),
            other => panic!("unexpected event: {:?}", other),
        }
        let handle = h.handles.recv().await.unwrap();

        handle.request(1);
        match next_event(&mut h.events).await {
            Event::Message(m) => assert_eq!(&m[..], b"question"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(next_event(&mut h.events).await, Event::HalfClose));

        handle.send_headers(Metadata::new());
        handle.send_message(Bytes::from_static(b"answer"));
        handle.close(Status::OK, Metadata::new());

        // Response headers, data, then trailers with grpc-status 0.
        match h.peer.receiver.recv().await.unwrap().unwrap() {
            Frame::Headers {
                headers,
                end_stream,
                ..
            } => {
                assert!(!end_stream);
                assert!(headers
                    .iter()
                    .any(|f| f.name == ":status" && f.value_str() == Some("200")));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        match h.peer.receiver.recv().await.unwrap().unwrap() {
            Frame::Data { data, .. } => {
                assert_eq!(&data[..], &encode_frame(b"answer", false)[..]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        match h.peer.receiver.recv().await.unwrap().unwrap() {
            Frame::Headers {
                headers,
                end_stream,
                ..
            } => {
                assert!(end_stream);
                assert!(headers
                    .iter()
                    .any(|f| f.name == "grpc-status" && f.value_str() == Some("0")));
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        assert!(matches!(next_event(&mut h.events).await, Event::Complete));
    }

    #[tokio::test]
    async fn missing_content_type_is_refused_without_dispatch() {
        let mut h = start_server();

        let headers: Vec<HeaderField> = request_headers("pkg.Echo/Say")
            .into_iter()
            .filter(|f| f.name != "content-type")
            .collect();
        h.peer
            .sender
            .send(Frame::Headers {
                stream_id: 3,
                headers,
                end_stream: false,
            })
            .await
            .unwrap();

        match h.peer.receiver.recv().await.unwrap().unwrap() {
            Frame::RstStream { stream_id, code } => {
                assert_eq!(stream_id, 3);
                assert_eq!(code, Http2ErrorCode::RefusedStream);
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // No method dispatch happened.
        assert!(
            tokio::time::timeout(Duration::from_millis(100), h.events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn non_post_method_is_refused() {
        let mut h = start_server();

        let mut headers = request_headers("pkg.Echo/Say");
        headers[0] = HeaderField::new(":method", "GET");
        h.peer
            .sender
            .send(Frame::Headers {
                stream_id: 3,
                headers,
                end_stream: false,
            })
            .await
            .unwrap();

        match h.peer.receiver.recv().await.unwrap().unwrap() {
            Frame::RstStream { code, .. } => {
                assert_eq!(code, Http2ErrorCode::RefusedStream)
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn client_rst_reports_cancelled_and_stays_quiet() {
        let mut h = start_server();

        h.peer
            .sender
            .send(Frame::Headers {
                stream_id: 3,
                headers: request_headers("pkg.Echo/Say"),
                end_stream: false,
            })
            .await
            .unwrap();
        assert!(matches!(next_event(&mut h.events).await, Event::Stream(..)));
        let _handle = h.handles.recv().await.unwrap();

        h.peer
            .sender
            .send(Frame::RstStream {
                stream_id: 3,
                code: Http2ErrorCode::Cancel,
            })
            .await
            .unwrap();

        match next_event(&mut h.events).await {
            Event::Cancel(status) => assert_eq!(status.code(), Code::Cancelled),
            other => panic!("unexpected event: {:?}", other),
        }

        // Ping to force a round trip; the only reply must be the ping ack
        // (no RST or other frame was sent for the dead stream).
        h.peer
            .sender
            .send(Frame::Ping {
                payload: [5; 8],
                ack: false,
            })
            .await
            .unwrap();
        match h.peer.receiver.recv().await.unwrap().unwrap() {
            Frame::Ping { ack: true, .. } => {}
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn trailers_only_response() {
        let mut h = start_server();

        h.peer
            .sender
            .send(Frame::Headers {
                stream_id: 3,
                headers: request_headers("pkg.Echo/Say"),
                end_stream: true,
            })
            .await
            .unwrap();
        assert!(matches!(next_event(&mut h.events).await, Event::Stream(..)));
        assert!(matches!(next_event(&mut h.events).await, Event::HalfClose));
        let handle = h.handles.recv().await.unwrap();

        handle.close(
            Status::unimplemented("Method not found: pkg.Echo/Say"),
            Metadata::new(),
        );

        match h.peer.receiver.recv().await.unwrap().unwrap() {
            Frame::Headers {
                headers,
                end_stream,
                ..
            } => {
                assert!(end_stream);
                assert!(headers
                    .iter()
                    .any(|f| f.name == ":status" && f.value_str() == Some("200")));
                assert!(headers.iter().any(|f| f.name == "grpc-status"
                    && f.value_str() == Some("12")));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(matches!(next_event(&mut h.events).await, Event::Complete));
    }

    #[tokio::test]
    async fn connection_loss_fails_streams_with_unavailable() {
        let mut h = start_server();

        h.peer
            .sender
            .send(Frame::Headers {
                stream_id: 3,
                headers: request_headers("pkg.Echo/Say"),
                end_stream: false,
            })
            .await
            .unwrap();
        assert!(matches!(next_event(&mut h.events).await, Event::Stream(..)));

        drop(h.peer);

        match next_event(&mut h.events).await {
            Event::Cancel(status) => {
                assert_eq!(status.code(), Code::Unavailable);
                assert_eq!(
                    status.message(),
                    Some("connection terminated for unknown reason")
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            next_event(&mut h.events).await,
            Event::TransportTerminated
        ));
    }

    #[tokio::test]
    async fn shutdown_now_resets_streams_and_closes() {
        let mut h = start_server();

        h.peer
            .sender
            .send(Frame::Headers {
                stream_id: 3,
                headers: request_headers("pkg.Echo/Say"),
                end_stream: false,
            })
            .await
            .unwrap();
        assert!(matches!(next_event(&mut h.events).await, Event::Stream(..)));

        h.transport
            .shutdown_now(Status::unavailable("server shutdown now"));

        match next_event(&mut h.events).await {
            Event::Cancel(status) => assert_eq!(status.code(), Code::Unavailable),
            other => panic!("unexpected event: {:?}", other),
        }

        // GOAWAY then RST_STREAM reach the client before the close.
        let mut saw_goaway = false;
        let mut saw_rst = false;
        while let Ok(Some(frame)) = h.peer.receiver.recv().await {
            match frame {
                Frame::GoAway { .. } => saw_goaway = true,
                Frame::RstStream { .. } => saw_rst = true,
                _ => {}
            }
        }
        assert!(saw_goaway && saw_rst);
        assert!(matches!(
            next_event(&mut h.events).await,
            Event::TransportTerminated
        ));
    }
}
