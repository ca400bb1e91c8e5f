//! In-memory frame transport connecting a client and a server codec end
//! back to back. Used by tests that exercise connection behavior without a
//! real framing codec underneath.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::http2::codec::{CodecError, CodecPair, Frame, FrameReceiver, FrameSender};

pub struct PipeSender {
    tx: mpsc::Sender<Frame>,
}

pub struct PipeReceiver {
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameSender for PipeSender {
    async fn send(&mut self, frame: Frame) -> Result<(), CodecError> {
        self.tx.send(frame).await.map_err(|_| {
            CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer closed",
            ))
        })
    }
}

#[async_trait]
impl FrameReceiver for PipeReceiver {
    async fn recv(&mut self) -> Result<Option<Frame>, CodecError> {
        // mpsc recv is cancel safe, which makes the whole pipe end cancel
        // safe as required by the codec contract.
        Ok(self.rx.recv().await)
    }
}

/// Two connected codec ends. Frames sent through one end arrive at the
/// other in order. Dropping an end surfaces as connection closure on the
/// peer.
pub fn pipe() -> (CodecPair, CodecPair) {
    let (a_tx, b_rx) = mpsc::channel(64);
    let (b_tx, a_rx) = mpsc::channel(64);

    let a = CodecPair {
        receiver: Box::new(PipeReceiver { rx: a_rx }),
        sender: Box::new(PipeSender { tx: a_tx }),
    };
    let b = CodecPair {
        receiver: Box::new(PipeReceiver { rx: b_rx }),
        sender: Box::new(PipeSender { tx: b_tx }),
    };
    (a, b)
}

/// Dials in-memory connections: every connect() yields a fresh pipe whose
/// far end pops out of the paired PipeAcceptor.
pub struct PipeConnector {
    tx: mpsc::Sender<CodecPair>,
}

/// Accepts the connections made by the paired PipeConnector.
pub struct PipeAcceptor {
    rx: mpsc::Receiver<CodecPair>,
}

#[async_trait]
impl crate::transport::Connector for PipeConnector {
    async fn connect(
        &self,
        _address: std::net::SocketAddr,
    ) -> Result<CodecPair, crate::status::Status> {
        let (ours, theirs) = pipe();
        self.tx
            .send(theirs)
            .await
            .map_err(|_| crate::status::Status::unavailable("pipe listener closed"))?;
        Ok(ours)
    }
}

#[async_trait]
impl crate::transport::TransportAcceptor for PipeAcceptor {
    async fn accept(&mut self) -> Result<CodecPair, crate::status::Status> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| crate::status::Status::unavailable("pipe connector closed"))
    }
}

/// A connector/acceptor pair joined back to back, standing in for a real
/// network listener.
pub fn link() -> (PipeConnector, PipeAcceptor) {
    let (tx, rx) = mpsc::channel(16);
    (PipeConnector { tx }, PipeAcceptor { rx })
}
