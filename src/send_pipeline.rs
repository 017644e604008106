use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::SudpError;
use crate::packet::Packet;

/// Sends one encoded packet as one datagram.
///
/// This is the seam between the reliability machinery and the socket,
/// introduced so the machinery can be exercised against a mock in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait DatagramSink: Send + Sync + 'static {
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

/// Dialer side: the socket is connected to the peer.
pub(crate) struct ConnectedSink(pub Arc<UdpSocket>);

#[async_trait]
impl DatagramSink for ConnectedSink {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        trace!("sending {} bytes", buf.len());
        self.0.send(buf).await
    }
}

/// Listener side: the shared unconnected socket plus one peer's address.
pub(crate) struct AddressedSink {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
}

#[async_trait]
impl DatagramSink for AddressedSink {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        trace!("sending {} bytes to {:?}", buf.len(), self.peer);
        self.socket.send_to(buf, self.peer).await
    }
}

/// Sends already-encoded bytes, surfacing short writes as corruption.
pub(crate) async fn send_raw(sink: &dyn DatagramSink, buf: &[u8]) -> Result<(), SudpError> {
    let written = sink
        .send(buf)
        .await
        .map_err(|e| SudpError::Io(e.to_string()))?;
    if written != buf.len() {
        return Err(SudpError::PacketCorrupted);
    }
    Ok(())
}

/// Encodes and sends one packet.
pub(crate) async fn send_packet(sink: &dyn DatagramSink, packet: &Packet) -> Result<(), SudpError> {
    send_raw(sink, &packet.to_wire()).await
}

/// Collects every sent packet for later assertions.
#[cfg(test)]
pub(crate) struct RecordingSink {
    sent: std::sync::Mutex<Vec<Vec<u8>>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn new() -> Arc<RecordingSink> {
        Arc::new(RecordingSink {
            sent: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|buf| Packet::decode(bytes::Bytes::from(buf.clone())).expect("recorded datagrams are valid packets"))
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl DatagramSink for RecordingSink {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.sent.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }
}
