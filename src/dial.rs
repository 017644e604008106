use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Context};
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::config::SudpConfig;
use crate::connection::Connection;
use crate::error::SudpError;
use crate::packet::MAX_PACKET_SIZE;
use crate::send_pipeline::ConnectedSink;

/// Opens a connection to a listening peer.
///
/// There is no handshake on the wire: the first data packet is what makes
/// the peer's listener create its side of the connection.
pub async fn dial(addr: impl ToSocketAddrs) -> anyhow::Result<Connection> {
    dial_with_config(addr, SudpConfig::default()).await
}

pub async fn dial_with_config(
    addr: impl ToSocketAddrs,
    config: SudpConfig,
) -> anyhow::Result<Connection> {
    config.validate()?;

    let peer = lookup_host(addr)
        .await
        .context("failed to resolve the address")?
        .next()
        .ok_or_else(|| anyhow!("the address resolved to nothing"))?;

    let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = Arc::new(
        UdpSocket::bind(bind_addr)
            .await
            .context("failed to bind a local socket")?,
    );
    socket
        .connect(peer)
        .await
        .context("failed to connect the socket")?;
    info!("dialed {:?} from {:?}", peer, socket.local_addr()?);

    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity);
    let read_error = Arc::new(OnceLock::new());
    tokio::spawn(run_socket_reader(
        socket.clone(),
        inbound_tx,
        read_error.clone(),
    ));

    let local_addr = socket.local_addr().ok();
    Ok(Connection::spawn(
        config,
        inbound_rx,
        read_error,
        Arc::new(ConnectedSink(socket)),
        None,
        local_addr,
        Some(peer),
    ))
}

/// Moves datagrams from the socket into the connection's inbound queue,
/// dropping them when the dispatcher falls behind - retransmission covers
/// the loss.
async fn run_socket_reader(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<Vec<u8>>,
    read_error: Arc<OnceLock<SudpError>>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let received = tokio::select! {
            _ = tx.closed() => return,
            received = socket.recv(&mut buf) => received,
        };
        match received {
            Ok(len) => match tx.try_send(buf[..len].to_vec()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!("inbound queue full, dropping datagram");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            },
            Err(e) => {
                debug!("socket read failed: {}", e);
                let _ = read_error.set(SudpError::Io(e.to_string()));
                return;
            }
        }
    }
}
