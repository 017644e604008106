use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use anyhow::Context;
use rustc_hash::FxHashMap;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, error, info, trace};

use crate::config::SudpConfig;
use crate::connection::Connection;
use crate::error::SudpError;
use crate::packet::MAX_PACKET_SIZE;
use crate::send_pipeline::AddressedSink;

/// Binds a UDP socket and accepts stream connections over it, one per
/// source address.
pub async fn listen(addr: impl ToSocketAddrs) -> anyhow::Result<Listener> {
    listen_with_config(addr, SudpConfig::default()).await
}

pub async fn listen_with_config(
    addr: impl ToSocketAddrs,
    config: SudpConfig,
) -> anyhow::Result<Listener> {
    config.validate()?;

    let socket = Arc::new(
        UdpSocket::bind(addr)
            .await
            .context("failed to bind the listen socket")?,
    );
    info!("listening on {:?}", socket.local_addr()?);

    let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue_capacity);
    let (closed, _) = watch::channel(false);
    let shared = Arc::new(ListenerShared {
        config,
        conns: StdMutex::new(FxHashMap::default()),
        closed,
        wakeup: Notify::new(),
        read_error: Arc::new(OnceLock::new()),
    });

    tokio::spawn(run_route_loop(socket.clone(), shared.clone(), accept_tx));

    Ok(Listener {
        socket,
        accept_rx: Mutex::new(accept_rx),
        shared,
    })
}

/// One UDP socket shared by every accepted connection. Inbound datagrams
/// are routed to the connection matching their source address; a fresh
/// source address becomes a new connection on the accept queue.
pub struct Listener {
    socket: Arc<UdpSocket>,
    accept_rx: Mutex<mpsc::Receiver<Connection>>,
    shared: Arc<ListenerShared>,
}

impl Listener {
    /// Waits for a connection from a previously unseen source address.
    pub async fn accept(&self) -> Result<Connection, SudpError> {
        let mut closed = self.shared.closed.subscribe();
        if *closed.borrow() {
            return Err(self.shared.close_error());
        }

        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            conn = accept_rx.recv() => match conn {
                Some(conn) => Ok(conn),
                // the route loop is gone, so the socket failed
                None => Err(self.shared.close_error()),
            },
            _ = closed.changed() => Err(self.shared.close_error()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Stops accepting new peers and fails pending `accept` calls.
    /// Existing connections keep running; the socket goes away once the
    /// last of them closes.
    pub fn close(&self) {
        self.shared.closed.send_replace(true);
        self.shared.wakeup.notify_one();
    }
}

struct ListenerShared {
    config: SudpConfig,
    /// inbound queue of every live connection, keyed by source address
    conns: StdMutex<FxHashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
    closed: watch::Sender<bool>,
    /// pokes the route loop to re-check its shutdown condition
    wakeup: Notify,
    /// the socket failure every connection inherits when reading stops
    read_error: Arc<OnceLock<SudpError>>,
}

impl ListenerShared {
    fn close_error(&self) -> SudpError {
        self.read_error
            .get()
            .cloned()
            .unwrap_or(SudpError::LocallyClosed)
    }

    fn unregister(&self, addr: SocketAddr) {
        debug!("removing connection for {:?}", addr);
        self.conns
            .lock()
            .expect("listener connection map poisoned")
            .remove(&addr);
        self.wakeup.notify_one();
    }

    fn should_stop(&self) -> bool {
        *self.closed.borrow()
            && self
                .conns
                .lock()
                .expect("listener connection map poisoned")
                .is_empty()
    }
}

async fn run_route_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<ListenerShared>,
    accept_tx: mpsc::Sender<Connection>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        if shared.should_stop() {
            debug!("listener closed and the last connection is gone, stopping");
            return;
        }

        let (len, from) = tokio::select! {
            _ = shared.wakeup.notified() => continue,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    error!("listen socket failed: {}", e);
                    let _ = shared.read_error.set(SudpError::Io(e.to_string()));
                    shared.closed.send_replace(true);
                    // dropping the senders ends every dispatcher with the
                    // latched error
                    shared
                        .conns
                        .lock()
                        .expect("listener connection map poisoned")
                        .clear();
                    return;
                }
            },
        };

        route_datagram(&socket, &shared, &accept_tx, buf[..len].to_vec(), from);
    }
}

fn route_datagram(
    socket: &Arc<UdpSocket>,
    shared: &Arc<ListenerShared>,
    accept_tx: &mpsc::Sender<Connection>,
    datagram: Vec<u8>,
    from: SocketAddr,
) {
    let mut conns = shared
        .conns
        .lock()
        .expect("listener connection map poisoned");

    if let Some(tx) = conns.get(&from) {
        if tx.try_send(datagram).is_err() {
            trace!("inbound queue for {:?} full, dropping datagram", from);
        }
        return;
    }

    if *shared.closed.borrow() {
        trace!("listener closed, ignoring new peer {:?}", from);
        return;
    }
    if accept_tx.capacity() == 0 {
        debug!("accept queue full, ignoring new peer {:?}", from);
        return;
    }

    debug!("new peer {:?}", from);
    let (tx, rx) = mpsc::channel(shared.config.inbound_queue_capacity);
    let conn = new_listener_connection(socket, shared, rx, from);
    // the route loop is the only sender, so the capacity check above makes
    // this send infallible
    if accept_tx.try_send(conn).is_ok() {
        let _ = tx.try_send(datagram);
        conns.insert(from, tx);
    }
}

fn new_listener_connection(
    socket: &Arc<UdpSocket>,
    shared: &Arc<ListenerShared>,
    inbound: mpsc::Receiver<Vec<u8>>,
    peer: SocketAddr,
) -> Connection {
    let sink = Arc::new(AddressedSink {
        socket: socket.clone(),
        peer,
    });
    let close_shared = shared.clone();
    let on_close: Box<dyn Fn() + Send + Sync> = Box::new(move || close_shared.unregister(peer));

    Connection::spawn(
        shared.config.clone(),
        inbound,
        shared.read_error.clone(),
        sink,
        Some(on_close),
        socket.local_addr().ok(),
        Some(peer),
    )
}
