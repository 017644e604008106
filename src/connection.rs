use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};

use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::byte_queue::{byte_queue, ByteQueueReader, ByteQueueWriter};
use crate::config::SudpConfig;
use crate::error::SudpError;
use crate::packet::{
    close_connection_packet, decode_received_ranges, Command, Packet, MAX_ACK_RANGES,
};
use crate::range_set::{PacketRange, RangeSet};
use crate::send_group::{PeerAcked, SendGroup};
use crate::send_pipeline::{send_packet, DatagramSink};
use crate::sequencer::ReceiveSequencer;
use crate::timer::TimerPair;

/// A reliable, ordered byte-stream connection multiplexed over UDP.
///
/// Connections are produced by [`crate::dial`] or [`crate::Listener::accept`].
/// All methods take `&self`; reads serialize on an internal lock.
pub struct Connection {
    shared: Arc<ConnShared>,
    reader: Mutex<ByteQueueReader>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl Connection {
    /// Wires up a connection over an inbound datagram queue and an outbound
    /// sink, and starts its dispatcher.
    ///
    /// `inbound_error` carries the socket error when the producer side ends
    /// the queue.
    pub(crate) fn spawn(
        config: SudpConfig,
        inbound: mpsc::Receiver<Vec<u8>>,
        inbound_error: Arc<OnceLock<SudpError>>,
        sink: Arc<dyn DatagramSink>,
        on_close: Option<Box<dyn Fn() + Send + Sync>>,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Connection {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (writer, reader) = byte_queue(config.read_queue_capacity);

        let ack_short = config.ack_short_delay;
        let ack_long = config.ack_long_delay;
        let shared = Arc::new_cyclic(|weak: &Weak<ConnShared>| {
            let timer_shared = weak.clone();
            let ack_timers = TimerPair::spawn(ack_short, ack_long, false, false, move || {
                let shared = timer_shared.clone();
                async move {
                    if let Some(shared) = shared.upgrade() {
                        shared.emit_received_ranges_or_close().await;
                    }
                }
            });

            ConnShared {
                config,
                sink,
                close_cell: CloseCell::default(),
                on_close,
                stop_tx,
                peer_acked: Arc::new(RwLock::new(PeerAcked::default())),
                last_group: Mutex::new(None),
                received: StdMutex::new(RangeSet::new()),
                ack_timers,
            }
        });

        tokio::spawn(run_dispatcher(
            shared.clone(),
            inbound,
            inbound_error,
            writer,
            stop_rx,
        ));

        Connection {
            shared,
            reader: Mutex::new(reader),
            local_addr,
            peer_addr,
        }
    }

    /// Reads into `dst`, waiting when no data is buffered. Once the
    /// connection is closed every read returns the close reason.
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize, SudpError> {
        if let Some(reason) = self.shared.close_reason() {
            return Err(reason);
        }
        self.reader.lock().await.read(dst).await
    }

    /// Sends all of `src` as consecutively numbered data packets. Once the
    /// connection is closed every write returns the close reason.
    pub async fn write(&self, src: &[u8]) -> Result<usize, SudpError> {
        if let Some(reason) = self.shared.close_reason() {
            return Err(reason);
        }

        let result = self.shared.append_with_rotation(src).await;
        if let Err(e) = &result {
            let _ = self.shared.close(e.clone(), false, true).await;
        }
        result
    }

    /// Closes the connection: tells the peer once, stops retransmission and
    /// fails subsequent reads and writes with [`SudpError::LocallyClosed`].
    /// Closing an already-closed connection is a no-op.
    pub async fn close(&self) -> Result<(), SudpError> {
        self.shared
            .close(SudpError::LocallyClosed, true, true)
            .await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Deadlines are not supported by this transport.
    pub fn set_deadline(&self, _deadline: std::time::Instant) -> Result<(), SudpError> {
        Err(SudpError::Unsupported)
    }

    /// Deadlines are not supported by this transport.
    pub fn set_read_deadline(&self, _deadline: std::time::Instant) -> Result<(), SudpError> {
        Err(SudpError::Unsupported)
    }

    /// Deadlines are not supported by this transport.
    pub fn set_write_deadline(&self, _deadline: std::time::Instant) -> Result<(), SudpError> {
        Err(SudpError::Unsupported)
    }
}

struct ConnShared {
    config: SudpConfig,
    sink: Arc<dyn DatagramSink>,
    close_cell: CloseCell,
    on_close: Option<Box<dyn Fn() + Send + Sync>>,
    /// one-shot broadcast telling every group to stop retransmitting
    stop_tx: watch::Sender<bool>,

    // outbound side
    peer_acked: Arc<RwLock<PeerAcked>>,
    last_group: Mutex<Option<Arc<SendGroup>>>,

    // inbound side
    received: StdMutex<RangeSet>,
    ack_timers: TimerPair,
}

impl ConnShared {
    fn close_reason(&self) -> Option<SudpError> {
        self.close_cell.get()
    }

    /// Closes the connection exactly once. Later calls only adjust the
    /// latched reason per [`CloseCell::latch`] and report success.
    async fn close(
        &self,
        reason: SudpError,
        user_initiated: bool,
        notify_peer: bool,
    ) -> Result<(), SudpError> {
        if !self.close_cell.latch(reason, user_initiated) {
            return Ok(());
        }

        let mut result = Ok(());
        if notify_peer {
            // best effort - the socket may be the thing that failed
            if let Err(e) = self.send_close_command().await {
                debug!("failed to send the close command: {}", e);
                result = Err(e);
            }
        }

        self.stop_tx.send_replace(true);
        self.ack_timers.cancel();
        if let Some(on_close) = &self.on_close {
            on_close();
        }
        result
    }

    /// The close command is sent outside any group so it goes out exactly
    /// once; its number is reserved from the current group to stay above
    /// everything already sent.
    async fn send_close_command(&self) -> Result<(), SudpError> {
        let number = {
            let last = self.last_group.lock().await;
            match last.as_ref() {
                Some(group) => group.reserve_number().await,
                None => 0,
            }
        };
        send_packet(self.sink.as_ref(), &close_connection_packet(number)).await
    }

    async fn append_with_rotation(self: &Arc<Self>, src: &[u8]) -> Result<usize, SudpError> {
        match self.group().await.append_data(src).await? {
            Some(n) => Ok(n),
            None => match self.next_group().await.append_data(src).await? {
                Some(n) => Ok(n),
                None => {
                    warn!("fresh send group refused an append");
                    Ok(0)
                }
            },
        }
    }

    /// The current group, created lazily on first use.
    async fn group(self: &Arc<Self>) -> Arc<SendGroup> {
        let mut last = self.last_group.lock().await;
        if let Some(group) = last.as_ref() {
            return group.clone();
        }
        let group = Arc::new(self.new_group(0));
        *last = Some(group.clone());
        group
    }

    /// Rotates to a fresh group continuing the number sequence. The old
    /// group keeps retransmitting on its own.
    async fn next_group(self: &Arc<Self>) -> Arc<SendGroup> {
        let mut last = self.last_group.lock().await;
        let first_number = match last.as_ref() {
            Some(group) => group.next_number().await,
            None => 0,
        };
        debug!("rotating to a new send group starting at {}", first_number);
        let group = Arc::new(self.new_group(first_number));
        *last = Some(group.clone());
        group
    }

    fn new_group(self: &Arc<Self>, first_number: u32) -> SendGroup {
        let weak = Arc::downgrade(self);
        let on_unresponsive: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                tokio::spawn(async move {
                    // the close command is still attempted, its failure is
                    // irrelevant with an unresponsive peer
                    let _ = shared.close(SudpError::NoResponse, false, true).await;
                });
            }
        });

        SendGroup::new(
            &self.config,
            self.sink.clone(),
            on_unresponsive,
            self.stop_tx.subscribe(),
            self.peer_acked.clone(),
            first_number,
        )
    }

    /// Records a received packet number; returns false for duplicates. New
    /// numbers schedule an acknowledgement on the receive timer pair.
    fn note_received(&self, number: u32) -> bool {
        let added = self
            .received
            .lock()
            .expect("received set poisoned")
            .insert(number);
        if added && !self.ack_timers.try_reset_short() {
            self.ack_timers.restart();
        }
        added
    }

    async fn apply_peer_report(&self, version: u32, ranges: Vec<PacketRange>) {
        let mut acked = self.peer_acked.write().await;
        if acked.version.map_or(true, |v| version > v) {
            trace!(
                "peer report #{} covers {} ranges",
                version,
                ranges.len()
            );
            acked.version = Some(version);
            acked.ranges = ranges;
        }
    }

    /// Sends one received-packets report covering everything seen so far,
    /// numbered through the current group.
    async fn emit_received_ranges(self: &Arc<Self>) -> Result<(), SudpError> {
        let ranges: Vec<PacketRange> = {
            let received = self.received.lock().expect("received set poisoned");
            if received.as_slice().len() > MAX_ACK_RANGES {
                debug!(
                    "{} received ranges exceed one packet, reporting the earliest {}",
                    received.as_slice().len(),
                    MAX_ACK_RANGES
                );
            }
            received
                .as_slice()
                .iter()
                .take(MAX_ACK_RANGES)
                .copied()
                .collect()
        };
        if ranges.is_empty() {
            return Ok(());
        }

        if self.group().await.append_ack(&ranges).await? {
            return Ok(());
        }
        if !self.next_group().await.append_ack(&ranges).await? {
            warn!("fresh send group refused an acknowledgement");
        }
        Ok(())
    }

    /// Receive-timer action: a failing acknowledgement path takes the
    /// connection down like any other write failure.
    async fn emit_received_ranges_or_close(self: &Arc<Self>) {
        if self.close_reason().is_some() {
            return;
        }
        if let Err(e) = self.emit_received_ranges().await {
            debug!("failed to acknowledge received packets: {}", e);
            let _ = self.close(e, false, true).await;
        }
    }
}

/// Latches the first close reason. A user-initiated close overwrites a
/// previously latched socket failure - the caller asked for the close and
/// should see their own intent - but never a peer close or a dead peer.
#[derive(Default)]
struct CloseCell {
    state: StdMutex<CloseState>,
}

#[derive(Default)]
struct CloseState {
    reason: Option<SudpError>,
    user_initiated: bool,
}

impl CloseCell {
    fn get(&self) -> Option<SudpError> {
        self.state
            .lock()
            .expect("close cell poisoned")
            .reason
            .clone()
    }

    /// Returns whether this call was the one that closed the connection.
    fn latch(&self, reason: SudpError, user_initiated: bool) -> bool {
        let mut state = self.state.lock().expect("close cell poisoned");
        match &state.reason {
            None => {
                state.reason = Some(reason);
                state.user_initiated = user_initiated;
                true
            }
            Some(prev) => {
                if user_initiated && !state.user_initiated && matches!(prev, SudpError::Io(_)) {
                    state.reason = Some(reason);
                    state.user_initiated = true;
                }
                false
            }
        }
    }
}

/// Consumes the inbound queue until the connection closes or the queue's
/// producer goes away, then closes the user-facing byte queue with the
/// latched reason.
async fn run_dispatcher(
    shared: Arc<ConnShared>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    inbound_error: Arc<OnceLock<SudpError>>,
    writer: ByteQueueWriter,
    mut stop: watch::Receiver<bool>,
) {
    let mut sequencer = ReceiveSequencer::new();

    let result = loop {
        let datagram = select! {
            biased;
            _ = stop.changed() => break Ok(()),
            received = inbound.recv() => match received {
                Some(datagram) => datagram,
                None => {
                    let reason = inbound_error.get().cloned().unwrap_or_else(|| {
                        SudpError::Io("inbound datagram stream ended".to_owned())
                    });
                    break Err(reason);
                }
            },
        };

        if let Err(e) = handle_datagram(&shared, &mut sequencer, &writer, datagram).await {
            break Err(e);
        }
    };

    if let Err(reason) = result {
        debug!("connection dispatcher stopping: {}", reason);
        let _ = shared.close(reason, false, true).await;
    }
    shared.ack_timers.cancel();
    writer.close(
        shared
            .close_reason()
            .expect("close reason latched before the dispatcher exits"),
    );
}

async fn handle_datagram(
    shared: &Arc<ConnShared>,
    sequencer: &mut ReceiveSequencer,
    writer: &ByteQueueWriter,
    datagram: Vec<u8>,
) -> Result<(), SudpError> {
    let packet = Packet::decode(Bytes::from(datagram))?;
    trace!(
        "dispatching packet #{} ({} payload bytes)",
        packet.header.number,
        packet.data.len()
    );

    let command = if packet.header.is_command {
        Some(packet.command()?)
    } else {
        None
    };

    // a report is applied even when its packet number is a duplicate - it
    // may still carry the newest version
    if let Some(Command::ReceivedPackets(payload)) = &command {
        let ranges = decode_received_ranges(payload)?;
        shared.apply_peer_report(packet.header.number, ranges).await;
    }

    if !shared.note_received(packet.header.number) {
        // a re-sent packet means our acknowledgement got lost or is too
        // slow; repeat it right away
        if !matches!(command, Some(Command::ReceivedPackets(_))) {
            shared.emit_received_ranges().await?;
        }
        return Ok(());
    }

    if let Some(Command::CloseConnection) = command {
        debug!("peer closed the connection");
        let _ = shared.close(SudpError::PeerClosed, false, false).await;
        return Ok(());
    }

    // every new packet feeds the sequencer so command numbers do not leave
    // gaps; only data payloads come back out
    for payload in sequencer.push(packet) {
        if !writer.write(payload).await {
            trace!("read side dropped, discarding delivery");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{data_packet, received_packets_packet, Header, PROTOCOL_VERSION};
    use crate::send_pipeline::{MockDatagramSink, RecordingSink};
    use std::io;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time;

    struct Fixture {
        conn: Connection,
        inbound_tx: mpsc::Sender<Vec<u8>>,
        sink: Arc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let sink = RecordingSink::new();
        let conn = Connection::spawn(
            SudpConfig::default(),
            inbound_rx,
            Arc::new(OnceLock::new()),
            sink.clone(),
            None,
            None,
            None,
        );
        Fixture {
            conn,
            inbound_tx,
            sink,
        }
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    fn wire(packet: Packet) -> Vec<u8> {
        packet.to_wire()
    }

    fn received_reports(sink: &RecordingSink) -> Vec<Vec<PacketRange>> {
        sink.packets()
            .iter()
            .filter_map(|p| match p.command() {
                Ok(Command::ReceivedPackets(payload)) => {
                    Some(decode_received_ranges(&payload).unwrap())
                }
                _ => None,
            })
            .collect()
    }

    fn close_commands(sink: &RecordingSink) -> usize {
        sink.packets()
            .iter()
            .filter(|p| matches!(p.command(), Ok(Command::CloseConnection)))
            .count()
    }

    /// A single quiet packet is acknowledged after the short receive timer.
    #[test]
    fn test_acks_after_the_short_timer() {
        let rt = paused_runtime();
        rt.block_on(async {
            let config = SudpConfig::default();
            let f = fixture();

            f.inbound_tx
                .send(wire(data_packet(0, Bytes::from_static(b"Hi"))))
                .await
                .unwrap();

            time::sleep(config.ack_short_delay / 2).await;
            assert!(received_reports(&f.sink).is_empty(), "no premature ack");

            time::sleep(config.ack_short_delay / 2 + config.delivery_delay).await;
            let reports = received_reports(&f.sink);
            assert!(!reports.is_empty());
            assert_eq!(reports[0], vec![PacketRange { lo: 0, hi: 0 }]);
        });
    }

    /// Continuous traffic keeps resetting the short timer; the long timer
    /// bounds how late the acknowledgement may become.
    #[test]
    fn test_acks_after_the_long_timer_under_continuous_traffic() {
        let rt = paused_runtime();
        rt.block_on(async {
            let config = SudpConfig::default();
            let f = fixture();

            let gap = config.ack_short_delay / 2;
            let count = (config.ack_long_delay.as_millis() / gap.as_millis()) as u32; // 20
            for i in 0..count {
                f.inbound_tx
                    .send(wire(data_packet(69 + i, Bytes::from_static(b"Hello"))))
                    .await
                    .unwrap();
                assert!(
                    received_reports(&f.sink).is_empty(),
                    "short timer kept resetting, nothing may be acked before the long timer"
                );
                time::sleep(gap).await;
            }

            time::sleep(config.delivery_delay).await;
            let reports = received_reports(&f.sink);
            assert!(!reports.is_empty());
            assert_eq!(
                reports[0],
                vec![PacketRange {
                    lo: 69,
                    hi: 69 + count - 1
                }]
            );
        });
    }

    /// A duplicate means the peer is re-sending because our ack got lost;
    /// the answer is an immediate ack, not a timer cycle.
    #[test]
    fn test_duplicate_triggers_an_instant_ack() {
        let rt = paused_runtime();
        rt.block_on(async {
            let config = SudpConfig::default();
            let f = fixture();

            for number in [0u32, 1, 1, 2] {
                f.inbound_tx
                    .send(wire(data_packet(number, Bytes::from_static(b"World"))))
                    .await
                    .unwrap();
            }

            time::sleep(config.delivery_delay / 2).await;
            let reports = received_reports(&f.sink);
            assert_eq!(reports.len(), 1, "exactly the duplicate-triggered ack");
            assert!(reports[0].iter().any(|r| r.contains(0) && r.contains(1)));

            // the remaining number is covered within the short-timer window
            time::sleep(config.ack_short_delay + config.delivery_delay).await;
            let reports = received_reports(&f.sink);
            let last = reports.last().unwrap();
            assert!(last.iter().any(|r| r.contains(2)));
        });
    }

    #[test]
    fn test_delivers_reordered_data_in_order() {
        let rt = paused_runtime();
        rt.block_on(async {
            let f = fixture();

            f.inbound_tx
                .send(wire(data_packet(1, Bytes::from_static(b", "))))
                .await
                .unwrap();
            f.inbound_tx
                .send(wire(data_packet(2, Bytes::from_static(b"World"))))
                .await
                .unwrap();
            f.inbound_tx
                .send(wire(data_packet(0, Bytes::from_static(b"Hello"))))
                .await
                .unwrap();

            let mut buf = [0u8; 64];
            let mut collected = Vec::new();
            while collected.len() < 12 {
                let n = f.conn.read(&mut buf).await.unwrap();
                collected.extend_from_slice(&buf[..n]);
            }
            assert_eq!(collected, b"Hello, World");
        });
    }

    #[test]
    fn test_write_splits_and_numbers_packets() {
        let rt = paused_runtime();
        rt.block_on(async {
            let f = fixture();

            assert_eq!(f.conn.write(b"Hello").await.unwrap(), 5);
            assert_eq!(f.conn.write(b"World!").await.unwrap(), 6);

            let packets = f.sink.packets();
            assert_eq!(packets.len(), 2);
            assert_eq!(packets[0].header.number, 0);
            assert_eq!(packets[0].data.as_ref(), b"Hello");
            assert_eq!(packets[1].header.number, 1);
            assert_eq!(packets[1].data.as_ref(), b"World!");
        });
    }

    /// Writes after the group window has passed rotate to a new group and
    /// keep the numbering monotonic.
    #[test]
    fn test_write_rotates_to_a_fresh_group() {
        let rt = paused_runtime();
        rt.block_on(async {
            let config = SudpConfig::default();
            let f = fixture();

            assert_eq!(f.conn.write(b"first").await.unwrap(), 5);
            time::sleep(config.send_short_window() + Duration::from_millis(50)).await;
            assert_eq!(f.conn.write(b"second").await.unwrap(), 6);

            let packets = f.sink.packets();
            let second = packets
                .iter()
                .find(|p| p.data.as_ref() == b"second")
                .expect("the rotated write must reach the sink");
            assert_eq!(second.header.number, 1);
        });
    }

    /// An incoming report confirms pending packets, so the group stops
    /// re-sending them; version ordering ignores stale reports.
    #[test]
    fn test_peer_reports_confirm_pending_packets() {
        let rt = paused_runtime();
        rt.block_on(async {
            let config = SudpConfig::default();
            let f = fixture();

            assert_eq!(f.conn.write(b"payload").await.unwrap(), 7);

            // ack with the newest version first, then a stale one claiming
            // nothing was received
            f.inbound_tx
                .send(wire(received_packets_packet(7, &[PacketRange { lo: 0, hi: 0 }])))
                .await
                .unwrap();
            f.inbound_tx
                .send(wire(received_packets_packet(
                    3,
                    &[PacketRange { lo: 900, hi: 901 }],
                )))
                .await
                .unwrap();
            time::sleep(Duration::from_millis(1)).await;

            {
                let acked = f.conn.shared.peer_acked.read().await;
                assert_eq!(acked.version, Some(7));
                assert_eq!(acked.ranges, vec![PacketRange { lo: 0, hi: 0 }]);
            }

            // the data packet is confirmed: it is not re-sent and its group
            // does not declare the peer dead
            time::sleep(config.send_long_window()).await;
            let data_copies = f
                .sink
                .packets()
                .iter()
                .filter(|p| p.data.as_ref() == b"payload")
                .count();
            assert_eq!(data_copies, 1);
            assert!(f.conn.shared.close_reason().is_none());
        });
    }

    #[test]
    fn test_close_sends_exactly_one_close_command() {
        let rt = paused_runtime();
        rt.block_on(async {
            let f = fixture();

            assert_eq!(f.conn.write(b"Hello").await.unwrap(), 5);
            f.conn.close().await.unwrap();
            f.conn.close().await.unwrap();
            assert!(f.conn.close().await.is_ok());

            assert_eq!(close_commands(&f.sink), 1);

            // the close command's number continues after the data packet
            let close_packet = f
                .sink
                .packets()
                .into_iter()
                .find(|p| matches!(p.command(), Ok(Command::CloseConnection)))
                .unwrap();
            assert_eq!(close_packet.header.number, 1);
        });
    }

    #[test]
    fn test_read_and_write_after_close_return_the_close_reason() {
        let rt = paused_runtime();
        rt.block_on(async {
            let f = fixture();
            f.conn.close().await.unwrap();

            let mut buf = [0u8; 16];
            assert_eq!(f.conn.read(&mut buf).await, Err(SudpError::LocallyClosed));
            assert_eq!(f.conn.write(b"x").await, Err(SudpError::LocallyClosed));
        });
    }

    #[test]
    fn test_peer_close_is_not_echoed() {
        let rt = paused_runtime();
        rt.block_on(async {
            let f = fixture();

            f.inbound_tx
                .send(wire(close_connection_packet(0)))
                .await
                .unwrap();
            time::sleep(Duration::from_millis(1)).await;

            let mut buf = [0u8; 16];
            assert_eq!(f.conn.read(&mut buf).await, Err(SudpError::PeerClosed));
            assert_eq!(f.conn.write(b"x").await, Err(SudpError::PeerClosed));
            assert_eq!(close_commands(&f.sink), 0, "a close is never answered with a close");
        });
    }

    /// A peer close is irrevocable: a later local close keeps the reason.
    #[test]
    fn test_local_close_does_not_overwrite_a_peer_close() {
        let rt = paused_runtime();
        rt.block_on(async {
            let f = fixture();

            f.inbound_tx
                .send(wire(close_connection_packet(0)))
                .await
                .unwrap();
            time::sleep(Duration::from_millis(1)).await;

            f.conn.close().await.unwrap();
            let mut buf = [0u8; 16];
            assert_eq!(f.conn.read(&mut buf).await, Err(SudpError::PeerClosed));
        });
    }

    #[test]
    fn test_undecodable_packet_closes_the_connection() {
        let rt = paused_runtime();
        rt.block_on(async {
            let f = fixture();

            // an unknown command tag cannot be resynced from
            f.inbound_tx
                .send(wire(Packet {
                    header: Header {
                        version: PROTOCOL_VERSION,
                        is_command: true,
                        number: 0,
                    },
                    data: Bytes::from_static(&[0x42]),
                }))
                .await
                .unwrap();
            time::sleep(Duration::from_millis(1)).await;

            let mut buf = [0u8; 16];
            assert!(matches!(
                f.conn.read(&mut buf).await,
                Err(SudpError::Decode(_))
            ));
        });
    }

    /// A close call on a connection whose socket already failed reports the
    /// user's intent, not the socket failure.
    #[test]
    fn test_local_close_overwrites_a_socket_failure() {
        let rt = paused_runtime();
        rt.block_on(async {
            let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(4);
            let inbound_error = Arc::new(OnceLock::new());
            inbound_error
                .set(SudpError::Io("read err".to_owned()))
                .unwrap();

            let mut sink = MockDatagramSink::new();
            sink.expect_send()
                .returning(|_| Err(io::Error::new(io::ErrorKind::Other, "write err")));

            let conn = Connection::spawn(
                SudpConfig::default(),
                inbound_rx,
                inbound_error,
                Arc::new(sink),
                None,
                None,
                None,
            );
            drop(inbound_tx); // the socket reader is gone
            time::sleep(Duration::from_millis(1)).await;
            assert_eq!(
                conn.shared.close_reason(),
                Some(SudpError::Io("read err".to_owned()))
            );

            conn.close().await.unwrap();

            let mut buf = [0u8; 16];
            assert_eq!(conn.read(&mut buf).await, Err(SudpError::LocallyClosed));
            assert_eq!(conn.write(b"x").await, Err(SudpError::LocallyClosed));
        });
    }

    #[test]
    fn test_deadlines_are_unsupported() {
        let rt = paused_runtime();
        rt.block_on(async {
            let f = fixture();
            let deadline = std::time::Instant::now();
            assert_eq!(f.conn.set_deadline(deadline), Err(SudpError::Unsupported));
            assert_eq!(
                f.conn.set_read_deadline(deadline),
                Err(SudpError::Unsupported)
            );
            assert_eq!(
                f.conn.set_write_deadline(deadline),
                Err(SudpError::Unsupported)
            );
        });
    }

    #[test]
    fn test_dead_peer_closes_with_no_response() {
        let rt = paused_runtime();
        rt.block_on(async {
            let config = SudpConfig::default();
            let f = fixture();

            assert_eq!(f.conn.write(b"into the void").await.unwrap(), 13);

            // no report ever arrives; the group runs out of retries
            time::sleep(config.send_long_window() * 8).await;

            let mut buf = [0u8; 16];
            assert_eq!(f.conn.read(&mut buf).await, Err(SudpError::NoResponse));
            assert_eq!(f.conn.write(b"x").await, Err(SudpError::NoResponse));
            assert_eq!(close_commands(&f.sink), 1);
        });
    }
}
