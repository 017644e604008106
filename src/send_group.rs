use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time;
use tracing::{debug, trace};

use crate::config::SudpConfig;
use crate::error::SudpError;
use crate::packet::{received_packets_packet, split_into_data_packets};
use crate::range_set::PacketRange;
use crate::send_pipeline::{send_raw, DatagramSink};
use crate::timer::TimerPair;

/// The peer's most recent report of what it has received, shared read-only
/// with every live group.
///
/// `version` is the number of the packet that carried the report; a report
/// from a lower number is stale and must be ignored. It starts unset so the
/// very first report applies even when it travels in packet number 0.
#[derive(Debug, Default)]
pub(crate) struct PeerAcked {
    pub version: Option<u32>,
    pub ranges: Vec<PacketRange>,
}

/// A window of recently sent packets that re-sends its unconfirmed members
/// until the peer reports them received or the retry count runs out.
///
/// A group accepts appends only while its short window is open; once the
/// window closes the connection rotates to a fresh group and this one keeps
/// retransmitting on its own. Groups never talk to each other - they share
/// only the stop signal and the peer-acked cell.
pub(crate) struct SendGroup {
    inner: Arc<Mutex<GroupInner>>,
    timers: TimerPair,
}

struct GroupInner {
    sink: Arc<dyn DatagramSink>,
    first_number: u32,
    next_number: u32,
    /// Encoded packets in number order. Confirmed and reserved slots are
    /// None and never retransmitted.
    slots: Vec<Option<Vec<u8>>>,
}

impl SendGroup {
    pub fn new(
        config: &SudpConfig,
        sink: Arc<dyn DatagramSink>,
        on_unresponsive: Arc<dyn Fn() + Send + Sync>,
        stop: watch::Receiver<bool>,
        peer_acked: Arc<RwLock<PeerAcked>>,
        first_number: u32,
    ) -> SendGroup {
        let inner = Arc::new(Mutex::new(GroupInner {
            sink,
            first_number,
            next_number: first_number,
            slots: Vec::new(),
        }));

        let cycle_inner = inner.clone();
        let resend_delay = config.send_short_window();
        let resend_tries = config.resend_tries;
        let timers = TimerPair::spawn(
            config.send_short_window(),
            config.send_long_window(),
            true,
            true,
            move || {
                run_resend_cycle(
                    cycle_inner.clone(),
                    peer_acked.clone(),
                    stop.clone(),
                    on_unresponsive.clone(),
                    resend_delay,
                    resend_tries,
                )
            },
        );

        SendGroup { inner, timers }
    }

    /// Splits `data` into packets, sends each and remembers the encoding
    /// for retransmission.
    ///
    /// `Ok(None)` means the short window has closed and the caller must
    /// rotate to a fresh group.
    pub async fn append_data(&self, data: &[u8]) -> Result<Option<usize>, SudpError> {
        let mut inner = self.inner.lock().await;
        if !self.timers.try_reset_short() {
            return Ok(None);
        }

        let (packets, next_number) = split_into_data_packets(inner.next_number, data);
        let sink = inner.sink.clone();
        let mut written = 0;
        for packet in packets {
            let wire = packet.to_wire();
            send_raw(sink.as_ref(), &wire).await?;
            written += packet.data.len();
            inner.slots.push(Some(wire));
            inner.next_number += 1;
        }
        debug_assert_eq!(inner.next_number, next_number);
        Ok(Some(written))
    }

    /// Sends one received-packets report under the group's next number;
    /// same window contract as [`SendGroup::append_data`].
    pub async fn append_ack(&self, received: &[PacketRange]) -> Result<bool, SudpError> {
        let mut inner = self.inner.lock().await;
        if !self.timers.try_reset_short() {
            return Ok(false);
        }

        let packet = received_packets_packet(inner.next_number, received);
        let wire = packet.to_wire();
        let sink = inner.sink.clone();
        send_raw(sink.as_ref(), &wire).await?;
        inner.slots.push(Some(wire));
        inner.next_number += 1;
        Ok(true)
    }

    /// Claims the next packet number without transmitting anything under
    /// it. The placeholder slot never takes part in retransmission, so the
    /// number can safely be used for a packet sent outside any group.
    pub async fn reserve_number(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        inner.slots.push(None);
        let number = inner.next_number;
        inner.next_number += 1;
        number
    }

    pub async fn next_number(&self) -> u32 {
        self.inner.lock().await.next_number
    }
}

/// Marks every slot covered by the peer's report as confirmed.
fn reconcile_confirmed(inner: &mut GroupInner, acked: &PeerAcked) {
    let len = inner.slots.len() as u32;
    if len == 0 {
        return;
    }
    let first = inner.first_number;
    for range in &acked.ranges {
        if range.hi < first || range.lo >= first + len {
            continue;
        }
        let lo = range.lo.max(first) - first;
        let hi = range.hi.min(first + len - 1) - first;
        for slot in &mut inner.slots[lo as usize..=hi as usize] {
            *slot = None;
        }
    }
}

async fn run_resend_cycle(
    inner: Arc<Mutex<GroupInner>>,
    peer_acked: Arc<RwLock<PeerAcked>>,
    mut stop: watch::Receiver<bool>,
    on_unresponsive: Arc<dyn Fn() + Send + Sync>,
    mut delay: Duration,
    tries: u32,
) {
    for attempt in 0..tries {
        if *stop.borrow() {
            return;
        }

        let mut any_pending = false;
        {
            let mut inner = inner.lock().await;
            let acked = peer_acked.read().await;
            reconcile_confirmed(&mut inner, &acked);
            drop(acked);

            let sink = inner.sink.clone();
            for slot in &inner.slots {
                if let Some(wire) = slot {
                    any_pending = true;
                    if let Err(e) = send_raw(sink.as_ref(), wire).await {
                        debug!("resend attempt {} failed: {}", attempt + 1, e);
                        return;
                    }
                }
            }
        }
        if !any_pending {
            trace!("all packets confirmed after {} resend attempts", attempt);
            return;
        }

        delay *= 2;
        select! {
            _ = time::sleep(delay) => {}
            _ = stop.changed() => return,
        }
    }

    let still_pending = {
        let mut inner = inner.lock().await;
        let acked = peer_acked.read().await;
        reconcile_confirmed(&mut inner, &acked);
        inner.slots.iter().any(|slot| slot.is_some())
    };
    if still_pending {
        debug!("peer unresponsive after {} resend attempts", tries);
        on_unresponsive();
    }
}
