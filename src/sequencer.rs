use bytes::Bytes;

use crate::packet::Packet;

/// Re-orders incoming packets and releases payloads strictly in
/// packet-number order.
///
/// Only the connection dispatcher touches this; duplicate numbers are
/// filtered out by the received range set before they get here.
#[derive(Debug, Default)]
pub(crate) struct ReceiveSequencer {
    next_to_deliver: u32,
    /// out-of-order packets sorted by number, all above `next_to_deliver`
    pending: Vec<Packet>,
}

impl ReceiveSequencer {
    pub fn new() -> ReceiveSequencer {
        ReceiveSequencer::default()
    }

    /// Accepts one packet and returns the run of data payloads that became
    /// deliverable, in order.
    ///
    /// Command packets advance the delivery pointer and occupy pending
    /// slots like any other packet, but contribute no payload - their
    /// handling happens in the dispatcher the moment they arrive.
    pub fn push(&mut self, packet: Packet) -> Vec<Bytes> {
        debug_assert!(packet.header.number >= self.next_to_deliver);

        if packet.header.number != self.next_to_deliver {
            let at = self
                .pending
                .partition_point(|p| p.header.number < packet.header.number);
            self.pending.insert(at, packet);
            return Vec::new();
        }

        let mut run = Vec::new();
        self.next_to_deliver += 1;
        if !packet.header.is_command {
            run.push(packet.data);
        }

        let mut consumed = 0;
        for pending in &self.pending {
            if pending.header.number != self.next_to_deliver {
                break;
            }
            self.next_to_deliver += 1;
            if !pending.header.is_command {
                run.push(pending.data.clone());
            }
            consumed += 1;
        }
        self.pending.drain(..consumed);
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{close_connection_packet, data_packet};

    fn payload(n: u32) -> Bytes {
        Bytes::from(format!("payload {}", n))
    }

    #[test]
    fn in_order_packets_come_straight_through() {
        let mut sequencer = ReceiveSequencer::new();
        for n in 0..5 {
            let run = sequencer.push(data_packet(n, payload(n)));
            assert_eq!(run, vec![payload(n)]);
        }
        assert!(sequencer.pending.is_empty());
    }

    #[test]
    fn buffers_until_the_gap_closes() {
        let mut sequencer = ReceiveSequencer::new();
        assert!(sequencer.push(data_packet(2, payload(2))).is_empty());
        assert!(sequencer.push(data_packet(1, payload(1))).is_empty());
        assert!(sequencer.push(data_packet(3, payload(3))).is_empty());

        let run = sequencer.push(data_packet(0, payload(0)));
        assert_eq!(run, vec![payload(0), payload(1), payload(2), payload(3)]);
        assert!(sequencer.pending.is_empty());
    }

    #[test]
    fn stops_at_the_next_gap() {
        let mut sequencer = ReceiveSequencer::new();
        assert!(sequencer.push(data_packet(1, payload(1))).is_empty());
        assert!(sequencer.push(data_packet(4, payload(4))).is_empty());

        let run = sequencer.push(data_packet(0, payload(0)));
        assert_eq!(run, vec![payload(0), payload(1)]);
        assert_eq!(sequencer.pending.len(), 1);

        assert!(sequencer.push(data_packet(3, payload(3))).is_empty());
        let run = sequencer.push(data_packet(2, payload(2)));
        assert_eq!(run, vec![payload(2), payload(3), payload(4)]);
    }

    #[test]
    fn every_permutation_of_a_small_window_delivers_in_order() {
        // all 24 arrival orders of packets 0..4
        let mut orders = Vec::new();
        for a in 0..4u32 {
            for b in 0..4u32 {
                for c in 0..4u32 {
                    for d in 0..4u32 {
                        let order = [a, b, c, d];
                        let mut seen = [false; 4];
                        order.iter().for_each(|&n| seen[n as usize] = true);
                        if seen.iter().all(|&s| s) {
                            orders.push(order);
                        }
                    }
                }
            }
        }
        assert_eq!(orders.len(), 24);

        for order in orders {
            let mut sequencer = ReceiveSequencer::new();
            let mut delivered = Vec::new();
            for n in order {
                delivered.extend(sequencer.push(data_packet(n, payload(n))));
            }
            assert_eq!(
                delivered,
                vec![payload(0), payload(1), payload(2), payload(3)],
                "arrival order {:?}",
                order
            );
        }
    }

    #[test]
    fn command_packets_advance_but_are_not_delivered() {
        let mut sequencer = ReceiveSequencer::new();
        assert!(sequencer.push(data_packet(2, payload(2))).is_empty());
        assert!(sequencer.push(close_connection_packet(1)).is_empty());

        let run = sequencer.push(data_packet(0, payload(0)));
        assert_eq!(run, vec![payload(0), payload(2)]);

        let run = sequencer.push(close_connection_packet(3));
        assert!(run.is_empty());
        let run = sequencer.push(data_packet(4, payload(4)));
        assert_eq!(run, vec![payload(4)]);
    }
}
