use anyhow::bail;
use std::time::Duration;

/// Tunables for the transport.
///
/// `Default` is the reference parameter set the protocol was designed
/// around; deviating from it is mostly useful in tests. Both peers may run
/// different configurations - the wire format does not depend on any of
/// these values.
#[derive(Debug, Clone)]
pub struct SudpConfig {
    /// How long the receive side waits after the last new packet before
    /// acknowledging everything received so far. Keeping this above the
    /// typical inter-packet gap batches many packets into one
    /// acknowledgement.
    pub ack_short_delay: Duration,

    /// Upper bound on how long acknowledgements may be deferred while new
    /// packets keep arriving and resetting the short delay.
    pub ack_long_delay: Duration,

    /// Flat substitute for an RTT estimate: the time a packet is assumed to
    /// need to reach the peer. Added on top of the ack delays to form the
    /// send-side windows, so a sender only re-sends after the peer had a
    /// realistic chance to acknowledge.
    pub delivery_delay: Duration,

    /// Retransmission rounds a send group performs before declaring the
    /// peer dead.
    pub resend_tries: u32,

    /// Datagrams buffered per connection between the socket and the
    /// dispatcher. The socket side drops datagrams while it is full - the
    /// retransmission machinery recovers them.
    pub inbound_queue_capacity: usize,

    /// Payload chunks buffered between the dispatcher and the user's read
    /// calls. This should be large: it covers the time the application
    /// takes to get around to reading.
    pub read_queue_capacity: usize,

    /// Connections buffered between the listener and `accept`. New source
    /// addresses are ignored while it is full.
    pub accept_queue_capacity: usize,
}

impl Default for SudpConfig {
    fn default() -> SudpConfig {
        SudpConfig {
            ack_short_delay: Duration::from_millis(300),
            ack_long_delay: Duration::from_secs(3),
            delivery_delay: Duration::from_millis(100),
            resend_tries: 3,
            inbound_queue_capacity: 256,
            read_queue_capacity: 4096,
            accept_queue_capacity: 128,
        }
    }
}

impl SudpConfig {
    /// The window during which a send group accepts new packets after its
    /// last append.
    pub fn send_short_window(&self) -> Duration {
        self.ack_short_delay + self.delivery_delay
    }

    /// The hard bound on how long a group stays open for appends under
    /// continuous traffic.
    pub fn send_long_window(&self) -> Duration {
        self.ack_long_delay + self.delivery_delay
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.resend_tries == 0 {
            bail!("resend_tries must be at least 1");
        }
        if self.ack_short_delay >= self.ack_long_delay {
            bail!("the short ack delay must be shorter than the long one");
        }
        if self.inbound_queue_capacity == 0
            || self.read_queue_capacity == 0
            || self.accept_queue_capacity == 0
        {
            bail!("queue capacities must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SudpConfig::default().validate().is_ok());
    }

    #[test]
    fn send_windows_are_derived_from_ack_delays() {
        let config = SudpConfig::default();
        assert_eq!(config.send_short_window(), Duration::from_millis(400));
        assert_eq!(config.send_long_window(), Duration::from_millis(3100));
    }

    #[test]
    fn rejects_zero_resend_tries() {
        let config = SudpConfig {
            resend_tries: 0,
            ..SudpConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_ack_delays() {
        let config = SudpConfig {
            ack_short_delay: Duration::from_secs(5),
            ..SudpConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
