use std::time::Duration;

/// Retransmission timeouts for a single outstanding packet: the n-th retry waits
///  `base * 2^n`, and the operation gives up after `max_tries` retries.
#[derive(Debug)]
pub struct RetransmitBackoff {
    tries: u32,

    config_base_timeout: Duration,
    config_max_tries: u32,
}

impl RetransmitBackoff {
    pub fn new(base_timeout: Duration, max_tries: u32) -> Self {
        RetransmitBackoff {
            tries: 0,
            config_base_timeout: base_timeout,
            config_max_tries: max_tries,
        }
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn timeout(&self) -> Duration {
        let factor = 1u32.checked_shl(self.tries).unwrap_or(u32::MAX);
        self.config_base_timeout.saturating_mul(factor)
    }

    /// Registers an expired timeout. Returns `true` if the packet should be sent again, and
    ///  `false` if retries are exhausted.
    #[must_use]
    pub fn on_timeout(&mut self) -> bool {
        self.tries += 1;
        self.tries <= self.config_max_tries
    }

    pub fn reset(&mut self) {
        self.tries = 0;
    }
}
