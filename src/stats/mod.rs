//! Per-worker counters consumed by the reactor and its polling heuristics.

use hdrhistogram::Histogram;

/// Scale factor for the incoming-poll interval arithmetic. The interval is
/// kept left-shifted so that small per-poll adjustments accumulate before
/// they change the effective (right-shifted) check threshold.
pub const INCOMING_FACTOR: u32 = 5;

const MAX_INCOMING_INTERVAL: i32 = 256 << INCOMING_FACTOR;

/// Adaptive poll-rate state for one class of "incoming" sockets
/// (UDP/ICP, DNS, TCP listeners).
///
/// The interval widens after a poll that found nothing and narrows after one
/// that found work, so a busy class is polled often between general reactor
/// passes and an idle one almost never.
pub struct Incoming {
    /// Scaled interval; effective threshold is `interval >> INCOMING_FACTOR`.
    pub interval: i32,
    io_events: i32,
    /// How many events each extra poll of this class serviced.
    pub history: Histogram<u64>,
}

/// Tuning for one incoming class: target events per poll and minimum interval.
#[derive(Debug, Clone, Copy)]
pub struct IncomingMeasure {
    pub average: i32,
    pub min_poll: i32,
}

impl Incoming {
    pub fn new() -> Incoming {
        Incoming {
            interval: 16 << INCOMING_FACTOR,
            io_events: 0,
            history: Histogram::new_with_bounds(1, 1 << 16, 2).expect("static histogram bounds"),
        }
    }

    /// Counts one general-pass event and reports whether this class is due
    /// for an extra poll.
    #[inline]
    pub fn check(&mut self) -> bool {
        self.io_events += 1;
        self.io_events > (self.interval >> INCOMING_FACTOR)
    }

    /// Called before an extra poll of this class; resets the due counter.
    /// Returns false when there are no descriptors to poll.
    pub fn start_polling(&mut self, nfds: usize) -> bool {
        self.io_events = 0;
        nfds > 0
    }

    /// Feeds back how much work the extra poll found; `n < 0` means the
    /// poll was aborted and leaves the interval unchanged.
    pub fn finish_polling(&mut self, n: i32, cfg: IncomingMeasure) {
        if n < 0 {
            return;
        }

        self.interval += cfg.average - n;

        if self.interval < cfg.min_poll {
            self.interval = cfg.min_poll;
        }
        if self.interval > MAX_INCOMING_INTERVAL {
            self.interval = MAX_INCOMING_INTERVAL;
        }

        self.history.record(n as u64).ok();
    }
}

impl Default for Incoming {
    fn default() -> Self {
        Self::new()
    }
}

/// Reactor and transfer counters for one worker.
pub struct StatCounters {
    pub selects: u64,
    pub select_loops: u64,
    pub select_fds: u64,
    pub select_time: f64,
    pub select_fds_hist: Histogram<u64>,
    pub incoming_sockets_accepted: i32,

    pub comm_udp: Incoming,
    pub comm_dns: Incoming,
    pub comm_tcp: Incoming,

    pub client_bytes_in: u64,
    pub client_bytes_out: u64,
    pub server_bytes_in: u64,
    pub server_bytes_out: u64,
}

impl StatCounters {
    pub fn new() -> StatCounters {
        StatCounters {
            selects: 0,
            select_loops: 0,
            select_fds: 0,
            select_time: 0.0,
            select_fds_hist: Histogram::new_with_bounds(1, 1 << 16, 2)
                .expect("static histogram bounds"),
            incoming_sockets_accepted: 0,
            comm_udp: Incoming::new(),
            comm_dns: Incoming::new(),
            comm_tcp: Incoming::new(),
            client_bytes_in: 0,
            client_bytes_out: 0,
            server_bytes_in: 0,
            server_bytes_out: 0,
        }
    }
}

impl Default for StatCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measure() -> IncomingMeasure {
        IncomingMeasure {
            average: 4,
            min_poll: 2,
        }
    }

    #[test]
    fn test_idle_class_widens_interval() {
        let mut inc = Incoming::new();
        let before = inc.interval;
        assert!(inc.start_polling(1));
        inc.finish_polling(0, measure());
        assert!(inc.interval > before);
    }

    #[test]
    fn test_busy_class_narrows_interval() {
        let mut inc = Incoming::new();
        let before = inc.interval;
        assert!(inc.start_polling(2));
        inc.finish_polling(100, measure());
        assert!(inc.interval < before);
        // and it never narrows below the configured floor
        for _ in 0..64 {
            inc.start_polling(2);
            inc.finish_polling(1000, measure());
        }
        assert_eq!(inc.interval, measure().min_poll);
    }

    #[test]
    fn test_interval_is_clamped_above() {
        let mut inc = Incoming::new();
        for _ in 0..100_000 {
            inc.start_polling(1);
            inc.finish_polling(0, measure());
        }
        assert_eq!(inc.interval, 256 << INCOMING_FACTOR);
    }

    #[test]
    fn test_check_due_cadence_follows_interval() {
        let mut inc = Incoming::new();
        // initial effective threshold is 16 general-pass events
        let mut due = 0;
        for _ in 0..17 {
            if inc.check() {
                due += 1;
            }
        }
        assert_eq!(due, 1);
        assert!(inc.start_polling(0) == false);
    }
}
