//! Status resynchronisation controller.
//!
//! Periodically sweeps every lighting application in use with level status
//! requests in 32-group blocks, keeping the cached levels honest against
//! state changes the engine never saw (missed broadcasts, local switches
//! during an outage). Requests are throttled to a bounded in-flight count so
//! a sweep cannot monopolise the channel.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Groups covered by one status request block.
pub const BLOCK_SIZE: u8 = 32;

#[derive(Debug)]
pub struct StatusResync {
    interval: Option<Duration>,
    max_inflight: usize,
    next_due: Option<Instant>,
    queue: VecDeque<(u8, u8)>,
    inflight: usize,
}

impl StatusResync {
    /// `interval` of zero disables the controller entirely.
    pub fn new(interval: Duration, max_inflight: usize) -> Self {
        Self {
            interval: (!interval.is_zero()).then_some(interval),
            max_inflight: max_inflight.max(1),
            next_due: None,
            queue: VecDeque::new(),
            inflight: 0,
        }
    }

    /// Connection became ready; the first sweep starts immediately.
    pub fn on_ready(&mut self, now: Instant) {
        self.next_due = self.interval.map(|_| now);
        self.queue.clear();
        self.inflight = 0;
    }

    pub fn on_disconnect(&mut self) {
        self.next_due = None;
        self.queue.clear();
        self.inflight = 0;
    }

    pub fn due(&self, now: Instant) -> bool {
        matches!(self.next_due, Some(at) if at <= now)
    }

    /// Queue a full sweep over `applications` and schedule the next one.
    pub fn start_sweep(&mut self, applications: &[u8], now: Instant) {
        for &app in applications {
            for block in (0..=u8::MAX).step_by(usize::from(BLOCK_SIZE)) {
                self.queue.push_back((app, block));
            }
        }
        self.next_due = self.interval.map(|every| now + every);
    }

    /// Next `(application, block_start)` to request, respecting the
    /// in-flight throttle. The caller must report completion via
    /// [`Self::request_finished`].
    pub fn next_request(&mut self) -> Option<(u8, u8)> {
        if self.inflight >= self.max_inflight {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.inflight += 1;
        Some(next)
    }

    /// A previously issued request completed (report arrived or timed out).
    pub fn request_finished(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_due
    }

    /// True while a sweep still has queued or in-flight requests.
    pub fn sweep_active(&self) -> bool {
        self.inflight > 0 || !self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_covers_the_group_space_in_blocks() {
        let mut resync = StatusResync::new(Duration::from_secs(300), 4);
        let t0 = Instant::now();
        resync.on_ready(t0);
        assert!(resync.due(t0));

        resync.start_sweep(&[0x38], t0);
        let mut blocks = Vec::new();
        loop {
            while let Some((app, block)) = resync.next_request() {
                assert_eq!(app, 0x38);
                blocks.push(block);
            }
            if !resync.sweep_active() {
                break;
            }
            resync.request_finished();
        }
        assert_eq!(blocks, vec![0, 32, 64, 96, 128, 160, 192, 224]);
        assert!(!resync.due(t0 + Duration::from_secs(299)));
        assert!(resync.due(t0 + Duration::from_secs(300)));
    }

    #[test]
    fn inflight_is_bounded() {
        let mut resync = StatusResync::new(Duration::from_secs(300), 4);
        let t0 = Instant::now();
        resync.on_ready(t0);
        resync.start_sweep(&[0x38, 0x3A], t0);

        let mut issued = 0;
        while resync.next_request().is_some() {
            issued += 1;
        }
        assert_eq!(issued, 4);

        resync.request_finished();
        assert!(resync.next_request().is_some());
        assert!(resync.next_request().is_none());
    }

    #[test]
    fn zero_interval_disables_the_controller() {
        let mut resync = StatusResync::new(Duration::ZERO, 4);
        let t0 = Instant::now();
        resync.on_ready(t0);
        assert!(!resync.due(t0 + Duration::from_secs(10_000)));
        assert_eq!(resync.next_deadline(), None);
    }

    #[test]
    fn disconnect_abandons_the_sweep() {
        let mut resync = StatusResync::new(Duration::from_secs(300), 4);
        let t0 = Instant::now();
        resync.on_ready(t0);
        resync.start_sweep(&[0x38], t0);
        assert!(resync.next_request().is_some());

        resync.on_disconnect();
        assert!(!resync.sweep_active());
        assert!(resync.next_request().is_none());
        assert!(!resync.due(t0 + Duration::from_secs(1000)));
    }
}
