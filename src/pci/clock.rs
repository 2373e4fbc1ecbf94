//! Time synchronisation controller.
//!
//! Broadcasts the local date and time on a fixed schedule and answers clock
//! request SALs from other units. Requests landing inside the coalescing
//! window after an emission are absorbed; at most one answer goes out per
//! window.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ClockSync {
    interval: Option<Duration>,
    answer_requests: bool,
    coalesce_window: Duration,
    next_broadcast: Option<Instant>,
    pending_request: bool,
    last_emission: Option<Instant>,
}

impl ClockSync {
    /// `interval` of zero disables scheduled broadcasts; requests are still
    /// answered unless `answer_requests` is off.
    pub fn new(interval: Duration, answer_requests: bool, coalesce_window: Duration) -> Self {
        Self {
            interval: (!interval.is_zero()).then_some(interval),
            answer_requests,
            coalesce_window,
            next_broadcast: None,
            pending_request: false,
            last_emission: None,
        }
    }

    /// Connection became ready; the first broadcast goes out immediately.
    pub fn on_ready(&mut self, now: Instant) {
        self.next_broadcast = self.interval.map(|_| now);
        self.pending_request = false;
        self.last_emission = None;
    }

    pub fn on_disconnect(&mut self) {
        self.next_broadcast = None;
        self.pending_request = false;
        self.last_emission = None;
    }

    /// A unit asked for the time.
    pub fn on_request(&mut self, now: Instant) {
        if !self.answer_requests {
            return;
        }
        if let Some(last) = self.last_emission
            && now.duration_since(last) < self.coalesce_window
        {
            // A fresh broadcast already answers this request.
            return;
        }
        self.pending_request = true;
    }

    /// Force an emission outside the schedule (`publish_time`).
    pub fn force(&mut self) {
        self.pending_request = true;
    }

    /// Should a broadcast go out now?
    pub fn due(&self, now: Instant) -> bool {
        if self.pending_request {
            return true;
        }
        matches!(self.next_broadcast, Some(at) if at <= now)
    }

    /// A broadcast just went out.
    pub fn emitted(&mut self, now: Instant) {
        self.pending_request = false;
        self.last_emission = Some(now);
        self.next_broadcast = self.interval.map(|every| now + every);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_broadcast
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> ClockSync {
        ClockSync::new(Duration::from_secs(300), true, Duration::from_secs(2))
    }

    #[test]
    fn broadcasts_on_ready_and_then_on_schedule() {
        let mut sync = clock();
        let t0 = Instant::now();
        assert!(!sync.due(t0));

        sync.on_ready(t0);
        assert!(sync.due(t0));
        sync.emitted(t0);
        assert!(!sync.due(t0 + Duration::from_secs(299)));
        assert!(sync.due(t0 + Duration::from_secs(300)));
    }

    #[test]
    fn requests_inside_the_window_are_coalesced() {
        let mut sync = clock();
        let t0 = Instant::now();
        sync.on_ready(t0);
        sync.emitted(t0);

        // First request after the window: answered.
        let t1 = t0 + Duration::from_secs(10);
        sync.on_request(t1);
        assert!(sync.due(t1));
        sync.emitted(t1);

        // A second request half a second later is absorbed.
        sync.on_request(t1 + Duration::from_millis(500));
        assert!(!sync.due(t1 + Duration::from_millis(500)));

        // Past the window, requests are answered again.
        let t2 = t1 + Duration::from_secs(3);
        sync.on_request(t2);
        assert!(sync.due(t2));
    }

    #[test]
    fn disabled_interval_still_answers_requests() {
        let mut sync = ClockSync::new(Duration::ZERO, true, Duration::from_secs(2));
        let t0 = Instant::now();
        sync.on_ready(t0);
        assert!(!sync.due(t0));
        assert_eq!(sync.next_deadline(), None);

        sync.on_request(t0);
        assert!(sync.due(t0));
    }

    #[test]
    fn request_answering_can_be_disabled() {
        let mut sync = ClockSync::new(Duration::from_secs(300), false, Duration::from_secs(2));
        let t0 = Instant::now();
        sync.on_ready(t0);
        sync.emitted(t0);
        sync.on_request(t0 + Duration::from_secs(10));
        assert!(!sync.due(t0 + Duration::from_secs(10)));
        // force() bypasses the request gate.
        sync.force();
        assert!(sync.due(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn disconnect_cancels_the_schedule() {
        let mut sync = clock();
        let t0 = Instant::now();
        sync.on_ready(t0);
        sync.on_disconnect();
        assert!(!sync.due(t0 + Duration::from_secs(1000)));
        assert_eq!(sync.next_deadline(), None);
    }
}
