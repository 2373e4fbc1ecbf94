//! Outbound command records: retention for retry, timeouts, confirmations.
//!
//! Every confirmed frame is retained, keyed by its tag, until the PCI
//! confirms it or the attempt budget runs out. The initial transmission
//! consumes one attempt, so `max_attempts = 3` puts at most three copies of
//! the frame on the wire. The first deadline is the long confirmation
//! timeout; once a retry happens, further deadlines use the short retry
//! interval. A NACK (`!`) consumes an attempt exactly like a timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use super::events::{CommandOutcome, OperationKind};

/// How a `!` confirmation is treated.
///
/// PCI firmware is inconsistent about whether a NACKed frame is worth
/// retrying; retrying costs nothing beyond the attempt budget, so it is the
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NackPolicy {
    /// Count one failed attempt and retry on the short interval.
    #[default]
    Retry,
    /// Drop the record on the first NACK and report the failure.
    Drop,
}

#[derive(Debug)]
struct InFlight {
    frame: Vec<u8>,
    attempts_remaining: u8,
    deadline: Instant,
    completer: Option<Sender<CommandOutcome>>,
    op: OperationKind,
}

/// What to do after a confirmation arrived for `tag`.
#[derive(Debug)]
pub enum Confirmed {
    /// Record resolved successfully; release the tag.
    Resolved {
        completer: Option<Sender<CommandOutcome>>,
    },
    /// NACK with attempts left: put `frame` back on the wire.
    Retry { frame: Vec<u8> },
    /// NACK with no attempts left; release the tag.
    Exhausted {
        completer: Option<Sender<CommandOutcome>>,
        op: OperationKind,
    },
    /// No record for this tag (stale or duplicated confirmation).
    Unknown,
}

/// What to do for a record whose deadline passed.
#[derive(Debug)]
pub enum Expired {
    Retry { tag: u8, frame: Vec<u8> },
    Exhausted {
        tag: u8,
        completer: Option<Sender<CommandOutcome>>,
        op: OperationKind,
    },
}

/// The in-flight map.
#[derive(Debug)]
pub struct OutboundEngine {
    in_flight: HashMap<u8, InFlight>,
    confirm_timeout: Duration,
    retry_interval: Duration,
    nack_policy: NackPolicy,
}

impl OutboundEngine {
    pub fn new(
        confirm_timeout: Duration,
        retry_interval: Duration,
        nack_policy: NackPolicy,
    ) -> Self {
        Self {
            in_flight: HashMap::new(),
            confirm_timeout,
            retry_interval,
            nack_policy,
        }
    }

    /// Retain a frame that is about to be written for the first time.
    pub fn register(
        &mut self,
        tag: u8,
        frame: Vec<u8>,
        max_attempts: u8,
        completer: Option<Sender<CommandOutcome>>,
        op: OperationKind,
        now: Instant,
    ) {
        let prior = self.in_flight.insert(
            tag,
            InFlight {
                frame,
                attempts_remaining: max_attempts.saturating_sub(1),
                deadline: now + self.confirm_timeout,
                completer,
                op,
            },
        );
        debug_assert!(prior.is_none(), "tag {tag:#04x} already in flight");
    }

    /// Apply a confirmation for `tag`.
    pub fn confirm(&mut self, tag: u8, success: bool, now: Instant) -> Confirmed {
        if success {
            return match self.in_flight.remove(&tag) {
                Some(record) => Confirmed::Resolved {
                    completer: record.completer,
                },
                None => Confirmed::Unknown,
            };
        }

        let Some(record) = self.in_flight.get_mut(&tag) else {
            return Confirmed::Unknown;
        };
        if self.nack_policy == NackPolicy::Retry && record.attempts_remaining > 0 {
            record.attempts_remaining -= 1;
            record.deadline = now + self.retry_interval;
            Confirmed::Retry {
                frame: record.frame.clone(),
            }
        } else {
            let record = self.in_flight.remove(&tag).expect("record just inspected");
            Confirmed::Exhausted {
                completer: record.completer,
                op: record.op,
            }
        }
    }

    /// Collect every record whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let due: Vec<u8> = self
            .in_flight
            .iter()
            .filter(|(_, record)| record.deadline <= now)
            .map(|(&tag, _)| tag)
            .collect();

        let mut actions = Vec::with_capacity(due.len());
        for tag in due {
            let record = self.in_flight.get_mut(&tag).expect("tag collected above");
            if record.attempts_remaining > 0 {
                record.attempts_remaining -= 1;
                record.deadline = now + self.retry_interval;
                actions.push(Expired::Retry {
                    tag,
                    frame: record.frame.clone(),
                });
            } else {
                let record = self.in_flight.remove(&tag).expect("tag collected above");
                actions.push(Expired::Exhausted {
                    tag,
                    completer: record.completer,
                    op: record.op,
                });
            }
        }
        actions
    }

    /// Earliest pending deadline, if any record is alive.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|record| record.deadline).min()
    }

    /// Drop every record, yielding the completers (connection loss).
    pub fn drain(&mut self) -> Vec<(Option<Sender<CommandOutcome>>, OperationKind)> {
        self.in_flight
            .drain()
            .map(|(_, record)| (record.completer, record.op))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> OutboundEngine {
        OutboundEngine::new(
            Duration::from_secs(30),
            Duration::from_secs(1),
            NackPolicy::Retry,
        )
    }

    #[test]
    fn timeout_schedule_allows_exactly_max_attempts_transmissions() {
        let mut out = engine();
        let t0 = Instant::now();
        // Transmission 1 happens at registration time.
        out.register(b'h', vec![1], 3, None, OperationKind::LightingOn, t0);
        assert_eq!(out.next_deadline(), Some(t0 + Duration::from_secs(30)));

        // 30 s pass: transmission 2.
        let actions = out.expire(t0 + Duration::from_secs(30));
        assert!(matches!(actions.as_slice(), [Expired::Retry { tag: b'h', .. }]));

        // 1 s more: transmission 3.
        let actions = out.expire(t0 + Duration::from_secs(31));
        assert!(matches!(actions.as_slice(), [Expired::Retry { tag: b'h', .. }]));

        // 1 s more: budget exhausted.
        let actions = out.expire(t0 + Duration::from_secs(32));
        assert!(matches!(
            actions.as_slice(),
            [Expired::Exhausted { tag: b'h', .. }]
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn expire_before_the_deadline_is_a_no_op() {
        let mut out = engine();
        let t0 = Instant::now();
        out.register(b'h', vec![1], 3, None, OperationKind::LightingOn, t0);
        assert!(out.expire(t0 + Duration::from_secs(29)).is_empty());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn success_resolves_and_removes_the_record() {
        let mut out = engine();
        let t0 = Instant::now();
        let (tx, rx) = crossbeam::channel::bounded(1);
        out.register(b'h', vec![1], 3, Some(tx), OperationKind::LightingOn, t0);

        match out.confirm(b'h', true, t0) {
            Confirmed::Resolved { completer } => {
                completer.unwrap().send(CommandOutcome::Success).unwrap();
            }
            other => panic!("expected resolution, got {other:?}"),
        }
        assert_eq!(rx.try_recv(), Ok(CommandOutcome::Success));
        assert!(out.is_empty());
        assert!(matches!(out.confirm(b'h', true, t0), Confirmed::Unknown));
    }

    #[test]
    fn nack_consumes_an_attempt_then_exhausts() {
        let mut out = engine();
        let t0 = Instant::now();
        out.register(b'h', vec![1], 2, None, OperationKind::LightingOff, t0);

        // One attempt left after the initial write.
        assert!(matches!(
            out.confirm(b'h', false, t0),
            Confirmed::Retry { .. }
        ));
        // NACK deadlines use the retry interval, not the long timeout.
        assert_eq!(out.next_deadline(), Some(t0 + Duration::from_secs(1)));
        assert!(matches!(
            out.confirm(b'h', false, t0),
            Confirmed::Exhausted { .. }
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn drop_policy_abandons_on_the_first_nack() {
        let mut out = OutboundEngine::new(
            Duration::from_secs(30),
            Duration::from_secs(1),
            NackPolicy::Drop,
        );
        let t0 = Instant::now();
        out.register(b'h', vec![1], 3, None, OperationKind::LightingOn, t0);
        assert!(matches!(
            out.confirm(b'h', false, t0),
            Confirmed::Exhausted { .. }
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn drain_returns_every_completer() {
        let mut out = engine();
        let t0 = Instant::now();
        let (tx1, _rx1) = crossbeam::channel::bounded(1);
        let (tx2, _rx2) = crossbeam::channel::bounded(1);
        out.register(b'h', vec![1], 3, Some(tx1), OperationKind::LightingOn, t0);
        out.register(b'i', vec![2], 3, Some(tx2), OperationKind::LightingOn, t0);

        let drained = out.drain();
        assert_eq!(drained.len(), 2);
        assert!(out.is_empty());
        assert_eq!(out.next_deadline(), None);
    }
}
