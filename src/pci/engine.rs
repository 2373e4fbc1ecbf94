//! The PCI engine control loop.
//!
//! One thread owns every piece of mutable state: the receive buffer, the
//! confirmation pool, the in-flight map, the group cache and the connection
//! state machine. Commands arrive over an inbox channel, transport bytes
//! over the link's event channel, and time over a single computed deadline;
//! `crossbeam::select!` multiplexes the three. Nothing here blocks outside
//! those waits.

use std::time::{Duration, Instant};

use crossbeam::channel::{never, Receiver, Sender};
use thiserror::Error;

use crate::protocol::packet::{basic_frame, smart_frame};
use crate::protocol::sal::duration_code_for;
use crate::protocol::{
    application, Cal, FrameScanner, Packet, Sal, StatusKind, BROADCAST_UNIT_ADDRESS,
    LOCAL_SOURCE_ADDRESS, RAMP_DURATIONS, RESET,
};

use super::clock::ClockSync;
use super::confirm::{ConfirmPool, Released};
use super::events::{
    Command, CommandOutcome, Completion, DisconnectReason, Event, IdentifyOutcome, OperationKind,
    StatusOutcome,
};
use super::groupdb::GroupDb;
use super::link::{Connector, Link, LinkEvent};
use super::outbound::{Confirmed, Expired, NackPolicy, OutboundEngine};
use super::resync::StatusResync;

/// Tunable timers and limits. Defaults match the deployed protocol values;
/// tests shrink them.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub confirm_timeout: Duration,
    pub retry_interval: Duration,
    pub max_attempts: u8,
    pub nack_policy: NackPolicy,
    /// Scheduled time broadcast interval; zero disables.
    pub clock_interval: Duration,
    pub answer_clock_requests: bool,
    pub clock_coalesce_window: Duration,
    /// Status resynchronisation interval; zero disables.
    pub resync_interval: Duration,
    pub resync_max_inflight: usize,
    /// Lighting applications always swept, whether or not traffic for them
    /// has been seen yet.
    pub resync_applications: Vec<u8>,
    pub reset_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive failed reconnect rounds before giving up; zero means
    /// retry forever.
    pub max_reconnect_attempts: u32,
    /// Consecutive PCI error packets (with no good packet between) treated
    /// as a fatal protocol error.
    pub pci_error_flood_threshold: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(1),
            max_attempts: 3,
            nack_policy: NackPolicy::default(),
            clock_interval: Duration::from_secs(300),
            answer_clock_requests: true,
            clock_coalesce_window: Duration::from_secs(2),
            resync_interval: Duration::from_secs(300),
            resync_max_inflight: 4,
            resync_applications: vec![application::LIGHTING],
            reset_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_reconnect_attempts: 0,
            pci_error_flood_threshold: 10,
        }
    }
}

/// Why the engine thread returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// `close()` was called or every handle was dropped.
    Closed,
    /// The reconnect cap was reached without re-establishing the link.
    ReconnectExhausted,
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("engine is not running")]
    EngineStopped,
    #[error("application {application:#04x} is not a lighting application")]
    NotLighting { application: u8 },
    #[error("no ramp duration code covers {seconds} seconds")]
    RampTooLong { seconds: u16 },
    #[error("block start {block_start} is not a multiple of 32")]
    BadBlockStart { block_start: u8 },
}

/// Cloneable command surface for the bridge.
#[derive(Clone)]
pub struct PciHandle {
    tx: Sender<Command>,
}

impl PciHandle {
    pub fn lighting_on(
        &self,
        application: u8,
        group: u8,
    ) -> Result<Completion<CommandOutcome>, HandleError> {
        check_lighting(application)?;
        let (respond, completion) = Completion::new();
        self.send(Command::LightingOn {
            application,
            group,
            respond,
        })?;
        Ok(completion)
    }

    pub fn lighting_off(
        &self,
        application: u8,
        group: u8,
    ) -> Result<Completion<CommandOutcome>, HandleError> {
        check_lighting(application)?;
        let (respond, completion) = Completion::new();
        self.send(Command::LightingOff {
            application,
            group,
            respond,
        })?;
        Ok(completion)
    }

    /// Fade `group` to `level` over approximately `seconds`; the network
    /// only supports the fixed duration table, so the smallest covering
    /// entry is used.
    pub fn lighting_ramp(
        &self,
        application: u8,
        group: u8,
        level: u8,
        seconds: u16,
    ) -> Result<Completion<CommandOutcome>, HandleError> {
        check_lighting(application)?;
        let duration_code =
            duration_code_for(seconds).ok_or(HandleError::RampTooLong { seconds })?;
        let (respond, completion) = Completion::new();
        self.send(Command::LightingRamp {
            application,
            group,
            level,
            duration_code,
            respond,
        })?;
        Ok(completion)
    }

    pub fn lighting_terminate_ramp(
        &self,
        application: u8,
        group: u8,
    ) -> Result<Completion<CommandOutcome>, HandleError> {
        check_lighting(application)?;
        let (respond, completion) = Completion::new();
        self.send(Command::LightingTerminateRamp {
            application,
            group,
            respond,
        })?;
        Ok(completion)
    }

    /// Ask for the level report covering the 32 groups at `block_start`.
    pub fn request_status(
        &self,
        application: u8,
        block_start: u8,
    ) -> Result<Completion<StatusOutcome>, HandleError> {
        if block_start % 32 != 0 {
            return Err(HandleError::BadBlockStart { block_start });
        }
        let (respond, completion) = Completion::new();
        self.send(Command::RequestStatus {
            application,
            block_start,
            respond,
        })?;
        Ok(completion)
    }

    pub fn identify(
        &self,
        unit_address: u8,
        attribute: u8,
    ) -> Result<Completion<IdentifyOutcome>, HandleError> {
        let (respond, completion) = Completion::new();
        self.send(Command::Identify {
            unit_address,
            attribute,
            respond,
        })?;
        Ok(completion)
    }

    /// Force a clock broadcast outside the schedule.
    pub fn publish_time(&self) -> Result<(), HandleError> {
        self.send(Command::PublishTime)
    }

    /// Shut the engine down and wait until every pending operation has been
    /// resolved and both periodic controllers have stopped.
    pub fn close(&self) {
        let (respond, rx) = crossbeam::channel::bounded(1);
        if self.tx.send(Command::Close { respond }).is_ok() {
            let _ = rx.recv();
        }
    }

    fn send(&self, command: Command) -> Result<(), HandleError> {
        self.tx.send(command).map_err(|_| HandleError::EngineStopped)
    }
}

fn check_lighting(application: u8) -> Result<(), HandleError> {
    if application::is_lighting(application) {
        Ok(())
    } else {
        Err(HandleError::NotLighting { application })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Resetting,
    Ready,
}

/// A confirmed send parked while every tag is lent.
struct PendingSend {
    body: Vec<u8>,
    completer: Option<Sender<CommandOutcome>>,
    op: OperationKind,
}

struct StatusWatcher {
    application: u8,
    block_start: u8,
    deadline: Instant,
    /// `None` marks a resync-driven request.
    respond: Option<Sender<StatusOutcome>>,
}

struct IdentifyWatcher {
    attribute: u8,
    deadline: Instant,
    respond: Sender<IdentifyOutcome>,
}

/// Exponential reconnect backoff with a cap.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

pub struct Engine {
    opts: EngineOptions,
    connector: Box<dyn Connector>,
    cmd_rx: Receiver<Command>,
    event_tx: Sender<Event>,
    groups: GroupDb,

    state: ConnectionState,
    link: Option<Box<dyn Link>>,
    link_rx: Receiver<LinkEvent>,
    scanner: FrameScanner,
    pool: ConfirmPool<PendingSend>,
    outbound: OutboundEngine,
    status_watchers: Vec<StatusWatcher>,
    identify_watchers: Vec<IdentifyWatcher>,
    clock: ClockSync,
    resync: StatusResync,

    backoff: Backoff,
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
    reset_deadline: Option<Instant>,
    pci_error_run: u32,
    closing: bool,
    pending_exit: Option<EngineExit>,
}

impl Engine {
    /// Build an engine; the caller decides which thread runs it.
    pub fn new(
        connector: Box<dyn Connector>,
        opts: EngineOptions,
    ) -> (Engine, PciHandle, Receiver<Event>, GroupDb) {
        let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded();
        let (event_tx, event_rx) = crossbeam::channel::unbounded();
        let groups = GroupDb::new();

        let engine = Engine {
            outbound: OutboundEngine::new(opts.confirm_timeout, opts.retry_interval, opts.nack_policy),
            clock: ClockSync::new(
                opts.clock_interval,
                opts.answer_clock_requests,
                opts.clock_coalesce_window,
            ),
            resync: StatusResync::new(opts.resync_interval, opts.resync_max_inflight),
            backoff: Backoff::new(opts.backoff_base, opts.backoff_max),
            opts,
            connector,
            cmd_rx,
            event_tx,
            groups: groups.clone(),
            state: ConnectionState::Disconnected,
            link: None,
            link_rx: never(),
            scanner: FrameScanner::new(),
            pool: ConfirmPool::new(),
            status_watchers: Vec::new(),
            identify_watchers: Vec::new(),
            reconnect_attempts: 0,
            reconnect_at: None,
            reset_deadline: None,
            pci_error_run: 0,
            closing: false,
            pending_exit: None,
        };

        (engine, PciHandle { tx: cmd_tx }, event_rx, groups)
    }

    /// Spawn the engine on its own thread.
    pub fn spawn(
        connector: Box<dyn Connector>,
        opts: EngineOptions,
    ) -> (
        PciHandle,
        Receiver<Event>,
        GroupDb,
        std::thread::JoinHandle<EngineExit>,
    ) {
        let (engine, handle, events, groups) = Engine::new(connector, opts);
        let join = std::thread::Builder::new()
            .name("pci-engine".into())
            .spawn(move || engine.run())
            .expect("spawn pci engine thread");
        (handle, events, groups, join)
    }

    /// Run until closed or the reconnect cap is hit.
    pub fn run(mut self) -> EngineExit {
        self.reconnect_at = Some(Instant::now());

        loop {
            self.service(Instant::now());
            if let Some(exit) = self.pending_exit.take() {
                return exit;
            }

            let tick = match self.next_deadline() {
                Some(deadline) => {
                    crossbeam::channel::after(deadline.saturating_duration_since(Instant::now()))
                }
                None => never(),
            };
            // Cloned so the select borrows stay independent of `self`.
            let cmd_rx = self.cmd_rx.clone();
            let link_rx = self.link_rx.clone();

            crossbeam::select! {
                recv(cmd_rx) -> msg => match msg {
                    Ok(command) => {
                        if let Some(exit) = self.handle_command(command, Instant::now()) {
                            return exit;
                        }
                    }
                    // Every handle dropped: shut down like close().
                    Err(_) => {
                        self.drop_connection(DisconnectReason::Closed);
                        return EngineExit::Closed;
                    }
                },
                recv(link_rx) -> event => match event {
                    Ok(event) => self.handle_link_event(event, Instant::now()),
                    Err(_) => self.link_rx = never(),
                },
                recv(tick) -> _ => {}
            }
        }
    }

    // ---------------------------------------------------------------------
    // Time-driven work
    // ---------------------------------------------------------------------

    fn service(&mut self, now: Instant) {
        if self.state == ConnectionState::Disconnected
            && !self.closing
            && matches!(self.reconnect_at, Some(at) if at <= now)
        {
            self.try_connect(now);
        }

        if self.state == ConnectionState::Resetting
            && matches!(self.reset_deadline, Some(at) if at <= now)
        {
            tracing::warn!("PCI did not echo the reset sequence");
            self.fail_connection(DisconnectReason::ResetTimeout, now);
        }

        for action in self.outbound.expire(now) {
            match action {
                Expired::Retry { tag, frame } => {
                    tracing::debug!(tag = %(tag as char), "re-transmitting unconfirmed frame");
                    if !self.write(&frame, now) {
                        break;
                    }
                }
                Expired::Exhausted { tag, completer, op } => {
                    tracing::warn!(tag = %(tag as char), ?op, "command abandoned after retries");
                    self.resolve_abandoned(completer, op);
                    self.release_tag(tag, now);
                }
            }
            if self.state != ConnectionState::Ready {
                break;
            }
        }

        self.expire_watchers(now);

        if self.state == ConnectionState::Ready {
            if self.clock.due(now) {
                self.broadcast_clock(now);
            }
            if self.resync.due(now) {
                let mut apps = self.groups.lighting_applications();
                for &app in &self.opts.resync_applications {
                    if !apps.contains(&app) {
                        apps.push(app);
                    }
                }
                apps.sort_unstable();
                tracing::debug!(applications = ?apps, "starting status resync sweep");
                self.resync.start_sweep(&apps, now);
            }
            self.pump_resync(now);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |deadline: Option<Instant>| {
            if let Some(deadline) = deadline {
                next = Some(match next {
                    Some(current) => current.min(deadline),
                    None => deadline,
                });
            }
        };

        consider(self.outbound.next_deadline());
        consider(self.status_watchers.iter().map(|w| w.deadline).min());
        consider(self.identify_watchers.iter().map(|w| w.deadline).min());
        consider(self.reset_deadline);
        consider(self.reconnect_at);
        if self.state == ConnectionState::Ready {
            consider(self.clock.next_deadline());
            consider(self.resync.next_deadline());
        }
        next
    }

    fn expire_watchers(&mut self, now: Instant) {
        let mut resync_done = 0usize;
        let mut i = 0;
        while i < self.status_watchers.len() {
            if self.status_watchers[i].deadline <= now {
                let watcher = self.status_watchers.swap_remove(i);
                match watcher.respond {
                    Some(respond) => {
                        tracing::warn!(
                            application = watcher.application,
                            block_start = watcher.block_start,
                            "status request timed out"
                        );
                        let _ = respond.try_send(StatusOutcome::Abandoned);
                        self.emit(Event::CommandAbandoned {
                            op: OperationKind::StatusRequest,
                        });
                    }
                    None => resync_done += 1,
                }
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < self.identify_watchers.len() {
            if self.identify_watchers[i].deadline <= now {
                let watcher = self.identify_watchers.swap_remove(i);
                tracing::warn!(attribute = watcher.attribute, "identify request timed out");
                let _ = watcher.respond.try_send(IdentifyOutcome::Abandoned);
                self.emit(Event::CommandAbandoned {
                    op: OperationKind::Identify,
                });
            } else {
                i += 1;
            }
        }

        if resync_done > 0 {
            for _ in 0..resync_done {
                self.resync.request_finished();
            }
            self.pump_resync(now);
        }
    }

    fn pump_resync(&mut self, now: Instant) {
        while let Some((application, block_start)) = self.resync.next_request() {
            self.send_status_request(application, block_start, None, now);
            if self.state != ConnectionState::Ready {
                return;
            }
        }
    }

    fn broadcast_clock(&mut self, now: Instant) {
        let local = time::OffsetDateTime::now_local().unwrap_or_else(|_| {
            tracing::debug!("local UTC offset unavailable, broadcasting UTC");
            time::OffsetDateTime::now_utc()
        });

        let packet = Packet::PointToMultipoint {
            source_address: LOCAL_SOURCE_ADDRESS,
            application: application::CLOCK,
            sals: vec![
                Sal::DateUpdate {
                    year: local.year().clamp(0, i32::from(u16::MAX)) as u16,
                    month: u8::from(local.month()),
                    day: local.day(),
                    day_of_week: local.weekday().number_from_monday(),
                },
                Sal::TimeUpdate {
                    hour: local.hour(),
                    minute: local.minute(),
                    second: local.second(),
                    fractional: 0,
                },
            ],
            sal_error: None,
        };

        match packet.encode_body() {
            Ok(body) => {
                tracing::debug!("broadcasting network time");
                self.submit_confirmed(body, None, OperationKind::ClockBroadcast, now);
                self.clock.emitted(now);
            }
            Err(err) => {
                tracing::error!("failed to encode clock broadcast: {err}");
                self.clock.emitted(now);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Connection lifecycle
    // ---------------------------------------------------------------------

    fn try_connect(&mut self, now: Instant) {
        self.reconnect_at = None;
        self.state = ConnectionState::Connecting;
        tracing::info!(endpoint = %self.connector.endpoint(), "connecting to PCI");

        match self.connector.connect() {
            Ok(mut link) => {
                self.link_rx = link.take_events().unwrap_or_else(never);
                self.link = Some(link);
                self.state = ConnectionState::Resetting;
                self.reset_deadline = Some(now + self.opts.reset_timeout);
                self.send_reset_sequence(now);
            }
            Err(err) => {
                tracing::warn!(
                    endpoint = %self.connector.endpoint(),
                    "connect failed: {err}"
                );
                self.state = ConnectionState::Disconnected;
                self.schedule_reconnect(now);
            }
        }
    }

    /// Normalise the PCI: hard reset, then the option writes that put it in
    /// smart mode with strict checksums and monitoring enabled. The options
    /// go out in basic mode because smart mode is not active yet.
    fn send_reset_sequence(&mut self, now: Instant) {
        if !self.write(&[RESET, RESET, RESET], now) {
            return;
        }
        // Application address 1 and 2 select which SAL traffic the PCI
        // relays; 0xFF subscribes to everything.
        for (parameter, value) in [(0x21, 0xFF), (0x22, 0xFF), (0x42, 0x0E), (0x30, 0x79)] {
            let packet = Packet::DeviceManagement { parameter, value };
            match packet.encode_body() {
                Ok(body) => {
                    if !self.write(&basic_frame(&body), now) {
                        return;
                    }
                }
                Err(err) => tracing::error!("failed to encode PCI option write: {err}"),
            }
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.closing {
            return;
        }
        self.reconnect_attempts += 1;
        let cap = self.opts.max_reconnect_attempts;
        if cap > 0 && self.reconnect_attempts > cap {
            tracing::error!(attempts = self.reconnect_attempts - 1, "reconnect cap reached");
            self.pending_exit = Some(EngineExit::ReconnectExhausted);
            return;
        }
        let delay = self.backoff.next_delay();
        tracing::info!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.reconnect_at = Some(now + delay);
    }

    fn fail_connection(&mut self, reason: DisconnectReason, now: Instant) {
        tracing::warn!(?reason, "connection failed");
        self.drop_connection(reason);
        self.schedule_reconnect(now);
    }

    /// Drain every piece of in-flight state and return to `Disconnected`.
    fn drop_connection(&mut self, reason: DisconnectReason) {
        for (completer, _) in self.outbound.drain() {
            if let Some(completer) = completer {
                let _ = completer.try_send(CommandOutcome::ConnectionLost);
            }
        }
        for waiter in self.pool.reset() {
            if let Some(completer) = waiter.completer {
                let _ = completer.try_send(CommandOutcome::ConnectionLost);
            }
        }
        for watcher in std::mem::take(&mut self.status_watchers) {
            if let Some(respond) = watcher.respond {
                let _ = respond.try_send(StatusOutcome::ConnectionLost);
            }
        }
        for watcher in std::mem::take(&mut self.identify_watchers) {
            let _ = watcher.respond.try_send(IdentifyOutcome::ConnectionLost);
        }

        self.clock.on_disconnect();
        self.resync.on_disconnect();
        self.scanner.clear();
        self.groups.clear();
        self.reset_deadline = None;
        self.pci_error_run = 0;
        self.link_rx = never();
        if let Some(mut link) = self.link.take() {
            link.close();
        }

        let was_up = self.state != ConnectionState::Disconnected;
        self.state = ConnectionState::Disconnected;
        if was_up {
            self.emit(Event::Disconnected { reason });
        }
    }

    // ---------------------------------------------------------------------
    // Inbound traffic
    // ---------------------------------------------------------------------

    fn handle_link_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::Data(bytes) => {
                for item in self.scanner.push(&bytes) {
                    match item {
                        Ok(body) => match Packet::decode(&body) {
                            Ok(packet) => self.dispatch(packet, now),
                            Err(err) => {
                                tracing::warn!("dropping undecodable packet: {err}");
                            }
                        },
                        Err(err) => tracing::warn!("dropping corrupt frame: {err}"),
                    }
                    if self.state == ConnectionState::Disconnected {
                        break;
                    }
                }
            }
            LinkEvent::Closed { error } => {
                self.fail_connection(DisconnectReason::TransportClosed { detail: error }, now);
            }
        }
    }

    fn dispatch(&mut self, packet: Packet, now: Instant) {
        match packet {
            Packet::Reset => {
                if self.state == ConnectionState::Resetting {
                    tracing::info!("PCI reset acknowledged, link ready");
                    self.state = ConnectionState::Ready;
                    self.reset_deadline = None;
                    self.reconnect_attempts = 0;
                    self.backoff.reset();
                    self.clock.on_ready(now);
                    self.resync.on_ready(now);
                    self.emit(Event::Connected);
                } else {
                    tracing::debug!("ignoring reset echo outside of reset");
                }
            }
            Packet::Confirmation { tag, success } => {
                self.pci_error_run = 0;
                match self.outbound.confirm(tag, success, now) {
                    Confirmed::Resolved { completer } => {
                        if let Some(completer) = completer {
                            let _ = completer.try_send(CommandOutcome::Success);
                        }
                        self.release_tag(tag, now);
                    }
                    Confirmed::Retry { frame } => {
                        tracing::debug!(tag = %(tag as char), "command NAKed, re-transmitting");
                        self.write(&frame, now);
                    }
                    Confirmed::Exhausted { completer, op } => {
                        tracing::warn!(tag = %(tag as char), ?op, "command NAKed out of attempts");
                        self.resolve_abandoned(completer, op);
                        self.release_tag(tag, now);
                    }
                    Confirmed::Unknown => {
                        tracing::debug!(tag = %(tag as char), "confirmation for unknown tag");
                    }
                }
            }
            Packet::PciError => {
                self.pci_error_run += 1;
                tracing::warn!(run = self.pci_error_run, "PCI cannot accept data");
                if self.pci_error_run >= self.opts.pci_error_flood_threshold {
                    self.fail_connection(DisconnectReason::PciErrorFlood, now);
                }
            }
            Packet::PointToMultipoint {
                source_address,
                application,
                sals,
                sal_error,
            } => {
                self.pci_error_run = 0;
                if let Some(err) = sal_error {
                    tracing::warn!("abandoning tail of broadcast packet: {err}");
                }
                for sal in sals {
                    self.dispatch_sal(source_address, application, sal, now);
                }
            }
            Packet::PointToPoint {
                unit_address, cal, ..
            } => {
                self.pci_error_run = 0;
                self.dispatch_cal(unit_address, cal, now);
            }
            Packet::DeviceManagement { parameter, value } => {
                tracing::debug!(parameter, value, "ignoring device management echo");
            }
        }
    }

    fn dispatch_sal(&mut self, source_address: u8, application: u8, sal: Sal, now: Instant) {
        match sal {
            Sal::On { group } => {
                self.groups.set_level(application, group, 255);
                self.emit(Event::LightingOn {
                    source_address,
                    application,
                    group,
                });
            }
            Sal::Off { group } => {
                self.groups.set_level(application, group, 0);
                self.emit(Event::LightingOff {
                    source_address,
                    application,
                    group,
                });
            }
            Sal::Ramp {
                group,
                level,
                duration_code,
            } => {
                self.groups.set_level(application, group, level);
                self.emit(Event::LightingRamp {
                    source_address,
                    application,
                    group,
                    level,
                    duration: RAMP_DURATIONS[usize::from(duration_code)],
                });
            }
            Sal::TerminateRamp { group } => {
                // The group holds whatever level the ramp reached; the next
                // status sweep trues the cache up.
                self.emit(Event::LightingTerminateRamp {
                    source_address,
                    application,
                    group,
                });
            }
            update @ (Sal::TimeUpdate { .. } | Sal::DateUpdate { .. }) => {
                self.emit(Event::ClockUpdate {
                    source_address,
                    update,
                });
            }
            Sal::ClockRequest { .. } => {
                self.emit(Event::ClockRequest { source_address });
                self.clock.on_request(now);
            }
            Sal::Temperature { group, degrees } => {
                self.emit(Event::Temperature {
                    source_address,
                    group,
                    degrees,
                });
            }
        }
    }

    fn dispatch_cal(&mut self, unit_address: u8, cal: Cal, now: Instant) {
        match cal {
            Cal::StatusReport {
                application,
                block_start,
                data: crate::protocol::cal::StatusData::Levels(levels),
            } => {
                let changed: Vec<bool> = levels
                    .iter()
                    .enumerate()
                    .map(|(i, &level)| {
                        self.groups
                            .set_level(application, block_start.wrapping_add(i as u8), level)
                    })
                    .collect();
                self.emit(Event::LevelReport {
                    application,
                    block_start,
                    levels: levels.clone(),
                    changed,
                });
                self.complete_status_watchers(application, block_start, &levels, now);
            }
            Cal::StatusReport { application, .. } => {
                tracing::debug!(application, "ignoring binary status report");
            }
            Cal::IdentifyReply { attribute, value } => {
                let position = self
                    .identify_watchers
                    .iter()
                    .position(|w| w.attribute == attribute);
                match position {
                    Some(idx) => {
                        let watcher = self.identify_watchers.remove(idx);
                        let _ = watcher
                            .respond
                            .try_send(IdentifyOutcome::Reply { attribute, value });
                    }
                    None => {
                        tracing::debug!(unit_address, attribute, "unsolicited identify reply");
                    }
                }
            }
            Cal::Reply { parameter, .. } => {
                tracing::debug!(unit_address, parameter, "parameter reply");
            }
            Cal::Acknowledge => {
                tracing::debug!(unit_address, "unit acknowledgement");
            }
            Cal::Identify { .. } | Cal::StatusRequest { .. } => {
                tracing::debug!(unit_address, "ignoring request CAL addressed to us");
            }
        }
    }

    fn complete_status_watchers(
        &mut self,
        application: u8,
        block_start: u8,
        levels: &[u8],
        now: Instant,
    ) {
        let mut resync_done = 0usize;
        let mut i = 0;
        while i < self.status_watchers.len() {
            let watcher = &self.status_watchers[i];
            if watcher.application == application && watcher.block_start == block_start {
                let watcher = self.status_watchers.swap_remove(i);
                match watcher.respond {
                    Some(respond) => {
                        let _ = respond.try_send(StatusOutcome::Report {
                            block_start,
                            levels: levels.to_vec(),
                        });
                    }
                    None => resync_done += 1,
                }
            } else {
                i += 1;
            }
        }
        if resync_done > 0 {
            for _ in 0..resync_done {
                self.resync.request_finished();
            }
            self.pump_resync(now);
        }
    }

    // ---------------------------------------------------------------------
    // Outbound traffic
    // ---------------------------------------------------------------------

    fn handle_command(&mut self, command: Command, now: Instant) -> Option<EngineExit> {
        match command {
            Command::LightingOn {
                application,
                group,
                respond,
            } => self.submit_lighting(
                application,
                Sal::On { group },
                respond,
                OperationKind::LightingOn,
                now,
            ),
            Command::LightingOff {
                application,
                group,
                respond,
            } => self.submit_lighting(
                application,
                Sal::Off { group },
                respond,
                OperationKind::LightingOff,
                now,
            ),
            Command::LightingRamp {
                application,
                group,
                level,
                duration_code,
                respond,
            } => self.submit_lighting(
                application,
                Sal::Ramp {
                    group,
                    level,
                    duration_code,
                },
                respond,
                OperationKind::LightingRamp,
                now,
            ),
            Command::LightingTerminateRamp {
                application,
                group,
                respond,
            } => self.submit_lighting(
                application,
                Sal::TerminateRamp { group },
                respond,
                OperationKind::LightingTerminateRamp,
                now,
            ),
            Command::RequestStatus {
                application,
                block_start,
                respond,
            } => {
                if self.state != ConnectionState::Ready {
                    let _ = respond.try_send(StatusOutcome::ConnectionLost);
                } else {
                    self.send_status_request(application, block_start, Some(respond), now);
                }
            }
            Command::Identify {
                unit_address,
                attribute,
                respond,
            } => {
                if self.state != ConnectionState::Ready {
                    let _ = respond.try_send(IdentifyOutcome::ConnectionLost);
                } else {
                    self.send_identify(unit_address, attribute, respond, now);
                }
            }
            Command::PublishTime => {
                self.clock.force();
            }
            Command::Close { respond } => {
                tracing::info!("close requested, draining engine state");
                self.closing = true;
                self.drop_connection(DisconnectReason::Closed);
                let _ = respond.try_send(());
                return Some(EngineExit::Closed);
            }
        }
        None
    }

    fn submit_lighting(
        &mut self,
        application: u8,
        sal: Sal,
        respond: Sender<CommandOutcome>,
        op: OperationKind,
        now: Instant,
    ) {
        if self.state != ConnectionState::Ready {
            let _ = respond.try_send(CommandOutcome::ConnectionLost);
            return;
        }
        let packet = Packet::PointToMultipoint {
            source_address: LOCAL_SOURCE_ADDRESS,
            application,
            sals: vec![sal],
            sal_error: None,
        };
        match packet.encode_body() {
            Ok(body) => self.submit_confirmed(body, Some(respond), op, now),
            Err(err) => {
                tracing::error!("failed to encode lighting command: {err}");
                let _ = respond.try_send(CommandOutcome::Abandoned);
            }
        }
    }

    fn send_status_request(
        &mut self,
        application: u8,
        block_start: u8,
        respond: Option<Sender<StatusOutcome>>,
        now: Instant,
    ) {
        let packet = Packet::PointToPoint {
            unit_address: BROADCAST_UNIT_ADDRESS,
            application: 0xFF,
            cal: Cal::StatusRequest {
                kind: StatusKind::Level,
                application,
                block_start,
            },
        };
        match packet.encode_body() {
            Ok(body) => {
                self.status_watchers.push(StatusWatcher {
                    application,
                    block_start,
                    deadline: now + self.opts.confirm_timeout,
                    respond,
                });
                self.submit_confirmed(body, None, OperationKind::StatusRequest, now);
            }
            Err(err) => {
                tracing::error!("failed to encode status request: {err}");
                if let Some(respond) = respond {
                    let _ = respond.try_send(StatusOutcome::Abandoned);
                } else {
                    self.resync.request_finished();
                }
            }
        }
    }

    fn send_identify(
        &mut self,
        unit_address: u8,
        attribute: u8,
        respond: Sender<IdentifyOutcome>,
        now: Instant,
    ) {
        let packet = Packet::PointToPoint {
            unit_address,
            application: 0xFF,
            cal: Cal::Identify { attribute },
        };
        match packet.encode_body() {
            Ok(body) => {
                self.identify_watchers.push(IdentifyWatcher {
                    attribute,
                    deadline: now + self.opts.confirm_timeout,
                    respond,
                });
                self.submit_confirmed(body, None, OperationKind::Identify, now);
            }
            Err(err) => {
                tracing::error!("failed to encode identify request: {err}");
                let _ = respond.try_send(IdentifyOutcome::Abandoned);
            }
        }
    }

    /// Attach a tag and put the frame on the wire, or park it until a tag
    /// frees up.
    fn submit_confirmed(
        &mut self,
        body: Vec<u8>,
        completer: Option<Sender<CommandOutcome>>,
        op: OperationKind,
        now: Instant,
    ) {
        match self.pool.acquire() {
            Some(tag) => self.transmit_with_tag(tag, body, completer, op, now),
            None => {
                tracing::debug!(?op, "all confirmation tags lent, deferring send");
                self.pool.defer(PendingSend {
                    body,
                    completer,
                    op,
                });
            }
        }
    }

    fn transmit_with_tag(
        &mut self,
        tag: u8,
        body: Vec<u8>,
        completer: Option<Sender<CommandOutcome>>,
        op: OperationKind,
        now: Instant,
    ) {
        let frame = smart_frame(&body, Some(tag));
        self.outbound
            .register(tag, frame.clone(), self.opts.max_attempts, completer, op, now);
        self.write(&frame, now);
    }

    fn release_tag(&mut self, tag: u8, now: Instant) {
        match self.pool.release(tag) {
            Released::Idle => {}
            Released::Handoff { waiter } => {
                self.transmit_with_tag(tag, waiter.body, waiter.completer, waiter.op, now);
            }
            Released::NotLent => {
                tracing::warn!(tag = %(tag as char), "release of a tag that was not lent");
            }
        }
    }

    fn resolve_abandoned(&mut self, completer: Option<Sender<CommandOutcome>>, op: OperationKind) {
        if let Some(completer) = completer {
            let _ = completer.try_send(CommandOutcome::Abandoned);
        }
        // Status and identify abandonment is reported when the matching
        // watcher times out, not per transmission.
        if !matches!(op, OperationKind::StatusRequest | OperationKind::Identify) {
            self.emit(Event::CommandAbandoned { op });
        }
    }

    fn write(&mut self, bytes: &[u8], now: Instant) -> bool {
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        match link.write_all(bytes) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("transport write failed: {err}");
                self.fail_connection(
                    DisconnectReason::TransportClosed {
                        detail: Some(err.to_string()),
                    },
                    now,
                );
                false
            }
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn handle_rejects_invalid_arguments_without_an_engine() {
        let (tx, _rx) = crossbeam::channel::unbounded();
        let handle = PciHandle { tx };

        assert!(matches!(
            handle.lighting_on(application::CLOCK, 1),
            Err(HandleError::NotLighting { .. })
        ));
        assert!(matches!(
            handle.lighting_ramp(application::LIGHTING, 1, 255, 4000),
            Err(HandleError::RampTooLong { .. })
        ));
        assert!(matches!(
            handle.request_status(application::LIGHTING, 3),
            Err(HandleError::BadBlockStart { .. })
        ));
    }
}
