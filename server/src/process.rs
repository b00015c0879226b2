//! Deferred processes: delayed, repeatable, parameterized units of world work.
//!
//! Anything that wants work done on a later tick enqueues a [`ProcessSpec`].
//! The tick driver pumps the queue once per tick and hands every due process
//! to the handler registered for its [`ProcessKind`]. A process is never
//! dispatched before `enqueued_at + delay`, and processes that fall due at
//! the same instant come out in the order they went in.
//!
//! `repeat` is live: a process with `repeat > 0` and a non-zero delay is put
//! back with the same id, due one `delay` after its previous due time, until
//! the counter runs out or it is cancelled.

use crate::entity::EntityId;
use crate::error::ProcessError;
use crate::world::World;
use log::{info, trace, warn};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

pub type ProcessId = u64;

/// Closed set of deferred work the world knows how to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    // Server lifecycle
    ServerStartup,
    ServerShutdown,
    ShutdownCountdown,
    SaveAll,
    ReloadTables,

    // Broadcasts
    SystemMessage,
    Notice,
    ScheduledAnnouncement,

    TimeSystemUpdate,

    // Guild wars
    GuildWarDeclare,
    GuildWarPrepare,
    GuildWarStart,
    GuildWarEnd,
    GuildWarReward,
    SiegePrepare,
    SiegeStart,
    SiegeEnd,

    // Peripheral manager refreshes
    MarketUpdate,
    TitleUpdate,
    BundleUpdate,
    RankingUpdate,

    // World events
    WorldBossSpawn,
    WorldBossDespawn,
    EventStart,
    EventEnd,
    BonusExpStart,
    BonusExpEnd,

    KickAll,
    DespawnEntity,
}

/// What a caller asks for; turned into a [`Process`] on enqueue.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub kind: ProcessKind,
    pub params: [i64; 4],
    pub text: Option<String>,
    pub delay: Duration,
    pub repeat: u32,
}

impl ProcessSpec {
    pub fn new(kind: ProcessKind) -> Self {
        Self {
            kind,
            params: [0; 4],
            text: None,
            delay: Duration::ZERO,
            repeat: 0,
        }
    }

    /// Sets parameter `index` (0..4). Out-of-range indices are ignored.
    pub fn param(mut self, index: usize, value: i64) -> Self {
        if let Some(slot) = self.params.get_mut(index) {
            *slot = value;
        }
        self
    }

    pub fn params(mut self, params: [i64; 4]) -> Self {
        self.params = params;
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Process {
    pub id: ProcessId,
    pub kind: ProcessKind,
    pub params: [i64; 4],
    pub text: Option<String>,
    pub delay: Duration,
    /// Remaining re-runs after this one.
    pub repeat: u32,
    pub enqueued_at: Instant,
    pub due_at: Instant,
    sequence: u64,
}

impl Process {
    pub fn text_param(&self) -> Result<&str, ProcessError> {
        self.text.as_deref().ok_or(ProcessError::MissingText {
            id: self.id,
            kind: self.kind,
        })
    }
}

// Min-heap on (due_at, sequence).
impl Ord for Process {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Process {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.sequence == other.sequence
    }
}

impl Eq for Process {}

/// The world's queue of pending deferred processes.
pub struct ProcessQueue {
    pending: BinaryHeap<Process>,
    next_id: ProcessId,
    next_sequence: u64,
}

impl ProcessQueue {
    pub fn new() -> Self {
        Self {
            pending: BinaryHeap::new(),
            next_id: 1,
            next_sequence: 0,
        }
    }

    pub fn enqueue(&mut self, spec: ProcessSpec, now: Instant) -> ProcessId {
        let id = self.next_id;
        self.next_id += 1;

        let process = Process {
            id,
            kind: spec.kind,
            params: spec.params,
            text: spec.text,
            delay: spec.delay,
            repeat: spec.repeat,
            enqueued_at: now,
            due_at: now + spec.delay,
            sequence: self.take_sequence(),
        };

        trace!(
            "Enqueued process {} ({:?}) delay={:?} repeat={}",
            id,
            process.kind,
            process.delay,
            process.repeat
        );
        self.pending.push(process);
        id
    }

    /// Removes and returns every process due at `now`, oldest due first.
    ///
    /// Repeating processes are re-armed after the sweep, so a process never
    /// fires twice in the same pump.
    pub fn pump(&mut self, now: Instant) -> Vec<Process> {
        let mut due = Vec::new();
        while self.pending.peek().map_or(false, |p| p.due_at <= now) {
            if let Some(process) = self.pending.pop() {
                due.push(process);
            }
        }

        for process in &due {
            if process.repeat > 0 && !process.delay.is_zero() {
                let mut next = process.clone();
                next.repeat -= 1;
                next.due_at = process.due_at + process.delay;
                next.sequence = self.take_sequence();
                self.pending.push(next);
            }
        }

        due
    }

    /// Drops a pending process, including any future repeats.
    pub fn cancel(&mut self, id: ProcessId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.id != id);
        before != self.pending.len()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.pending.peek().map(|p| p.due_at)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }
}

impl Default for ProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub type ProcessHandler = Box<dyn FnMut(&mut World, &Process) -> Result<(), ProcessError> + Send>;

/// Result of handing one process to the registry.
#[derive(Debug)]
pub enum Dispatch {
    Handled,
    Unhandled,
    Failed(ProcessError),
}

/// Maps each process kind to the code that runs it.
pub struct ProcessHandlers {
    handlers: HashMap<ProcessKind, ProcessHandler>,
}

impl ProcessHandlers {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry preloaded with the handlers the core itself relies on.
    pub fn with_core_handlers() -> Self {
        let mut handlers = Self::new();

        for kind in [
            ProcessKind::SystemMessage,
            ProcessKind::Notice,
            ProcessKind::ScheduledAnnouncement,
        ] {
            handlers.register(kind, |world, process| {
                let text = process.text_param()?;
                world.broadcast_notice(text);
                Ok(())
            });
        }

        handlers.register(ProcessKind::TimeSystemUpdate, |world, process| {
            let bucket = u8::try_from(process.params[0])
                .ok()
                .filter(|b| *b < 96)
                .ok_or_else(|| ProcessError::Failed {
                    id: process.id,
                    kind: process.kind,
                    reason: format!("game time bucket {} out of range", process.params[0]),
                })?;
            world.set_game_time(bucket);
            Ok(())
        });

        handlers.register(ProcessKind::ShutdownCountdown, |world, process| {
            let seconds = process.params[0];
            world.broadcast_notice(&format!("Server shutting down in {} seconds", seconds));
            Ok(())
        });

        handlers.register(ProcessKind::ServerShutdown, |world, _| {
            info!("Shutdown requested by deferred process");
            world.request_shutdown();
            Ok(())
        });

        handlers.register(ProcessKind::KickAll, |world, process| {
            let reason = process.text.as_deref().unwrap_or("Server maintenance");
            let kicked = world.registry().kick_all(reason);
            info!("Kicked {} sessions", kicked);
            Ok(())
        });

        handlers.register(ProcessKind::DespawnEntity, |world, process| {
            let id = EntityId(process.params[0] as u64);
            world
                .despawn(id)
                .map(|_| ())
                .ok_or_else(|| ProcessError::Failed {
                    id: process.id,
                    kind: process.kind,
                    reason: format!("entity {} does not exist", id),
                })
        });

        handlers
    }

    /// Installs a handler, returning whichever one it replaced.
    pub fn register<F>(&mut self, kind: ProcessKind, handler: F) -> Option<ProcessHandler>
    where
        F: FnMut(&mut World, &Process) -> Result<(), ProcessError> + Send + 'static,
    {
        self.handlers.insert(kind, Box::new(handler))
    }

    pub fn is_registered(&self, kind: ProcessKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Runs the handler for one process. A panicking handler is contained
    /// and reported as a failure.
    pub fn dispatch(&mut self, world: &mut World, process: &Process) -> Dispatch {
        let Some(handler) = self.handlers.get_mut(&process.kind) else {
            warn!(
                "No handler for process {} ({:?}), skipping",
                process.id, process.kind
            );
            return Dispatch::Unhandled;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler(world, process))) {
            Ok(Ok(())) => Dispatch::Handled,
            Ok(Err(e)) => Dispatch::Failed(e),
            Err(_) => Dispatch::Failed(ProcessError::Failed {
                id: process.id,
                kind: process.kind,
                reason: "handler panicked".to_string(),
            }),
        }
    }
}

impl Default for ProcessHandlers {
    fn default() -> Self {
        Self::with_core_handlers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::physics::Vector2;
    use crate::session::{Login, Session, SessionId};
    use crate::session_registry::SessionRegistry;
    use crate::world::EntityKind;
    use chrono::NaiveDate;
    use realm_shared::Packet;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_util::sync::CancellationToken;

    fn kinds(processes: &[Process]) -> Vec<ProcessKind> {
        processes.iter().map(|p| p.kind).collect()
    }

    #[test]
    fn test_zero_delay_due_same_tick() {
        let mut queue = ProcessQueue::new();
        let t = Instant::now();
        let id = queue.enqueue(
            ProcessSpec::new(ProcessKind::SystemMessage).text("hello"),
            t,
        );

        let due = queue.pump(t);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        assert_eq!(due[0].text.as_deref(), Some("hello"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_never_dispatched_early() {
        let mut queue = ProcessQueue::new();
        let t = Instant::now();
        queue.enqueue(
            ProcessSpec::new(ProcessKind::SystemMessage).delay(Duration::from_millis(5000)),
            t,
        );

        for ms in [0u64, 16, 1000, 4999] {
            assert!(queue.pump(t + Duration::from_millis(ms)).is_empty());
        }
        assert_eq!(queue.pump(t + Duration::from_millis(5000)).len(), 1);
    }

    #[test]
    fn test_equal_due_preserves_enqueue_order() {
        let mut queue = ProcessQueue::new();
        let t = Instant::now();
        let delay = Duration::from_millis(100);

        queue.enqueue(ProcessSpec::new(ProcessKind::GuildWarPrepare).delay(delay), t);
        queue.enqueue(ProcessSpec::new(ProcessKind::GuildWarStart).delay(delay), t);
        queue.enqueue(ProcessSpec::new(ProcessKind::GuildWarEnd).delay(delay), t);

        let due = queue.pump(t + delay);
        assert_eq!(
            kinds(&due),
            vec![
                ProcessKind::GuildWarPrepare,
                ProcessKind::GuildWarStart,
                ProcessKind::GuildWarEnd
            ]
        );
    }

    #[test]
    fn test_earlier_due_first() {
        let mut queue = ProcessQueue::new();
        let t = Instant::now();
        queue.enqueue(
            ProcessSpec::new(ProcessKind::MarketUpdate).delay(Duration::from_secs(2)),
            t,
        );
        queue.enqueue(
            ProcessSpec::new(ProcessKind::TitleUpdate).delay(Duration::from_secs(1)),
            t,
        );

        let due = queue.pump(t + Duration::from_secs(3));
        assert_eq!(
            kinds(&due),
            vec![ProcessKind::TitleUpdate, ProcessKind::MarketUpdate]
        );
    }

    #[test]
    fn test_repeat_rearms_until_exhausted() {
        let mut queue = ProcessQueue::new();
        let t = Instant::now();
        let period = Duration::from_secs(10);
        let id = queue.enqueue(
            ProcessSpec::new(ProcessKind::ScheduledAnnouncement)
                .text("vote for the server")
                .delay(period)
                .repeat(2),
            t,
        );

        let mut fired = Vec::new();
        for step in 1..=5u32 {
            for p in queue.pump(t + period * step) {
                assert_eq!(p.id, id);
                fired.push(p.repeat);
            }
        }
        assert_eq!(fired, vec![2, 1, 0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_repeat_never_fires_twice_in_one_pump() {
        let mut queue = ProcessQueue::new();
        let t = Instant::now();
        let period = Duration::from_millis(10);
        queue.enqueue(
            ProcessSpec::new(ProcessKind::RankingUpdate)
                .delay(period)
                .repeat(100),
            t,
        );

        // Far in the future: still just one firing per pump.
        let late = t + Duration::from_secs(60);
        assert_eq!(queue.pump(late).len(), 1);
        assert_eq!(queue.pump(late).len(), 1);
    }

    #[test]
    fn test_zero_delay_repeat_is_single_shot() {
        let mut queue = ProcessQueue::new();
        let t = Instant::now();
        queue.enqueue(ProcessSpec::new(ProcessKind::SaveAll).repeat(5), t);
        assert_eq!(queue.pump(t).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_pending_and_repeats() {
        let mut queue = ProcessQueue::new();
        let t = Instant::now();
        let period = Duration::from_secs(1);
        let id = queue.enqueue(
            ProcessSpec::new(ProcessKind::EventStart)
                .delay(period)
                .repeat(3),
            t,
        );

        assert_eq!(queue.pump(t + period).len(), 1);
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert!(queue.pump(t + period * 10).is_empty());
    }

    #[test]
    fn test_spec_builder_params() {
        let spec = ProcessSpec::new(ProcessKind::GuildWarDeclare)
            .param(0, 11)
            .param(3, 44)
            .param(9, 99);
        assert_eq!(spec.params, [11, 0, 0, 44]);
    }

    #[test]
    fn test_next_due() {
        let mut queue = ProcessQueue::new();
        let t = Instant::now();
        assert!(queue.next_due().is_none());
        queue.enqueue(
            ProcessSpec::new(ProcessKind::BonusExpEnd).delay(Duration::from_secs(30)),
            t,
        );
        assert_eq!(queue.next_due(), Some(t + Duration::from_secs(30)));
    }

    #[test]
    fn test_missing_text_param() {
        let mut queue = ProcessQueue::new();
        let t = Instant::now();
        queue.enqueue(ProcessSpec::new(ProcessKind::Notice), t);
        let process = queue.pump(t).remove(0);
        assert!(matches!(
            process.text_param(),
            Err(ProcessError::MissingText { .. })
        ));
    }

    #[test]
    fn test_core_handlers_registered() {
        let handlers = ProcessHandlers::with_core_handlers();
        assert!(handlers.is_registered(ProcessKind::SystemMessage));
        assert!(handlers.is_registered(ProcessKind::TimeSystemUpdate));
        assert!(handlers.is_registered(ProcessKind::ServerShutdown));
        assert!(!handlers.is_registered(ProcessKind::GuildWarStart));
    }

    fn handler_world() -> World {
        let registry = Arc::new(SessionRegistry::new(8, Duration::from_secs(120)));
        let noon = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        World::initialize(
            &ServerConfig::default(),
            registry,
            CancellationToken::new(),
            noon,
        )
        .unwrap()
    }

    fn signed_in(world: &World, id: SessionId) -> (Arc<Session>, UnboundedReceiver<Packet>) {
        let (session, rx) = Session::new(id, "127.0.0.1:1".parse().unwrap(), CancellationToken::new());
        session.authenticate(Login {
            login_id: id,
            account: format!("acct{}", id),
            character_name: format!("Hero{}", id),
        });
        let session = Arc::new(session);
        world.registry().register(Arc::clone(&session)).unwrap();
        (session, rx)
    }

    fn run(handlers: &mut ProcessHandlers, world: &mut World, spec: ProcessSpec) -> Dispatch {
        let mut queue = ProcessQueue::new();
        let t = Instant::now();
        queue.enqueue(spec, t);
        let process = queue.pump(t).remove(0);
        handlers.dispatch(world, &process)
    }

    #[test]
    fn test_kick_all_disconnects_with_reason() {
        let mut world = handler_world();
        let mut handlers = ProcessHandlers::with_core_handlers();
        let (a, mut rx_a) = signed_in(&world, 1);
        let (b, mut rx_b) = signed_in(&world, 2);

        let spec = ProcessSpec::new(ProcessKind::KickAll).text("Patch day");
        assert!(matches!(run(&mut handlers, &mut world, spec), Dispatch::Handled));

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(
                rx.try_recv().ok(),
                Some(Packet::Disconnected {
                    reason: "Patch day".into()
                })
            );
        }
        assert!(a.is_closed());
        assert!(b.is_closed());
    }

    #[test]
    fn test_despawn_entity_handler() {
        let mut world = handler_world();
        let mut handlers = ProcessHandlers::with_core_handlers();
        let id = world.spawn(EntityKind::Monster, "Slime", Vector2::new(10.0, 10.0));

        let spec = ProcessSpec::new(ProcessKind::DespawnEntity).param(0, id.0 as i64);
        assert!(matches!(run(&mut handlers, &mut world, spec), Dispatch::Handled));
        assert!(world.entity(id).is_none());

        // A second despawn of the same id is reported, not ignored.
        let spec = ProcessSpec::new(ProcessKind::DespawnEntity).param(0, id.0 as i64);
        assert!(matches!(
            run(&mut handlers, &mut world, spec),
            Dispatch::Failed(ProcessError::Failed { .. })
        ));
    }

    #[test]
    fn test_shutdown_countdown_notice() {
        let mut world = handler_world();
        let mut handlers = ProcessHandlers::with_core_handlers();
        let (_session, mut rx) = signed_in(&world, 1);

        let spec = ProcessSpec::new(ProcessKind::ShutdownCountdown).param(0, 30);
        assert!(matches!(run(&mut handlers, &mut world, spec), Dispatch::Handled));
        assert_eq!(
            rx.try_recv().ok(),
            Some(Packet::Notice {
                text: "Server shutting down in 30 seconds".into()
            })
        );
        assert!(!world.shutdown_requested());
    }
}
