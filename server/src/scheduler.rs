//! The tick driver.
//!
//! One task owns the [`World`] and runs [`Scheduler::tick`] at a fixed
//! interval. Each tick does, strictly in this order:
//! 1. drain session events (joins, intents, leaves) without waiting
//! 2. pump due deferred processes through their handlers
//! 3. let the time system check for calendar boundaries
//! 4. update every live entity
//!
//! Ticks never overlap. A slow tick delays the next one instead of
//! queueing a burst.

use crate::network::SessionEvent;
use crate::process::{Dispatch, ProcessHandlers};
use crate::time_system::{Boundary, TimeSystem};
use crate::world::World;
use chrono::NaiveDateTime;
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Longest step handed to entity integration.
pub const MAX_DELTA: Duration = Duration::from_millis(50);

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub events: usize,
    pub processes_run: usize,
    pub processes_failed: usize,
    pub boundaries: Vec<Boundary>,
    pub entities_moved: usize,
    pub entities_expired: usize,
}

pub struct Scheduler {
    world: World,
    handlers: ProcessHandlers,
    time: TimeSystem,
    events: UnboundedReceiver<SessionEvent>,
    tick_interval: Duration,
    stats_interval: u64,
    last_tick: Option<Instant>,
}

impl Scheduler {
    pub fn new(
        world: World,
        handlers: ProcessHandlers,
        time: TimeSystem,
        events: UnboundedReceiver<SessionEvent>,
        tick_interval: Duration,
        stats_interval: u64,
    ) -> Self {
        Self {
            world,
            handlers,
            time,
            events,
            tick_interval,
            stats_interval: stats_interval.max(1),
            last_tick: None,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn handlers_mut(&mut self) -> &mut ProcessHandlers {
        &mut self.handlers
    }

    pub fn time_system_mut(&mut self) -> &mut TimeSystem {
        &mut self.time
    }

    /// Runs one tick. `now` drives process due times and entity motion,
    /// `wall` drives the calendar.
    pub fn tick(&mut self, now: Instant, wall: NaiveDateTime) -> TickReport {
        let mut report = TickReport::default();

        // 1. Network events
        while let Ok(event) = self.events.try_recv() {
            self.world.handle_event(event);
            report.events += 1;
        }

        // 2. Deferred processes
        let due = self.world.processes_mut().pump(now);
        for process in due {
            match self.handlers.dispatch(&mut self.world, &process) {
                Dispatch::Handled => report.processes_run += 1,
                Dispatch::Unhandled => {}
                Dispatch::Failed(e) => {
                    report.processes_failed += 1;
                    error!(
                        "Process {} ({:?}) params={:?} text={:?}: {}",
                        process.id, process.kind, process.params, process.text, e
                    );
                }
            }
        }

        // 3. Calendar
        report.boundaries = self.time.update(wall, self.world.processes_mut(), now);

        // 4. Entities
        let dt = match self.last_tick {
            Some(last) => now.saturating_duration_since(last),
            None => self.tick_interval,
        };
        if dt > MAX_DELTA {
            warn!(
                "Tick {} took {:.3}s, capping step to {:.3}s",
                self.world.tick(),
                dt.as_secs_f32(),
                MAX_DELTA.as_secs_f32()
            );
        }
        self.last_tick = Some(now);
        let update = self.world.update_entities(dt.min(MAX_DELTA).as_secs_f32(), now);
        report.entities_moved = update.moved;
        report.entities_expired = update.expired;

        report.tick = self.world.advance_tick();
        if report.tick % self.stats_interval == 0 {
            let stats = self.world.registry().stats();
            debug!(
                "Tick {}: {} entities, {} pending processes, {} sessions, {}B out / {}B in",
                report.tick,
                self.world.entity_count(),
                self.world.processes().len(),
                stats.active_sessions,
                stats.bytes_sent,
                stats.bytes_received
            );
        }

        report
    }

    /// Ticks until `cancel` fires, then hands the scheduler back.
    pub async fn run(mut self, cancel: CancellationToken) -> Self {
        let mut timer = interval(self.tick_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Tick loop running every {:?}", self.tick_interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    let wall = chrono::Local::now().naive_local();
                    self.tick(Instant::now(), wall);
                }
            }
        }

        info!("Tick loop stopped at tick {}", self.world.tick());
        self
    }

    pub fn into_parts(self) -> (World, ProcessHandlers, TimeSystem) {
        (self.world, self.handlers, self.time)
    }
}
