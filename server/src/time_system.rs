//! Calendar-boundary notifications.
//!
//! The time system takes a wall-clock snapshot at most once per real minute
//! and compares its fields with the previous snapshot. For every field that
//! changed it notifies all subscribers, coarsest boundary first: year, month,
//! day, hour, minute.
//!
//! Subscribers sit in a revolving queue. For each boundary the dispatcher pops
//! exactly as many subscribers as were registered when the boundary started,
//! calls them, and pushes them back. Subscribers registered mid-dispatch are
//! parked and appended once the round is over, so they first hear about the
//! next boundary and never jump ahead of older subscribers.
//!
//! After the minute round, a change in the coarse game-time bucket enqueues a
//! `TimeSystemUpdate` process carrying the new bucket.

use crate::process::{ProcessId, ProcessKind, ProcessQueue, ProcessSpec};
use chrono::{Datelike, NaiveDateTime, TimeDelta, Timelike};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::time::Instant;

/// Minimum real time between two boundary checks.
pub const CHECK_INTERVAL_SECS: i64 = 60;

/// Number of game-time buckets in a day (one per 15 real minutes).
pub const GAME_TIME_BUCKETS: u8 = 96;

/// `hour * 4 + minute / 15`, always in `0..96`.
pub fn game_time_bucket(time: &NaiveDateTime) -> u8 {
    (time.hour() * 4 + time.minute() / 15) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Year,
    Month,
    Day,
    Hour,
    Minute,
}

/// Receives calendar-boundary notifications. Implement only what you need.
pub trait TimeSubscriber: Send {
    fn on_year_changed(&mut self, _now: NaiveDateTime, _ctx: &mut TimeContext<'_>) {}
    fn on_month_changed(&mut self, _now: NaiveDateTime, _ctx: &mut TimeContext<'_>) {}
    fn on_day_changed(&mut self, _now: NaiveDateTime, _ctx: &mut TimeContext<'_>) {}
    fn on_hour_changed(&mut self, _now: NaiveDateTime, _ctx: &mut TimeContext<'_>) {}
    fn on_minute_changed(&mut self, _now: NaiveDateTime, _ctx: &mut TimeContext<'_>) {}
}

/// What a subscriber may touch while it is being notified.
pub struct TimeContext<'a> {
    processes: &'a mut ProcessQueue,
    parked: &'a mut Vec<Box<dyn TimeSubscriber>>,
    now: Instant,
}

impl<'a> TimeContext<'a> {
    pub fn enqueue(&mut self, spec: ProcessSpec) -> ProcessId {
        self.processes.enqueue(spec, self.now)
    }

    /// Registers a subscriber; it joins after the current round.
    pub fn subscribe(&mut self, subscriber: Box<dyn TimeSubscriber>) {
        self.parked.push(subscriber);
    }

    pub fn instant(&self) -> Instant {
        self.now
    }
}

pub struct TimeSystem {
    last_tick_time: NaiveDateTime,
    current_time: NaiveDateTime,
    subscribers: VecDeque<Box<dyn TimeSubscriber>>,
    parked: Vec<Box<dyn TimeSubscriber>>,
    game_time: u8,
}

impl TimeSystem {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            last_tick_time: now,
            current_time: now,
            subscribers: VecDeque::new(),
            parked: Vec::new(),
            game_time: game_time_bucket(&now),
        }
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn TimeSubscriber>) {
        self.subscribers.push_back(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len() + self.parked.len()
    }

    pub fn game_time(&self) -> u8 {
        self.game_time
    }

    pub fn current_time(&self) -> NaiveDateTime {
        self.current_time
    }

    /// Called every tick. Returns the boundaries that fired, coarsest first.
    pub fn update(
        &mut self,
        now: NaiveDateTime,
        processes: &mut ProcessQueue,
        instant: Instant,
    ) -> Vec<Boundary> {
        let elapsed = now.signed_duration_since(self.last_tick_time);
        if elapsed < TimeDelta::zero() {
            warn!(
                "Wall clock moved backwards by {}s, resetting time check",
                -elapsed.num_seconds()
            );
            self.last_tick_time = now;
            return Vec::new();
        }
        if elapsed < TimeDelta::seconds(CHECK_INTERVAL_SECS) {
            return Vec::new();
        }

        self.last_tick_time = now;
        let previous = self.current_time;
        self.current_time = now;

        let mut fired = Vec::new();
        if previous.year() != now.year() {
            fired.push(Boundary::Year);
        }
        if previous.month() != now.month() {
            fired.push(Boundary::Month);
        }
        if previous.day() != now.day() {
            fired.push(Boundary::Day);
        }
        if previous.hour() != now.hour() {
            fired.push(Boundary::Hour);
        }
        if previous.minute() != now.minute() {
            fired.push(Boundary::Minute);
        }

        for boundary in &fired {
            self.dispatch(*boundary, now, processes, instant);
        }

        let bucket = game_time_bucket(&now);
        if bucket != self.game_time {
            debug!("Game time bucket {} -> {}", self.game_time, bucket);
            self.game_time = bucket;
            processes.enqueue(
                ProcessSpec::new(ProcessKind::TimeSystemUpdate).param(0, i64::from(bucket)),
                instant,
            );
        }

        fired
    }

    fn dispatch(
        &mut self,
        boundary: Boundary,
        now: NaiveDateTime,
        processes: &mut ProcessQueue,
        instant: Instant,
    ) {
        let round = self.subscribers.len();
        trace!("{:?} boundary at {} for {} subscribers", boundary, now, round);

        for _ in 0..round {
            let Some(mut subscriber) = self.subscribers.pop_front() else {
                break;
            };

            let mut ctx = TimeContext {
                processes: &mut *processes,
                parked: &mut self.parked,
                now: instant,
            };
            match boundary {
                Boundary::Year => subscriber.on_year_changed(now, &mut ctx),
                Boundary::Month => subscriber.on_month_changed(now, &mut ctx),
                Boundary::Day => subscriber.on_day_changed(now, &mut ctx),
                Boundary::Hour => subscriber.on_hour_changed(now, &mut ctx),
                Boundary::Minute => subscriber.on_minute_changed(now, &mut ctx),
            }

            self.subscribers.push_back(subscriber);
        }

        self.subscribers.extend(self.parked.drain(..));
    }
}
