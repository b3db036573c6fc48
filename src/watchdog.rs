// MIT License - Copyright (c) 2021 TJForc

//! Timer bookkeeping driven by the periodic tick: Powerlink watchdog,
//! panel silence detection and the rolling checksum error counter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::constants::WATCHDOG_EVENT_WINDOW;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    Ok,
    /// Timed out; try to restore the connection
    Retry,
    /// Too many timeouts in the rolling window
    GiveUp,
}

/// Expires unless reset by a panel keep-alive.
#[derive(Debug, Clone)]
pub struct Watchdog {
    last_reset: Instant,
    timeout: Duration,
    max_events: u32,
    events: VecDeque<Instant>,
}

impl Watchdog {
    pub fn new(now: Instant, timeout: Duration, max_events: u32) -> Self {
        Self { last_reset: now, timeout, max_events, events: VecDeque::new() }
    }

    pub fn reset(&mut self, now: Instant) {
        self.last_reset = now;
    }

    /// Forget past timeouts as well.
    pub fn reset_all(&mut self, now: Instant) {
        self.last_reset = now;
        self.events.clear();
    }

    /// Timeouts recorded within the last 24 hours.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn check(&mut self, now: Instant) -> WatchdogOutcome {
        if now.saturating_duration_since(self.last_reset) < self.timeout {
            return WatchdogOutcome::Ok;
        }
        self.last_reset = now;
        while let Some(&first) = self.events.front() {
            if now.saturating_duration_since(first) >= WATCHDOG_EVENT_WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.push_back(now);
        if self.events.len() >= self.max_events as usize {
            self.events.clear();
            WatchdogOutcome::GiveUp
        } else {
            WatchdogOutcome::Retry
        }
    }
}

/// Detects a panel that never speaks, or stops speaking.
#[derive(Debug, Clone)]
pub struct Liveness {
    started: Instant,
    last_receive: Option<Instant>,
    at_start: Duration,
    idle: Duration,
}

impl Liveness {
    pub fn new(now: Instant, at_start: Duration, idle: Duration) -> Self {
        Self { started: now, last_receive: None, at_start, idle }
    }

    pub fn note_receive(&mut self, now: Instant) {
        self.last_receive = Some(now);
    }

    pub fn last_receive(&self) -> Option<Instant> {
        self.last_receive
    }

    /// True when the silence limit has been reached.
    pub fn is_dead(&self, now: Instant) -> bool {
        match self.last_receive {
            None => now.saturating_duration_since(self.started) >= self.at_start,
            Some(last) => now.saturating_duration_since(last) >= self.idle,
        }
    }
}

/// Rolling count of checksum failures.
#[derive(Debug, Clone)]
pub struct CrcErrorTracker {
    limit: u32,
    window: Duration,
    errors: VecDeque<Instant>,
}

impl CrcErrorTracker {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window, errors: VecDeque::new() }
    }

    /// Record one failure. Returns true once the limit is exceeded.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&first) = self.errors.front() {
            if now.saturating_duration_since(first) >= self.window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
        self.errors.push_back(now);
        self.errors.len() > self.limit as usize
    }

    pub fn count(&self) -> usize {
        self.errors.len()
    }
}
