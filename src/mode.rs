// MIT License - Copyright (c) 2021 TJForc

//! Connection modes and the enrollment state machine.
//!
//! The engine starts by downloading the panel EPROM, then asks to be
//! enrolled as a Powerlink module. Whenever that path fails it falls back
//! to Standard mode (StandardPlus if the master PIN was recovered), which
//! is terminal for the session apart from a Powerlink → Problem detour.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::comm::PanelComm;
use crate::eprom::{self, BlockRequest};
use crate::event::{ConditionKind, PanelCondition, PanelEvent};
use crate::protocol::{encode_code, Command, CommandBuilder, OutboundCommand};
use crate::transport::ByteSink;
use crate::watchdog::WatchdogOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Starting,
    Standard,
    /// Standard mode with the master PIN known from the EPROM
    StandardPlus,
    Download,
    PowerlinkPending,
    Powerlink,
    /// Powerlink with an unanswered command; recovers on the next keep-alive
    Problem,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Standard => "Standard",
            Self::StandardPlus => "StandardPlus",
            Self::Download => "Download",
            Self::PowerlinkPending => "PowerlinkPending",
            Self::Powerlink => "Powerlink",
            Self::Problem => "Problem",
        }
    }

    pub fn is_standard(&self) -> bool {
        matches!(self, Self::Standard | Self::StandardPlus)
    }

    /// Enrolled as a Powerlink module (possibly degraded).
    pub fn is_powerlink(&self) -> bool {
        matches!(self, Self::Powerlink | Self::Problem)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `from → to` is a legal transition.
pub fn is_allowed(from: Mode, to: Mode) -> bool {
    use Mode::*;
    match (from, to) {
        (Starting, _) => true,
        (_, Standard | StandardPlus) => true,
        (Download, PowerlinkPending) => true,
        (PowerlinkPending, Powerlink) => true,
        (Powerlink, Problem) | (Problem, Powerlink) => true,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct ModeMachine {
    mode: Mode,
}

impl Default for ModeMachine {
    fn default() -> Self {
        Self { mode: Mode::Starting }
    }
}

impl ModeMachine {
    pub fn current(&self) -> Mode {
        self.mode
    }

    /// Move to `to`. Returns `(old, new)` if the mode actually changed.
    pub fn transition(&mut self, to: Mode) -> Option<(Mode, Mode)> {
        let from = self.mode;
        if from == to {
            return None;
        }
        if !is_allowed(from, to) {
            warn!("Ignoring mode change {} -> {}", from, to);
            return None;
        }
        self.mode = to;
        Some((from, to))
    }
}

/// Progress of an EPROM download.
#[derive(Debug, Clone, Default)]
pub struct DownloadState {
    pub started: Option<Instant>,
    pub blocks: VecDeque<BlockRequest>,
    /// Block most recently requested
    pub current: Option<BlockRequest>,
    /// Short blocks and incomplete passes re-requested so far
    pub retries: u32,
    /// Panel asked us to retry the download at this instant
    pub retry_at: Option<Instant>,
    /// The panel has accepted a download command
    pub active: bool,
    pub complete: bool,
}

impl DownloadState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.started
            .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollCheck {
    Wait,
    Resend,
    GiveUp,
}

/// Enrollment attempts while waiting for the panel to accept us.
#[derive(Debug, Clone, Default)]
pub struct Enrollment {
    /// An auto-enroll has been sent this session
    pub auto_enroll_done: bool,
    pub pending_since: Option<Instant>,
    pub last_attempt: Option<Instant>,
}

impl Enrollment {
    pub fn begin(&mut self, now: Instant) {
        self.pending_since = Some(now);
        self.last_attempt = Some(now);
    }

    pub fn clear(&mut self) {
        self.pending_since = None;
        self.last_attempt = None;
    }

    pub fn check(&self, now: Instant, retry_delay: Duration, timeout: Duration) -> EnrollCheck {
        let Some(since) = self.pending_since else {
            return EnrollCheck::Wait;
        };
        if now.saturating_duration_since(since) >= timeout {
            return EnrollCheck::GiveUp;
        }
        match self.last_attempt {
            Some(last) if now.saturating_duration_since(last) < retry_delay => EnrollCheck::Wait,
            _ => EnrollCheck::Resend,
        }
    }
}

impl<S: ByteSink> PanelComm<S> {
    /// Change mode and notify subscribers. Returns false if nothing changed.
    pub(crate) fn set_mode(&mut self, to: Mode) -> bool {
        match self.mode.transition(to) {
            Some((old, new)) => {
                info!("Mode change: {} -> {}", old, new);
                self.emit(PanelEvent::ModeChanged { old, new });
                true
            }
            None => false,
        }
    }

    pub(crate) fn emit_condition(&self, condition: PanelCondition) {
        debug!("Condition: {}", condition.kind.name());
        self.emit(PanelEvent::Condition(condition));
    }

    /// Queue a command carrying the download code at `offset`.
    fn enqueue_with_code(&mut self, command: Command, offset: usize) {
        let built = encode_code(&self.config.download_code)
            .and_then(|code| CommandBuilder::new(command).patch(offset, code).build());
        match built {
            Ok(cmd) => self.queue.enqueue(cmd),
            Err(e) => warn!("Cannot build {:?}: {}", command, e),
        }
    }

    pub(crate) fn request_download(&mut self) {
        self.enqueue_with_code(Command::Download, 3);
    }

    /// Kick off the EPROM download.
    pub(crate) fn begin_download(&mut self, now: Instant) {
        info!("Starting EPROM download");
        self.download.reset();
        self.download.started = Some(now);
        self.queue.enqueue(OutboundCommand::plain(Command::Exit));
        self.queue.enqueue(OutboundCommand::plain(Command::Stop));
        if self.config.send_init {
            self.queue.enqueue(OutboundCommand::plain(Command::Init));
        }
        self.request_download();
        self.set_mode(Mode::Download);
    }

    pub(crate) fn send_enroll(&mut self, now: Instant) {
        info!("Sending Powerlink enroll request");
        self.enrollment.auto_enroll_done = true;
        self.enrollment.last_attempt = Some(now);
        self.enqueue_with_code(Command::Enroll, 4);
    }

    /// Request the next planned block, or finish when none remain.
    pub(crate) fn request_next_block(&mut self, now: Instant) {
        let Some(block) = self.download.blocks.pop_front() else {
            self.download.current = None;
            self.finish_download(now);
            return;
        };
        self.download.current = Some(block);
        match CommandBuilder::new(Command::DownloadBlock)
            .patch(1, block.patch_bytes())
            .build()
        {
            Ok(cmd) => self.queue.enqueue(cmd),
            Err(e) => warn!("Cannot build block request {:?}: {}", block, e),
        }
    }

    /// Re-request the block that is currently outstanding.
    pub(crate) fn rerequest_block(&mut self) {
        if let Some(block) = self.download.current.take() {
            self.download.blocks.push_front(block);
        }
    }

    fn finish_download(&mut self, now: Instant) {
        let Some(caps) = self.caps else {
            warn!("Download finished without panel identification");
            self.fallback_to_standard(now);
            return;
        };
        let decoded = eprom::decode(&self.eprom, caps);
        if !decoded.is_complete() {
            warn!("EPROM incomplete, missing pages {:02X?}", decoded.missing_pages);
            if self.download.retries >= self.config.timing.download_retry_limit {
                self.fallback_to_standard(now);
                return;
            }
            self.download.retries += 1;
            let blocks: VecDeque<_> = eprom::plan_blocks(&eprom::download_ranges(caps))
                .into_iter()
                .filter(|b| {
                    let last = b.address().saturating_add(b.len.saturating_sub(1));
                    let last_page = last.to_be_bytes()[0];
                    decoded.missing_pages.range(b.page..=last_page).next().is_some()
                })
                .collect();
            if blocks.is_empty() {
                self.fallback_to_standard(now);
                return;
            }
            self.download.blocks = blocks;
            self.request_next_block(now);
            return;
        }

        info!("EPROM download complete ({} pages)", self.eprom.page_count());
        self.apply_eprom(decoded);
        self.download.complete = true;
        self.download.active = false;
        self.emit_condition(PanelCondition::new(ConditionKind::DownloadSuccess));
        self.queue.enqueue(OutboundCommand::plain(Command::Exit));
    }

    /// Download done and decoded; ask the panel to accept us.
    pub(crate) fn enter_pending(&mut self, now: Instant) {
        if self.set_mode(Mode::PowerlinkPending) {
            self.download.started = None;
            self.enrollment.begin(now);
            self.queue.enqueue(OutboundCommand::plain(Command::Restore));
        }
    }

    pub(crate) fn enter_powerlink(&mut self, now: Instant) {
        if self.set_mode(Mode::Powerlink) {
            self.enrollment.clear();
            self.watchdog.reset_all(now);
            self.queue.enqueue(OutboundCommand::plain(Command::Restore));
            if self.config.auto_sync_time {
                self.queue.enqueue(OutboundCommand::plain(Command::GetTime));
            }
        }
    }

    /// Abandon download and Powerlink for the rest of the session.
    pub(crate) fn fallback_to_standard(&mut self, now: Instant) {
        let target = if self.status.has_pin() { Mode::StandardPlus } else { Mode::Standard };
        let was_download = self.mode.current() == Mode::Download;
        if !self.set_mode(target) {
            return;
        }
        self.queue.clear();
        self.download.reset();
        self.enrollment.clear();
        self.watchdog.reset_all(now);
        if was_download {
            self.queue.enqueue(OutboundCommand::plain(Command::Exit));
        }
        if self.config.send_init {
            self.queue.enqueue(OutboundCommand::plain(Command::Init));
        }
        self.queue.enqueue(OutboundCommand::plain(Command::Status));
        if self.eprom.is_empty() {
            self.queue.enqueue(OutboundCommand::plain(Command::ZoneNames));
            self.queue.enqueue(OutboundCommand::plain(Command::ZoneTypes));
        }
    }

    /// The queue gave up on `command` after its resend.
    pub(crate) fn handle_no_response(&mut self, command: Command, now: Instant) {
        warn!("No response to {:?}", command);
        self.emit_condition(PanelCondition::new(ConditionKind::CommandNoResponse));
        match self.mode.current() {
            Mode::Powerlink => {
                self.set_mode(Mode::Problem);
                self.queue.enqueue(OutboundCommand::plain(Command::Restore));
            }
            Mode::Problem | Mode::PowerlinkPending => {
                self.queue.enqueue(OutboundCommand::plain(Command::Restore));
            }
            Mode::Download if command == Command::DownloadBlock && self.download.current.is_some() => {
                self.rerequest_block();
                self.request_next_block(now);
            }
            Mode::Download => {}
            _ => self.queue.enqueue(OutboundCommand::plain(Command::Status)),
        }
    }

    /// Time-driven mode checks, run from `tick`.
    pub(crate) fn check_mode_timers(&mut self, now: Instant) {
        let timing = self.config.timing.clone();
        match self.mode.current() {
            Mode::Download => {
                if let Some(at) = self.download.retry_at
                    && now >= at
                {
                    self.download.retry_at = None;
                    self.request_download();
                }
                if self.download.timed_out(now, timing.download_timeout) {
                    warn!("EPROM download timed out");
                    self.emit_condition(PanelCondition::new(ConditionKind::DownloadTimeout));
                    self.fallback_to_standard(now);
                }
            }
            Mode::PowerlinkPending => {
                match self.enrollment.check(now, timing.powerlink_retry_delay, timing.powerlink_timeout()) {
                    EnrollCheck::Wait => {}
                    EnrollCheck::Resend => self.send_enroll(now),
                    EnrollCheck::GiveUp => {
                        warn!("Panel never accepted Powerlink enrollment");
                        self.emit_condition(PanelCondition::new(ConditionKind::EnrollmentFailed));
                        self.fallback_to_standard(now);
                    }
                }
            }
            Mode::Powerlink | Mode::Problem => match self.watchdog.check(now) {
                WatchdogOutcome::Ok => {}
                WatchdogOutcome::Retry => {
                    warn!(
                        "Powerlink watchdog expired ({} in 24h), restoring connection",
                        self.watchdog.event_count()
                    );
                    self.emit_condition(PanelCondition::new(ConditionKind::WatchdogTimeoutRetrying));
                    if !self.queue.contains(Command::Restore) {
                        self.queue.enqueue(OutboundCommand::plain(Command::Restore));
                    }
                }
                WatchdogOutcome::GiveUp => {
                    warn!("Powerlink watchdog expired too often, giving up");
                    self.emit_condition(PanelCondition::new(ConditionKind::WatchdogTimeoutGivingUp));
                    self.fallback_to_standard(now);
                }
            },
            _ => {}
        }
    }
}
