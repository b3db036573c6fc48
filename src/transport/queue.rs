// MIT License - Copyright (c) 2021 TJForc

//! Outbound command queue and acknowledge coordinator.
//!
//! Only one command is ever in flight: nothing new is sent while the reply
//! set of the previous command is outstanding. An unanswered command is
//! resent once after the response timeout; a second timeout hands control
//! back to the caller to resynchronise.

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::constants::MIN_INTER_MESSAGE_GAP;
use crate::protocol::{msg_type, Command, OutboundCommand};

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    AwaitingResponse { since: Instant },
    /// The single permitted resend has been made
    Resent { since: Instant },
}

/// What the caller should do after [`SendQueue::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueAction {
    /// Write this PDU now
    Send { command: OutboundCommand, pdu: Vec<u8>, resend: bool },
    /// Nothing can be sent before this instant
    WaitUntil(Instant),
    /// Second timeout; queue and expectations have been cleared
    Escalate { command: Command },
    Idle,
}

#[derive(Debug)]
pub struct SendQueue {
    queue: VecDeque<OutboundCommand>,
    state: QueueState,
    in_flight: Option<OutboundCommand>,
    expected: BTreeSet<u8>,
    last_transmit: Option<Instant>,
    /// Post-send delay of the last command
    hold_until: Option<Instant>,
    response_timeout: Duration,
}

impl SendQueue {
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            state: QueueState::Idle,
            in_flight: None,
            expected: BTreeSet::new(),
            last_transmit: None,
            hold_until: None,
            response_timeout,
        }
    }

    pub fn enqueue(&mut self, command: OutboundCommand) {
        debug!("Queue: {} ({} pending)", command.template().description, self.queue.len());
        self.queue.push_back(command);
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Reply types still outstanding for the in-flight command.
    pub fn expected(&self) -> &BTreeSet<u8> {
        &self.expected
    }

    pub fn in_flight(&self) -> Option<&OutboundCommand> {
        self.in_flight.as_ref()
    }

    pub fn last_transmit(&self) -> Option<Instant> {
        self.last_transmit
    }

    /// True when nothing is queued or outstanding.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.expected.is_empty()
    }

    pub fn contains(&self, command: Command) -> bool {
        self.queue.iter().any(|c| c.command == command)
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// Drop everything queued and outstanding.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.expected.clear();
        self.in_flight = None;
        self.state = QueueState::Idle;
    }

    /// The panel refused the in-flight command; stop waiting for its replies.
    pub fn abandon(&mut self) {
        self.expected.clear();
        self.in_flight = None;
        self.state = QueueState::Idle;
    }

    /// Record that an ACK was written outside the queue.
    pub fn note_transmit(&mut self, now: Instant) {
        self.last_transmit = Some(now);
    }

    /// Mark a received message type. Returns true if it satisfied an expectation.
    pub fn received(&mut self, t: u8) -> bool {
        let hit = self.expected.remove(&t);
        if hit && self.expected.is_empty() {
            self.state = QueueState::Idle;
            self.in_flight = None;
        }
        hit
    }

    /// Run one scheduling step.
    pub fn poll(&mut self, now: Instant) -> QueueAction {
        match self.state {
            QueueState::AwaitingResponse { since } | QueueState::Resent { since } => {
                let deadline = since + self.response_timeout;
                if now < deadline {
                    return QueueAction::WaitUntil(deadline);
                }
                if let QueueState::AwaitingResponse { .. } = self.state
                    && let Some(cmd) = self.in_flight.as_mut()
                {
                    cmd.tried_resend = true;
                    let command = cmd.clone();
                    warn!(
                        "Queue: no reply {:02X?} to {}, resending",
                        self.expected,
                        command.template().description
                    );
                    self.state = QueueState::Resent { since: now };
                    self.last_transmit = Some(now);
                    let pdu = command.to_pdu();
                    return QueueAction::Send { command, pdu, resend: true };
                }
                let command = self.in_flight.as_ref().map_or(Command::Status, |c| c.command);
                warn!("Queue: still no reply to {:?} after resend", command);
                self.clear();
                QueueAction::Escalate { command }
            }
            QueueState::Idle => {
                if self.queue.is_empty() {
                    return QueueAction::Idle;
                }
                let mut ready_at = self.last_transmit.map_or(now, |t| t + MIN_INTER_MESSAGE_GAP);
                if let Some(hold) = self.hold_until {
                    ready_at = ready_at.max(hold);
                }
                if now < ready_at {
                    return QueueAction::WaitUntil(ready_at);
                }
                let Some(command) = self.queue.pop_front() else {
                    return QueueAction::Idle;
                };
                let template = command.template();
                self.expected = template.replies.iter().copied().collect();
                if template.wait_for_ack {
                    self.expected.insert(msg_type::ACK);
                }
                self.last_transmit = Some(now);
                self.hold_until = Some(now + template.post_send_delay);
                if self.expected.is_empty() {
                    self.in_flight = None;
                } else {
                    self.state = QueueState::AwaitingResponse { since: now };
                    self.in_flight = Some(command.clone());
                }
                let pdu = command.to_pdu();
                QueueAction::Send { command, pdu, resend: false }
            }
        }
    }
}
