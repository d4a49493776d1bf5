//! Session proposal negotiation.
//!
//! `none -> proposed -> {accepted, rejected}`, then
//! `accepted -> scheduled -> active -> {ended, completed}`.
//!
//! [`SessionNegotiator`] is a pure state machine: every operation returns
//! [`Effects`] (events to broadcast, chat lines to append, notices for the
//! UI) and the engine carries them out.

use std::collections::VecDeque;

use blocklearn_shared::protocol::{ProposalDecision, RoomEvent, SessionProposal};
use blocklearn_shared::{Identity, Role};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::timer::{slot_lapsed, SessionTimer, TimerPhase, TimerTransition};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedProposal {
    pub proposal: SessionProposal,
    pub proposer: Identity,
    pub accepted_by: Identity,
    pub accepted_at: DateTime<Utc>,
}

impl AcceptedProposal {
    /// The participant on the other side of the agreement from `local_id`.
    pub fn counterpart(&self, local_id: &str) -> &Identity {
        if self.proposer.id == local_id {
            &self.accepted_by
        } else {
            &self.proposer
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingProposal {
    pub proposal: SessionProposal,
    pub proposer: Identity,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Rejected,
    Ended,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStatus {
    None,
    Proposed,
    Rejected,
    Scheduled,
    Active,
    Ended,
    Completed,
}

/// What survives a reload, stored per room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NegotiationSnapshot {
    #[serde(default)]
    pub accepted: Option<AcceptedProposal>,
    #[serde(default)]
    pub started_announced: bool,
    #[serde(default)]
    pub outgoing: Vec<SessionProposal>,
    #[serde(default)]
    pub pending: Vec<PendingProposal>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationNotice {
    ProposalReceived {
        proposal: SessionProposal,
        proposer: Identity,
    },
    ProposalAccepted {
        proposal: SessionProposal,
        by: Identity,
    },
    ProposalRejected {
        proposal: SessionProposal,
        by: Identity,
    },
    /// Accepted, but the slot is already over.
    ProposalLapsed {
        proposal: SessionProposal,
    },
    TimerChanged(Option<SessionTimer>),
    SessionStarted,
    SessionExpired,
    SessionEnded {
        by: Identity,
    },
    SessionCompleted {
        by: Identity,
    },
    RatingRequested,
    DurableSessionRecorded {
        session_id: String,
    },
}

/// A chat line the engine should append.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatDraft {
    System(String),
    Proposal {
        author: Identity,
        proposal: SessionProposal,
    },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Effects {
    pub outbound: Vec<RoomEvent>,
    pub chat: Vec<ChatDraft>,
    pub notices: Vec<NegotiationNotice>,
    pub persist: bool,
    /// Persist this acceptance as a durable session record.
    pub record_session: Option<AcceptedProposal>,
    pub share_meeting_link: bool,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        *self == Effects::default()
    }

    fn system(&mut self, text: impl Into<String>) {
        self.chat.push(ChatDraft::System(text.into()));
    }
}

#[derive(Debug, Clone)]
struct BufferedResponse {
    responder: Identity,
    decision: ProposalDecision,
    proposal: SessionProposal,
    received_at: DateTime<Utc>,
}

pub struct SessionNegotiator {
    local: Identity,
    role: Role,
    outgoing: Vec<SessionProposal>,
    pending: Vec<PendingProposal>,
    accepted: Option<AcceptedProposal>,
    timer: Option<SessionTimer>,
    started_announced: bool,
    session_id: Option<String>,
    outcome: Option<Outcome>,
    buffered: VecDeque<BufferedResponse>,
    buffer_ttl: Duration,
    buffer_capacity: usize,
}

impl SessionNegotiator {
    pub fn new(local: Identity, role: Role, buffer_ttl: Duration, buffer_capacity: usize) -> Self {
        Self {
            local,
            role,
            outgoing: Vec::new(),
            pending: Vec::new(),
            accepted: None,
            timer: None,
            started_announced: false,
            session_id: None,
            outcome: None,
            buffered: VecDeque::new(),
            buffer_ttl,
            buffer_capacity,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn timer(&self) -> Option<&SessionTimer> {
        self.timer.as_ref()
    }

    pub fn accepted(&self) -> Option<&AcceptedProposal> {
        self.accepted.as_ref()
    }

    pub fn pending(&self) -> &[PendingProposal] {
        &self.pending
    }

    pub fn outgoing(&self) -> &[SessionProposal] {
        &self.outgoing
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn buffered_responses(&self) -> usize {
        self.buffered.len()
    }

    pub fn status(&self) -> NegotiationStatus {
        if let Some(timer) = &self.timer {
            return match timer.phase {
                TimerPhase::Scheduled => NegotiationStatus::Scheduled,
                TimerPhase::Active => NegotiationStatus::Active,
                TimerPhase::Ended => NegotiationStatus::Ended,
            };
        }
        if !self.outgoing.is_empty() || !self.pending.is_empty() {
            return NegotiationStatus::Proposed;
        }
        match self.outcome {
            Some(Outcome::Rejected) => NegotiationStatus::Rejected,
            Some(Outcome::Ended) => NegotiationStatus::Ended,
            Some(Outcome::Completed) => NegotiationStatus::Completed,
            None => NegotiationStatus::None,
        }
    }

    pub fn snapshot(&self) -> NegotiationSnapshot {
        NegotiationSnapshot {
            accepted: self.accepted.clone(),
            started_announced: self.started_announced,
            outgoing: self.outgoing.clone(),
            pending: self.pending.clone(),
            session_id: self.session_id.clone(),
            outcome: self.outcome,
        }
    }

    /// Load persisted state and rebuild the timer against `now`.
    pub fn restore(&mut self, snapshot: NegotiationSnapshot, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        self.outgoing = snapshot.outgoing;
        self.pending = snapshot.pending;
        self.session_id = snapshot.session_id;
        self.outcome = snapshot.outcome;
        self.started_announced = snapshot.started_announced;
        self.accepted = snapshot.accepted;
        self.timer = None;

        if let Some(accepted) = &self.accepted {
            match SessionTimer::reconstruct(&accepted.proposal, now) {
                Ok(Some(timer)) => {
                    info!(phase = ?timer.phase, remaining = timer.remaining, "resumed session timer");
                    self.timer = Some(timer);
                }
                Ok(None) if !slot_lapsed(&accepted.proposal, now) => {
                    debug!(proposal = %accepted.proposal.id, "persisted session already ended");
                    if self.outcome.is_none() {
                        self.outcome = Some(Outcome::Ended);
                        effects.persist = true;
                    }
                }
                Ok(None) | Err(_) => {
                    debug!(proposal = %accepted.proposal.id, "persisted session lapsed");
                    self.accepted = None;
                    self.started_announced = false;
                    effects.persist = true;
                }
            }
        }
        effects
            .notices
            .push(NegotiationNotice::TimerChanged(self.timer.clone()));
        effects
    }

    // -----------------------------------------------------------------------
    // Local operations
    // -----------------------------------------------------------------------

    pub fn propose(&mut self, proposal: SessionProposal) -> Result<Effects, EngineError> {
        proposal.validate()?;
        let mut effects = Effects::default();

        info!(proposal = %proposal.id, slot = %proposal.summary(), "proposing session");
        self.outgoing.push(proposal.clone());
        effects.outbound.push(RoomEvent::SessionPropose {
            proposer: self.local.clone(),
            proposal: proposal.clone(),
        });
        effects.chat.push(ChatDraft::Proposal {
            author: self.local.clone(),
            proposal,
        });
        effects.persist = true;
        Ok(effects)
    }

    pub fn respond(
        &mut self,
        proposal_id: &str,
        decision: ProposalDecision,
        now: DateTime<Utc>,
    ) -> Result<Effects, EngineError> {
        let proposal = self
            .pending
            .iter()
            .find(|p| p.proposal.id == proposal_id)
            .map(|p| p.proposal.clone())
            .ok_or_else(|| EngineError::UnknownProposal(proposal_id.to_string()))?;

        let mut effects = Effects::default();
        effects.outbound.push(RoomEvent::SessionResponse {
            responder: self.local.clone(),
            response: decision,
            proposal: proposal.clone(),
        });
        let local = self.local.clone();
        self.apply_response(&local, decision, proposal, now, &mut effects);
        Ok(effects)
    }

    pub fn end(&mut self) -> Effects {
        let mut effects = Effects::default();
        effects.outbound.push(RoomEvent::SessionEnd {
            ended_by: self.local.clone(),
        });
        let local = self.local.clone();
        self.finish(Outcome::Ended, &local, &mut effects);
        effects
    }

    pub fn complete(&mut self) -> Effects {
        let mut effects = Effects::default();
        effects.outbound.push(RoomEvent::SessionComplete {
            completed_by: self.local.clone(),
        });
        let local = self.local.clone();
        self.finish(Outcome::Completed, &local, &mut effects);
        effects
    }

    /// The REST collaborator stored the accepted proposal.
    pub fn record_durable_session(&mut self, session_id: String) -> Effects {
        let mut effects = Effects::default();
        info!(session = %session_id, "durable session recorded");
        self.session_id = Some(session_id.clone());
        effects.outbound.push(RoomEvent::SessionCreated {
            session_id: session_id.clone(),
            created_by: self.local.clone(),
        });
        effects
            .notices
            .push(NegotiationNotice::DurableSessionRecorded { session_id });
        effects.persist = true;
        effects
    }

    // -----------------------------------------------------------------------
    // Remote events
    // -----------------------------------------------------------------------

    pub fn handle_event(&mut self, event: RoomEvent, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        if event.author_id() == self.local.id {
            debug!("ignoring echo of own room event");
            return effects;
        }

        match event {
            RoomEvent::ChatMessage(_) => {}

            RoomEvent::SessionPropose { proposer, proposal } => {
                self.on_propose(proposer, proposal, now, &mut effects);
            }

            RoomEvent::SessionResponse {
                responder,
                response,
                proposal,
            } => {
                let known = self.outgoing.iter().any(|p| p.id == proposal.id)
                    || self.pending.iter().any(|p| p.proposal.id == proposal.id);
                if known {
                    self.apply_response(&responder, response, proposal, now, &mut effects);
                } else {
                    self.buffer_response(responder, response, proposal, now);
                }
            }

            RoomEvent::SessionEnd { ended_by } => {
                self.finish(Outcome::Ended, &ended_by, &mut effects);
            }

            RoomEvent::SessionComplete { completed_by } => {
                self.finish(Outcome::Completed, &completed_by, &mut effects);
            }

            RoomEvent::SessionCreated { session_id, .. } => {
                self.session_id = Some(session_id.clone());
                effects
                    .notices
                    .push(NegotiationNotice::DurableSessionRecorded { session_id });
                effects.persist = true;
            }
        }
        effects
    }

    fn on_propose(
        &mut self,
        proposer: Identity,
        proposal: SessionProposal,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        if let Err(e) = proposal.validate() {
            warn!(proposal = %proposal.id, error = %e, "ignoring invalid proposal");
            return;
        }
        if self.pending.iter().any(|p| p.proposal.id == proposal.id) {
            return;
        }

        info!(proposal = %proposal.id, from = %proposer.id, "session proposal received");
        self.pending.push(PendingProposal {
            proposal: proposal.clone(),
            proposer: proposer.clone(),
            received_at: now,
        });
        effects.notices.push(NegotiationNotice::ProposalReceived {
            proposal: proposal.clone(),
            proposer: proposer.clone(),
        });
        effects.chat.push(ChatDraft::Proposal {
            author: proposer,
            proposal: proposal.clone(),
        });
        effects.persist = true;

        if let Some(pos) = self
            .buffered
            .iter()
            .position(|b| b.proposal.id == proposal.id)
        {
            if let Some(buffered) = self.buffered.remove(pos) {
                debug!(proposal = %proposal.id, "applying buffered response");
                self.apply_response(
                    &buffered.responder,
                    buffered.decision,
                    buffered.proposal,
                    now,
                    effects,
                );
            }
        }
    }

    fn buffer_response(
        &mut self,
        responder: Identity,
        decision: ProposalDecision,
        proposal: SessionProposal,
        now: DateTime<Utc>,
    ) {
        if self.buffered.len() >= self.buffer_capacity {
            if let Some(evicted) = self.buffered.pop_front() {
                warn!(proposal = %evicted.proposal.id, "response buffer full, dropping oldest");
            }
        }
        debug!(proposal = %proposal.id, "buffering response for unknown proposal");
        self.buffered.push_back(BufferedResponse {
            responder,
            decision,
            proposal,
            received_at: now,
        });
    }

    fn apply_response(
        &mut self,
        responder: &Identity,
        decision: ProposalDecision,
        proposal: SessionProposal,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        let proposer = if self.outgoing.iter().any(|p| p.id == proposal.id) {
            self.local.clone()
        } else {
            self.pending
                .iter()
                .find(|p| p.proposal.id == proposal.id)
                .map(|p| p.proposer.clone())
                .unwrap_or_else(|| responder.clone())
        };
        self.outgoing.retain(|p| p.id != proposal.id);
        self.pending.retain(|p| p.proposal.id != proposal.id);
        effects.persist = true;

        match decision {
            ProposalDecision::Accepted => self.accept(proposal, proposer, responder, now, effects),
            ProposalDecision::Rejected => {
                info!(proposal = %proposal.id, by = %responder.id, "session proposal rejected");
                self.outcome = Some(Outcome::Rejected);
                effects.system(format!(
                    "Session proposal declined by {}",
                    responder.display_name()
                ));
                effects.notices.push(NegotiationNotice::ProposalRejected {
                    proposal,
                    by: responder.clone(),
                });
            }
        }
    }

    fn accept(
        &mut self,
        proposal: SessionProposal,
        proposer: Identity,
        by: &Identity,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        let timer = match SessionTimer::reconstruct(&proposal, now) {
            Ok(timer) => timer,
            Err(e) => {
                warn!(proposal = %proposal.id, error = %e, "accepted proposal has invalid slot");
                None
            }
        };

        let Some(timer) = timer else {
            effects.system("The proposed session time has already passed");
            effects
                .notices
                .push(NegotiationNotice::ProposalLapsed { proposal });
            return;
        };

        info!(
            proposal = %proposal.id,
            phase = ?timer.phase,
            remaining = timer.remaining,
            "session proposal accepted"
        );

        let accepted = AcceptedProposal {
            proposal: proposal.clone(),
            proposer,
            accepted_by: by.clone(),
            accepted_at: now,
        };
        self.accepted = Some(accepted.clone());
        self.outcome = None;
        self.started_announced = false;

        effects.system(format!("Session scheduled for {}", proposal.summary()));
        effects.notices.push(NegotiationNotice::ProposalAccepted {
            proposal,
            by: by.clone(),
        });

        if timer.phase == TimerPhase::Active {
            self.announce_start(effects);
        }
        effects
            .notices
            .push(NegotiationNotice::TimerChanged(Some(timer.clone())));
        self.timer = Some(timer);

        if self.role.records_sessions() {
            effects.record_session = Some(accepted);
            effects.share_meeting_link = true;
        }
    }

    /// Forget an ended session once it can no longer be completed.
    fn drop_lapsed(&mut self, now: DateTime<Utc>, effects: &mut Effects) {
        let lapsed = self
            .accepted
            .as_ref()
            .is_some_and(|a| slot_lapsed(&a.proposal, now));
        if lapsed {
            debug!("ended session lapsed");
            self.accepted = None;
            self.started_announced = false;
            effects.persist = true;
        }
    }

    fn announce_start(&mut self, effects: &mut Effects) {
        if self.started_announced {
            return;
        }
        self.started_announced = true;
        effects.system("Session started");
        effects.notices.push(NegotiationNotice::SessionStarted);
        effects.persist = true;
    }

    fn finish(&mut self, outcome: Outcome, by: &Identity, effects: &mut Effects) {
        let verb = match outcome {
            Outcome::Completed => "completed",
            _ => "ended",
        };
        info!(by = %by.id, outcome = verb, "session finished");

        self.timer = None;
        self.accepted = None;
        self.started_announced = false;
        self.outcome = Some(outcome);

        effects.system(format!("Session {verb} by {}", by.display_name()));
        effects.notices.push(match outcome {
            Outcome::Completed => NegotiationNotice::SessionCompleted { by: by.clone() },
            _ => NegotiationNotice::SessionEnded { by: by.clone() },
        });
        effects.notices.push(NegotiationNotice::TimerChanged(None));
        if outcome == Outcome::Completed && self.role.rates_sessions() {
            effects.notices.push(NegotiationNotice::RatingRequested);
        }
        effects.persist = true;
    }

    // -----------------------------------------------------------------------
    // Clock
    // -----------------------------------------------------------------------

    /// Advance the timer and expire buffered responses. Called at 1 Hz.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();

        let ttl = self.buffer_ttl;
        self.buffered.retain(|b| {
            let keep = now - b.received_at < ttl;
            if !keep {
                warn!(proposal = %b.proposal.id, "discarding response for unknown proposal");
            }
            keep
        });

        let Some(timer) = self.timer.as_mut() else {
            self.drop_lapsed(now, &mut effects);
            return effects;
        };

        let transitions = timer.tick(now);
        let snapshot = timer.clone();
        for transition in transitions {
            match transition {
                TimerTransition::Started => self.announce_start(&mut effects),
                TimerTransition::Expired => {
                    info!("session time is up");
                    self.timer = None;
                    self.outcome = Some(Outcome::Ended);
                    effects.system("Session time is up");
                    effects.notices.push(NegotiationNotice::SessionExpired);
                    effects.notices.push(NegotiationNotice::TimerChanged(None));
                    effects.persist = true;
                    return effects;
                }
            }
        }
        effects
            .notices
            .push(NegotiationNotice::TimerChanged(Some(snapshot)));
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mentor() -> Identity {
        Identity::new("m1", "grace@example.com", "Grace", "Hopper")
    }

    fn learner() -> Identity {
        Identity::new("l1", "alan@example.com", "Alan", "Turing")
    }

    fn negotiator(identity: Identity, role: Role) -> SessionNegotiator {
        SessionNegotiator::new(identity, role, Duration::seconds(30), 16)
    }

    fn proposal() -> SessionProposal {
        serde_json::from_str(
            r#"{"id":"p1","date":"2025-03-01","time":"10:00","duration":"60","topic":"X"}"#,
        )
        .unwrap()
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
    }

    fn deliver(to: &mut SessionNegotiator, from: &Effects, now: DateTime<Utc>) -> Effects {
        let mut merged = Effects::default();
        for event in &from.outbound {
            let effects = to.handle_event(event.clone(), now);
            merged.outbound.extend(effects.outbound);
            merged.chat.extend(effects.chat);
            merged.notices.extend(effects.notices);
            merged.persist |= effects.persist;
            merged.record_session = merged.record_session.or(effects.record_session);
        }
        merged
    }

    fn system_lines(effects: &Effects) -> Vec<String> {
        effects
            .chat
            .iter()
            .filter_map(|c| match c {
                ChatDraft::System(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_own_proposal_echo_is_ignored() {
        let mut a = negotiator(learner(), Role::Learner);
        let effects = a.propose(proposal()).unwrap();
        assert!(matches!(effects.chat[0], ChatDraft::Proposal { .. }));

        let echo = deliver(&mut a, &effects, start() - Duration::days(1));
        assert!(echo.is_empty());
        assert!(a.pending().is_empty());
        assert_eq!(a.status(), NegotiationStatus::Proposed);
    }

    #[test]
    fn test_echo_detected_by_identity_not_display_fields() {
        let mut a = negotiator(learner(), Role::Learner);
        let mut renamed = learner();
        renamed.first_name = "Someone".into();
        let effects = a.handle_event(
            RoomEvent::SessionPropose {
                proposer: renamed,
                proposal: proposal(),
            },
            start() - Duration::days(1),
        );
        assert!(effects.notices.is_empty());
    }

    #[test]
    fn test_accept_computes_same_timer_on_both_sides() {
        let before = start() - Duration::days(2);
        let mut a = negotiator(learner(), Role::Learner);
        let mut b = negotiator(mentor(), Role::Mentor);

        let proposed = a.propose(proposal()).unwrap();
        let received = deliver(&mut b, &proposed, before);
        assert!(matches!(
            received.notices[0],
            NegotiationNotice::ProposalReceived { .. }
        ));
        assert_eq!(b.pending().len(), 1);

        let responded = b.respond("p1", ProposalDecision::Accepted, before).unwrap();
        assert!(responded.record_session.is_some());
        assert!(responded.share_meeting_link);

        let applied = deliver(&mut a, &responded, before);
        assert!(applied.record_session.is_none());

        let record = responded.record_session.unwrap();
        assert_eq!(record.counterpart("m1").id, "l1");
        assert_eq!(a.accepted().unwrap().counterpart("l1").id, "m1");

        let ta = a.timer().unwrap();
        let tb = b.timer().unwrap();
        assert_eq!(ta, tb);
        assert_eq!(ta.duration, 3600);
        assert!(!ta.is_active);
        assert_eq!(a.status(), NegotiationStatus::Scheduled);
        assert!(a.outgoing().is_empty());
    }

    #[test]
    fn test_reject() {
        let now = start() - Duration::days(1);
        let mut a = negotiator(learner(), Role::Learner);
        let mut b = negotiator(mentor(), Role::Mentor);
        let proposed = a.propose(proposal()).unwrap();
        deliver(&mut b, &proposed, now);

        let responded = b.respond("p1", ProposalDecision::Rejected, now).unwrap();
        let applied = deliver(&mut a, &responded, now);

        assert_eq!(
            system_lines(&applied),
            vec!["Session proposal declined by Grace Hopper".to_string()]
        );
        assert!(a.timer().is_none());
        assert_eq!(a.status(), NegotiationStatus::Rejected);
        assert_eq!(b.status(), NegotiationStatus::Rejected);
    }

    #[test]
    fn test_respond_to_unknown_proposal_fails() {
        let mut b = negotiator(mentor(), Role::Mentor);
        assert!(matches!(
            b.respond("nope", ProposalDecision::Accepted, start()),
            Err(EngineError::UnknownProposal(_))
        ));
    }

    #[test]
    fn test_accepting_lapsed_proposal_produces_no_timer() {
        let mut b = negotiator(mentor(), Role::Mentor);
        b.handle_event(
            RoomEvent::SessionPropose {
                proposer: learner(),
                proposal: proposal(),
            },
            start() + Duration::hours(3),
        );
        let effects = b
            .respond("p1", ProposalDecision::Accepted, start() + Duration::hours(3))
            .unwrap();
        assert!(b.timer().is_none());
        assert!(b.accepted().is_none());
        assert!(effects.record_session.is_none());
        assert!(effects
            .notices
            .iter()
            .any(|n| matches!(n, NegotiationNotice::ProposalLapsed { .. })));
    }

    #[test]
    fn test_tick_announces_start_once_and_expires() {
        let mut b = negotiator(mentor(), Role::Mentor);
        b.handle_event(
            RoomEvent::SessionPropose {
                proposer: learner(),
                proposal: proposal(),
            },
            start() - Duration::seconds(10),
        );
        b.respond("p1", ProposalDecision::Accepted, start() - Duration::seconds(10))
            .unwrap();

        let started = b.tick(start());
        assert_eq!(system_lines(&started), vec!["Session started".to_string()]);
        assert!(system_lines(&b.tick(start() + Duration::seconds(1))).is_empty());
        assert_eq!(b.timer().unwrap().remaining, 3599);

        let expired = b.tick(start() + Duration::seconds(3600));
        assert_eq!(system_lines(&expired), vec!["Session time is up".to_string()]);
        assert!(b.timer().is_none());
        assert_eq!(b.status(), NegotiationStatus::Ended);
    }

    #[test]
    fn test_complete_prompts_only_learner() {
        let now = start() + Duration::minutes(30);
        let mut mentor_side = negotiator(mentor(), Role::Mentor);
        let mut learner_side = negotiator(learner(), Role::Learner);

        let proposed = learner_side.propose(proposal()).unwrap();
        deliver(&mut mentor_side, &proposed, now);
        let accepted = mentor_side
            .respond("p1", ProposalDecision::Accepted, now)
            .unwrap();
        deliver(&mut learner_side, &accepted, now);
        assert!(learner_side.timer().unwrap().is_active);

        let completed = mentor_side.complete();
        let received = deliver(&mut learner_side, &completed, now);

        let expected = vec!["Session completed by Grace Hopper".to_string()];
        assert_eq!(system_lines(&completed), expected);
        assert_eq!(system_lines(&received), expected);
        assert!(mentor_side.timer().is_none());
        assert!(learner_side.timer().is_none());

        let prompted = |e: &Effects| {
            e.notices
                .iter()
                .any(|n| matches!(n, NegotiationNotice::RatingRequested))
        };
        assert!(!prompted(&completed));
        assert!(prompted(&received));
        assert_eq!(learner_side.status(), NegotiationStatus::Completed);
    }

    #[test]
    fn test_end_echo_is_ignored() {
        let mut a = negotiator(mentor(), Role::Mentor);
        let ended = a.end();
        assert_eq!(
            system_lines(&ended),
            vec!["Session ended by Grace Hopper".to_string()]
        );
        assert!(deliver(&mut a, &ended, start()).is_empty());
    }

    #[test]
    fn test_out_of_order_response_is_buffered_then_applied() {
        let now = start() - Duration::days(1);
        let mut observer = negotiator(Identity::new("x", "x@example.com", "X", ""), Role::Admin);

        let response = RoomEvent::SessionResponse {
            responder: mentor(),
            response: ProposalDecision::Accepted,
            proposal: proposal(),
        };
        assert!(observer.handle_event(response, now).is_empty());
        assert_eq!(observer.buffered_responses(), 1);

        let effects = observer.handle_event(
            RoomEvent::SessionPropose {
                proposer: learner(),
                proposal: proposal(),
            },
            now + Duration::seconds(5),
        );
        assert_eq!(observer.buffered_responses(), 0);
        assert!(observer.timer().is_some());
        assert!(observer.pending().is_empty());
        assert!(effects
            .notices
            .iter()
            .any(|n| matches!(n, NegotiationNotice::ProposalAccepted { .. })));
    }

    #[test]
    fn test_buffered_response_expires() {
        let now = start() - Duration::days(1);
        let mut observer = negotiator(Identity::new("x", "x@example.com", "X", ""), Role::Admin);
        observer.handle_event(
            RoomEvent::SessionResponse {
                responder: mentor(),
                response: ProposalDecision::Accepted,
                proposal: proposal(),
            },
            now,
        );
        observer.tick(now + Duration::seconds(29));
        assert_eq!(observer.buffered_responses(), 1);
        observer.tick(now + Duration::seconds(30));
        assert_eq!(observer.buffered_responses(), 0);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let now = start() - Duration::days(1);
        let mut observer = SessionNegotiator::new(
            Identity::new("x", "x@example.com", "X", ""),
            Role::Admin,
            Duration::seconds(30),
            2,
        );
        for id in ["a", "b", "c"] {
            let mut p = proposal();
            p.id = id.into();
            observer.handle_event(
                RoomEvent::SessionResponse {
                    responder: mentor(),
                    response: ProposalDecision::Rejected,
                    proposal: p,
                },
                now,
            );
        }
        assert_eq!(observer.buffered_responses(), 2);
    }

    #[test]
    fn test_snapshot_restore_rebuilds_timer() {
        let before = start() - Duration::days(1);
        let mut b = negotiator(mentor(), Role::Mentor);
        b.handle_event(
            RoomEvent::SessionPropose {
                proposer: learner(),
                proposal: proposal(),
            },
            before,
        );
        b.respond("p1", ProposalDecision::Accepted, before).unwrap();
        b.record_durable_session("s-42".into());

        let json = serde_json::to_string(&b.snapshot()).unwrap();
        let snapshot: NegotiationSnapshot = serde_json::from_str(&json).unwrap();

        let mut reloaded = negotiator(mentor(), Role::Mentor);
        reloaded.restore(snapshot.clone(), start() + Duration::seconds(1800));
        let timer = reloaded.timer().unwrap();
        assert!(timer.is_active);
        assert_eq!(timer.remaining, 1800);
        assert_eq!(reloaded.session_id(), Some("s-42"));

        let mut lapsed = negotiator(mentor(), Role::Mentor);
        let effects = lapsed.restore(snapshot, start() + Duration::hours(5));
        assert!(lapsed.timer().is_none());
        assert!(lapsed.accepted().is_none());
        assert!(effects.persist);
    }

    #[test]
    fn test_accepting_after_slot_end_has_no_side_effects() {
        let after_end = start() + Duration::minutes(90);
        let mut b = negotiator(mentor(), Role::Mentor);
        b.handle_event(
            RoomEvent::SessionPropose {
                proposer: learner(),
                proposal: proposal(),
            },
            after_end,
        );
        let effects = b
            .respond("p1", ProposalDecision::Accepted, after_end)
            .unwrap();

        assert!(b.timer().is_none());
        assert!(b.accepted().is_none());
        assert!(effects.record_session.is_none());
        assert!(!effects.share_meeting_link);
        assert_eq!(
            system_lines(&effects),
            vec!["The proposed session time has already passed".to_string()]
        );
    }

    #[test]
    fn test_restore_after_end_matches_live_side() {
        let before = start() - Duration::hours(1);
        let mut live = negotiator(mentor(), Role::Mentor);
        live.handle_event(
            RoomEvent::SessionPropose {
                proposer: learner(),
                proposal: proposal(),
            },
            before,
        );
        live.respond("p1", ProposalDecision::Accepted, before)
            .unwrap();
        live.tick(start());
        live.tick(start() + Duration::seconds(3600));
        assert!(live.timer().is_none());
        assert_eq!(live.status(), NegotiationStatus::Ended);

        let mut reloaded = negotiator(mentor(), Role::Mentor);
        let effects = reloaded.restore(live.snapshot(), start() + Duration::seconds(3601));
        assert!(reloaded.timer().is_none());
        assert_eq!(reloaded.status(), NegotiationStatus::Ended);
        assert!(reloaded.accepted().is_some());
        assert_eq!(effects.notices, vec![NegotiationNotice::TimerChanged(None)]);

        // Closed before the end, reopened after it: same result.
        let mut mid_session = live.snapshot();
        mid_session.outcome = None;
        let mut late = negotiator(mentor(), Role::Mentor);
        let effects = late.restore(mid_session, start() + Duration::minutes(75));
        assert!(late.timer().is_none());
        assert_eq!(late.status(), NegotiationStatus::Ended);
        assert!(effects.persist);

        let much_later = start() + Duration::hours(5);
        for side in [&mut live, &mut reloaded, &mut late] {
            let effects = side.tick(much_later);
            assert!(effects.persist);
            assert!(side.timer().is_none());
            assert!(side.accepted().is_none());
        }
    }
}
