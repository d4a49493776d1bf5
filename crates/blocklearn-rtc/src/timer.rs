use blocklearn_shared::constants::SESSION_LAPSE_GRACE_SECS;
use blocklearn_shared::protocol::SessionProposal;
use blocklearn_shared::SharedError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerPhase {
    Scheduled,
    Active,
    /// Counted down to zero. Only a live timer reaches this; a rebuilt one
    /// is `None` instead.
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTransition {
    Started,
    Expired,
}

/// Countdown for an accepted session, derived from wall-clock time only.
///
/// Both peers build it independently from the same proposal, so there is
/// no clock authority to agree with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimer {
    /// Epoch milliseconds
    pub start_time: i64,
    /// Seconds
    pub duration: i64,
    /// Seconds
    pub remaining: i64,
    pub is_active: bool,
    pub phase: TimerPhase,
}

impl SessionTimer {
    /// Rebuild the timer for `now`. `None` once the slot is over, whether it
    /// ended a minute or a day ago; see [`slot_lapsed`] for the difference.
    pub fn reconstruct(
        proposal: &SessionProposal,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, SharedError> {
        let start = proposal.start_time()?;
        Ok(Self::at(start, proposal.duration_secs(), now))
    }

    pub fn at(start: DateTime<Utc>, duration: i64, now: DateTime<Utc>) -> Option<Self> {
        let elapsed = (now - start).num_seconds();

        let (phase, remaining) = if now < start {
            (TimerPhase::Scheduled, duration)
        } else if elapsed < duration {
            (TimerPhase::Active, duration - elapsed)
        } else {
            return None;
        };

        Some(Self {
            start_time: start.timestamp_millis(),
            duration,
            remaining,
            is_active: phase == TimerPhase::Active,
            phase,
        })
    }

    fn start(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.start_time).unwrap_or_default()
    }

    /// Advance to `now`, reporting phase changes.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<TimerTransition> {
        let mut transitions = Vec::new();
        if self.phase == TimerPhase::Ended {
            return transitions;
        }

        let start = self.start();
        if now < start {
            return transitions;
        }

        if self.phase == TimerPhase::Scheduled {
            self.phase = TimerPhase::Active;
            self.is_active = true;
            transitions.push(TimerTransition::Started);
        }

        let elapsed = (now - start).num_seconds();
        self.remaining = (self.duration - elapsed).max(0);
        if self.remaining == 0 {
            self.phase = TimerPhase::Ended;
            self.is_active = false;
            transitions.push(TimerTransition::Expired);
        }
        transitions
    }
}

/// When the proposal's slot is over.
pub fn slot_end(proposal: &SessionProposal) -> Result<DateTime<Utc>, SharedError> {
    Ok(proposal.start_time()? + Duration::seconds(proposal.duration_secs()))
}

/// The slot ended more than an hour ago (or cannot be parsed). Until then an
/// ended session can still be completed and rated.
pub fn slot_lapsed(proposal: &SessionProposal, now: DateTime<Utc>) -> bool {
    match slot_end(proposal) {
        Ok(end) => now >= end + Duration::seconds(SESSION_LAPSE_GRACE_SECS),
        Err(_) => true,
    }
}
