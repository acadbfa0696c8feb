//! Mission records and their lifecycle.
//!
//! An OBSERVE mission moves `Planned -> Executing -> {Completed | Failed}`.
//! Its follow-up RETURN_TO_BASE mission moves
//! `Planned -> Returning -> {Standby | Failed}`. Either may pass through
//! `Aborting` on the way to `Failed`. No state is ever revisited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AbortReason, TransitionError};
use crate::{MissionId, MissionKind, MissionPlan};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionState {
    Planned,
    Executing,
    Returning,
    Aborting,
    Completed,
    Failed,
    Standby,
}

impl MissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Standby)
    }

    pub fn can_transition(kind: MissionKind, from: Self, to: Self) -> bool {
        use MissionState::*;
        match kind {
            MissionKind::Observe => matches!(
                (from, to),
                (Planned, Executing)
                    | (Planned, Failed)
                    | (Executing, Aborting)
                    | (Executing, Completed)
                    | (Executing, Failed)
                    | (Aborting, Failed)
            ),
            MissionKind::ReturnToBase => matches!(
                (from, to),
                (Planned, Returning)
                    | (Planned, Failed)
                    | (Returning, Aborting)
                    | (Returning, Standby)
                    | (Returning, Failed)
                    | (Aborting, Failed)
            ),
        }
    }
}

impl fmt::Display for MissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Planned => "PLANNED",
            Self::Executing => "EXECUTING",
            Self::Returning => "RETURNING",
            Self::Aborting => "ABORTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Standby => "STANDBY",
        };
        f.write_str(label)
    }
}

/// Flight phases driven by the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlightPhase {
    Takeoff,
    Transit,
    Record,
    TransitBack,
    Land,
}

impl FlightPhase {
    /// Phases flown for a given mission kind.
    pub fn sequence(kind: MissionKind) -> &'static [FlightPhase] {
        match kind {
            MissionKind::Observe => &[Self::Takeoff, Self::Transit, Self::Record],
            MissionKind::ReturnToBase => &[Self::TransitBack, Self::Land],
        }
    }
}

impl fmt::Display for FlightPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Takeoff => "TAKEOFF",
            Self::Transit => "TRANSIT",
            Self::Record => "RECORD",
            Self::TransitBack => "TRANSIT_BACK",
            Self::Land => "LAND",
        };
        f.write_str(label)
    }
}

/// How the executor ended a mission.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MissionOutcome {
    Completed {
        artifact_dir: Option<PathBuf>,
    },
    Failed {
        reason: AbortReason,
        detail: String,
        artifact_dir: Option<PathBuf>,
    },
}

impl MissionOutcome {
    pub fn artifact_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Completed { artifact_dir } | Self::Failed { artifact_dir, .. } => {
                artifact_dir.as_ref()
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TerminalResult {
    pub finished_at: DateTime<Utc>,
    pub state: MissionState,
    #[serde(flatten)]
    pub outcome: MissionOutcome,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Mission {
    pub mission_id: MissionId,
    pub kind: MissionKind,
    pub target_lat: f64,
    pub target_lon: f64,
    pub altitude_m: f64,
    pub max_duration_ms: u64,
    pub state: MissionState,
    pub drone_id: String,
    pub created_at: DateTime<Utc>,
    /// Site whose detection triggered this mission (OBSERVE only).
    pub origin_site: Option<String>,
    /// OBSERVE mission this return flight closes (RETURN_TO_BASE only).
    pub parent: Option<MissionId>,
    pub phase: Option<FlightPhase>,
    pub terminal_result: Option<TerminalResult>,
}

impl Mission {
    pub fn from_plan(
        mission_id: MissionId,
        drone_id: &str,
        plan: &MissionPlan,
        origin_site: Option<String>,
        parent: Option<MissionId>,
    ) -> Self {
        Self {
            mission_id,
            kind: plan.kind,
            target_lat: plan.target_lat,
            target_lon: plan.target_lon,
            altitude_m: plan.altitude_m,
            max_duration_ms: plan.max_duration_ms,
            state: MissionState::Planned,
            drone_id: drone_id.to_string(),
            created_at: Utc::now(),
            origin_site,
            parent,
            phase: None,
            terminal_result: None,
        }
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    /// State entered once the executor picks the mission up.
    pub fn flying_state(&self) -> MissionState {
        match self.kind {
            MissionKind::Observe => MissionState::Executing,
            MissionKind::ReturnToBase => MissionState::Returning,
        }
    }

    pub fn transition(&mut self, to: MissionState) -> Result<(), TransitionError> {
        if !MissionState::can_transition(self.kind, self.state, to) {
            return Err(TransitionError {
                kind: self.kind,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Apply the executor's verdict and stamp the terminal result.
    pub fn finish(&mut self, outcome: MissionOutcome) -> Result<(), TransitionError> {
        let to = match (&outcome, self.kind) {
            (MissionOutcome::Completed { .. }, MissionKind::Observe) => MissionState::Completed,
            (MissionOutcome::Completed { .. }, MissionKind::ReturnToBase) => MissionState::Standby,
            (MissionOutcome::Failed { .. }, _) => MissionState::Failed,
        };
        self.transition(to)?;
        self.terminal_result = Some(TerminalResult {
            finished_at: Utc::now(),
            state: to,
            outcome,
        });
        Ok(())
    }

    pub fn failure_reason(&self) -> Option<AbortReason> {
        match self.terminal_result.as_ref().map(|r| &r.outcome) {
            Some(MissionOutcome::Failed { reason, .. }) => Some(*reason),
            _ => None,
        }
    }
}

/// Lifecycle notifications emitted by the executor.
#[derive(Clone, Debug, PartialEq)]
pub enum MissionUpdate {
    Started {
        mission_id: MissionId,
    },
    Phase {
        mission_id: MissionId,
        phase: FlightPhase,
    },
    Aborting {
        mission_id: MissionId,
        reason: AbortReason,
    },
    Finished {
        mission_id: MissionId,
        outcome: MissionOutcome,
    },
}

/// Receiver of executor status callbacks.
pub trait StatusSink: Send + Sync {
    fn mission_update(&self, update: MissionUpdate);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observe_plan() -> MissionPlan {
        MissionPlan {
            kind: MissionKind::Observe,
            target_lat: 40.0083,
            target_lon: -83.0175,
            altitude_m: 13.0,
            max_duration_ms: 180_000,
            distance_m: 120.0,
        }
    }

    #[test]
    fn observe_happy_path_is_accepted() {
        let mut mission = Mission::from_plan(MissionId(1), "drone-1", &observe_plan(), None, None);
        mission.transition(MissionState::Executing).unwrap();
        mission
            .finish(MissionOutcome::Completed { artifact_dir: None })
            .unwrap();
        assert_eq!(mission.state, MissionState::Completed);
        assert!(mission.state.is_terminal());
    }

    #[test]
    fn states_are_never_revisited() {
        let mut mission = Mission::from_plan(MissionId(1), "drone-1", &observe_plan(), None, None);
        mission.transition(MissionState::Executing).unwrap();
        let err = mission.transition(MissionState::Planned).unwrap_err();
        assert_eq!(err.from, MissionState::Executing);
        assert!(mission.transition(MissionState::Executing).is_err());
    }

    #[test]
    fn observe_cannot_enter_return_states() {
        assert!(!MissionState::can_transition(
            MissionKind::Observe,
            MissionState::Planned,
            MissionState::Returning
        ));
        assert!(!MissionState::can_transition(
            MissionKind::Observe,
            MissionState::Executing,
            MissionState::Standby
        ));
    }

    #[test]
    fn return_mission_finishes_in_standby() {
        let plan = MissionPlan {
            kind: MissionKind::ReturnToBase,
            ..observe_plan()
        };
        let mut mission =
            Mission::from_plan(MissionId(2), "drone-1", &plan, None, Some(MissionId(1)));
        mission.transition(mission.flying_state()).unwrap();
        mission
            .finish(MissionOutcome::Completed { artifact_dir: None })
            .unwrap();
        assert_eq!(mission.state, MissionState::Standby);
    }

    #[test]
    fn abort_path_records_reason() {
        let mut mission = Mission::from_plan(MissionId(3), "drone-1", &observe_plan(), None, None);
        mission.transition(MissionState::Executing).unwrap();
        mission.transition(MissionState::Aborting).unwrap();
        mission
            .finish(MissionOutcome::Failed {
                reason: AbortReason::Battery,
                detail: "battery 12.0% below floor 20.0%".to_string(),
                artifact_dir: None,
            })
            .unwrap();
        assert_eq!(mission.state, MissionState::Failed);
        assert_eq!(mission.failure_reason(), Some(AbortReason::Battery));
    }

    #[test]
    fn phase_sequences_cover_full_cycle() {
        let mut all: Vec<FlightPhase> = FlightPhase::sequence(MissionKind::Observe).to_vec();
        all.extend_from_slice(FlightPhase::sequence(MissionKind::ReturnToBase));
        assert_eq!(
            all,
            vec![
                FlightPhase::Takeoff,
                FlightPhase::Transit,
                FlightPhase::Record,
                FlightPhase::TransitBack,
                FlightPhase::Land
            ]
        );
    }
}
