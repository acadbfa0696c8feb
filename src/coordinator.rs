//! Mission coordinator.
//!
//! Single authority over mission lifecycle and drone exclusivity. Detection
//! events wait in a bounded FIFO queue; one dispatch loop pops the head only
//! when the drone is idle, plans it, and inside one critical section creates
//! the `PLANNED` mission and claims the drone before handing the mission to
//! the launcher. Executor callbacks drive the record to a terminal state,
//! release the drone and schedule the return-to-base flight.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::counters::{CounterSnapshot, Counters};
use crate::drone::{DroneState, DroneStateCell};
use crate::error::{AbortReason, EnqueueError};
use crate::executor::AbortSignal;
use crate::ingest::EventSink;
use crate::mission::{Mission, MissionOutcome, MissionState, MissionUpdate, StatusSink, TerminalResult};
use crate::planner::Planner;
use crate::registry::SiteRegistry;
use crate::{DetectionEvent, MissionId, MissionKind, MissionPlan, Site};

const IDLE_POLL: Duration = Duration::from_millis(250);

/// Hands a freshly planned mission to whatever flies it.
///
/// `launch` must return promptly; the flight itself runs elsewhere and
/// reports back through `sink`.
pub trait MissionLauncher: Send + Sync {
    fn launch(&self, mission: Mission, abort: AbortSignal, sink: Arc<dyn StatusSink>) -> Result<()>;

    /// Re-read telemetry into the shared drone state while no mission is
    /// flying, so the planner sees a link or GPS fix that has recovered.
    fn refresh_telemetry(&self) {}
}

#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    /// Inclusive lower bound on detection confidence.
    pub confidence_threshold: f64,
    pub queue_depth: usize,
    /// Terminal missions kept for the status endpoint.
    pub archive_len: usize,
    pub return_after_failure: bool,
    /// Quiet period after a mission ends before the next one may start.
    pub settle: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            queue_depth: 8,
            archive_len: 32,
            return_after_failure: false,
            settle: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct QueueReceipt {
    /// 1-based position in the queue.
    pub position: usize,
    pub depth: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueuedSummary {
    pub site_id: String,
    pub confidence: f64,
    pub species_label: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TerminalSummary {
    pub mission_id: MissionId,
    pub kind: MissionKind,
    pub state: MissionState,
    pub reason: Option<AbortReason>,
    pub detail: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlanningRejection {
    pub site_id: String,
    pub kind: &'static str,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPhase {
    Idle,
    Busy,
    Settling,
    ShuttingDown,
}

#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorStatus {
    pub drone: DroneState,
    pub phase: DispatchPhase,
    pub active: Option<Mission>,
    pub queue_depth: usize,
    pub queue_limit: usize,
    pub queued: Vec<QueuedSummary>,
    pub return_pending: bool,
    /// Newest first.
    pub recent: Vec<Mission>,
    pub last_terminal: Option<TerminalSummary>,
    pub last_planning_error: Option<PlanningRejection>,
    pub counters: CounterSnapshot,
}

struct QueuedEvent {
    seq: u64,
    site: Site,
    event: DetectionEvent,
}

impl QueuedEvent {
    fn order_key(&self) -> (DateTime<Utc>, DateTime<Utc>, u64) {
        (self.event.received_at, self.event.observed_at, self.seq)
    }
}

struct ActiveMission {
    mission: Mission,
    abort: AbortSignal,
}

struct ReturnRequest {
    parent: MissionId,
    from_lat: f64,
    from_lon: f64,
}

#[derive(Default)]
struct CoordinatorState {
    queue: VecDeque<QueuedEvent>,
    next_seq: u64,
    next_mission: u64,
    active: Option<ActiveMission>,
    pending_return: Option<ReturnRequest>,
    settling_until: Option<Instant>,
    archive: VecDeque<Mission>,
    last_terminal: Option<TerminalSummary>,
    last_planning_error: Option<PlanningRejection>,
    shutting_down: bool,
}

impl CoordinatorState {
    fn settling(&self, now: Instant) -> bool {
        self.settling_until.map_or(false, |until| now < until)
    }

    fn has_work(&self) -> bool {
        self.pending_return.is_some() || !self.queue.is_empty()
    }

    fn insert_ordered(&mut self, queued: QueuedEvent) -> usize {
        let key = queued.order_key();
        let idx = self
            .queue
            .iter()
            .rposition(|existing| existing.order_key() <= key)
            .map_or(0, |pos| pos + 1);
        self.queue.insert(idx, queued);
        idx + 1
    }
}

pub struct Coordinator {
    settings: CoordinatorSettings,
    planner: Planner,
    registry: Arc<SiteRegistry>,
    drone: DroneStateCell,
    launcher: Arc<dyn MissionLauncher>,
    counters: Arc<Counters>,
    state: Mutex<CoordinatorState>,
    wake: Condvar,
    me: Weak<Coordinator>,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        planner: Planner,
        registry: Arc<SiteRegistry>,
        drone: DroneStateCell,
        launcher: Arc<dyn MissionLauncher>,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            settings,
            planner,
            registry,
            drone,
            launcher,
            counters,
            state: Mutex::new(CoordinatorState {
                next_mission: 1,
                ..CoordinatorState::default()
            }),
            wake: Condvar::new(),
            me: me.clone(),
        })
    }

    pub fn drone(&self) -> &DroneStateCell {
        &self.drone
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a detection for dispatch.
    ///
    /// Ordering is arrival order at the coordinator, ties broken by
    /// `observed_at`. Confidence never reorders the queue.
    pub fn enqueue(&self, event: DetectionEvent) -> Result<QueueReceipt, EnqueueError> {
        let threshold = self.settings.confidence_threshold;
        // NaN fails this comparison too.
        if !(event.confidence >= threshold) {
            self.counters.events_below_threshold();
            log::warn!(
                "detection from {} dropped: confidence {} below threshold {}",
                event.site_id,
                event.confidence,
                threshold
            );
            return Err(EnqueueError::BelowThreshold {
                confidence: event.confidence,
                threshold,
            });
        }
        let site = match self.registry.lookup_site(&event.site_id) {
            Some(site) => site.clone(),
            None => {
                self.counters.events_unknown_source();
                log::warn!("detection dropped: site {} not registered", event.site_id);
                return Err(EnqueueError::UnknownSite(event.site_id));
            }
        };

        let mut state = self.lock();
        if state.shutting_down {
            self.counters.events_refused();
            log::warn!("detection from {} refused: shutting down", site.site_id);
            return Err(EnqueueError::ShuttingDown);
        }
        if state.queue.len() >= self.settings.queue_depth {
            self.counters.events_overflowed();
            log::warn!(
                "detection from {} dropped: queue full ({} pending)",
                site.site_id,
                state.queue.len()
            );
            return Err(EnqueueError::QueueOverflow {
                depth: self.settings.queue_depth,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        log::info!(
            "queued detection from {} (confidence {:.2}, species {})",
            site.site_id,
            event.confidence,
            event.species_label.as_deref().unwrap_or("-")
        );
        let position = state.insert_ordered(QueuedEvent { seq, site, event });
        let depth = state.queue.len();
        self.counters.events_enqueued();
        drop(state);
        self.wake.notify_all();
        Ok(QueueReceipt { position, depth })
    }

    /// Run one dispatch step.
    ///
    /// Returns the id of the mission handed to the launcher, or `None` when
    /// nothing could start (drone busy or settling, queue empty, or every
    /// queued event failed planning). After shutdown only a pending
    /// return-to-base flight is still dispatched.
    pub fn dispatch_pending(&self) -> Option<MissionId> {
        let (mission, abort) = {
            let mut state = self.lock();
            if state.active.is_some() || !state.has_work() {
                return None;
            }
            if state.shutting_down && state.pending_return.is_none() {
                return None;
            }
            let now = Instant::now();
            if state.settling(now) {
                return None;
            }
            state.settling_until = None;

            self.launcher.refresh_telemetry();
            let drone = self.drone.snapshot();
            let mission_id = MissionId(state.next_mission);
            if !self.drone.claim(mission_id) {
                log::warn!(
                    "dispatch deferred: drone {} still held by {:?}",
                    drone.drone_id,
                    drone.current_mission_id
                );
                return None;
            }

            let Some((plan, origin_site, parent)) = self.next_plan(&mut state, &drone) else {
                self.drone.release(mission_id);
                return None;
            };
            state.next_mission += 1;

            let mission = Mission::from_plan(mission_id, &drone.drone_id, &plan, origin_site, parent);
            let abort = AbortSignal::new();
            state.active = Some(ActiveMission {
                mission: mission.clone(),
                abort: abort.clone(),
            });
            self.counters.missions_dispatched();
            log::info!(
                "dispatching {} {} to ({:.5}, {:.5}), {:.0} m from home",
                mission_id,
                plan.kind,
                plan.target_lat,
                plan.target_lon,
                plan.distance_m
            );
            (mission, abort)
        };

        let mission_id = mission.mission_id;
        let Some(sink) = self.me.upgrade() else {
            return None;
        };
        if let Err(err) = self.launcher.launch(mission, abort, sink) {
            log::error!("{} could not be launched: {:#}", mission_id, err);
            self.mission_update(MissionUpdate::Finished {
                mission_id,
                outcome: MissionOutcome::Failed {
                    reason: AbortReason::Actuator,
                    detail: format!("launch failed: {:#}", err),
                    artifact_dir: None,
                },
            });
        }
        Some(mission_id)
    }

    /// A pending return flight beats the detection queue. Queued events that
    /// fail planning are discarded without retry.
    fn next_plan(
        &self,
        state: &mut CoordinatorState,
        drone: &DroneState,
    ) -> Option<(MissionPlan, Option<String>, Option<MissionId>)> {
        if let Some(request) = state.pending_return.take() {
            let plan = self.planner.plan_return(request.from_lat, request.from_lon);
            return Some((plan, None, Some(request.parent)));
        }
        while let Some(queued) = state.queue.pop_front() {
            match self
                .planner
                .plan(queued.site.latitude, queued.site.longitude, drone)
            {
                Ok(plan) => return Some((plan, Some(queued.site.site_id), None)),
                Err(err) => {
                    self.counters.planning_failed();
                    log::warn!(
                        "detection from {} discarded, planning failed: {}",
                        queued.site.site_id,
                        err
                    );
                    state.last_planning_error = Some(PlanningRejection {
                        site_id: queued.site.site_id,
                        kind: err.kind(),
                        detail: err.to_string(),
                        at: Utc::now(),
                    });
                }
            }
        }
        None
    }

    /// Flag the active mission for abort. The executor acts on it at its
    /// next checkpoint.
    pub fn abort_active(&self) -> Option<MissionId> {
        let state = self.lock();
        let active = state.active.as_ref()?;
        active.abort.request();
        self.counters.aborts_requested();
        log::warn!("abort requested for {}", active.mission.mission_id);
        Some(active.mission.mission_id)
    }

    pub fn status(&self) -> CoordinatorStatus {
        let state = self.lock();
        let phase = if state.shutting_down {
            DispatchPhase::ShuttingDown
        } else if state.active.is_some() {
            DispatchPhase::Busy
        } else if state.settling(Instant::now()) {
            DispatchPhase::Settling
        } else {
            DispatchPhase::Idle
        };
        CoordinatorStatus {
            drone: self.drone.snapshot(),
            phase,
            active: state.active.as_ref().map(|active| active.mission.clone()),
            queue_depth: state.queue.len(),
            queue_limit: self.settings.queue_depth,
            queued: state
                .queue
                .iter()
                .map(|queued| QueuedSummary {
                    site_id: queued.site.site_id.clone(),
                    confidence: queued.event.confidence,
                    species_label: queued.event.species_label.clone(),
                    observed_at: queued.event.observed_at,
                    received_at: queued.event.received_at,
                })
                .collect(),
            return_pending: state.pending_return.is_some(),
            recent: state.archive.iter().rev().cloned().collect(),
            last_terminal: state.last_terminal.clone(),
            last_planning_error: state.last_planning_error.clone(),
            counters: self.counters.snapshot(),
        }
    }

    /// Block until no mission is active or pending. Returns false on timeout.
    pub fn wait_for_quiescence(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.active.is_none() && !state.has_work() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .wake
                .wait_timeout(state, (deadline - now).min(IDLE_POLL))
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Start the dispatch loop on its own thread.
    pub fn spawn_dispatcher(&self) -> Result<DispatcherHandle> {
        let coordinator = self
            .me
            .upgrade()
            .ok_or_else(|| anyhow!("coordinator dropped"))?;
        let join = std::thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || coordinator.dispatch_loop())?;
        Ok(DispatcherHandle { join: Some(join) })
    }

    fn dispatch_loop(&self) {
        log::info!("dispatch loop running");
        loop {
            if self.dispatch_pending().is_some() {
                continue;
            }
            let state = self.lock();
            if state.shutting_down && state.active.is_none() && state.pending_return.is_none() {
                break;
            }
            let now = Instant::now();
            let ready = state.active.is_none()
                && state.has_work()
                && !state.settling(now)
                && self.drone.snapshot().is_idle();
            if ready {
                continue;
            }
            let timeout = state
                .settling_until
                .filter(|until| *until > now)
                .map_or(IDLE_POLL, |until| (until - now).min(IDLE_POLL));
            let _ = self.wake.wait_timeout(state, timeout);
        }
        log::info!("dispatch loop stopped");
    }

    /// Refuse new events and abandon the queue. The dispatch loop keeps
    /// running until the active mission and any return-to-base flight it
    /// leads to have finished.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        let abandoned: Vec<QueuedEvent> = state.queue.drain(..).collect();
        for queued in &abandoned {
            self.counters.events_abandoned();
            log::error!(
                "detection from {} abandoned at shutdown (observed {})",
                queued.site.site_id,
                queued.event.observed_at
            );
        }
        if state.pending_return.is_some() {
            log::warn!("shutdown: return-to-base still pending, flying it before exit");
        } else if let Some(active) = &state.active {
            log::warn!(
                "shutdown: waiting for {} to finish",
                active.mission.mission_id
            );
        }
        drop(state);
        self.wake.notify_all();
    }

    fn finish(&self, mission_id: MissionId, outcome: MissionOutcome) {
        let mut state = self.lock();
        let active = match state.active.take() {
            Some(active) if active.mission.mission_id == mission_id => active,
            other => {
                state.active = other;
                log::warn!("finish for unknown mission {} ignored", mission_id);
                return;
            }
        };
        let mut mission = active.mission;
        if let Err(err) = mission.finish(outcome.clone()) {
            log::error!("{}: {}; forcing FAILED", mission_id, err);
            mission.state = MissionState::Failed;
            mission.terminal_result = Some(TerminalResult {
                finished_at: Utc::now(),
                state: MissionState::Failed,
                outcome: outcome.clone(),
            });
        }
        self.drone.release(mission_id);

        let success = mission.state != MissionState::Failed;
        match (mission.kind, success) {
            (MissionKind::Observe, true) => self.counters.missions_completed(),
            (MissionKind::Observe, false) => self.counters.missions_failed(),
            (MissionKind::ReturnToBase, true) => self.counters.returns_completed(),
            (MissionKind::ReturnToBase, false) => {
                self.counters.returns_failed();
                log::error!(
                    "return-to-base {} failed; cycle ended, drone {} released",
                    mission_id,
                    mission.drone_id
                );
            }
        }

        if mission.kind == MissionKind::Observe && (success || self.settings.return_after_failure) {
            state.pending_return = Some(ReturnRequest {
                parent: mission_id,
                from_lat: mission.target_lat,
                from_lon: mission.target_lon,
            });
        }

        let (reason, detail) = match &outcome {
            MissionOutcome::Completed { .. } => (None, None),
            MissionOutcome::Failed { reason, detail, .. } => (Some(*reason), Some(detail.clone())),
        };
        state.last_terminal = Some(TerminalSummary {
            mission_id,
            kind: mission.kind,
            state: mission.state,
            reason,
            detail,
            finished_at: Utc::now(),
        });
        state.archive.push_back(mission);
        while state.archive.len() > self.settings.archive_len {
            state.archive.pop_front();
        }
        if !self.settings.settle.is_zero() {
            state.settling_until = Some(Instant::now() + self.settings.settle);
        }
        drop(state);
        self.wake.notify_all();
    }

    fn with_active(&self, mission_id: MissionId, apply: impl FnOnce(&mut Mission)) {
        let mut state = self.lock();
        match state.active.as_mut() {
            Some(active) if active.mission.mission_id == mission_id => apply(&mut active.mission),
            _ => log::warn!("update for inactive mission {} ignored", mission_id),
        }
    }
}

impl StatusSink for Coordinator {
    fn mission_update(&self, update: MissionUpdate) {
        match update {
            MissionUpdate::Started { mission_id } => self.with_active(mission_id, |mission| {
                let to = mission.flying_state();
                if let Err(err) = mission.transition(to) {
                    log::warn!("{}: {}", mission_id, err);
                }
            }),
            MissionUpdate::Phase { mission_id, phase } => {
                self.with_active(mission_id, |mission| mission.phase = Some(phase))
            }
            MissionUpdate::Aborting { mission_id, reason } => {
                self.with_active(mission_id, |mission| {
                    if let Err(err) = mission.transition(MissionState::Aborting) {
                        log::warn!("{}: {}", mission_id, err);
                    }
                });
                log::warn!("{} aborting: {}", mission_id, reason);
            }
            MissionUpdate::Finished {
                mission_id,
                outcome,
            } => self.finish(mission_id, outcome),
        }
    }
}

impl EventSink for Coordinator {
    fn enqueue(&self, event: DetectionEvent) -> Result<QueueReceipt, EnqueueError> {
        Coordinator::enqueue(self, event)
    }
}

#[derive(Debug)]
pub struct DispatcherHandle {
    join: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Wait for the loop to exit; call after `Coordinator::shutdown`.
    pub fn join(mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("dispatcher thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drone::Telemetry;
    use crate::mission::FlightPhase;
    use crate::planner::PlannerSettings;

    #[derive(Default)]
    struct ManualLauncher {
        launched: Mutex<Vec<(Mission, AbortSignal)>>,
    }

    impl MissionLauncher for ManualLauncher {
        fn launch(&self, mission: Mission, abort: AbortSignal, _sink: Arc<dyn StatusSink>) -> Result<()> {
            self.launched.lock().unwrap().push((mission, abort));
            Ok(())
        }
    }

    impl ManualLauncher {
        fn last(&self) -> (Mission, AbortSignal) {
            self.launched.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn sites() -> Arc<SiteRegistry> {
        Arc::new(
            SiteRegistry::from_sites([
                Site {
                    site_id: "pi-001".into(),
                    latitude: 40.0083,
                    longitude: -83.0175,
                    channel_key: "cameratrap/pi-001".into(),
                },
                Site {
                    site_id: "pi-002".into(),
                    latitude: 40.0071,
                    longitude: -83.0201,
                    channel_key: "cameratrap/pi-002".into(),
                },
                Site {
                    site_id: "far".into(),
                    latitude: 40.2,
                    longitude: -83.0175,
                    channel_key: "cameratrap/far".into(),
                },
            ])
            .unwrap(),
        )
    }

    fn planner() -> Planner {
        Planner::new(PlannerSettings {
            home_lat: 40.0065,
            home_lon: -83.0190,
            altitude_m: 13.0,
            max_duration_ms: 180_000,
            return_max_duration_ms: 120_000,
            max_range_m: 2_000.0,
            cruise_speed_mps: 8.0,
            endurance_secs: 1_500.0,
            min_battery_pct: 30.0,
            no_fly_zones: Vec::new(),
        })
    }

    fn coordinator(settings: CoordinatorSettings) -> (Arc<Coordinator>, Arc<ManualLauncher>) {
        let launcher = Arc::new(ManualLauncher::default());
        let drone = DroneStateCell::new(
            "drone-1",
            Telemetry {
                battery_pct: 95.0,
                gps_locked: true,
                link_up: true,
            },
        );
        let coord = Coordinator::new(
            settings,
            planner(),
            sites(),
            drone,
            launcher.clone(),
            Arc::new(Counters::default()),
        );
        (coord, launcher)
    }

    fn event(site_id: &str, confidence: f64) -> DetectionEvent {
        let now = Utc::now();
        DetectionEvent {
            site_id: site_id.to_string(),
            observed_at: now,
            received_at: now,
            confidence,
            species_label: Some("deer".into()),
            raw_payload: String::new(),
        }
    }

    fn complete(coord: &Coordinator, mission_id: MissionId) {
        coord.mission_update(MissionUpdate::Started { mission_id });
        coord.mission_update(MissionUpdate::Finished {
            mission_id,
            outcome: MissionOutcome::Completed { artifact_dir: None },
        });
    }

    fn fail(coord: &Coordinator, mission_id: MissionId, reason: AbortReason) {
        coord.mission_update(MissionUpdate::Started { mission_id });
        coord.mission_update(MissionUpdate::Aborting { mission_id, reason });
        coord.mission_update(MissionUpdate::Finished {
            mission_id,
            outcome: MissionOutcome::Failed {
                reason,
                detail: "test".into(),
                artifact_dir: None,
            },
        });
    }

    #[test]
    fn observe_then_return_to_base_cycle() {
        let (coord, launcher) = coordinator(CoordinatorSettings::default());
        coord.enqueue(event("pi-001", 0.95)).unwrap();

        let observe_id = coord.dispatch_pending().unwrap();
        let (observe, _) = launcher.last();
        assert_eq!(observe.kind, MissionKind::Observe);
        assert_eq!((observe.target_lat, observe.target_lon), (40.0083, -83.0175));
        assert_eq!(observe.state, MissionState::Planned);
        assert_eq!(coord.drone().snapshot().current_mission_id, Some(observe_id));
        assert_eq!(coord.dispatch_pending(), None);

        complete(&coord, observe_id);
        assert!(coord.drone().snapshot().is_idle());
        assert!(coord.status().return_pending);

        let return_id = coord.dispatch_pending().unwrap();
        let (ret, _) = launcher.last();
        assert_eq!(ret.kind, MissionKind::ReturnToBase);
        assert_eq!(ret.parent, Some(observe_id));
        assert_eq!((ret.target_lat, ret.target_lon), (40.0065, -83.0190));

        complete(&coord, return_id);
        let status = coord.status();
        assert_eq!(status.phase, DispatchPhase::Idle);
        assert!(status.drone.is_idle());
        assert_eq!(status.recent[0].state, MissionState::Standby);
        assert_eq!(status.recent[1].state, MissionState::Completed);
        assert_eq!(status.counters.missions_completed, 1);
        assert_eq!(status.counters.returns_completed, 1);
        assert_eq!(coord.dispatch_pending(), None);
    }

    #[test]
    fn events_wait_in_arrival_order_while_busy() {
        let (coord, launcher) = coordinator(CoordinatorSettings::default());
        coord.enqueue(event("pi-001", 0.9)).unwrap();
        let first = coord.dispatch_pending().unwrap();

        let receipt = coord.enqueue(event("pi-002", 0.8)).unwrap();
        assert_eq!(receipt.position, 1);
        let receipt = coord.enqueue(event("pi-001", 0.99)).unwrap();
        assert_eq!(receipt.position, 2);
        assert_eq!(coord.dispatch_pending(), None);

        complete(&coord, first);
        let ret = coord.dispatch_pending().unwrap();
        complete(&coord, ret);

        coord.dispatch_pending().unwrap();
        let (next, _) = launcher.last();
        assert_eq!(next.origin_site.as_deref(), Some("pi-002"));
        let status = coord.status();
        assert_eq!(status.queue_depth, 1);
        assert_eq!(status.queued[0].site_id, "pi-001");
    }

    #[test]
    fn ties_on_arrival_break_by_observation_time() {
        let (coord, launcher) = coordinator(CoordinatorSettings::default());
        let received = Utc::now();
        let mut later = event("pi-001", 0.9);
        later.received_at = received;
        later.observed_at = received;
        let mut earlier = event("pi-002", 0.9);
        earlier.received_at = received;
        earlier.observed_at = received - chrono::Duration::seconds(5);
        coord.enqueue(later).unwrap();
        assert_eq!(coord.enqueue(earlier).unwrap().position, 1);

        coord.dispatch_pending().unwrap();
        assert_eq!(launcher.last().0.origin_site.as_deref(), Some("pi-002"));
    }

    #[test]
    fn failed_observe_skips_return_flight() {
        let (coord, _launcher) = coordinator(CoordinatorSettings::default());
        coord.enqueue(event("pi-001", 0.95)).unwrap();
        let id = coord.dispatch_pending().unwrap();
        fail(&coord, id, AbortReason::Battery);

        let status = coord.status();
        assert!(status.drone.is_idle());
        assert!(!status.return_pending);
        let last = status.last_terminal.unwrap();
        assert_eq!(last.state, MissionState::Failed);
        assert_eq!(last.reason, Some(AbortReason::Battery));
        assert_eq!(status.counters.missions_failed, 1);
        assert_eq!(coord.dispatch_pending(), None);
    }

    #[test]
    fn return_after_failure_when_configured() {
        let (coord, launcher) = coordinator(CoordinatorSettings {
            return_after_failure: true,
            ..CoordinatorSettings::default()
        });
        coord.enqueue(event("pi-001", 0.95)).unwrap();
        let id = coord.dispatch_pending().unwrap();
        fail(&coord, id, AbortReason::Gps);
        coord.dispatch_pending().unwrap();
        assert_eq!(launcher.last().0.kind, MissionKind::ReturnToBase);
    }

    #[test]
    fn failed_return_still_releases_drone() {
        let (coord, _launcher) = coordinator(CoordinatorSettings::default());
        coord.enqueue(event("pi-001", 0.95)).unwrap();
        let id = coord.dispatch_pending().unwrap();
        complete(&coord, id);
        let ret = coord.dispatch_pending().unwrap();
        fail(&coord, ret, AbortReason::Link);

        let status = coord.status();
        assert!(status.drone.is_idle());
        assert_eq!(status.counters.returns_failed, 1);
        assert_eq!(status.phase, DispatchPhase::Idle);
    }

    #[test]
    fn queue_overflow_is_reported() {
        let (coord, _launcher) = coordinator(CoordinatorSettings {
            queue_depth: 2,
            ..CoordinatorSettings::default()
        });
        coord.enqueue(event("pi-001", 0.9)).unwrap();
        coord.enqueue(event("pi-002", 0.9)).unwrap();
        let err = coord.enqueue(event("pi-001", 0.9)).unwrap_err();
        assert_eq!(err, EnqueueError::QueueOverflow { depth: 2 });
        let counters = coord.status().counters;
        assert_eq!(counters.events_overflowed, 1);
        assert_eq!(counters.events_enqueued, 2);
    }

    #[test]
    fn threshold_is_inclusive() {
        let (coord, _launcher) = coordinator(CoordinatorSettings::default());
        assert!(coord.enqueue(event("pi-001", 0.5)).is_ok());
        let err = coord.enqueue(event("pi-002", 0.5 - 1e-9)).unwrap_err();
        assert!(matches!(err, EnqueueError::BelowThreshold { .. }));
        assert!(coord.enqueue(event("pi-002", f64::NAN)).is_err());
        assert_eq!(coord.status().counters.events_below_threshold, 2);
    }

    #[test]
    fn planning_failure_discards_and_moves_on() {
        let (coord, launcher) = coordinator(CoordinatorSettings::default());
        coord.enqueue(event("far", 0.9)).unwrap();
        coord.enqueue(event("pi-001", 0.9)).unwrap();

        coord.dispatch_pending().unwrap();
        assert_eq!(launcher.last().0.origin_site.as_deref(), Some("pi-001"));
        let status = coord.status();
        assert_eq!(status.counters.planning_failed, 1);
        let rejection = status.last_planning_error.unwrap();
        assert_eq!(rejection.site_id, "far");
        assert_eq!(rejection.kind, "out_of_range");
    }

    #[test]
    fn planning_failure_alone_leaves_drone_idle() {
        let (coord, launcher) = coordinator(CoordinatorSettings::default());
        coord.enqueue(event("far", 0.9)).unwrap();
        assert_eq!(coord.dispatch_pending(), None);
        assert!(coord.drone().snapshot().is_idle());
        assert!(launcher.launched.lock().unwrap().is_empty());
    }

    #[test]
    fn abort_flags_active_mission() {
        let (coord, launcher) = coordinator(CoordinatorSettings::default());
        assert_eq!(coord.abort_active(), None);
        coord.enqueue(event("pi-001", 0.9)).unwrap();
        let id = coord.dispatch_pending().unwrap();
        coord.mission_update(MissionUpdate::Started { mission_id: id });
        coord.mission_update(MissionUpdate::Phase {
            mission_id: id,
            phase: FlightPhase::Transit,
        });
        assert_eq!(coord.abort_active(), Some(id));
        assert!(launcher.last().1.is_requested());
        let active = coord.status().active.unwrap();
        assert_eq!(active.state, MissionState::Executing);
        assert_eq!(active.phase, Some(FlightPhase::Transit));
    }

    #[test]
    fn settle_delays_next_dispatch() {
        let (coord, _launcher) = coordinator(CoordinatorSettings {
            settle: Duration::from_secs(60),
            ..CoordinatorSettings::default()
        });
        coord.enqueue(event("pi-001", 0.9)).unwrap();
        let id = coord.dispatch_pending().unwrap();
        complete(&coord, id);
        assert_eq!(coord.status().phase, DispatchPhase::Settling);
        assert_eq!(coord.dispatch_pending(), None);
    }

    #[test]
    fn shutdown_refuses_new_events() {
        let (coord, _launcher) = coordinator(CoordinatorSettings::default());
        coord.shutdown();
        assert_eq!(
            coord.enqueue(event("pi-001", 0.9)).unwrap_err(),
            EnqueueError::ShuttingDown
        );
        assert_eq!(coord.status().counters.events_refused, 1);
    }

    #[test]
    fn shutdown_abandons_queue_but_flies_pending_return() {
        let (coord, launcher) = coordinator(CoordinatorSettings::default());
        coord.enqueue(event("pi-001", 0.9)).unwrap();
        coord.enqueue(event("pi-002", 0.9)).unwrap();
        let observe = coord.dispatch_pending().unwrap();
        complete(&coord, observe);

        coord.shutdown();
        let status = coord.status();
        assert_eq!(status.phase, DispatchPhase::ShuttingDown);
        assert!(status.return_pending);
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.counters.events_abandoned, 1);
        assert_eq!(status.counters.events_dropped(), 1);

        let ret = coord.dispatch_pending().unwrap();
        assert_eq!(launcher.last().0.kind, MissionKind::ReturnToBase);
        complete(&coord, ret);
        assert_eq!(coord.dispatch_pending(), None);
        assert!(coord.drone().snapshot().is_idle());
        assert_eq!(coord.status().counters.returns_completed, 1);
    }

    #[test]
    fn dispatcher_outlives_shutdown_until_drone_is_home() {
        let (coord, launcher) = coordinator(CoordinatorSettings::default());
        coord.enqueue(event("pi-001", 0.9)).unwrap();
        let observe = coord.dispatch_pending().unwrap();
        coord.shutdown();
        let dispatcher = coord.spawn_dispatcher().unwrap();

        complete(&coord, observe);
        let deadline = Instant::now() + Duration::from_secs(5);
        while launcher.launched.lock().unwrap().len() < 2 {
            assert!(Instant::now() < deadline, "return flight never dispatched");
            std::thread::sleep(Duration::from_millis(10));
        }
        let (ret, _) = launcher.last();
        assert_eq!(ret.kind, MissionKind::ReturnToBase);
        complete(&coord, ret.mission_id);

        dispatcher.join().unwrap();
        let status = coord.status();
        assert!(status.drone.is_idle());
        assert!(!status.return_pending);
        assert_eq!(status.counters.returns_completed, 1);
    }
}
