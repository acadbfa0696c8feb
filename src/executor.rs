//! Mission executor.
//!
//! Flies one plan against a `DroneLink`. Between actuation calls the
//! executor samples telemetry, checks the watchdog and the operator abort
//! flag; crossing any floor short-circuits the remaining phases into the
//! emergency return-and-land path. Execution faults end the mission as
//! `FAILED` with an `AbortReason` instead of propagating.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use crate::coordinator::MissionLauncher;
use crate::drone::{DroneLink, DroneStateCell, MediaArtifact, Telemetry};
use crate::error::AbortReason;
use crate::mission::{FlightPhase, Mission, MissionOutcome, MissionState, MissionUpdate, StatusSink};
use crate::{to_epoch_ms, MissionKind};

const TELEMETRY_HEADER: &str = "timestamp_ms,phase,battery_pct,gps_locked,link_up";

/// Abort request for the active mission. Polled at checkpoints only.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorSettings {
    /// In-flight battery floor; crossing it triggers the emergency abort.
    pub abort_battery_pct: f64,
    pub record_duration: Duration,
    /// Longest stretch of recording between telemetry checkpoints.
    pub telemetry_interval: Duration,
    pub media_root: PathBuf,
}

#[derive(Clone)]
pub struct MissionExecutor {
    link: Arc<Mutex<Box<dyn DroneLink>>>,
    drone: DroneStateCell,
    settings: Arc<ExecutorSettings>,
}

impl MissionExecutor {
    pub fn new(link: Box<dyn DroneLink>, drone: DroneStateCell, settings: ExecutorSettings) -> Self {
        Self {
            link: Arc::new(Mutex::new(link)),
            drone,
            settings: Arc::new(settings),
        }
    }

    /// Fly `mission` to a terminal outcome, reporting through `sink`.
    ///
    /// Artifacts are written before `Finished` is sent.
    pub fn run(&self, mission: &Mission, abort: &AbortSignal, sink: &dyn StatusSink) -> MissionOutcome {
        let mission_id = mission.mission_id;
        sink.mission_update(MissionUpdate::Started { mission_id });
        log::info!(
            "{} {} started: target ({:.5}, {:.5}) at {} m, cap {} ms",
            mission_id,
            mission.kind,
            mission.target_lat,
            mission.target_lon,
            mission.altitude_m,
            mission.max_duration_ms
        );

        let mut link = lock_link(&self.link);
        let mut flight = Flight {
            link: &mut **link,
            mission,
            abort,
            sink,
            drone: &self.drone,
            settings: &self.settings,
            started: Instant::now(),
            airborne: mission.kind == MissionKind::ReturnToBase,
            samples: Vec::new(),
            media: Vec::new(),
        };

        let verdict = match flight.link.connect() {
            Ok(()) => flight.fly(),
            Err(err) => Err(Abort::new(
                AbortReason::Link,
                format!("connect failed: {:#}", err),
            )),
        };
        let aborted = verdict.is_err();
        let outcome = match verdict {
            Ok(()) => MissionOutcome::Completed { artifact_dir: None },
            Err(abort) => flight.emergency_return(abort),
        };

        let Flight { samples, media, .. } = flight;
        let outcome = self.persist(mission, aborted, outcome, &samples, &media);
        if let Err(err) = link.disconnect() {
            log::warn!("{} disconnect failed: {:#}", mission_id, err);
        }
        drop(link);

        match &outcome {
            MissionOutcome::Completed { .. } => log::info!("{} completed", mission_id),
            MissionOutcome::Failed { reason, detail, .. } => {
                log::error!("{} failed ({}): {}", mission_id, reason, detail)
            }
        }
        sink.mission_update(MissionUpdate::Finished {
            mission_id,
            outcome: outcome.clone(),
        });
        outcome
    }

    fn persist(
        &self,
        mission: &Mission,
        aborted: bool,
        outcome: MissionOutcome,
        samples: &[TelemetrySample],
        media: &[MediaArtifact],
    ) -> MissionOutcome {
        let dir = self.settings.media_root.join(mission.mission_id.to_string());
        let record = final_record(mission, aborted, &outcome, &dir);
        match write_artifacts(&dir, &record, samples, media) {
            Ok(()) => with_artifact_dir(outcome, dir),
            Err(err) => {
                log::error!(
                    "{} artifacts not persisted to {}: {:#}",
                    mission.mission_id,
                    dir.display(),
                    err
                );
                match outcome {
                    MissionOutcome::Completed { .. } => MissionOutcome::Failed {
                        reason: AbortReason::Storage,
                        detail: format!("artifact write failed: {:#}", err),
                        artifact_dir: None,
                    },
                    failed => failed,
                }
            }
        }
    }
}

impl MissionLauncher for MissionExecutor {
    fn launch(
        &self,
        mission: Mission,
        abort: AbortSignal,
        sink: Arc<dyn StatusSink>,
    ) -> Result<()> {
        let executor = self.clone();
        std::thread::Builder::new()
            .name(format!("executor-{}", mission.mission_id))
            .spawn(move || {
                executor.run(&mission, &abort, sink.as_ref());
            })
            .context("spawn executor thread")?;
        Ok(())
    }

    /// Skipped while a flight holds the link.
    fn refresh_telemetry(&self) {
        let mut link = match self.link.try_lock() {
            Ok(link) => link,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        match link.telemetry() {
            Ok(telemetry) => self.drone.record_telemetry(&telemetry),
            Err(err) => {
                log::warn!("idle telemetry read from {} failed: {:#}", link.name(), err);
                self.drone.mark_link_lost();
            }
        }
    }
}

#[derive(Debug)]
struct Abort {
    reason: AbortReason,
    detail: String,
}

impl Abort {
    fn new(reason: AbortReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

struct TelemetrySample {
    timestamp_ms: i64,
    phase: FlightPhase,
    telemetry: Telemetry,
}

struct Flight<'a> {
    link: &'a mut dyn DroneLink,
    mission: &'a Mission,
    abort: &'a AbortSignal,
    sink: &'a dyn StatusSink,
    drone: &'a DroneStateCell,
    settings: &'a ExecutorSettings,
    started: Instant,
    airborne: bool,
    samples: Vec<TelemetrySample>,
    media: Vec<MediaArtifact>,
}

impl Flight<'_> {
    fn fly(&mut self) -> Result<(), Abort> {
        let phases = FlightPhase::sequence(self.mission.kind);
        for &phase in phases {
            self.checkpoint(phase)?;
            self.sink.mission_update(MissionUpdate::Phase {
                mission_id: self.mission.mission_id,
                phase,
            });
            log::debug!("{} entering {}", self.mission.mission_id, phase);
            self.fly_phase(phase)?;
        }
        if let Some(&last) = phases.last() {
            self.checkpoint(last)?;
        }
        Ok(())
    }

    fn fly_phase(&mut self, phase: FlightPhase) -> Result<(), Abort> {
        let mission = self.mission;
        let result = match phase {
            FlightPhase::Takeoff => self.link.takeoff().map(|()| self.airborne = true),
            FlightPhase::Transit | FlightPhase::TransitBack => {
                self.link
                    .goto(mission.target_lat, mission.target_lon, mission.altitude_m)
            }
            FlightPhase::Record => return self.record(),
            FlightPhase::Land => self.link.land().map(|()| self.airborne = false),
        };
        result.map_err(|err| self.actuation_failure(phase, err))
    }

    /// Record in slices no longer than the telemetry interval so the floors
    /// and the watchdog are still checked during long captures.
    fn record(&mut self) -> Result<(), Abort> {
        let interval = self.settings.telemetry_interval;
        let mut remaining = self.settings.record_duration;
        loop {
            let slice = if interval.is_zero() {
                remaining
            } else {
                remaining.min(interval)
            };
            match self.link.record(slice) {
                Ok(media) => self.media.extend(media),
                Err(err) => return Err(self.actuation_failure(FlightPhase::Record, err)),
            }
            remaining = remaining.saturating_sub(slice);
            if remaining.is_zero() {
                return Ok(());
            }
            self.checkpoint(FlightPhase::Record)?;
        }
    }

    fn checkpoint(&mut self, phase: FlightPhase) -> Result<(), Abort> {
        if self.abort.is_requested() {
            return Err(Abort::new(AbortReason::Operator, "abort requested by operator"));
        }
        let elapsed = self.started.elapsed();
        let cap = self.mission.max_duration();
        if elapsed > cap {
            return Err(Abort::new(
                AbortReason::Timeout,
                format!(
                    "watchdog: {} ms elapsed, cap {} ms",
                    elapsed.as_millis(),
                    cap.as_millis()
                ),
            ));
        }
        let telemetry = self.sample(phase)?;
        if !telemetry.link_up {
            return Err(Abort::new(AbortReason::Link, "link lost"));
        }
        if telemetry.battery_pct < self.settings.abort_battery_pct {
            return Err(Abort::new(
                AbortReason::Battery,
                format!(
                    "battery {:.1}% below floor {:.1}%",
                    telemetry.battery_pct, self.settings.abort_battery_pct
                ),
            ));
        }
        if !telemetry.gps_locked {
            return Err(Abort::new(AbortReason::Gps, "gps lock lost"));
        }
        Ok(())
    }

    fn sample(&mut self, phase: FlightPhase) -> Result<Telemetry, Abort> {
        match self.link.telemetry() {
            Ok(telemetry) => {
                self.drone.record_telemetry(&telemetry);
                self.samples.push(TelemetrySample {
                    timestamp_ms: to_epoch_ms(chrono::Utc::now()),
                    phase,
                    telemetry,
                });
                Ok(telemetry)
            }
            Err(err) => {
                self.drone.mark_link_lost();
                Err(Abort::new(
                    AbortReason::Link,
                    format!("telemetry unavailable: {:#}", err),
                ))
            }
        }
    }

    /// Classify a failed actuation; a dead link explains most of them.
    fn actuation_failure(&mut self, phase: FlightPhase, err: anyhow::Error) -> Abort {
        let link_down = match self.link.telemetry() {
            Ok(telemetry) => {
                self.drone.record_telemetry(&telemetry);
                !telemetry.link_up
            }
            Err(_) => {
                self.drone.mark_link_lost();
                true
            }
        };
        let reason = if link_down {
            AbortReason::Link
        } else {
            AbortReason::Actuator
        };
        Abort::new(reason, format!("{} failed: {:#}", phase, err))
    }

    fn emergency_return(&mut self, abort: Abort) -> MissionOutcome {
        let mission_id = self.mission.mission_id;
        log::warn!(
            "{} emergency abort ({}): {}",
            mission_id,
            abort.reason,
            abort.detail
        );
        self.sink.mission_update(MissionUpdate::Aborting {
            mission_id,
            reason: abort.reason,
        });
        if self.airborne {
            if let Err(err) = self.link.return_to_home() {
                log::error!("{} return-to-home failed: {:#}", mission_id, err);
            }
            match self.link.land() {
                Ok(()) => self.airborne = false,
                Err(err) => log::error!("{} landing failed: {:#}", mission_id, err),
            }
        }
        MissionOutcome::Failed {
            reason: abort.reason,
            detail: abort.detail,
            artifact_dir: None,
        }
    }
}

#[derive(Serialize)]
struct MissionReport<'a> {
    mission: &'a Mission,
    media: Vec<String>,
    telemetry_samples: usize,
}

fn final_record(mission: &Mission, aborted: bool, outcome: &MissionOutcome, dir: &Path) -> Mission {
    let mut record = mission.clone();
    record.state = if aborted {
        MissionState::Aborting
    } else {
        mission.flying_state()
    };
    if let Err(err) = record.finish(with_artifact_dir(outcome.clone(), dir.to_path_buf())) {
        log::warn!("{} report state: {}", mission.mission_id, err);
    }
    record
}

fn with_artifact_dir(outcome: MissionOutcome, dir: PathBuf) -> MissionOutcome {
    match outcome {
        MissionOutcome::Completed { .. } => MissionOutcome::Completed {
            artifact_dir: Some(dir),
        },
        MissionOutcome::Failed { reason, detail, .. } => MissionOutcome::Failed {
            reason,
            detail,
            artifact_dir: Some(dir),
        },
    }
}

fn write_artifacts(
    dir: &Path,
    record: &Mission,
    samples: &[TelemetrySample],
    media: &[MediaArtifact],
) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let mut names = Vec::with_capacity(media.len());
    for (idx, artifact) in media.iter().enumerate() {
        let name = sanitize_name(&artifact.name, idx);
        let path = dir.join(&name);
        fs::write(&path, &artifact.bytes).with_context(|| format!("write {}", path.display()))?;
        names.push(name);
    }

    let csv_path = dir.join("telemetry.csv");
    let mut csv = fs::File::create(&csv_path)
        .with_context(|| format!("create {}", csv_path.display()))?;
    writeln!(csv, "{}", TELEMETRY_HEADER)?;
    for sample in samples {
        writeln!(
            csv,
            "{},{},{:.1},{},{}",
            sample.timestamp_ms,
            sample.phase,
            sample.telemetry.battery_pct,
            sample.telemetry.gps_locked,
            sample.telemetry.link_up
        )?;
    }
    csv.sync_all()?;

    let report = MissionReport {
        mission: record,
        media: names,
        telemetry_samples: samples.len(),
    };
    let json = serde_json::to_vec_pretty(&report)?;
    let report_path = dir.join("mission.json");
    fs::write(&report_path, json).with_context(|| format!("write {}", report_path.display()))?;
    Ok(())
}

fn sanitize_name(name: &str, idx: usize) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() || cleaned == "telemetry.csv" || cleaned == "mission.json" {
        format!("artifact-{:03}.bin", idx)
    } else {
        cleaned.to_string()
    }
}

fn lock_link(link: &Mutex<Box<dyn DroneLink>>) -> MutexGuard<'_, Box<dyn DroneLink>> {
    link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
