use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{DroneLink, MediaArtifact, Telemetry};

/// Actuation commands, used to target injected faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimOp {
    Takeoff,
    Goto,
    Record,
    ReturnToHome,
    Land,
}

/// Commands the simulator has accepted, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum SimCommand {
    Connect,
    Takeoff,
    Goto { lat: f64, lon: f64, altitude_m: f64 },
    Record { duration_ms: u64 },
    ReturnToHome,
    Land,
    Disconnect,
}

/// Fault injected after a number of completed actuation commands.
#[derive(Clone, Debug, PartialEq)]
pub enum SimFault {
    BatteryDrop { after_ops: usize, to_pct: f64 },
    GpsLoss { after_ops: usize },
    LinkLoss { after_ops: usize },
    ActuatorFailure { op: SimOp },
}

/// Shared view of the commands a `SimulatedDrone` executed.
#[derive(Clone, Debug, Default)]
pub struct SimJournal {
    commands: Arc<Mutex<Vec<SimCommand>>>,
}

impl SimJournal {
    fn push(&self, command: SimCommand) {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(command);
    }

    pub fn commands(&self) -> Vec<SimCommand> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// In-process drone used for tests and hardware-free runs.
pub struct SimulatedDrone {
    battery_pct: f64,
    gps_locked: bool,
    link_up: bool,
    drain_per_op: f64,
    op_latency: Duration,
    ops_completed: usize,
    faults: Vec<SimFault>,
    clips: usize,
    journal: SimJournal,
}

impl SimulatedDrone {
    pub fn new(battery_pct: f64) -> Self {
        Self {
            battery_pct,
            gps_locked: true,
            link_up: true,
            drain_per_op: 0.0,
            op_latency: Duration::ZERO,
            ops_completed: 0,
            faults: Vec::new(),
            clips: 0,
            journal: SimJournal::default(),
        }
    }

    pub fn with_drain_per_op(mut self, pct: f64) -> Self {
        self.drain_per_op = pct;
        self
    }

    pub fn with_op_latency(mut self, latency: Duration) -> Self {
        self.op_latency = latency;
        self
    }

    pub fn with_fault(mut self, fault: SimFault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn journal(&self) -> SimJournal {
        self.journal.clone()
    }

    fn actuate(&mut self, op: SimOp, command: SimCommand) -> Result<()> {
        if !self.link_up {
            return Err(anyhow!("{:?} rejected: link down", op));
        }
        if self
            .faults
            .iter()
            .any(|fault| *fault == SimFault::ActuatorFailure { op })
        {
            return Err(anyhow!("{:?} actuator fault", op));
        }
        if !self.op_latency.is_zero() {
            std::thread::sleep(self.op_latency);
        }
        self.journal.push(command);
        self.ops_completed += 1;
        self.battery_pct = (self.battery_pct - self.drain_per_op).max(0.0);
        self.apply_faults();
        Ok(())
    }

    fn apply_faults(&mut self) {
        for fault in &self.faults {
            match *fault {
                SimFault::BatteryDrop { after_ops, to_pct } if self.ops_completed >= after_ops => {
                    self.battery_pct = self.battery_pct.min(to_pct);
                }
                SimFault::GpsLoss { after_ops } if self.ops_completed >= after_ops => {
                    self.gps_locked = false;
                }
                SimFault::LinkLoss { after_ops } if self.ops_completed >= after_ops => {
                    self.link_up = false;
                }
                _ => {}
            }
        }
    }
}

impl DroneLink for SimulatedDrone {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn connect(&mut self) -> Result<()> {
        self.journal.push(SimCommand::Connect);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.journal.push(SimCommand::Disconnect);
        Ok(())
    }

    fn takeoff(&mut self) -> Result<()> {
        self.actuate(SimOp::Takeoff, SimCommand::Takeoff)
    }

    fn goto(&mut self, lat: f64, lon: f64, altitude_m: f64) -> Result<()> {
        self.actuate(
            SimOp::Goto,
            SimCommand::Goto {
                lat,
                lon,
                altitude_m,
            },
        )
    }

    fn record(&mut self, duration: Duration) -> Result<Vec<MediaArtifact>> {
        self.actuate(
            SimOp::Record,
            SimCommand::Record {
                duration_ms: duration.as_millis() as u64,
            },
        )?;
        let name = format!("clip-{:03}.h264", self.clips);
        self.clips += 1;
        Ok(vec![MediaArtifact {
            bytes: format!("simulated {} ms segment", duration.as_millis()).into_bytes(),
            name,
        }])
    }

    fn return_to_home(&mut self) -> Result<()> {
        self.actuate(SimOp::ReturnToHome, SimCommand::ReturnToHome)
    }

    fn land(&mut self) -> Result<()> {
        self.actuate(SimOp::Land, SimCommand::Land)
    }

    fn telemetry(&mut self) -> Result<Telemetry> {
        Ok(Telemetry {
            battery_pct: self.battery_pct,
            gps_locked: self.gps_locked,
            link_up: self.link_up,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_drop_applies_after_ops() {
        let mut drone = SimulatedDrone::new(90.0).with_fault(SimFault::BatteryDrop {
            after_ops: 2,
            to_pct: 10.0,
        });
        drone.takeoff().unwrap();
        assert_eq!(drone.telemetry().unwrap().battery_pct, 90.0);
        drone.goto(40.0, -83.0, 13.0).unwrap();
        assert_eq!(drone.telemetry().unwrap().battery_pct, 10.0);
    }

    #[test]
    fn actuator_fault_rejects_command() {
        let mut drone =
            SimulatedDrone::new(90.0).with_fault(SimFault::ActuatorFailure { op: SimOp::Takeoff });
        assert!(drone.takeoff().is_err());
        assert!(drone.journal().commands().is_empty());
    }

    #[test]
    fn record_names_segments_sequentially() {
        let mut drone = SimulatedDrone::new(90.0);
        let first = drone.record(Duration::from_millis(10)).unwrap();
        let second = drone.record(Duration::from_millis(10)).unwrap();
        assert_eq!(first[0].name, "clip-000.h264");
        assert_eq!(second[0].name, "clip-001.h264");
    }
}
