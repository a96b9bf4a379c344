//! Closed-loop programming of a single memristor toward a target resistance.
//!
//! Each [`ProgrammingController::step`] runs one read cycle, classifies the measured resistance
//! against the tolerance band and, when outside the band, plays one write train:
//!
//! ```text
//! ReadCycle -> {Converged, ReverseWrite, ForwardWrite, Hold} -> ReadCycle ...
//! ```
//!
//! The band is `[0.95 * target, 1.05 * target]`, bounds included. A resistance below the band gets
//! a reverse write (pushes resistance up), above it a forward write. An invalid read never drives a
//! write: the controller holds and reads again on the next step.
//!
//! The loop ends in `Converged`, `OneShotDone` (one read and at most one write in
//! [`ProgramMode::OneShot`]), `Aborted` on an acquisition failure, or `Cancelled` through the
//! [`RunToken`]. [`ProgramMode::ReadOnly`] never writes and never terminates on its own.

use std::fmt;
use std::time::Duration;

use memristor_backend::config::{ProgramConfig, ProgramMode};
use memristor_backend::error::{positive, ConfigError};
use memristor_backend::postprocess::AppliedEnergy;
use memristor_backend::pulse::PulseSpec;

use crate::instrument::Instrument;
use crate::probe::{Probe, ReadMeasurement, WriteCapture};
use crate::run_token::RunToken;
use crate::sequencer::AcquisitionError;

/// Relative half-width of the tolerance band.
pub const TOLERANCE: f64 = 0.05;

/// Decision taken after a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramAction {
    /// Read-only mode, nothing written.
    ReadOnly,
    /// Invalid read, nothing written.
    Hold,
    ForwardWrite,
    ReverseWrite,
    Converged,
}

impl fmt::Display for ProgramAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ProgramAction::ReadOnly => "read only",
                ProgramAction::Hold => "hold",
                ProgramAction::ForwardWrite => "forward write",
                ProgramAction::ReverseWrite => "reverse write",
                ProgramAction::Converged => "converged",
            }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramStatus {
    Running,
    Converged,
    OneShotDone,
    Aborted,
    Cancelled,
}

impl ProgramStatus {
    pub fn is_terminal(&self) -> bool {
        *self != ProgramStatus::Running
    }
}

impl fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Target band and the last measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgrammingState {
    pub target_resistance: f64,
    pub upper_bound: f64,
    pub lower_bound: f64,
    /// NaN until the first valid read.
    pub last_resistance: f64,
    pub last_conductance: f64,
    pub mode: ProgramMode,
}

impl ProgrammingState {
    pub fn new(target_resistance: f64, mode: ProgramMode) -> Self {
        ProgrammingState {
            target_resistance,
            upper_bound: target_resistance * (1.0 + TOLERANCE),
            lower_bound: target_resistance * (1.0 - TOLERANCE),
            last_resistance: f64::NAN,
            last_conductance: f64::NAN,
            mode,
        }
    }

    /// Band decision for `resistance`, ignoring the mode.
    pub fn classify(&self, resistance: f64) -> ProgramAction {
        if !(resistance.is_finite() && resistance > 0.0) {
            ProgramAction::Hold
        } else if resistance < self.lower_bound {
            ProgramAction::ReverseWrite
        } else if resistance > self.upper_bound {
            ProgramAction::ForwardWrite
        } else {
            ProgramAction::Converged
        }
    }

    /// Records a read and returns the action it calls for in the current mode.
    pub fn update(&mut self, resistance: f64) -> ProgramAction {
        self.last_resistance = resistance;
        self.last_conductance = 1.0 / resistance;
        match self.mode {
            ProgramMode::ReadOnly => ProgramAction::ReadOnly,
            _ => self.classify(resistance),
        }
    }
}

/// Everything observed during one [`ProgrammingController::step`].
#[derive(Clone, Debug)]
pub struct ProgramEvent {
    pub iteration: usize,
    pub read: ReadMeasurement,
    pub action: ProgramAction,
    pub write: Option<WriteCapture>,
    /// Estimate for a forward train on the measured resistance; absent for invalid reads.
    pub applied: Option<AppliedEnergy>,
    pub status: ProgramStatus,
}

pub struct ProgrammingController<I: Instrument> {
    instrument: I,
    probe: Probe,
    config: ProgramConfig,
    forward: PulseSpec,
    reverse: PulseSpec,
    token: RunToken,
    state: ProgrammingState,
    status: ProgramStatus,
    iteration: usize,
}

impl<I: Instrument> ProgrammingController<I> {
    /// Fails when either write setting does not form a valid pulse.
    pub fn new(instrument: I, probe: Probe, config: ProgramConfig, token: RunToken) -> Result<Self, ConfigError> {
        let forward = config.forward.pulse_spec(config.shape)?;
        let reverse = config.reverse.pulse_spec(config.shape)?;
        log::info!(
            "Programming toward {} ohm ({}), forward {}, reverse {}",
            config.target_resistance,
            config.mode,
            forward,
            reverse
        );
        Ok(ProgrammingController {
            instrument,
            probe,
            forward,
            reverse,
            token,
            state: ProgrammingState::new(config.target_resistance, config.mode),
            config,
            status: ProgramStatus::Running,
            iteration: 0,
        })
    }

    pub fn state(&self) -> &ProgrammingState {
        &self.state
    }
    pub fn status(&self) -> ProgramStatus {
        self.status
    }
    pub fn iteration(&self) -> usize {
        self.iteration
    }
    pub fn token(&self) -> &RunToken {
        &self.token
    }
    pub fn probe(&self) -> &Probe {
        &self.probe
    }
    pub fn instrument(&self) -> &I {
        &self.instrument
    }
    pub fn into_instrument(self) -> I {
        self.instrument
    }

    /// Moves the band to a new target. The loop resumes if it had converged.
    pub fn set_target(&mut self, target_resistance: f64) -> Result<(), ConfigError> {
        positive("target resistance", target_resistance)?;
        self.state = ProgrammingState {
            last_resistance: self.state.last_resistance,
            last_conductance: self.state.last_conductance,
            ..ProgrammingState::new(target_resistance, self.state.mode)
        };
        self.config.target_resistance = target_resistance;
        if self.status == ProgramStatus::Converged {
            self.status = ProgramStatus::Running;
        }
        Ok(())
    }

    /// Rebuilds the resistance model for a new series resistance.
    pub fn set_series_resistance(&mut self, series_resistance: f64) -> Result<(), ConfigError> {
        self.probe.set_series_resistance(series_resistance)
    }

    /// Runs one read and, if called for, one write. Returns `None` once the loop has ended.
    ///
    /// Every step after the first waits one sample period first. An acquisition failure ends the
    /// loop as `Aborted` (`Cancelled` when interrupted) and is returned.
    pub fn step(&mut self) -> Result<Option<ProgramEvent>, AcquisitionError> {
        if self.status.is_terminal() {
            return Ok(None);
        }
        match self.try_step() {
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                self.status = if e.is_interrupted() {
                    ProgramStatus::Cancelled
                } else {
                    ProgramStatus::Aborted
                };
                log::info!("Programming loop {} at iteration {}", self.status, self.iteration);
                Err(e)
            }
        }
    }

    fn try_step(&mut self) -> Result<ProgramEvent, AcquisitionError> {
        if self.iteration > 0 {
            self.token
                .sleep(Duration::from_secs_f64(self.config.sample_period_s))?;
        }
        self.token.check()?;

        let read = self.probe.read(&mut self.instrument, &self.token)?;
        let action = self.state.update(read.resistance);
        log::debug!(
            "[{}] R = {:.1} ohm, V = {:.4} V: {}",
            self.iteration,
            read.resistance,
            read.read_voltage,
            action
        );

        let write = match action {
            ProgramAction::ForwardWrite => Some((self.forward, self.config.forward.pulse_count)),
            ProgramAction::ReverseWrite => Some((self.reverse, self.config.reverse.pulse_count)),
            _ => None,
        };
        let write = match write {
            Some((spec, pulse_count)) => {
                Some(self.probe.write(&mut self.instrument, &spec, pulse_count, &self.token)?)
            }
            None => None,
        };
        let applied = read.is_valid().then(|| {
            self.probe
                .applied_energy(&self.forward, self.config.forward.pulse_count, read.resistance)
        });

        self.status = match (action, self.state.mode) {
            (ProgramAction::Converged, _) => ProgramStatus::Converged,
            (_, ProgramMode::OneShot) => ProgramStatus::OneShotDone,
            _ => ProgramStatus::Running,
        };
        if self.status.is_terminal() {
            log::info!(
                "Programming {} after {} iterations at {:.1} ohm",
                self.status,
                self.iteration + 1,
                read.resistance
            );
        }

        let event = ProgramEvent {
            iteration: self.iteration,
            read,
            action,
            write,
            applied,
            status: self.status,
        };
        self.iteration += 1;
        Ok(event)
    }

    /// Steps until the loop ends, handing every event to `on_event`.
    ///
    /// Cancellation ends the loop with `Ok(ProgramStatus::Cancelled)`.
    pub fn run(&mut self, mut on_event: impl FnMut(&ProgramEvent)) -> Result<ProgramStatus, AcquisitionError> {
        loop {
            match self.step() {
                Ok(Some(event)) => on_event(&event),
                Ok(None) => return Ok(self.status),
                Err(e) if e.is_interrupted() => return Ok(self.status),
                Err(e) => return Err(e),
            }
        }
    }
}
