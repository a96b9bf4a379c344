//! Differential-pair synapse: instruction set, mux routing and the initialization procedure.
//!
//! A synapse is two memristors `A` and `B` joined at node `Y`. Four 2-bit analog switches route the
//! waveform outputs and the oscilloscope inputs to `A`, `B` or `Y`. Their states are packed, in the
//! order `W2, W1, 2+, 1+`, into one byte driven on the upper 8 digital I/O lines:
//!
//! | bits | route |
//! |------|-------|
//! | `00` | none  |
//! | `01` | A     |
//! | `10` | Y     |
//! | `11` | B     |
//!
//! The synapse state is `Vy = Vr * (Ga - Gb) / (Ga + Gb)`, the voltage at `Y` when the pair is driven
//! with `+Vr` and `-Vr`. [`SynapseController::initialize`] brings a fresh pair into a usable state in
//! three stages:
//!
//! 0. Hard reset: both devices are driven down a fixed number of times.
//! 1. Both devices are driven up until they reach the target conductance.
//! 2. Anti-Hebbian cycles are applied and the number of state flips is counted.
//!
//! The drive amplitude and pulse width are restored after initialization, whatever the outcome.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use memristor_backend::config::SynapseConfig;
use memristor_backend::error::ConfigError;
use memristor_backend::pulse::PulseSpec;

use crate::instrument::Instrument;
use crate::probe::Probe;
use crate::run_token::RunToken;
use crate::sequencer::AcquisitionError;

/// Digital I/O line of the least significant mux bit.
pub const MUX_SHIFT: u32 = 8;

/// Position of one analog switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MuxRoute {
    None = 0b00,
    A = 0b01,
    Y = 0b10,
    B = 0b11,
}

impl MuxRoute {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => MuxRoute::A,
            0b10 => MuxRoute::Y,
            0b11 => MuxRoute::B,
            _ => MuxRoute::None,
        }
    }
}

/// Positions of the four analog switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MuxState {
    pub w2: MuxRoute,
    pub w1: MuxRoute,
    pub scope2: MuxRoute,
    pub scope1: MuxRoute,
}

impl MuxState {
    /// W1 and scope 1+ on `route`, the rest open.
    pub fn routed(route: MuxRoute) -> Self {
        MuxState {
            w2: MuxRoute::None,
            w1: route,
            scope2: MuxRoute::None,
            scope1: route,
        }
    }

    pub fn byte(&self) -> u8 {
        (self.w2 as u8) << 6 | (self.w1 as u8) << 4 | (self.scope2 as u8) << 2 | self.scope1 as u8
    }

    /// Value for [`Instrument::set_digital_output_state`].
    pub fn digital_state(&self) -> u32 {
        (self.byte() as u32) << MUX_SHIFT
    }

    pub fn from_digital_state(bits: u32) -> Self {
        let byte = (bits >> MUX_SHIFT) as u8;
        MuxState {
            w2: MuxRoute::from_bits(byte >> 6),
            w1: MuxRoute::from_bits(byte >> 4),
            scope2: MuxRoute::from_bits(byte >> 2),
            scope1: MuxRoute::from_bits(byte),
        }
    }
}

/// Named synapse operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Instruction {
    /// Differential read of both devices (`FFLV`).
    Read,
    /// Forward pulse on `A` (`RHaup`).
    DriveAUp,
    /// Reverse pulse on `A` (`RLadn`).
    DriveADown,
    /// Forward pulse on `B` (`RLbup`).
    DriveBUp,
    /// Reverse pulse on `B` (`RHbdn`).
    DriveBDown,
    /// Pulse on `Y` against the last read state (`FF_RA`).
    AntiHebbian,
}

impl Instruction {
    pub const ALL: [Instruction; 6] = [
        Instruction::Read,
        Instruction::DriveAUp,
        Instruction::DriveADown,
        Instruction::DriveBUp,
        Instruction::DriveBDown,
        Instruction::AntiHebbian,
    ];

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Read => "FFLV",
            Instruction::DriveAUp => "RHaup",
            Instruction::DriveADown => "RLadn",
            Instruction::DriveBUp => "RLbup",
            Instruction::DriveBDown => "RHbdn",
            Instruction::AntiHebbian => "FF_RA",
        }
    }

    /// Route and polarity of a drive instruction; `None` for reads.
    fn drive(&self) -> Option<(MuxRoute, f64)> {
        match self {
            Instruction::Read => None,
            Instruction::DriveAUp => Some((MuxRoute::A, 1.0)),
            Instruction::DriveADown => Some((MuxRoute::A, -1.0)),
            Instruction::DriveBUp => Some((MuxRoute::B, 1.0)),
            Instruction::DriveBDown => Some((MuxRoute::B, -1.0)),
            Instruction::AntiHebbian => Some((MuxRoute::Y, 1.0)),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

impl FromStr for Instruction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Instruction::ALL
            .iter()
            .find(|i| i.mnemonic().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| {
                format!(
                    "Unknown instruction {}. Expected one of {:?}",
                    s,
                    Instruction::ALL.iter().map(|i| i.mnemonic()).collect::<Vec<_>>()
                )
            })
    }
}

/// Conductances (siemens) and state voltage after a read.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SynapseReading {
    pub ga: f64,
    pub gb: f64,
    pub vy: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    A,
    B,
}

/// Progress reported while [`SynapseController::initialize`] runs.
#[derive(Clone, Debug, PartialEq)]
pub enum SynapseEvent {
    ResetDone,
    DriveProgress { iteration: usize, reading: SynapseReading },
    DriveResult { passed: bool, failed: Vec<Device>, reading: SynapseReading },
    FlipResult { transitions: usize, quality: f64, passed: bool },
    Initialized { success: bool, reading: SynapseReading },
}

impl fmt::Display for SynapseEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SynapseEvent::ResetDone => write!(f, "Step 0 done: both devices reset"),
            SynapseEvent::DriveProgress { iteration, reading } => {
                write!(f, "  [{}] A={:.3e} S, B={:.3e} S", iteration, reading.ga, reading.gb)
            }
            SynapseEvent::DriveResult { passed: true, .. } => write!(f, "Step 1 passed"),
            SynapseEvent::DriveResult { failed, .. } => {
                write!(f, "Step 1 failed: {:?} could not reach the target conductance", failed)
            }
            SynapseEvent::FlipResult { passed: true, quality, .. } => {
                write!(f, "Step 2 passed, Q={:.3}", quality)
            }
            SynapseEvent::FlipResult { .. } => {
                write!(f, "Step 2 failed: state did not change under anti-Hebbian cycles")
            }
            SynapseEvent::Initialized { success, reading } => write!(
                f,
                "Synapse initialization {}: A={:.3e} S, B={:.3e} S",
                if *success { "succeeded" } else { "failed" },
                reading.ga,
                reading.gb
            ),
        }
    }
}

/// Final outcome of [`SynapseController::initialize`].
#[derive(Clone, Debug, PartialEq)]
pub struct InitReport {
    pub drive_passed: bool,
    pub transitions: usize,
    /// `transitions / (flip_iterations - 1)`.
    pub quality: f64,
    pub reading: SynapseReading,
}

impl InitReport {
    pub fn success(&self) -> bool {
        self.drive_passed && self.transitions > 0
    }
}

/// Runs synapse instructions against an exclusively owned instrument.
pub struct SynapseController<I: Instrument> {
    instrument: I,
    probe: Probe,
    config: SynapseConfig,
    token: RunToken,
    amplitude: f64,
    pulse_width_ns: f64,
    reading: SynapseReading,
}

impl<I: Instrument> SynapseController<I> {
    pub fn new(instrument: I, probe: Probe, config: SynapseConfig, token: RunToken) -> Self {
        SynapseController {
            instrument,
            probe,
            amplitude: config.amplitude,
            pulse_width_ns: config.pulse_width_ns,
            config,
            token,
            reading: SynapseReading {
                ga: f64::NAN,
                gb: f64::NAN,
                vy: f64::NAN,
            },
        }
    }

    pub fn reading(&self) -> SynapseReading {
        self.reading
    }
    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }
    pub fn pulse_width_ns(&self) -> f64 {
        self.pulse_width_ns
    }
    pub fn token(&self) -> &RunToken {
        &self.token
    }
    pub fn instrument(&self) -> &I {
        &self.instrument
    }
    pub fn into_instrument(self) -> I {
        self.instrument
    }

    /// Validates and sets the drive amplitude and pulse width used by subsequent instructions.
    pub fn set_drive(&mut self, amplitude: f64, pulse_width_ns: f64) -> Result<(), ConfigError> {
        PulseSpec::new(self.config.shape, amplitude, pulse_width_ns, 0.5)?;
        self.amplitude = amplitude;
        self.pulse_width_ns = pulse_width_ns;
        Ok(())
    }

    fn route(&mut self, route: MuxRoute) -> Result<(), AcquisitionError> {
        let state = MuxState::routed(route);
        log::trace!("Mux {:08b}", state.byte());
        self.instrument.set_digital_output_state(state.digital_state())?;
        Ok(())
    }

    pub fn execute(&mut self, instruction: Instruction) -> Result<(), AcquisitionError> {
        self.token.check()?;
        log::debug!("Executing {}", instruction);
        match instruction.drive() {
            None => {
                let read = PulseSpec::new(
                    self.config.shape,
                    self.config.read_amplitude,
                    self.pulse_width_ns,
                    0.5,
                )?;
                self.route(MuxRoute::A)?;
                let ga = self.probe.conductance(&mut self.instrument, &read, &self.token)?;
                self.route(MuxRoute::B)?;
                let gb = self.probe.conductance(&mut self.instrument, &read, &self.token)?;
                self.reading = SynapseReading {
                    ga,
                    gb,
                    vy: self.config.read_amplitude * (ga - gb) / (ga + gb),
                };
            }
            Some((route, polarity)) => {
                let polarity = match instruction {
                    // Against the last read state; positive when unknown
                    Instruction::AntiHebbian if self.reading.vy > 0.0 => -polarity,
                    _ => polarity,
                };
                let spec = PulseSpec::new(
                    self.config.shape,
                    polarity * self.amplitude,
                    self.pulse_width_ns,
                    0.5,
                )?;
                self.route(route)?;
                self.probe.write(&mut self.instrument, &spec, 1, &self.token)?;
            }
        }
        Ok(())
    }

    /// Executes `instruction` (if any), then reads both devices at the monitor pulse width.
    pub fn monitor_step(&mut self, instruction: Option<Instruction>) -> Result<SynapseReading, AcquisitionError> {
        if let Some(instruction) = instruction {
            self.execute(instruction)?;
        }
        let pulse_width_ns = self.pulse_width_ns;
        self.pulse_width_ns = self.config.monitor_pulse_width_ns;
        let result = self.execute(Instruction::Read);
        self.pulse_width_ns = pulse_width_ns;
        result.map(|_| self.reading)
    }

    /// Executes `instruction` once, then reads at every sample period until cancelled.
    pub fn monitor(
        &mut self,
        instruction: Option<Instruction>,
        mut on_reading: impl FnMut(SynapseReading),
    ) -> Result<(), AcquisitionError> {
        if let Some(instruction) = instruction {
            self.execute(instruction)?;
        }
        let period = Duration::from_secs_f64(self.config.sample_period_s);
        loop {
            self.token.sleep(period)?;
            on_reading(self.monitor_step(None)?);
        }
    }

    /// Runs the three-stage initialization, reporting progress through `on_event`.
    ///
    /// Stage failures are reported, not returned as errors. An `Err` means an acquisition failed
    /// or the run was cancelled. The drive settings are restored in every case.
    pub fn initialize(&mut self, mut on_event: impl FnMut(&SynapseEvent)) -> Result<InitReport, AcquisitionError> {
        let amplitude = self.amplitude;
        let pulse_width_ns = self.pulse_width_ns;
        self.amplitude = self.config.init_amplitude;
        self.pulse_width_ns = self.config.init_pulse_width_ns;

        let mut emit = |event: SynapseEvent| {
            log::info!("{}", event);
            on_event(&event);
        };
        let result = self.initialize_stages(&mut emit);

        self.amplitude = amplitude;
        self.pulse_width_ns = pulse_width_ns;
        result
    }

    fn initialize_stages(&mut self, emit: &mut impl FnMut(SynapseEvent)) -> Result<InitReport, AcquisitionError> {
        for _ in 0..self.config.reset_count {
            self.execute(Instruction::DriveADown)?;
            self.execute(Instruction::DriveBDown)?;
        }
        emit(SynapseEvent::ResetDone);

        let target = self.config.target_conductance;
        let below = |g: f64| g.is_nan() || g < target;
        let (mut a_good, mut b_good) = (false, false);
        for iteration in 0..self.config.drive_iterations {
            self.execute(Instruction::Read)?;
            let reading = self.reading;
            if below(reading.ga) {
                self.execute(Instruction::DriveAUp)?;
            } else {
                a_good = true;
            }
            if below(reading.gb) {
                self.execute(Instruction::DriveBUp)?;
            } else {
                b_good = true;
            }
            if a_good && b_good {
                break;
            }
            emit(SynapseEvent::DriveProgress { iteration, reading });
        }
        let failed: Vec<Device> = [(Device::A, a_good), (Device::B, b_good)]
            .iter()
            .filter(|(_, good)| !good)
            .map(|(device, _)| *device)
            .collect();
        let drive_passed = failed.is_empty();
        emit(SynapseEvent::DriveResult {
            passed: drive_passed,
            failed,
            reading: self.reading,
        });

        let mut transitions = 0;
        let mut last_state = true;
        for i in 0..self.config.flip_iterations {
            self.execute(Instruction::Read)?;
            let state = self.reading.vy > 0.0;
            if i > 0 && state != last_state {
                transitions += 1;
            }
            last_state = state;
            self.execute(Instruction::AntiHebbian)?;
        }
        let quality = transitions as f64 / self.config.flip_iterations.saturating_sub(1).max(1) as f64;
        emit(SynapseEvent::FlipResult {
            transitions,
            quality,
            passed: transitions > 0,
        });

        let report = InitReport {
            drive_passed,
            transitions,
            quality,
            reading: self.reading,
        };
        emit(SynapseEvent::Initialized {
            success: report.success(),
            reading: report.reading,
        });
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimConfig, SimulatedInstrument};
    use memristor_backend::config::AcquisitionConfig;
    use memristor_backend::postprocess::Units;
    use memristor_backend::resistance::BoardConfig;

    fn controller(sim: SimConfig) -> SynapseController<SimulatedInstrument> {
        let probe = Probe::new(BoardConfig::default(), AcquisitionConfig::default(), Units::default()).unwrap();
        SynapseController::new(
            SimulatedInstrument::new(sim),
            probe,
            SynapseConfig::default(),
            RunToken::new(),
        )
    }

    mod mux {
        use super::*;

        #[test]
        fn packs_switches_in_order() {
            let state = MuxState {
                w2: MuxRoute::B,
                w1: MuxRoute::A,
                scope2: MuxRoute::Y,
                scope1: MuxRoute::None,
            };
            assert_eq!(state.byte(), 0b11_01_10_00);
            assert_eq!(state.digital_state(), 0b11_01_10_00 << 8);
            assert_eq!(MuxState::from_digital_state(state.digital_state()), state);
        }

        #[test]
        fn mnemonics() {
            assert_eq!("ff_ra".parse::<Instruction>().unwrap(), Instruction::AntiHebbian);
            assert_eq!(Instruction::Read.to_string(), "FFLV");
            assert!("XYZ".parse::<Instruction>().is_err());
        }
    }

    mod execute {
        use super::*;

        #[test]
        fn read_both_devices() {
            let mut sim = SimConfig::default();
            sim.device_a.resistance = 4_000.0;
            sim.device_b.resistance = 8_000.0;
            let mut c = controller(sim);
            c.execute(Instruction::Read).unwrap();
            let r = c.reading();
            approx::assert_relative_eq!(r.ga, 2.5e-4, max_relative = 1e-2);
            approx::assert_relative_eq!(r.gb, 1.25e-4, max_relative = 1e-2);
            assert!(r.vy > 0.0);
        }

        #[test]
        fn drives_selected_device() {
            let mut c = controller(SimConfig::default());
            c.set_drive(1.5, 100_000.0).unwrap();
            c.execute(Instruction::DriveBUp).unwrap();
            let a = c.instrument().device(MuxRoute::A).unwrap().resistance;
            let b = c.instrument().device(MuxRoute::B).unwrap().resistance;
            assert_eq!(a, 20_000.0);
            assert!(b < 20_000.0);
            assert_eq!(
                MuxState::from_digital_state(c.instrument().digital_state()).w1,
                MuxRoute::B
            );
        }

        #[test]
        fn monitor_restores_pulse_width() {
            let mut c = controller(SimConfig::default());
            let reading = c.monitor_step(Some(Instruction::DriveAUp)).unwrap();
            assert!(reading.ga.is_finite() && reading.gb.is_finite());
            assert_eq!(c.pulse_width_ns(), SynapseConfig::default().pulse_width_ns);
        }
    }

    mod initialize {
        use super::*;

        #[test]
        fn all_stages_pass() {
            let mut c = controller(SimConfig::default());
            let mut events = Vec::new();
            let report = c.initialize(|e| events.push(e.clone())).unwrap();
            assert!(report.drive_passed);
            assert!(report.transitions > 0);
            assert!(report.success());
            assert_eq!(events.first(), Some(&SynapseEvent::ResetDone));
            assert!(matches!(events.last(), Some(SynapseEvent::Initialized { success: true, .. })));
            // Drive settings restored
            assert_eq!(c.amplitude(), 1.0);
            assert_eq!(c.pulse_width_ns(), 10_000.0);
        }

        #[test]
        /// Devices that cannot reach the target fail step 1 but the procedure still completes
        fn unreachable_target_fails_drive() {
            let mut sim = SimConfig::default();
            sim.device_a.r_on = 50_000.0;
            let mut c = controller(sim);
            let report = c.initialize(|_| {}).unwrap();
            assert!(!report.drive_passed);
            assert!(!report.success());
            assert_eq!(c.amplitude(), 1.0);
        }

        #[test]
        fn cancelled_run_restores_settings() {
            let mut c = controller(SimConfig::default());
            c.token().cancel();
            assert!(c.initialize(|_| {}).unwrap_err().is_interrupted());
            assert_eq!(c.pulse_width_ns(), 10_000.0);
        }
    }
}
