//! Read and write cycles shared by the programming and synapse controllers.
//!
//! A [`Probe`] owns the board description, the resistance model built from it and the sequencer.
//! It turns a requested pulse into a [`CycleRequest`] with the right buffer geometry and trigger,
//! and turns the captured trace into a measurement.
//!
//! Reads and writes trigger on the start of the waveform generator. A [`Probe::sweep`] triggers on
//! the level of the driven channel instead, so the capture starts with the first sample that
//! carries the drive.

use ndarray::Array1;

use memristor_backend::config::AcquisitionConfig;
use memristor_backend::error::ConfigError;
use memristor_backend::postprocess::*;
use memristor_backend::pulse::{self, PulseShape, PulseSpec};
use memristor_backend::resistance::{
    BoardConfig, BoardVersion, RcResistanceComputer, READ_SAMPLES_PER_PERIOD,
};
use memristor_backend::trace::{CaptureTrace, DerivedTrace};

use crate::instrument::{
    CaptureConfig, Instrument, ScopeChannel, TriggerSpec, WaveformChannel, LOW_INPUT_RANGE,
};
use crate::run_token::RunToken;
use crate::sequencer::{AcquisitionError, AcquisitionSequencer, CycleRequest};

/// Outcome of one read cycle.
///
/// A NaN `resistance` marks an invalid measurement that must not drive any decision.
#[derive(Clone, Debug)]
pub struct ReadMeasurement {
    /// Display units.
    pub time: Array1<f64>,
    pub v1: Array1<f64>,
    pub v2: Array1<f64>,
    pub device_voltage: Array1<f64>,
    /// Sensed voltage just before the falling edge, in volts.
    pub read_voltage: f64,
    /// Ohms.
    pub resistance: f64,
}

impl ReadMeasurement {
    pub fn is_valid(&self) -> bool {
        self.resistance.is_finite() && self.resistance > 0.0
    }

    /// Siemens, NaN for an invalid measurement.
    pub fn conductance(&self) -> f64 {
        if self.is_valid() {
            1.0 / self.resistance
        } else {
            f64::NAN
        }
    }
}

/// Outcome of one write or sweep cycle.
#[derive(Clone, Debug)]
pub struct WriteCapture {
    /// The pulse as requested, before any board inversion.
    pub spec: PulseSpec,
    pub pulse_count: usize,
    pub trace: DerivedTrace,
}

pub struct Probe {
    board: BoardConfig,
    computer: RcResistanceComputer,
    acquisition: AcquisitionConfig,
    units: Units,
    sequencer: AcquisitionSequencer,
}

impl Probe {
    pub fn new(board: BoardConfig, acquisition: AcquisitionConfig, units: Units) -> Result<Self, ConfigError> {
        board.validate()?;
        let computer = board.resistance_computer()?;
        let sequencer = AcquisitionSequencer::new(
            acquisition.arm_retry_ceiling,
            acquisition.capture_retry_ceiling,
        );
        Ok(Probe {
            board,
            computer,
            acquisition,
            units,
            sequencer,
        })
    }

    pub fn board(&self) -> &BoardConfig {
        &self.board
    }
    pub fn units(&self) -> &Units {
        &self.units
    }
    pub fn resistance_computer(&self) -> &RcResistanceComputer {
        &self.computer
    }

    /// Replaces the series resistance and rebuilds the resistance model.
    ///
    /// On error the previous board and model are kept.
    pub fn set_series_resistance(&mut self, series_resistance: f64) -> Result<(), ConfigError> {
        let board = BoardConfig {
            series_resistance,
            ..self.board.clone()
        };
        board.validate()?;
        self.computer = board.resistance_computer()?;
        self.board = board;
        log::info!("Series resistance set to {} ohm", series_resistance);
        Ok(())
    }

    /// Plays one low-amplitude square read pulse and converts the sensed voltage to resistance.
    pub fn read<I: Instrument + ?Sized>(
        &mut self,
        instrument: &mut I,
        token: &RunToken,
    ) -> Result<ReadMeasurement, AcquisitionError> {
        let frequency = self.board.read_frequency();
        let sample_frequency = frequency * READ_SAMPLES_PER_PERIOD as f64;
        let samples = pulse::sample_buffer(
            PulseShape::Square,
            self.board.read_pulse_amplitude,
            frequency,
            self.acquisition.custom_buffer_size,
        )?
        .to_vec();

        let request = CycleRequest {
            capture: CaptureConfig {
                trigger: TriggerSpec::WaveformStart(WaveformChannel::W1),
                sample_frequency,
                buffer_size: READ_SAMPLES_PER_PERIOD,
                input_range: LOW_INPUT_RANGE,
            },
            channel: WaveformChannel::W1,
            frequency,
            pulse_count: 1,
            samples: &samples,
        };
        let capture = self.sequencer.run_cycle(instrument, &request, token)?;

        let board = self.board.board_version;
        let (v1, v2) = trim_idle_data(
            capture.channel1.view(),
            capture.channel2.view(),
            READ_TRIM_THRESHOLD,
            TRIM_MARGIN,
        );
        let read_voltage = read_voltage(board, v1.view(), v2.view());
        let resistance = self.computer.resistance_from_voltage(read_voltage);
        if !resistance.is_finite() {
            log::warn!("Invalid read: {} V does not map to a resistance", read_voltage);
        }
        Ok(ReadMeasurement {
            time: time_axis(v1.len(), sample_frequency, self.units.time_divisor),
            device_voltage: device_voltage(board, v1.view(), v2.view()),
            v1,
            v2,
            read_voltage,
            resistance,
        })
    }

    /// Plays `pulse_count` pulses of `spec` and derives the full trace of the capture.
    ///
    /// `spec` carries the requested polarity; board 2 inverts it before synthesis.
    pub fn write<I: Instrument + ?Sized>(
        &mut self,
        instrument: &mut I,
        spec: &PulseSpec,
        pulse_count: usize,
        token: &RunToken,
    ) -> Result<WriteCapture, AcquisitionError> {
        self.write_with_units(instrument, spec, pulse_count, token, self.units)
    }

    /// Median conductance in siemens seen by a single pulse of `spec`, over the samples where the
    /// drive stays above half its peak. NaN when nothing was captured.
    pub fn conductance<I: Instrument + ?Sized>(
        &mut self,
        instrument: &mut I,
        spec: &PulseSpec,
        token: &RunToken,
    ) -> Result<f64, AcquisitionError> {
        let capture = self.write_with_units(instrument, spec, 1, token, Units::si())?;
        Ok(plateau_median(&capture.trace, self.board.board_version))
    }

    /// Plays `pulse_count` pulses of `spec` behind a level trigger and derives the I-V and G-V
    /// series of the capture.
    ///
    /// The capture starts once the driven channel reaches
    /// [`LEVEL_TRIGGER_VOLTS`](crate::instrument::LEVEL_TRIGGER_VOLTS) with the polarity of the
    /// drive. A drive that never reaches it ends in a capture timeout.
    pub fn sweep<I: Instrument + ?Sized>(
        &mut self,
        instrument: &mut I,
        spec: &PulseSpec,
        pulse_count: usize,
        token: &RunToken,
    ) -> Result<WriteCapture, AcquisitionError> {
        let board = self.board.board_version;
        let trigger_channel = match board {
            BoardVersion::V1 => ScopeChannel::Ch1,
            BoardVersion::V2 => ScopeChannel::Ch2,
        };
        let trigger = TriggerSpec::level_for_amplitude(trigger_channel, self.driven(spec).amplitude());
        let capture = self.play_train(instrument, spec, pulse_count, trigger, token)?;
        let trace = derive_sweep_trace(&capture, board, self.board.series_resistance, &self.units);
        log::debug!(
            "Sweep of {}: {} samples, peak conductance {:e}",
            spec,
            trace.len(),
            trace.peak_conductance()
        );
        Ok(WriteCapture {
            spec: *spec,
            pulse_count,
            trace,
        })
    }

    fn driven(&self, spec: &PulseSpec) -> PulseSpec {
        match self.board.board_version {
            BoardVersion::V1 => *spec,
            BoardVersion::V2 => spec.inverted(),
        }
    }

    fn play_train<I: Instrument + ?Sized>(
        &mut self,
        instrument: &mut I,
        spec: &PulseSpec,
        pulse_count: usize,
        trigger: TriggerSpec,
        token: &RunToken,
    ) -> Result<CaptureTrace, AcquisitionError> {
        let samples_per_pulse = self.acquisition.write_samples_per_pulse;
        let samples = self
            .driven(spec)
            .sample_buffer(self.acquisition.custom_buffer_size)?
            .to_vec();

        let request = CycleRequest {
            capture: CaptureConfig {
                trigger,
                sample_frequency: spec.frequency() * samples_per_pulse as f64,
                buffer_size: samples_per_pulse * pulse_count + samples_per_pulse,
                input_range: CaptureConfig::input_range_for(spec.amplitude()),
            },
            channel: WaveformChannel::W1,
            frequency: spec.frequency(),
            pulse_count,
            samples: &samples,
        };
        self.sequencer.run_cycle(instrument, &request, token)
    }

    fn write_with_units<I: Instrument + ?Sized>(
        &mut self,
        instrument: &mut I,
        spec: &PulseSpec,
        pulse_count: usize,
        token: &RunToken,
        units: Units,
    ) -> Result<WriteCapture, AcquisitionError> {
        let trigger = TriggerSpec::WaveformStart(WaveformChannel::W1);
        let capture = self.play_train(instrument, spec, pulse_count, trigger, token)?;
        let trace = derive_trace(
            &capture,
            self.board.board_version,
            self.board.series_resistance,
            &units,
        );
        if trace.is_empty() {
            log::warn!("Write capture of {} contained no activity", spec);
        }
        Ok(WriteCapture {
            spec: *spec,
            pulse_count,
            trace,
        })
    }

    /// Applied current and energy of a write train on a device of `resistance` ohms.
    pub fn applied_energy(&self, write: &PulseSpec, pulse_count: usize, resistance: f64) -> AppliedEnergy {
        applied_energy(
            write.amplitude(),
            resistance,
            self.board.series_resistance,
            pulse_count,
            write.pulse_width_ns(),
            self.units.current_divisor,
        )
    }
}

// Median conductance while the driven channel is above half its peak
fn plateau_median(trace: &DerivedTrace, board: BoardVersion) -> f64 {
    let driven = match board {
        BoardVersion::V1 => &trace.v1,
        BoardVersion::V2 => &trace.v2,
    };
    let peak = driven.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if peak == 0.0 {
        return f64::NAN;
    }
    let mut plateau: Vec<f64> = driven
        .iter()
        .zip(trace.conductance.iter())
        .filter(|(v, _)| v.abs() >= 0.5 * peak)
        .map(|(_, g)| *g)
        .collect();
    if plateau.is_empty() {
        return f64::NAN;
    }
    plateau.sort_by(|a, b| a.total_cmp(b));
    plateau[plateau.len() / 2]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimConfig, SimulatedInstrument};
    use approx::assert_relative_eq;

    fn probe(board: BoardConfig) -> Probe {
        Probe::new(board, AcquisitionConfig::default(), Units::default()).unwrap()
    }

    mod read {
        use super::*;

        #[test]
        fn recovers_resistance() {
            for version in [BoardVersion::V1, BoardVersion::V2] {
                let board = BoardConfig::for_version(version);
                let mut sim = SimulatedInstrument::new(
                    SimConfig::from_board(&board).with_initial_resistance(12_345.0),
                );
                let read = probe(board).read(&mut sim, &RunToken::new()).unwrap();
                assert!(read.is_valid());
                assert_relative_eq!(read.resistance, 12_345.0, max_relative = 1e-3);
                assert_relative_eq!(read.conductance(), 1.0 / 12_345.0, max_relative = 1e-3);
                assert_eq!(sim.resistance(), 12_345.0);
            }
        }

        #[test]
        fn series_resistance_rebuilds_model() {
            let board = BoardConfig::default();
            let mut p = probe(board.clone());
            let v = p.resistance_computer().voltage_for_resistance(10_000.0);
            p.set_series_resistance(2_000.0).unwrap();
            assert_eq!(p.resistance_computer().series_resistance(), 2_000.0);
            assert!((p.resistance_computer().resistance_from_voltage(v) - 10_000.0).abs() > 100.0);
            assert!(p.set_series_resistance(-1.0).is_err());
            assert_eq!(p.board().series_resistance, 2_000.0);
        }
    }

    mod write {
        use super::*;

        #[test]
        fn derived_trace_of_forward_write() {
            let board = BoardConfig::default();
            let mut sim = SimulatedInstrument::new(SimConfig::from_board(&board));
            let spec = PulseSpec::new(PulseShape::Square, 1.0, 10_000.0, 0.5).unwrap();
            let write = probe(board).write(&mut sim, &spec, 2, &RunToken::new()).unwrap();
            assert!(!write.trace.is_empty());
            assert!(write.trace.conductance.iter().all(|g| *g >= 0.0));
            assert!(sim.resistance() < 20_000.0);
        }

        #[test]
        fn conductance_probe() {
            let board = BoardConfig::default();
            let mut sim = SimulatedInstrument::new(
                SimConfig::from_board(&board).with_initial_resistance(4_000.0),
            );
            let spec = PulseSpec::new(PulseShape::Square, 0.1, 100_000.0, 0.5).unwrap();
            let g = probe(board).conductance(&mut sim, &spec, &RunToken::new()).unwrap();
            assert_relative_eq!(g, 1.0 / 4_000.0, max_relative = 1e-3);
        }

        #[test]
        fn sweep_is_level_triggered() {
            for version in [BoardVersion::V1, BoardVersion::V2] {
                let board = BoardConfig::for_version(version);
                let mut sim = SimulatedInstrument::new(
                    SimConfig::from_board(&board).with_initial_resistance(4_000.0),
                );
                let spec = PulseSpec::new(PulseShape::Square, 0.2, 100_000.0, 0.5).unwrap();
                let sweep = probe(board).sweep(&mut sim, &spec, 1, &RunToken::new()).unwrap();

                let expected = match version {
                    BoardVersion::V1 => TriggerSpec::Level {
                        channel: ScopeChannel::Ch1,
                        level: 0.02,
                    },
                    BoardVersion::V2 => TriggerSpec::Level {
                        channel: ScopeChannel::Ch2,
                        level: -0.02,
                    },
                };
                assert_eq!(sim.last_trigger(), Some(expected));
                assert!(!sweep.trace.is_empty());
                // Microsiemens
                assert_relative_eq!(plateau_median(&sweep.trace, version), 250.0, max_relative = 1e-3);
                assert!(sweep.trace.device_voltage.iter().any(|v| *v > 0.08));
                assert_eq!(sim.resistance(), 4_000.0);
            }
        }

        #[test]
        fn sweep_below_trigger_level_times_out() {
            let board = BoardConfig::default();
            let mut sim = SimulatedInstrument::new(SimConfig::from_board(&board));
            let acquisition = AcquisitionConfig {
                capture_retry_ceiling: 3,
                ..AcquisitionConfig::default()
            };
            let mut p = Probe::new(board, acquisition, Units::default()).unwrap();
            let spec = PulseSpec::new(PulseShape::Square, 0.01, 1_000.0, 0.5).unwrap();
            let result = p.sweep(&mut sim, &spec, 1, &RunToken::new());
            assert!(matches!(result, Err(AcquisitionError::CaptureTimeout { polls: 3 })));
            assert_eq!(sim.stop_capture_calls(), 1);
        }

        #[test]
        fn energy_uses_series_and_switch_resistance() {
            let p = probe(BoardConfig::default());
            let spec = PulseSpec::new(PulseShape::Square, 1.0, 1_000.0, 0.5).unwrap();
            let applied = p.applied_energy(&spec, 10, 4_900.0);
            assert_relative_eq!(applied.current, 100.0, max_relative = 1e-12);
            assert_relative_eq!(applied.energy, 1e-9, max_relative = 1e-12);
        }
    }
}
