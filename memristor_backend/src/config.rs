//! Session configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) describes a usable session:
//!
//! ```
//! use memristor_backend::config::SessionConfig;
//!
//! let config = SessionConfig::from_toml_str("").unwrap();
//! assert_eq!(config.program.target_resistance, 10_000.0);
//!
//! let config = SessionConfig::from_toml_str(
//!     r#"
//!     [board]
//!     board_version = 2
//!     series_resistance = 2000.0
//!
//!     [program]
//!     mode = "OneShot"
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.board.series_resistance, 2000.0);
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{positive, ConfigError, Result};
use crate::postprocess::Units;
use crate::pulse::{PulseShape, PulseSpec, DEFAULT_BUFFER_SIZE};
use crate::resistance::BoardConfig;

/// How the programming loop reacts to a measured resistance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgramMode {
    /// Read at the sample period forever, never write.
    ReadOnly,
    /// One read, plus one write if outside the band, then stop.
    OneShot,
    /// Read and write until the resistance lands inside the band.
    Continuous,
}

impl fmt::Display for ProgramMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ProgramMode::ReadOnly => "read-only",
                ProgramMode::OneShot => "one-shot",
                ProgramMode::Continuous => "continuous",
            }
        )
    }
}

/// One write pulse train. The amplitude is the requested polarity, before any board inversion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteSettings {
    pub amplitude: f64,
    pub pulse_width_ns: f64,
    pub duty_cycle: f64,
    pub pulse_count: usize,
}

impl WriteSettings {
    pub fn pulse_spec(&self, shape: PulseShape) -> Result<PulseSpec> {
        if self.pulse_count == 0 {
            return Err(ConfigError::PulseCount);
        }
        PulseSpec::new(shape, self.amplitude, self.pulse_width_ns, self.duty_cycle)
    }
}

fn default_forward() -> WriteSettings {
    WriteSettings {
        amplitude: 1.0,
        pulse_width_ns: 10_000.0,
        duty_cycle: 0.5,
        pulse_count: 1,
    }
}

fn default_reverse() -> WriteSettings {
    WriteSettings {
        amplitude: -1.5,
        pulse_width_ns: 10_000.0,
        duty_cycle: 0.5,
        pulse_count: 1,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    pub shape: PulseShape,
    /// Ohms.
    pub target_resistance: f64,
    pub mode: ProgramMode,
    /// Pause before every read, in seconds.
    pub sample_period_s: f64,
    /// Lowers the resistance.
    pub forward: WriteSettings,
    /// Raises the resistance.
    pub reverse: WriteSettings,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        ProgramConfig {
            shape: PulseShape::Square,
            target_resistance: 10_000.0,
            mode: ProgramMode::Continuous,
            sample_period_s: 1.0,
            forward: default_forward(),
            reverse: default_reverse(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynapseConfig {
    pub shape: PulseShape,
    /// Drive amplitude of the up/down and anti-Hebbian instructions, in volts.
    pub amplitude: f64,
    pub pulse_width_ns: f64,
    /// Probe amplitude of a differential read, in volts.
    pub read_amplitude: f64,
    /// Pause between monitor reads, in seconds.
    pub sample_period_s: f64,
    /// Conductance both devices must reach during initialization, in siemens.
    pub target_conductance: f64,
    pub init_amplitude: f64,
    pub init_pulse_width_ns: f64,
    /// Pulse width forced for monitor reads.
    pub monitor_pulse_width_ns: f64,
    pub reset_count: usize,
    pub drive_iterations: usize,
    pub flip_iterations: usize,
}

impl Default for SynapseConfig {
    fn default() -> Self {
        SynapseConfig {
            shape: PulseShape::Square,
            amplitude: 1.0,
            pulse_width_ns: 10_000.0,
            read_amplitude: 0.1,
            sample_period_s: 1.0,
            target_conductance: 2e-4,
            init_amplitude: 1.5,
            init_pulse_width_ns: 500_000.0,
            monitor_pulse_width_ns: 100_000.0,
            reset_count: 10,
            drive_iterations: 100,
            flip_iterations: 8,
        }
    }
}

/// Polling limits and buffer geometry of acquisition cycles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Status polls before an arm attempt is abandoned.
    pub arm_retry_ceiling: usize,
    /// Status polls before a capture is abandoned.
    pub capture_retry_ceiling: usize,
    pub write_samples_per_pulse: usize,
    /// Length of the custom waveform uploaded for write pulses.
    pub custom_buffer_size: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        AcquisitionConfig {
            arm_retry_ceiling: 100_000,
            capture_retry_ceiling: 1000,
            write_samples_per_pulse: 200,
            custom_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub board: BoardConfig,
    pub program: ProgramConfig,
    pub synapse: SynapseConfig,
    pub acquisition: AcquisitionConfig,
    pub units: Units,
}

impl SessionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading session config from {}", path.display());
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Runs the same checks pulse and resistance-model construction would.
    pub fn validate(&self) -> Result<()> {
        self.board.validate()?;

        let program = &self.program;
        positive("target_resistance", program.target_resistance)?;
        non_negative("program.sample_period_s", program.sample_period_s)?;
        program.forward.pulse_spec(program.shape)?;
        program.reverse.pulse_spec(program.shape)?;

        let synapse = &self.synapse;
        PulseSpec::new(synapse.shape, synapse.amplitude, synapse.pulse_width_ns, 0.5)?;
        PulseSpec::new(synapse.shape, synapse.init_amplitude, synapse.init_pulse_width_ns, 0.5)?;
        PulseSpec::new(PulseShape::Square, synapse.read_amplitude, synapse.monitor_pulse_width_ns, 0.5)?;
        positive("synapse.target_conductance", synapse.target_conductance)?;
        non_negative("synapse.sample_period_s", synapse.sample_period_s)?;

        let acquisition = &self.acquisition;
        for (name, value) in [
            ("arm_retry_ceiling", acquisition.arm_retry_ceiling),
            ("capture_retry_ceiling", acquisition.capture_retry_ceiling),
            ("write_samples_per_pulse", acquisition.write_samples_per_pulse),
            ("custom_buffer_size", acquisition.custom_buffer_size),
        ] {
            positive(name, value as f64)?;
        }

        positive("time_divisor", self.units.time_divisor)?;
        positive("current_divisor", self.units.current_divisor)?;
        positive("conductance_divisor", self.units.conductance_divisor)?;
        Ok(())
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<f64> {
    if value >= 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(ConfigError::NonPositive { name, value })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resistance::BoardVersion;
    use std::io::Write;

    #[test]
    fn empty_is_default() {
        let config = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.acquisition.capture_retry_ceiling, 1000);
        assert_eq!(config.synapse.target_conductance, 2e-4);
    }

    #[test]
    fn partial_sections() {
        let config = SessionConfig::from_toml_str(
            r#"
            [board]
            board_version = 2

            [program]
            shape = "SquareSmooth"
            target_resistance = 20000.0

            [program.forward]
            amplitude = 0.8
            pulse_width_ns = 5000.0
            duty_cycle = 0.25
            pulse_count = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.board.board_version, BoardVersion::V2);
        assert_eq!(config.program.shape, PulseShape::SquareSmooth);
        assert_eq!(config.program.forward.pulse_count, 3);
        assert_eq!(config.program.reverse, default_reverse());
    }

    #[test]
    fn read_polarity_follows_board_version() {
        let config = SessionConfig::from_toml_str("[board]\nboard_version = 2\n").unwrap();
        assert_eq!(config.board, BoardConfig::for_version(BoardVersion::V2));
        assert_eq!(config.board.read_pulse_amplitude, -0.1);

        let config = SessionConfig::from_toml_str("[board]\nseries_resistance = 10000.0\n").unwrap();
        assert_eq!(config.board.read_pulse_amplitude, 0.1);

        // An explicit amplitude is kept as written
        let config =
            SessionConfig::from_toml_str("[board]\nboard_version = 2\nread_pulse_amplitude = 0.2\n").unwrap();
        assert_eq!(config.board.read_pulse_amplitude, 0.2);

        let saved = SessionConfig::from_toml_str(&config.to_toml_string().unwrap()).unwrap();
        assert_eq!(saved.board, config.board);
    }

    #[test]
    fn rejects_invalid() {
        assert!(matches!(
            SessionConfig::from_toml_str("[board]\nboard_version = 3\n"),
            Err(ConfigError::TomlDe(_))
        ));
        assert!(matches!(
            SessionConfig::from_toml_str("[board]\nseries_resistance = 0.0\n"),
            Err(ConfigError::NonPositive { .. })
        ));
        assert!(matches!(
            SessionConfig::from_toml_str(
                "[program.forward]\namplitude = 1.0\npulse_width_ns = 1000.0\nduty_cycle = 2.0\npulse_count = 1\n"
            ),
            Err(ConfigError::DutyCycle(_))
        ));
        assert!(matches!(
            SessionConfig::from_toml_str("[acquisition]\ncapture_retry_ceiling = 0\n"),
            Err(ConfigError::NonPositive { .. })
        ));
    }

    #[test]
    fn toml_round_trip_through_file() {
        let mut config = SessionConfig::default();
        config.program.mode = ProgramMode::OneShot;
        config.units = Units::si();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes()).unwrap();
        let loaded = SessionConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
