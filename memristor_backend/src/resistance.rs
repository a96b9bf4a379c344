//! Converts the voltage sensed during a read pulse into device resistance.
//!
//! The read pulse drives a divider made of the device and the series resistor. The oscilloscope
//! input on the sensed node adds a parasitic capacitance to ground, so the sensed voltage charges
//! with time constant `tau = (R || Rs) * C` toward the divider value:
//!
//! - board 1 (device on the driven side, `Rs` to ground, sensed on channel 2):
//!   `v = A * Rs / (R + Rs) * (1 - exp(-t / tau))`
//! - board 2 (`Rs` on the driven side, device to ground, sensed on channel 1):
//!   `v = A * R / (R + Rs) * (1 - exp(-t / tau))`
//!
//! `t` is the sampling instant used by the read cycle: five samples (at 300 samples per read
//! period) before the falling edge of the pulse. The equation has no closed-form inverse in `R`, so
//! [`RcResistanceComputer`] tabulates it over a log-spaced resistance grid once and inverts by
//! bisection plus interpolation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{positive, ConfigError, Result};

/// Smallest resistance the lookup table covers, in ohms.
pub const MIN_RESISTANCE: f64 = 10.0;
/// Largest resistance the lookup table covers, in ohms.
pub const MAX_RESISTANCE: f64 = 1e8;
const TABLE_SIZE: usize = 2000;

/// Samples taken per read period by the read cycle.
pub const READ_SAMPLES_PER_PERIOD: usize = 300;
/// Samples between the read voltage and the detected falling edge.
pub const READ_EDGE_OFFSET: usize = 5;

/// Hardware revision of the measurement board. Fixes the circuit topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BoardVersion {
    V1,
    V2,
}

impl BoardVersion {
    /// Amplitude actually synthesized for a requested write amplitude; board 2 is wired inverted.
    pub fn drive_amplitude(&self, amplitude: f64) -> f64 {
        match self {
            BoardVersion::V1 => amplitude,
            BoardVersion::V2 => -amplitude,
        }
    }
}

impl TryFrom<u8> for BoardVersion {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(BoardVersion::V1),
            2 => Ok(BoardVersion::V2),
            other => Err(ConfigError::BoardVersion(other)),
        }
    }
}

impl From<BoardVersion> for u8 {
    fn from(value: BoardVersion) -> Self {
        match value {
            BoardVersion::V1 => 1,
            BoardVersion::V2 => 2,
        }
    }
}

impl fmt::Display for BoardVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", u8::from(*self))
    }
}

/// Magnitude of the read probe when none is configured, in volts.
pub const DEFAULT_READ_PULSE_AMPLITUDE: f64 = 0.1;

/// Session-wide description of the measurement board and its read probe.
///
/// `read_pulse_amplitude` is stored with the polarity actually synthesized, so board 2 carries a
/// negative default. A session file that omits it gets the default for its board version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "BoardConfigFile")]
pub struct BoardConfig {
    pub board_version: BoardVersion,
    /// Ohms.
    pub series_resistance: f64,
    /// Farads.
    pub parasitic_read_capacitance: f64,
    /// Volts.
    pub read_pulse_amplitude: f64,
    /// Seconds.
    pub read_pulse_width: f64,
}

impl BoardConfig {
    pub fn for_version(board_version: BoardVersion) -> Self {
        BoardConfig {
            board_version,
            read_pulse_amplitude: board_version.drive_amplitude(DEFAULT_READ_PULSE_AMPLITUDE),
            ..BoardConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        positive("series_resistance", self.series_resistance)?;
        positive("parasitic_read_capacitance", self.parasitic_read_capacitance)?;
        positive("read_pulse_width", self.read_pulse_width)?;
        if !self.read_pulse_amplitude.is_finite() || self.read_pulse_amplitude == 0.0 {
            return Err(ConfigError::NonPositive {
                name: "|read_pulse_amplitude|",
                value: self.read_pulse_amplitude.abs(),
            });
        }
        Ok(())
    }

    /// Frequency of the 50% duty-cycle read probe, `1 / (2 * read_pulse_width)`.
    pub fn read_frequency(&self) -> f64 {
        1.0 / (2.0 * self.read_pulse_width)
    }

    /// Builds the resistance model for the current settings.
    pub fn resistance_computer(&self) -> Result<RcResistanceComputer> {
        RcResistanceComputer::new(
            self.board_version,
            self.read_pulse_amplitude,
            self.read_pulse_width,
            self.series_resistance,
            self.parasitic_read_capacitance,
        )
    }
}

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig {
            board_version: BoardVersion::V1,
            series_resistance: 5000.0,
            parasitic_read_capacitance: 140e-12,
            read_pulse_amplitude: DEFAULT_READ_PULSE_AMPLITUDE,
            read_pulse_width: 25e-6,
        }
    }
}

/// [`BoardConfig`] as written in a session file, before the read polarity is resolved.
#[derive(Deserialize)]
#[serde(default)]
struct BoardConfigFile {
    board_version: BoardVersion,
    series_resistance: f64,
    parasitic_read_capacitance: f64,
    read_pulse_amplitude: Option<f64>,
    read_pulse_width: f64,
}

impl Default for BoardConfigFile {
    fn default() -> Self {
        let board = BoardConfig::default();
        BoardConfigFile {
            board_version: board.board_version,
            series_resistance: board.series_resistance,
            parasitic_read_capacitance: board.parasitic_read_capacitance,
            read_pulse_amplitude: None,
            read_pulse_width: board.read_pulse_width,
        }
    }
}

impl From<BoardConfigFile> for BoardConfig {
    fn from(file: BoardConfigFile) -> Self {
        BoardConfig {
            board_version: file.board_version,
            series_resistance: file.series_resistance,
            parasitic_read_capacitance: file.parasitic_read_capacitance,
            read_pulse_amplitude: file
                .read_pulse_amplitude
                .unwrap_or_else(|| file.board_version.drive_amplitude(DEFAULT_READ_PULSE_AMPLITUDE)),
            read_pulse_width: file.read_pulse_width,
        }
    }
}

/// Read-voltage to resistance model of one board configuration.
///
/// Immutable: a change of series resistance means building a new computer.
#[derive(Clone, Debug)]
pub struct RcResistanceComputer {
    board_version: BoardVersion,
    read_pulse_amplitude: f64,
    read_pulse_width: f64,
    series_resistance: f64,
    parasitic_capacitance: f64,
    sample_time: f64,
    // (normalized voltage, ln resistance), sorted by ascending voltage
    table: Vec<(f64, f64)>,
}

impl RcResistanceComputer {
    pub fn new(
        board_version: BoardVersion,
        read_pulse_amplitude: f64,
        read_pulse_width: f64,
        series_resistance: f64,
        parasitic_capacitance: f64,
    ) -> Result<Self> {
        positive("read_pulse_width", read_pulse_width)?;
        positive("series_resistance", series_resistance)?;
        positive("parasitic_capacitance", parasitic_capacitance)?;
        if !read_pulse_amplitude.is_finite() || read_pulse_amplitude == 0.0 {
            return Err(ConfigError::NonPositive {
                name: "|read_pulse_amplitude|",
                value: read_pulse_amplitude.abs(),
            });
        }

        let period = 2.0 * read_pulse_width;
        let sample_time = read_pulse_width
            - READ_EDGE_OFFSET as f64 * period / READ_SAMPLES_PER_PERIOD as f64;

        let mut computer = RcResistanceComputer {
            board_version,
            read_pulse_amplitude,
            read_pulse_width,
            series_resistance,
            parasitic_capacitance,
            sample_time,
            table: Vec::with_capacity(TABLE_SIZE),
        };

        let log_min = MIN_RESISTANCE.ln();
        let log_step = (MAX_RESISTANCE.ln() - log_min) / (TABLE_SIZE - 1) as f64;
        computer.table = (0..TABLE_SIZE)
            .map(|i| {
                let log_r = log_min + i as f64 * log_step;
                (computer.normalized_voltage(log_r.exp()), log_r)
            })
            .collect();
        computer.table.sort_by(|a, b| a.0.total_cmp(&b.0));
        log::debug!(
            "Built RC resistance table for board {} (Rs = {} ohm, C = {} F, t = {} s)",
            board_version,
            series_resistance,
            parasitic_capacitance,
            sample_time
        );
        Ok(computer)
    }

    pub fn board_version(&self) -> BoardVersion {
        self.board_version
    }
    pub fn read_pulse_amplitude(&self) -> f64 {
        self.read_pulse_amplitude
    }
    pub fn read_pulse_width(&self) -> f64 {
        self.read_pulse_width
    }
    pub fn series_resistance(&self) -> f64 {
        self.series_resistance
    }
    pub fn parasitic_capacitance(&self) -> f64 {
        self.parasitic_capacitance
    }
    /// Time after the rising edge at which the read voltage is sampled, in seconds.
    pub fn sample_time(&self) -> f64 {
        self.sample_time
    }

    fn normalized_voltage(&self, resistance: f64) -> f64 {
        let rs = self.series_resistance;
        let tau = resistance * rs / (resistance + rs) * self.parasitic_capacitance;
        let charge = 1.0 - (-self.sample_time / tau).exp();
        let divider = match self.board_version {
            BoardVersion::V1 => rs / (resistance + rs),
            BoardVersion::V2 => resistance / (resistance + rs),
        };
        divider * charge
    }

    /// Sensed read voltage the model predicts for a device of `resistance` ohms.
    pub fn voltage_for_resistance(&self, resistance: f64) -> f64 {
        self.read_pulse_amplitude * self.normalized_voltage(resistance)
    }

    /// Device resistance in ohms for a sensed read voltage.
    ///
    /// Returns `f64::NAN` when the voltage is not finite or lies outside what a device between
    /// [`MIN_RESISTANCE`] and [`MAX_RESISTANCE`] can produce. Callers must treat NaN as an invalid
    /// measurement.
    pub fn resistance_from_voltage(&self, measured_voltage: f64) -> f64 {
        if !measured_voltage.is_finite() {
            return f64::NAN;
        }
        let v = measured_voltage / self.read_pulse_amplitude;
        let (first, last) = match (self.table.first(), self.table.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return f64::NAN,
        };
        if v < first.0 || v > last.0 {
            return f64::NAN;
        }
        let idx = self.table.partition_point(|&(tv, _)| tv < v);
        if idx == 0 {
            return first.1.exp();
        }
        let (v_hi, log_r_hi) = self.table[idx];
        let (v_lo, log_r_lo) = self.table[idx - 1];
        if v_hi == v_lo {
            return log_r_lo.exp();
        }
        let frac = (v - v_lo) / (v_hi - v_lo);
        (log_r_lo + frac * (log_r_hi - log_r_lo)).exp()
    }
}
