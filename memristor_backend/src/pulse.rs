//! Provides the parametric pulse shapes used for reads and writes.
//!
//! ## Main Structures and Enumerations:
//!
//! - [`PulseShape`]: The closed set of supported waveform laws (square, smoothed square, square with
//!   a fast or slow exponential tail, triangle, quarter/half sine and sawtooth).
//!
//! - [`PulseSpec`]: An immutable, validated pulse description (shape, signed amplitude, pulse width in
//!   nanoseconds and duty cycle). Its [`PulseSpec::signal`] evaluates the waveform.
//!
//! ## Conventions:
//!
//! - Time arguments to [`PulseSpec::signal`] are in seconds; the pulse width is stored in nanoseconds.
//! - The period is `pulse_width / duty_cycle` for every shape, and every waveform is periodic in it.
//! - The amplitude sign encodes polarity: positive amplitudes are forward writes, negative ones
//!   reverse writes.
//! - Buffers handed to the instrument are normalized by [`FULL_SCALE_VOLTS`], so all values lie in
//!   `[-1, 1]` and the instrument multiplies them back by its full-scale amplitude.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Output range of the waveform generator. Custom buffers are expressed as a fraction of it.
pub const FULL_SCALE_VOLTS: f64 = 5.0;
/// Default length of a custom waveform buffer uploaded to the instrument.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// Rise (and fall) time of [`PulseShape::SquareSmooth`] as a fraction of the pulse width.
pub const SMOOTH_RISE_FRACTION: f64 = 0.1;
/// Tail time constant of [`PulseShape::SquareDecay`] as a fraction of the pulse width.
pub const DECAY_TAU_FRACTION: f64 = 0.1;
/// Tail time constant of [`PulseShape::SquareLongDecay`] as a fraction of the pulse width.
pub const LONG_DECAY_TAU_FRACTION: f64 = 0.3;

/// Waveform law of one pulse period.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PulseShape {
    Square,
    SquareSmooth,
    SquareDecay,
    SquareLongDecay,
    Triangle,
    QuarterSine,
    HalfSine,
    Sawtooth,
}

impl PulseShape {
    pub const ALL: [PulseShape; 8] = [
        PulseShape::Square,
        PulseShape::SquareSmooth,
        PulseShape::SquareDecay,
        PulseShape::SquareLongDecay,
        PulseShape::Triangle,
        PulseShape::QuarterSine,
        PulseShape::HalfSine,
        PulseShape::Sawtooth,
    ];
}

impl fmt::Display for PulseShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                PulseShape::Square => "Square",
                PulseShape::SquareSmooth => "SquareSmooth",
                PulseShape::SquareDecay => "SquareDecay",
                PulseShape::SquareLongDecay => "SquareLongDecay",
                PulseShape::Triangle => "Triangle",
                PulseShape::QuarterSine => "QuarterSine",
                PulseShape::HalfSine => "HalfSine",
                PulseShape::Sawtooth => "Sawtooth",
            }
        )
    }
}

impl FromStr for PulseShape {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        PulseShape::ALL
            .iter()
            .find(|shape| shape.to_string().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| {
                format!(
                    "Unknown pulse shape {}. Expected one of {:?}",
                    s,
                    PulseShape::ALL.iter().map(|s| s.to_string()).collect::<Vec<_>>()
                )
            })
    }
}

/// An immutable, validated pulse description.
///
/// Construct with [`PulseSpec::new`] (or [`PulseSpec::from_frequency`] for the 50% duty-cycle
/// probes used by read cycles); invalid parameters are rejected with a [`ConfigError`] before
/// anything reaches the instrument.
///
/// # Examples
///
/// ```
/// use memristor_backend::pulse::*;
///
/// let spec = PulseSpec::new(PulseShape::Square, 1.0, 1000.0, 0.5).unwrap();
/// assert_eq!(spec.period_ns(), 2000.0);
/// assert_eq!(spec.frequency(), 500_000.0);
/// assert_eq!(spec.signal(0.5e-6), 1.0);
/// assert_eq!(spec.signal(1.5e-6), 0.0);
/// ```
///
/// Non-positive pulse widths fail fast:
///
/// ```
/// # use memristor_backend::pulse::*;
/// assert!(PulseSpec::new(PulseShape::Square, 1.0, 0.0, 0.5).is_err());
/// ```
///
/// A phase offset shifts the waveform earlier by a fraction of the period:
///
/// ```
/// # use memristor_backend::pulse::*;
/// let spec = PulseSpec::new(PulseShape::Square, 1.0, 1000.0, 0.5).unwrap();
/// let shifted = spec.with_phase(180.0).unwrap();
/// assert_eq!(shifted.signal(0.5e-6), 0.0);
/// assert_eq!(shifted.signal(1.5e-6), 1.0);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PulseSpec {
    shape: PulseShape,
    amplitude: f64,
    pulse_width_ns: f64,
    duty_cycle: f64,
    // Degrees in [0, 360)
    phase_degrees: f64,
}

impl PulseSpec {
    /// Constructs a `PulseSpec`, checking that
    /// - `pulse_width_ns` is strictly positive,
    /// - `duty_cycle` lies in `(0, 1]`,
    /// - `|amplitude|` does not exceed [`FULL_SCALE_VOLTS`].
    pub fn new(shape: PulseShape, amplitude: f64, pulse_width_ns: f64, duty_cycle: f64) -> Result<Self> {
        if !(pulse_width_ns > 0.0) || !pulse_width_ns.is_finite() {
            return Err(ConfigError::PulseWidth(pulse_width_ns));
        }
        if !(duty_cycle > 0.0 && duty_cycle <= 1.0) {
            return Err(ConfigError::DutyCycle(duty_cycle));
        }
        if !amplitude.is_finite() || amplitude.abs() > FULL_SCALE_VOLTS {
            return Err(ConfigError::Amplitude {
                amplitude,
                full_scale: FULL_SCALE_VOLTS,
            });
        }
        Ok(PulseSpec {
            shape,
            amplitude,
            pulse_width_ns,
            duty_cycle,
            phase_degrees: 0.0,
        })
    }

    /// Constructs a 50% duty-cycle pulse whose period is `1 / frequency`.
    pub fn from_frequency(shape: PulseShape, amplitude: f64, frequency: f64) -> Result<Self> {
        if !(frequency > 0.0) || !frequency.is_finite() {
            return Err(ConfigError::Frequency(frequency));
        }
        PulseSpec::new(shape, amplitude, 0.5e9 / frequency, 0.5)
    }

    pub fn shape(&self) -> PulseShape {
        self.shape
    }
    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }
    pub fn pulse_width_ns(&self) -> f64 {
        self.pulse_width_ns
    }
    pub fn duty_cycle(&self) -> f64 {
        self.duty_cycle
    }
    pub fn phase_degrees(&self) -> f64 {
        self.phase_degrees
    }

    /// Pulse width in seconds.
    pub fn pulse_width(&self) -> f64 {
        self.pulse_width_ns * 1e-9
    }
    pub fn period_ns(&self) -> f64 {
        self.pulse_width_ns / self.duty_cycle
    }
    /// Period in seconds.
    pub fn period(&self) -> f64 {
        self.period_ns() * 1e-9
    }
    /// Pulse repetition frequency in Hz, `1e9 / (pulse_width / duty_cycle)`.
    pub fn frequency(&self) -> f64 {
        1e9 / self.period_ns()
    }
    /// Duration of a train of `pulse_count` pulses, in seconds.
    pub fn train_duration(&self, pulse_count: usize) -> f64 {
        self.period() * pulse_count as f64
    }

    /// Returns a copy with a different amplitude, re-validated.
    pub fn with_amplitude(&self, amplitude: f64) -> Result<Self> {
        PulseSpec::new(self.shape, amplitude, self.pulse_width_ns, self.duty_cycle)?.with_phase(self.phase_degrees)
    }
    /// Returns a copy with a different pulse width, re-validated.
    pub fn with_pulse_width(&self, pulse_width_ns: f64) -> Result<Self> {
        PulseSpec::new(self.shape, self.amplitude, pulse_width_ns, self.duty_cycle)?.with_phase(self.phase_degrees)
    }
    /// Returns a copy starting `phase_degrees` into the period. Any finite angle is accepted and
    /// wrapped into `[0, 360)`.
    pub fn with_phase(&self, phase_degrees: f64) -> Result<Self> {
        if !phase_degrees.is_finite() {
            return Err(ConfigError::Phase(phase_degrees));
        }
        Ok(PulseSpec {
            phase_degrees: phase_degrees.rem_euclid(360.0),
            ..*self
        })
    }
    /// Returns the same pulse with opposite polarity. Always valid since the range is symmetric.
    pub fn inverted(&self) -> Self {
        PulseSpec {
            amplitude: -self.amplitude,
            ..*self
        }
    }

    /// Instantaneous value of the waveform at time `t` (seconds).
    ///
    /// The waveform is evaluated on `(t + phase) mod period`, with the phase offset converted to
    /// seconds. For [`PulseShape::SquareSmooth`] the flat top
    /// spans the closed interval `[rise_time, fall_time]`, so the boundary samples resolve to the
    /// amplitude.
    pub fn signal(&self, t: f64) -> f64 {
        let period = self.period();
        let width = self.pulse_width();
        let a = self.amplitude;
        let t = (t + self.phase_degrees / 360.0 * period).rem_euclid(period);
        match self.shape {
            PulseShape::Square => {
                if t < width {
                    a
                } else {
                    0.0
                }
            }
            PulseShape::SquareSmooth => {
                let rise_time = width * SMOOTH_RISE_FRACTION;
                let fall_time = width - rise_time;
                let slope = a / rise_time;
                if t < rise_time {
                    t * slope
                } else if t <= fall_time {
                    a
                } else if t < width {
                    a - (t - fall_time) * slope
                } else {
                    0.0
                }
            }
            PulseShape::SquareDecay | PulseShape::SquareLongDecay => {
                let tau = width
                    * match self.shape {
                        PulseShape::SquareDecay => DECAY_TAU_FRACTION,
                        _ => LONG_DECAY_TAU_FRACTION,
                    };
                if t < width {
                    a
                } else {
                    a * (-(t - width) / tau).exp()
                }
            }
            PulseShape::Triangle => {
                if t < width {
                    a * (1.0 - (2.0 * t / width - 1.0).abs())
                } else {
                    0.0
                }
            }
            PulseShape::QuarterSine => {
                if t < width {
                    a * (0.5 * PI * t / width).sin()
                } else {
                    0.0
                }
            }
            PulseShape::HalfSine => {
                if t < width {
                    a * (PI * t / width).sin()
                } else {
                    0.0
                }
            }
            // Ramp over the whole period, centered on a/2 with half-amplitude a/2
            PulseShape::Sawtooth => a / 2.0 + a / 2.0 * (2.0 * t / period - 1.0),
        }
    }

    /// Replaces every time value of `t_arr` (seconds) with the waveform value at that time.
    pub fn eval_inplace(&self, t_arr: &mut ndarray::ArrayViewMut1<f64>) {
        t_arr.map_inplace(|t| *t = self.signal(*t));
    }

    /// Samples one period into `buffer_size` points normalized by [`FULL_SCALE_VOLTS`].
    ///
    /// This is the buffer uploaded to the waveform generator; the instrument plays it back once per
    /// pulse at [`PulseSpec::frequency`].
    pub fn sample_buffer(&self, buffer_size: usize) -> Result<Array1<f64>> {
        if buffer_size == 0 {
            return Err(ConfigError::EmptyBuffer);
        }
        let mut buffer = Array1::linspace(0., self.period(), buffer_size + 1);
        buffer.slice_collapse(ndarray::s![..buffer_size]);
        let mut buffer = buffer.to_owned();
        self.eval_inplace(&mut buffer.view_mut());
        buffer.mapv_inplace(|v| (v / FULL_SCALE_VOLTS).clamp(-1.0, 1.0));
        Ok(buffer)
    }

    /// Samples `pulse_count` periods into at most `buffer_size` (time, amplitude) points for display.
    pub fn preview(&self, pulse_count: usize, buffer_size: usize) -> (Array1<f64>, Array1<f64>) {
        let stop_time = self.train_duration(pulse_count);
        let n = buffer_size.max(1);
        let time_step = stop_time / n as f64;
        let time = Array1::from_iter((0..n).map(|i| i as f64 * time_step));
        let amplitude = time.mapv(|t| self.signal(t));
        (time, amplitude)
    }
}

impl fmt::Display for PulseSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}, {} V, {} ns, duty {}]",
            self.shape, self.amplitude, self.pulse_width_ns, self.duty_cycle
        )
    }
}

/// Normalized one-period buffer for a 50% duty-cycle pulse at `frequency`.
///
/// Shortcut for `PulseSpec::from_frequency(shape, amplitude, frequency)?.sample_buffer(buffer_size)`,
/// used for read probes that are specified by frequency rather than by width.
pub fn sample_buffer(
    shape: PulseShape,
    amplitude: f64,
    frequency: f64,
    buffer_size: usize,
) -> Result<Array1<f64>> {
    PulseSpec::from_frequency(shape, amplitude, frequency)?.sample_buffer(buffer_size)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    mod construction {
        use super::*;

        #[test]
        fn period_and_frequency() {
            let spec = PulseSpec::new(PulseShape::Square, 1.0, 1000.0, 0.5).unwrap();
            assert_eq!(spec.period_ns(), 2000.0);
            assert_eq!(spec.frequency(), 500_000.0);
            assert_abs_diff_eq!(spec.period(), 2e-6, epsilon = 1e-18);
        }

        #[test]
        fn rejects_bad_parameters() {
            assert!(matches!(
                PulseSpec::new(PulseShape::Square, 1.0, -5.0, 0.5),
                Err(ConfigError::PulseWidth(_))
            ));
            assert!(matches!(
                PulseSpec::new(PulseShape::Square, 1.0, 1000.0, 0.0),
                Err(ConfigError::DutyCycle(_))
            ));
            assert!(matches!(
                PulseSpec::new(PulseShape::Square, 1.0, 1000.0, 1.5),
                Err(ConfigError::DutyCycle(_))
            ));
            assert!(matches!(
                PulseSpec::new(PulseShape::Square, 6.0, 1000.0, 0.5),
                Err(ConfigError::Amplitude { .. })
            ));
            assert!(PulseSpec::new(PulseShape::Square, 1.0, f64::NAN, 0.5).is_err());
            assert!(PulseSpec::new(PulseShape::Square, -5.0, 1000.0, 1.0).is_ok());
        }

        #[test]
        fn from_frequency_is_half_duty() {
            let spec = PulseSpec::from_frequency(PulseShape::Square, 0.1, 20_000.0).unwrap();
            assert_abs_diff_eq!(spec.pulse_width_ns(), 25_000.0, epsilon = 1e-9);
            assert_eq!(spec.duty_cycle(), 0.5);
            assert!(PulseSpec::from_frequency(PulseShape::Square, 0.1, 0.0).is_err());
        }

        #[test]
        fn shape_from_str() {
            assert_eq!("squaresmooth".parse::<PulseShape>().unwrap(), PulseShape::SquareSmooth);
            assert!("Trapezoid".parse::<PulseShape>().is_err());
        }
    }

    mod signal {
        use super::*;

        #[test]
        fn phase_offset() {
            let spec = PulseSpec::new(PulseShape::Square, 1.0, 1000.0, 0.5).unwrap();
            let shifted = spec.with_phase(90.0).unwrap();
            // A quarter period is half a pulse width
            assert_eq!(shifted.signal(0.25e-6), 1.0);
            assert_eq!(shifted.signal(0.75e-6), 0.0);
            assert_eq!(shifted.signal(1.75e-6), 1.0);

            assert_eq!(spec.with_phase(-90.0).unwrap().phase_degrees(), 270.0);
            assert_eq!(spec.with_phase(720.0).unwrap(), spec);
            assert!(matches!(spec.with_phase(f64::NAN), Err(ConfigError::Phase(_))));
            // Re-validated copies keep the phase
            assert_eq!(shifted.with_amplitude(-2.0).unwrap().phase_degrees(), 90.0);
            assert_eq!(shifted.inverted().phase_degrees(), 90.0);

            let buffer = spec.with_phase(60.0).unwrap().sample_buffer(8).unwrap();
            assert_eq!(buffer.to_vec(), vec![0.2, 0.2, 0.2, 0.0, 0.0, 0.0, 0.0, 0.2]);
        }

        #[test]
        /// Every shape repeats after one period, sampled away from the discontinuities
        fn periodic() {
            for shape in PulseShape::ALL {
                let spec = PulseSpec::new(shape, 1.7, 1000.0, 0.4).unwrap();
                let period = spec.period();
                for frac in [0.013, 0.21, 0.37, 0.55, 0.81, 0.93] {
                    let t = frac * period;
                    for k in 1..4 {
                        assert_abs_diff_eq!(
                            spec.signal(t),
                            spec.signal(t + k as f64 * period),
                            epsilon = 1e-9
                        );
                    }
                }
            }
        }

        #[test]
        fn square_smooth_edges() {
            let spec = PulseSpec::new(PulseShape::SquareSmooth, 2.0, 1000.0, 0.5).unwrap();
            let width = spec.pulse_width();
            let rise_time = width * SMOOTH_RISE_FRACTION;
            let fall_time = width - rise_time;

            assert_eq!(spec.signal(0.0), 0.0);
            assert_abs_diff_eq!(spec.signal(rise_time), 2.0, epsilon = 1e-12);
            assert_abs_diff_eq!(spec.signal(fall_time), 2.0, epsilon = 1e-12);
            assert_eq!(spec.signal(width), 0.0);

            // Monotonic ramp on [0, rise_time)
            let mut last = -1.0;
            for i in 0..100 {
                let v = spec.signal(rise_time * i as f64 / 100.0);
                assert!(v > last);
                last = v;
            }
            // Symmetric fall
            assert_abs_diff_eq!(
                spec.signal(rise_time * 0.5),
                spec.signal(width - rise_time * 0.5),
                epsilon = 1e-9
            );
        }

        #[test]
        fn square_polarity() {
            let spec = PulseSpec::new(PulseShape::Square, -1.5, 500.0, 0.25).unwrap();
            assert_eq!(spec.signal(100e-9), -1.5);
            assert_eq!(spec.signal(600e-9), 0.0);
            assert_eq!(spec.inverted().signal(100e-9), 1.5);
        }

        #[test]
        fn decay_tails() {
            let fast = PulseSpec::new(PulseShape::SquareDecay, 1.0, 1000.0, 0.5).unwrap();
            let slow = PulseSpec::new(PulseShape::SquareLongDecay, 1.0, 1000.0, 0.5).unwrap();
            let t = 1.2e-6;
            assert_eq!(fast.signal(0.9e-6), 1.0);
            assert!(fast.signal(t) < slow.signal(t));
            assert!(slow.signal(t) < 1.0 && fast.signal(t) > 0.0);
            assert_abs_diff_eq!(fast.signal(t), (-2.0f64).exp(), epsilon = 1e-9);
        }

        #[test]
        fn triangle_and_sines() {
            let tri = PulseSpec::new(PulseShape::Triangle, 1.0, 1000.0, 0.5).unwrap();
            assert_abs_diff_eq!(tri.signal(0.5e-6), 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(tri.signal(0.25e-6), 0.5, epsilon = 1e-12);
            assert_eq!(tri.signal(1.5e-6), 0.0);

            let quarter = PulseSpec::new(PulseShape::QuarterSine, 1.0, 1000.0, 0.5).unwrap();
            assert_abs_diff_eq!(quarter.signal(0.999_999e-6), 1.0, epsilon = 1e-6);
            let half = PulseSpec::new(PulseShape::HalfSine, 1.0, 1000.0, 0.5).unwrap();
            assert_abs_diff_eq!(half.signal(0.5e-6), 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(half.signal(0.999_999e-6), 0.0, epsilon = 1e-5);
        }

        #[test]
        fn sawtooth_spans_period() {
            let saw = PulseSpec::new(PulseShape::Sawtooth, 2.0, 1000.0, 0.5).unwrap();
            assert_abs_diff_eq!(saw.signal(0.0), 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(saw.signal(1e-6), 1.0, epsilon = 1e-9);
            assert_abs_diff_eq!(saw.signal(1.5e-6), 1.5, epsilon = 1e-9);
        }
    }

    mod buffers {
        use super::*;

        #[test]
        fn normalized_to_full_scale() {
            let spec = PulseSpec::new(PulseShape::Square, -2.5, 1000.0, 0.5).unwrap();
            let buffer = spec.sample_buffer(100).unwrap();
            assert_eq!(buffer.len(), 100);
            assert_eq!(buffer[0], -0.5);
            assert_eq!(buffer[99], 0.0);
            assert!(buffer.iter().all(|v| (-1.0..=1.0).contains(v)));
            assert!(spec.sample_buffer(0).is_err());
        }

        #[test]
        fn frequency_buffer() {
            let buffer = sample_buffer(PulseShape::Square, 5.0, 10_000.0, 10).unwrap();
            assert_eq!(buffer.to_vec(), vec![1., 1., 1., 1., 1., 0., 0., 0., 0., 0.]);
        }

        #[test]
        fn preview_covers_train() {
            let spec = PulseSpec::new(PulseShape::Square, 1.0, 1000.0, 0.5).unwrap();
            let (time, amplitude) = spec.preview(3, 600);
            assert_eq!(time.len(), 600);
            assert_eq!(amplitude.len(), 600);
            assert!(*time.last().unwrap() < spec.train_duration(3));
            assert_eq!(amplitude.iter().filter(|v| **v == 1.0).count(), 300);
        }
    }
}
