//! Turns raw oscilloscope captures into device voltage, current and conductance series.
//!
//! Every operation is pointwise over equal-length series. Divisions by a vanishing device voltage
//! never panic: they produce non-finite values which [`conductance`] maps to zero.
//!
//! The board revision decides which channel is driven and which one senses the series resistor:
//!
//! | board | driven | device voltage | series-resistor voltage |
//! |-------|--------|----------------|-------------------------|
//! | 1     | V1     | `V1 - V2`      | `V2`                    |
//! | 2     | V2     | `-V1`          | `V1 - V2`               |

use ndarray::{s, Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

use crate::resistance::{BoardVersion, READ_EDGE_OFFSET};
use crate::trace::{CaptureTrace, DerivedTrace};

/// Trim threshold for write captures, in volts.
pub const WRITE_TRIM_THRESHOLD: f64 = 0.05;
/// Trim threshold for level-triggered sweep captures, in volts.
pub const SWEEP_TRIM_THRESHOLD: f64 = 0.02;
/// Trim threshold for read captures: any non-zero sample counts as activity.
pub const READ_TRIM_THRESHOLD: f64 = 0.0;
/// Samples of padding kept around the active region.
pub const TRIM_MARGIN: usize = 10;
/// First index scanned for the falling edge of a read pulse.
pub const READ_EDGE_SCAN_START: usize = 50;
/// Relative step of the driven channel that counts as the falling edge.
pub const READ_EDGE_RELATIVE_STEP: f64 = -0.05;
/// Analog-switch resistance in series with the device and the series resistor, in ohms.
pub const SWITCH_SERIES_RESISTANCE: f64 = 100.0;

/// Display divisors applied to derived series (`1e6` shows microseconds, microamps and
/// microsiemens).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Units {
    pub time_divisor: f64,
    pub current_divisor: f64,
    pub conductance_divisor: f64,
}

impl Default for Units {
    fn default() -> Self {
        Units {
            time_divisor: 1e6,
            current_divisor: 1e6,
            conductance_divisor: 1e6,
        }
    }
}

impl Units {
    /// Plain SI units.
    pub fn si() -> Self {
        Units {
            time_divisor: 1.0,
            current_divisor: 1.0,
            conductance_divisor: 1.0,
        }
    }
}

/// Removes the leading and trailing samples where neither channel exceeds `threshold` volts in
/// magnitude, keeping `margin` samples of padding on each side of the active region.
///
/// Returns empty series when no sample exceeds the threshold. Trimming an already trimmed pair with
/// the same arguments returns it unchanged.
pub fn trim_idle_data(
    v1: ArrayView1<f64>,
    v2: ArrayView1<f64>,
    threshold: f64,
    margin: usize,
) -> (Array1<f64>, Array1<f64>) {
    let len = v1.len().min(v2.len());
    let active = |i: &usize| v1[*i].abs() > threshold || v2[*i].abs() > threshold;
    let first = (0..len).find(active);
    let last = (0..len).rev().find(active);
    match (first, last) {
        (Some(first), Some(last)) => {
            let start = first.saturating_sub(margin);
            let end = (last + margin + 1).min(len);
            (
                v1.slice(s![start..end]).to_owned(),
                v2.slice(s![start..end]).to_owned(),
            )
        }
        _ => (Array1::zeros(0), Array1::zeros(0)),
    }
}

/// Voltage across the device.
pub fn device_voltage(board: BoardVersion, v1: ArrayView1<f64>, v2: ArrayView1<f64>) -> Array1<f64> {
    match board {
        BoardVersion::V1 => &v1 - &v2,
        BoardVersion::V2 => v1.mapv(|v| -v),
    }
}

/// Voltage across the series resistor.
pub fn series_voltage(board: BoardVersion, v1: ArrayView1<f64>, v2: ArrayView1<f64>) -> Array1<f64> {
    match board {
        BoardVersion::V1 => v2.to_owned(),
        BoardVersion::V2 => &v1 - &v2,
    }
}

/// `v / series_resistance`, scaled by `divisor`.
pub fn current(v: ArrayView1<f64>, series_resistance: f64, divisor: f64) -> Array1<f64> {
    v.mapv(|v| v / series_resistance * divisor)
}

/// `current / device_voltage`, scaled by `divisor` and clamped to be non-negative.
///
/// `current` is expected in amps. Non-finite quotients (zero device voltage) map to zero.
pub fn conductance(current: ArrayView1<f64>, device_voltage: ArrayView1<f64>, divisor: f64) -> Array1<f64> {
    Zip::from(&current)
        .and(&device_voltage)
        .map_collect(|&i, &v| clamp_conductance(i / v * divisor))
}

fn clamp_conductance(g: f64) -> f64 {
    if g.is_finite() && g > 0.0 {
        g
    } else {
        0.0
    }
}

/// Sample times `i / sample_frequency`, scaled by `divisor`.
pub fn time_axis(len: usize, sample_frequency: f64, divisor: f64) -> Array1<f64> {
    let step = divisor / sample_frequency;
    Array1::from_iter((0..len).map(|i| i as f64 * step))
}

/// Trims a write capture and derives every display series from it.
pub fn derive_trace(
    capture: &CaptureTrace,
    board: BoardVersion,
    series_resistance: f64,
    units: &Units,
) -> DerivedTrace {
    derive_trimmed(capture, board, series_resistance, units, WRITE_TRIM_THRESHOLD)
}

/// Like [`derive_trace`] for a level-triggered sweep, trimmed at [`SWEEP_TRIM_THRESHOLD`].
///
/// The `(device_voltage, current)` and `(device_voltage, conductance)` pairs of the result are the
/// I-V and G-V curves of the sweep.
pub fn derive_sweep_trace(
    capture: &CaptureTrace,
    board: BoardVersion,
    series_resistance: f64,
    units: &Units,
) -> DerivedTrace {
    derive_trimmed(capture, board, series_resistance, units, SWEEP_TRIM_THRESHOLD)
}

fn derive_trimmed(
    capture: &CaptureTrace,
    board: BoardVersion,
    series_resistance: f64,
    units: &Units,
    threshold: f64,
) -> DerivedTrace {
    let (v1, v2) = trim_idle_data(
        capture.channel1.view(),
        capture.channel2.view(),
        threshold,
        TRIM_MARGIN,
    );
    let v_device = device_voltage(board, v1.view(), v2.view());
    let amps = current(series_voltage(board, v1.view(), v2.view()).view(), series_resistance, 1.0);
    DerivedTrace {
        time: time_axis(v1.len(), capture.sample_frequency, units.time_divisor),
        conductance: conductance(amps.view(), v_device.view(), units.conductance_divisor),
        current: amps.mapv(|i| i * units.current_divisor),
        device_voltage: v_device,
        v1,
        v2,
    }
}

/// Sensed voltage just before the falling edge of a single read pulse.
///
/// Scans the driven channel from [`READ_EDGE_SCAN_START`] for a relative magnitude step
/// `(|V[i]| - |V[i-1]|) / |V[i]|` below [`READ_EDGE_RELATIVE_STEP`] and returns the sensed
/// channel [`READ_EDGE_OFFSET`] samples earlier. Falls back to the sensed sample at one third of
/// the trace when no edge is found, and to NaN for an empty trace.
pub fn read_voltage<'a>(board: BoardVersion, v1: ArrayView1<'a, f64>, v2: ArrayView1<'a, f64>) -> f64 {
    let (driven, sensed) = match board {
        BoardVersion::V1 => (v1, v2),
        BoardVersion::V2 => (v2, v1),
    };
    let len = driven.len().min(sensed.len());
    if len == 0 {
        return f64::NAN;
    }
    let start = READ_EDGE_SCAN_START.max(READ_EDGE_OFFSET);
    (start..len)
        .find(|&i| {
            let (now, before) = (driven[i].abs(), driven[i - 1].abs());
            (now - before) / now < READ_EDGE_RELATIVE_STEP
        })
        .map(|i| sensed[i - READ_EDGE_OFFSET])
        .unwrap_or(sensed[len / 3])
}

/// Current and energy delivered by a write train to a device of `resistance` ohms.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AppliedEnergy {
    /// Amps, scaled by the current divisor.
    pub current: f64,
    /// Joules.
    pub energy: f64,
}

/// `I = A / (R + Rs + Rswitch)` and `E = A^2 / (R + Rs + Rswitch) * pulses * width`.
pub fn applied_energy(
    amplitude: f64,
    resistance: f64,
    series_resistance: f64,
    pulse_count: usize,
    pulse_width_ns: f64,
    current_divisor: f64,
) -> AppliedEnergy {
    let total = resistance + series_resistance + SWITCH_SERIES_RESISTANCE;
    AppliedEnergy {
        current: amplitude / total * current_divisor,
        energy: amplitude * amplitude / total * pulse_count as f64 * pulse_width_ns / 1e9,
    }
}
