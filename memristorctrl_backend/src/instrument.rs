//! The device boundary: everything the control loops need from a mixed-signal instrument.
//!
//! An [`Instrument`] couples one arbitrary waveform generator with a dual-channel oscilloscope and a
//! bank of digital I/O lines. Every call is synchronous and blocks against the physical device. A
//! failing call surfaces as [`InstrumentError`], which the sequencer turns into a failed cycle rather
//! than a process-fatal error.
//!
//! Implementations:
//! - [`crate::sim::SimulatedInstrument`]: an in-process memristor circuit model.
//! - `crate::dwf::DwfInstrument` (feature `dwf`): the Digilent WaveForms runtime.

use std::fmt;

use thiserror::Error;

/// Oscilloscope input range used when the expected signal stays within +/-2.5 V.
pub const LOW_INPUT_RANGE: f64 = 2.5;
/// Oscilloscope input range for larger signals.
pub const HIGH_INPUT_RANGE: f64 = 25.0;
/// Magnitude of the level trigger used by level-triggered captures.
pub const LEVEL_TRIGGER_VOLTS: f64 = 0.02;

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("{call} failed: {message}")]
    Driver { call: &'static str, message: String },

    #[error("instrument is not connected")]
    NotConnected,

    #[error("requested {requested} samples but only {available} are valid")]
    SampleCount { requested: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, InstrumentError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaveformChannel {
    W1,
    W2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeChannel {
    Ch1,
    Ch2,
}

impl fmt::Display for WaveformChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                WaveformChannel::W1 => "W1",
                WaveformChannel::W2 => "W2",
            }
        )
    }
}

impl fmt::Display for ScopeChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ScopeChannel::Ch1 => "1+",
                ScopeChannel::Ch2 => "2+",
            }
        )
    }
}

/// What starts the oscilloscope acquisition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TriggerSpec {
    /// Acquisition starts with the given waveform generator channel.
    WaveformStart(WaveformChannel),
    /// Acquisition starts when `channel` crosses `level` volts in the direction of its sign.
    Level { channel: ScopeChannel, level: f64 },
}

impl TriggerSpec {
    /// Level trigger at [`LEVEL_TRIGGER_VOLTS`] with the polarity of `amplitude`.
    pub fn level_for_amplitude(channel: ScopeChannel, amplitude: f64) -> Self {
        TriggerSpec::Level {
            channel,
            level: LEVEL_TRIGGER_VOLTS.copysign(amplitude),
        }
    }
}

/// Arming parameters of one dual-channel capture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureConfig {
    pub trigger: TriggerSpec,
    /// Samples per second on each channel.
    pub sample_frequency: f64,
    /// Samples per channel.
    pub buffer_size: usize,
    /// Peak volts of the oscilloscope input range.
    pub input_range: f64,
}

impl CaptureConfig {
    /// Smallest input range that holds a signal of `amplitude` volts.
    pub fn input_range_for(amplitude: f64) -> f64 {
        if amplitude.abs() <= LOW_INPUT_RANGE {
            LOW_INPUT_RANGE
        } else {
            HIGH_INPUT_RANGE
        }
    }
}

/// Coarse acquisition state reported by the oscilloscope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureStatus {
    Idle,
    Armed,
    Done,
}

/// Synchronous access to a waveform generator, a dual-channel oscilloscope and digital outputs.
///
/// The control loops assume exclusive access for the duration of a cycle; whoever owns the
/// instrument decides which controller runs.
pub trait Instrument {
    /// Plays `samples` (one period, normalized to `[-1, 1]` of the full-scale output) `pulse_count`
    /// times at `frequency` Hz, starting at `phase` degrees.
    fn start_waveform_output(
        &mut self,
        channel: WaveformChannel,
        frequency: f64,
        phase: f64,
        pulse_count: usize,
        samples: &[f64],
    ) -> Result<()>;

    fn stop_waveform_output(&mut self, channel: WaveformChannel) -> Result<()>;

    /// Configures both oscilloscope channels and begins arming.
    fn arm_capture(&mut self, config: &CaptureConfig) -> Result<()>;

    fn poll_capture_status(&mut self) -> Result<CaptureStatus>;

    fn read_valid_sample_count(&mut self) -> Result<usize>;

    fn read_channel_samples(&mut self, channel: ScopeChannel, count: usize) -> Result<Vec<f64>>;

    fn stop_capture(&mut self) -> Result<()>;

    /// Drives the digital I/O lines to `bits`, one bit per line.
    fn set_digital_output_state(&mut self, bits: u32) -> Result<()>;
}

impl<I: Instrument + ?Sized> Instrument for Box<I> {
    fn start_waveform_output(
        &mut self,
        channel: WaveformChannel,
        frequency: f64,
        phase: f64,
        pulse_count: usize,
        samples: &[f64],
    ) -> Result<()> {
        (**self).start_waveform_output(channel, frequency, phase, pulse_count, samples)
    }
    fn stop_waveform_output(&mut self, channel: WaveformChannel) -> Result<()> {
        (**self).stop_waveform_output(channel)
    }
    fn arm_capture(&mut self, config: &CaptureConfig) -> Result<()> {
        (**self).arm_capture(config)
    }
    fn poll_capture_status(&mut self) -> Result<CaptureStatus> {
        (**self).poll_capture_status()
    }
    fn read_valid_sample_count(&mut self) -> Result<usize> {
        (**self).read_valid_sample_count()
    }
    fn read_channel_samples(&mut self, channel: ScopeChannel, count: usize) -> Result<Vec<f64>> {
        (**self).read_channel_samples(channel, count)
    }
    fn stop_capture(&mut self) -> Result<()> {
        (**self).stop_capture()
    }
    fn set_digital_output_state(&mut self, bits: u32) -> Result<()> {
        (**self).set_digital_output_state(bits)
    }
}
