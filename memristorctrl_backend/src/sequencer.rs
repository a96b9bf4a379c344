//! One generate-then-capture cycle against an [`Instrument`].
//!
//! A cycle walks `Idle -> Arming -> Armed -> Generating -> Capturing -> Done | Failed`:
//!
//! 1. **Arming**: the capture is configured and armed, then the status is busy-polled until the
//!    oscilloscope reports armed, for at most `arm_retry_ceiling` polls.
//! 2. **Generating**: the sample buffer is uploaded and the pulse train started.
//! 3. **Capturing**: the status is polled at most `capture_retry_ceiling` times, each poll preceded
//!    by a sleep of one pulse-train duration. The sleeps go through the [`RunToken`], so a cancel
//!    ends the wait immediately.
//! 4. **Done**: the valid sample count and both channels are fetched.
//!
//! Whatever the outcome, the waveform output and the capture are stopped exactly once before
//! [`AcquisitionSequencer::run_cycle`] returns. A failed cycle is reported to the caller, which
//! aborts its run; the sequencer never retries on its own.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use memristor_backend::error::ConfigError;
use memristor_backend::trace::CaptureTrace;

use crate::instrument::{
    CaptureConfig, CaptureStatus, Instrument, InstrumentError, ScopeChannel, WaveformChannel,
};
use crate::run_token::{Cancelled, RunToken};
use crate::utils::TickTimer;

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("capture did not arm after {polls} polls")]
    ArmTimeout { polls: usize },

    #[error("capture did not complete after {polls} polls")]
    CaptureTimeout { polls: usize },

    #[error("acquisition interrupted")]
    Interrupted,

    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error("invalid pulse: {0}")]
    Config(#[from] ConfigError),
}

impl From<Cancelled> for AcquisitionError {
    fn from(_: Cancelled) -> Self {
        AcquisitionError::Interrupted
    }
}

impl AcquisitionError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, AcquisitionError::Interrupted)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Arming,
    Armed,
    Generating,
    Capturing,
    Done,
    Failed,
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything needed for one cycle: how to capture and what to play.
#[derive(Clone, Copy, Debug)]
pub struct CycleRequest<'a> {
    pub capture: CaptureConfig,
    pub channel: WaveformChannel,
    /// Pulse repetition frequency, Hz.
    pub frequency: f64,
    pub pulse_count: usize,
    /// One normalized period.
    pub samples: &'a [f64],
}

impl CycleRequest<'_> {
    /// Duration of the whole pulse train.
    pub fn train_duration(&self) -> Duration {
        Duration::from_secs_f64(self.pulse_count as f64 / self.frequency)
    }
}

#[derive(Clone, Debug)]
pub struct AcquisitionSequencer {
    arm_retry_ceiling: usize,
    capture_retry_ceiling: usize,
    state: SequencerState,
}

impl AcquisitionSequencer {
    pub fn new(arm_retry_ceiling: usize, capture_retry_ceiling: usize) -> Self {
        Self {
            arm_retry_ceiling,
            capture_retry_ceiling,
            state: SequencerState::Idle,
        }
    }

    /// State reached by the last cycle.
    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn run_cycle<I: Instrument + ?Sized>(
        &mut self,
        instrument: &mut I,
        request: &CycleRequest,
        token: &RunToken,
    ) -> Result<CaptureTrace, AcquisitionError> {
        let mut timer = TickTimer::new();
        let result = self.generate_and_capture(instrument, request, token, &mut timer);
        let cleanup = Self::stop_outputs(instrument, request.channel);
        timer.tick_log("stop outputs");

        match (result, cleanup) {
            (Ok(trace), Ok(())) => {
                self.state = SequencerState::Done;
                Ok(trace)
            }
            (Ok(_), Err(e)) => {
                self.state = SequencerState::Failed;
                Err(e.into())
            }
            (Err(e), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    log::warn!("Cleanup after failed cycle also failed: {}", cleanup_err);
                }
                if !e.is_interrupted() {
                    log::warn!("Acquisition failed in state {}: {}", self.state, e);
                }
                self.state = SequencerState::Failed;
                Err(e)
            }
        }
    }

    fn generate_and_capture<I: Instrument + ?Sized>(
        &mut self,
        instrument: &mut I,
        request: &CycleRequest,
        token: &RunToken,
        timer: &mut TickTimer,
    ) -> Result<CaptureTrace, AcquisitionError> {
        token.check()?;

        self.state = SequencerState::Arming;
        instrument.arm_capture(&request.capture)?;
        self.wait_armed(instrument, token)?;
        self.state = SequencerState::Armed;
        timer.tick_log("arm capture");

        self.state = SequencerState::Generating;
        instrument.start_waveform_output(
            request.channel,
            request.frequency,
            // Any phase offset is already part of the sample buffer
            0.0,
            request.pulse_count,
            request.samples,
        )?;
        timer.tick_log("start waveform");

        self.state = SequencerState::Capturing;
        self.wait_done(instrument, request.train_duration(), token)?;
        timer.tick_log("capture");

        let count = instrument.read_valid_sample_count()?;
        let channel1 = instrument.read_channel_samples(ScopeChannel::Ch1, count)?;
        let channel2 = instrument.read_channel_samples(ScopeChannel::Ch2, count)?;
        timer.tick_log("read samples");
        Ok(CaptureTrace::new(
            request.capture.sample_frequency,
            channel1,
            channel2,
        ))
    }

    fn wait_armed<I: Instrument + ?Sized>(
        &self,
        instrument: &mut I,
        token: &RunToken,
    ) -> Result<(), AcquisitionError> {
        for poll in 0..self.arm_retry_ceiling {
            token.check()?;
            match instrument.poll_capture_status()? {
                CaptureStatus::Armed | CaptureStatus::Done => {
                    log::debug!("Capture armed after {} polls", poll + 1);
                    return Ok(());
                }
                CaptureStatus::Idle => std::thread::yield_now(),
            }
        }
        Err(AcquisitionError::ArmTimeout {
            polls: self.arm_retry_ceiling,
        })
    }

    fn wait_done<I: Instrument + ?Sized>(
        &self,
        instrument: &mut I,
        poll_interval: Duration,
        token: &RunToken,
    ) -> Result<(), AcquisitionError> {
        for poll in 0..self.capture_retry_ceiling {
            token.sleep(poll_interval)?;
            if instrument.poll_capture_status()? == CaptureStatus::Done {
                log::debug!("Capture done after {} polls", poll + 1);
                return Ok(());
            }
        }
        Err(AcquisitionError::CaptureTimeout {
            polls: self.capture_retry_ceiling,
        })
    }

    fn stop_outputs<I: Instrument + ?Sized>(
        instrument: &mut I,
        channel: WaveformChannel,
    ) -> Result<(), InstrumentError> {
        let wave = instrument.stop_waveform_output(channel);
        let capture = instrument.stop_capture();
        wave.and(capture)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instrument::{TriggerSpec, LOW_INPUT_RANGE};
    use crate::sim::{SimConfig, SimulatedInstrument};

    fn request(samples: &[f64]) -> CycleRequest {
        CycleRequest {
            capture: CaptureConfig {
                trigger: TriggerSpec::WaveformStart(WaveformChannel::W1),
                sample_frequency: 200.0 * 500_000.0,
                buffer_size: 400,
                input_range: LOW_INPUT_RANGE,
            },
            channel: WaveformChannel::W1,
            frequency: 500_000.0,
            pulse_count: 1,
            samples,
        }
    }

    mod run_cycle {
        use super::*;

        #[test]
        fn captures_both_channels() {
            let mut sim = SimulatedInstrument::new(SimConfig::default());
            let samples = vec![0.2; 16];
            let mut sequencer = AcquisitionSequencer::new(100, 10);
            let trace = sequencer
                .run_cycle(&mut sim, &request(&samples), &RunToken::new())
                .unwrap();
            assert_eq!(trace.len(), 400);
            assert_eq!(sequencer.state(), SequencerState::Done);
            assert_eq!(sim.stop_waveform_calls(), 1);
            assert_eq!(sim.stop_capture_calls(), 1);
        }

        #[test]
        /// A capture that never completes fails after exactly the retry ceiling
        fn capture_timeout_after_ceiling() {
            let mut sim = SimulatedInstrument::new(SimConfig {
                never_done: true,
                ..SimConfig::default()
            });
            let samples = vec![0.2; 16];
            let mut sequencer = AcquisitionSequencer::new(100, 37);
            let err = sequencer
                .run_cycle(&mut sim, &request(&samples), &RunToken::new())
                .unwrap_err();
            assert!(matches!(err, AcquisitionError::CaptureTimeout { polls: 37 }));
            assert_eq!(sim.capture_polls(), 37);
            assert_eq!(sequencer.state(), SequencerState::Failed);
            assert_eq!(sim.stop_waveform_calls(), 1);
            assert_eq!(sim.stop_capture_calls(), 1);
        }

        #[test]
        fn arm_timeout_still_cleans_up() {
            let mut sim = SimulatedInstrument::new(SimConfig {
                arm_delay_polls: 1000,
                ..SimConfig::default()
            });
            let samples = vec![0.2; 16];
            let mut sequencer = AcquisitionSequencer::new(50, 10);
            let err = sequencer
                .run_cycle(&mut sim, &request(&samples), &RunToken::new())
                .unwrap_err();
            assert!(matches!(err, AcquisitionError::ArmTimeout { polls: 50 }));
            assert_eq!(sim.stop_waveform_calls(), 1);
            assert_eq!(sim.stop_capture_calls(), 1);
        }

        #[test]
        fn arm_delay_within_ceiling() {
            let mut sim = SimulatedInstrument::new(SimConfig {
                arm_delay_polls: 20,
                ..SimConfig::default()
            });
            let samples = vec![0.2; 16];
            let mut sequencer = AcquisitionSequencer::new(50, 10);
            assert!(sequencer
                .run_cycle(&mut sim, &request(&samples), &RunToken::new())
                .is_ok());
        }

        #[test]
        fn cancelled_token_interrupts() {
            let mut sim = SimulatedInstrument::new(SimConfig::default());
            let samples = vec![0.2; 16];
            let token = RunToken::new();
            token.cancel();
            let err = AcquisitionSequencer::new(10, 10)
                .run_cycle(&mut sim, &request(&samples), &token)
                .unwrap_err();
            assert!(err.is_interrupted());
            assert_eq!(sim.stop_waveform_calls(), 1);
            assert_eq!(sim.stop_capture_calls(), 1);
        }
    }
}
