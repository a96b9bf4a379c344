//! Instrument-facing half of the memristor characterization backend.
//!
//! Builds on [`memristor_backend`] for pulse synthesis, the resistance model and trace
//! post-processing, and adds:
//!
//! - [`instrument`]: the device boundary every control loop talks to.
//! - [`sequencer`]: one arm, generate, capture cycle with mandatory cleanup.
//! - [`probe`]: read and write cycles turned into measurements.
//! - [`program`]: closed-loop programming toward a target resistance.
//! - [`synapse`]: differential-pair instructions and the initialization procedure.
//! - [`worker`]: running a controller on its own thread with cooperative cancellation.
//! - [`sim`]: a simulated instrument wired to memristor models.
//! - `dwf` (feature `dwf`): the Digilent WaveForms driver.
//!
//! A controller takes the instrument by value and owns it for as long as it runs:
//!
//! ```
//! use memristor_backend::*;
//! use memristorctrl_backend::*;
//!
//! let board = BoardConfig::default();
//! let instrument = SimulatedInstrument::new(SimConfig::from_board(&board).with_initial_resistance(20_000.0));
//! let probe = Probe::new(board, AcquisitionConfig::default(), Units::default()).unwrap();
//! let config = ProgramConfig { sample_period_s: 0.0, ..ProgramConfig::default() };
//! let mut controller = ProgrammingController::new(instrument, probe, config, RunToken::new()).unwrap();
//! assert_eq!(controller.run(|_| {}).unwrap(), ProgramStatus::Converged);
//! ```

#[cfg(feature = "dwf")]
pub mod dwf;
pub mod instrument;
pub mod probe;
pub mod program;
pub mod run_token;
pub mod sequencer;
pub mod sim;
pub mod synapse;
pub mod utils;
pub mod worker;

#[cfg(feature = "dwf")]
pub use crate::dwf::DwfInstrument;
pub use crate::instrument::{
    CaptureConfig, CaptureStatus, Instrument, InstrumentError, ScopeChannel, TriggerSpec, WaveformChannel,
};
pub use crate::probe::{Probe, ReadMeasurement, WriteCapture};
pub use crate::program::*;
pub use crate::run_token::{Cancelled, RunToken};
pub use crate::sequencer::{AcquisitionError, AcquisitionSequencer, CycleRequest, SequencerState};
pub use crate::sim::{MemristorModel, SimConfig, SimulatedInstrument};
pub use crate::synapse::*;
pub use crate::worker::*;
