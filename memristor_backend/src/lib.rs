//! Hardware-independent half of the memristor characterization backend.
//!
//! - [`pulse`]: parametric pulse shapes and the normalized buffers uploaded to the waveform
//!   generator.
//! - [`resistance`]: board description and the RC model turning a read voltage into resistance.
//! - [`postprocess`]: trimming and derivation of device voltage, current and conductance series.
//! - [`trace`]: raw and derived sample series.
//! - [`config`]: the TOML session file.
//!
//! Instrument access and the control loops live in `memristorctrl_backend`.

pub mod config;
pub mod error;
pub mod postprocess;
pub mod pulse;
pub mod resistance;
pub mod trace;

pub use config::*;
pub use error::*;
pub use postprocess::*;
pub use pulse::*;
pub use resistance::*;
pub use trace::*;
