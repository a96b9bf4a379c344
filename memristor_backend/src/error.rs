//! Error types shared by the pulse, resistance and configuration modules.
//!
//! Invalid parameters are rejected when a [`PulseSpec`](crate::pulse::PulseSpec) or
//! [`RcResistanceComputer`](crate::resistance::RcResistanceComputer) is constructed, so a
//! malformed request never reaches the instrument.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("pulse width must be positive, got {0} ns")]
    PulseWidth(f64),

    #[error("duty cycle must lie in (0, 1], got {0}")]
    DutyCycle(f64),

    #[error("amplitude {amplitude} V exceeds the instrument output range of +/-{full_scale} V")]
    Amplitude { amplitude: f64, full_scale: f64 },

    #[error("phase must be finite, got {0} degrees")]
    Phase(f64),

    #[error("pulse count must be at least 1")]
    PulseCount,

    #[error("sample buffer needs at least one sample")]
    EmptyBuffer,

    #[error("frequency must be positive, got {0} Hz")]
    Frequency(f64),

    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },

    #[error("unsupported board version {0}")]
    BoardVersion(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error parsing TOML: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("error writing TOML: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Returns `Ok(value)` if `value` is strictly positive (and not NaN).
pub fn positive(name: &'static str, value: f64) -> Result<f64> {
    if value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::NonPositive { name, value })
    }
}
