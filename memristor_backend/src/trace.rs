//! Raw and derived sample series of one acquisition cycle.

use ndarray::Array1;

/// Two oscilloscope channels captured together at `sample_frequency`.
///
/// Both channels always have the same length; [`CaptureTrace::new`] truncates the longer one.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureTrace {
    /// Samples per second.
    pub sample_frequency: f64,
    /// Seconds since the first captured sample.
    pub time: Array1<f64>,
    /// Volts.
    pub channel1: Array1<f64>,
    /// Volts.
    pub channel2: Array1<f64>,
}

impl CaptureTrace {
    pub fn new(sample_frequency: f64, channel1: Vec<f64>, channel2: Vec<f64>) -> Self {
        let len = channel1.len().min(channel2.len());
        if channel1.len() != channel2.len() {
            log::warn!(
                "Channel lengths differ ({} vs {}), keeping the first {} samples",
                channel1.len(),
                channel2.len(),
                len
            );
        }
        let mut channel1 = channel1;
        let mut channel2 = channel2;
        channel1.truncate(len);
        channel2.truncate(len);
        CaptureTrace {
            sample_frequency,
            time: Array1::from_iter((0..len).map(|i| i as f64 / sample_frequency)),
            channel1: Array1::from_vec(channel1),
            channel2: Array1::from_vec(channel2),
        }
    }

    pub fn len(&self) -> usize {
        self.channel1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel1.is_empty()
    }
}

/// Series derived from a trimmed [`CaptureTrace`], already scaled to display units.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DerivedTrace {
    pub time: Array1<f64>,
    pub v1: Array1<f64>,
    pub v2: Array1<f64>,
    pub device_voltage: Array1<f64>,
    pub current: Array1<f64>,
    /// Never negative.
    pub conductance: Array1<f64>,
}

impl DerivedTrace {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Largest conductance sample, or NaN for an empty trace.
    pub fn peak_conductance(&self) -> f64 {
        self.conductance
            .iter()
            .copied()
            .fold(f64::NAN, |acc, g| if acc.is_nan() || g > acc { g } else { acc })
    }
}
