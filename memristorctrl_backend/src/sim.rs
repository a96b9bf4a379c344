//! An in-process [`Instrument`] wired to simulated memristors.
//!
//! Playing a waveform integrates the measurement circuit sample by sample:
//!
//! - The sensed node charges through `R || Rs` into the oscilloscope's input capacitance. It is
//!   updated with the exact exponential step, so read voltages match the RC model.
//! - Each device integrates `d ln R / dt = -sign(v) * rate * (|v| - threshold)` whenever its
//!   voltage exceeds the threshold. Forward voltage lowers the resistance and reverse voltage
//!   raises it, and the result is bounded to `[r_on, r_off]`.
//!
//! The digital outputs select the device through the synapse mux (see
//! [`crate::synapse::MuxState`]). Route `Y` places both devices in series with opposite
//! orientation, so a pulse on `Y` pushes their conductances apart. Route `None` addresses device `A`,
//! as on a board without a mux.
//!
//! A [`TriggerSpec::WaveformStart`] capture records from the first sample of the train. A
//! [`TriggerSpec::Level`] capture records from the first sample where the trigger channel reaches
//! the level, and never completes when the level is not reached.
//!
//! Stalls can be injected (`arm_delay_polls`, `never_done`), and every cleanup call is counted for
//! tests.

use indexmap::IndexMap;

use memristor_backend::pulse::FULL_SCALE_VOLTS;
use memristor_backend::resistance::{BoardConfig, BoardVersion};

use crate::instrument::*;
use crate::synapse::{MuxRoute, MuxState};

/// Samples per pulse used when a waveform plays without a capture armed.
const FREE_RUN_SAMPLES_PER_PULSE: f64 = 200.0;

#[derive(Clone, Debug, PartialEq)]
pub struct MemristorModel {
    /// Ohms.
    pub resistance: f64,
    pub r_on: f64,
    pub r_off: f64,
    /// Volts below which the device does not switch.
    pub threshold_voltage: f64,
    /// Change of `ln R` per volt above threshold per second.
    pub switching_rate: f64,
}

impl MemristorModel {
    pub fn new(resistance: f64) -> Self {
        MemristorModel {
            resistance,
            ..Default::default()
        }
    }

    pub fn conductance(&self) -> f64 {
        1.0 / self.resistance
    }

    fn log_step(&self, voltage: f64, dt: f64) -> f64 {
        let overdrive = voltage.abs() - self.threshold_voltage;
        if overdrive > 0.0 {
            -voltage.signum() * self.switching_rate * overdrive * dt
        } else {
            0.0
        }
    }

    fn apply_log_step(&mut self, delta: f64) {
        if delta != 0.0 {
            self.resistance = (self.resistance.ln() + delta).exp().clamp(self.r_on, self.r_off);
        }
    }
}

impl Default for MemristorModel {
    fn default() -> Self {
        MemristorModel {
            resistance: 20_000.0,
            r_on: 1_000.0,
            r_off: 100_000.0,
            threshold_voltage: 0.5,
            switching_rate: 6_000.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimConfig {
    pub board_version: BoardVersion,
    pub series_resistance: f64,
    pub parasitic_capacitance: f64,
    pub device_a: MemristorModel,
    pub device_b: MemristorModel,
    /// Status polls reporting `Idle` before the capture arms.
    pub arm_delay_polls: usize,
    /// The capture never reports `Done`.
    pub never_done: bool,
}

impl SimConfig {
    /// Circuit matching `board`, with default devices.
    pub fn from_board(board: &BoardConfig) -> Self {
        SimConfig {
            board_version: board.board_version,
            series_resistance: board.series_resistance,
            parasitic_capacitance: board.parasitic_read_capacitance,
            ..Default::default()
        }
    }

    pub fn with_initial_resistance(mut self, resistance: f64) -> Self {
        self.device_a.resistance = resistance;
        self.device_b.resistance = resistance;
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        let board = BoardConfig::default();
        SimConfig {
            board_version: board.board_version,
            series_resistance: board.series_resistance,
            parasitic_capacitance: board.parasitic_read_capacitance,
            device_a: MemristorModel::default(),
            device_b: MemristorModel::default(),
            arm_delay_polls: 0,
            never_done: false,
        }
    }
}

struct PlayedWaveform {
    frequency: f64,
    pulse_count: usize,
    samples: Vec<f64>,
}

impl PlayedWaveform {
    fn value(&self, t: f64) -> f64 {
        if self.samples.is_empty() || t >= self.pulse_count as f64 / self.frequency {
            return 0.0;
        }
        let phase = (t * self.frequency).fract();
        let idx = ((phase * self.samples.len() as f64) as usize).min(self.samples.len() - 1);
        self.samples[idx] * FULL_SCALE_VOLTS
    }

    fn duration(&self) -> f64 {
        self.pulse_count as f64 / self.frequency
    }
}

pub struct SimulatedInstrument {
    config: SimConfig,
    devices: IndexMap<MuxRoute, MemristorModel>,
    digital_state: u32,
    capture: Option<CaptureConfig>,
    last_trigger: Option<TriggerSpec>,
    arm_polls_left: usize,
    armed: bool,
    waveform_started: bool,
    captured: Option<(Vec<f64>, Vec<f64>)>,
    arm_polls: usize,
    capture_polls: usize,
    pulse_trains: usize,
    stop_waveform_calls: usize,
    stop_capture_calls: usize,
}

impl SimulatedInstrument {
    pub fn new(config: SimConfig) -> Self {
        let mut devices = IndexMap::new();
        devices.insert(MuxRoute::A, config.device_a.clone());
        devices.insert(MuxRoute::B, config.device_b.clone());
        log::info!(
            "Simulated instrument on board {} (Rs = {} ohm), devices A = {} ohm, B = {} ohm",
            config.board_version,
            config.series_resistance,
            config.device_a.resistance,
            config.device_b.resistance
        );
        SimulatedInstrument {
            config,
            devices,
            digital_state: 0,
            capture: None,
            last_trigger: None,
            arm_polls_left: 0,
            armed: false,
            waveform_started: false,
            captured: None,
            arm_polls: 0,
            capture_polls: 0,
            pulse_trains: 0,
            stop_waveform_calls: 0,
            stop_capture_calls: 0,
        }
    }

    pub fn device(&self, route: MuxRoute) -> Option<&MemristorModel> {
        self.devices.get(&route)
    }

    /// Resistance of device `A`, the device addressed without a mux.
    pub fn resistance(&self) -> f64 {
        self.devices[&MuxRoute::A].resistance
    }

    pub fn set_resistance(&mut self, route: MuxRoute, resistance: f64) {
        if let Some(device) = self.devices.get_mut(&route) {
            device.resistance = resistance;
        }
    }

    pub fn digital_state(&self) -> u32 {
        self.digital_state
    }
    /// Trigger of the most recently armed capture.
    pub fn last_trigger(&self) -> Option<TriggerSpec> {
        self.last_trigger
    }
    pub fn arm_polls(&self) -> usize {
        self.arm_polls
    }
    /// Status polls made after the waveform started.
    pub fn capture_polls(&self) -> usize {
        self.capture_polls
    }
    pub fn pulse_trains(&self) -> usize {
        self.pulse_trains
    }
    pub fn stop_waveform_calls(&self) -> usize {
        self.stop_waveform_calls
    }
    pub fn stop_capture_calls(&self) -> usize {
        self.stop_capture_calls
    }

    fn route(&self) -> MuxRoute {
        match MuxState::from_digital_state(self.digital_state).w1 {
            MuxRoute::None => MuxRoute::A,
            route => route,
        }
    }

    /// Integrates the circuit over the pulse train, records the capture window and applies the
    /// accumulated switching to the devices.
    ///
    /// Returns the triggered window, or `None` when no capture is armed or its trigger never fired.
    fn play(&mut self, waveform: &PlayedWaveform) -> Option<(Vec<f64>, Vec<f64>)> {
        let (sample_frequency, window, trigger) = match &self.capture {
            Some(capture) => (capture.sample_frequency, capture.buffer_size, Some(capture.trigger)),
            None => (waveform.frequency * FREE_RUN_SAMPLES_PER_PULSE, 0, None),
        };
        let dt = 1.0 / sample_frequency;
        let train = (waveform.duration() * sample_frequency).ceil() as usize;
        // A level trigger may fire on the last sample of the train
        let steps = match trigger {
            Some(TriggerSpec::Level { .. }) => train + window,
            _ => window.max(train),
        };

        let board = self.config.board_version;
        let rs = self.config.series_resistance;
        let c = self.config.parasitic_capacitance;
        let route = self.route();
        let ra = self.devices[&MuxRoute::A].resistance;
        let rb = self.devices[&MuxRoute::B].resistance;

        let recorded = if window > 0 { steps } else { 0 };
        let mut v1 = Vec::with_capacity(recorded);
        let mut v2 = Vec::with_capacity(recorded);
        let mut sensed = 0.0;
        let mut delta_a = 0.0;
        let mut delta_b = 0.0;

        for k in 0..steps {
            let vin = waveform.value(k as f64 * dt);
            // Drive seen in the devices' own orientation
            let drive = board.drive_amplitude(vin);

            let (driven, sensed_now) = match route {
                MuxRoute::Y => {
                    let v_a = drive * ra / (ra + rb);
                    let v_b = -drive * rb / (ra + rb);
                    delta_a += self.devices[&MuxRoute::A].log_step(v_a, dt);
                    delta_b += self.devices[&MuxRoute::B].log_step(v_b, dt);
                    (vin, vin * rb / (ra + rb))
                }
                _ => {
                    let r = if route == MuxRoute::B { rb } else { ra };
                    let v_device = match board {
                        BoardVersion::V1 => vin - sensed,
                        BoardVersion::V2 => -sensed,
                    };
                    let delta = self.devices[&route].log_step(v_device, dt);
                    if route == MuxRoute::B {
                        delta_b += delta;
                    } else {
                        delta_a += delta;
                    }

                    let target = match board {
                        BoardVersion::V1 => vin * rs / (r + rs),
                        BoardVersion::V2 => vin * r / (r + rs),
                    };
                    let tau = r * rs / (r + rs) * c;
                    let now = sensed;
                    sensed = target + (sensed - target) * (-dt / tau).exp();
                    (vin, now)
                }
            };

            if k < recorded {
                match board {
                    BoardVersion::V1 => {
                        v1.push(driven);
                        v2.push(sensed_now);
                    }
                    BoardVersion::V2 => {
                        v1.push(sensed_now);
                        v2.push(driven);
                    }
                }
            }
        }

        if let Some(device) = self.devices.get_mut(&MuxRoute::A) {
            device.apply_log_step(delta_a);
        }
        if let Some(device) = self.devices.get_mut(&MuxRoute::B) {
            device.apply_log_step(delta_b);
        }
        log::trace!(
            "Played {} pulses on route {:?}: A = {:.1} ohm, B = {:.1} ohm",
            waveform.pulse_count,
            route,
            self.devices[&MuxRoute::A].resistance,
            self.devices[&MuxRoute::B].resistance
        );

        let start = match trigger? {
            TriggerSpec::WaveformStart(_) => 0,
            TriggerSpec::Level { channel, level } => {
                let data = match channel {
                    ScopeChannel::Ch1 => &v1,
                    ScopeChannel::Ch2 => &v2,
                };
                let position = data.iter().position(|v| level_reached(*v, level));
                if position.is_none() {
                    log::debug!("Level trigger at {} V on {} never fired", level, channel);
                }
                position?
            }
        };
        let end = (start + window).min(v1.len());
        Some((v1[start..end].to_vec(), v2[start..end].to_vec()))
    }
}

fn level_reached(value: f64, level: f64) -> bool {
    if level >= 0.0 {
        value >= level
    } else {
        value <= level
    }
}

impl Instrument for SimulatedInstrument {
    fn start_waveform_output(
        &mut self,
        _channel: WaveformChannel,
        frequency: f64,
        _phase: f64,
        pulse_count: usize,
        samples: &[f64],
    ) -> Result<()> {
        if !(frequency > 0.0) {
            return Err(InstrumentError::Driver {
                call: "start_waveform_output",
                message: format!("invalid frequency {}", frequency),
            });
        }
        let waveform = PlayedWaveform {
            frequency,
            pulse_count,
            samples: samples.to_vec(),
        };
        self.captured = self.play(&waveform);
        self.pulse_trains += 1;
        self.waveform_started = true;
        Ok(())
    }

    fn stop_waveform_output(&mut self, _channel: WaveformChannel) -> Result<()> {
        self.stop_waveform_calls += 1;
        self.waveform_started = false;
        Ok(())
    }

    fn arm_capture(&mut self, config: &CaptureConfig) -> Result<()> {
        self.capture = Some(*config);
        self.last_trigger = Some(config.trigger);
        self.arm_polls_left = self.config.arm_delay_polls;
        self.armed = false;
        self.captured = None;
        Ok(())
    }

    fn poll_capture_status(&mut self) -> Result<CaptureStatus> {
        if self.capture.is_none() {
            return Ok(CaptureStatus::Idle);
        }
        if !self.armed {
            self.arm_polls += 1;
            if self.arm_polls_left > 0 {
                self.arm_polls_left -= 1;
                return Ok(CaptureStatus::Idle);
            }
            self.armed = true;
            return Ok(CaptureStatus::Armed);
        }
        if !self.waveform_started {
            return Ok(CaptureStatus::Armed);
        }
        self.capture_polls += 1;
        if self.config.never_done || self.captured.is_none() {
            Ok(CaptureStatus::Armed)
        } else {
            Ok(CaptureStatus::Done)
        }
    }

    fn read_valid_sample_count(&mut self) -> Result<usize> {
        Ok(self.captured.as_ref().map_or(0, |(v1, _)| v1.len()))
    }

    fn read_channel_samples(&mut self, channel: ScopeChannel, count: usize) -> Result<Vec<f64>> {
        let (v1, v2) = self.captured.as_ref().ok_or(InstrumentError::SampleCount {
            requested: count,
            available: 0,
        })?;
        let data = match channel {
            ScopeChannel::Ch1 => v1,
            ScopeChannel::Ch2 => v2,
        };
        if count > data.len() {
            return Err(InstrumentError::SampleCount {
                requested: count,
                available: data.len(),
            });
        }
        Ok(data[..count].to_vec())
    }

    fn stop_capture(&mut self) -> Result<()> {
        self.stop_capture_calls += 1;
        self.capture = None;
        self.armed = false;
        Ok(())
    }

    fn set_digital_output_state(&mut self, bits: u32) -> Result<()> {
        self.digital_state = bits;
        Ok(())
    }
}
