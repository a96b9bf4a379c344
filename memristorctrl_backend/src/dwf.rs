//! Minimal wrapper for the parts of the Digilent WaveForms C library (`libdwf`) used by the control
//! loops.
//!
//! [`DwfInstrument`] owns one open device handle and implements [`Instrument`] on top of the
//! analog-out, analog-in and digital-I/O instruments:
//!
//! | [`Instrument`] call            | WaveForms functions                                        |
//! |--------------------------------|------------------------------------------------------------|
//! | `start_waveform_output`        | `FDwfAnalogOutNode*Set`, `FDwfAnalogOutRunSet`, `Configure`|
//! | `arm_capture`                  | `FDwfAnalogInChannel*Set`, `FDwfAnalogInTrigger*Set`       |
//! | `poll_capture_status`          | `FDwfAnalogInStatus`                                       |
//! | `read_valid_sample_count`      | `FDwfAnalogInStatusSamplesValid`                           |
//! | `read_channel_samples`         | `FDwfAnalogInStatusData`                                   |
//! | `set_digital_output_state`     | `FDwfDigitalIOOutput*Set`, `FDwfDigitalIOConfigure`        |
//!
//! Every C call goes through [`dwf_call`], which turns a failed call into
//! [`InstrumentError::Driver`] carrying the library's last error message. The device is closed when
//! the [`DwfInstrument`] is dropped.
//!
//! Only built with the `dwf` cargo feature; linking requires the WaveForms runtime.

use memristor_backend::pulse::FULL_SCALE_VOLTS;

use crate::instrument::*;
use crate::synapse::MUX_SHIFT;

type CInt = libc::c_int;
type CUint = libc::c_uint;
type CDouble = libc::c_double;
type CChar = libc::c_char;
type CUchar = libc::c_uchar;
type Hdwf = CInt;

const HDWF_NONE: Hdwf = 0;
const ERROR_MSG_LEN: usize = 512;

const ANALOG_OUT_NODE_CARRIER: CInt = 0;
const FUNC_CUSTOM: CUchar = 30;

const TRIGSRC_DETECTOR_ANALOG_IN: CUchar = 2;
const TRIGSRC_ANALOG_OUT1: CUchar = 7;
const TRIGTYPE_EDGE: CInt = 0;
const TRIGSLOPE_RISE: CInt = 0;
const TRIGSLOPE_FALL: CInt = 1;

const DWF_STATE_ARMED: CUchar = 1;
const DWF_STATE_DONE: CUchar = 2;
const DWF_STATE_TRIGGERED: CUchar = 3;

/// Digital lines driven by the synapse mux.
const MUX_OUTPUT_MASK: CUint = 0xFF << MUX_SHIFT;

#[link(name = "dwf")]
extern "C" {
    fn FDwfGetLastErrorMsg(szError: *mut CChar) -> CInt;

    fn FDwfDeviceOpen(idxDevice: CInt, phdwf: *mut Hdwf) -> CInt;
    fn FDwfDeviceClose(hdwf: Hdwf) -> CInt;
    fn FDwfDeviceAutoConfigureSet(hdwf: Hdwf, fAutoConfigure: CInt) -> CInt;

    fn FDwfAnalogOutNodeEnableSet(hdwf: Hdwf, idxChannel: CInt, node: CInt, fEnable: CInt) -> CInt;
    fn FDwfAnalogOutNodeFunctionSet(hdwf: Hdwf, idxChannel: CInt, node: CInt, func: CUchar) -> CInt;
    fn FDwfAnalogOutNodeFrequencySet(hdwf: Hdwf, idxChannel: CInt, node: CInt, hzFrequency: CDouble) -> CInt;
    fn FDwfAnalogOutNodeAmplitudeSet(hdwf: Hdwf, idxChannel: CInt, node: CInt, vAmplitude: CDouble) -> CInt;
    fn FDwfAnalogOutNodeOffsetSet(hdwf: Hdwf, idxChannel: CInt, node: CInt, vOffset: CDouble) -> CInt;
    fn FDwfAnalogOutNodePhaseSet(hdwf: Hdwf, idxChannel: CInt, node: CInt, degreePhase: CDouble) -> CInt;
    fn FDwfAnalogOutNodeDataSet(
        hdwf: Hdwf,
        idxChannel: CInt,
        node: CInt,
        rgdData: *const CDouble,
        cdData: CInt,
    ) -> CInt;
    fn FDwfAnalogOutRunSet(hdwf: Hdwf, idxChannel: CInt, secRun: CDouble) -> CInt;
    fn FDwfAnalogOutRepeatSet(hdwf: Hdwf, idxChannel: CInt, cRepeat: CInt) -> CInt;
    fn FDwfAnalogOutConfigure(hdwf: Hdwf, idxChannel: CInt, fStart: CInt) -> CInt;

    fn FDwfAnalogInFrequencySet(hdwf: Hdwf, hzFrequency: CDouble) -> CInt;
    fn FDwfAnalogInBufferSizeSet(hdwf: Hdwf, nSize: CInt) -> CInt;
    fn FDwfAnalogInChannelEnableSet(hdwf: Hdwf, idxChannel: CInt, fEnable: CInt) -> CInt;
    fn FDwfAnalogInChannelRangeSet(hdwf: Hdwf, idxChannel: CInt, voltsRange: CDouble) -> CInt;
    fn FDwfAnalogInTriggerSourceSet(hdwf: Hdwf, trigsrc: CUchar) -> CInt;
    fn FDwfAnalogInTriggerTypeSet(hdwf: Hdwf, trigtype: CInt) -> CInt;
    fn FDwfAnalogInTriggerChannelSet(hdwf: Hdwf, idxChannel: CInt) -> CInt;
    fn FDwfAnalogInTriggerLevelSet(hdwf: Hdwf, voltsLevel: CDouble) -> CInt;
    fn FDwfAnalogInTriggerConditionSet(hdwf: Hdwf, trigcond: CInt) -> CInt;
    fn FDwfAnalogInTriggerPositionSet(hdwf: Hdwf, secPosition: CDouble) -> CInt;
    fn FDwfAnalogInConfigure(hdwf: Hdwf, fReconfigure: CInt, fStart: CInt) -> CInt;
    fn FDwfAnalogInStatus(hdwf: Hdwf, fReadData: CInt, psts: *mut CUchar) -> CInt;
    fn FDwfAnalogInStatusSamplesValid(hdwf: Hdwf, pcSamplesValid: *mut CInt) -> CInt;
    fn FDwfAnalogInStatusData(hdwf: Hdwf, idxChannel: CInt, rgdVoltData: *mut CDouble, cdData: CInt) -> CInt;

    fn FDwfDigitalIOOutputEnableSet(hdwf: Hdwf, fsOutputEnable: CUint) -> CInt;
    fn FDwfDigitalIOOutputSet(hdwf: Hdwf, fsOutput: CUint) -> CInt;
    fn FDwfDigitalIOConfigure(hdwf: Hdwf) -> CInt;
}

/// Calls a WaveForms C-function and converts a failure into [`InstrumentError::Driver`].
///
/// WaveForms functions return a C `BOOL`: zero on failure, in which case the library's last error
/// message is fetched and logged.
///
/// ```ignore
/// dwf_call("FDwfDeviceClose", || unsafe { FDwfDeviceClose(hdwf) })?;
/// ```
pub fn dwf_call<F: FnOnce() -> CInt>(call: &'static str, func: F) -> Result<()> {
    if func() != 0 {
        return Ok(());
    }
    let mut err_buff = [0 as CChar; ERROR_MSG_LEN];
    unsafe {
        FDwfGetLastErrorMsg(err_buff.as_mut_ptr());
    }
    let message = unsafe { std::ffi::CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .trim()
        .to_string();
    log::error!("WaveForms error in {}: {}", call, message);
    Err(InstrumentError::Driver { call, message })
}

fn out_index(channel: WaveformChannel) -> CInt {
    match channel {
        WaveformChannel::W1 => 0,
        WaveformChannel::W2 => 1,
    }
}

fn in_index(channel: ScopeChannel) -> CInt {
    match channel {
        ScopeChannel::Ch1 => 0,
        ScopeChannel::Ch2 => 1,
    }
}

/// An open WaveForms device.
pub struct DwfInstrument {
    hdwf: Hdwf,
}

impl DwfInstrument {
    /// Opens the first available device.
    pub fn open() -> Result<Self> {
        Self::open_index(-1)
    }

    pub fn open_index(index: i32) -> Result<Self> {
        let mut hdwf: Hdwf = HDWF_NONE;
        dwf_call("FDwfDeviceOpen", || unsafe { FDwfDeviceOpen(index, &mut hdwf) })?;
        if hdwf == HDWF_NONE {
            return Err(InstrumentError::NotConnected);
        }
        let instrument = DwfInstrument { hdwf };
        // Settings are applied by the explicit Configure calls
        dwf_call("FDwfDeviceAutoConfigureSet", || unsafe {
            FDwfDeviceAutoConfigureSet(instrument.hdwf, 0)
        })?;
        log::info!("Opened WaveForms device {}", hdwf);
        Ok(instrument)
    }
}

impl Instrument for DwfInstrument {
    fn start_waveform_output(
        &mut self,
        channel: WaveformChannel,
        frequency: f64,
        phase: f64,
        pulse_count: usize,
        samples: &[f64],
    ) -> Result<()> {
        let (h, idx, node) = (self.hdwf, out_index(channel), ANALOG_OUT_NODE_CARRIER);
        dwf_call("FDwfAnalogOutNodeEnableSet", || unsafe { FDwfAnalogOutNodeEnableSet(h, idx, node, 1) })?;
        dwf_call("FDwfAnalogOutNodeFunctionSet", || unsafe {
            FDwfAnalogOutNodeFunctionSet(h, idx, node, FUNC_CUSTOM)
        })?;
        dwf_call("FDwfAnalogOutNodeFrequencySet", || unsafe {
            FDwfAnalogOutNodeFrequencySet(h, idx, node, frequency)
        })?;
        dwf_call("FDwfAnalogOutNodeAmplitudeSet", || unsafe {
            FDwfAnalogOutNodeAmplitudeSet(h, idx, node, FULL_SCALE_VOLTS)
        })?;
        dwf_call("FDwfAnalogOutNodeOffsetSet", || unsafe { FDwfAnalogOutNodeOffsetSet(h, idx, node, 0.0) })?;
        dwf_call("FDwfAnalogOutNodePhaseSet", || unsafe { FDwfAnalogOutNodePhaseSet(h, idx, node, phase) })?;
        dwf_call("FDwfAnalogOutNodeDataSet", || unsafe {
            FDwfAnalogOutNodeDataSet(h, idx, node, samples.as_ptr(), samples.len() as CInt)
        })?;
        dwf_call("FDwfAnalogOutRunSet", || unsafe {
            FDwfAnalogOutRunSet(h, idx, pulse_count as f64 / frequency)
        })?;
        dwf_call("FDwfAnalogOutRepeatSet", || unsafe { FDwfAnalogOutRepeatSet(h, idx, 1) })?;
        dwf_call("FDwfAnalogOutConfigure", || unsafe { FDwfAnalogOutConfigure(h, idx, 1) })
    }

    fn stop_waveform_output(&mut self, channel: WaveformChannel) -> Result<()> {
        let (h, idx) = (self.hdwf, out_index(channel));
        dwf_call("FDwfAnalogOutConfigure", || unsafe { FDwfAnalogOutConfigure(h, idx, 0) })
    }

    fn arm_capture(&mut self, config: &CaptureConfig) -> Result<()> {
        let h = self.hdwf;
        dwf_call("FDwfAnalogInFrequencySet", || unsafe {
            FDwfAnalogInFrequencySet(h, config.sample_frequency)
        })?;
        dwf_call("FDwfAnalogInBufferSizeSet", || unsafe {
            FDwfAnalogInBufferSizeSet(h, config.buffer_size as CInt)
        })?;
        for idx in [ScopeChannel::Ch1, ScopeChannel::Ch2].map(in_index) {
            dwf_call("FDwfAnalogInChannelEnableSet", || unsafe { FDwfAnalogInChannelEnableSet(h, idx, 1) })?;
            dwf_call("FDwfAnalogInChannelRangeSet", || unsafe {
                FDwfAnalogInChannelRangeSet(h, idx, config.input_range)
            })?;
        }
        match config.trigger {
            TriggerSpec::WaveformStart(channel) => {
                let source = TRIGSRC_ANALOG_OUT1 + out_index(channel) as CUchar;
                dwf_call("FDwfAnalogInTriggerSourceSet", || unsafe { FDwfAnalogInTriggerSourceSet(h, source) })?;
            }
            TriggerSpec::Level { channel, level } => {
                let slope = if level >= 0.0 { TRIGSLOPE_RISE } else { TRIGSLOPE_FALL };
                dwf_call("FDwfAnalogInTriggerSourceSet", || unsafe {
                    FDwfAnalogInTriggerSourceSet(h, TRIGSRC_DETECTOR_ANALOG_IN)
                })?;
                dwf_call("FDwfAnalogInTriggerTypeSet", || unsafe { FDwfAnalogInTriggerTypeSet(h, TRIGTYPE_EDGE) })?;
                dwf_call("FDwfAnalogInTriggerChannelSet", || unsafe {
                    FDwfAnalogInTriggerChannelSet(h, in_index(channel))
                })?;
                dwf_call("FDwfAnalogInTriggerLevelSet", || unsafe { FDwfAnalogInTriggerLevelSet(h, level) })?;
                dwf_call("FDwfAnalogInTriggerConditionSet", || unsafe {
                    FDwfAnalogInTriggerConditionSet(h, slope)
                })?;
            }
        }
        // Trigger position is relative to the buffer center; place the trigger at the first sample
        let position = config.buffer_size as f64 / (2.0 * config.sample_frequency);
        dwf_call("FDwfAnalogInTriggerPositionSet", || unsafe { FDwfAnalogInTriggerPositionSet(h, position) })?;
        dwf_call("FDwfAnalogInConfigure", || unsafe { FDwfAnalogInConfigure(h, 1, 1) })
    }

    fn poll_capture_status(&mut self) -> Result<CaptureStatus> {
        let mut state: CUchar = 0;
        let h = self.hdwf;
        dwf_call("FDwfAnalogInStatus", || unsafe { FDwfAnalogInStatus(h, 1, &mut state) })?;
        Ok(match state {
            DWF_STATE_DONE => CaptureStatus::Done,
            DWF_STATE_ARMED | DWF_STATE_TRIGGERED => CaptureStatus::Armed,
            _ => CaptureStatus::Idle,
        })
    }

    fn read_valid_sample_count(&mut self) -> Result<usize> {
        let mut count: CInt = 0;
        let h = self.hdwf;
        dwf_call("FDwfAnalogInStatusSamplesValid", || unsafe {
            FDwfAnalogInStatusSamplesValid(h, &mut count)
        })?;
        Ok(count.max(0) as usize)
    }

    fn read_channel_samples(&mut self, channel: ScopeChannel, count: usize) -> Result<Vec<f64>> {
        let mut data = vec![0.0; count];
        let h = self.hdwf;
        dwf_call("FDwfAnalogInStatusData", || unsafe {
            FDwfAnalogInStatusData(h, in_index(channel), data.as_mut_ptr(), count as CInt)
        })?;
        Ok(data)
    }

    fn stop_capture(&mut self) -> Result<()> {
        let h = self.hdwf;
        dwf_call("FDwfAnalogInConfigure", || unsafe { FDwfAnalogInConfigure(h, 0, 0) })
    }

    fn set_digital_output_state(&mut self, bits: u32) -> Result<()> {
        let h = self.hdwf;
        dwf_call("FDwfDigitalIOOutputEnableSet", || unsafe {
            FDwfDigitalIOOutputEnableSet(h, MUX_OUTPUT_MASK)
        })?;
        dwf_call("FDwfDigitalIOOutputSet", || unsafe { FDwfDigitalIOOutputSet(h, bits & MUX_OUTPUT_MASK) })?;
        dwf_call("FDwfDigitalIOConfigure", || unsafe { FDwfDigitalIOConfigure(h) })
    }
}

impl Drop for DwfInstrument {
    fn drop(&mut self) {
        let h = self.hdwf;
        if dwf_call("FDwfDeviceClose", || unsafe { FDwfDeviceClose(h) }).is_err() {
            log::warn!("Closing WaveForms device {} failed", h);
        }
    }
}
