use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use memristor_backend::config::{ProgramMode, SessionConfig};
use memristor_backend::pulse::{PulseShape, PulseSpec};
use memristor_backend::resistance::BoardConfig;
use memristorctrl_backend::{
    spawn_programming, spawn_synapse_init, spawn_synapse_monitor, Instruction, Instrument, Probe,
    ProgrammingController, RunToken, SynapseController,
};
#[cfg(feature = "dwf")]
use memristorctrl_backend::DwfInstrument;
#[cfg(not(feature = "dwf"))]
use memristorctrl_backend::{SimConfig, SimulatedInstrument};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML session file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Initial resistance of the simulated devices, in ohms.
    #[cfg(not(feature = "dwf"))]
    #[arg(long)]
    initial_resistance: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Program one device toward a target resistance.
    Program {
        /// Target resistance in ohms.
        #[arg(short, long)]
        target: Option<f64>,

        #[arg(short, long, value_enum)]
        mode: Option<Mode>,

        /// Stop after this many iterations.
        #[arg(long)]
        max_iterations: Option<usize>,
    },
    /// Initialize a differential-pair synapse, or monitor it.
    Synapse {
        /// Instruction executed before monitoring (FFLV, RHaup, RLadn, RLbup, RHbdn, FF_RA).
        #[arg(short, long)]
        instruction: Option<Instruction>,

        /// Monitor this many readings instead of initializing.
        #[arg(long)]
        monitor: Option<usize>,
    },
    /// Play a level-triggered pulse train and print its I-V and G-V series as CSV.
    Sweep {
        #[arg(short, long, default_value = "triangle")]
        shape: PulseShape,

        #[arg(short, long, default_value_t = 1.0, allow_hyphen_values = true)]
        amplitude: f64,

        /// Pulse width in nanoseconds.
        #[arg(short, long, default_value_t = 500_000.0)]
        pulse_width: f64,

        #[arg(short = 'n', long, default_value_t = 1)]
        pulses: usize,
    },
    /// Print a synthesized pulse train as CSV.
    Waveform {
        #[arg(short, long, default_value = "square")]
        shape: PulseShape,

        #[arg(short, long, default_value_t = 1.0, allow_hyphen_values = true)]
        amplitude: f64,

        /// Pulse width in nanoseconds.
        #[arg(short, long, default_value_t = 10_000.0)]
        pulse_width: f64,

        #[arg(short, long, default_value_t = 0.5)]
        duty_cycle: f64,

        #[arg(short = 'n', long, default_value_t = 1)]
        pulses: usize,

        #[arg(long, default_value_t = 200)]
        points: usize,

        /// Phase offset in degrees.
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        phase: f64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    ReadOnly,
    OneShot,
    Continuous,
}

impl From<Mode> for ProgramMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::ReadOnly => ProgramMode::ReadOnly,
            Mode::OneShot => ProgramMode::OneShot,
            Mode::Continuous => ProgramMode::Continuous,
        }
    }
}

type BoxedInstrument = Box<dyn Instrument + Send>;

#[cfg(feature = "dwf")]
fn open_instrument(_args: &Args, _board: &BoardConfig) -> Result<BoxedInstrument, Box<dyn Error>> {
    Ok(Box::new(DwfInstrument::open()?))
}

#[cfg(not(feature = "dwf"))]
fn open_instrument(args: &Args, board: &BoardConfig) -> Result<BoxedInstrument, Box<dyn Error>> {
    let mut sim = SimConfig::from_board(board);
    if let Some(resistance) = args.initial_resistance {
        sim = sim.with_initial_resistance(resistance);
    }
    Ok(Box::new(SimulatedInstrument::new(sim)))
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    match &args.command {
        Command::Waveform {
            shape,
            amplitude,
            pulse_width,
            duty_cycle,
            pulses,
            points,
            phase,
        } => {
            let spec = PulseSpec::new(*shape, *amplitude, *pulse_width, *duty_cycle)?.with_phase(*phase)?;
            let (time, values) = spec.preview(*pulses, *points);
            println!("time_s,amplitude_v");
            for (t, v) in time.iter().zip(values.iter()) {
                println!("{:e},{}", t, v);
            }
        }
        Command::Sweep {
            shape,
            amplitude,
            pulse_width,
            pulses,
        } => {
            let spec = PulseSpec::new(*shape, *amplitude, *pulse_width, 0.5)?;
            let mut instrument = open_instrument(&args, &config.board)?;
            let mut probe = Probe::new(config.board.clone(), config.acquisition.clone(), config.units)?;
            let sweep = probe.sweep(&mut instrument, &spec, *pulses, &RunToken::new())?;
            let trace = &sweep.trace;
            println!("time,v1_v,v2_v,device_voltage_v,current,conductance");
            for i in 0..trace.len() {
                println!(
                    "{},{},{},{},{},{}",
                    trace.time[i],
                    trace.v1[i],
                    trace.v2[i],
                    trace.device_voltage[i],
                    trace.current[i],
                    trace.conductance[i]
                );
            }
        }
        Command::Program {
            target,
            mode,
            max_iterations,
        } => {
            let mut program = config.program.clone();
            if let Some(target) = target {
                program.target_resistance = *target;
            }
            if let Some(mode) = mode {
                program.mode = (*mode).into();
            }
            let instrument = open_instrument(&args, &config.board)?;
            let probe = Probe::new(config.board.clone(), config.acquisition.clone(), config.units)?;
            let controller = ProgrammingController::new(instrument, probe, program, RunToken::new())?;
            let worker = spawn_programming(controller)?;

            println!("iteration,resistance_ohm,read_voltage_v,action,status");
            let mut seen = 0;
            for event in worker.events().iter() {
                println!(
                    "{},{},{},{},{}",
                    event.iteration, event.read.resistance, event.read.read_voltage, event.action, event.status
                );
                seen += 1;
                if max_iterations.map_or(false, |max| seen >= max) {
                    break;
                }
            }
            let finished = worker.stop()?;
            let status = finished.result?;
            log::info!("Programming ended: {}", status);
        }
        Command::Synapse {
            instruction,
            monitor,
        } => {
            let instrument = open_instrument(&args, &config.board)?;
            let probe = Probe::new(config.board.clone(), config.acquisition.clone(), config.units)?;
            let controller = SynapseController::new(instrument, probe, config.synapse.clone(), RunToken::new());
            match monitor {
                Some(count) => {
                    let worker = spawn_synapse_monitor(controller, *instruction)?;
                    println!("ga_s,gb_s,vy_v");
                    for reading in worker.events().iter().take(*count) {
                        println!("{},{},{}", reading.ga, reading.gb, reading.vy);
                    }
                    worker.stop()?.result?;
                }
                None => {
                    let finished = spawn_synapse_init(controller)?.join()?;
                    let report = finished.result?;
                    println!(
                        "success={} transitions={} quality={:.3} ga={:e} gb={:e}",
                        report.success(),
                        report.transitions,
                        report.quality,
                        report.reading.ga,
                        report.reading.gb
                    );
                }
            }
        }
    }
    Ok(())
}
