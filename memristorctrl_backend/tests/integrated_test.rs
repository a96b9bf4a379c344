use std::time::Duration;

use memristor_backend::config::{ProgramMode, SessionConfig};
use memristor_backend::pulse::{PulseShape, PulseSpec};
use memristor_backend::resistance::BoardVersion;
use memristorctrl_backend::*;

fn session(toml: &str) -> SessionConfig {
    SessionConfig::from_toml_str(toml).unwrap()
}

fn probe(config: &SessionConfig) -> Probe {
    Probe::new(config.board.clone(), config.acquisition.clone(), config.units).unwrap()
}

#[test]
fn program_from_session_file() {
    let config = session(
        r#"
        [board]
        board_version = 2

        [program]
        target_resistance = 12000.0
        sample_period_s = 0.0
        "#,
    );
    assert_eq!(config.board.board_version, BoardVersion::V2);
    assert!(config.board.read_pulse_amplitude < 0.0);

    let sim = SimConfig::from_board(&config.board).with_initial_resistance(30_000.0);
    let mut controller =
        ProgrammingController::new(SimulatedInstrument::new(sim), probe(&config), config.program.clone(), RunToken::new())
            .unwrap();
    let mut events = Vec::new();
    let status = controller.run(|e| events.push(e.clone())).unwrap();

    assert_eq!(status, ProgramStatus::Converged);
    assert!(events[..events.len() - 1]
        .iter()
        .all(|e| e.action == ProgramAction::ForwardWrite));
    let last = events.last().unwrap();
    assert_eq!(last.action, ProgramAction::Converged);
    assert!(last.write.is_none());
    // Measured and simulated resistance agree
    let actual = controller.instrument().resistance();
    assert!((last.read.resistance - actual).abs() / actual < 1e-2);
    assert!(controller.step().unwrap().is_none());
}

#[test]
fn every_cycle_stops_outputs() {
    let config = session("[program]\nsample_period_s = 0.0\nmode = \"OneShot\"\n");
    assert_eq!(config.program.mode, ProgramMode::OneShot);
    let sim = SimConfig::from_board(&config.board).with_initial_resistance(5_000.0);
    let mut controller =
        ProgrammingController::new(SimulatedInstrument::new(sim), probe(&config), config.program.clone(), RunToken::new())
            .unwrap();
    assert_eq!(controller.run(|_| {}).unwrap(), ProgramStatus::OneShotDone);

    let sim = controller.into_instrument();
    assert_eq!(sim.pulse_trains(), 2);
    assert_eq!(sim.stop_waveform_calls(), 2);
    assert_eq!(sim.stop_capture_calls(), 2);
}

#[test]
fn synapse_init_in_background() {
    let config = session("");
    let controller = SynapseController::new(
        SimulatedInstrument::new(SimConfig::from_board(&config.board)),
        probe(&config),
        config.synapse.clone(),
        RunToken::new(),
    );
    let worker = spawn_synapse_init(controller).unwrap();
    let finished = worker.join().unwrap();
    let report = finished.result.unwrap();
    assert!(report.success());
    assert!(report.quality > 0.0 && report.quality <= 1.0);
}

#[test]
fn stop_programming_worker() {
    let config = session("[program]\nsample_period_s = 0.2\nmode = \"ReadOnly\"\n");
    let controller = ProgrammingController::new(
        SimulatedInstrument::new(SimConfig::from_board(&config.board)),
        probe(&config),
        config.program.clone(),
        RunToken::new(),
    )
    .unwrap();
    let worker = spawn_programming(controller).unwrap();
    let event = worker.events().recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(event.action, ProgramAction::ReadOnly);
    let finished = worker.stop().unwrap();
    assert_eq!(finished.result.unwrap(), ProgramStatus::Cancelled);
    assert_eq!(finished.controller.status(), ProgramStatus::Cancelled);
}

#[test]
fn triangle_sweep_switches_device() {
    let config = session("");
    let mut sim = SimulatedInstrument::new(SimConfig::from_board(&config.board));
    let spec = PulseSpec::new(PulseShape::Triangle, 1.0, 500_000.0, 0.5).unwrap();
    let sweep = probe(&config).sweep(&mut sim, &spec, 1, &RunToken::new()).unwrap();

    assert!(matches!(sim.last_trigger(), Some(TriggerSpec::Level { level, .. }) if level > 0.0));
    // The capture starts at the trigger level
    assert!(sweep.trace.v1[0] >= 0.02);
    assert!(sweep.trace.conductance.iter().all(|g| *g >= 0.0));
    assert!(sim.resistance() < 20_000.0);
}
