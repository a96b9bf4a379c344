//! Background execution of a controller.
//!
//! A controller owns the instrument for as long as it runs, so it is moved into a dedicated thread
//! and handed back through [`Worker::join`] or [`Worker::stop`]. Events are streamed over an
//! unbounded `crossbeam` channel, so a slow consumer never stalls an acquisition. Dropping a
//! running worker cancels it and waits for the thread to finish its cleanup.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;

use crate::instrument::Instrument;
use crate::program::{ProgramEvent, ProgramStatus, ProgrammingController};
use crate::run_token::RunToken;
use crate::sequencer::AcquisitionError;
use crate::synapse::{InitReport, Instruction, SynapseController, SynapseEvent, SynapseReading};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    #[error("worker {0} panicked")]
    Panicked(String),
}

/// A controller handed back by a finished worker, with the result of its run.
pub struct Finished<C, R> {
    pub controller: C,
    pub result: Result<R, AcquisitionError>,
}

pub struct Worker<E, T> {
    name: String,
    events: Receiver<E>,
    token: RunToken,
    handle: Option<JoinHandle<T>>,
}

impl<E: Send + 'static, T: Send + 'static> Worker<E, T> {
    /// Runs `job` on a named thread. `token` must be the one the job's controller checks.
    pub fn spawn<F>(name: &str, token: RunToken, job: F) -> Result<Self, WorkerError>
    where
        F: FnOnce(Sender<E>) -> T + Send + 'static,
    {
        let (sender, events) = unbounded();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || job(sender))
            .map_err(|source| WorkerError::Spawn {
                name: name.to_string(),
                source,
            })?;
        log::debug!("Worker {} started", name);
        Ok(Worker {
            name: name.to_string(),
            events,
            token,
            handle: Some(handle),
        })
    }
}

impl<E, T> Worker<E, T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &Receiver<E> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancels the run and waits for the controller to come back.
    pub fn stop(mut self) -> Result<T, WorkerError> {
        self.token.cancel();
        self.join_inner()
    }

    /// Waits for the run to end on its own.
    pub fn join(mut self) -> Result<T, WorkerError> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<T, WorkerError> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| WorkerError::Panicked(self.name.clone()))?;
        let result = handle
            .join()
            .map_err(|_| WorkerError::Panicked(self.name.clone()));
        log::debug!("Worker {} joined", self.name);
        result
    }
}

impl<E, T> Drop for Worker<E, T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.token.cancel();
            if self.join_inner().is_err() {
                log::warn!("Worker {} panicked while stopping", self.name);
            }
        }
    }
}

pub type ProgramWorker<I> = Worker<ProgramEvent, Finished<ProgrammingController<I>, ProgramStatus>>;

/// Runs the programming loop until it converges, fails or is stopped.
pub fn spawn_programming<I>(mut controller: ProgrammingController<I>) -> Result<ProgramWorker<I>, WorkerError>
where
    I: Instrument + Send + 'static,
{
    let token = controller.token().clone();
    Worker::spawn("programming", token, move |events| {
        let result = controller.run(|event| {
            let _ = events.send(event.clone());
        });
        Finished { controller, result }
    })
}

pub type SynapseInitWorker<I> = Worker<SynapseEvent, Finished<SynapseController<I>, InitReport>>;

pub fn spawn_synapse_init<I>(mut controller: SynapseController<I>) -> Result<SynapseInitWorker<I>, WorkerError>
where
    I: Instrument + Send + 'static,
{
    let token = controller.token().clone();
    Worker::spawn("synapse-init", token, move |events| {
        let result = controller.initialize(|event| {
            let _ = events.send(event.clone());
        });
        Finished { controller, result }
    })
}

pub type SynapseMonitorWorker<I> = Worker<SynapseReading, Finished<SynapseController<I>, ()>>;

/// Executes `instruction` once, then streams a reading every sample period until stopped.
pub fn spawn_synapse_monitor<I>(
    mut controller: SynapseController<I>,
    instruction: Option<Instruction>,
) -> Result<SynapseMonitorWorker<I>, WorkerError>
where
    I: Instrument + Send + 'static,
{
    let token = controller.token().clone();
    Worker::spawn("synapse-monitor", token, move |events| {
        let result = match controller.monitor(instruction, |reading| {
            let _ = events.send(reading);
        }) {
            Err(e) if e.is_interrupted() => Ok(()),
            other => other,
        };
        Finished { controller, result }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use crate::probe::Probe;
    use crate::sim::{SimConfig, SimulatedInstrument};
    use memristor_backend::config::{AcquisitionConfig, ProgramConfig, ProgramMode, SynapseConfig};
    use memristor_backend::postprocess::Units;
    use memristor_backend::resistance::BoardConfig;

    fn probe() -> Probe {
        Probe::new(BoardConfig::default(), AcquisitionConfig::default(), Units::default()).unwrap()
    }

    mod spawn {
        use super::*;

        #[test]
        fn joins_with_result() {
            let worker: Worker<usize, usize> = Worker::spawn("count", RunToken::new(), |events| {
                for i in 0..3 {
                    events.send(i).unwrap();
                }
                3
            })
            .unwrap();
            assert_eq!(worker.join().unwrap(), 3);
        }

        #[test]
        fn panic_is_reported() {
            let worker: Worker<(), ()> =
                Worker::spawn("boom", RunToken::new(), |_| panic!("boom")).unwrap();
            assert!(matches!(worker.join(), Err(WorkerError::Panicked(_))));
        }
    }

    mod programming {
        use super::*;

        #[test]
        fn streams_events_until_converged() {
            let controller = ProgrammingController::new(
                SimulatedInstrument::new(SimConfig::default().with_initial_resistance(20_000.0)),
                probe(),
                ProgramConfig {
                    sample_period_s: 0.0,
                    ..ProgramConfig::default()
                },
                RunToken::new(),
            )
            .unwrap();
            let worker = spawn_programming(controller).unwrap();
            let finished = worker.join().unwrap();
            assert_eq!(finished.result.unwrap(), ProgramStatus::Converged);
            assert_eq!(finished.controller.status(), ProgramStatus::Converged);
        }

        #[test]
        fn stop_hands_back_controller() {
            let controller = ProgrammingController::new(
                SimulatedInstrument::new(SimConfig::default()),
                probe(),
                ProgramConfig {
                    mode: ProgramMode::ReadOnly,
                    sample_period_s: 0.05,
                    ..ProgramConfig::default()
                },
                RunToken::new(),
            )
            .unwrap();
            let worker = spawn_programming(controller).unwrap();
            let first = worker.events().recv_timeout(Duration::from_secs(10)).unwrap();
            assert_eq!(first.iteration, 0);
            let finished = worker.stop().unwrap();
            assert_eq!(finished.result.unwrap(), ProgramStatus::Cancelled);
            assert!(finished.controller.instrument().pulse_trains() >= 1);
        }
    }

    mod synapse {
        use super::*;

        #[test]
        fn monitor_until_stopped() {
            let controller = SynapseController::new(
                SimulatedInstrument::new(SimConfig::default()),
                probe(),
                SynapseConfig {
                    sample_period_s: 0.01,
                    ..SynapseConfig::default()
                },
                RunToken::new(),
            );
            let worker = spawn_synapse_monitor(controller, Some(Instruction::DriveAUp)).unwrap();
            for _ in 0..2 {
                let reading = worker.events().recv_timeout(Duration::from_secs(10)).unwrap();
                assert!(reading.ga > reading.gb);
            }
            let finished = worker.stop().unwrap();
            assert!(finished.result.is_ok());
        }
    }
}
