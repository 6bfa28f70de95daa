//! Orchestrator on its own control thread
//!
//! Mode switches block for the whole teardown and rebuild, so UI and network
//! callers hand commands to this thread and wait for (or await) the reply.

use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{error, info};

use super::orchestrator::{
    Command, Outcome, PhotoProgress, PipelineOrchestrator, PipelineState, RecordStatus,
};
use crate::error::{PipelineError, Result};

/// Snapshot returned by [`OrchestratorClient::status`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    pub state: PipelineState,
    pub record: RecordStatus,
    pub photo: Option<PhotoProgress>,
}

enum Request {
    Command(Command, Sender<Result<Outcome>>),
    Status(Sender<StatusReport>),
    Shutdown(Sender<Result<Outcome>>),
}

/// Cheap to clone; every clone talks to the same control thread
#[derive(Clone)]
pub struct OrchestratorClient {
    tx: Sender<Request>,
}

impl OrchestratorClient {
    pub fn call(&self, command: Command) -> Result<Outcome> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.tx
            .send(Request::Command(command, reply_tx))
            .map_err(|_| PipelineError::ServiceClosed)?;
        reply_rx.recv().map_err(|_| PipelineError::ServiceClosed)?
    }

    pub async fn call_async(&self, command: Command) -> Result<Outcome> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.tx
            .send_async(Request::Command(command, reply_tx))
            .await
            .map_err(|_| PipelineError::ServiceClosed)?;
        reply_rx
            .recv_async()
            .await
            .map_err(|_| PipelineError::ServiceClosed)?
    }

    pub fn status(&self) -> Result<StatusReport> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.tx
            .send(Request::Status(reply_tx))
            .map_err(|_| PipelineError::ServiceClosed)?;
        reply_rx.recv().map_err(|_| PipelineError::ServiceClosed)
    }
}

pub struct OrchestratorService {
    client: OrchestratorClient,
    thread: Option<JoinHandle<()>>,
}

impl OrchestratorService {
    pub fn spawn(orchestrator: PipelineOrchestrator) -> Result<Self> {
        let (tx, rx) = flume::unbounded();
        let thread = thread::Builder::new()
            .name("orchestrator".into())
            .spawn(move || control_loop(orchestrator, rx))
            .map_err(|source| PipelineError::Spawn {
                name: "orchestrator".into(),
                source,
            })?;

        Ok(Self {
            client: OrchestratorClient { tx },
            thread: Some(thread),
        })
    }

    pub fn client(&self) -> OrchestratorClient {
        self.client.clone()
    }

    /// Tear the pipeline down and stop the control thread
    pub fn shutdown(mut self) -> Result<Outcome> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<Outcome> {
        let Some(thread) = self.thread.take() else {
            return Ok(Outcome::unchanged());
        };
        let (reply_tx, reply_rx) = flume::bounded(1);
        let result = match self.client.tx.send(Request::Shutdown(reply_tx)) {
            Ok(()) => reply_rx.recv().map_err(|_| PipelineError::ServiceClosed)?,
            Err(_) => Err(PipelineError::ServiceClosed),
        };
        if thread.join().is_err() {
            error!("Orchestrator thread panicked");
        }
        result
    }
}

impl Drop for OrchestratorService {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_inner() {
            error!("Orchestrator shutdown failed: {}", e);
        }
    }
}

fn control_loop(mut orchestrator: PipelineOrchestrator, rx: Receiver<Request>) {
    info!("Orchestrator control thread running");
    while let Ok(request) = rx.recv() {
        match request {
            Request::Command(command, reply) => {
                let result = orchestrator.handle(command);
                if let Err(e) = &result {
                    error!("{:?} failed: {}", command, e);
                }
                let _ = reply.send(result);
            }
            Request::Status(reply) => {
                let _ = reply.send(StatusReport {
                    state: orchestrator.state(),
                    record: orchestrator.record_status(),
                    photo: orchestrator.photo_progress(),
                });
            }
            Request::Shutdown(reply) => {
                let _ = reply.send(orchestrator.deinit());
                break;
            }
        }
    }
    info!("Orchestrator control thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SimulatedCapability;
    use crate::media::Mode;
    use crate::params::MemoryParams;
    use crate::Config;
    use std::sync::Arc;

    fn service() -> (Arc<SimulatedCapability>, OrchestratorService) {
        let sim = SimulatedCapability::new().into_shared();
        let mut config = Config::default();
        config.pump.fetch_timeout_ms = 10;
        let orchestrator = PipelineOrchestrator::with_config(
            sim.clone(),
            Arc::new(MemoryParams::new()),
            Arc::new(config),
        );
        (sim, OrchestratorService::spawn(orchestrator).unwrap())
    }

    #[test]
    fn test_commands_round_trip() {
        let (sim, service) = service();
        let client = service.client();

        assert!(client.call(Command::Init).unwrap().changed);
        let status = client.status().unwrap();
        assert_eq!(
            status.state,
            PipelineState::Built {
                recording: true,
                photo: false
            }
        );
        assert!(!client.call(Command::SetMode(Mode::Video)).unwrap().changed);

        service.shutdown().unwrap();
        assert_eq!(sim.live_count(), 0);
        assert!(matches!(
            client.call(Command::Init),
            Err(PipelineError::ServiceClosed)
        ));
    }

    #[tokio::test]
    async fn test_async_call() {
        let (sim, service) = service();
        let client = service.client();
        client.call_async(Command::Init).await.unwrap();
        client.call_async(Command::Deinit).await.unwrap();
        assert_eq!(sim.live_count(), 0);
    }
}
