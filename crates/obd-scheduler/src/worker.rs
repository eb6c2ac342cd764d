//! Blocking Client Worker
//!
//! The protocol engine blocks on serial I/O, so the client lives on a
//! dedicated blocking task. Async callers talk to it through a command
//! channel; each command carries a oneshot for its answer.

use obd_protocol::{ConnectError, DecodeResult, ObdClient, SerialLink, Session};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Commands queued ahead of the worker before senders wait
const COMMAND_CAPACITY: usize = 32;

/// Errors from the worker handle
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker task has exited
    #[error("OBD worker stopped")]
    Stopped,

    /// Connection attempt failed
    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),
}

enum Command {
    Connect(oneshot::Sender<Result<Session, ConnectError>>),
    DoPid {
        code: String,
        freeze_index: Option<u8>,
        reply: oneshot::Sender<DecodeResult>,
    },
    ValidPids {
        freeze_index: Option<u8>,
        reply: oneshot::Sender<BTreeMap<String, String>>,
    },
    Info(oneshot::Sender<BTreeMap<String, String>>),
    Diagnostics(oneshot::Sender<Vec<String>>),
    Close(oneshot::Sender<()>),
}

/// Cloneable async handle to a client running on a blocking task
#[derive(Debug, Clone)]
pub struct ObdWorker {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect(_) => write!(f, "Connect"),
            Command::DoPid { code, .. } => write!(f, "DoPid({})", code),
            Command::ValidPids { .. } => write!(f, "ValidPids"),
            Command::Info(_) => write!(f, "Info"),
            Command::Diagnostics(_) => write!(f, "Diagnostics"),
            Command::Close(_) => write!(f, "Close"),
        }
    }
}

impl ObdWorker {
    /// Move `client` onto a blocking task.
    ///
    /// The task ends when every handle is dropped and returns the client.
    pub fn spawn<L>(client: ObdClient<L>) -> (Self, JoinHandle<ObdClient<L>>)
    where
        L: SerialLink + 'static,
    {
        let (commands, receiver) = mpsc::channel(COMMAND_CAPACITY);
        let handle = tokio::task::spawn_blocking(move || serve(client, receiver));
        (Self { commands }, handle)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, WorkerError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| WorkerError::Stopped)?;
        answer.await.map_err(|_| WorkerError::Stopped)
    }

    /// Negotiate and discover supported PIDs
    pub async fn connect(&self) -> Result<Session, WorkerError> {
        Ok(self.request(Command::Connect).await??)
    }

    /// Request and decode one PID
    pub async fn do_pid(
        &self,
        code: &str,
        freeze_index: Option<u8>,
    ) -> Result<DecodeResult, WorkerError> {
        let code = code.to_string();
        self.request(|reply| Command::DoPid {
            code,
            freeze_index,
            reply,
        })
        .await
    }

    /// Supported PIDs of the current session
    pub async fn valid_pids(
        &self,
        freeze_index: Option<u8>,
    ) -> Result<BTreeMap<String, String>, WorkerError> {
        self.request(|reply| Command::ValidPids {
            freeze_index,
            reply,
        })
        .await
    }

    /// Adapter information
    pub async fn info(&self) -> Result<BTreeMap<String, String>, WorkerError> {
        self.request(Command::Info).await
    }

    /// Initialization diagnostics
    pub async fn diagnostics(&self) -> Result<Vec<String>, WorkerError> {
        self.request(Command::Diagnostics).await
    }

    /// Close the adapter link
    pub async fn close(&self) -> Result<(), WorkerError> {
        self.request(Command::Close).await
    }
}

fn serve<L: SerialLink>(
    mut client: ObdClient<L>,
    mut receiver: mpsc::Receiver<Command>,
) -> ObdClient<L> {
    info!("OBD worker started");

    // A dropped reply receiver only means the caller gave up waiting.
    while let Some(command) = receiver.blocking_recv() {
        debug!("Worker command {:?}", command);
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(client.connect());
            }
            Command::DoPid {
                code,
                freeze_index,
                reply,
            } => {
                let _ = reply.send(client.do_pid(&code, freeze_index));
            }
            Command::ValidPids {
                freeze_index,
                reply,
            } => {
                let _ = reply.send(client.valid_pids(freeze_index));
            }
            Command::Info(reply) => {
                let _ = reply.send(client.info());
            }
            Command::Diagnostics(reply) => {
                let _ = reply.send(client.init_diagnostics());
            }
            Command::Close(reply) => {
                client.close();
                let _ = reply.send(());
            }
        }
    }

    info!("OBD worker stopped");
    client
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::MockAdapter;
    use obd_protocol::{MemoryTableLoader, NegotiatorConfig, Sentinel, TransportConfig};

    fn client(adapter: MockAdapter) -> ObdClient<MockAdapter> {
        ObdClient::new(
            adapter,
            &TransportConfig::default(),
            NegotiatorConfig::immediate(),
            &MemoryTableLoader::new(),
            "Vehicle",
        )
    }

    fn vehicle() -> MockAdapter {
        MockAdapter::new()
            .with_response("0101", "4101000701FF")
            .with_response("0100", "4100BE3EB810")
            .with_response("010C", "410C1AF8")
    }

    #[tokio::test]
    async fn test_worker_round_trip() {
        let (worker, handle) = ObdWorker::spawn(client(vehicle()));

        let session = worker.connect().await.unwrap();
        assert_eq!(session.port, "mock-elm327");
        assert!(!session.mil_on);

        let valid = worker.valid_pids(None).await.unwrap();
        assert!(valid.contains_key("010C"));

        assert_eq!(
            worker.do_pid("010C", None).await.unwrap(),
            DecodeResult::Number(1726.0)
        );
        assert_eq!(
            worker.do_pid("01FF", None).await.unwrap(),
            Sentinel::NotImplemented.into()
        );

        let info = worker.info().await.unwrap();
        assert_eq!(info["ELM Device Version"], "ELM327 v1.5");

        worker.close().await.unwrap();
        drop(worker);
        let client = handle.await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let adapter = MockAdapter::new().with_bus_disconnected("UNABLE TO CONNECT");
        let (worker, _handle) = ObdWorker::spawn(client(adapter));

        match worker.connect().await {
            Err(WorkerError::Connect(ConnectError::BusNotConnected { .. })) => {}
            other => panic!("unexpected result {:?}", other),
        }
        let diagnostics = worker.diagnostics().await.unwrap();
        assert!(diagnostics.iter().any(|d| d.contains("UNABLE TO CONNECT")));
    }

    #[tokio::test]
    async fn test_worker_lives_while_handles_remain() {
        let (worker, handle) = ObdWorker::spawn(client(vehicle()));
        let other = worker.clone();
        drop(worker);
        // The task keeps serving while a handle remains
        assert!(other.diagnostics().await.is_ok());
        drop(other);
        assert!(handle.await.is_ok());
    }
}
