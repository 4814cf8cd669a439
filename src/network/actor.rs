//! Network actor - runs many dispatches concurrently in the Tokio runtime
//!
//! This is the embedding API for hosts that keep several requests in flight
//! at once and cancel them by id. [`Session`](crate::Session) drives a single
//! send through [`DispatchEngine`] directly and does not go through here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::messages::{NetworkCommand, NetworkResponse};
use crate::models::{Request, VarMap};
use crate::network::client::{DispatchEngine, DispatchOptions};

/// Network actor that processes dispatch commands
///
/// Every in-flight request owns its own cancellation token; nothing else is
/// shared between calls.
pub struct NetworkActor {
    engine: DispatchEngine,
    response_tx: mpsc::UnboundedSender<NetworkResponse>,
    active_requests: JoinSet<u64>,
    cancel_handles: HashMap<u64, CancellationToken>,
}

impl NetworkActor {
    pub fn new(engine: DispatchEngine, response_tx: mpsc::UnboundedSender<NetworkResponse>) -> Self {
        NetworkActor {
            engine,
            response_tx,
            active_requests: JoinSet::new(),
            cancel_handles: HashMap::new(),
        }
    }

    fn execute(&mut self, id: u64, request: Request, variables: VarMap, timeout_ms: u64) {
        let options = DispatchOptions::new(timeout_ms);
        self.cancel_handles.insert(id, options.cancel.clone());

        let engine = self.engine.clone();
        let response_tx = self.response_tx.clone();
        self.active_requests.spawn(async move {
            tracing::debug!(id, url = %request.url, "Executing request");
            let message = match engine.execute(&request, &variables, &options).await {
                Ok(response) => NetworkResponse::Success {
                    id,
                    response: Box::new(response),
                },
                Err(error) => NetworkResponse::Failed { id, error },
            };
            let _ = response_tx.send(message);
            id
        });
    }

    /// Run the network actor message loop
    pub async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<NetworkCommand>) {
        loop {
            tokio::select! {
                biased;

                // Handle incoming commands
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(NetworkCommand::Execute { id, request, variables, timeout_ms }) => {
                            self.execute(id, *request, variables, timeout_ms);
                        }

                        Some(NetworkCommand::Cancel(id)) => {
                            // The task itself reports the cancellation
                            if let Some(token) = self.cancel_handles.get(&id) {
                                tracing::info!(id, "Cancelling request");
                                token.cancel();
                            }
                        }

                        Some(NetworkCommand::Shutdown) | None => break,
                    }
                }

                // Clean up completed tasks
                Some(joined) = self.active_requests.join_next() => {
                    match joined {
                        Ok(id) => {
                            self.cancel_handles.remove(&id);
                        }
                        Err(e) => tracing::error!("Dispatch task failed: {}", e),
                    }
                }
            }
        }

        for (_, token) in self.cancel_handles.drain() {
            token.cancel();
        }
        while self.active_requests.join_next().await.is_some() {}
        tracing::info!("Network actor stopped");
    }
}

/// Cheap, cloneable front end to a spawned [`NetworkActor`]
#[derive(Clone)]
pub struct NetworkHandle {
    cmd_tx: mpsc::UnboundedSender<NetworkCommand>,
    next_id: std::sync::Arc<AtomicU64>,
}

impl NetworkHandle {
    /// Spawn the actor on the current runtime.
    pub fn spawn(engine: DispatchEngine) -> (Self, mpsc::UnboundedReceiver<NetworkResponse>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        tokio::spawn(NetworkActor::new(engine, response_tx).run(cmd_rx));
        (
            NetworkHandle {
                cmd_tx,
                next_id: std::sync::Arc::new(AtomicU64::new(1)),
            },
            response_rx,
        )
    }

    /// Queue a dispatch and return the id its response will carry.
    pub fn execute(&self, request: Request, variables: VarMap, timeout_ms: u64) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.cmd_tx.send(NetworkCommand::Execute {
            id,
            request: Box::new(request),
            variables,
            timeout_ms,
        });
        id
    }

    pub fn cancel(&self, id: u64) {
        let _ = self.cmd_tx.send(NetworkCommand::Cancel(id));
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(NetworkCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::HttpMethod;
    use crate::network::transport::NativeTransport;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fast"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fast"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("slow")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_concurrent_requests_do_not_cross_talk() {
        let server = server().await;
        let (handle, mut rx) = NetworkHandle::spawn(DispatchEngine::new(Arc::new(NativeTransport::new())));

        let slow = handle.execute(
            Request::new(HttpMethod::GET, format!("{}/slow", server.uri())),
            VarMap::new(),
            0,
        );
        let fast = handle.execute(
            Request::new(HttpMethod::GET, format!("{}/fast", server.uri())),
            VarMap::new(),
            0,
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id(), fast);
        assert_eq!(first.into_result().unwrap().body, "fast");

        handle.cancel(slow);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.id(), slow);
        assert_eq!(second.into_result().unwrap_err().kind, ErrorKind::Cancelled);

        handle.shutdown();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_delivers_outstanding_results() {
        let server = server().await;
        let (handle, mut rx) = NetworkHandle::spawn(DispatchEngine::new(Arc::new(NativeTransport::new())));

        let id = handle.execute(
            Request::new(HttpMethod::GET, format!("{}/slow", server.uri())),
            VarMap::new(),
            0,
        );
        handle.shutdown();

        let only = rx.recv().await.unwrap();
        assert_eq!(only.id(), id);
        assert_eq!(only.into_result().unwrap_err().kind, ErrorKind::Cancelled);
        assert!(rx.recv().await.is_none());
    }
}
