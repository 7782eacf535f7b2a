//! In-flight delegation registry.
//!
//! A single task owns the map of running delegations; callers talk to it over
//! a channel, so no lock is ever held across I/O.

use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

enum Command {
    Register {
        run_id: String,
        token: CancellationToken,
    },
    Remove {
        run_id: String,
    },
    Cancel {
        run_id: String,
        reply: oneshot::Sender<bool>,
    },
    CancelAll {
        reply: oneshot::Sender<usize>,
    },
    List {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Handle to the registry task. Cheap to clone.
#[derive(Clone)]
pub struct InFlightRegistry {
    tx: mpsc::Sender<Command>,
}

impl InFlightRegistry {
    /// Start the owning task on the current runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(64);
        tokio::spawn(async move {
            let mut in_flight: HashMap<String, CancellationToken> = HashMap::new();
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Register { run_id, token } => {
                        in_flight.insert(run_id, token);
                    }
                    Command::Remove { run_id } => {
                        in_flight.remove(&run_id);
                    }
                    Command::Cancel { run_id, reply } => {
                        let found = in_flight.remove(&run_id).map(|t| t.cancel()).is_some();
                        let _ = reply.send(found);
                    }
                    Command::CancelAll { reply } => {
                        let count = in_flight.len();
                        for (_, token) in in_flight.drain() {
                            token.cancel();
                        }
                        let _ = reply.send(count);
                    }
                    Command::List { reply } => {
                        let mut ids: Vec<String> = in_flight.keys().cloned().collect();
                        ids.sort();
                        let _ = reply.send(ids);
                    }
                }
            }
        });
        Self { tx }
    }

    pub async fn register(&self, run_id: &str, token: CancellationToken) {
        let _ = self
            .tx
            .send(Command::Register {
                run_id: run_id.to_string(),
                token,
            })
            .await;
    }

    pub async fn remove(&self, run_id: &str) {
        let _ = self
            .tx
            .send(Command::Remove {
                run_id: run_id.to_string(),
            })
            .await;
    }

    /// Cancel the delegation of one run. Returns whether one was in flight.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Command::Cancel {
                run_id: run_id.to_string(),
                reply,
            })
            .await;
        sent.is_ok() && rx.await.unwrap_or(false)
    }

    pub async fn cancel_all(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::CancelAll { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn list(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::List { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}
