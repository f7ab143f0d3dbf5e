//! Unix-domain-socket, newline-delimited-JSON transport (§6). One task per
//! connection reads request lines and replies through the shared
//! `Dispatcher`; broadcast signals are fanned out to every connection that
//! `identify`'d with `subscribe:true`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::core::Core;
use crate::error::{CoreError, Result};
use crate::ipc::{Dispatcher, OutgoingSignal, SignalSink};

#[derive(Debug, Deserialize)]
struct Envelope {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

type SubscriberMap = Arc<Mutex<HashMap<String, UnboundedSender<String>>>>;

/// `SignalSink` implementation backing the transport: broadcasts serialize
/// once and are pushed onto every subscribed connection's outbound queue.
struct Broadcaster {
    subscribers: SubscriberMap,
}

impl SignalSink for Broadcaster {
    fn broadcast(&self, signal: OutgoingSignal) {
        let line = match serde_json::to_string(&signal) {
            Ok(s) => s,
            Err(e) => {
                error!(target: "transport", error = %e, "failed to serialize broadcast signal");
                return;
            }
        };

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|client_id, tx| {
            if tx.send(line.clone()).is_err() {
                debug!(target: "transport", client_id, "dropping closed subscriber");
                false
            } else {
                true
            }
        });
    }
}

/// Owns the listening socket and the shared dispatcher. Construct via
/// [`Transport::bind`], which also builds the `Core` so the `SignalSink` can
/// be wired in before `Core::new` runs.
pub struct Transport {
    listener: UnixListener,
    dispatcher: Arc<Dispatcher>,
    core: Arc<Core>,
    subscribers: SubscriberMap,
}

impl Transport {
    /// Binds `socket_path`, removing a stale socket file left behind by a
    /// prior crashed run (§6 "Persisted state" treats the socket itself as
    /// disposable, unlike the alarm store).
    pub fn bind(
        socket_path: &str,
        config: crate::config::DaemonConfig,
        hal: Arc<dyn crate::hal::PlatformHal>,
        clock_source: Box<dyn crate::clock::ClockSource>,
    ) -> Result<Self> {
        let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
        let broadcaster = Arc::new(Broadcaster { subscribers: subscribers.clone() });

        let core = Core::new(config, hal, broadcaster, clock_source)?;
        let dispatcher = Arc::new(Dispatcher::new(core.clone()));

        if std::path::Path::new(socket_path).exists() {
            std::fs::remove_file(socket_path).map_err(|e| {
                CoreError::Internal(format!("removing stale socket {socket_path}: {e}"))
            })?;
        }

        let listener = UnixListener::bind(socket_path)
            .map_err(|e| CoreError::Internal(format!("binding {socket_path}: {e}")))?;

        Ok(Self { listener, dispatcher, core, subscribers })
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Accepts connections until the listener errors out (process shutdown).
    pub async fn serve(self) -> Result<()> {
        info!(target: "transport", "listening");
        loop {
            let (stream, _addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(target: "transport", error = %e, "accept failed");
                    return Err(CoreError::Internal(format!("accept: {e}")));
                }
            };

            let dispatcher = self.dispatcher.clone();
            let core = self.core.clone();
            let subscribers = self.subscribers.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, dispatcher, core, subscribers).await {
                    warn!(target: "transport", error = %e, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    dispatcher: Arc<Dispatcher>,
    core: Arc<Core>,
    subscribers: SubscriberMap,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut subscribed_client_id: Option<String> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.map_err(|e| CoreError::Internal(format!("read: {e}")))? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let envelope: Envelope = match serde_json::from_str(&line) {
                    Ok(e) => e,
                    Err(e) => {
                        let resp = serde_json::json!({"returnValue": false, "errorText": e.to_string()});
                        write_line(&mut write_half, &resp.to_string()).await?;
                        continue;
                    }
                };

                let response = dispatcher.dispatch(&envelope.method, envelope.params);

                if envelope.method == "identify" {
                    if let Some(client_id) = response.get("clientId").and_then(|v| v.as_str()) {
                        if response.get("subscribed").and_then(|v| v.as_bool()).unwrap_or(false) {
                            subscribers.lock().unwrap().insert(client_id.to_string(), tx.clone());
                            subscribed_client_id = Some(client_id.to_string());
                        }
                    }
                }

                write_line(&mut write_half, &response.to_string()).await?;
            }
            Some(broadcast_line) = rx.recv() => {
                write_line(&mut write_half, &broadcast_line).await?;
            }
        }
    }

    if let Some(client_id) = subscribed_client_id {
        subscribers.lock().unwrap().remove(&client_id);
        core.unregister_client(&client_id);
    }
    Ok(())
}

async fn write_line(write_half: &mut tokio::net::unix::OwnedWriteHalf, line: &str) -> Result<()> {
    write_half
        .write_all(line.as_bytes())
        .await
        .map_err(|e| CoreError::Internal(format!("write: {e}")))?;
    write_half
        .write_all(b"\n")
        .await
        .map_err(|e| CoreError::Internal(format!("write: {e}")))?;
    Ok(())
}
