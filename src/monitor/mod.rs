//! QMP monitor client.
//!
//! One session per control socket: after the capabilities handshake the
//! session multiplexes id-matched request/response pairs with an
//! asynchronous event stream. Events are delivered to the handler closure
//! registered at connect time on the session's own reader task; the
//! handler must not block and must not call back into monitor commands.

mod commands;

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Size of the console ring buffer captured on the host side.
pub const RINGBUF_SIZE_BYTES: usize = 1 << 20;

/// An asynchronous event emitted by the hypervisor.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub data: Value,
    pub timestamp: Value,
}

/// Non-blocking event handler registered at connect time.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// A connected QMP session.
///
/// Cheap to clone; all clones share the underlying transport. The session
/// becomes permanently disconnected when the transport drops, but that is
/// not fatal for the guest: a later caller may connect a fresh session.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Raw socket fd, needed for SCM_RIGHTS when binding console streams.
    raw_fd: RawFd,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_id: AtomicU64,
    disconnect_tx: watch::Sender<bool>,
    disconnect_rx: watch::Receiver<bool>,
}

impl Monitor {
    /// Connect to a QMP control socket and perform the capabilities
    /// handshake. `handler` receives every event for the session lifetime.
    pub async fn connect(path: &Path, handler: EventHandler) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|_| Error::MonitorDisconnect)?;
        let raw_fd = stream.as_raw_fd();
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // The server speaks first with a greeting banner.
        let mut greeting = String::new();
        reader
            .read_line(&mut greeting)
            .await
            .map_err(|_| Error::MonitorDisconnect)?;
        let banner: Value =
            serde_json::from_str(&greeting).map_err(|_| Error::MonitorDisconnect)?;
        if banner.get("QMP").is_none() {
            return Err(Error::context("Unexpected QMP greeting"));
        }

        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        let monitor = Monitor {
            inner: Arc::new(MonitorInner {
                writer: tokio::sync::Mutex::new(write_half),
                raw_fd,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                disconnect_tx,
                disconnect_rx,
            }),
        };

        let reader_session = monitor.clone();
        tokio::spawn(async move {
            reader_session.read_loop(reader, handler).await;
        });

        monitor.execute("qmp_capabilities", None).await?;
        Ok(monitor)
    }

    async fn read_loop(
        &self,
        mut reader: BufReader<tokio::net::unix::OwnedReadHalf>,
        handler: EventHandler,
    ) {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }

            let message: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(err) => {
                    warn!(%err, "discarding unparseable monitor message");
                    continue;
                }
            };

            if let Some(event) = message.get("event").and_then(Value::as_str) {
                let event = Event {
                    name: event.to_string(),
                    data: message.get("data").cloned().unwrap_or(Value::Null),
                    timestamp: message.get("timestamp").cloned().unwrap_or(Value::Null),
                };
                debug!(event = %event.name, "monitor event");
                handler(event);
                continue;
            }

            let Some(id) = message.get("id").and_then(Value::as_u64) else {
                continue;
            };

            let sender = self.inner.pending.lock().expect("pending poisoned").remove(&id);
            let Some(sender) = sender else { continue };

            let outcome = if let Some(desc) = message
                .pointer("/error/desc")
                .and_then(Value::as_str)
            {
                Err(Error::context(desc.to_string()))
            } else {
                Ok(message.get("return").cloned().unwrap_or(Value::Null))
            };

            let _ = sender.send(outcome);
        }

        // Transport gone: fail everything still in flight and close the
        // wait channel.
        let pending: Vec<_> = {
            let mut pending = self.inner.pending.lock().expect("pending poisoned");
            pending.drain().collect()
        };
        for (_, sender) in pending {
            let _ = sender.send(Err(Error::MonitorDisconnect));
        }
        let _ = self.inner.disconnect_tx.send(true);
        debug!("monitor session disconnected");
    }

    /// True once the transport has dropped.
    pub fn is_disconnected(&self) -> bool {
        *self.inner.disconnect_rx.borrow()
    }

    /// Channel that flips to `true` when the transport disconnects.
    ///
    /// Fails with `MonitorDisconnect` when the session is already gone so
    /// callers can apply their shutdown-races-are-success policy.
    pub fn wait_channel(&self) -> Result<watch::Receiver<bool>> {
        if self.is_disconnected() {
            return Err(Error::MonitorDisconnect);
        }
        Ok(self.inner.disconnect_rx.clone())
    }

    /// Send one command and await its response.
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        if self.is_disconnected() {
            return Err(Error::MonitorDisconnect);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending poisoned")
            .insert(id, tx);

        let mut request = json!({ "execute": command, "id": id });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }
        let mut payload = request.to_string();
        payload.push('\n');

        {
            let mut writer = self.inner.writer.lock().await;
            if writer.write_all(payload.as_bytes()).await.is_err() {
                self.inner.pending.lock().expect("pending poisoned").remove(&id);
                return Err(Error::MonitorDisconnect);
            }
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::MonitorDisconnect),
        }
    }

    /// Like `execute`, but gives up after `timeout`.
    pub async fn execute_timeout(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(timeout, self.execute(command, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(Error::context(format!("Monitor command {command:?} timed out"))),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.inner.raw_fd
    }

    pub(crate) async fn locked_writer(&self) -> tokio::sync::MutexGuard<'_, OwnedWriteHalf> {
        self.inner.writer.lock().await
    }

    pub(crate) fn register_pending(&self) -> (u64, oneshot::Receiver<Result<Value>>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending poisoned")
            .insert(id, tx);
        (id, rx)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use tokio::net::UnixListener;

    async fn connect_scripted<F>(reply: F) -> (Monitor, tempfile::TempDir)
    where
        F: FnMut(&str, u64) -> ScriptAction + Send + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu.monitor");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(scripted_qmp(listener, reply));

        let monitor = Monitor::connect(&path, noop_handler()).await.unwrap();
        (monitor, dir)
    }

    #[tokio::test]
    async fn test_handshake_and_simple_command() {
        let (monitor, _dir) = connect_scripted(|cmd, _| match cmd {
            "query-status" => ScriptAction::Return(json!({ "status": "running" })),
            _ => ScriptAction::Return(json!({})),
        })
        .await;

        let status = monitor.status().await.unwrap();
        assert_eq!(status, "running");
    }

    #[tokio::test]
    async fn test_qmp_error_is_surfaced() {
        let (monitor, _dir) =
            connect_scripted(|_, _| ScriptAction::Error("device is in use".into())).await;

        let err = monitor.pause().await.unwrap_err();
        assert_eq!(err.to_string(), "device is in use");
    }

    #[tokio::test]
    async fn test_events_reach_handler() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu.monitor");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(scripted_qmp(listener, |cmd, _| match cmd {
            "system_powerdown" => ScriptAction::ReturnThenEvent(
                json!({}),
                json!({
                    "event": "SHUTDOWN",
                    "data": { "guest": true },
                    "timestamp": { "seconds": 1, "microseconds": 0 },
                }),
            ),
            _ => ScriptAction::Return(json!({})),
        }));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: EventHandler = Arc::new(move |event| {
            let _ = tx.send(event.name);
        });

        let monitor = Monitor::connect(&path, handler).await.unwrap();
        monitor.powerdown().await.unwrap();

        let name = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "SHUTDOWN");
    }

    #[tokio::test]
    async fn test_disconnect_closes_wait_channel() {
        let (monitor, _dir) = connect_scripted(|cmd, _| match cmd {
            "quit" => ScriptAction::ReturnThenClose(json!({})),
            _ => ScriptAction::Return(json!({})),
        })
        .await;

        let mut wait = monitor.wait_channel().unwrap();
        monitor.quit().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !*wait.borrow() {
                if wait.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert!(monitor.is_disconnected());
        assert!(matches!(
            monitor.status().await.unwrap_err(),
            Error::MonitorDisconnect
        ));
        assert!(monitor.wait_channel().is_err());
    }

    #[tokio::test]
    async fn test_get_cpus_in_vcpu_order() {
        let (monitor, _dir) = connect_scripted(|cmd, _| match cmd {
            "query-cpus" => ScriptAction::Return(json!([
                { "CPU": 0, "thread_id": 9001 },
                { "CPU": 1, "thread_id": 9002 },
            ])),
            _ => ScriptAction::Return(json!({})),
        })
        .await;

        assert_eq!(monitor.get_cpus().await.unwrap(), vec![9001, 9002]);
    }

    #[tokio::test]
    async fn test_agent_ready_timeout_means_offline() {
        let (monitor, _dir) = connect_scripted(|cmd, _| match cmd {
            "guest-ping" => ScriptAction::Ignore,
            _ => ScriptAction::Return(json!({})),
        })
        .await;

        assert!(!monitor.agent_ready().await);
    }
}
