//! Typed command surface of the QMP session.

use std::os::unix::io::AsRawFd;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::UnixStream;

use super::Monitor;
use crate::{Error, Result};

/// How long the guest agent gets to answer a ping probe.
const AGENT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

impl Monitor {
    /// Suspend guest CPUs.
    pub async fn pause(&self) -> Result<()> {
        self.execute("stop", None).await.map(drop)
    }

    /// Resume guest CPUs. Used both to leave `-S` startup suspension and
    /// to unfreeze a paused guest.
    pub async fn cont(&self) -> Result<()> {
        self.execute("cont", None).await.map(drop)
    }

    /// Ask the guest to power down via ACPI.
    pub async fn powerdown(&self) -> Result<()> {
        self.execute("system_powerdown", None).await.map(drop)
    }

    /// Terminate the hypervisor immediately.
    pub async fn quit(&self) -> Result<()> {
        self.execute("quit", None).await.map(drop)
    }

    /// Current run state: "running", "paused", ...
    pub async fn status(&self) -> Result<String> {
        let value = self.execute("query-status", None).await?;
        value
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::context("query-status reply missing status"))
    }

    /// Host thread ids of the guest vCPUs, one entry per vCPU in vCPU
    /// order.
    pub async fn get_cpus(&self) -> Result<Vec<i32>> {
        let value = self.execute("query-cpus", None).await?;
        let entries = value
            .as_array()
            .ok_or_else(|| Error::context("query-cpus reply not a list"))?;

        let mut pids = Vec::with_capacity(entries.len());
        for entry in entries {
            let pid = entry
                .get("thread_id")
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::context("query-cpus entry missing thread_id"))?;
            pids.push(pid as i32);
        }
        Ok(pids)
    }

    /// Probe whether the in-guest agent answers pings. Timeouts and
    /// errors both mean "not ready".
    pub async fn agent_ready(&self) -> bool {
        self.execute_timeout("guest-ping", None, AGENT_PROBE_TIMEOUT)
            .await
            .is_ok()
    }

    /// Drain the named ring buffer chardev, e.g. the console capture.
    pub async fn ringbuf_read(&self, name: &str) -> Result<String> {
        let value = self
            .execute(
                "ringbuf-read",
                Some(json!({
                    "device": name,
                    "size": super::RINGBUF_SIZE_BYTES,
                    "format": "utf8",
                })),
            )
            .await?;

        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::context("ringbuf-read reply not a string"))
    }

    /// Bind a duplex byte stream to the named chardev.
    ///
    /// One end of a socket pair is handed to the hypervisor over
    /// SCM_RIGHTS (`getfd`), then attached with `add-client`; the other
    /// end is returned to the caller.
    pub async fn console(&self, name: &str) -> Result<UnixStream> {
        let (ours, theirs) = UnixStream::pair()?;

        let (id, rx) = self.register_pending();
        let request = json!({
            "execute": "getfd",
            "arguments": { "fdname": "console" },
            "id": id,
        });
        let mut payload = request.to_string();
        payload.push('\n');

        {
            // Hold the writer lock so the fd-carrying message cannot
            // interleave with another request.
            let _writer = self.locked_writer().await;
            send_with_fd(self.raw_fd(), payload.as_bytes(), theirs.as_raw_fd())?;
        }

        rx.await.map_err(|_| Error::MonitorDisconnect)??;
        drop(theirs);

        self.execute(
            "add-client",
            Some(json!({ "protocol": name, "fdname": "console", "skipauth": true })),
        )
        .await?;

        Ok(ours)
    }
}

/// Write `payload` on the monitor socket with `fd` attached as ancillary
/// SCM_RIGHTS data.
fn send_with_fd(socket: std::os::unix::io::RawFd, payload: &[u8], fd: std::os::unix::io::RawFd) -> Result<()> {
    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
    use std::io::IoSlice;

    let iov = [IoSlice::new(payload)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(socket, &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|_| Error::MonitorDisconnect)?;
    Ok(())
}
