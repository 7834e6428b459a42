//! Stream transports for reaching the in-guest agent.
//!
//! Production traffic rides AF_VSOCK; tests substitute a unix socket.
//! The vsock adapter wraps a non-blocking socket fd in tokio's `AsyncFd`
//! so it behaves like any other async stream.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{Error, Result};

/// Object-safe async stream.
pub trait AgentStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AgentStream for T {}

/// Where the agent endpoint lives.
#[derive(Debug, Clone)]
pub enum Transport {
    /// Host-guest socket: the guest agent listens on this context id and
    /// port.
    Vsock { cid: u32, port: u32 },
    /// Local socket stand-in, used by the test suite.
    Unix(PathBuf),
}

impl Transport {
    pub async fn connect(&self) -> Result<Box<dyn AgentStream>> {
        match self {
            Transport::Vsock { cid, port } => {
                let stream = VsockStream::connect(*cid, *port).await?;
                Ok(Box::new(stream))
            }
            Transport::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| Error::Transport(format!("unix connect: {e}")))?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Async AF_VSOCK stream.
pub struct VsockStream {
    fd: AsyncFd<OwnedFd>,
}

impl VsockStream {
    pub async fn connect(cid: u32, port: u32) -> Result<Self> {
        use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, VsockAddr};

        let fd = socket(
            AddressFamily::Vsock,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| Error::Transport(format!("vsock socket: {e}")))?;

        let addr = VsockAddr::new(cid, port);
        match connect(fd.as_raw_fd(), &addr) {
            Ok(()) => {}
            Err(nix::errno::Errno::EINPROGRESS) => {}
            Err(e) => return Err(Error::Transport(format!("vsock connect: {e}"))),
        }

        let fd = AsyncFd::new(fd).map_err(|e| Error::Transport(format!("vsock register: {e}")))?;

        // Wait for the connect to settle, then check SO_ERROR.
        let mut guard = fd
            .writable()
            .await
            .map_err(|e| Error::Transport(format!("vsock connect wait: {e}")))?;
        guard.clear_ready();

        let err: i32 = {
            let mut err: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut err as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc < 0 {
                return Err(Error::Transport("vsock getsockopt failed".into()));
            }
            err
        };
        if err != 0 {
            return Err(Error::Transport(format!(
                "vsock connect: {}",
                io::Error::from_raw_os_error(err)
            )));
        }

        Ok(Self { fd })
    }
}

impl AsyncRead for VsockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = match self.fd.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    unfilled.as_mut_ptr() as *mut libc::c_void,
                    unfilled.len(),
                )
            };

            if n >= 0 {
                buf.advance(n as usize);
                return Poll::Ready(Ok(()));
            }

            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                guard.clear_ready();
                continue;
            }
            return Poll::Ready(Err(err));
        }
    }
}

impl AsyncWrite for VsockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = match self.fd.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };

            if n >= 0 {
                return Poll::Ready(Ok(n as usize));
            }

            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                guard.clear_ready();
                continue;
            }
            return Poll::Ready(Err(err));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let _ = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_WR) };
        Poll::Ready(Ok(()))
    }
}
