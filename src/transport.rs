//! ATT transport over the accepted L2CAP socket.
//!
//! The socket is a sequenced-packet socket, so one datagram is one ATT PDU
//! in both directions; no further framing exists.

use std::io;
use std::os::fd::{AsRawFd as _, OwnedFd};
use std::time::Duration;

use log::debug;
use tokio::io::unix::AsyncFd;

/// How often `closed()` re-probes the link while inbound data is pending.
const LIVENESS_POLL: Duration = Duration::from_millis(250);

pub struct AttTransport {
    fd: AsyncFd<OwnedFd>,
    verbose: bool,
}

impl AttTransport {
    /// Take exclusive ownership of the accepted (non-blocking) socket.
    pub fn new(fd: OwnedFd, verbose: bool) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            verbose,
        })
    }

    /// Receive one ATT PDU. Returns 0 when the peer performed an orderly
    /// shutdown.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let ret = unsafe { libc::recv(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
                usize::try_from(ret).map_err(|_| io::Error::last_os_error())
            }) {
                Ok(result) => {
                    let n = result?;
                    if self.verbose && n > 0 {
                        debug!("[att] < {:02x?}", &buf[..n]);
                    }
                    return Ok(n);
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Send one ATT PDU.
    pub async fn send(&self, pdu: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let ret = unsafe { libc::send(inner.as_raw_fd(), pdu.as_ptr().cast(), pdu.len(), 0) };
                usize::try_from(ret).map_err(|_| io::Error::last_os_error())
            }) {
                Ok(result) => {
                    let written = result?;
                    if written != pdu.len() {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "short ATT send"));
                    }
                    if self.verbose {
                        debug!("[att] > {pdu:02x?}");
                    }
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Probe link liveness without consuming any pending PDU.
    pub fn is_alive(&self) -> bool {
        let mut probe = [0u8; 1];
        let ret = unsafe {
            libc::recv(
                self.fd.get_ref().as_raw_fd(),
                probe.as_mut_ptr().cast(),
                probe.len(),
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if ret > 0 {
            return true;
        }
        if ret == 0 {
            return false;
        }
        matches!(
            io::Error::last_os_error().kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        )
    }

    /// Resolve once the peer hangs up, leaving pending inbound PDUs in the
    /// socket buffer for the serve loop to consume.
    pub async fn closed(&self) {
        loop {
            if !self.is_alive() {
                return;
            }
            match self.fd.readable().await {
                Ok(guard) => {
                    if !self.is_alive() {
                        return;
                    }
                    // Readable but alive: a PDU is queued. Hold off so this
                    // probe does not spin while provisioning runs.
                    drop(guard);
                    tokio::time::sleep(LIVENESS_POLL).await;
                }
                Err(_) => return,
            }
        }
    }
}
