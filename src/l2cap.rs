//! L2CAP LE-ATT listener.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd};
use std::time::Duration;

use log::{debug, info};
use tokio::io::unix::AsyncFd;

use crate::session::Shutdown;
use crate::Error;

const BTPROTO_L2CAP: libc::c_int = 0;
const SOL_BLUETOOTH: libc::c_int = 274;
const BT_SECURITY: libc::c_int = 4;

/// The fixed channel identifier ATT runs on.
pub const ATT_CID: u16 = 4;

/// Baseline L2CAP security level.
pub const BT_SECURITY_LOW: u8 = 1;

/// Public LE address type.
pub const BDADDR_LE_PUBLIC: u8 = 0x01;

/// The any-device address, for binding the listener.
pub const BDADDR_ANY: [u8; 6] = [0; 6];

const LISTEN_BACKLOG: libc::c_int = 10;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct sockaddr_l2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct bt_security {
    level: u8,
    key_size: u8,
}

fn format_bdaddr(addr: &[u8; 6]) -> String {
    // Stored little endian; rendered most significant byte first.
    let mut out = String::with_capacity(17);
    for (i, b) in addr.iter().rev().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&format!("{b:02X}"));
    }
    out
}

/// Listen on the ATT channel and accept exactly one connection.
///
/// The wait is interruptible: the idle `deadline` yields
/// [`Error::IdleTimeout`], a shutdown request yields [`Error::Cancelled`].
/// The listening socket is closed once a connection is accepted.
pub async fn listen_and_accept(
    local_addr: [u8; 6],
    security_level: u8,
    addr_type: u8,
    deadline: Duration,
    shutdown: &Shutdown,
) -> Result<OwnedFd, Error> {
    let listener = bind_and_listen(local_addr, security_level, addr_type)?;
    let listener = AsyncFd::new(listener)?;
    info!("[l2cap] listening on ATT channel, waiting for a central ({}s idle deadline)", deadline.as_secs());

    let deadline = tokio::time::Instant::now() + deadline;
    loop {
        tokio::select! {
            _ = shutdown.requested() => return Err(Error::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(Error::IdleTimeout),
            guard = listener.readable() => {
                let mut guard = guard?;
                match guard.try_io(|inner| accept(inner.get_ref())) {
                    Ok(result) => {
                        let (conn, peer) = result?;
                        info!("[l2cap] connect from {}", format_bdaddr(&peer));
                        return Ok(conn);
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

fn bind_and_listen(local_addr: [u8; 6], security_level: u8, addr_type: u8) -> Result<OwnedFd, Error> {
    let fd = unsafe {
        libc::socket(
            libc::AF_BLUETOOTH,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_L2CAP,
        )
    };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: sockaddr_l2 = unsafe { mem::zeroed() };
    addr.l2_family = libc::AF_BLUETOOTH as libc::sa_family_t;
    addr.l2_cid = ATT_CID.to_le();
    addr.l2_bdaddr = local_addr;
    addr.l2_bdaddr_type = addr_type;
    if unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&raw const addr).cast(),
            mem::size_of::<sockaddr_l2>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let sec = bt_security {
        level: security_level,
        key_size: 0,
    };
    if unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_BLUETOOTH,
            BT_SECURITY,
            (&raw const sec).cast(),
            mem::size_of::<bt_security>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    debug!("[l2cap] bound to CID {ATT_CID}, security level {security_level}");
    Ok(fd)
}

fn accept(listener: &OwnedFd) -> io::Result<(OwnedFd, [u8; 6])> {
    let mut addr: sockaddr_l2 = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_l2>() as libc::socklen_t;
    let fd = unsafe {
        libc::accept4(
            listener.as_raw_fd(),
            (&raw mut addr).cast(),
            &mut len,
            libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((unsafe { OwnedFd::from_raw_fd(fd) }, addr.l2_bdaddr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdaddr_renders_msb_first() {
        let addr = [0xec, 0xfe, 0xb9, 0x96, 0x1d, 0x8c];
        assert_eq!(format_bdaddr(&addr), "8C:1D:96:B9:FE:EC");
    }
}
