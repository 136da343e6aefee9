//! HCI controller facade.
//!
//! Four LE controller commands drive the advertising lifecycle. Each command
//! opens its own raw HCI socket, installs an event filter for its completion,
//! and waits at most one second for the controller's verdict; no long-lived
//! control handle exists.
//!
//! We use `libc` directly because
//! * `nix` makes it awkward to bind an arbitrary address
//! * `rustix` makes it awkward to set arbitrary sockopts

use std::io;
use std::mem;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::ad_structure::{AdvertisingPayload, ADV_PAYLOAD_MAX};

const BTPROTO_HCI: libc::c_int = 1;
const HCI_CHANNEL_RAW: libc::c_ushort = 0;
const SOL_HCI: libc::c_int = 0;
const HCI_FILTER: libc::c_int = 2;

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;
const EVT_CMD_COMPLETE: u8 = 0x0e;
const EVT_CMD_STATUS: u8 = 0x0f;

const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_ADV_PARAMETERS: u16 = 0x0006;
const OCF_LE_SET_ADV_DATA: u16 = 0x0008;
const OCF_LE_SET_SCAN_RSP_DATA: u16 = 0x0009;
const OCF_LE_SET_ADV_ENABLE: u16 = 0x000a;

/// Response deadline for a single HCI command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct sockaddr_hci {
    hci_family: libc::c_ushort,
    hci_dev: libc::c_ushort,
    hci_channel: libc::c_ushort,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct hci_filter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum HciError {
    #[error("hci socket: {0}")]
    Io(#[from] io::Error),
    #[error("no command completion within {COMMAND_TIMEOUT:?}")]
    Timeout,
    #[error("controller rejected command with status {0:#04x}")]
    Status(u8),
}

/// Fixed advertising parameter block: 160–320 ms intervals, connectable
/// undirected, public own address, all three channels, no filtering.
fn adv_params_block() -> [u8; 15] {
    let mut block = [0u8; 15];
    block[0..2].copy_from_slice(&0x0100u16.to_le_bytes()); // min interval
    block[2..4].copy_from_slice(&0x0200u16.to_le_bytes()); // max interval
    block[4] = 0x00; // connectable undirected
    block[5] = 0x00; // own address: public
    block[6] = 0x00; // direct address type
    // direct address stays zeroed
    block[13] = 0x07; // channel map: 37, 38, 39
    block[14] = 0x00; // no filter policy
    block
}

/// Significant-length-prefixed 31-byte data block shared by the advertising
/// data and scan response commands.
fn adv_data_block(payload: &AdvertisingPayload) -> [u8; 1 + ADV_PAYLOAD_MAX] {
    let mut block = [0u8; 1 + ADV_PAYLOAD_MAX];
    block[0] = payload.len() as u8;
    block[1..1 + payload.len()].copy_from_slice(payload.as_bytes());
    block
}

/// Handle to the local controller, identified by its device index.
#[derive(Debug, Clone, Copy)]
pub struct HciController {
    dev_id: u16,
}

impl HciController {
    pub fn new(dev_id: u16) -> Self {
        Self { dev_id }
    }

    /// Verify the controller exists and is accessible.
    pub fn probe(&self) -> Result<(), HciError> {
        self.open().map(drop)
    }

    pub fn set_adv_params(&self) -> Result<(), HciError> {
        self.send_cmd(OCF_LE_SET_ADV_PARAMETERS, &adv_params_block())
    }

    pub fn set_adv_data(&self, payload: &AdvertisingPayload) -> Result<(), HciError> {
        self.send_cmd(OCF_LE_SET_ADV_DATA, &adv_data_block(payload))
    }

    pub fn set_scan_response(&self, payload: &AdvertisingPayload) -> Result<(), HciError> {
        self.send_cmd(OCF_LE_SET_SCAN_RSP_DATA, &adv_data_block(payload))
    }

    pub fn set_adv_enable(&self, enable: bool) -> Result<(), HciError> {
        self.send_cmd(OCF_LE_SET_ADV_ENABLE, &[enable as u8])
    }

    fn open(&self) -> Result<OwnedFd, HciError> {
        let fd = unsafe { libc::socket(libc::AF_BLUETOOTH, libc::SOCK_RAW | libc::SOCK_CLOEXEC, BTPROTO_HCI) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: sockaddr_hci = unsafe { mem::zeroed() };
        addr.hci_family = libc::AF_BLUETOOTH as u16;
        addr.hci_dev = self.dev_id;
        addr.hci_channel = HCI_CHANNEL_RAW;
        if unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&raw const addr).cast(),
                mem::size_of::<sockaddr_hci>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }

    /// Send one LE controller command and wait for its completion status.
    fn send_cmd(&self, ocf: u16, params: &[u8]) -> Result<(), HciError> {
        let sock = self.open()?;
        let opcode = (OGF_LE_CTL << 10) | ocf;

        let mut filter: hci_filter = unsafe { mem::zeroed() };
        filter.type_mask = 1 << u32::from(HCI_EVENT_PKT);
        filter.event_mask[0] = (1 << u32::from(EVT_CMD_COMPLETE)) | (1 << u32::from(EVT_CMD_STATUS));
        filter.opcode = opcode;
        if unsafe {
            libc::setsockopt(
                sock.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                (&raw const filter).cast(),
                mem::size_of::<hci_filter>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(io::Error::last_os_error().into());
        }

        let mut pkt = Vec::with_capacity(4 + params.len());
        pkt.push(HCI_COMMAND_PKT);
        pkt.extend_from_slice(&opcode.to_le_bytes());
        pkt.push(params.len() as u8);
        pkt.extend_from_slice(params);
        trace!("[hci] > {pkt:02x?}");

        let written = unsafe { libc::write(sock.as_raw_fd(), pkt.as_ptr().cast(), pkt.len()) };
        if written != pkt.len() as isize {
            return Err(io::Error::last_os_error().into());
        }

        let deadline = Instant::now() + COMMAND_TIMEOUT;
        let mut buf = [0u8; 260];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HciError::Timeout);
            }
            let mut pfd = libc::pollfd {
                fd: sock.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as libc::c_int) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if ret == 0 {
                return Err(HciError::Timeout);
            }

            let n = unsafe { libc::read(sock.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let event = &buf[..n as usize];
            trace!("[hci] < {event:02x?}");
            if event.len() < 3 || event[0] != HCI_EVENT_PKT {
                continue;
            }
            match event[1] {
                EVT_CMD_COMPLETE if event.len() >= 7 => {
                    let complete_opcode = u16::from_le_bytes([event[4], event[5]]);
                    if complete_opcode != opcode {
                        continue;
                    }
                    let status = event[6];
                    debug!("[hci] command {opcode:#06x} complete, status {status:#04x}");
                    if status != 0 {
                        return Err(HciError::Status(status));
                    }
                    return Ok(());
                }
                EVT_CMD_STATUS if event.len() >= 7 => {
                    let status_opcode = u16::from_le_bytes([event[5], event[6]]);
                    if status_opcode != opcode {
                        continue;
                    }
                    let status = event[3];
                    if status != 0 {
                        return Err(HciError::Status(status));
                    }
                    // Success status only; keep waiting for the completion.
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad_structure::{create_advertising_data, AdStructure, BR_EDR_NOT_SUPPORTED};
    use crate::Uuid;

    #[test]
    fn adv_params_are_fixed_for_stability() {
        let block = adv_params_block();
        assert_eq!(&block[0..2], &[0x00, 0x01]); // 0x0100 little endian
        assert_eq!(&block[2..4], &[0x00, 0x02]); // 0x0200 little endian
        assert_eq!(block[4], 0x00);
        assert_eq!(block[5], 0x00);
        assert_eq!(&block[6..13], &[0u8; 7]);
        assert_eq!(block[13], 0x07);
        assert_eq!(block[14], 0x00);
    }

    #[test]
    fn adv_data_block_is_length_prefixed_and_padded() {
        let uuid = Uuid::from_canonical("6e400000-0000-4e98-8024-bc5b71e0893e").unwrap();
        let payload = create_advertising_data(&[
            AdStructure::Flags(BR_EDR_NOT_SUPPORTED),
            AdStructure::ServiceUuids128(core::slice::from_ref(&uuid)),
            AdStructure::TxPowerLevel(0),
        ])
        .unwrap();
        let block = adv_data_block(&payload);
        assert_eq!(block.len(), 32);
        assert_eq!(block[0], 24);
        assert_eq!(&block[1..4], &[0x02, 0x01, 0x04]);
        assert_eq!(&block[25..], &[0u8; 7]); // zero padding to 31
    }

    #[test]
    fn opcode_packing() {
        assert_eq!((OGF_LE_CTL << 10) | OCF_LE_SET_ADV_ENABLE, 0x200a);
    }
}
