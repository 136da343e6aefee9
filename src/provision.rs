//! The provisioning protocol carried on the Wi-Fi characteristic.
//!
//! Inbound, three ATT write flavors all feed the same logical message bytes:
//! a Write Request carries a whole message, Prepare/Execute Write reassembles
//! a long write by offset, and Write Command streams fragments delimited by a
//! newline. Outbound, a single JSON reply is fragmented to the fixed MTU.

use std::net::Ipv4Addr;

use serde::Serialize;

use crate::wifi::ConfigError;
use crate::NOTIFY_MAX_PAYLOAD;

/// Hard cap on the inbound reassembly buffer.
pub const MAX_WRITE_BUFFER: usize = 1024;

/// Session-owned reassembly state for the Wi-Fi characteristic.
///
/// The buffer is zeroed whenever a message is taken or a fragment overflows
/// the cap, so credentials never outlive the message that carried them.
pub struct ReassemblyBuffer {
    buf: heapless::Vec<u8, MAX_WRITE_BUFFER>,
    in_progress: bool,
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self {
            buf: heapless::Vec::new(),
            in_progress: false,
        }
    }

    /// Store a prepare-write fragment at the given offset.
    ///
    /// A fragment that would grow the buffer past the cap resets the buffer
    /// and is silently dropped; the central will retry or time out.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        if end > MAX_WRITE_BUFFER {
            log::warn!("[provision] long write overflows buffer ({end} > {MAX_WRITE_BUFFER}), dropping");
            self.reset();
            return;
        }
        if self.buf.len() < end {
            // Infallible: end is within the fixed capacity.
            let _ = self.buf.resize_default(end);
        }
        self.buf[offset..end].copy_from_slice(data);
        self.in_progress = true;
    }

    /// Append a write-command fragment.
    pub fn append(&mut self, data: &[u8]) {
        if self.buf.len() + data.len() > MAX_WRITE_BUFFER {
            log::warn!(
                "[provision] write buffer overflow ({} + {}), dropping",
                self.buf.len(),
                data.len()
            );
            self.reset();
            return;
        }
        let _ = self.buf.extend_from_slice(data);
    }

    /// Complete a streamed message: everything before the first newline.
    ///
    /// Returns `None` until a newline has arrived.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buf.iter().position(|b| *b == b'\n')?;
        let message = self.buf[..end].to_vec();
        self.reset();
        Some(message)
    }

    /// Complete a long write: the whole buffer, truncated at the first
    /// newline when one is present.
    pub fn execute(&mut self) -> Vec<u8> {
        let end = self
            .buf
            .iter()
            .position(|b| *b == b'\n')
            .unwrap_or(self.buf.len());
        let message = self.buf[..end].to_vec();
        self.reset();
        message
    }

    /// Discard any queued prepare writes.
    pub fn cancel(&mut self) {
        self.reset();
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn reset(&mut self) {
        self.buf.iter_mut().for_each(|b| *b = 0);
        self.buf.clear();
        self.in_progress = false;
    }
}

/// Trim a single complete write to its message bytes.
pub fn trim_message(data: &[u8]) -> &[u8] {
    match data.iter().position(|b| *b == b'\n') {
        Some(end) => &data[..end],
        None => data,
    }
}

/// A parsed credential payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub ssid: String,
    /// `None` or empty means an open network.
    pub password: Option<String>,
}

/// Parse the JSON credential payload.
///
/// Malformed JSON is `BadFormat`; a missing or non-string `ssid` is
/// `BadSsid`. A non-string `pw` is ignored rather than rejected.
pub fn parse_request(message: &[u8]) -> Result<ProvisionRequest, ConfigError> {
    let value: serde_json::Value = serde_json::from_slice(message).map_err(|_| ConfigError::BadFormat)?;
    let ssid = value
        .get("ssid")
        .and_then(|v| v.as_str())
        .ok_or(ConfigError::BadSsid)?;
    let password = value
        .get("pw")
        .and_then(|v| v.as_str())
        .filter(|pw| !pw.is_empty())
        .map(str::to_owned);
    Ok(ProvisionRequest {
        ssid: ssid.to_owned(),
        password,
    })
}

/// The JSON reply pushed back over the notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A routable address was acquired: `{"ip":"<dotted-quad>"}`.
    Ip(Ipv4Addr),
    /// Association succeeded but no address arrived in time: `{"ip":""}`.
    NoIp,
    /// A typed failure: `{"err":"<code>"}`.
    Failure(&'static str),
}

#[derive(Serialize)]
struct IpReply<'a> {
    ip: &'a str,
}

#[derive(Serialize)]
struct ErrReply<'a> {
    err: &'a str,
}

impl Reply {
    /// The reply for a configurator outcome, or `None` when the link was
    /// lost and the central is gone.
    pub fn from_outcome(outcome: Result<Ipv4Addr, ConfigError>) -> Option<Reply> {
        match outcome {
            Ok(ip) => Some(Reply::Ip(ip)),
            Err(ConfigError::NoIp) => Some(Reply::NoIp),
            Err(ConfigError::LinkLost) => None,
            Err(err) => Some(Reply::Failure(err.wire_code())),
        }
    }

    /// Serialize to the wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let bytes = match self {
            Reply::Ip(ip) => serde_json::to_vec(&IpReply {
                ip: &ip.to_string(),
            }),
            Reply::NoIp => serde_json::to_vec(&IpReply { ip: "" }),
            Reply::Failure(code) => serde_json::to_vec(&ErrReply { err: code }),
        };
        // Two short string fields cannot fail to serialize.
        bytes.unwrap()
    }
}

/// Slice a serialized reply into notification payloads.
///
/// A reply that fits a single notification is sent as-is with no terminator.
/// Anything longer gets a trailing newline and is cut into chunks of at most
/// `MTU - 3` bytes.
pub fn fragment_reply(reply: &[u8]) -> Vec<Vec<u8>> {
    if reply.len() <= NOTIFY_MAX_PAYLOAD {
        return vec![reply.to_vec()];
    }
    let mut stream = reply.to_vec();
    stream.push(b'\n');
    stream.chunks(NOTIFY_MAX_PAYLOAD).map(<[u8]>::to_vec).collect()
}
