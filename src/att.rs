use core::fmt::Display;

use crate::codec;
use crate::cursor::{ReadCursor, WriteCursor};
use crate::types::uuid::Uuid;

pub(crate) const ATT_ERROR_RSP: u8 = 0x01;
pub(crate) const ATT_EXCHANGE_MTU_REQ: u8 = 0x02;
pub(crate) const ATT_EXCHANGE_MTU_RSP: u8 = 0x03;
pub(crate) const ATT_FIND_INFORMATION_REQ: u8 = 0x04;
pub(crate) const ATT_FIND_INFORMATION_RSP: u8 = 0x05;
pub(crate) const ATT_FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
pub(crate) const ATT_FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
pub(crate) const ATT_READ_BY_TYPE_REQ: u8 = 0x08;
pub(crate) const ATT_READ_BY_TYPE_RSP: u8 = 0x09;
pub(crate) const ATT_READ_REQ: u8 = 0x0a;
pub(crate) const ATT_READ_RSP: u8 = 0x0b;
pub(crate) const ATT_READ_BLOB_REQ: u8 = 0x0c;
pub(crate) const ATT_READ_BLOB_RSP: u8 = 0x0d;
pub(crate) const ATT_READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
pub(crate) const ATT_READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
pub(crate) const ATT_WRITE_REQ: u8 = 0x12;
pub(crate) const ATT_WRITE_RSP: u8 = 0x13;
pub(crate) const ATT_PREPARE_WRITE_REQ: u8 = 0x16;
pub(crate) const ATT_PREPARE_WRITE_RSP: u8 = 0x17;
pub(crate) const ATT_EXECUTE_WRITE_REQ: u8 = 0x18;
pub(crate) const ATT_EXECUTE_WRITE_RSP: u8 = 0x19;
pub(crate) const ATT_HANDLE_VALUE_NTF: u8 = 0x1b;
pub(crate) const ATT_WRITE_CMD: u8 = 0x52;

/// Execute Write flags octet: anything else commits the prepare queue.
pub(crate) const EXEC_WRITE_CANCEL: u8 = 0x00;

/// Attribute Error Code
///
/// The error octet carried in an `ATT_ERROR_RSP` PDU (Bluetooth Core
/// Specification Vol 3, Part F).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct AttErrorCode {
    value: u8,
}

impl AttErrorCode {
    /// Attempted to use a handle that isn't valid on this server
    pub const INVALID_HANDLE: Self = Self { value: 0x01 };
    /// The attribute cannot be read
    pub const READ_NOT_PERMITTED: Self = Self { value: 0x02 };
    /// The attribute cannot be written
    pub const WRITE_NOT_PERMITTED: Self = Self { value: 0x03 };
    /// The attribute PDU was invalid
    pub const INVALID_PDU: Self = Self { value: 0x04 };
    /// ATT server does not support the request received from the client
    pub const REQUEST_NOT_SUPPORTED: Self = Self { value: 0x06 };
    /// Offset specified was past the end of the attribute
    pub const INVALID_OFFSET: Self = Self { value: 0x07 };
    /// Too many prepare writes have been queued
    pub const PREPARE_QUEUE_FULL: Self = Self { value: 0x09 };
    /// No attribute found within the given attribute handle range
    pub const ATTRIBUTE_NOT_FOUND: Self = Self { value: 0x0a };
    /// The attribute value length is invalid for the operation
    pub const INVALID_ATTRIBUTE_VALUE_LENGTH: Self = Self { value: 0x0d };
    /// The attribute request encountered an unlikely error
    pub const UNLIKELY_ERROR: Self = Self { value: 0x0e };

    pub fn raw(&self) -> u8 {
        self.value
    }
}

impl Display for AttErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Self::INVALID_HANDLE => f.write_str("invalid handle"),
            Self::READ_NOT_PERMITTED => f.write_str("read not permitted"),
            Self::WRITE_NOT_PERMITTED => f.write_str("write not permitted"),
            Self::INVALID_PDU => f.write_str("invalid pdu"),
            Self::REQUEST_NOT_SUPPORTED => f.write_str("request not supported"),
            Self::INVALID_OFFSET => f.write_str("invalid offset"),
            Self::PREPARE_QUEUE_FULL => f.write_str("prepare queue full"),
            Self::ATTRIBUTE_NOT_FOUND => f.write_str("attribute not found"),
            Self::INVALID_ATTRIBUTE_VALUE_LENGTH => f.write_str("invalid attribute value length"),
            Self::UNLIKELY_ERROR => f.write_str("unlikely error"),
            other => write!(f, "error code {:#04x}", other.value),
        }
    }
}

impl codec::FixedSize for AttErrorCode {
    const SIZE: usize = 1;
}

impl codec::Encode for AttErrorCode {
    fn encode(&self, dest: &mut [u8]) -> Result<(), codec::Error> {
        dest[0] = self.value;
        Ok(())
    }
}

impl From<codec::Error> for AttErrorCode {
    fn from(_: codec::Error) -> Self {
        AttErrorCode::INVALID_PDU
    }
}

/// A client-to-server ATT PDU this server understands.
#[derive(Debug)]
pub enum AttReq<'d> {
    ExchangeMtu {
        mtu: u16,
    },
    FindInformation {
        start_handle: u16,
        end_handle: u16,
    },
    FindByTypeValue {
        start_handle: u16,
        end_handle: u16,
        att_type: u16,
        att_value: &'d [u8],
    },
    ReadByType {
        start: u16,
        end: u16,
        attribute_type: Uuid,
    },
    ReadByGroupType {
        start: u16,
        end: u16,
        group_type: Uuid,
    },
    Read {
        handle: u16,
    },
    ReadBlob {
        handle: u16,
        offset: u16,
    },
    Write {
        handle: u16,
        data: &'d [u8],
    },
    WriteCmd {
        handle: u16,
        data: &'d [u8],
    },
    PrepareWrite {
        handle: u16,
        offset: u16,
        value: &'d [u8],
    },
    ExecuteWrite {
        flags: u8,
    },
}

impl<'d> AttReq<'d> {
    /// The request opcode, as echoed in an error response.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::ExchangeMtu { .. } => ATT_EXCHANGE_MTU_REQ,
            Self::FindInformation { .. } => ATT_FIND_INFORMATION_REQ,
            Self::FindByTypeValue { .. } => ATT_FIND_BY_TYPE_VALUE_REQ,
            Self::ReadByType { .. } => ATT_READ_BY_TYPE_REQ,
            Self::ReadByGroupType { .. } => ATT_READ_BY_GROUP_TYPE_REQ,
            Self::Read { .. } => ATT_READ_REQ,
            Self::ReadBlob { .. } => ATT_READ_BLOB_REQ,
            Self::Write { .. } => ATT_WRITE_REQ,
            Self::WriteCmd { .. } => ATT_WRITE_CMD,
            Self::PrepareWrite { .. } => ATT_PREPARE_WRITE_REQ,
            Self::ExecuteWrite { .. } => ATT_EXECUTE_WRITE_REQ,
        }
    }

    pub fn decode(data: &'d [u8]) -> Result<AttReq<'d>, codec::Error> {
        let mut r = ReadCursor::new(data);
        let opcode: u8 = r.read()?;
        Self::decode_with_opcode(opcode, r)
    }

    fn decode_with_opcode(opcode: u8, mut r: ReadCursor<'d>) -> Result<AttReq<'d>, codec::Error> {
        match opcode {
            ATT_EXCHANGE_MTU_REQ => {
                let mtu = r.read()?;
                Ok(Self::ExchangeMtu { mtu })
            }
            ATT_FIND_INFORMATION_REQ => {
                let start_handle = r.read()?;
                let end_handle = r.read()?;
                Ok(Self::FindInformation {
                    start_handle,
                    end_handle,
                })
            }
            ATT_FIND_BY_TYPE_VALUE_REQ => {
                let start_handle = r.read()?;
                let end_handle = r.read()?;
                let att_type = r.read()?;
                Ok(Self::FindByTypeValue {
                    start_handle,
                    end_handle,
                    att_type,
                    att_value: r.remaining(),
                })
            }
            ATT_READ_BY_TYPE_REQ | ATT_READ_BY_GROUP_TYPE_REQ => {
                let start = r.read()?;
                let end = r.read()?;
                let uuid = Uuid::try_from(r.remaining()).map_err(|_| codec::Error::InvalidValue)?;
                if opcode == ATT_READ_BY_TYPE_REQ {
                    Ok(Self::ReadByType {
                        start,
                        end,
                        attribute_type: uuid,
                    })
                } else {
                    Ok(Self::ReadByGroupType {
                        start,
                        end,
                        group_type: uuid,
                    })
                }
            }
            ATT_READ_REQ => {
                let handle = r.read()?;
                Ok(Self::Read { handle })
            }
            ATT_READ_BLOB_REQ => {
                let handle = r.read()?;
                let offset = r.read()?;
                Ok(Self::ReadBlob { handle, offset })
            }
            ATT_WRITE_REQ => {
                let handle = r.read()?;
                Ok(Self::Write {
                    handle,
                    data: r.remaining(),
                })
            }
            ATT_WRITE_CMD => {
                let handle = r.read()?;
                Ok(Self::WriteCmd {
                    handle,
                    data: r.remaining(),
                })
            }
            ATT_PREPARE_WRITE_REQ => {
                let handle = r.read()?;
                let offset = r.read()?;
                Ok(Self::PrepareWrite {
                    handle,
                    offset,
                    value: r.remaining(),
                })
            }
            ATT_EXECUTE_WRITE_REQ => {
                let flags = r.read()?;
                Ok(Self::ExecuteWrite { flags })
            }
            code => {
                log::warn!("[att] unknown opcode {:#04x}", code);
                Err(codec::Error::InvalidValue)
            }
        }
    }
}

/// Encode a Handle Value Notification for `handle` into `dest`.
///
/// The caller is responsible for keeping `payload` within the MTU budget.
pub fn encode_notification(handle: u16, payload: &[u8], dest: &mut [u8]) -> Result<usize, codec::Error> {
    let mut w = WriteCursor::new(dest);
    w.write(ATT_HANDLE_VALUE_NTF)?;
    w.write(handle)?;
    w.append(payload)?;
    Ok(w.len())
}
