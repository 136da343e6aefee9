use log::{debug, warn};

use crate::att::{self, AttErrorCode, AttReq};
use crate::attribute::{AttributeTable, Characteristic};
use crate::cursor::WriteCursor;
use crate::provision::{trim_message, ReassemblyBuffer};
use crate::types::uuid::Uuid;
use crate::ATT_MTU;

/// Outcome of dispatching one inbound ATT PDU.
///
/// When both parts are present the response must go out before any work on
/// the message begins, so the ATT transaction is acknowledged before the
/// (potentially slow) provisioning path runs.
#[derive(Debug, Default)]
pub struct Processed {
    /// Response PDU to send back, if the request calls for one.
    pub response: Option<Vec<u8>>,
    /// A completed provisioning message, ready to parse.
    pub message: Option<Vec<u8>>,
}

impl Processed {
    fn response(bytes: &[u8]) -> Self {
        Self {
            response: Some(bytes.to_vec()),
            message: None,
        }
    }

    fn silent() -> Self {
        Self::default()
    }
}

/// The per-session ATT/GATT server.
///
/// Owns the attribute table and the write-reassembly state for the Wi-Fi
/// characteristic; everything else in the table is served generically.
pub struct AttributeServer {
    buf: [u8; ATT_MTU],
    mtu: u16,
    table: AttributeTable,
    wifi_char: Characteristic,
    reassembly: ReassemblyBuffer,
}

impl AttributeServer {
    pub fn new(table: AttributeTable, wifi_char: Characteristic) -> Self {
        Self {
            buf: [0; ATT_MTU],
            mtu: ATT_MTU as u16,
            table,
            wifi_char,
            reassembly: ReassemblyBuffer::new(),
        }
    }

    /// The Wi-Fi characteristic handles cached for this session.
    pub fn wifi_characteristic(&self) -> Characteristic {
        self.wifi_char
    }

    /// Whether the central subscribed on the Wi-Fi characteristic's CCCD.
    pub fn notifications_enabled(&self) -> bool {
        self.wifi_char
            .cccd_handle()
            .is_some_and(|cccd| self.table.subscribed(cccd))
    }

    pub fn table(&self) -> &AttributeTable {
        &self.table
    }

    /// Process one inbound PDU and produce the response (and possibly a
    /// completed provisioning message).
    pub fn process(&mut self, pdu: &[u8]) -> Processed {
        match AttReq::decode(pdu) {
            Ok(req) => self.dispatch(req),
            Err(_) => {
                let opcode = pdu.first().copied().unwrap_or(0);
                if opcode == att::ATT_WRITE_CMD {
                    // Write commands never get a response, not even an error.
                    return Processed::silent();
                }
                let len = Self::error_response(
                    &mut self.buf,
                    opcode,
                    0,
                    AttErrorCode::REQUEST_NOT_SUPPORTED,
                );
                Processed::response(&self.buf[..len])
            }
        }
    }

    fn dispatch(&mut self, req: AttReq<'_>) -> Processed {
        match req {
            AttReq::ExchangeMtu { mtu } => {
                debug!("[gatt] exchange mtu: client {mtu}, serving fixed {}", self.mtu);
                let mut w = WriteCursor::new(&mut self.buf);
                w.write(att::ATT_EXCHANGE_MTU_RSP).unwrap();
                w.write(self.mtu).unwrap();
                let len = w.len();
                Processed::response(&self.buf[..len])
            }
            AttReq::ReadByGroupType { start, end, group_type } => {
                let len = self.handle_read_by_group_type(start, end, group_type);
                Processed::response(&self.buf[..len])
            }
            AttReq::ReadByType {
                start,
                end,
                attribute_type,
            } => {
                let len = self.handle_read_by_type(start, end, attribute_type);
                Processed::response(&self.buf[..len])
            }
            AttReq::FindInformation {
                start_handle,
                end_handle,
            } => {
                let len = self.handle_find_information(start_handle, end_handle);
                Processed::response(&self.buf[..len])
            }
            AttReq::FindByTypeValue {
                start_handle,
                end_handle,
                att_type,
                att_value,
            } => {
                let len = self.handle_find_by_type_value(start_handle, end_handle, att_type, att_value);
                Processed::response(&self.buf[..len])
            }
            AttReq::Read { handle } => {
                let len = self.handle_read(handle, 0, att::ATT_READ_REQ);
                Processed::response(&self.buf[..len])
            }
            AttReq::ReadBlob { handle, offset } => {
                let len = self.handle_read(handle, offset, att::ATT_READ_BLOB_REQ);
                Processed::response(&self.buf[..len])
            }
            AttReq::Write { handle, data } => self.handle_write(handle, data),
            AttReq::WriteCmd { handle, data } => self.handle_write_cmd(handle, data),
            AttReq::PrepareWrite { handle, offset, value } => self.handle_prepare_write(handle, offset, value),
            AttReq::ExecuteWrite { flags } => self.handle_execute_write(flags),
        }
    }

    fn handle_read_by_group_type(&mut self, start: u16, end: u16, group_type: Uuid) -> usize {
        let mut found = None;
        for att in self.table.iter() {
            if att.uuid == group_type && att.handle >= start && att.handle <= end {
                found = Some(att);
                break;
            }
        }
        let mut w = WriteCursor::new(&mut self.buf);
        match found {
            Some(att) => {
                let value = match &att.data {
                    crate::attribute::AttributeData::Service { uuid } => uuid.as_raw(),
                    _ => &[],
                };
                w.write(att::ATT_READ_BY_GROUP_TYPE_RSP).unwrap();
                w.write(4 + value.len() as u8).unwrap();
                w.write(att.handle).unwrap();
                w.write(att.last_handle_in_group).unwrap();
                w.append(value).unwrap();
                w.len()
            }
            None => Self::error_response(
                w.write_buf(),
                att::ATT_READ_BY_GROUP_TYPE_REQ,
                start,
                AttErrorCode::ATTRIBUTE_NOT_FOUND,
            ),
        }
    }

    fn handle_read_by_type(&mut self, start: u16, end: u16, attribute_type: Uuid) -> usize {
        let Self { buf, table, .. } = self;
        let mut w = WriteCursor::new(buf);
        let mut result = Err(AttErrorCode::ATTRIBUTE_NOT_FOUND);
        let mut handle = start;

        let (mut header, mut body) = w.split(2).unwrap();
        for att in table.iter() {
            if att.uuid == attribute_type && att.handle >= start && att.handle <= end {
                handle = att.handle;
                body.write(att.handle).unwrap();
                let writer = body.write_buf();
                result = att.data.read(0, writer);
                if let Ok(len) = result {
                    body.commit(len).unwrap();
                }
                break;
            }
        }

        match result {
            Ok(len) => {
                header.write(att::ATT_READ_BY_TYPE_RSP).unwrap();
                header.write(2 + len as u8).unwrap();
                header.len() + body.len()
            }
            Err(e) => Self::error_response(&mut self.buf, att::ATT_READ_BY_TYPE_REQ, handle, e),
        }
    }

    fn handle_find_information(&mut self, start: u16, end: u16) -> usize {
        let Self { buf, table, .. } = self;
        let mut w = WriteCursor::new(buf);
        let (mut header, mut body) = w.split(2).unwrap();

        // Entries in one response share a single UUID format.
        let mut format = 0;
        for att in table.iter() {
            if att.handle >= start && att.handle <= end {
                if format == 0 {
                    format = att.uuid.get_type();
                } else if format != att.uuid.get_type() {
                    break;
                }
                if body.available() < 2 + att.uuid.as_raw().len() {
                    break;
                }
                body.write(att.handle).unwrap();
                body.append(att.uuid.as_raw()).unwrap();
            }
        }

        if body.is_empty() {
            Self::error_response(
                &mut self.buf,
                att::ATT_FIND_INFORMATION_REQ,
                start,
                AttErrorCode::ATTRIBUTE_NOT_FOUND,
            )
        } else {
            header.write(att::ATT_FIND_INFORMATION_RSP).unwrap();
            header.write(format).unwrap();
            header.len() + body.len()
        }
    }

    fn handle_find_by_type_value(&mut self, start: u16, end: u16, att_type: u16, att_value: &[u8]) -> usize {
        let mut found = None;
        for att in self.table.iter() {
            if att.uuid == Uuid::new_short(att_type)
                && att.handle >= start
                && att.handle <= end
            {
                let matches = match &att.data {
                    crate::attribute::AttributeData::Service { uuid } => uuid.as_raw() == att_value,
                    _ => false,
                };
                if matches {
                    found = Some((att.handle, att.last_handle_in_group));
                    break;
                }
            }
        }
        let mut w = WriteCursor::new(&mut self.buf);
        match found {
            Some((handle, group_end)) => {
                w.write(att::ATT_FIND_BY_TYPE_VALUE_RSP).unwrap();
                w.write(handle).unwrap();
                w.write(group_end).unwrap();
                w.len()
            }
            None => Self::error_response(
                w.write_buf(),
                att::ATT_FIND_BY_TYPE_VALUE_REQ,
                start,
                AttErrorCode::ATTRIBUTE_NOT_FOUND,
            ),
        }
    }

    fn handle_read(&mut self, handle: u16, offset: u16, request_opcode: u8) -> usize {
        let Self { buf, table, .. } = self;
        let mut w = WriteCursor::new(buf);
        let rsp_opcode = if request_opcode == att::ATT_READ_REQ {
            att::ATT_READ_RSP
        } else {
            att::ATT_READ_BLOB_RSP
        };

        let mut result = Err(AttErrorCode::INVALID_HANDLE);
        w.write(rsp_opcode).unwrap();
        if let Some(att) = table.attribute(handle) {
            let writer = w.write_buf();
            result = att.data.read(offset as usize, writer);
            if let Ok(len) = result {
                w.commit(len).unwrap();
            }
        }

        match result {
            Ok(_) => w.len(),
            Err(e) => Self::error_response(&mut self.buf, request_opcode, handle, e),
        }
    }

    fn handle_write(&mut self, handle: u16, data: &[u8]) -> Processed {
        if handle == self.wifi_char.handle() {
            // Ack the write before any provisioning work begins.
            let mut w = WriteCursor::new(&mut self.buf);
            w.write(att::ATT_WRITE_RSP).unwrap();
            let len = w.len();
            let mut processed = Processed::response(&self.buf[..len]);
            processed.message = Some(trim_message(data).to_vec());
            return processed;
        }

        let result = match self.table.attribute_mut(handle) {
            Some(att) => att.data.write(0, data),
            None => Err(AttErrorCode::INVALID_HANDLE),
        };
        let len = match result {
            Ok(()) => {
                if Some(handle) == self.wifi_char.cccd_handle() {
                    debug!(
                        "[gatt] wifi notifications {}",
                        if self.notifications_enabled() { "enabled" } else { "disabled" }
                    );
                }
                let mut w = WriteCursor::new(&mut self.buf);
                w.write(att::ATT_WRITE_RSP).unwrap();
                w.len()
            }
            Err(e) => Self::error_response(&mut self.buf, att::ATT_WRITE_REQ, handle, e),
        };
        Processed::response(&self.buf[..len])
    }

    fn handle_write_cmd(&mut self, handle: u16, data: &[u8]) -> Processed {
        if handle == self.wifi_char.handle() {
            self.reassembly.append(data);
            return Processed {
                response: None,
                message: self.reassembly.take_line(),
            };
        }
        // Write commands cannot respond with an error.
        if let Some(att) = self.table.attribute_mut(handle) {
            if let Err(e) = att.data.write(0, data) {
                warn!("[gatt] write command on {handle:#06x} rejected: {e}");
            }
        }
        Processed::silent()
    }

    fn handle_prepare_write(&mut self, handle: u16, offset: u16, value: &[u8]) -> Processed {
        if handle != self.wifi_char.handle() {
            let len = Self::error_response(
                &mut self.buf,
                att::ATT_PREPARE_WRITE_REQ,
                handle,
                AttErrorCode::REQUEST_NOT_SUPPORTED,
            );
            return Processed::response(&self.buf[..len]);
        }

        self.reassembly.write_at(offset as usize, value);

        let mut w = WriteCursor::new(&mut self.buf);
        w.write(att::ATT_PREPARE_WRITE_RSP).unwrap();
        w.write(handle).unwrap();
        w.write(offset).unwrap();
        // The echoed value must fit: MTU - 5 bytes of header.
        let echo = value.len().min(w.available());
        w.append(&value[..echo]).unwrap();
        let len = w.len();
        Processed::response(&self.buf[..len])
    }

    fn handle_execute_write(&mut self, flags: u8) -> Processed {
        let message = if flags == att::EXEC_WRITE_CANCEL {
            self.reassembly.cancel();
            None
        } else if self.reassembly.in_progress() || !self.reassembly.is_empty() {
            Some(self.reassembly.execute())
        } else {
            None
        };

        let mut w = WriteCursor::new(&mut self.buf);
        w.write(att::ATT_EXECUTE_WRITE_RSP).unwrap();
        let len = w.len();
        let mut processed = Processed::response(&self.buf[..len]);
        processed.message = message;
        processed
    }

    fn error_response(buf: &mut [u8], request: u8, handle: u16, code: AttErrorCode) -> usize {
        let mut w = WriteCursor::new(buf);
        w.write(att::ATT_ERROR_RSP).unwrap();
        w.write(request).unwrap();
        w.write(handle).unwrap();
        w.write(code).unwrap();
        w.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{CharacteristicProp, Service};

    const WIFI_SERVICE: [u8; 16] = [0x11; 16];
    const WIFI_CHAR: [u8; 16] = [0x22; 16];

    fn server() -> AttributeServer {
        let mut table = AttributeTable::new();
        let mut svc = table.add_service(Service::new(0x1800));
        svc.add_characteristic_ro(0x2a00, b"3RHUB-TEST");
        drop(svc);
        let mut svc = table.add_service(Service::new(Uuid::new_long(WIFI_SERVICE)));
        let wifi = svc
            .add_characteristic_wo(
                Uuid::new_long(WIFI_CHAR),
                &[
                    CharacteristicProp::Write,
                    CharacteristicProp::WriteWithoutResponse,
                    CharacteristicProp::Notify,
                ],
            )
            .build();
        drop(svc);
        AttributeServer::new(table, wifi)
    }

    fn write_req(handle: u16, data: &[u8]) -> Vec<u8> {
        let mut pdu = vec![0x12];
        pdu.extend_from_slice(&handle.to_le_bytes());
        pdu.extend_from_slice(data);
        pdu
    }

    #[test]
    fn exchange_mtu_pins_23() {
        let mut server = server();
        let p = server.process(&[0x02, 0x00, 0x02]);
        assert_eq!(p.response.as_deref(), Some(&[0x03, 23, 0][..]));
    }

    #[test]
    fn service_discovery_returns_group_range() {
        let mut server = server();
        // Read By Group Type over the whole range for primary services.
        let p = server.process(&[0x10, 0x01, 0x00, 0xff, 0xff, 0x00, 0x28]);
        let rsp = p.response.unwrap();
        assert_eq!(rsp[0], 0x11);
        assert_eq!(rsp[1], 6); // 4 + 2 byte uuid
        assert_eq!(u16::from_le_bytes([rsp[2], rsp[3]]), 1);
        assert_eq!(u16::from_le_bytes([rsp[4], rsp[5]]), 3);
        assert_eq!(&rsp[6..8], &[0x00, 0x18]);

        // Continue discovery past the first service.
        let p = server.process(&[0x10, 0x04, 0x00, 0xff, 0xff, 0x00, 0x28]);
        let rsp = p.response.unwrap();
        assert_eq!(rsp[1], 20); // 4 + 16 byte uuid
        assert_eq!(&rsp[6..22], &WIFI_SERVICE);
    }

    #[test]
    fn wifi_value_read_is_not_permitted() {
        let mut server = server();
        let handle = server.wifi_characteristic().handle();
        let mut pdu = vec![0x0a];
        pdu.extend_from_slice(&handle.to_le_bytes());
        let p = server.process(&pdu);
        let rsp = p.response.unwrap();
        assert_eq!(rsp[0], 0x01);
        assert_eq!(rsp[1], 0x0a);
        assert_eq!(rsp[4], 0x02); // READ_NOT_PERMITTED
    }

    #[test]
    fn write_request_acks_then_surfaces_message() {
        let mut server = server();
        let handle = server.wifi_characteristic().handle();
        let p = server.process(&write_req(handle, b"{\"ssid\":\"Cafe\"}\n"));
        assert_eq!(p.response.as_deref(), Some(&[0x13][..]));
        assert_eq!(p.message.as_deref(), Some(&b"{\"ssid\":\"Cafe\"}"[..]));
    }

    #[test]
    fn write_commands_stream_until_newline() {
        let mut server = server();
        let handle = server.wifi_characteristic().handle();
        let mut cmd = vec![0x52];
        cmd.extend_from_slice(&handle.to_le_bytes());
        cmd.extend_from_slice(b"{\"ssid\":");
        let p = server.process(&cmd);
        assert!(p.response.is_none());
        assert!(p.message.is_none());

        let mut cmd = vec![0x52];
        cmd.extend_from_slice(&handle.to_le_bytes());
        cmd.extend_from_slice(b"\"Cafe\"}\n");
        let p = server.process(&cmd);
        assert!(p.response.is_none());
        assert_eq!(p.message.as_deref(), Some(&b"{\"ssid\":\"Cafe\"}"[..]));
    }

    #[test]
    fn long_write_assembles_on_execute() {
        let mut server = server();
        let handle = server.wifi_characteristic().handle();
        let parts: [(u16, &[u8]); 3] = [
            (0, b"{\"ssid\":\"L"),
            (10, b"ongNetName\",\""),
            (22, b"pw\":\"pass\"}\n"),
        ];
        for (offset, value) in parts {
            let mut pdu = vec![0x16];
            pdu.extend_from_slice(&handle.to_le_bytes());
            pdu.extend_from_slice(&offset.to_le_bytes());
            pdu.extend_from_slice(value);
            let p = server.process(&pdu);
            let rsp = p.response.unwrap();
            assert_eq!(rsp[0], 0x17);
            assert_eq!(&rsp[5..], value);
            assert!(p.message.is_none());
        }
        let p = server.process(&[0x18, 0x01]);
        assert_eq!(p.response.as_deref(), Some(&[0x19][..]));
        assert_eq!(
            p.message.as_deref(),
            Some(&br#"{"ssid":"LongNetName","pw":"pass"}"#[..])
        );
    }

    #[test]
    fn execute_cancel_discards_the_queue() {
        let mut server = server();
        let handle = server.wifi_characteristic().handle();
        let mut pdu = vec![0x16];
        pdu.extend_from_slice(&handle.to_le_bytes());
        pdu.extend_from_slice(&0u16.to_le_bytes());
        pdu.extend_from_slice(b"{\"ssid\":\"x\"}\n");
        server.process(&pdu);
        let p = server.process(&[0x18, 0x00]);
        assert_eq!(p.response.as_deref(), Some(&[0x19][..]));
        assert!(p.message.is_none());
    }

    #[test]
    fn cccd_write_flips_subscription() {
        let mut server = server();
        let cccd = server.wifi_characteristic().cccd_handle().unwrap();
        assert!(!server.notifications_enabled());
        let p = server.process(&write_req(cccd, &[0x01, 0x00]));
        assert_eq!(p.response.as_deref(), Some(&[0x13][..]));
        assert!(server.notifications_enabled());
        server.process(&write_req(cccd, &[0x00, 0x00]));
        assert!(!server.notifications_enabled());
    }

    #[test]
    fn unknown_opcode_gets_an_error_response() {
        let mut server = server();
        let p = server.process(&[0xbb, 0x00]);
        let rsp = p.response.unwrap();
        assert_eq!(rsp[0], 0x01);
        assert_eq!(rsp[1], 0xbb);
        assert_eq!(rsp[4], AttErrorCode::REQUEST_NOT_SUPPORTED.raw());
    }
}
