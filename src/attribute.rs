//! Attribute database for the GATT server.
//!
//! One table is built per session and never survives a disconnect, so
//! service-changed semantics are never exercised across connections.

use core::fmt;

use crate::att::AttErrorCode;
use crate::cursor::WriteCursor;
pub use crate::types::uuid::Uuid;
use crate::Error;

/// UUID for generic access service
pub const GENERIC_ACCESS_SERVICE_UUID16: Uuid = Uuid::new_short(0x1800);

/// UUID for generic attribute service
pub const GENERIC_ATTRIBUTE_SERVICE_UUID16: Uuid = Uuid::new_short(0x1801);

/// UUID for device name characteristic
pub const CHARACTERISTIC_DEVICE_NAME_UUID16: Uuid = Uuid::new_short(0x2a00);

/// UUID for appearance characteristic
pub const CHARACTERISTIC_APPEARANCE_UUID16: Uuid = Uuid::new_short(0x2a01);

/// UUID for service changed characteristic
pub const CHARACTERISTIC_SERVICE_CHANGED_UUID16: Uuid = Uuid::new_short(0x2a05);

/// UUID for primary service declarations
pub const PRIMARY_SERVICE_UUID16: Uuid = Uuid::new_short(0x2800);

/// UUID for characteristic declarations
pub const CHARACTERISTIC_UUID16: Uuid = Uuid::new_short(0x2803);

/// UUID for the client characteristic configuration descriptor
pub const CHARACTERISTIC_CCCD_UUID16: Uuid = Uuid::new_short(0x2902);

/// UUID for the characteristic user description descriptor
pub const CHARACTERISTIC_USER_DESCRIPTION_UUID16: Uuid = Uuid::new_short(0x2901);

/// Characteristic properties
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum CharacteristicProp {
    /// Broadcast
    Broadcast = 0x01,
    /// Read
    Read = 0x02,
    /// Write without response
    WriteWithoutResponse = 0x04,
    /// Write
    Write = 0x08,
    /// Notify
    Notify = 0x10,
    /// Indicate
    Indicate = 0x20,
    /// Authenticated writes
    AuthenticatedWrite = 0x40,
    /// Extended properties
    Extended = 0x80,
}

/// Properties of a characteristic.
#[derive(Debug, Clone, Copy)]
pub struct CharacteristicProps(pub(crate) u8);

impl<'a> From<&'a [CharacteristicProp]> for CharacteristicProps {
    fn from(props: &'a [CharacteristicProp]) -> Self {
        let mut val: u8 = 0;
        for prop in props {
            val |= *prop as u8;
        }
        CharacteristicProps(val)
    }
}

impl CharacteristicProps {
    /// Check if any of the properties are set.
    pub fn any(&self, props: &[CharacteristicProp]) -> bool {
        for p in props {
            if (*p as u8) & self.0 != 0 {
                return true;
            }
        }
        false
    }
}

pub(crate) enum AttributeData {
    Service {
        uuid: Uuid,
    },
    ReadOnlyData {
        props: CharacteristicProps,
        value: Vec<u8>,
    },
    Data {
        props: CharacteristicProps,
        value: Vec<u8>,
    },
    /// A value that can only be written, with no server-side storage.
    ///
    /// The write itself is routed elsewhere by the attribute server; a read
    /// fails with `READ_NOT_PERMITTED`.
    WriteOnly {
        props: CharacteristicProps,
    },
    Declaration {
        props: CharacteristicProps,
        handle: u16,
        uuid: Uuid,
    },
    Cccd {
        notifications: bool,
        indications: bool,
    },
}

impl AttributeData {
    pub(crate) fn readable(&self) -> bool {
        match self {
            Self::Data { props, .. } => props.0 & (CharacteristicProp::Read as u8) != 0,
            Self::WriteOnly { .. } => false,
            _ => true,
        }
    }

    pub(crate) fn writable(&self) -> bool {
        match self {
            Self::Data { props, .. } | Self::WriteOnly { props } => props.any(&[
                CharacteristicProp::Write,
                CharacteristicProp::WriteWithoutResponse,
                CharacteristicProp::AuthenticatedWrite,
            ]),
            Self::Cccd { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn read(&self, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode> {
        if !self.readable() {
            return Err(AttErrorCode::READ_NOT_PERMITTED);
        }
        match self {
            Self::ReadOnlyData { value, .. } | Self::Data { value, .. } => {
                if offset > value.len() {
                    return Err(AttErrorCode::INVALID_OFFSET);
                }
                let len = data.len().min(value.len() - offset);
                data[..len].copy_from_slice(&value[offset..offset + len]);
                Ok(len)
            }
            Self::Service { uuid } => {
                let val = uuid.as_raw();
                if offset > val.len() {
                    return Err(AttErrorCode::INVALID_OFFSET);
                }
                let len = data.len().min(val.len() - offset);
                data[..len].copy_from_slice(&val[offset..offset + len]);
                Ok(len)
            }
            Self::Cccd {
                notifications,
                indications,
            } => {
                if offset > 0 {
                    return Err(AttErrorCode::INVALID_OFFSET);
                }
                if data.len() < 2 {
                    return Err(AttErrorCode::UNLIKELY_ERROR);
                }
                let mut v = 0;
                if *notifications {
                    v |= 0x01;
                }
                if *indications {
                    v |= 0x02;
                }
                data[0] = v;
                data[1] = 0;
                Ok(2)
            }
            Self::Declaration { props, handle, uuid } => {
                let val = uuid.as_raw();
                if offset > val.len() + 3 {
                    return Err(AttErrorCode::INVALID_OFFSET);
                }
                let mut w = WriteCursor::new(data);
                if offset == 0 {
                    w.write(props.0)?;
                    w.write(*handle)?;
                } else if offset == 1 {
                    w.write(*handle)?;
                } else if offset == 2 {
                    w.write(handle.to_le_bytes()[1])?;
                }
                let to_write = w.available().min(val.len());
                if to_write > 0 {
                    w.append(&val[..to_write])?;
                }
                Ok(w.len())
            }
            Self::WriteOnly { .. } => Err(AttErrorCode::READ_NOT_PERMITTED),
        }
    }

    pub(crate) fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        if !self.writable() {
            return Err(AttErrorCode::WRITE_NOT_PERMITTED);
        }
        match self {
            Self::Data { value, .. } => {
                if offset + data.len() <= value.len() {
                    value[offset..offset + data.len()].copy_from_slice(data);
                    Ok(())
                } else {
                    Err(AttErrorCode::INVALID_OFFSET)
                }
            }
            Self::WriteOnly { .. } => Ok(()),
            Self::Cccd {
                notifications,
                indications,
            } => {
                if offset > 0 {
                    return Err(AttErrorCode::INVALID_OFFSET);
                }
                if data.len() != 2 {
                    return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
                }
                // Two little-endian bytes; bit 0 notify, bit 1 indicate.
                *notifications = data[0] & 0x01 != 0;
                *indications = data[0] & 0x02 != 0;
                Ok(())
            }
            _ => Err(AttErrorCode::WRITE_NOT_PERMITTED),
        }
    }
}

/// Attribute metadata.
pub struct Attribute {
    pub(crate) uuid: Uuid,
    pub(crate) handle: u16,
    pub(crate) last_handle_in_group: u16,
    pub(crate) data: AttributeData,
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("uuid", &self.uuid)
            .field("handle", &self.handle)
            .field("last_handle_in_group", &self.last_handle_in_group)
            .field("readable", &self.data.readable())
            .field("writable", &self.data.writable())
            .finish()
    }
}

/// A table of attributes.
///
/// Handles are assigned monotonically from 1 with no gaps, so every service
/// occupies a contiguous handle range and a characteristic's CCCD (when
/// present) always sits at value handle + 1.
pub struct AttributeTable {
    attributes: Vec<Attribute>,
    next_handle: u16,
}

impl Default for AttributeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeTable {
    pub fn new() -> Self {
        Self {
            attributes: Vec::new(),
            next_handle: 1,
        }
    }

    fn push(&mut self, uuid: Uuid, data: AttributeData) -> u16 {
        let handle = self.next_handle;
        self.attributes.push(Attribute {
            uuid,
            handle,
            last_handle_in_group: 0xffff,
            data,
        });
        self.next_handle += 1;
        handle
    }

    /// Add a service (a group of characteristics) to the attribute table.
    pub fn add_service(&mut self, service: Service) -> ServiceBuilder<'_> {
        let start = self.attributes.len();
        self.push(
            PRIMARY_SERVICE_UUID16,
            AttributeData::Service { uuid: service.uuid },
        );
        ServiceBuilder { start, table: self }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    pub(crate) fn attribute_mut(&mut self, handle: u16) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|att| att.handle == handle)
    }

    pub(crate) fn attribute(&self, handle: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|att| att.handle == handle)
    }

    /// Whether the client subscribed (notify or indicate) on the given CCCD.
    pub fn subscribed(&self, cccd_handle: u16) -> bool {
        match self.attribute(cccd_handle).map(|att| &att.data) {
            Some(AttributeData::Cccd {
                notifications,
                indications,
            }) => *notifications || *indications,
            _ => false,
        }
    }

    /// Read the value of a stored characteristic through the provided closure.
    pub fn get<F: FnOnce(&[u8]) -> T, T>(&self, characteristic: Characteristic, f: F) -> Result<T, Error> {
        match self.attribute(characteristic.handle).map(|att| &att.data) {
            Some(AttributeData::Data { value, .. }) | Some(AttributeData::ReadOnlyData { value, .. }) => {
                Ok(f(value))
            }
            _ => Err(Error::NotFound),
        }
    }
}

/// A GATT service.
pub struct Service {
    /// UUID of the service.
    pub uuid: Uuid,
}

impl Service {
    /// Create a new service with a uuid.
    pub fn new<U: Into<Uuid>>(uuid: U) -> Self {
        Self { uuid: uuid.into() }
    }
}

/// Builder for constructing GATT service definitions.
pub struct ServiceBuilder<'r> {
    start: usize,
    table: &'r mut AttributeTable,
}

impl<'r> ServiceBuilder<'r> {
    fn add_characteristic_internal(
        &mut self,
        uuid: Uuid,
        props: CharacteristicProps,
        data: AttributeData,
    ) -> CharacteristicBuilder<'_> {
        // Declaration first, then the value, then the CCCD when the
        // properties call for one: the CCCD handle is always value + 1.
        let value_handle = self.table.next_handle + 1;
        self.table.push(
            CHARACTERISTIC_UUID16,
            AttributeData::Declaration {
                props,
                handle: value_handle,
                uuid: uuid.clone(),
            },
        );
        self.table.push(uuid, data);

        let cccd_handle = if props.any(&[CharacteristicProp::Notify, CharacteristicProp::Indicate]) {
            Some(self.table.push(
                CHARACTERISTIC_CCCD_UUID16,
                AttributeData::Cccd {
                    notifications: false,
                    indications: false,
                },
            ))
        } else {
            None
        };

        CharacteristicBuilder {
            handle: Characteristic {
                handle: value_handle,
                cccd_handle,
            },
            table: self.table,
        }
    }

    /// Add a characteristic with server-side storage to this service.
    pub fn add_characteristic<U: Into<Uuid>>(
        &mut self,
        uuid: U,
        props: &[CharacteristicProp],
        value: Vec<u8>,
    ) -> CharacteristicBuilder<'_> {
        let props = props.into();
        self.add_characteristic_internal(uuid.into(), props, AttributeData::Data { props, value })
    }

    /// Add a read-only characteristic to this service.
    pub fn add_characteristic_ro<U: Into<Uuid>>(&mut self, uuid: U, value: &[u8]) -> CharacteristicBuilder<'_> {
        let props = CharacteristicProps::from(&[CharacteristicProp::Read][..]);
        self.add_characteristic_internal(
            uuid.into(),
            props,
            AttributeData::ReadOnlyData {
                props,
                value: value.to_vec(),
            },
        )
    }

    /// Add a characteristic whose writes are routed by the attribute server
    /// instead of being stored in the table.
    pub fn add_characteristic_wo<U: Into<Uuid>>(
        &mut self,
        uuid: U,
        props: &[CharacteristicProp],
    ) -> CharacteristicBuilder<'_> {
        let props = props.into();
        self.add_characteristic_internal(uuid.into(), props, AttributeData::WriteOnly { props })
    }
}

impl<'r> Drop for ServiceBuilder<'r> {
    fn drop(&mut self) {
        let last_handle = self.table.next_handle - 1;
        for att in self.table.attributes[self.start..].iter_mut() {
            att.last_handle_in_group = last_handle;
        }
    }
}

/// A characteristic in the attribute table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Characteristic {
    pub(crate) handle: u16,
    pub(crate) cccd_handle: Option<u16>,
}

impl Characteristic {
    /// The value handle.
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// The CCCD handle, for characteristics with notify or indicate set.
    pub fn cccd_handle(&self) -> Option<u16> {
        self.cccd_handle
    }
}

/// Builder for characteristics.
pub struct CharacteristicBuilder<'r> {
    handle: Characteristic,
    table: &'r mut AttributeTable,
}

impl<'r> CharacteristicBuilder<'r> {
    /// Add a read-only descriptor for this characteristic.
    pub fn add_descriptor_ro<U: Into<Uuid>>(&mut self, uuid: U, value: &[u8]) -> u16 {
        let props = CharacteristicProps::from(&[CharacteristicProp::Read][..]);
        self.table.push(
            uuid.into(),
            AttributeData::ReadOnlyData {
                props,
                value: value.to_vec(),
            },
        )
    }

    /// Return the built characteristic.
    pub fn build(self) -> Characteristic {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> (AttributeTable, Characteristic) {
        let mut table = AttributeTable::new();
        let mut svc = table.add_service(Service::new(0x1800));
        svc.add_characteristic_ro(0x2a00, b"unit");
        drop(svc);
        let mut svc = table.add_service(Service::new(Uuid::new_long([0xab; 16])));
        let chr = svc
            .add_characteristic_wo(
                Uuid::new_long([0xcd; 16]),
                &[
                    CharacteristicProp::Write,
                    CharacteristicProp::WriteWithoutResponse,
                    CharacteristicProp::Notify,
                ],
            )
            .build();
        drop(svc);
        (table, chr)
    }

    #[test]
    fn handles_are_contiguous_and_monotone() {
        let (table, _) = sample_table();
        let handles: Vec<u16> = table.iter().map(|att| att.handle).collect();
        let expected: Vec<u16> = (1..=handles.len() as u16).collect();
        assert_eq!(handles, expected);
    }

    #[test]
    fn cccd_follows_value_handle() {
        let (table, chr) = sample_table();
        assert_eq!(chr.cccd_handle(), Some(chr.handle() + 1));
        assert!(!table.subscribed(chr.cccd_handle().unwrap()));
    }

    #[test]
    fn group_ranges_cover_the_service() {
        let (table, _) = sample_table();
        let svc = table.attribute(1).unwrap();
        assert_eq!(svc.last_handle_in_group, 3);
        let wifi_svc = table.attribute(4).unwrap();
        assert_eq!(wifi_svc.last_handle_in_group, 7);
    }

    #[test]
    fn cccd_write_sets_subscription_bits() {
        let (mut table, chr) = sample_table();
        let cccd = chr.cccd_handle().unwrap();
        let att = table.attribute_mut(cccd).unwrap();
        att.data.write(0, &[0x01, 0x00]).unwrap();
        assert!(table.subscribed(cccd));
        let att = table.attribute_mut(cccd).unwrap();
        att.data.write(0, &[0x02, 0x00]).unwrap();
        assert!(table.subscribed(cccd), "indications count as subscribed");
        let att = table.attribute_mut(cccd).unwrap();
        att.data.write(0, &[0x00, 0x00]).unwrap();
        assert!(!table.subscribed(cccd));
        let att = table.attribute_mut(cccd).unwrap();
        assert_eq!(
            att.data.write(0, &[0x01]),
            Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)
        );
    }

    #[test]
    fn write_only_values_reject_reads() {
        let (table, chr) = sample_table();
        let att = table.attribute(chr.handle()).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(att.data.read(0, &mut buf), Err(AttErrorCode::READ_NOT_PERMITTED));
        assert!(att.data.writable());
    }
}
