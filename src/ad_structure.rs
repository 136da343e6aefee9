//! Advertising data structures.

use crate::types::uuid::Uuid;

pub const AD_FLAG_LE_LIMITED_DISCOVERABLE: u8 = 0b00000001;
pub const LE_GENERAL_DISCOVERABLE: u8 = 0b00000010;
pub const BR_EDR_NOT_SUPPORTED: u8 = 0b00000100;

/// Payload bytes of one legacy advertising PDU, at most 31 bytes.
pub const ADV_PAYLOAD_MAX: usize = 31;

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("advertising payload exceeds 31 bytes")]
pub struct AdvertisementDataError;

#[derive(Debug, Clone)]
pub enum AdStructure<'a> {
    /// Device flags and baseband capabilities.
    Flags(u8),

    /// Complete list of 128-bit service UUIDs.
    ServiceUuids128(&'a [Uuid]),

    /// Sets the full (unabbreviated) device name.
    ///
    /// Truncated to fit the remaining payload (29 bytes when alone).
    CompleteLocalName(&'a str),

    /// TX power level in dBm.
    TxPowerLevel(i8),

    /// An unknown or unimplemented AD structure stored as raw bytes.
    Unknown {
        /// Type byte.
        ty: u8,
        /// Raw data transmitted after the type.
        data: &'a [u8],
    },
}

/// A fixed 31-byte legacy advertising (or scan response) payload.
#[derive(Debug, Default, Clone)]
pub struct AdvertisingPayload {
    data: heapless::Vec<u8, ADV_PAYLOAD_MAX>,
}

impl AdvertisingPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), AdvertisementDataError> {
        self.data.extend_from_slice(bytes).map_err(|_| AdvertisementDataError)
    }

    pub fn append_ad_structure(&mut self, src: &AdStructure<'_>) -> Result<(), AdvertisementDataError> {
        match src {
            AdStructure::Flags(flags) => {
                self.append(&[0x02, 0x01, *flags])?;
            }
            AdStructure::ServiceUuids128(uuids) => {
                self.append(&[(uuids.len() * 16 + 1) as u8, 0x07])?;
                for uuid in uuids.iter() {
                    self.append(uuid.as_raw())?;
                }
            }
            AdStructure::CompleteLocalName(name) => {
                // A scan response carries at most 29 bytes of name.
                let len = name.len().min(ADV_PAYLOAD_MAX - 2);
                self.append(&[(len + 1) as u8, 0x09])?;
                self.append(&name.as_bytes()[..len])?;
            }
            AdStructure::TxPowerLevel(level) => {
                self.append(&[0x02, 0x0a, *level as u8])?;
            }
            AdStructure::Unknown { ty, data } => {
                self.append(&[(data.len() + 1) as u8, *ty])?;
                self.append(data)?;
            }
        }
        Ok(())
    }
}

/// Build a payload from a list of AD structures.
pub fn create_advertising_data(ad: &[AdStructure<'_>]) -> Result<AdvertisingPayload, AdvertisementDataError> {
    let mut payload = AdvertisingPayload::new();
    for item in ad.iter() {
        payload.append_ad_structure(item)?;
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_advertisement_layout() {
        let uuid = Uuid::from_canonical("6e400000-0000-4e98-8024-bc5b71e0893e").unwrap();
        let payload = create_advertising_data(&[
            AdStructure::Flags(BR_EDR_NOT_SUPPORTED),
            AdStructure::ServiceUuids128(core::slice::from_ref(&uuid)),
            AdStructure::TxPowerLevel(0),
        ])
        .unwrap();

        let bytes = payload.as_bytes();
        assert_eq!(bytes.len(), 3 + 18 + 3);
        // Flags: len=2, type=0x01, LE general discoverable value 0x04.
        assert_eq!(&bytes[..3], &[0x02, 0x01, 0x04]);
        // Complete 128-bit service UUID list, little endian on the wire.
        assert_eq!(&bytes[3..5], &[17, 0x07]);
        assert_eq!(bytes[5], 0x3e);
        assert_eq!(bytes[20], 0x6e);
        // TX power placeholder.
        assert_eq!(&bytes[21..24], &[0x02, 0x0a, 0x00]);
    }

    #[test]
    fn local_name_is_truncated_to_29() {
        let name = "X".repeat(40);
        let mut payload = AdvertisingPayload::new();
        payload
            .append_ad_structure(&AdStructure::CompleteLocalName(&name))
            .unwrap();
        let bytes = payload.as_bytes();
        assert_eq!(bytes.len(), 31);
        assert_eq!(bytes[0], 30); // 29 name bytes + type
        assert_eq!(bytes[1], 0x09);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let uuids = [Uuid::new_long([0u8; 16]), Uuid::new_long([1u8; 16])];
        assert!(create_advertising_data(&[
            AdStructure::Flags(BR_EDR_NOT_SUPPORTED),
            AdStructure::ServiceUuids128(&uuids),
        ])
        .is_err());
    }
}
