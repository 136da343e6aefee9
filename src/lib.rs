#![allow(async_fn_in_trait)]

//! BLE Wi-Fi provisioning agent for headless Linux devices.
//!
//! The agent advertises a custom GATT service over the kernel HCI socket,
//! accepts a single LE-ATT connection on the fixed ATT channel, and serves a
//! minimal attribute server whose one writable characteristic carries a JSON
//! credential payload. Credentials are applied through a [`wifi::WifiConfigurator`]
//! and the outcome is pushed back to the central as notifications.

pub(crate) const ATT_MTU: usize = 23;

/// Largest notification payload under the fixed MTU (opcode + handle overhead).
pub const NOTIFY_MAX_PAYLOAD: usize = ATT_MTU - 3;

mod codec;
mod cursor;
pub(crate) mod types;

pub mod ad_structure;
pub mod att;
pub mod attribute;
pub mod attribute_server;
pub mod device_name;
pub mod hci;
pub mod l2cap;
pub mod provision;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod wifi;

pub use types::uuid::Uuid;

use ad_structure::AdvertisementDataError;

/// Errors surfaced by the BLE side of the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hci: {0}")]
    Hci(#[from] hci::HciError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("advertisement: {0}")]
    Advertisement(#[from] AdvertisementDataError),
    #[error("codec error")]
    Codec(codec::Error),
    #[error("no client connected before the idle deadline")]
    IdleTimeout,
    #[error("cancelled by shutdown request")]
    Cancelled,
    #[error("attribute not found")]
    NotFound,
    #[error("invalid uuid length {0}")]
    InvalidUuidLength(usize),
    #[error("invalid uuid string")]
    InvalidUuid,
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        Self::Codec(error)
    }
}
