//! Session lifecycle: advertise, accept, serve, decide.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::Notify;

use crate::ad_structure::{create_advertising_data, AdStructure, AdvertisingPayload, BR_EDR_NOT_SUPPORTED};
use crate::att;
use crate::attribute::{AttributeTable, Characteristic, CharacteristicProp, Service};
use crate::attribute_server::AttributeServer;
use crate::hci::HciController;
use crate::l2cap;
use crate::provision::{fragment_reply, parse_request, Reply};
use crate::supervisor::{Notice, SupervisorNotifier};
use crate::transport::AttTransport;
use crate::wifi::{ConfigError, WifiConfigurator};
use crate::{Error, Uuid, ATT_MTU};

/// Canonical identifier of the provisioning service.
pub const WIFI_SERVICE_UUID: &str = "6e400000-0000-4e98-8024-bc5b71e0893e";

/// Canonical identifier of the single provisioning characteristic.
pub const WIFI_CHARACTERISTIC_UUID: &str = "6e400001-0000-4e98-8024-bc5b71e0893e";

/// Delay between notification fragments on the fixed 23-byte MTU.
const CHUNK_DELAY: Duration = Duration::from_millis(50);

/// Pause before re-advertising after a disconnect.
const REARM_DELAY: Duration = Duration::from_secs(1);

/// Cooperative shutdown flag shared with the signal task.
///
/// The signal side only stores a flag and wakes waiters; everything else
/// happens on the main loop.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once a shutdown has been requested.
    pub async fn requested(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Lifecycle policy for the outer state machine.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    /// How long to advertise with no accepted central before giving up.
    pub idle_deadline: Duration,
    /// Number of successful provisionings after which a disconnect
    /// terminates the agent.
    pub success_threshold: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            idle_deadline: Duration::from_secs(300),
            success_threshold: 1,
        }
    }
}

/// Why a session's serve loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected,
    ShutdownRequested,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOutcome {
    pub successes: u32,
    pub end: SessionEnd,
}

enum MessageResult {
    /// A reply was produced (and sent, subscription permitting).
    Replied { success: bool },
    /// The central vanished; no reply may be sent.
    LinkLost,
}

/// Build the per-session GATT tree: GAP, GATT, then the Wi-Fi service.
fn build_attribute_table(device_name: &str) -> Result<(AttributeTable, Characteristic), Error> {
    let mut table = AttributeTable::new();

    let mut gap = table.add_service(Service::new(0x1800));
    gap.add_characteristic_ro(0x2a00, device_name.as_bytes());
    gap.add_characteristic_ro(0x2a01, &[0x00, 0x00]);
    drop(gap);

    let mut gatt = table.add_service(Service::new(0x1801));
    gatt.add_characteristic(0x2a05, &[CharacteristicProp::Indicate], vec![0u8; 4]);
    drop(gatt);

    let service_uuid = Uuid::from_canonical(WIFI_SERVICE_UUID)?;
    let char_uuid = Uuid::from_canonical(WIFI_CHARACTERISTIC_UUID)?;
    let mut wifi = table.add_service(Service::new(service_uuid));
    let mut chr = wifi.add_characteristic_wo(
        char_uuid,
        &[
            CharacteristicProp::Write,
            CharacteristicProp::WriteWithoutResponse,
            CharacteristicProp::Notify,
        ],
    );
    chr.add_descriptor_ro(0x2901, b"WiFi Configuration");
    let characteristic = chr.build();
    drop(wifi);

    Ok((table, characteristic))
}

/// One accepted connection: the ATT transport plus the session GATT server.
///
/// Never reused; a disconnect destroys it and the controller decides what
/// happens next.
pub struct Session {
    transport: AttTransport,
    server: AttributeServer,
}

impl Session {
    pub fn new(fd: OwnedFd, device_name: &str, verbose: bool) -> Result<Self, Error> {
        let (table, wifi_char) = build_attribute_table(device_name)?;
        Ok(Self {
            transport: AttTransport::new(fd, verbose)?,
            server: AttributeServer::new(table, wifi_char),
        })
    }

    pub fn wifi_characteristic(&self) -> Characteristic {
        self.server.wifi_characteristic()
    }

    /// Serve ATT requests until the central disconnects or a shutdown is
    /// requested.
    pub async fn run<W: WifiConfigurator>(
        &mut self,
        wifi: &W,
        supervisor: &SupervisorNotifier,
        shutdown: &Shutdown,
    ) -> SessionOutcome {
        let mut successes = 0;
        let mut buf = [0u8; 64];
        loop {
            let n = tokio::select! {
                _ = shutdown.requested() => {
                    return SessionOutcome {
                        successes,
                        end: SessionEnd::ShutdownRequested,
                    }
                }
                read = self.transport.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("[session] central disconnected");
                        return SessionOutcome {
                            successes,
                            end: SessionEnd::Disconnected,
                        };
                    }
                    Ok(n) => n,
                    Err(err) => {
                        info!("[session] link error: {err}");
                        return SessionOutcome {
                            successes,
                            end: SessionEnd::Disconnected,
                        };
                    }
                },
            };

            let processed = self.server.process(&buf[..n]);
            // The ATT acknowledgement always goes out before any work the
            // write may have triggered.
            if let Some(response) = processed.response {
                if let Err(err) = self.transport.send(&response).await {
                    info!("[session] failed to send response: {err}");
                    return SessionOutcome {
                        successes,
                        end: SessionEnd::Disconnected,
                    };
                }
            }
            if let Some(message) = processed.message {
                match self.handle_message(&message, wifi, supervisor).await {
                    MessageResult::Replied { success } => {
                        if success {
                            successes += 1;
                        }
                    }
                    MessageResult::LinkLost => {
                        return SessionOutcome {
                            successes,
                            end: SessionEnd::Disconnected,
                        }
                    }
                }
            }
        }
    }

    async fn handle_message<W: WifiConfigurator>(
        &self,
        message: &[u8],
        wifi: &W,
        supervisor: &SupervisorNotifier,
    ) -> MessageResult {
        supervisor.notify(Notice::Configuring).await;

        let outcome = match parse_request(message) {
            Ok(request) => {
                info!("[session] provisioning ssid '{}'", request.ssid);
                let probe = || self.transport.is_alive();
                tokio::select! {
                    result = wifi.configure(&request.ssid, request.password.as_deref(), &probe) => result,
                    _ = self.transport.closed() => Err(ConfigError::LinkLost),
                }
            }
            Err(err) => Err(err),
        };

        match &outcome {
            Ok(ip) => {
                info!("[session] provisioned, address {ip}");
                supervisor.notify(Notice::ConfigSuccess).await;
            }
            Err(ConfigError::LinkLost) => {
                info!("[session] central lost during provisioning, dropping reply");
                return MessageResult::LinkLost;
            }
            Err(ConfigError::NoIp) => {
                supervisor.notify(Notice::ConfigPending).await;
            }
            Err(err) => {
                warn!("[session] provisioning failed: {err}");
            }
        }

        let success = outcome.is_ok();
        if let Some(reply) = Reply::from_outcome(outcome) {
            self.send_reply(&reply).await;
        }
        MessageResult::Replied { success }
    }

    /// Push the reply, gated on subscription and link state.
    async fn send_reply(&self, reply: &Reply) {
        if !self.server.notifications_enabled() {
            warn!("[session] central not subscribed, dropping reply");
            return;
        }
        if !self.transport.is_alive() {
            info!("[session] link down, dropping reply");
            return;
        }

        let bytes = reply.to_bytes();
        let chunks = fragment_reply(&bytes);
        let handle = self.server.wifi_characteristic().handle();
        let mut pdu = [0u8; ATT_MTU];
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(CHUNK_DELAY).await;
            }
            // Chunks are cut to MTU - 3, so encoding cannot fail.
            let len = att::encode_notification(handle, chunk, &mut pdu).unwrap();
            if let Err(err) = self.transport.send(&pdu[..len]).await {
                warn!("[session] notification failed ({err}), aborting remaining chunks");
                return;
            }
        }
    }
}

/// The outer state machine driving advertise → accept → serve → decide.
pub struct SessionController<W> {
    hci: HciController,
    wifi: W,
    supervisor: SupervisorNotifier,
    policy: Policy,
    device_name: String,
    verbose: bool,
    advertising: bool,
}

impl<W: WifiConfigurator> SessionController<W> {
    pub fn new(
        hci: HciController,
        wifi: W,
        supervisor: SupervisorNotifier,
        policy: Policy,
        device_name: String,
        verbose: bool,
    ) -> Self {
        Self {
            hci,
            wifi,
            supervisor,
            policy,
            device_name,
            verbose,
            advertising: false,
        }
    }

    /// Run until the first post-success disconnect, the idle deadline, or a
    /// shutdown request. Advertising is stopped on every exit path.
    pub async fn run(&mut self, shutdown: &Shutdown) -> Result<(), Error> {
        let mut success_count = 0u32;
        let result = loop {
            if shutdown.is_requested() {
                break Ok(());
            }
            if let Err(err) = self.start_advertising() {
                break Err(err);
            }

            match l2cap::listen_and_accept(
                l2cap::BDADDR_ANY,
                l2cap::BT_SECURITY_LOW,
                l2cap::BDADDR_LE_PUBLIC,
                self.policy.idle_deadline,
                shutdown,
            )
            .await
            {
                Ok(fd) => {
                    self.stop_advertising();
                    let mut session = match Session::new(fd, &self.device_name, self.verbose) {
                        Ok(session) => session,
                        Err(err) => break Err(err),
                    };
                    let outcome = session.run(&self.wifi, &self.supervisor, shutdown).await;
                    success_count += outcome.successes;

                    if outcome.end == SessionEnd::ShutdownRequested || shutdown.is_requested() {
                        break Ok(());
                    }
                    if success_count >= self.policy.success_threshold {
                        info!(
                            "[session] {success_count} network(s) provisioned and central disconnected, exiting"
                        );
                        break Ok(());
                    }
                    tokio::time::sleep(REARM_DELAY).await;
                }
                Err(Error::IdleTimeout) => {
                    info!(
                        "[session] no central connected for {}s, exiting",
                        self.policy.idle_deadline.as_secs()
                    );
                    break Ok(());
                }
                Err(Error::Cancelled) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.stop_advertising();
        result
    }

    fn start_advertising(&mut self) -> Result<(), Error> {
        if self.advertising {
            return Ok(());
        }
        // Known-clean state first; the controller may still be advertising
        // from a previous crashed run.
        let _ = self.hci.set_adv_enable(false);
        self.hci.set_adv_params()?;
        self.hci.set_adv_data(&advertising_payload()?)?;
        self.hci.set_scan_response(&scan_response_payload(&self.device_name)?)?;
        self.hci.set_adv_enable(true)?;
        self.advertising = true;
        info!("[adv] advertising as '{}'", self.device_name);
        Ok(())
    }

    fn stop_advertising(&mut self) {
        if !self.advertising {
            return;
        }
        if let Err(err) = self.hci.set_adv_enable(false) {
            warn!("[adv] failed to disable advertising: {err}");
        }
        let empty = AdvertisingPayload::new();
        let _ = self.hci.set_adv_data(&empty);
        let _ = self.hci.set_scan_response(&empty);
        self.advertising = false;
        info!("[adv] advertising stopped");
    }
}

/// Advertising payload: flags, the 128-bit service UUID, a TX power
/// placeholder.
fn advertising_payload() -> Result<AdvertisingPayload, Error> {
    let uuid = Uuid::from_canonical(WIFI_SERVICE_UUID)?;
    Ok(create_advertising_data(&[
        AdStructure::Flags(BR_EDR_NOT_SUPPORTED),
        AdStructure::ServiceUuids128(core::slice::from_ref(&uuid)),
        AdStructure::TxPowerLevel(0),
    ])?)
}

/// Scan response payload: the local name only.
fn scan_response_payload(device_name: &str) -> Result<AdvertisingPayload, Error> {
    Ok(create_advertising_data(&[AdStructure::CompleteLocalName(device_name)])?)
}
