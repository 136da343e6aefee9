//! Device name derivation.
//!
//! The advertised name is derived once at startup and never changes for the
//! process lifetime. Derivation order: Wi-Fi interface MAC, machine id,
//! epoch suffix, literal fallback.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};

const NAME_PREFIX: &str = "3RHUB-";
const FALLBACK_NAME: &str = "3RHUB-DEFAULT";
const MACHINE_ID_PATH: &str = "/etc/machine-id";

const MAC_ATTEMPTS: u32 = 3;
const MAC_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Read the interface MAC as 12 hex characters, no separators.
fn read_mac(interface: &str) -> Option<String> {
    let path = format!("/sys/class/net/{interface}/address");
    let raw = std::fs::read_to_string(path).ok()?;
    let mac: String = raw.trim().chars().filter(|c| *c != ':').collect();
    if mac.len() == 12 && mac.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(mac)
    } else {
        None
    }
}

async fn mac_with_retries(interface: &str) -> Option<String> {
    for attempt in 1..=MAC_ATTEMPTS {
        if let Some(mac) = read_mac(interface) {
            return Some(mac);
        }
        warn!("[name] no MAC for {interface} yet (attempt {attempt}/{MAC_ATTEMPTS})");
        if attempt < MAC_ATTEMPTS {
            tokio::time::sleep(MAC_RETRY_DELAY).await;
        }
    }
    None
}

fn from_machine_id(path: &str) -> Option<String> {
    let id = std::fs::read_to_string(path).ok()?;
    let id = id.trim();
    if id.len() < 6 {
        return None;
    }
    Some(format!("{NAME_PREFIX}{}", &id[id.len() - 6..]))
}

fn from_epoch() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{NAME_PREFIX}{:04X}", secs & 0xffff)
}

/// Derive the advertised device name for this boot of the agent.
pub async fn derive_device_name(interface: &str) -> String {
    let name = if let Some(mac) = mac_with_retries(interface).await {
        let mac = mac.to_uppercase();
        let suffix = &mac[mac.len().saturating_sub(8)..];
        format!("{NAME_PREFIX}{suffix}")
    } else if let Some(name) = from_machine_id(MACHINE_ID_PATH) {
        name
    } else {
        from_epoch()
    };

    let name = if name.len() > NAME_PREFIX.len() {
        name
    } else {
        FALLBACK_NAME.to_owned()
    };
    info!("[name] device name: {name}");
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn machine_id_uses_last_six_chars() {
        let mut file = tempfile_path("machine-id");
        writeln!(file.1, "0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(from_machine_id(&file.0).as_deref(), Some("3RHUB-abcdef"));
        std::fs::remove_file(&file.0).ok();
    }

    #[test]
    fn short_machine_id_is_rejected() {
        let mut file = tempfile_path("machine-id-short");
        writeln!(file.1, "0123").unwrap();
        assert_eq!(from_machine_id(&file.0), None);
        std::fs::remove_file(&file.0).ok();
    }

    #[test]
    fn epoch_name_shape() {
        let name = from_epoch();
        assert!(name.starts_with("3RHUB-"));
        assert_eq!(name.len(), "3RHUB-".len() + 4);
        assert!(name["3RHUB-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    fn tempfile_path(tag: &str) -> (String, std::fs::File) {
        let path = std::env::temp_dir().join(format!("provisiond-test-{tag}-{}", std::process::id()));
        let path = path.to_string_lossy().into_owned();
        (path.clone(), std::fs::File::create(path).unwrap())
    }
}
