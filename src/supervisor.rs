//! Notices to the local supervisor helper.
//!
//! A helper executable at a well-known path drives the indicator LED and
//! records UX transitions. The helper being absent is a normal condition on
//! development hosts and never fails the agent.

use std::path::PathBuf;

use log::{debug, warn};

/// Default location of the supervisor helper.
pub const SUPERVISOR_PATH: &str = "/usr/local/bin/supervisor";

/// The UX transitions the agent reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// Waiting for a central to start provisioning.
    ConfigPending,
    /// A credential payload arrived and is being applied.
    Configuring,
    /// The host acquired an address on the requested network.
    ConfigSuccess,
    /// Provisioning mode ended.
    ConfigStopped,
    /// Terminal notice, sent once right before the process exits.
    WifiNotify,
}

impl Notice {
    fn args(&self) -> &'static [&'static str] {
        match self {
            Notice::ConfigPending => &["led", "sys_wifi_config_pending"],
            Notice::Configuring => &["led", "sys_wifi_configuring"],
            Notice::ConfigSuccess => &["led", "sys_wifi_config_success"],
            Notice::ConfigStopped => &["led", "sys_wifi_config_stopped"],
            Notice::WifiNotify => &["setting", "wifi_notify"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorNotifier {
    path: PathBuf,
}

impl Default for SupervisorNotifier {
    fn default() -> Self {
        Self::new(SUPERVISOR_PATH)
    }
}

impl SupervisorNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn notify(&self, notice: Notice) {
        if !self.path.exists() {
            debug!("[supervisor] helper missing, skipping {notice:?}");
            return;
        }
        match tokio::process::Command::new(&self.path).args(notice.args()).status().await {
            Ok(status) if status.success() => debug!("[supervisor] sent {notice:?}"),
            Ok(status) => warn!("[supervisor] {notice:?} exited with {status}"),
            Err(err) => warn!("[supervisor] failed to send {notice:?}: {err}"),
        }
    }
}
