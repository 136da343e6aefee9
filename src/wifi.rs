//! Wi-Fi configurator gateway.
//!
//! The session talks to an injected [`WifiConfigurator`]; the production
//! implementation shells out to NetworkManager's `nmcli` and polls the
//! interface for an address. The link-alive probe keeps the call cancellable
//! while the BLE central may vanish underneath it.

use std::net::Ipv4Addr;
use std::time::Duration;

use log::{debug, info, warn};

/// Typed failures from the configurator, each with its wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("payload is not valid JSON")]
    BadFormat,
    #[error("payload has no usable ssid")]
    BadSsid,
    #[error("network manager command could not be run")]
    CommandFailed,
    #[error("association was not activated")]
    ConnectFailed,
    #[error("BLE link lost during configuration")]
    LinkLost,
    #[error("no address acquired in time")]
    NoIp,
}

impl ConfigError {
    /// The `err` code carried in the JSON reply.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad fmt",
            Self::BadSsid => "bad ssid",
            Self::CommandFailed => "cmd fail",
            Self::ConnectFailed => "conn fail",
            Self::LinkLost => "BLE lost",
            Self::NoIp => "no ip",
        }
    }
}

/// Applies credentials to the host and reports the acquired address.
///
/// `link_alive` is polled between blocking steps; when it reports `false`
/// the configurator aborts with [`ConfigError::LinkLost`].
pub trait WifiConfigurator {
    async fn configure(
        &self,
        ssid: &str,
        password: Option<&str>,
        link_alive: &dyn Fn() -> bool,
    ) -> Result<Ipv4Addr, ConfigError>;
}

/// Captured output of one helper command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

/// Seam for running helper commands, so the nmcli flow is testable.
pub trait CommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the host, folding stderr into the captured output the
/// way the shell `2>&1` redirection would.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let out = tokio::process::Command::new(program).args(args).output().await?;
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(CommandOutput {
            success: out.status.success(),
            output,
        })
    }
}

const ACTIVATED_MARKER: &str = "successfully activated";
const NOT_FOUND_MARKER: &str = "No network with SSID";

/// How long to poll the interface for an address after association, in
/// one-second rounds. Kept short so the BLE side never starves.
const IP_POLL_ROUNDS: u32 = 1;

/// NetworkManager-backed configurator.
pub struct NmcliConfigurator<R = SystemRunner> {
    interface: String,
    runner: R,
}

impl NmcliConfigurator<SystemRunner> {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            runner: SystemRunner,
        }
    }
}

impl<R: CommandRunner> NmcliConfigurator<R> {
    pub fn with_runner(interface: impl Into<String>, runner: R) -> Self {
        Self {
            interface: interface.into(),
            runner,
        }
    }

    /// The SSID the host is currently associated with, if any.
    async fn current_ssid(&self) -> Option<String> {
        let out = match self.runner.run("nmcli", &["-t", "-f", "active,ssid", "dev", "wifi"]).await {
            Ok(out) => out,
            Err(err) => {
                warn!("[wifi] failed to query active ssid: {err}");
                return None;
            }
        };
        out.output
            .lines()
            .find_map(|line| line.strip_prefix("yes:"))
            .map(str::to_owned)
    }

    /// First IPv4 address on the Wi-Fi interface, if any.
    async fn interface_ip(&self) -> Option<Ipv4Addr> {
        let out = match self.runner.run("ip", &["-4", "addr", "show", &self.interface]).await {
            Ok(out) => out,
            Err(err) => {
                warn!("[wifi] failed to query interface address: {err}");
                return None;
            }
        };
        for line in out.output.lines() {
            if let Some(rest) = line.trim_start().strip_prefix("inet ") {
                let addr = rest.split(['/', ' ']).next()?;
                if let Ok(ip) = addr.parse::<Ipv4Addr>() {
                    return Some(ip);
                }
            }
        }
        None
    }

    async fn request_association(&self, ssid: &str, password: Option<&str>) -> Result<CommandOutput, ConfigError> {
        let mut args = vec!["device", "wifi", "connect", ssid];
        if let Some(pw) = password {
            args.push("password");
            args.push(pw);
        }
        info!("[wifi] connecting to '{ssid}' ({})", if password.is_some() { "secured" } else { "open" });
        let out = self.runner.run("nmcli", &args).await.map_err(|err| {
            warn!("[wifi] nmcli could not be executed: {err}");
            ConfigError::CommandFailed
        })?;
        debug!("[wifi] nmcli output: {}", out.output.trim_end());
        Ok(out)
    }

    /// Remove saved Wi-Fi profiles other than the one just configured.
    async fn remove_stale_profiles(&self, keep: &str) {
        let out = match self
            .runner
            .run("nmcli", &["-t", "-f", "name,type", "connection", "show"])
            .await
        {
            Ok(out) => out,
            Err(err) => {
                warn!("[wifi] failed to list connections: {err}");
                return;
            }
        };
        for line in out.output.lines() {
            let Some((name, kind)) = line.split_once(':') else {
                continue;
            };
            if kind != "802-11-wireless" || name == keep {
                continue;
            }
            info!("[wifi] removing old connection profile '{name}'");
            if let Err(err) = self.runner.run("nmcli", &["connection", "delete", name]).await {
                warn!("[wifi] failed to delete profile '{name}': {err}");
            }
        }
    }
}

impl<R: CommandRunner> WifiConfigurator for NmcliConfigurator<R> {
    async fn configure(
        &self,
        ssid: &str,
        password: Option<&str>,
        link_alive: &dyn Fn() -> bool,
    ) -> Result<Ipv4Addr, ConfigError> {
        // Fast path: already on the target network with a routable address.
        if self.current_ssid().await.as_deref() == Some(ssid) {
            if let Some(ip) = self.interface_ip().await {
                info!("[wifi] already associated with '{ssid}', address {ip}");
                return Ok(ip);
            }
        }

        let mut out = self.request_association(ssid, password).await?;
        if !out.output.contains(ACTIVATED_MARKER) && out.output.contains(NOT_FOUND_MARKER) {
            // The network may simply be missing from the scan cache.
            info!("[wifi] '{ssid}' not in scan cache, scanning and retrying once");
            if let Err(err) = self
                .runner
                .run("nmcli", &["dev", "wifi", "list", "ifname", &self.interface])
                .await
            {
                warn!("[wifi] scan failed: {err}");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            out = self.request_association(ssid, password).await?;
        }
        if !out.output.contains(ACTIVATED_MARKER) || !out.success {
            return Err(ConfigError::ConnectFailed);
        }

        for _ in 0..IP_POLL_ROUNDS {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if !link_alive() {
                return Err(ConfigError::LinkLost);
            }
            if let Some(ip) = self.interface_ip().await {
                info!("[wifi] association complete, address {ip}");
                self.remove_stale_profiles(ssid).await;
                return Ok(ip);
            }
        }
        Err(ConfigError::NoIp)
    }
}
