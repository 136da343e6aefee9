use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};

use provisiond::device_name::derive_device_name;
use provisiond::hci::HciController;
use provisiond::session::{Policy, SessionController, Shutdown};
use provisiond::supervisor::{Notice, SupervisorNotifier};
use provisiond::wifi::NmcliConfigurator;
use provisiond::Error;

/// BLE Wi-Fi provisioning agent.
///
/// Advertises the provisioning GATT service, accepts one central, applies
/// the received credentials and exits after the first success, the idle
/// deadline, or a termination signal.
#[derive(Parser, Debug)]
#[command(name = "provisiond", version)]
struct Args {
    /// Idle deadline in seconds: exit when no central connects in time.
    #[arg(short = 't', long = "timeout", default_value_t = 300,
          value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,

    /// Enable verbose ATT/GATT tracing.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// HCI controller index.
    #[arg(short = 'i', long = "hci", default_value_t = 0)]
    hci: u16,

    /// Wi-Fi interface being provisioned.
    #[arg(long = "wifi-interface", default_value = "wlan0")]
    wifi_interface: String,

    /// Successful provisionings after which a disconnect exits the agent.
    #[arg(long = "success-threshold", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..))]
    success_threshold: u32,
}

/// Force-disables advertising even on unwinding exit paths.
struct AdvertisingOffGuard(HciController);

impl Drop for AdvertisingOffGuard {
    fn drop(&mut self) {
        let _ = self.0.set_adv_enable(false);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    info!("provisiond starting (idle deadline {}s, hci{})", args.timeout, args.hci);

    let shutdown = Arc::new(Shutdown::new());
    spawn_signal_task(shutdown.clone());

    let supervisor = SupervisorNotifier::default();
    supervisor.notify(Notice::ConfigPending).await;

    let hci = HciController::new(args.hci);
    let _adv_off = AdvertisingOffGuard(hci);

    let code = match run_agent(&args, hci, supervisor.clone(), &shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err}");
            ExitCode::FAILURE
        }
    };

    // Advertising hygiene: the controller must never outlive us advertising.
    let _ = hci.set_adv_enable(false);
    supervisor.notify(Notice::ConfigStopped).await;
    supervisor.notify(Notice::WifiNotify).await;
    // Give the supervisor a moment to act on the terminal notice.
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("provisiond exiting");
    code
}

async fn run_agent(
    args: &Args,
    hci: HciController,
    supervisor: SupervisorNotifier,
    shutdown: &Shutdown,
) -> Result<(), Error> {
    hci.probe()?;

    let device_name = derive_device_name(&args.wifi_interface).await;
    let wifi = NmcliConfigurator::new(args.wifi_interface.clone());
    let policy = Policy {
        idle_deadline: Duration::from_secs(args.timeout),
        success_threshold: args.success_threshold,
    };

    let mut controller = SessionController::new(hci, wifi, supervisor, policy, device_name, args.verbose);
    controller.run(shutdown).await
}

fn spawn_signal_task(shutdown: Arc<Shutdown>) {
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("[signal] cannot install SIGINT handler: {err}");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("[signal] cannot install SIGTERM handler: {err}");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => info!("[signal] SIGINT received"),
            _ = sigterm.recv() => info!("[signal] SIGTERM received"),
        }
        shutdown.request();
    });
}
