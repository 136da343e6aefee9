//! End-to-end provisioning scenarios over an in-process socket pair.
//!
//! The central side drives raw ATT PDUs through an `AttTransport`, the
//! session side runs the real serve loop with a scripted configurator.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::os::fd::{FromRawFd as _, OwnedFd};
use std::time::{Duration, Instant};

use provisiond::session::{Session, SessionEnd, Shutdown};
use provisiond::supervisor::SupervisorNotifier;
use provisiond::transport::AttTransport;
use provisiond::wifi::{ConfigError, WifiConfigurator};

fn seqpacket_pair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(ret, 0, "socketpair failed");
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

struct MockWifi {
    result: Result<Ipv4Addr, ConfigError>,
    delay: Duration,
    seen: RefCell<Vec<(String, Option<String>)>>,
}

impl MockWifi {
    fn ok(ip: &str) -> Self {
        Self {
            result: Ok(ip.parse().unwrap()),
            delay: Duration::ZERO,
            seen: RefCell::new(Vec::new()),
        }
    }

    fn slow(ip: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::ok(ip)
        }
    }
}

impl WifiConfigurator for MockWifi {
    async fn configure(
        &self,
        ssid: &str,
        password: Option<&str>,
        _link_alive: &dyn Fn() -> bool,
    ) -> Result<Ipv4Addr, ConfigError> {
        self.seen
            .borrow_mut()
            .push((ssid.to_owned(), password.map(str::to_owned)));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result
    }
}

fn pdu(opcode: u8, handle: u16, data: &[u8]) -> Vec<u8> {
    let mut out = vec![opcode];
    out.extend_from_slice(&handle.to_le_bytes());
    out.extend_from_slice(data);
    out
}

async fn recv(central: &AttTransport) -> Vec<u8> {
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), central.read(&mut buf))
        .await
        .expect("timed out waiting for a PDU")
        .expect("read failed");
    buf[..n].to_vec()
}

async fn subscribe(central: &AttTransport, cccd: u16) {
    central.send(&pdu(0x12, cccd, &[0x01, 0x00])).await.unwrap();
    assert_eq!(recv(central).await, vec![0x13]);
}

fn quiet_supervisor() -> SupervisorNotifier {
    SupervisorNotifier::new("/nonexistent/provisiond-test-supervisor")
}

#[tokio::test]
async fn open_network_happy_path_fragments_the_reply() {
    let _ = env_logger::try_init();
    let (server_fd, central_fd) = seqpacket_pair();
    let mut session = Session::new(server_fd, "3RHUB-TEST", true).unwrap();
    let wifi_char = session.wifi_characteristic();
    let central = AttTransport::new(central_fd, false).unwrap();

    let wifi = MockWifi::ok("192.168.1.42");
    let shutdown = Shutdown::new();
    let supervisor = quiet_supervisor();

    let (outcome, ()) = tokio::join!(session.run(&wifi, &supervisor, &shutdown), async {
        subscribe(&central, wifi_char.cccd_handle().unwrap()).await;

        central
            .send(&pdu(0x12, wifi_char.handle(), b"{\"ssid\":\"Cafe\"}\n"))
            .await
            .unwrap();
        // Immediate ATT ack, before any notification.
        assert_eq!(recv(&central).await, vec![0x13]);

        // 21-byte reply + newline, fragmented into 20 + 2.
        let first = recv(&central).await;
        assert_eq!(first[0], 0x1b);
        assert_eq!(u16::from_le_bytes([first[1], first[2]]), wifi_char.handle());
        assert_eq!(first.len(), 3 + 20);
        let second = recv(&central).await;
        assert_eq!(second[0], 0x1b);

        let mut reply = first[3..].to_vec();
        reply.extend_from_slice(&second[3..]);
        assert_eq!(reply, b"{\"ip\":\"192.168.1.42\"}\n");
        drop(central);
    });

    assert_eq!(outcome.successes, 1);
    assert_eq!(outcome.end, SessionEnd::Disconnected);
    assert_eq!(wifi.seen.borrow().as_slice(), &[("Cafe".to_owned(), None)]);
}

#[tokio::test]
async fn malformed_json_yields_bad_fmt() {
    let _ = env_logger::try_init();
    let (server_fd, central_fd) = seqpacket_pair();
    let mut session = Session::new(server_fd, "3RHUB-TEST", false).unwrap();
    let wifi_char = session.wifi_characteristic();
    let central = AttTransport::new(central_fd, false).unwrap();

    let wifi = MockWifi::ok("10.0.0.1");
    let shutdown = Shutdown::new();
    let supervisor = quiet_supervisor();

    let (outcome, ()) = tokio::join!(session.run(&wifi, &supervisor, &shutdown), async {
        subscribe(&central, wifi_char.cccd_handle().unwrap()).await;
        central
            .send(&pdu(0x12, wifi_char.handle(), b"not json\n"))
            .await
            .unwrap();
        assert_eq!(recv(&central).await, vec![0x13]);

        let ntf = recv(&central).await;
        assert_eq!(&ntf[3..], b"{\"err\":\"bad fmt\"}");
        drop(central);
    });

    assert_eq!(outcome.successes, 0);
    assert!(wifi.seen.borrow().is_empty(), "configurator must not run on a parse error");
}

#[tokio::test]
async fn missing_ssid_yields_bad_ssid() {
    let _ = env_logger::try_init();
    let (server_fd, central_fd) = seqpacket_pair();
    let mut session = Session::new(server_fd, "3RHUB-TEST", false).unwrap();
    let wifi_char = session.wifi_characteristic();
    let central = AttTransport::new(central_fd, false).unwrap();

    let wifi = MockWifi::ok("10.0.0.1");
    let shutdown = Shutdown::new();
    let supervisor = quiet_supervisor();

    let (outcome, ()) = tokio::join!(session.run(&wifi, &supervisor, &shutdown), async {
        subscribe(&central, wifi_char.cccd_handle().unwrap()).await;
        central
            .send(&pdu(0x12, wifi_char.handle(), b"{\"pw\":\"x\"}\n"))
            .await
            .unwrap();
        assert_eq!(recv(&central).await, vec![0x13]);
        assert_eq!(&recv(&central).await[3..], b"{\"err\":\"bad ssid\"}");
        drop(central);
    });

    assert_eq!(outcome.successes, 0);
}

#[tokio::test]
async fn link_lost_mid_provisioning_drops_the_reply() {
    let _ = env_logger::try_init();
    let (server_fd, central_fd) = seqpacket_pair();
    let mut session = Session::new(server_fd, "3RHUB-TEST", false).unwrap();
    let wifi_char = session.wifi_characteristic();
    let central = AttTransport::new(central_fd, false).unwrap();

    // Far slower than the disconnect-observation budget.
    let wifi = MockWifi::slow("10.0.0.1", Duration::from_secs(30));
    let shutdown = Shutdown::new();
    let supervisor = quiet_supervisor();

    let started = Instant::now();
    let (outcome, ()) = tokio::join!(session.run(&wifi, &supervisor, &shutdown), async {
        subscribe(&central, wifi_char.cccd_handle().unwrap()).await;
        central
            .send(&pdu(0x12, wifi_char.handle(), b"{\"ssid\":\"Cafe\"}\n"))
            .await
            .unwrap();
        assert_eq!(recv(&central).await, vec![0x13]);
        // Vanish while the configurator is still working.
        drop(central);
    });

    assert_eq!(outcome.successes, 0);
    assert_eq!(outcome.end, SessionEnd::Disconnected);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "disconnect must be observed within a second, took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn unsubscribed_reply_is_dropped_but_success_counts() {
    let _ = env_logger::try_init();
    let (server_fd, central_fd) = seqpacket_pair();
    let mut session = Session::new(server_fd, "3RHUB-TEST", false).unwrap();
    let wifi_char = session.wifi_characteristic();
    let central = AttTransport::new(central_fd, false).unwrap();

    let wifi = MockWifi::ok("10.0.0.9");
    let shutdown = Shutdown::new();
    let supervisor = quiet_supervisor();

    let (outcome, ()) = tokio::join!(session.run(&wifi, &supervisor, &shutdown), async {
        // No CCCD subscription.
        central
            .send(&pdu(0x12, wifi_char.handle(), b"{\"ssid\":\"Cafe\"}\n"))
            .await
            .unwrap();
        assert_eq!(recv(&central).await, vec![0x13]);

        // No notification may arrive while unsubscribed.
        let mut buf = [0u8; 64];
        let quiet = tokio::time::timeout(Duration::from_millis(300), central.read(&mut buf)).await;
        assert!(quiet.is_err(), "unexpected PDU while unsubscribed");
        drop(central);
    });

    assert_eq!(outcome.successes, 1);
}

#[tokio::test]
async fn long_write_reassembles_across_offsets() {
    let _ = env_logger::try_init();
    let (server_fd, central_fd) = seqpacket_pair();
    let mut session = Session::new(server_fd, "3RHUB-TEST", false).unwrap();
    let wifi_char = session.wifi_characteristic();
    let central = AttTransport::new(central_fd, false).unwrap();

    let wifi = MockWifi::ok("172.16.0.2");
    let shutdown = Shutdown::new();
    let supervisor = quiet_supervisor();

    let (outcome, ()) = tokio::join!(session.run(&wifi, &supervisor, &shutdown), async {
        subscribe(&central, wifi_char.cccd_handle().unwrap()).await;

        let parts: [(u16, &[u8]); 3] = [
            (0, b"{\"ssid\":\"L"),
            (10, b"ongNetName\",\""),
            (22, b"pw\":\"pass\"}\n"),
        ];
        for (offset, value) in parts {
            let mut prep = vec![0x16];
            prep.extend_from_slice(&wifi_char.handle().to_le_bytes());
            prep.extend_from_slice(&offset.to_le_bytes());
            prep.extend_from_slice(value);
            central.send(&prep).await.unwrap();
            let rsp = recv(&central).await;
            assert_eq!(rsp[0], 0x17);
        }
        central.send(&[0x18, 0x01]).await.unwrap();
        assert_eq!(recv(&central).await, vec![0x19]);

        let first = recv(&central).await;
        assert_eq!(first[0], 0x1b);
        drop(central);
    });

    assert_eq!(outcome.successes, 1);
    assert_eq!(
        wifi.seen.borrow().as_slice(),
        &[("LongNetName".to_owned(), Some("pass".to_owned()))]
    );
}

#[tokio::test]
async fn write_command_stream_provisions() {
    let _ = env_logger::try_init();
    let (server_fd, central_fd) = seqpacket_pair();
    let mut session = Session::new(server_fd, "3RHUB-TEST", false).unwrap();
    let wifi_char = session.wifi_characteristic();
    let central = AttTransport::new(central_fd, false).unwrap();

    let wifi = MockWifi::ok("10.1.1.1");
    let shutdown = Shutdown::new();
    let supervisor = quiet_supervisor();

    let (outcome, ()) = tokio::join!(session.run(&wifi, &supervisor, &shutdown), async {
        subscribe(&central, wifi_char.cccd_handle().unwrap()).await;

        // Write-without-response fragments, newline-delimited.
        for fragment in [&b"{\"ssid\":\"Ca"[..], &b"fe\",\"pw\":\"se"[..], &b"cret\"}\n"[..]] {
            central.send(&pdu(0x52, wifi_char.handle(), fragment)).await.unwrap();
        }

        // No ATT responses for write commands; the next PDU is the reply.
        let first = recv(&central).await;
        assert_eq!(first[0], 0x1b);
        drop(central);
    });

    assert_eq!(outcome.successes, 1);
    assert_eq!(
        wifi.seen.borrow().as_slice(),
        &[("Cafe".to_owned(), Some("secret".to_owned()))]
    );
}

#[tokio::test]
async fn shutdown_request_ends_the_session() {
    let _ = env_logger::try_init();
    let (server_fd, central_fd) = seqpacket_pair();
    let mut session = Session::new(server_fd, "3RHUB-TEST", false).unwrap();
    let central = AttTransport::new(central_fd, false).unwrap();

    let wifi = MockWifi::ok("10.0.0.1");
    let shutdown = Shutdown::new();
    let supervisor = quiet_supervisor();

    let (outcome, ()) = tokio::join!(session.run(&wifi, &supervisor, &shutdown), async {
        shutdown.request();
        // Keep the link up so the only wake reason is the shutdown flag.
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(central);
    });

    assert_eq!(outcome.end, SessionEnd::ShutdownRequested);
}
