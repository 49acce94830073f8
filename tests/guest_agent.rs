use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use qemu_monitor::{
    CancelToken, ErrorKind, ExecRequest, GuestAgent, GuestAgentOptions, NetworkModify,
    mock::{GuestAgentScript, MockExec, MockGuestAgent},
    qga::Sleeper,
    types::Command,
};
use serde_json::json;

/// Sleeper that returns immediately and counts how often it was asked to sleep.
#[derive(Default)]
struct CountingSleep {
    ticks: AtomicUsize,
}

impl Sleeper for CountingSleep {
    fn sleep<'a>(&'a self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        Box::pin(std::future::ready(()))
    }
}

async fn agent(server: &MockGuestAgent) -> qemu_monitor::Result<(GuestAgent, Arc<CountingSleep>)> {
    let sleeper = Arc::new(CountingSleep::default());
    let options = GuestAgentOptions::default().read_timeout(Duration::from_secs(2));
    let qga = GuestAgent::connect("vm-1", server.endpoint(), options)
        .await?
        .with_sleeper(sleeper.clone());
    Ok((qga, sleeper))
}

#[tokio::test]
async fn exec_waits_exactly_the_polls_needed() -> qemu_monitor::Result<()> {
    let server = MockGuestAgent::start_tcp(
        GuestAgentScript::new().exec(
            MockExec::exits_after(3)
                .exit_code(0)
                .stdout("Linux\n")
                .stderr("warn\n"),
        ),
    )
    .await?;
    let (qga, sleeper) = agent(&server).await?;

    let out = qga
        .run_command("/bin/uname", &["-s"], &["LANG=C"], b"", true, 10)
        .await?;
    assert!(out.success());
    assert_eq!(out.stdout, "Linux\n");
    assert_eq!(out.stderr, "warn\n");
    assert_eq!(sleeper.ticks.load(Ordering::SeqCst), 3);

    let exec = &server.received()[0];
    assert_eq!(exec["execute"], "guest-exec");
    assert_eq!(exec["arguments"]["arg"], json!(["-s"]));
    assert_eq!(exec["arguments"]["env"], json!(["LANG=C"]));
    assert!(exec["arguments"].get("input-data").is_none());
    assert_eq!(
        server.received_commands(),
        ["guest-exec", "guest-exec-status", "guest-exec-status", "guest-exec-status"]
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn output_is_empty_without_capture() -> qemu_monitor::Result<()> {
    let server =
        MockGuestAgent::start_tcp(GuestAgentScript::new().exec(MockExec::exits_after(1).stdout("x")))
            .await?;
    let (qga, _) = agent(&server).await?;

    let out = qga
        .command_with_timeout(&ExecRequest::new("/bin/echo").stdin("hi"), 5)
        .await?;
    assert_eq!(out.stdout, "");
    assert_eq!(server.received()[0]["arguments"]["input-data"], "aGk=");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn exec_timeout_reports_pid_and_waited_time() -> qemu_monitor::Result<()> {
    let server =
        MockGuestAgent::start_tcp(GuestAgentScript::new().exec(MockExec::never_exits())).await?;
    let sleeper = Arc::new(CountingSleep::default());
    let options = GuestAgentOptions::default()
        .poll_interval(Duration::from_millis(250))
        .exec_timeout_secs(4);
    let qga = GuestAgent::connect("vm-1", server.endpoint(), options)
        .await?
        .with_sleeper(sleeper.clone());

    // A non-positive timeout falls back to the configured budget.
    let err = qga
        .command_with_timeout(&ExecRequest::new("/bin/sleep").arg("60"), 0)
        .await
        .err()
        .expect("must time out");
    match err {
        qemu_monitor::Error::ExecTimeout { pid, waited } => {
            assert_eq!(pid, 1000);
            assert_eq!(waited, Duration::from_secs(1));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sleeper.ticks.load(Ordering::SeqCst), 4);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancel_stops_the_wait() -> qemu_monitor::Result<()> {
    let server =
        MockGuestAgent::start_tcp(GuestAgentScript::new().exec(MockExec::never_exits())).await?;
    let options = GuestAgentOptions::default().poll_interval(Duration::from_millis(10));
    let qga = GuestAgent::connect("vm-1", server.endpoint(), options).await?;

    let token = CancelToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = qga
        .command_with_cancel(&ExecRequest::new("/bin/sleep").arg("60"), 10_000, &token)
        .await
        .err()
        .expect("must be cancelled");
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    // The agent stays usable after an abandoned wait.
    qga.guest_ping(None).await?;

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn file_contents_round_trip_in_chunks() -> qemu_monitor::Result<()> {
    let server = MockGuestAgent::start_tcp(GuestAgentScript::new().file("/etc/hostname", "vm-1\n"))
        .await?;
    let (qga, _) = agent(&server).await?;

    assert_eq!(qga.file_get_contents("/etc/hostname").await?, b"vm-1\n");

    let big: Vec<u8> = (0..120 * 1024).map(|i| (i % 251) as u8).collect();
    qga.file_put_contents("/var/tmp/blob", &big).await?;
    assert_eq!(server.file("/var/tmp/blob").as_deref(), Some(big.as_slice()));
    assert_eq!(qga.file_get_contents("/var/tmp/blob").await?, big);
    assert_eq!(server.open_handles(), 0);

    let err = qga
        .file_get_contents("/nope")
        .await
        .err()
        .expect("missing file");
    assert_eq!(err.kind(), ErrorKind::Command);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn qga_command_checks_the_supported_list() -> qemu_monitor::Result<()> {
    let server = MockGuestAgent::start_tcp(
        GuestAgentScript::new()
            .disable("guest-exec")
            .remove("guest-get-osinfo"),
    )
    .await?;
    let (qga, _) = agent(&server).await?;

    let ping = qga.qga_command(&Command::new("guest-ping")).await?;
    assert_eq!(ping, Some(json!({})));

    let err = qga
        .qga_command(&Command::new("guest-get-osinfo"))
        .await
        .err()
        .expect("unknown command");
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let err = qga
        .qga_command(&Command::new("guest-exec"))
        .await
        .err()
        .expect("disabled command");
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // guest-shutdown never answers on success, so no reply is awaited.
    let none = qga.qga_command(&Command::new("guest-shutdown")).await?;
    assert_eq!(none, None);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn set_network_on_linux_writes_and_runs_a_script() -> qemu_monitor::Result<()> {
    let server = MockGuestAgent::start_tcp(GuestAgentScript::new()).await?;
    let (qga, _) = agent(&server).await?;

    let out = qga
        .set_network(&NetworkModify {
            device: "eth0".to_string(),
            ipmask: "10.0.0.5/24".to_string(),
            gateway: "10.0.0.1".to_string(),
        })
        .await?;
    assert!(out.success());

    let script = String::from_utf8(server.file("/tmp/qga-set-network.sh").expect("script"))
        .expect("utf8");
    assert!(script.starts_with("#!/bin/bash\n"));
    assert!(script.contains("/sbin/ip -4 address add 10.0.0.5/24 dev eth0\n"));
    assert!(script.contains("/sbin/ip route add default via 10.0.0.1 dev eth0\n"));

    let paths: Vec<_> = server
        .received()
        .iter()
        .filter(|r| r["execute"] == "guest-exec")
        .map(|r| r["arguments"]["path"].clone())
        .collect();
    assert_eq!(paths, [json!("/bin/bash"), json!("/tmp/qga-set-network.sh")]);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn set_network_on_windows_uses_netsh() -> qemu_monitor::Result<()> {
    let server = MockGuestAgent::start_tcp(GuestAgentScript::new().os_id("mswindows")).await?;
    let (qga, _) = agent(&server).await?;

    qga.set_network(&NetworkModify {
        device: "Ethernet".to_string(),
        ipmask: "192.168.1.20/24".to_string(),
        gateway: "192.168.1.1".to_string(),
    })
    .await?;

    let exec = server
        .received()
        .into_iter()
        .find(|r| r["execute"] == "guest-exec")
        .expect("exec sent");
    assert_eq!(exec["arguments"]["path"], "C:\\Windows\\System32\\cmd.exe");
    assert_eq!(
        exec["arguments"]["arg"],
        json!([
            "/c",
            "netsh interface ip set address name=\"Ethernet\" source=static addr=192.168.1.20 mask=255.255.255.0 gateway=192.168.1.1"
        ])
    );
    assert!(server.file("/tmp/qga-set-network.sh").is_none());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn redials_after_the_agent_hangs_up() -> qemu_monitor::Result<()> {
    let server = MockGuestAgent::start_tcp(GuestAgentScript::new().hang_up_once("guest-ping")).await?;
    let (qga, _) = agent(&server).await?;

    let err = qga.guest_ping(None).await.err().expect("hang up");
    assert_eq!(err.kind(), ErrorKind::Io);

    qga.guest_ping(None).await?;
    assert_eq!(server.received_commands(), ["guest-ping", "guest-ping"]);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn read_timeout_drops_the_connection() -> qemu_monitor::Result<()> {
    let server = MockGuestAgent::start_tcp(GuestAgentScript::new().silent("guest-ping")).await?;
    let (qga, _) = agent(&server).await?;

    let err = qga
        .guest_ping(Some(Duration::from_millis(50)))
        .await
        .err()
        .expect("no reply");
    assert_eq!(err.kind(), ErrorKind::Io);

    // The fresh connection is not confused by a late reply on the old one.
    let os = qga.get_os_info().await?;
    assert_eq!(os.id, "ubuntu");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn password_is_sent_base64_encoded() -> qemu_monitor::Result<()> {
    let server = MockGuestAgent::start_tcp(GuestAgentScript::new()).await?;
    let (qga, _) = agent(&server).await?;

    qga.set_user_password("root", "s3cret!", false).await?;
    assert_eq!(
        server.received()[0]["arguments"]["password"],
        "czNjcmV0IQ=="
    );
    assert_eq!(
        server.passwords(),
        [("root".to_string(), "s3cret!".to_string(), false)]
    );

    server.shutdown().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn works_over_a_unix_socket() -> qemu_monitor::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("qga.sock");
    let server = MockGuestAgent::start_unix(&path, GuestAgentScript::new())?;
    let (qga, _) = agent(&server).await?;

    assert!(qga.get_network_interfaces().await?.is_empty());
    assert!(qga.guest_info().await?.command("guest-exec").is_some());

    server.shutdown().await;
    Ok(())
}
