use std::{collections::BTreeMap, time::Duration};

use qemu_monitor::{
    ErrorKind, HmpMonitor, Monitor, MonitorBuilder, MonitorHooks, MonitorOptions, MonitorState,
    mock::{HmpScript, MockHmpServer},
};
use tokio::{sync::mpsc, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting")
        .expect("channel closed")
}

fn sender(tx: &mpsc::UnboundedSender<String>) -> Box<dyn FnOnce(String) + Send> {
    let tx = tx.clone();
    Box::new(move |s| {
        let _ = tx.send(s);
    })
}

async fn connect(server: &MockHmpServer, hooks: MonitorHooks) -> qemu_monitor::Result<HmpMonitor> {
    MonitorBuilder::new("vm-1")
        .hooks(hooks)
        .connect_hmp(&server.endpoint())
        .await
}

#[tokio::test]
async fn banner_completes_the_handshake() -> qemu_monitor::Result<()> {
    let script = HmpScript::new()
        .reply("info status", "VM status: paused (prelaunch)\r\n")
        .reply(
            "info version",
            "8.2.2 (pve-qemu-kvm_8.2.2-1)\r\n",
        );
    let server = MockHmpServer::start_tcp(script).await?;

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let monitor = connect(
        &server,
        MonitorHooks::new().on_connected(move || {
            let _ = conn_tx.send(());
        }),
    )
    .await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    monitor.query_status(sender(&tx));
    monitor.get_version(sender(&tx));

    recv(&mut conn_rx).await;
    assert_eq!(recv(&mut rx).await, "paused");
    assert_eq!(recv(&mut rx).await, "8.2.2");
    assert_eq!(monitor.state(), MonitorState::Connected);
    assert_eq!(server.received(), ["info status", "info version"]);

    monitor.disconnect();
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn replies_have_the_echo_removed() -> qemu_monitor::Result<()> {
    let server = MockHmpServer::start_tcp(
        HmpScript::new()
            .reply("info name", "vm-100\r\n")
            .reply("device_del net0", ""),
    )
    .await?;
    let monitor = HmpMonitor::connect(
        "vm-1",
        &server.endpoint(),
        MonitorOptions::default(),
        MonitorHooks::new(),
    )
    .await?;

    assert_eq!(monitor.execute("info name").await?, "vm-100\n");
    assert_eq!(monitor.execute("  device_del net0  ").await?, "");
    assert_eq!(
        monitor.execute("frobnicate now").await?,
        "unknown command: 'frobnicate'\n"
    );

    monitor.disconnect();
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn empty_frames_do_not_consume_callbacks() -> qemu_monitor::Result<()> {
    // A stray prompt in front of the real answer.
    let server = MockHmpServer::start_tcp(HmpScript::new().reply_raw(
        "info status",
        "(qemu) info status\r\nVM status: running\r\n(qemu) ",
    ))
    .await?;
    let monitor = connect(&server, MonitorHooks::new()).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    monitor.query_status(sender(&tx));
    assert_eq!(recv(&mut rx).await, "running");
    assert_eq!(monitor.pending(), 0);

    monitor.disconnect();
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn counting_queries_parse_info_output() -> qemu_monitor::Result<()> {
    let script = HmpScript::new()
        .reply(
            "info cpus",
            "* CPU #0: thread_id=4100\r\n  CPU #1: thread_id=4101\r\n  CPU #2: thread_id=4102\r\n",
        )
        .reply(
            "info memory-devices",
            "Memory device [dimm]: \"mem1\"\r\n  addr: 0x100000000\r\n  slot: 0\r\n\
             Memory device [dimm]: \"mem2\"\r\n  addr: 0x140000000\r\n  slot: 1\r\n",
        );
    let server = MockHmpServer::start_tcp(script).await?;
    let monitor = connect(&server, MonitorHooks::new()).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let cpus = tx.clone();
    monitor.get_cpu_count(Box::new(move |n| {
        let _ = cpus.send(n);
    }));
    monitor.get_memory_slot_count(Box::new(move |n| {
        let _ = tx.send(n);
    }));
    assert_eq!(recv(&mut rx).await, 3);
    assert_eq!(recv(&mut rx).await, 2);

    monitor.disconnect();
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn hotplug_helpers_format_command_lines() -> qemu_monitor::Result<()> {
    let server = MockHmpServer::start_tcp(HmpScript::new()).await?;
    let monitor = connect(&server, MonitorHooks::new()).await?;

    let params: BTreeMap<String, String> = [("id", "mem1"), ("size", "1G")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let netdev: BTreeMap<String, String> = [("ifname", "vnet0"), ("script", "no")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let (tx, mut rx) = mpsc::unbounded_channel();
    monitor.object_add("memory-backend-ram", &params, sender(&tx));
    monitor.netdev_add("net0", "tap", &netdev, sender(&tx));
    monitor.resize_disk("drive0", 20480, sender(&tx));
    monitor.block_io_throttle("drive0", 1_000_000, 500, sender(&tx));
    monitor.cancel_block_job("drive0", true, sender(&tx));
    monitor.start_nbd_server(10809, true, true, sender(&tx));
    monitor.eject_cdrom("ide0-cd0", sender(&tx));
    for _ in 0..7 {
        recv(&mut rx).await;
    }

    assert_eq!(
        server.received(),
        [
            "object_add memory-backend-ram,id=mem1,size=1G",
            "netdev_add tap,id=net0,ifname=vnet0,script=no",
            "block_resize drive0 20480",
            "block_set_io_throttle drive0 1000000 0 0 500 0 0",
            "block_job_cancel -f drive0",
            "nbd_server_start -a -w 0.0.0.0:10809",
            "eject -f ide0-cd0",
        ]
    );

    monitor.disconnect();
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn multi_line_commands_are_rejected() -> qemu_monitor::Result<()> {
    let server = MockHmpServer::start_tcp(HmpScript::new()).await?;
    let monitor = connect(&server, MonitorHooks::new()).await?;

    let err = monitor
        .execute("info status\nquit")
        .await
        .err()
        .expect("rejected");
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(server.received().is_empty());

    monitor.disconnect();
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn peer_hang_up_fails_pending_commands() -> qemu_monitor::Result<()> {
    let server = MockHmpServer::start_tcp(HmpScript::new().hang_up_on("quit")).await?;

    let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
    let monitor = connect(
        &server,
        MonitorHooks::new().on_disconnect(move |e| {
            let _ = lost_tx.send(e.kind());
        }),
    )
    .await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    monitor.quit(sender(&tx));
    monitor.query_status(sender(&tx));

    assert_eq!(recv(&mut lost_rx).await, ErrorKind::Io);
    assert_eq!(recv(&mut rx).await, "monitor connection closed");
    assert_eq!(recv(&mut rx).await, "unknown");
    assert_eq!(monitor.state(), MonitorState::Disconnected);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn silent_peer_times_out() -> qemu_monitor::Result<()> {
    let server = MockHmpServer::start_tcp(HmpScript::new().no_banner()).await?;

    let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
    let monitor = MonitorBuilder::new("vm-1")
        .connect_timeout(Duration::from_millis(100))
        .hooks(MonitorHooks::new().on_connect_failed(move |e| {
            let _ = fail_tx.send(e.kind());
        }))
        .connect_hmp(&server.endpoint())
        .await?;

    assert_eq!(recv(&mut fail_rx).await, ErrorKind::ConnectTimeout);
    assert!(!monitor.is_connected());

    server.shutdown().await;
    Ok(())
}
