use std::time::Duration;

use qemu_monitor::{
    GuestAgent, GuestAgentOptions, Monitor, MonitorBuilder,
    mock::{ReplayServer, Transcript},
    types::Command,
};
use tokio::{sync::mpsc, time::timeout};

const QMP_SESSION: &str = r#"
{"dir":"server","msg":{"QMP":{"version":{"qemu":{"major":8,"minor":2,"micro":0},"package":"mock"},"capabilities":[]}}}
{"dir":"client","msg":{"execute":"qmp_capabilities"}}
{"dir":"server","msg":{"return":{}}}
{"dir":"client","msg":{"execute":"query-version"}}
{"dir":"server","msg":{"event":"RESUME","data":{},"timestamp":{"seconds":1700000000,"microseconds":1}}}
{"dir":"server","msg":{"return":{"qemu":{"major":8,"minor":2,"micro":0},"package":"mock"}}}
{"dir":"client","msg":{"execute":"query-status"}}
{"dir":"server","msg":{"return":{"status":"running","running":true,"singlestep":false}}}
"#;

#[tokio::test]
async fn qmp_session_replays() -> qemu_monitor::Result<()> {
    let server = ReplayServer::start_tcp(Transcript::from_jsonl_str(QMP_SESSION)?).await?;
    let monitor = MonitorBuilder::new("replay")
        .connect_qmp(&server.endpoint())
        .await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let version_tx = tx.clone();
    monitor.get_version(Box::new(move |v| {
        let _ = version_tx.send(v);
    }));
    monitor.query_status(Box::new(move |s| {
        let _ = tx.send(s);
    }));

    let wait = Duration::from_secs(5);
    assert_eq!(timeout(wait, rx.recv()).await.expect("version"), Some("8.2.0".to_string()));
    assert_eq!(timeout(wait, rx.recv()).await.expect("status"), Some("running".to_string()));
    assert!(server.mismatches().is_empty());

    monitor.disconnect();
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unexpected_client_message_is_recorded() -> qemu_monitor::Result<()> {
    let server = ReplayServer::start_tcp(Transcript::from_jsonl_str(QMP_SESSION)?).await?;
    let monitor = MonitorBuilder::new("replay")
        .connect_qmp(&server.endpoint())
        .await?;

    let err = monitor
        .execute(Command::new("query-name"))
        .await
        .err()
        .expect("replay stops");
    assert_eq!(err.kind(), qemu_monitor::ErrorKind::Disconnected);

    let mismatches = server.mismatches();
    assert_eq!(mismatches.len(), 1);
    assert!(mismatches[0].contains("query-name"), "{mismatches:?}");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn guest_agent_session_replays() -> qemu_monitor::Result<()> {
    let jsonl = r#"
{"dir":"client","msg":{"execute":"guest-ping"}}
{"dir":"server","msg":{"return":{}}}
{"dir":"client","msg":{"execute":"guest-get-osinfo"}}
{"dir":"server","msg":{"return":{"id":"mswindows","name":"Microsoft Windows","pretty-name":"Windows Server 2022","version-id":"2022","machine":"x86_64"}}}
"#;
    let server = ReplayServer::start_tcp(Transcript::from_jsonl_str(jsonl)?).await?;
    let qga = GuestAgent::connect("replay", server.endpoint(), GuestAgentOptions::default()).await?;

    qga.guest_ping(None).await?;
    let os = qga.get_os_info().await?;
    assert!(os.is_windows());
    assert_eq!(os.pretty_name, "Windows Server 2022");
    assert!(server.mismatches().is_empty());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn transcript_loads_from_file() -> qemu_monitor::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session.jsonl");
    std::fs::write(&path, QMP_SESSION)?;

    let transcript = Transcript::from_jsonl_file(&path)?;
    assert_eq!(transcript.steps.len(), 8);
    assert_eq!(transcript, Transcript::from_jsonl_str(&transcript.to_jsonl()?)?);
    Ok(())
}
