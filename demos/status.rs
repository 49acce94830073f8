use std::sync::Arc;

use qemu_monitor::{Endpoint, Monitor, MonitorBuilder, MonitorHooks, MonitorRegistry};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> qemu_monitor::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Adjust the path to your environment.
    let endpoint = Endpoint::unix("/var/run/qemu-server/100.qmp");

    let hooks = MonitorHooks::new()
        .on_connect_failed(|e| eprintln!("monitor did not come up: {e}"))
        .on_disconnect(|e| eprintln!("monitor lost: {e}"));
    let monitor = MonitorBuilder::new("100")
        .hooks(hooks)
        .connect_qmp(&endpoint)
        .await?;

    let registry = MonitorRegistry::new();
    registry.start("100", Arc::new(monitor));

    if let Some(monitor) = registry.get("100") {
        let (tx, rx) = oneshot::channel();
        monitor.query_status(Box::new(move |status| {
            let _ = tx.send(status);
        }));
        let status = rx.await.unwrap_or_else(|_| "unknown".to_string());
        println!("vm 100 is {status}");
    }

    registry.shutdown();
    Ok(())
}
