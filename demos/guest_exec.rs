use qemu_monitor::{Endpoint, ExecRequest, GuestAgent, GuestAgentOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> qemu_monitor::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Adjust the path to your environment.
    let endpoint = Endpoint::unix("/var/run/qemu-server/100.qga");
    let qga = GuestAgent::connect("100", endpoint, GuestAgentOptions::default()).await?;

    let os = qga.get_os_info().await?;
    println!("guest runs {}", os.pretty_name);

    let request = if os.is_windows() {
        ExecRequest::new("ipconfig")
    } else {
        ExecRequest::new("/sbin/ip").args(["-brief", "address"])
    };
    let out = qga
        .command_with_timeout(&request.capture_output(true), 10)
        .await?;
    println!("exit code {}\n{}", out.exit_code, out.stdout);

    Ok(())
}
