//! QEMU guest agent client.
//!
//! Unlike the monitors, the guest agent is driven one command at a time:
//! every call writes a single JSON line and, if the command answers, reads a
//! single line back under a deadline. Calls on one [`GuestAgent`] are
//! serialized.

mod exec;
mod file;
mod types;

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::Mutex,
};

pub use exec::{Sleeper, TokioSleep};
pub use file::FileChunk;
pub use types::{
    ExecOutput, ExecRequest, GuestCommand, GuestExec, GuestExecStatus, GuestInfo, GuestOsInfo,
    InterfaceStatistics, IpAddress, NetworkInterface, NetworkModify,
};

use crate::{
    error::{Error, Result},
    options::GuestAgentOptions,
    transport::{self, Endpoint, MonitorStream},
    types::{Command, CommandError},
};

/// Guest-side path of the script written by [`GuestAgent::set_network`].
const NETWORK_SCRIPT: &str = "/tmp/qga-set-network.sh";

const WINDOWS_SHELL: &str = "C:\\Windows\\System32\\cmd.exe";
const UNIX_SHELL: &str = "/bin/bash";

struct Connection {
    reader: BufReader<ReadHalf<MonitorStream>>,
    writer: WriteHalf<MonitorStream>,
}

impl Connection {
    async fn open(endpoint: &Endpoint) -> Result<Self> {
        let stream = transport::connect(endpoint).await?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }
}

/// Guest agent client.
pub struct GuestAgent {
    id: String,
    endpoint: Endpoint,
    options: GuestAgentOptions,
    sleeper: Arc<dyn Sleeper>,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for GuestAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestAgent")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl GuestAgent {
    /// Dial the agent socket.
    ///
    /// If the connection is lost later, the next command dials again.
    pub async fn connect(
        id: impl Into<String>,
        endpoint: Endpoint,
        options: GuestAgentOptions,
    ) -> Result<Self> {
        let conn = Connection::open(&endpoint).await?;
        Ok(Self {
            id: id.into(),
            endpoint,
            options,
            sleeper: Arc::new(TokioSleep),
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Replace the sleeper used between exec status polls.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Agent id used in logs.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current options.
    #[must_use]
    pub fn options(&self) -> &GuestAgentOptions {
        &self.options
    }

    /// Drop the connection. The next command dials again.
    pub async fn close(&self) {
        self.conn.lock().await.take();
    }

    /// Send one command.
    ///
    /// Returns `None` without reading when `expect_response` is false, or
    /// when the reply carries neither `return` nor `error`. A failed or
    /// timed out read drops the connection.
    pub async fn exec_cmd(
        &self,
        command: &Command,
        expect_response: bool,
        read_timeout: Option<Duration>,
    ) -> Result<Option<Value>> {
        let mut line = command.to_line()?;
        line.push('\n');

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            #[cfg(feature = "tracing")]
            tracing::debug!(agent = %self.id, endpoint = %self.endpoint, "dialing guest agent");
            *guard = Some(Connection::open(&self.endpoint).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(Error::Disconnected);
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(agent = %self.id, command = %command.execute, "QGA write");

        let written = async {
            conn.writer.write_all(line.as_bytes()).await?;
            conn.writer.flush().await
        }
        .await;
        if let Err(e) = written {
            guard.take();
            return Err(Error::from(e));
        }

        if !expect_response {
            return Ok(None);
        }

        let timeout = read_timeout.unwrap_or(self.options.read_timeout);
        let mut reply = String::new();
        let read = match tokio::time::timeout(timeout, conn.reader.read_line(&mut reply)).await {
            Ok(Ok(0)) => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "guest agent closed the connection",
            )),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no reply to {} within {timeout:?}", command.execute),
            )),
        };
        if let Err(e) = read {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                agent = %self.id,
                command = %command.execute,
                error = %e,
                "guest agent read failed, dropping connection"
            );
            guard.take();
            return Err(Error::from(e));
        }
        drop(guard);

        #[cfg(feature = "tracing")]
        tracing::trace!(agent = %self.id, reply = %reply.trim_end(), "QGA read");

        let mut reply: Value = serde_json::from_str(reply.trim_end())?;
        if let Some(ret) = reply.get_mut("return") {
            return Ok(Some(ret.take()));
        }
        if let Some(err) = reply.get_mut("error") {
            let err = CommandError::from_value(err.take());
            return Err(Error::command(&command.execute, err.class, err.desc));
        }
        Ok(None)
    }

    /// Send a command, wait for its reply and decode it.
    pub(crate) async fn call<T: DeserializeOwned>(&self, command: Command) -> Result<T> {
        let value = self
            .exec_cmd(&command, true, None)
            .await?
            .ok_or_else(|| Error::protocol(format!("no reply to {}", command.execute)))?;
        serde_json::from_value(value).map_err(Error::from)
    }

    /// `guest-info`.
    pub async fn guest_info(&self) -> Result<GuestInfo> {
        self.call(Command::new("guest-info")).await
    }

    /// Send a command only if the agent advertises it as enabled, waiting
    /// for a reply only if the agent answers that command on success.
    pub async fn qga_command(&self, command: &Command) -> Result<Option<Value>> {
        let info = self.guest_info().await?;
        let Some(supported) = info.command(&command.execute) else {
            return Err(Error::unsupported(
                &command.execute,
                "not supported by the guest agent",
            ));
        };
        if !supported.enabled {
            return Err(Error::unsupported(&command.execute, "disabled in the guest"));
        }
        self.exec_cmd(command, supported.success_response, None)
            .await
    }

    /// `guest-ping`, with an optional custom read timeout.
    pub async fn guest_ping(&self, timeout: Option<Duration>) -> Result<()> {
        self.exec_cmd(&Command::new("guest-ping"), true, timeout)
            .await
            .map(|_| ())
    }

    /// Change a guest user's password.
    ///
    /// `crypted` tells the agent that `password` is already a crypt() hash.
    pub async fn set_user_password(
        &self,
        username: &str,
        password: &str,
        crypted: bool,
    ) -> Result<()> {
        let cmd = Command::with_args(
            "guest-set-user-password",
            json!({
                "username": username,
                "password": STANDARD.encode(password),
                "crypted": crypted,
            }),
        );
        self.exec_cmd(&cmd, true, None).await.map(|_| ())
    }

    /// `guest-network-get-interfaces`.
    pub async fn get_network_interfaces(&self) -> Result<Vec<NetworkInterface>> {
        self.call(Command::new("guest-network-get-interfaces"))
            .await
    }

    /// `guest-get-osinfo`.
    pub async fn get_os_info(&self) -> Result<GuestOsInfo> {
        self.call(Command::new("guest-get-osinfo")).await
    }

    /// Give a guest interface a static address and default route.
    ///
    /// Windows guests are configured with `netsh`; other guests run a shell
    /// script written to the guest first.
    pub async fn set_network(&self, network: &NetworkModify) -> Result<ExecOutput> {
        let os = self.get_os_info().await?;

        if os.is_windows() {
            let (ip, mask) = split_ipmask(&network.ipmask)?;
            let netsh = format!(
                "netsh interface ip set address name=\"{}\" source=static addr={ip} mask={mask} gateway={}",
                network.device, network.gateway
            );
            let req = ExecRequest::new(WINDOWS_SHELL)
                .args(["/c", netsh.as_str()])
                .capture_output(true);
            return self.command_with_timeout(&req, 0).await;
        }

        self.file_put_contents(NETWORK_SCRIPT, network_script(network).as_bytes())
            .await?;

        let chmod = format!("chmod +x {NETWORK_SCRIPT}");
        let chmod = ExecRequest::new(UNIX_SHELL)
            .args(["-c", chmod.as_str()])
            .capture_output(true);
        let out = self.command_with_timeout(&chmod, 0).await?;
        if !out.success() {
            return Err(Error::protocol(format!(
                "chmod of {NETWORK_SCRIPT} failed with exit code {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }

        let run = ExecRequest::new(NETWORK_SCRIPT).capture_output(true);
        self.command_with_timeout(&run, 0).await
    }
}

fn network_script(network: &NetworkModify) -> String {
    let NetworkModify {
        device,
        ipmask,
        gateway,
    } = network;
    format!(
        "#!/bin/bash\nset +e\n\
         /sbin/ip -4 address flush dev {device}\n\
         /sbin/ip -4 address add {ipmask} dev {device}\n\
         /sbin/ip route del default dev {device}\n\
         /sbin/ip route add default via {gateway} dev {device}\n"
    )
}

/// Split `ip/prefix` into the address and a dotted IPv4 netmask.
fn split_ipmask(ipmask: &str) -> Result<(String, Ipv4Addr)> {
    let invalid = || Error::protocol(format!("invalid address {ipmask:?}, expected ip/prefix"));

    let (ip, prefix) = ipmask.split_once('/').ok_or_else(invalid)?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
    if ip.is_empty() || prefix > 32 {
        return Err(invalid());
    }

    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    Ok((ip.to_string(), Ipv4Addr::from(mask)))
}
