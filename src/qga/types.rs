//! Guest agent request and reply types.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Result;

/// One entry of `guest-info`'s `supported_commands`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCommand {
    /// Command name.
    pub name: String,

    /// Whether the command may be called.
    #[serde(default)]
    pub enabled: bool,

    /// Whether the agent answers the command when it succeeds.
    #[serde(rename = "success-response", default)]
    pub success_response: bool,
}

/// Reply of `guest-info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInfo {
    /// Agent version.
    #[serde(default)]
    pub version: String,

    /// Commands known to the agent.
    #[serde(default)]
    pub supported_commands: Vec<GuestCommand>,
}

impl GuestInfo {
    /// Look up a command by name.
    #[must_use]
    pub fn command(&self, name: &str) -> Option<&GuestCommand> {
        self.supported_commands.iter().find(|c| c.name == name)
    }
}

/// Reply of `guest-get-osinfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GuestOsInfo {
    /// OS id, `mswindows` for Windows guests.
    pub id: String,
    /// Kernel release.
    pub kernel_release: String,
    /// Kernel version.
    pub kernel_version: String,
    /// Machine architecture.
    pub machine: String,
    /// OS name.
    pub name: String,
    /// Human readable OS name.
    pub pretty_name: String,
    /// OS version.
    pub version: String,
    /// OS version id.
    pub version_id: String,
}

impl GuestOsInfo {
    /// Whether the guest runs Windows.
    #[must_use]
    pub fn is_windows(&self) -> bool {
        self.id == "mswindows"
    }
}

/// An address of a guest network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IpAddress {
    /// Address text.
    pub ip_address: String,
    /// `ipv4` or `ipv6`.
    pub ip_address_type: String,
    /// Prefix length.
    pub prefix: u8,
}

/// Traffic counters of a guest network interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct InterfaceStatistics {
    /// Bytes received.
    pub rx_bytes: u64,
    /// Inbound packets dropped.
    pub rx_dropped: u64,
    /// Receive errors.
    pub rx_errs: u64,
    /// Packets received.
    pub rx_packets: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
    /// Outbound packets dropped.
    pub tx_dropped: u64,
    /// Transmit errors.
    pub tx_errs: u64,
    /// Packets sent.
    pub tx_packets: u64,
}

/// One entry of `guest-network-get-interfaces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkInterface {
    /// Interface name inside the guest.
    pub name: String,
    /// MAC address.
    #[serde(default)]
    pub hardware_address: String,
    /// Configured addresses.
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
    /// Traffic counters, when the agent reports them.
    #[serde(default)]
    pub statistics: Option<InterfaceStatistics>,
}

/// Static address to apply to a guest interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkModify {
    /// Interface name inside the guest.
    pub device: String,
    /// Address in `ip/prefix` form.
    pub ipmask: String,
    /// Default gateway.
    pub gateway: String,
}

/// A process to start with `guest-exec`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Path or executable name.
    pub path: String,
    /// Argument list.
    pub args: Vec<String>,
    /// Environment, `KEY=value` entries.
    pub env: Vec<String>,
    /// Bytes fed to the process's stdin.
    pub input: Vec<u8>,
    /// Whether stdout and stderr are captured.
    pub capture_output: bool,
}

impl ExecRequest {
    /// Run `path` without arguments.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append one `KEY=value` environment entry.
    #[must_use]
    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    /// Feed `input` to stdin.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = input.into();
        self
    }

    /// Capture stdout and stderr.
    #[must_use]
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// `guest-exec` arguments; stdin goes out base64 encoded.
    pub(crate) fn to_args(&self) -> Value {
        let mut args = json!({
            "path": self.path,
            "arg": self.args,
            "env": self.env,
            "capture-output": self.capture_output,
        });
        if !self.input.is_empty() {
            args["input-data"] = Value::String(STANDARD.encode(&self.input));
        }
        args
    }
}

/// Reply of `guest-exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestExec {
    /// Pid of the process inside the guest.
    pub pid: i64,
}

/// Reply of `guest-exec-status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestExecStatus {
    /// Whether the process has terminated.
    pub exited: bool,
    /// Exit code of a normally terminated process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i64>,
    /// Signal (or Windows exception code) of an abnormally terminated process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i64>,
    /// Base64 stdout, present only with capture enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_data: Option<String>,
    /// Base64 stderr, present only with capture enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_data: Option<String>,
    /// Stdout exceeded the agent's capture limit.
    #[serde(default)]
    pub out_truncated: bool,
    /// Stderr exceeded the agent's capture limit.
    #[serde(default)]
    pub err_truncated: bool,
}

/// Result of a finished guest process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Guest pid.
    pub pid: i64,
    /// Exit code, `-1` when the process was killed by a signal.
    pub exit_code: i64,
    /// Terminating signal, if any.
    pub signal: Option<i64>,
    /// Decoded stdout; empty unless capture was requested.
    pub stdout: String,
    /// Decoded stderr; empty unless capture was requested.
    pub stderr: String,
    /// Stdout was cut by the agent.
    pub stdout_truncated: bool,
    /// Stderr was cut by the agent.
    pub stderr_truncated: bool,
}

impl ExecOutput {
    /// Build the output of an exited process.
    pub(crate) fn from_status(pid: i64, status: GuestExecStatus, capture: bool) -> Result<Self> {
        let (stdout, stderr) = if capture {
            (
                decode_text(status.out_data.as_deref())?,
                decode_text(status.err_data.as_deref())?,
            )
        } else {
            (String::new(), String::new())
        };

        Ok(Self {
            pid,
            exit_code: status.exitcode.unwrap_or(-1),
            signal: status.signal,
            stdout,
            stderr,
            stdout_truncated: status.out_truncated,
            stderr_truncated: status.err_truncated,
        })
    }

    /// Exited normally with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }
}

fn decode_text(data: Option<&str>) -> Result<String> {
    match data {
        None | Some("") => Ok(String::new()),
        Some(b64) => {
            let bytes = STANDARD.decode(b64)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

/// Reply of `guest-file-read`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileRead {
    #[serde(default)]
    pub(crate) count: usize,
    #[serde(rename = "buf-b64", default)]
    pub(crate) buf_b64: String,
    #[serde(default)]
    pub(crate) eof: bool,
}

/// Reply of `guest-file-write`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileWrite {
    #[serde(default)]
    pub(crate) count: usize,
    #[serde(default)]
    pub(crate) eof: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_args_encode_stdin() {
        let req = ExecRequest::new("/bin/cat")
            .arg("-")
            .env("LANG=C")
            .stdin("hello")
            .capture_output(true);
        assert_eq!(
            req.to_args(),
            json!({
                "path": "/bin/cat",
                "arg": ["-"],
                "env": ["LANG=C"],
                "input-data": "aGVsbG8=",
                "capture-output": true,
            })
        );

        let bare = ExecRequest::new("/bin/true").to_args();
        assert!(bare.get("input-data").is_none());
    }

    #[test]
    fn output_decoded_only_when_captured() {
        let status: GuestExecStatus = serde_json::from_value(json!({
            "exited": true,
            "exitcode": 3,
            "out-data": "b2sK",
            "err-data": "",
            "out-truncated": false
        }))
        .expect("decode");

        let captured = ExecOutput::from_status(7, status.clone(), true).expect("captured");
        assert_eq!(captured.exit_code, 3);
        assert_eq!(captured.stdout, "ok\n");
        assert_eq!(captured.stderr, "");
        assert!(!captured.success());

        let silent = ExecOutput::from_status(7, status, false).expect("silent");
        assert_eq!(silent.stdout, "");
    }

    #[test]
    fn bad_base64_is_a_decode_error() {
        let status = GuestExecStatus {
            exited: true,
            exitcode: Some(0),
            out_data: Some("@@@".to_string()),
            ..GuestExecStatus::default()
        };
        let err = ExecOutput::from_status(1, status, true)
            .err()
            .expect("must fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::Decode);
    }

    #[test]
    fn signalled_process_has_no_exit_code() {
        let status = GuestExecStatus {
            exited: true,
            signal: Some(9),
            ..GuestExecStatus::default()
        };
        let out = ExecOutput::from_status(1, status, false).expect("output");
        assert_eq!(out.exit_code, -1);
        assert_eq!(out.signal, Some(9));
    }

    #[test]
    fn supported_command_lookup() {
        let info: GuestInfo = serde_json::from_value(json!({
            "version": "8.2.0",
            "supported_commands": [
                {"enabled": true, "name": "guest-ping", "success-response": true},
                {"enabled": false, "name": "guest-exec", "success-response": true},
                {"enabled": true, "name": "guest-shutdown", "success-response": false}
            ]
        }))
        .expect("decode");
        assert!(info.command("guest-ping").is_some_and(|c| c.enabled));
        assert!(info.command("guest-exec").is_some_and(|c| !c.enabled));
        assert!(
            info.command("guest-shutdown")
                .is_some_and(|c| !c.success_response)
        );
        assert!(info.command("guest-fstrim").is_none());
    }
}
