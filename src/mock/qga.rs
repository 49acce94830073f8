use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
#[cfg(unix)]
use std::path::Path;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Value, json};
use tokio::io::BufReader;

use super::{ServerHandle, command_name, recv_json, send_json};
use crate::{
    error::Result,
    qga::{GuestCommand, GuestOsInfo, NetworkInterface},
    transport::{Endpoint, MonitorStream},
};

/// Commands the mock agent implements.
const COMMANDS: &[&str] = &[
    "guest-info",
    "guest-ping",
    "guest-get-osinfo",
    "guest-network-get-interfaces",
    "guest-set-user-password",
    "guest-exec",
    "guest-exec-status",
    "guest-file-open",
    "guest-file-read",
    "guest-file-write",
    "guest-file-close",
    "guest-shutdown",
];

/// How a process started by `guest-exec` behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockExec {
    exits_on_poll: Option<usize>,
    exit_code: i64,
    signal: Option<i64>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl MockExec {
    /// Reported as exited on the `polls`-th `guest-exec-status`.
    #[must_use]
    pub fn exits_after(polls: usize) -> Self {
        Self {
            exits_on_poll: Some(polls.max(1)),
            exit_code: 0,
            signal: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// Never reported as exited.
    #[must_use]
    pub fn never_exits() -> Self {
        Self {
            exits_on_poll: None,
            ..Self::exits_after(1)
        }
    }

    /// Exit code once exited.
    #[must_use]
    pub fn exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    /// Terminate by signal instead of exiting.
    #[must_use]
    pub fn signal(mut self, signal: i64) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Captured stdout.
    #[must_use]
    pub fn stdout(mut self, out: impl Into<Vec<u8>>) -> Self {
        self.stdout = out.into();
        self
    }

    /// Captured stderr.
    #[must_use]
    pub fn stderr(mut self, err: impl Into<Vec<u8>>) -> Self {
        self.stderr = err.into();
        self
    }
}

impl Default for MockExec {
    fn default() -> Self {
        Self::exits_after(1)
    }
}

/// Script for [`MockGuestAgent`].
#[derive(Debug, Clone)]
pub struct GuestAgentScript {
    commands: Vec<GuestCommand>,
    os: GuestOsInfo,
    interfaces: Vec<NetworkInterface>,
    files: HashMap<String, Vec<u8>>,
    execs: VecDeque<MockExec>,
    silent: HashSet<String>,
    hang_ups: HashMap<String, usize>,
}

impl GuestAgentScript {
    /// A Linux guest with every implemented command enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            commands: COMMANDS
                .iter()
                .map(|name| GuestCommand {
                    name: (*name).to_string(),
                    enabled: true,
                    success_response: *name != "guest-shutdown",
                })
                .collect(),
            os: GuestOsInfo {
                id: "ubuntu".to_string(),
                name: "Ubuntu".to_string(),
                pretty_name: "Ubuntu 24.04 LTS".to_string(),
                version_id: "24.04".to_string(),
                machine: "x86_64".to_string(),
                ..GuestOsInfo::default()
            },
            interfaces: Vec::new(),
            files: HashMap::new(),
            execs: VecDeque::new(),
            silent: HashSet::new(),
            hang_ups: HashMap::new(),
        }
    }

    /// Report `os_id` from `guest-get-osinfo` (`mswindows` for Windows).
    #[must_use]
    pub fn os_id(mut self, os_id: impl Into<String>) -> Self {
        self.os.id = os_id.into();
        self
    }

    /// Interfaces reported by `guest-network-get-interfaces`.
    #[must_use]
    pub fn interfaces(mut self, interfaces: Vec<NetworkInterface>) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Mark a command as disabled in `guest-info`.
    #[must_use]
    pub fn disable(mut self, command: &str) -> Self {
        for c in &mut self.commands {
            if c.name == command {
                c.enabled = false;
            }
        }
        self
    }

    /// Drop a command from `guest-info`.
    #[must_use]
    pub fn remove(mut self, command: &str) -> Self {
        self.commands.retain(|c| c.name != command);
        self
    }

    /// Seed a guest file.
    #[must_use]
    pub fn file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    /// Behaviour of the next process started; processes without a queued
    /// behaviour exit with code 0 on the first poll.
    #[must_use]
    pub fn exec(mut self, exec: MockExec) -> Self {
        self.execs.push_back(exec);
        self
    }

    /// Read `command` but never answer it.
    #[must_use]
    pub fn silent(mut self, command: impl Into<String>) -> Self {
        self.silent.insert(command.into());
        self
    }

    /// Close the connection the next time `command` arrives.
    #[must_use]
    pub fn hang_up_once(mut self, command: impl Into<String>) -> Self {
        *self.hang_ups.entry(command.into()).or_default() += 1;
        self
    }
}

impl Default for GuestAgentScript {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Process {
    exec: MockExec,
    polls: usize,
    capture: bool,
}

#[derive(Debug)]
struct OpenFile {
    path: String,
    pos: usize,
}

#[derive(Debug)]
struct State {
    script: GuestAgentScript,
    processes: HashMap<i64, Process>,
    handles: HashMap<i64, OpenFile>,
    next_pid: i64,
    next_handle: i64,
    received: Vec<Value>,
    passwords: Vec<(String, String, bool)>,
}

enum Outcome {
    Reply(Value),
    NoReply,
    HangUp,
}

fn error(class: &str, desc: impl Into<String>) -> Value {
    json!({ "error": { "class": class, "desc": desc.into() } })
}

fn ok(value: Value) -> Value {
    json!({ "return": value })
}

impl State {
    fn handle(&mut self, req: Value) -> Outcome {
        self.received.push(req.clone());
        let command = command_name(&req);
        let args = req.get("arguments").cloned().unwrap_or(Value::Null);

        if let Some(n) = self.script.hang_ups.get_mut(&command).filter(|n| **n > 0) {
            *n -= 1;
            return Outcome::HangUp;
        }
        if self.script.silent.contains(&command) {
            return Outcome::NoReply;
        }

        let Some(known) = self.script.commands.iter().find(|c| c.name == command) else {
            return Outcome::Reply(error(
                "CommandNotFound",
                format!("The command {command} has not been found"),
            ));
        };
        if !known.enabled {
            return Outcome::Reply(error(
                "GenericError",
                format!("The command {command} has been disabled for this instance"),
            ));
        }

        match command.as_str() {
            "guest-info" => Outcome::Reply(ok(json!({
                "version": "8.2.0",
                "supported_commands": self.script.commands,
            }))),
            "guest-ping" => Outcome::Reply(ok(json!({}))),
            "guest-get-osinfo" => Outcome::Reply(ok(json!(self.script.os))),
            "guest-network-get-interfaces" => Outcome::Reply(ok(json!(self.script.interfaces))),
            "guest-set-user-password" => Outcome::Reply(self.set_password(&args)),
            "guest-exec" => Outcome::Reply(self.exec(&args)),
            "guest-exec-status" => Outcome::Reply(self.exec_status(&args)),
            "guest-file-open" => Outcome::Reply(self.file_open(&args)),
            "guest-file-read" => Outcome::Reply(self.file_read(&args)),
            "guest-file-write" => Outcome::Reply(self.file_write(&args)),
            "guest-file-close" => Outcome::Reply(self.file_close(&args)),
            _ => Outcome::NoReply,
        }
    }

    fn set_password(&mut self, args: &Value) -> Value {
        let user = args["username"].as_str().unwrap_or_default().to_string();
        let crypted = args["crypted"].as_bool().unwrap_or_default();
        match STANDARD.decode(args["password"].as_str().unwrap_or_default()) {
            Ok(bytes) => {
                let password = String::from_utf8_lossy(&bytes).into_owned();
                self.passwords.push((user, password, crypted));
                ok(json!({}))
            }
            Err(_) => error("GenericError", "password is not valid base64"),
        }
    }

    fn exec(&mut self, args: &Value) -> Value {
        if args["path"].as_str().is_none_or(str::is_empty) {
            return error("GenericError", "Parameter 'path' is missing");
        }
        let exec = self.script.execs.pop_front().unwrap_or_default();
        let pid = self.next_pid;
        self.next_pid += 1;
        self.processes.insert(
            pid,
            Process {
                exec,
                polls: 0,
                capture: args["capture-output"].as_bool().unwrap_or_default(),
            },
        );
        ok(json!({ "pid": pid }))
    }

    fn exec_status(&mut self, args: &Value) -> Value {
        let pid = args["pid"].as_i64().unwrap_or_default();
        let Some(proc) = self.processes.get_mut(&pid) else {
            return error("GenericError", format!("Invalid parameter 'pid' {pid}"));
        };

        proc.polls += 1;
        let exited = proc.exec.exits_on_poll.is_some_and(|n| proc.polls >= n);
        if !exited {
            return ok(json!({ "exited": false }));
        }

        let Some(proc) = self.processes.remove(&pid) else {
            return error("GenericError", format!("Invalid parameter 'pid' {pid}"));
        };
        let mut status = json!({ "exited": true });
        match proc.exec.signal {
            Some(sig) => status["signal"] = json!(sig),
            None => status["exitcode"] = json!(proc.exec.exit_code),
        }
        if proc.capture {
            status["out-data"] = json!(STANDARD.encode(&proc.exec.stdout));
            status["err-data"] = json!(STANDARD.encode(&proc.exec.stderr));
        }
        ok(status)
    }

    fn file_open(&mut self, args: &Value) -> Value {
        let path = args["path"].as_str().unwrap_or_default().to_string();
        let mode = args["mode"].as_str().unwrap_or("r");

        let pos = match mode.chars().next() {
            Some('r') => match self.script.files.get(&path) {
                Some(_) => 0,
                None => {
                    return error(
                        "GenericError",
                        format!("failed to open file '{path}' (mode: '{mode}'): No such file or directory"),
                    );
                }
            },
            Some('w') => {
                self.script.files.insert(path.clone(), Vec::new());
                0
            }
            Some('a') => self.script.files.entry(path.clone()).or_default().len(),
            _ => return error("GenericError", format!("invalid file open mode '{mode}'")),
        };

        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, OpenFile { path, pos });
        ok(json!(handle))
    }

    fn file_read(&mut self, args: &Value) -> Value {
        let handle = args["handle"].as_i64().unwrap_or_default();
        let count = args["count"].as_u64().unwrap_or(4096) as usize;
        let Some(open) = self.handles.get_mut(&handle) else {
            return error("GenericError", format!("handle '{handle}' has not been found"));
        };
        let data = self.script.files.get(&open.path).map(Vec::as_slice).unwrap_or_default();

        let start = open.pos.min(data.len());
        let end = (start + count).min(data.len());
        let chunk = &data[start..end];
        open.pos = end;
        ok(json!({
            "count": chunk.len(),
            "buf-b64": STANDARD.encode(chunk),
            "eof": chunk.len() < count,
        }))
    }

    fn file_write(&mut self, args: &Value) -> Value {
        let handle = args["handle"].as_i64().unwrap_or_default();
        let Some(open) = self.handles.get_mut(&handle) else {
            return error("GenericError", format!("handle '{handle}' has not been found"));
        };
        let Ok(bytes) = STANDARD.decode(args["buf-b64"].as_str().unwrap_or_default()) else {
            return error("GenericError", "base64 decoding failed");
        };

        let file = self.script.files.entry(open.path.clone()).or_default();
        let end = open.pos + bytes.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[open.pos..end].copy_from_slice(&bytes);
        open.pos = end;
        ok(json!({ "count": bytes.len(), "eof": false }))
    }

    fn file_close(&mut self, args: &Value) -> Value {
        let handle = args["handle"].as_i64().unwrap_or_default();
        match self.handles.remove(&handle) {
            Some(_) => ok(json!({})),
            None => error("GenericError", format!("handle '{handle}' has not been found")),
        }
    }
}

/// A scripted guest agent with an in-memory guest filesystem.
///
/// State survives reconnects.
#[derive(Debug, Clone)]
pub struct MockGuestAgent {
    handle: ServerHandle,
    state: Arc<Mutex<State>>,
}

impl MockGuestAgent {
    /// Start on 127.0.0.1 with an ephemeral port.
    pub async fn start_tcp(script: GuestAgentScript) -> Result<Self> {
        let state = Self::state(script);
        let shared = state.clone();
        let handle = ServerHandle::start_tcp(move |stream| serve(stream, shared.clone())).await?;
        Ok(Self { handle, state })
    }

    /// Start on a Unix socket at `path`.
    #[cfg(unix)]
    pub fn start_unix(path: impl AsRef<Path>, script: GuestAgentScript) -> Result<Self> {
        let state = Self::state(script);
        let shared = state.clone();
        let handle =
            ServerHandle::start_unix(path.as_ref(), move |stream| serve(stream, shared.clone()))?;
        Ok(Self { handle, state })
    }

    fn state(script: GuestAgentScript) -> Arc<Mutex<State>> {
        Arc::new(Mutex::new(State {
            script,
            processes: HashMap::new(),
            handles: HashMap::new(),
            next_pid: 1000,
            next_handle: 1,
            received: Vec::new(),
            passwords: Vec::new(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.handle.endpoint()
    }

    /// Every command received so far.
    #[must_use]
    pub fn received(&self) -> Vec<Value> {
        self.lock().received.clone()
    }

    /// Names of the commands received so far.
    #[must_use]
    pub fn received_commands(&self) -> Vec<String> {
        self.lock().received.iter().map(command_name).collect()
    }

    /// Contents of a guest file.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().script.files.get(path).cloned()
    }

    /// Number of file handles left open.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }

    /// `(username, decoded password, crypted)` of every password change.
    #[must_use]
    pub fn passwords(&self) -> Vec<(String, String, bool)> {
        self.lock().passwords.clone()
    }

    /// Shut down the server and wait for completion.
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}

async fn serve(stream: MonitorStream, state: Arc<Mutex<State>>) -> Result<()> {
    let (r, mut w) = tokio::io::split(stream);
    let mut r = BufReader::new(r);

    while let Some(req) = recv_json(&mut r).await? {
        let outcome = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle(req);
        match outcome {
            Outcome::Reply(reply) => send_json(&mut w, &reply).await?,
            Outcome::NoReply => {}
            Outcome::HangUp => return Ok(()),
        }
    }
    Ok(())
}
