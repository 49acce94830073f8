use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};
#[cfg(unix)]
use std::path::Path;

use serde_json::{Value, json};
use tokio::io::BufReader;

use super::{ServerHandle, command_name, recv_json, send_json};
use crate::{
    error::Result,
    transport::{Endpoint, MonitorStream},
    types::{Greeting, QemuVersion, QmpInfo, VersionTriple},
};

/// How a command should be answered by the mock.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum MockReply {
    /// Successful `return` payload.
    Return(Value),

    /// Error response.
    Error {
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
    },

    /// Never answer.
    Silent,

    /// Close the connection instead of answering.
    HangUp,
}

impl MockReply {
    /// Error reply.
    #[must_use]
    pub fn error(class: impl Into<String>, desc: impl Into<String>) -> Self {
        Self::Error {
            class: class.into(),
            desc: desc.into(),
        }
    }

    fn to_wire(&self) -> Option<Value> {
        match self {
            Self::Return(v) => Some(json!({ "return": v })),
            Self::Error { class, desc } => {
                Some(json!({ "error": { "class": class, "desc": desc } }))
            }
            Self::Silent | Self::HangUp => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Step {
    events: Vec<Value>,
    reply: MockReply,
}

/// Script for [`MockQmpServer`].
///
/// Replies are queued per command name and consumed in order; the last one
/// queued for a name keeps answering once the others are used up. Replies
/// carry no `id`, like QEMU when the client sends none.
#[derive(Debug, Clone)]
pub struct QmpScript {
    greeting: Option<Greeting>,
    steps: HashMap<String, VecDeque<Step>>,
    post_handshake_events: Vec<Value>,
}

impl QmpScript {
    /// Greeting matching a recent QEMU.
    #[must_use]
    pub fn default_greeting() -> Greeting {
        Greeting {
            qmp: QmpInfo {
                version: QemuVersion {
                    qemu: VersionTriple {
                        major: 8,
                        minor: 2,
                        micro: 0,
                    },
                    package: "mock".to_string(),
                },
                capabilities: vec!["oob".to_string()],
            },
        }
    }

    /// Script with the default greeting and no replies.
    #[must_use]
    pub fn new() -> Self {
        Self {
            greeting: Some(Self::default_greeting()),
            steps: HashMap::new(),
            post_handshake_events: Vec::new(),
        }
    }

    /// Replace the greeting.
    #[must_use]
    pub fn greeting(mut self, greeting: Greeting) -> Self {
        self.greeting = Some(greeting);
        self
    }

    /// Never send a greeting.
    #[must_use]
    pub fn no_greeting(mut self) -> Self {
        self.greeting = None;
        self
    }

    /// Queue a reply for `command`.
    #[must_use]
    pub fn reply(self, command: impl Into<String>, reply: MockReply) -> Self {
        self.reply_after_events(command, Vec::new(), reply)
    }

    /// Queue a successful reply.
    #[must_use]
    pub fn reply_return(self, command: impl Into<String>, value: Value) -> Self {
        self.reply(command, MockReply::Return(value))
    }

    /// Queue an error reply.
    #[must_use]
    pub fn reply_error(
        self,
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        self.reply(command, MockReply::error(class, desc))
    }

    /// Queue a reply preceded by `events`.
    #[must_use]
    pub fn reply_after_events(
        mut self,
        command: impl Into<String>,
        events: Vec<Value>,
        reply: MockReply,
    ) -> Self {
        self.steps
            .entry(command.into())
            .or_default()
            .push_back(Step { events, reply });
        self
    }

    /// Send `event` right after the capabilities handshake.
    #[must_use]
    pub fn post_event(mut self, event: Value) -> Self {
        self.post_handshake_events.push(event);
        self
    }

    fn next_step(&mut self, command: &str) -> Step {
        match self.steps.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
        .unwrap_or_else(|| Step {
            events: Vec::new(),
            reply: MockReply::error(
                "CommandNotFound",
                format!("The command {command} has not been found"),
            ),
        })
    }
}

impl Default for QmpScript {
    fn default() -> Self {
        Self::new()
    }
}

/// A scripted QMP server.
#[derive(Debug, Clone)]
pub struct MockQmpServer {
    handle: ServerHandle,
    received: Arc<Mutex<Vec<Value>>>,
}

impl MockQmpServer {
    /// Start on 127.0.0.1 with an ephemeral port.
    pub async fn start_tcp(script: QmpScript) -> Result<Self> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let handle = ServerHandle::start_tcp(move |stream| {
            serve(stream, script.clone(), log.clone())
        })
        .await?;
        Ok(Self { handle, received })
    }

    /// Start on a Unix socket at `path`.
    #[cfg(unix)]
    pub fn start_unix(path: impl AsRef<Path>, script: QmpScript) -> Result<Self> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let handle = ServerHandle::start_unix(path.as_ref(), move |stream| {
            serve(stream, script.clone(), log.clone())
        })?;
        Ok(Self { handle, received })
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.handle.endpoint()
    }

    /// Every command received so far, `qmp_capabilities` included.
    #[must_use]
    pub fn received(&self) -> Vec<Value> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of the commands received so far.
    #[must_use]
    pub fn received_commands(&self) -> Vec<String> {
        self.received().iter().map(command_name).collect()
    }

    /// Shut down the server and wait for completion.
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}

async fn serve(
    stream: MonitorStream,
    mut script: QmpScript,
    received: Arc<Mutex<Vec<Value>>>,
) -> Result<()> {
    let (r, mut w) = tokio::io::split(stream);
    let mut r = BufReader::new(r);

    let Some(greeting) = script.greeting.take() else {
        // Hold the connection open without a word.
        while recv_json(&mut r).await?.is_some() {}
        return Ok(());
    };
    send_json(&mut w, &serde_json::to_value(&greeting)?).await?;

    let mut negotiated = false;
    while let Some(req) = recv_json(&mut r).await? {
        received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(req.clone());
        let command = command_name(&req);

        if !negotiated {
            if command != "qmp_capabilities" {
                let err = json!({
                    "error": {
                        "class": "CommandNotFound",
                        "desc": "Expecting capabilities negotiation with 'qmp_capabilities'"
                    }
                });
                send_json(&mut w, &err).await?;
                continue;
            }
            negotiated = true;
            send_json(&mut w, &json!({ "return": {} })).await?;
            for ev in std::mem::take(&mut script.post_handshake_events) {
                send_json(&mut w, &ev).await?;
            }
            continue;
        }

        let step = script.next_step(&command);
        for ev in &step.events {
            send_json(&mut w, ev).await?;
        }
        if matches!(step.reply, MockReply::HangUp) {
            return Ok(());
        }
        if let Some(wire) = step.reply.to_wire() {
            send_json(&mut w, &wire).await?;
        }
    }

    Ok(())
}
