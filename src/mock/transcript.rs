use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::BufReader;

use super::{ServerHandle, recv_json, send_json};
use crate::{
    error::{Error, Result},
    transport::{Endpoint, MonitorStream},
};

/// A transcript step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dir", rename_all = "lowercase")]
pub enum TranscriptStep {
    /// A message sent by the server.
    Server {
        /// Message payload.
        msg: Value,
    },
    /// A message expected from the client.
    Client {
        /// Message payload.
        msg: Value,
    },
}

/// A JSONL transcript of one QMP or guest agent conversation.
///
/// Messages carry no `id`: replies are matched to commands by order alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    /// Ordered transcript steps.
    pub steps: Vec<TranscriptStep>,
}

impl Transcript {
    /// Parse from JSON Lines content.
    pub fn from_jsonl_str(s: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for (idx, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let step: TranscriptStep = serde_json::from_str(line).map_err(|e| {
                Error::protocol(format!("invalid jsonl at line {}: {e}", idx + 1))
            })?;
            steps.push(step);
        }

        Ok(Self { steps })
    }

    /// Load a transcript from a JSONL file.
    pub fn from_jsonl_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(Error::from)?;
        Self::from_jsonl_str(&data)
    }

    /// Render as JSON Lines.
    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for step in &self.steps {
            out.push_str(&serde_json::to_string(step)?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Replays a transcript to every client that connects.
///
/// Client messages that differ from the transcript end the conversation and
/// are recorded in [`mismatches`](Self::mismatches).
#[derive(Debug, Clone)]
pub struct ReplayServer {
    handle: ServerHandle,
    mismatches: Arc<Mutex<Vec<String>>>,
}

impl ReplayServer {
    /// Start a replay server on TCP.
    pub async fn start_tcp(transcript: Transcript) -> Result<Self> {
        let mismatches = Arc::new(Mutex::new(Vec::new()));
        let log = mismatches.clone();
        let handle = ServerHandle::start_tcp(move |stream| {
            replay_connection(stream, transcript.clone(), log.clone())
        })
        .await?;
        Ok(Self { handle, mismatches })
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.handle.endpoint()
    }

    /// Descriptions of the client messages that broke the transcript.
    #[must_use]
    pub fn mismatches(&self) -> Vec<String> {
        self.mismatches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Shut down the server.
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}

async fn replay_connection(
    stream: MonitorStream,
    transcript: Transcript,
    mismatches: Arc<Mutex<Vec<String>>>,
) -> Result<()> {
    let (r, mut w) = tokio::io::split(stream);
    let mut r = BufReader::new(r);

    for step in transcript.steps {
        match step {
            TranscriptStep::Server { msg } => send_json(&mut w, &msg).await?,
            TranscriptStep::Client { msg: expected } => {
                let got = recv_json(&mut r).await?;
                if got.as_ref() != Some(&expected) {
                    let message = match got {
                        Some(got) => format!("expected {expected}, got {got}"),
                        None => format!("expected {expected}, client hung up"),
                    };
                    mismatches
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(message.clone());
                    return Err(Error::protocol(format!("transcript mismatch: {message}")));
                }
            }
        }
    }

    // Hold the connection until the client leaves.
    while recv_json(&mut r).await?.is_some() {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_and_renders_jsonl() {
        let jsonl = r#"
{"dir":"server","msg":{"QMP":{"version":{"qemu":{"major":8,"minor":2,"micro":0},"package":""},"capabilities":[]}}}

{"dir":"client","msg":{"execute":"qmp_capabilities"}}
"#;
        let t = Transcript::from_jsonl_str(jsonl).expect("parse");
        assert_eq!(t.steps.len(), 2);
        assert_eq!(
            t.steps[1],
            TranscriptStep::Client {
                msg: json!({"execute": "qmp_capabilities"})
            }
        );

        let again = Transcript::from_jsonl_str(&t.to_jsonl().expect("render")).expect("reparse");
        assert_eq!(again, t);
    }

    #[test]
    fn bad_line_reports_its_number() {
        let err = Transcript::from_jsonl_str("{\"dir\":\"server\",\"msg\":{}}\nnot json")
            .err()
            .expect("must fail");
        assert!(err.to_string().contains("line 2"), "{err}");
    }
}
