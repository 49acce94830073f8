use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};
#[cfg(unix)]
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::ServerHandle;
use crate::{
    error::{Error, Result},
    monitor::PROMPT,
    transport::{Endpoint, MonitorStream},
};

#[derive(Debug, Clone)]
enum Answer {
    /// Echo the command, print the text, then the prompt.
    Text(String),
    /// Bytes sent verbatim, prompts included.
    Raw(Vec<u8>),
    HangUp,
}

/// Script for [`MockHmpServer`].
///
/// Answers are queued per command line; the last one queued for a line
/// keeps answering once the others are used up. Unknown lines get QEMU's
/// `unknown command` message.
#[derive(Debug, Clone)]
pub struct HmpScript {
    banner: Option<String>,
    answers: HashMap<String, VecDeque<Answer>>,
}

impl HmpScript {
    /// Script with QEMU's usual banner.
    #[must_use]
    pub fn new() -> Self {
        Self {
            banner: Some(
                "QEMU 8.2.0 monitor - type 'help' for more information\r\n".to_string(),
            ),
            answers: HashMap::new(),
        }
    }

    /// Replace the banner text printed before the first prompt.
    #[must_use]
    pub fn banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    /// Print nothing at all on connect.
    #[must_use]
    pub fn no_banner(mut self) -> Self {
        self.banner = None;
        self
    }

    /// Answer `line` with `output`, after echoing the line.
    #[must_use]
    pub fn reply(self, line: impl Into<String>, output: impl Into<String>) -> Self {
        self.push(line, Answer::Text(output.into()))
    }

    /// Answer `line` with raw bytes, sent as-is.
    #[must_use]
    pub fn reply_raw(self, line: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.push(line, Answer::Raw(bytes.into()))
    }

    /// Close the connection when `line` arrives.
    #[must_use]
    pub fn hang_up_on(self, line: impl Into<String>) -> Self {
        self.push(line, Answer::HangUp)
    }

    fn push(mut self, line: impl Into<String>, answer: Answer) -> Self {
        self.answers
            .entry(line.into())
            .or_default()
            .push_back(answer);
        self
    }

    fn next_answer(&mut self, line: &str) -> Answer {
        match self.answers.get_mut(line) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
        .unwrap_or_else(|| {
            let word = line.split_whitespace().next().unwrap_or_default();
            Answer::Text(format!("unknown command: '{word}'\r\n"))
        })
    }
}

impl Default for HmpScript {
    fn default() -> Self {
        Self::new()
    }
}

/// A scripted HMP server.
#[derive(Debug, Clone)]
pub struct MockHmpServer {
    handle: ServerHandle,
    received: Arc<Mutex<Vec<String>>>,
}

impl MockHmpServer {
    /// Start on 127.0.0.1 with an ephemeral port.
    pub async fn start_tcp(script: HmpScript) -> Result<Self> {
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
    pub fn start_unix(path: impl AsRef<Path>, script: HmpScript) -> Result<Self> {
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

    /// Command lines received so far.
    #[must_use]
    pub fn received(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Shut down the server and wait for completion.
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}

async fn serve(
    stream: MonitorStream,
    mut script: HmpScript,
    received: Arc<Mutex<Vec<String>>>,
) -> Result<()> {
    let (r, mut w) = tokio::io::split(stream);
    let mut r = BufReader::new(r);

    if let Some(banner) = &script.banner {
        w.write_all(format!("{banner}{PROMPT}").as_bytes())
            .await
            .map_err(Error::from)?;
        w.flush().await.map_err(Error::from)?;
    }

    let mut line = String::new();
    loop {
        line.clear();
        if r.read_line(&mut line).await.map_err(Error::from)? == 0 {
            return Ok(());
        }
        let command = line.trim().to_string();
        if command.is_empty() {
            continue;
        }
        received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());

        let bytes = match script.next_answer(&command) {
            Answer::Text(out) => format!("{command}\r\n{out}{PROMPT}").into_bytes(),
            Answer::Raw(bytes) => bytes,
            Answer::HangUp => return Ok(()),
        };
        w.write_all(&bytes).await.map_err(Error::from)?;
        w.flush().await.map_err(Error::from)?;
    }
}
