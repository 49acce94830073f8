//! Guest file access through the agent's `guest-file-*` commands.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::json;

use crate::{
    error::{Error, Result},
    qga::{
        GuestAgent,
        types::{FileRead, FileWrite},
    },
    types::Command,
};

/// Bytes requested per `guest-file-read` and sent per `guest-file-write`.
const CHUNK: usize = 48 * 1024;

/// Data returned by one `guest-file-read`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChunk {
    /// Bytes read.
    pub data: Vec<u8>,
    /// Whether the end of the file was reached.
    pub eof: bool,
}

impl GuestAgent {
    /// Open a file in the guest. `mode` is an `fopen` mode such as `"r"`.
    pub async fn file_open(&self, path: &str, mode: &str) -> Result<i64> {
        self.call(Command::with_args(
            "guest-file-open",
            json!({ "path": path, "mode": mode }),
        ))
        .await
    }

    /// Read up to `count` bytes.
    pub async fn file_read(&self, handle: i64, count: usize) -> Result<FileChunk> {
        let read: FileRead = self
            .call(Command::with_args(
                "guest-file-read",
                json!({ "handle": handle, "count": count }),
            ))
            .await?;
        let data = STANDARD.decode(read.buf_b64.as_bytes())?;
        if data.len() != read.count {
            return Err(Error::protocol(format!(
                "guest-file-read announced {} bytes but sent {}",
                read.count,
                data.len()
            )));
        }
        Ok(FileChunk {
            data,
            eof: read.eof,
        })
    }

    /// Write `data`, returning how many bytes the guest accepted.
    pub async fn file_write(&self, handle: i64, data: &[u8]) -> Result<usize> {
        let written: FileWrite = self
            .call(Command::with_args(
                "guest-file-write",
                json!({ "handle": handle, "buf-b64": STANDARD.encode(data) }),
            ))
            .await?;
        Ok(written.count)
    }

    /// Close a handle.
    pub async fn file_close(&self, handle: i64) -> Result<()> {
        self.exec_cmd(
            &Command::with_args("guest-file-close", json!({ "handle": handle })),
            true,
            None,
        )
        .await
        .map(|_| ())
    }

    /// Read a whole guest file.
    pub async fn file_get_contents(&self, path: &str) -> Result<Vec<u8>> {
        let handle = self.file_open(path, "r").await?;
        let read = self.read_to_end(handle).await;
        let closed = self.file_close(handle).await;
        let data = read?;
        closed?;
        Ok(data)
    }

    /// Create or truncate a guest file and write `contents` to it.
    pub async fn file_put_contents(&self, path: &str, contents: &[u8]) -> Result<()> {
        let handle = self.file_open(path, "w+").await?;
        let written = self.write_all(handle, contents).await;
        let closed = self.file_close(handle).await;
        written?;
        closed
    }

    async fn read_to_end(&self, handle: i64) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        loop {
            let chunk = self.file_read(handle, CHUNK).await?;
            data.extend_from_slice(&chunk.data);
            // An empty read also ends the file.
            if chunk.eof || chunk.data.is_empty() {
                return Ok(data);
            }
        }
    }

    async fn write_all(&self, handle: i64, mut contents: &[u8]) -> Result<()> {
        while !contents.is_empty() {
            let n = contents.len().min(CHUNK);
            let accepted = self.file_write(handle, &contents[..n]).await?;
            if accepted == 0 {
                return Err(Error::protocol("guest-file-write accepted no data"));
            }
            contents = &contents[accepted.min(n)..];
        }
        Ok(())
    }
}
