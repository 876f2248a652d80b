//! Newline-delimited JSON framing, one frame per line.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Serialize a frame and write it as one line, flushing immediately so
/// fire-and-forget senders never sit on buffered events.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let line = serde_json::to_string(frame)? + "\n";
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next non-empty line, or `None` at EOF.
pub async fn next_line<R>(reader: &mut BufReader<R>) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await? {
            0 => return Ok(None),
            _ => {
                let raw = line.trim();
                if raw.is_empty() {
                    continue;
                }
                return Ok(Some(raw.to_string()));
            }
        }
    }
}

/// Read and parse the next frame, or `None` at EOF.
pub async fn next_frame<R, T>(reader: &mut BufReader<R>) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match next_line(reader).await? {
        None => Ok(None),
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
    }
}
