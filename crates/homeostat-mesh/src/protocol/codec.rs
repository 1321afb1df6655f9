//! Newline-delimited JSON framing

use std::time::Duration;

use homeostat_common::{HomeostatError, PeerError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Encode `value` as one JSON line
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one JSON line (surrounding whitespace ignored)
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim()).map_err(|e| PeerError::Decode(e.to_string()).into())
}

/// Read a single line of at most `max_bytes`, within `timeout`.
///
/// Returns `None` when the peer closed without sending anything.
pub async fn read_line<R>(reader: R, max_bytes: usize, timeout: Duration) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader.take(max_bytes as u64 + 1));
    let mut line = String::new();

    let read = tokio::time::timeout(timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| HomeostatError::Timeout("reading message line".to_string()))?
        .map_err(|e| PeerError::Decode(e.to_string()))?;

    if read == 0 {
        return Ok(None);
    }
    if line.len() > max_bytes {
        return Err(PeerError::Decode(format!("line exceeds {} bytes", max_bytes)).into());
    }
    Ok(Some(line))
}

/// Write `value` as one JSON line and flush, within `timeout`
pub async fn write_line<W, T>(writer: &mut W, value: &T, timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_line(value)?;
    tokio::time::timeout(timeout, async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| HomeostatError::Timeout("writing message line".to_string()))??;
    Ok(())
}
