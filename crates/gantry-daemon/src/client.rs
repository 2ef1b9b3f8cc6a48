//! Minimal control-socket client for the CLI subcommands.

use crate::protocol::{Response, RpcError};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Send one request and wait for its response.
pub async fn request(socket: &Path, method: &str, params: Value) -> Result<Value> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to {} (is gantryd running?)", socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();

    let payload = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });
    let mut line = serde_json::to_vec(&payload)?;
    line.push(b'\n');
    write_half.write_all(&line).await?;

    let mut lines = BufReader::new(read_half).lines();
    let reply = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow!("daemon closed the connection without responding"))?;
    let response: Response = serde_json::from_str(&reply)?;

    if let Some(RpcError { code, message, data }) = response.error {
        match data {
            Some(data) => bail!("{message} (code {code}, detail {data})"),
            None => bail!("{message} (code {code})"),
        }
    }
    Ok(response.result.unwrap_or(Value::Null))
}
