//! Interactive hub client

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

/// Relay stdin lines to the hub and print everything it sends back
pub async fn connect(url: &str, show_heartbeats: bool) -> Result<()> {
    let (ws, _response) = connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    info!(url = url, "Connected");

    let (mut sender, mut receiver) = ws.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) if line.is_empty() => {}
                    Some(line) => {
                        sender.send(Message::text(line)).await.context("Send failed")?;
                    }
                    None => {
                        debug!("stdin closed, listening only");
                        stdin_open = false;
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if show_heartbeats || text.as_str() != "." {
                            println!("{}", text.as_str());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sender.send(Message::Pong(data)).await.context("Pong failed")?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "Hub closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("Connection error"),
                    None => break,
                }
            }
        }
    }

    Ok(())
}
