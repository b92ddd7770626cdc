//! `peerline chat`: interactive chat with one peer through the relay.
//!
//! Each non-empty line typed on stdin is sent as a text frame; every frame
//! the relay delivers is printed as `Peer: <message>`. Typing `quit`, closing
//! stdin, or the relay closing the connection ends the session.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::io::BufRead;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};
use url::Url;

/// Build the relay endpoint URL carrying both identifiers.
pub fn build_url(server: &str, path: &str, user: &str, peer: &str) -> Result<Url> {
    let mut url = Url::parse(server).with_context(|| format!("invalid server URL: {server}"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => bail!("unsupported scheme '{other}' (expected ws or wss)"),
    }
    url.set_path(path);
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", user)
        .append_pair("peer_id", peer);
    Ok(url)
}

/// How an incoming relay message is shown to the user.
#[derive(Debug, PartialEq, Eq)]
enum Incoming {
    Show(String),
    Closed(String),
    Ignore,
}

fn describe_incoming(message: &Message) -> Incoming {
    match message {
        Message::Text(text) => Incoming::Show(text.clone()),
        Message::Binary(data) => Incoming::Show(format!("<{} bytes of binary data>", data.len())),
        Message::Close(Some(frame)) if !frame.reason.is_empty() => {
            Incoming::Closed(frame.reason.to_string())
        }
        Message::Close(_) => Incoming::Closed("closed by relay".to_string()),
        _ => Incoming::Ignore,
    }
}

/// Spawn a thread that forwards stdin lines into a channel.
///
/// A plain thread keeps a pending blocking read from holding up runtime
/// shutdown when the session ends from the relay side.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

/// Run an interactive chat session.
pub async fn run(server: &str, path: &str, user: &str, peer: &str) -> Result<()> {
    let url = build_url(server, path, user, peer)?;
    println!("Connecting to {url}");

    let (ws, _response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!(user = %user, peer = %peer, "connected to relay");
    let (mut sink, mut stream) = ws.split();

    let mut receiver = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(message) => match describe_incoming(&message) {
                    Incoming::Show(text) => println!("\nPeer: {text}"),
                    Incoming::Closed(reason) => {
                        println!("Connection closed: {reason}");
                        break;
                    }
                    Incoming::Ignore => {}
                },
                Err(e) => {
                    println!("Connection closed or error: {e}");
                    break;
                }
            }
        }
    });

    println!("Type your messages below (type 'quit' to exit):");
    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            _ = &mut receiver => break,
            line = lines.recv() => {
                let Some(line) = line else { break };
                let msg = line.trim();
                if msg.eq_ignore_ascii_case("quit") {
                    println!("Exiting chat...");
                    break;
                }
                if msg.is_empty() {
                    continue;
                }
                sink.send(Message::Text(msg.to_string()))
                    .await
                    .context("error sending message")?;
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "close after chat failed");
    }
    receiver.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    #[test]
    fn url_carries_both_ids() {
        let url = build_url("ws://127.0.0.1:8080", "/sendMessage", "alice", "bob").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/sendMessage?user_id=alice&peer_id=bob");
    }

    #[test]
    fn url_encodes_ids_and_replaces_query() {
        let url = build_url("wss://relay.example/old?x=1", "/ws", "a b", "c&d").unwrap();
        assert_eq!(url.path(), "/ws");
        assert_eq!(url.query(), Some("user_id=a+b&peer_id=c%26d"));
    }

    #[test]
    fn url_rejects_http() {
        assert!(build_url("http://127.0.0.1:8080", "/sendMessage", "a", "b").is_err());
        assert!(build_url("not a url", "/sendMessage", "a", "b").is_err());
    }

    #[test]
    fn incoming_messages_are_described() {
        assert_eq!(
            describe_incoming(&Message::Text("hi".into())),
            Incoming::Show("hi".into())
        );
        assert_eq!(
            describe_incoming(&Message::Binary(vec![0; 3])),
            Incoming::Show("<3 bytes of binary data>".into())
        );
        assert_eq!(describe_incoming(&Message::Ping(vec![])), Incoming::Ignore);

        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "Missing user_id or peer_id".into(),
        }));
        assert_eq!(
            describe_incoming(&close),
            Incoming::Closed("Missing user_id or peer_id".into())
        );
        assert_eq!(
            describe_incoming(&Message::Close(None)),
            Incoming::Closed("closed by relay".into())
        );
    }
}
