//! In-process fake MaixCAM device shared by the integration tests.
//!
//! The fake accepts one WebSocket connection on `127.0.0.1:<random port>`,
//! decodes every binary message as a protocol frame, records it, and answers
//! with whatever the test's responder returns.

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use maix_core::{decode_frame, encode_frame, Command, Frame, Payload};
use maix_host::LinkEvent;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

/// What the fake device does in reply to one frame.
pub enum Reply {
    /// Send an encoded frame.
    Frame(Vec<u8>),
    /// Send raw bytes that are not a valid frame.
    Raw(Vec<u8>),
    /// Pause before the next reply.
    Wait(Duration),
    /// Close the WebSocket.
    Close,
}

pub fn frame(command: Command, payload: &[u8]) -> Reply {
    Reply::Frame(encode_frame(command, Payload::Bytes(payload)).unwrap())
}

/// A device that accepts the token, reports its versions, and runs every
/// program as: ack, one line of output, one JPEG frame, clean exit.
pub fn friendly(received: &Frame) -> Vec<Reply> {
    match received.command {
        Command::Auth => vec![frame(Command::AuthAck, &[1])],
        Command::DeviceInfo => vec![frame(
            Command::DeviceInfoAck,
            br#"{"sysVer":"2024.6.1","maixpyVer":"4.3.2"}"#,
        )],
        Command::Run => vec![
            frame(Command::RunAck, &[1]),
            frame(Command::Output, b"hello\n"),
            frame(Command::Img, &[1, 0xFF, 0xD8, 0xFF, 0xD9]),
            frame(Command::Finish, &[0, 0, 0, 0]),
        ],
        Command::Stop => vec![frame(Command::StopAck, &[1])],
        _ => Vec::new(),
    }
}

/// Starts the fake device.  Returns its port and a channel of every frame it
/// received.
pub async fn spawn_device<F>(mut respond: F) -> (u16, mpsc::UnboundedReceiver<Frame>)
where
    F: FnMut(&Frame) -> Vec<Reply> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        while let Some(Ok(message)) = ws.next().await {
            let Message::Binary(data) = message else {
                continue;
            };
            let Ok((received, _)) = decode_frame(&data) else {
                continue;
            };
            let replies = respond(&received);
            let _ = seen_tx.send(received);
            for reply in replies {
                let sent = match reply {
                    Reply::Frame(bytes) | Reply::Raw(bytes) => ws.send(Message::Binary(bytes)).await,
                    Reply::Wait(pause) => {
                        tokio::time::sleep(pause).await;
                        Ok(())
                    }
                    Reply::Close => {
                        let _ = ws.close(None).await;
                        return;
                    }
                };
                if sent.is_err() {
                    return;
                }
            }
        }
    });

    (port, seen_rx)
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Receives events until `stop` matches one (inclusive) or `within` elapses.
pub async fn collect_until(
    events: &mut broadcast::Receiver<LinkEvent>,
    within: Duration,
    stop: impl Fn(&LinkEvent) -> bool,
) -> Vec<LinkEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(within, async {
        while let Ok(event) = events.recv().await {
            let done = stop(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    seen
}

/// Typed events only; raw `Frame` echoes removed.
pub fn typed(events: Vec<LinkEvent>) -> Vec<LinkEvent> {
    events
        .into_iter()
        .filter(|e| !matches!(e, LinkEvent::Frame(_)))
        .collect()
}
