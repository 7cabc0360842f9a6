use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use url::Url;

use super::{SignalMessage, SignalSink, SignalingConnection, SignalingError, SignalingTransport};

/// Signaling over a WebSocket to the channel gateway.
#[derive(Debug, Clone)]
pub struct WebSocketSignaling {
    base: Url,
}

impl WebSocketSignaling {
    pub fn new(url: &str) -> Result<Self, SignalingError> {
        Ok(Self {
            base: derive_websocket_url(url)?,
        })
    }

    fn endpoint(&self, channel_id: &str, peer_id: &str) -> Url {
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("channel", channel_id)
            .append_pair("peer", peer_id);
        url
    }
}

/// Accepts `http(s)` gateway URLs and maps them onto `ws(s)`.
fn derive_websocket_url(raw: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(raw)?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => {
            return Err(SignalingError::Transport(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::Transport(format!("cannot rewrite scheme of {raw}")))?;
    Ok(url)
}

struct WebSocketSink {
    send_tx: mpsc::UnboundedSender<SignalMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalSink for WebSocketSink {
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.send_tx
            .send(message)
            .map_err(|_| SignalingError::Closed)
    }
}

impl Drop for WebSocketSink {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignaling {
    async fn connect(
        &self,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<SignalingConnection, SignalingError> {
        let endpoint = self.endpoint(channel_id, peer_id);
        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|err| SignalingError::Transport(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "chorus::signaling",
            url = %endpoint,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(
                            target = "chorus::signaling",
                            kind = message.kind(),
                            error = %err,
                            "dropping unencodable message"
                        );
                        continue;
                    }
                };
                tracing::trace!(
                    target = "chorus::signaling",
                    event = "ws_out",
                    kind = message.kind(),
                    len = text.len()
                );
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "chorus::signaling",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "chorus::signaling",
                                    "signaling websocket error: {err}"
                                );
                            }
                        }
                        break;
                    }
                };
                match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(message) => {
                        tracing::trace!(
                            target = "chorus::signaling",
                            event = "ws_in",
                            kind = message.kind(),
                            len = text.len()
                        );
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(
                            target = "chorus::signaling",
                            error = %err,
                            "ignoring unrecognized signaling frame"
                        );
                    }
                }
            }
        });

        Ok(SignalingConnection {
            sink: Arc::new(WebSocketSink {
                send_tx,
                tasks: Mutex::new(vec![writer, reader]),
            }),
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_urls_become_websocket_urls() {
        let signaling = WebSocketSignaling::new("https://voice.example.org/ws").expect("url");
        let endpoint = signaling.endpoint("lounge", "a1");
        assert_eq!(endpoint.scheme(), "wss");
        assert_eq!(endpoint.query(), Some("channel=lounge&peer=a1"));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(matches!(
            WebSocketSignaling::new("ftp://voice.example.org"),
            Err(SignalingError::Transport(_))
        ));
    }
}
