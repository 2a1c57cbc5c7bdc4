use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::auth::ApiCreds;
use crate::runtime::shutdown::ShutdownSignal;

const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(45);
const MAX_BACKOFF_MS: u64 = 30_000;

/// One topic subscription on the real-time data stream.
#[derive(Debug, Clone, Serialize)]
pub struct RtdsSubscription {
    pub topic: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clob_auth: Option<RtdsAuth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RtdsAuth {
    pub key: String,
    pub secret: String,
    pub passphrase: String,
}

impl From<&ApiCreds> for RtdsAuth {
    fn from(creds: &ApiCreds) -> Self {
        Self {
            key: creds.key.clone(),
            secret: creds.secret.clone(),
            passphrase: creds.passphrase.clone(),
        }
    }
}

/// Framed message delivered by the stream.
#[derive(Debug, Clone, Deserialize)]
pub struct FramedMessage {
    pub topic: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Client for the auxiliary real-time data stream: `subscribe` /
/// `unsubscribe` frames carrying a subscription list, framed messages back.
/// Subscriptions are snapshotted and replayed on every reconnect.
pub struct RtdsStream {
    ws_url: String,
    subscriptions: Arc<Mutex<Vec<RtdsSubscription>>>,
    pending: Arc<Mutex<Vec<serde_json::Value>>>,
    messages_tx: broadcast::Sender<FramedMessage>,
}

impl RtdsStream {
    pub fn new(ws_url: &str) -> Self {
        let (messages_tx, _) = broadcast::channel(1024);
        Self {
            ws_url: ws_url.to_string(),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            pending: Arc::new(Mutex::new(Vec::new())),
            messages_tx,
        }
    }

    pub fn messages(&self) -> broadcast::Receiver<FramedMessage> {
        self.messages_tx.subscribe()
    }

    /// Add subscriptions; sent on the live socket and replayed after any
    /// reconnect.
    pub async fn subscribe(&self, subscriptions: Vec<RtdsSubscription>) {
        let frame = action_frame("subscribe", &subscriptions);
        self.subscriptions.lock().await.extend(subscriptions);
        self.pending.lock().await.push(frame);
    }

    pub async fn unsubscribe(&self, topic: &str) {
        let mut subs = self.subscriptions.lock().await;
        let removed: Vec<RtdsSubscription> =
            subs.iter().filter(|s| s.topic == topic).cloned().collect();
        subs.retain(|s| s.topic != topic);
        drop(subs);

        if !removed.is_empty() {
            let frame = action_frame("unsubscribe", &removed);
            self.pending.lock().await.push(frame);
        }
    }

    pub fn start(&self, shutdown: ShutdownSignal) {
        let ws_url = self.ws_url.clone();
        let subscriptions = self.subscriptions.clone();
        let pending = self.pending.clone();
        let messages_tx = self.messages_tx.clone();

        tokio::spawn(async move {
            let mut backoff_ms: u64 = 500;

            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                info!("rtds connecting: {ws_url}");

                let conn = tokio::select! {
                    result = connect_async(&ws_url) => result,
                    _ = shutdown.cancelled() => return,
                };

                match conn {
                    Ok((stream, _)) => {
                        info!("rtds connected");
                        backoff_ms = 500;

                        let (mut write, mut read) = stream.split();

                        // Replay the full subscription snapshot.
                        let snapshot = subscriptions.lock().await.clone();
                        if !snapshot.is_empty() {
                            let frame = action_frame("subscribe", &snapshot);
                            if write.send(Message::Text(frame.to_string())).await.is_err() {
                                continue;
                            }
                        }
                        pending.lock().await.clear();

                        let mut ping = tokio::time::interval(PING_INTERVAL);
                        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                        loop {
                            tokio::select! {
                                msg = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                                    match msg {
                                        Err(_) => continue,
                                        Ok(Some(Ok(Message::Text(text)))) => {
                                            if text == "PING" {
                                                let _ = write.send(Message::Text("PONG".into())).await;
                                                continue;
                                            }
                                            if text == "PONG" {
                                                continue;
                                            }
                                            if let Ok(framed) =
                                                serde_json::from_str::<FramedMessage>(&text)
                                            {
                                                let _ = messages_tx.send(framed);
                                            }
                                        }
                                        Ok(Some(Ok(Message::Ping(data)))) => {
                                            let _ = write.send(Message::Pong(data)).await;
                                        }
                                        Ok(Some(Ok(_))) => {}
                                        Ok(Some(Err(e))) => {
                                            warn!("rtds error: {e}");
                                            break;
                                        }
                                        Ok(None) => {
                                            warn!("rtds stream ended");
                                            break;
                                        }
                                    }
                                }
                                _ = ping.tick() => {
                                    // Flush queued (un)subscribe frames, then
                                    // keep the connection warm.
                                    let frames: Vec<serde_json::Value> = {
                                        let mut queue = pending.lock().await;
                                        queue.drain(..).collect()
                                    };
                                    let mut failed = false;
                                    for frame in frames {
                                        if write.send(Message::Text(frame.to_string())).await.is_err() {
                                            failed = true;
                                            break;
                                        }
                                    }
                                    if failed
                                        || write.send(Message::Text("PING".into())).await.is_err()
                                    {
                                        break;
                                    }
                                }
                                _ = shutdown.cancelled() => {
                                    let _ = write.send(Message::Close(None)).await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("rtds connect failed: {e}");
                    }
                }

                debug!("rtds reconnecting in {backoff_ms}ms");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)) => {}
                    _ = shutdown.cancelled() => return,
                }
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        });
    }
}

fn action_frame(action: &str, subscriptions: &[RtdsSubscription]) -> serde_json::Value {
    serde_json::json!({
        "action": action,
        "subscriptions": subscriptions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_shape() {
        let frame = action_frame(
            "subscribe",
            &[RtdsSubscription {
                topic: "crypto_prices".into(),
                message_type: "update".into(),
                filters: Some("btcusdt".into()),
                clob_auth: None,
            }],
        );
        assert_eq!(frame["action"], "subscribe");
        let sub = &frame["subscriptions"][0];
        assert_eq!(sub["topic"], "crypto_prices");
        assert_eq!(sub["type"], "update");
        assert_eq!(sub["filters"], "btcusdt");
        assert!(sub.get("clob_auth").is_none());
    }

    #[test]
    fn framed_message_parses() {
        let framed: FramedMessage = serde_json::from_str(
            r#"{
                "topic": "crypto_prices",
                "type": "update",
                "timestamp": 1700000000123,
                "payload": {"symbol": "btcusdt", "value": 98765.4}
            }"#,
        )
        .unwrap();
        assert_eq!(framed.topic, "crypto_prices");
        assert_eq!(framed.payload["symbol"], "btcusdt");
    }

    #[tokio::test]
    async fn unsubscribe_drops_topic() {
        let stream = RtdsStream::new("wss://example");
        stream
            .subscribe(vec![
                RtdsSubscription {
                    topic: "a".into(),
                    message_type: "update".into(),
                    filters: None,
                    clob_auth: None,
                },
                RtdsSubscription {
                    topic: "b".into(),
                    message_type: "update".into(),
                    filters: None,
                    clob_auth: None,
                },
            ])
            .await;

        stream.unsubscribe("a").await;
        let subs = stream.subscriptions.lock().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].topic, "b");
    }
}
