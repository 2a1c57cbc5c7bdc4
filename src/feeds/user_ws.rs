use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::auth::ApiCreds;
use crate::models::events::{DropHandler, OrderUpdate, TradeUpdate, UserEvent};
use crate::models::order::{OrderSide, OrderStatus};
use crate::runtime::shutdown::ShutdownSignal;

const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(45);
const MAX_BACKOFF_MS: u64 = 30_000;
const SUBSCRIBER_CAPACITY: usize = 256;

struct Subscriber {
    name: String,
    tx: mpsc::Sender<UserEvent>,
}

/// Authenticated user-topic WebSocket: order and trade events for the
/// account, fanned out over bounded per-subscriber channels.
///
/// When a subscriber's slot is full the event is dropped and the drop
/// handler fires; the session answers drops with a throttled reconcile, so
/// a drop costs latency, never correctness.
pub struct UserStream {
    ws_url: String,
    creds: ApiCreds,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    drop_handler: Arc<dyn DropHandler>,
}

impl UserStream {
    pub fn new(ws_url: &str, creds: ApiCreds, drop_handler: Arc<dyn DropHandler>) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            creds,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            drop_handler,
        }
    }

    /// Register a named subscriber with a bounded slot.
    pub async fn subscribe(&self, name: &str) -> mpsc::Receiver<UserEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().await.push(Subscriber {
            name: name.to_string(),
            tx,
        });
        rx
    }

    pub fn start(&self, shutdown: ShutdownSignal) {
        let ws_url = self.ws_url.clone();
        let creds = self.creds.clone();
        let subscribers = self.subscribers.clone();
        let drop_handler = self.drop_handler.clone();

        tokio::spawn(async move {
            let mut backoff_ms: u64 = 1000;

            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                info!("user ws connecting: {ws_url}");

                let conn = tokio::select! {
                    result = connect_async(&ws_url) => result,
                    _ = shutdown.cancelled() => return,
                };

                match conn {
                    Ok((stream, _)) => {
                        info!("user ws connected");
                        backoff_ms = 1000;

                        let (mut write, mut read) = stream.split();

                        let auth_frame = serde_json::json!({
                            "auth": {
                                "apikey": creds.key,
                                "secret": creds.secret,
                                "passphrase": creds.passphrase,
                            },
                            "type": "user",
                        });
                        if let Err(e) = write.send(Message::Text(auth_frame.to_string())).await {
                            warn!("user ws auth frame failed: {e}");
                            continue;
                        }

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
                                            let events = parse_user_messages(&text);
                                            for event in events {
                                                Self::fan_out(&subscribers, &drop_handler, event).await;
                                            }
                                        }
                                        Ok(Some(Ok(Message::Ping(data)))) => {
                                            let _ = write.send(Message::Pong(data)).await;
                                        }
                                        Ok(Some(Ok(_))) => {}
                                        Ok(Some(Err(e))) => {
                                            warn!("user ws error: {e}");
                                            break;
                                        }
                                        Ok(None) => {
                                            warn!("user ws stream ended");
                                            break;
                                        }
                                    }
                                }
                                _ = ping.tick() => {
                                    if write.send(Message::Text("PING".into())).await.is_err() {
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
                        warn!("user ws connect failed: {e}");
                    }
                }

                debug!("user ws reconnecting in {backoff_ms}ms");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)) => {}
                    _ = shutdown.cancelled() => return,
                }
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        });
    }

    async fn fan_out(
        subscribers: &Mutex<Vec<Subscriber>>,
        drop_handler: &Arc<dyn DropHandler>,
        event: UserEvent,
    ) {
        let mut guard = subscribers.lock().await;
        guard.retain(|s| !s.tx.is_closed());
        for subscriber in guard.iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    warn!(
                        "user event dropped: {} slot full ({})",
                        subscriber.name,
                        dropped.kind().label()
                    );
                    drop_handler.on_drop(dropped.kind(), &subscriber.name);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Parse one frame into validated events. Frames can hold a single object
/// or an array; anything without the required fields is skipped.
pub fn parse_user_messages(text: &str) -> Vec<UserEvent> {
    let raw: Vec<RawUserMessage> = match serde_json::from_str(text) {
        Ok(batch) => batch,
        Err(_) => match serde_json::from_str::<RawUserMessage>(text) {
            Ok(single) => vec![single],
            Err(_) => return Vec::new(),
        },
    };

    raw.into_iter().filter_map(validate).collect()
}

fn validate(msg: RawUserMessage) -> Option<UserEvent> {
    match msg.event_type.as_deref() {
        Some("order") => {
            let order_id = msg.id.filter(|id| !id.is_empty())?;
            let asset_id = msg.asset_id.filter(|id| !id.is_empty())?;
            let side = OrderSide::from_str(msg.side.as_deref().unwrap_or(""))?;
            let price = parse_decimal(msg.price.as_deref())?;
            let original_size = parse_decimal(msg.original_size.as_deref())?;
            let filled_size =
                parse_decimal(msg.size_matched.as_deref()).unwrap_or(Decimal::ZERO);

            let status = match msg.status.as_deref().map(str::to_ascii_uppercase).as_deref() {
                Some("MATCHED") | Some("FILLED") => OrderStatus::Filled,
                Some("CANCELED") | Some("CANCELLED") => OrderStatus::Cancelled,
                Some("REJECTED") => OrderStatus::Rejected,
                Some("LIVE") => {
                    if filled_size > Decimal::ZERO && filled_size < original_size {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::Live
                    }
                }
                _ => match msg.update_type.as_deref() {
                    Some("CANCELLATION") => OrderStatus::Cancelled,
                    Some("PLACEMENT") => OrderStatus::Live,
                    _ => OrderStatus::Live,
                },
            };

            Some(UserEvent::Order(OrderUpdate {
                order_id,
                // The wire carries the condition id; the session router
                // resolves it against the bound market.
                market_slug: msg.market.unwrap_or_default(),
                asset_id,
                side,
                price,
                original_size,
                filled_size,
                status,
                timestamp: parse_timestamp(msg.timestamp.as_deref()),
            }))
        }
        Some("trade") => {
            let trade_id = msg.id.filter(|id| !id.is_empty())?;
            let asset_id = msg.asset_id.filter(|id| !id.is_empty())?;
            let side = OrderSide::from_str(msg.side.as_deref().unwrap_or(""))?;
            let price = parse_decimal(msg.price.as_deref())?;
            let size = parse_decimal(msg.size.as_deref())?;
            if size <= Decimal::ZERO {
                return None;
            }

            Some(UserEvent::Trade(TradeUpdate {
                trade_id,
                order_id: msg.taker_order_id.unwrap_or_default(),
                market_slug: msg.market.unwrap_or_default(),
                asset_id,
                side,
                price,
                size,
                timestamp: parse_timestamp(msg.match_time.as_deref()),
            }))
        }
        _ => None,
    }
}

fn parse_decimal(raw: Option<&str>) -> Option<Decimal> {
    Decimal::from_str(raw?).ok()
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| {
            // Some feeds send millis
            if secs > 10_000_000_000 {
                DateTime::from_timestamp_millis(secs)
            } else {
                DateTime::from_timestamp(secs, 0)
            }
        })
        .unwrap_or_else(Utc::now)
}

#[derive(Debug, Deserialize)]
pub struct RawUserMessage {
    event_type: Option<String>,
    id: Option<String>,
    asset_id: Option<String>,
    market: Option<String>,
    side: Option<String>,
    price: Option<String>,
    size: Option<String>,
    original_size: Option<String>,
    size_matched: Option<String>,
    status: Option<String>,
    #[serde(rename = "type")]
    update_type: Option<String>,
    taker_order_id: Option<String>,
    timestamp: Option<String>,
    match_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::events::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDropHandler(AtomicUsize);

    impl DropHandler for CountingDropHandler {
        fn on_drop(&self, _kind: EventKind, _meta: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn parses_order_event() {
        let msg = r#"{
            "event_type": "order",
            "id": "0xorder1",
            "asset_id": "tok_up",
            "market": "0xcond",
            "side": "BUY",
            "price": "0.55",
            "original_size": "10",
            "size_matched": "4",
            "status": "LIVE",
            "type": "UPDATE",
            "timestamp": "1700000123"
        }"#;
        let events = parse_user_messages(msg);
        assert_eq!(events.len(), 1);
        let UserEvent::Order(order) = &events[0] else {
            panic!("expected order event");
        };
        assert_eq!(order.order_id, "0xorder1");
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.market_slug, "0xcond");
    }

    #[test]
    fn parses_trade_event() {
        let msg = r#"{
            "event_type": "trade",
            "id": "trade-1",
            "asset_id": "tok_up",
            "market": "0xcond",
            "side": "SELL",
            "price": "0.48",
            "size": "3.5",
            "taker_order_id": "0xorder1",
            "match_time": "1700000200"
        }"#;
        let events = parse_user_messages(msg);
        assert_eq!(events.len(), 1);
        let UserEvent::Trade(trade) = &events[0] else {
            panic!("expected trade event");
        };
        assert_eq!(trade.trade_id, "trade-1");
        assert_eq!(trade.side, OrderSide::Sell);
    }

    #[test]
    fn missing_required_fields_are_skipped() {
        // no id
        let msg = r#"{"event_type": "order", "asset_id": "tok", "side": "BUY", "price": "0.5", "original_size": "1"}"#;
        assert!(parse_user_messages(msg).is_empty());

        // zero-size trade
        let msg = r#"{"event_type": "trade", "id": "t", "asset_id": "tok", "side": "BUY", "price": "0.5", "size": "0"}"#;
        assert!(parse_user_messages(msg).is_empty());

        // unknown event type
        let msg = r#"{"event_type": "heartbeat"}"#;
        assert!(parse_user_messages(msg).is_empty());
    }

    #[tokio::test]
    async fn full_slot_drops_and_notifies() {
        let handler = Arc::new(CountingDropHandler(AtomicUsize::new(0)));
        let creds = ApiCreds {
            key: "k".into(),
            secret: "c2VjcmV0".into(),
            passphrase: "p".into(),
        };
        let stream = UserStream::new("wss://example", creds, handler.clone());

        // Tiny slot so the second event overflows.
        let (tx, mut rx) = mpsc::channel(1);
        stream.subscribers.lock().await.push(Subscriber {
            name: "strategy".into(),
            tx,
        });

        let event = parse_user_messages(
            r#"{"event_type": "trade", "id": "t1", "asset_id": "a", "side": "BUY", "price": "0.5", "size": "1"}"#,
        )
        .pop()
        .unwrap();

        UserStream::fan_out(&stream.subscribers, &stream.drop_handler, event.clone()).await;
        UserStream::fan_out(&stream.subscribers, &stream.drop_handler, event).await;

        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
