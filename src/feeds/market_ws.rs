use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::models::events::{now_ms, PriceChanged};
use crate::models::market::{BestBook, Market, OrderBook};
use crate::runtime::shutdown::ShutdownSignal;

const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(45);
const MAX_BACKOFF_MS: u64 = 30_000;

/// Market-topic WebSocket for one session's market.
///
/// Maintains a top-of-book cache per asset and broadcasts `PriceChanged`.
/// One read loop per socket; the write half lives in the same loop, so
/// PING/PONG and the subscribe frame are naturally serialized.
pub struct MarketStream {
    ws_url: String,
    market: Market,
    books: Arc<DashMap<String, OrderBook>>,
    best: Arc<DashMap<String, BestBook>>,
    tick_sizes: Arc<DashMap<String, Decimal>>,
    last_trade: Arc<DashMap<String, Decimal>>,
    price_tx: broadcast::Sender<PriceChanged>,
}

impl MarketStream {
    pub fn new(ws_url: &str, market: Market) -> Self {
        let (price_tx, _) = broadcast::channel(512);
        Self {
            ws_url: ws_url.to_string(),
            market,
            books: Arc::new(DashMap::new()),
            best: Arc::new(DashMap::new()),
            tick_sizes: Arc::new(DashMap::new()),
            last_trade: Arc::new(DashMap::new()),
            price_tx,
        }
    }

    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceChanged> {
        self.price_tx.subscribe()
    }

    /// Lock-free read of the latest top of book.
    pub fn best(&self, asset_id: &str) -> Option<BestBook> {
        self.best.get(asset_id).map(|b| *b)
    }

    pub fn last_trade_price(&self, asset_id: &str) -> Option<Decimal> {
        self.last_trade.get(asset_id).map(|p| *p)
    }

    pub fn tick_size(&self, asset_id: &str) -> Option<Decimal> {
        self.tick_sizes.get(asset_id).map(|t| *t)
    }

    /// Run the connection with reconnect/backoff until shutdown. The
    /// subscription set is the bound market's asset ids, replayed on every
    /// reconnect.
    pub fn start(&self, shutdown: ShutdownSignal) {
        let ws_url = self.ws_url.clone();
        let market = self.market.clone();
        let books = self.books.clone();
        let best = self.best.clone();
        let tick_sizes = self.tick_sizes.clone();
        let last_trade = self.last_trade.clone();
        let price_tx = self.price_tx.clone();

        tokio::spawn(async move {
            let mut backoff_ms: u64 = 500;

            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                info!("market ws connecting: {ws_url}");

                let conn = tokio::select! {
                    result = connect_async(&ws_url) => result,
                    _ = shutdown.cancelled() => return,
                };

                match conn {
                    Ok((stream, _)) => {
                        info!("market ws connected for {}", market.slug);
                        backoff_ms = 500;

                        let (mut write, mut read) = stream.split();

                        let subscribe = serde_json::json!({
                            "assets_ids": market.asset_ids(),
                            "type": "market",
                        });
                        if let Err(e) =
                            write.send(Message::Text(subscribe.to_string())).await
                        {
                            warn!("market ws subscribe failed: {e}");
                            continue;
                        }

                        let mut ping = tokio::time::interval(PING_INTERVAL);
                        ping.set_missed_tick_behavior(
                            tokio::time::MissedTickBehavior::Delay,
                        );

                        loop {
                            tokio::select! {
                                msg = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                                    match msg {
                                        // Idle timeout is a context check,
                                        // not an error.
                                        Err(_) => continue,
                                        Ok(Some(Ok(Message::Text(text)))) => {
                                            if text == "PING" {
                                                let _ = write.send(Message::Text("PONG".into())).await;
                                                continue;
                                            }
                                            if text == "PONG" {
                                                continue;
                                            }
                                            Self::handle_message(
                                                &text, &market, &books, &best,
                                                &tick_sizes, &last_trade, &price_tx,
                                            );
                                        }
                                        Ok(Some(Ok(Message::Ping(data)))) => {
                                            let _ = write.send(Message::Pong(data)).await;
                                        }
                                        Ok(Some(Ok(_))) => {}
                                        Ok(Some(Err(e))) => {
                                            warn!("market ws error: {e}");
                                            break;
                                        }
                                        Ok(None) => {
                                            warn!("market ws stream ended");
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
                        warn!("market ws connect failed: {e}");
                    }
                }

                debug!("market ws reconnecting in {backoff_ms}ms");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)) => {}
                    _ = shutdown.cancelled() => return,
                }
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        });
    }

    fn handle_message(
        text: &str,
        market: &Market,
        books: &DashMap<String, OrderBook>,
        best: &DashMap<String, BestBook>,
        tick_sizes: &DashMap<String, Decimal>,
        last_trade: &DashMap<String, Decimal>,
        price_tx: &broadcast::Sender<PriceChanged>,
    ) {
        // The initial snapshot arrives as an array; later messages are
        // single objects.
        let messages: Vec<RawMarketMessage> = match serde_json::from_str(text) {
            Ok(batch) => batch,
            Err(_) => match serde_json::from_str::<RawMarketMessage>(text) {
                Ok(single) => vec![single],
                Err(_) => return,
            },
        };

        for msg in messages {
            let Some(asset_id) = msg.asset_id.clone() else {
                continue;
            };
            if !market.contains_asset(&asset_id) {
                continue;
            }

            match msg.event_type.as_deref() {
                Some("book") => {
                    let mut book = OrderBook::new(asset_id.clone());
                    for level in msg.bids.unwrap_or_default() {
                        book.apply_level(true, level.price_dec(), level.size_dec());
                    }
                    for level in msg.asks.unwrap_or_default() {
                        book.apply_level(false, level.price_dec(), level.size_dec());
                    }
                    books.insert(asset_id.clone(), book);
                    Self::publish_best(&asset_id, market, books, best, price_tx);
                }
                Some("price_change") => {
                    if let Some(mut book) = books.get_mut(&asset_id) {
                        for change in msg.changes.unwrap_or_default() {
                            let is_bid = change.side.as_deref() == Some("BUY");
                            book.apply_level(is_bid, change.price_dec(), change.size_dec());
                        }
                    }
                    Self::publish_best(&asset_id, market, books, best, price_tx);
                }
                Some("tick_size_change") => {
                    if let Some(tick) = msg
                        .new_tick_size
                        .as_deref()
                        .and_then(|t| Decimal::from_str(t).ok())
                    {
                        info!("tick size change for {asset_id}: {tick}");
                        tick_sizes.insert(asset_id, tick);
                    }
                }
                Some("last_trade_price") => {
                    if let Some(price) = msg
                        .price
                        .as_deref()
                        .and_then(|p| Decimal::from_str(p).ok())
                    {
                        last_trade.insert(asset_id, price);
                    }
                }
                _ => {}
            }
        }
    }

    fn publish_best(
        asset_id: &str,
        market: &Market,
        books: &DashMap<String, OrderBook>,
        best: &DashMap<String, BestBook>,
        price_tx: &broadcast::Sender<PriceChanged>,
    ) {
        let Some(book) = books.get(asset_id) else {
            return;
        };
        let (bid, bid_size) = book
            .best_bid()
            .map(|(p, s)| (dec_f64(p), dec_f64(s)))
            .unwrap_or((0.0, 0.0));
        let (ask, ask_size) = book
            .best_ask()
            .map(|(p, s)| (dec_f64(p), dec_f64(s)))
            .unwrap_or((0.0, 0.0));
        drop(book);

        let snapshot = BestBook {
            bid,
            ask,
            bid_size,
            ask_size,
            ts_ms: now_ms(),
        };

        let changed = best
            .get(asset_id)
            .map(|prev| prev.bid != snapshot.bid || prev.ask != snapshot.ask)
            .unwrap_or(true);
        best.insert(asset_id.to_string(), snapshot);

        if changed {
            if let Some(token_type) = market.token_type_of(asset_id) {
                let _ = price_tx.send(PriceChanged {
                    market_slug: market.slug.clone(),
                    asset_id: asset_id.to_string(),
                    token_type,
                    new_bid: bid,
                    new_ask: ask,
                    ts_ms: snapshot.ts_ms,
                });
            }
        }
    }
}

fn dec_f64(d: Decimal) -> f64 {
    d.to_string().parse().unwrap_or(0.0)
}

#[derive(Debug, Deserialize)]
struct RawMarketMessage {
    event_type: Option<String>,
    asset_id: Option<String>,
    #[serde(default)]
    bids: Option<Vec<RawLevel>>,
    #[serde(default)]
    asks: Option<Vec<RawLevel>>,
    #[serde(default)]
    changes: Option<Vec<RawChange>>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    new_tick_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

impl RawLevel {
    fn price_dec(&self) -> Decimal {
        Decimal::from_str(&self.price).unwrap_or_default()
    }
    fn size_dec(&self) -> Decimal {
        Decimal::from_str(&self.size).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct RawChange {
    price: String,
    side: Option<String>,
    size: String,
}

impl RawChange {
    fn price_dec(&self) -> Decimal {
        Decimal::from_str(&self.price).unwrap_or_default()
    }
    fn size_dec(&self) -> Decimal {
        Decimal::from_str(&self.size).unwrap_or_default()
    }
}
