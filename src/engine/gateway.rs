use async_trait::async_trait;

use crate::client::rest::{OpenOrderRecord, PostOrderOutcome, RestClient, TradeRecord};
use crate::error::EngineResult;
use crate::models::market::OrderBook;
use crate::models::order::{OrderType, SignedOrder};

/// The engine's seam to the exchange. Production uses the REST client;
/// tests drive the engine with a scripted implementation.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn submit_order(
        &self,
        signed: SignedOrder,
        order_type: OrderType,
    ) -> EngineResult<PostOrderOutcome>;

    async fn cancel_order(&self, order_id: &str) -> EngineResult<()>;

    async fn cancel_market_orders(&self, condition_id: &str) -> EngineResult<()>;

    async fn cancel_all(&self) -> EngineResult<()>;

    async fn open_orders(&self, condition_id: Option<&str>) -> EngineResult<Vec<OpenOrderRecord>>;

    async fn trades(&self, condition_id: Option<&str>) -> EngineResult<Vec<TradeRecord>>;

    async fn book(&self, token_id: &str) -> EngineResult<OrderBook>;
}

#[async_trait]
impl ExchangeGateway for RestClient {
    async fn submit_order(
        &self,
        signed: SignedOrder,
        order_type: OrderType,
    ) -> EngineResult<PostOrderOutcome> {
        self.post_order(signed, order_type, false).await
    }

    async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        RestClient::cancel_order(self, order_id).await
    }

    async fn cancel_market_orders(&self, condition_id: &str) -> EngineResult<()> {
        RestClient::cancel_market_orders(self, condition_id).await
    }

    async fn cancel_all(&self) -> EngineResult<()> {
        RestClient::cancel_all(self).await
    }

    async fn open_orders(&self, condition_id: Option<&str>) -> EngineResult<Vec<OpenOrderRecord>> {
        RestClient::open_orders(self, condition_id).await
    }

    async fn trades(&self, condition_id: Option<&str>) -> EngineResult<Vec<TradeRecord>> {
        RestClient::trades(self, condition_id).await
    }

    async fn book(&self, token_id: &str) -> EngineResult<OrderBook> {
        RestClient::book(self, token_id).await
    }
}
