use alloy_primitives::{keccak256, Address, B256, U256};
use serde::Deserialize;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::runtime::shutdown::ShutdownSignal;

const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const BROADCAST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const RECEIPT_ATTEMPTS: u32 = 60;
const RECEIPT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Thin JSON-RPC client for chain reads and raw-transaction broadcast.
pub struct RpcClient {
    url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxReceipt {
    pub status: Option<String>,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: Option<String>,
    #[serde(rename = "gasUsed")]
    pub gas_used: Option<String>,
}

impl TxReceipt {
    pub fn succeeded(&self) -> bool {
        self.status.as_deref() == Some("0x1")
    }
}

impl RpcClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: std::time::Duration,
    ) -> EngineResult<serde_json::Value> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let resp: JsonRpcResponse = self
            .http
            .post(&self.url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("rpc decode ({method}): {e}")))?;

        if let Some(err) = resp.error {
            return Err(EngineError::Transient(format!("rpc {method}: {err}")));
        }
        resp.result
            .ok_or_else(|| EngineError::Transient(format!("rpc {method}: empty result")))
    }

    /// eth_call against a contract, returning the raw result bytes.
    pub async fn eth_call(&self, to: Address, calldata: &[u8]) -> EngineResult<Vec<u8>> {
        let result = self
            .call(
                "eth_call",
                serde_json::json!([{
                    "to": format!("{:?}", to),
                    "data": format!("0x{}", hex::encode(calldata)),
                }, "latest"]),
                READ_TIMEOUT,
            )
            .await?;
        let raw = result.as_str().unwrap_or("0x");
        hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| EngineError::Transient(format!("rpc eth_call decode: {e}")))
    }

    /// eth_call that decodes a single uint256 return value.
    pub async fn eth_call_u256(&self, to: Address, calldata: &[u8]) -> EngineResult<U256> {
        let bytes = self.eth_call(to, calldata).await?;
        if bytes.len() < 32 {
            return Ok(U256::ZERO);
        }
        Ok(U256::from_be_slice(&bytes[..32]))
    }

    pub async fn get_balance(&self, address: Address) -> EngineResult<U256> {
        let result = self
            .call(
                "eth_getBalance",
                serde_json::json!([format!("{:?}", address), "latest"]),
                READ_TIMEOUT,
            )
            .await?;
        parse_hex_u256(&result)
    }

    pub async fn get_nonce(&self, address: Address) -> EngineResult<u64> {
        let result = self
            .call(
                "eth_getTransactionCount",
                serde_json::json!([format!("{:?}", address), "pending"]),
                READ_TIMEOUT,
            )
            .await?;
        Ok(parse_hex_u256(&result)?.to::<u64>())
    }

    /// Gas price with a 20% inclusion buffer.
    pub async fn gas_price(&self) -> EngineResult<u128> {
        let result = self
            .call("eth_gasPrice", serde_json::json!([]), READ_TIMEOUT)
            .await?;
        let price = parse_hex_u256(&result)?.to::<u128>();
        Ok(price * 120 / 100)
    }

    pub async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        calldata: &[u8],
    ) -> EngineResult<u64> {
        let result = self
            .call(
                "eth_estimateGas",
                serde_json::json!([{
                    "from": format!("{:?}", from),
                    "to": format!("{:?}", to),
                    "data": format!("0x{}", hex::encode(calldata)),
                }]),
                READ_TIMEOUT,
            )
            .await?;
        Ok(parse_hex_u256(&result)?.to::<u64>())
    }

    pub async fn send_raw_transaction(&self, raw: &[u8]) -> EngineResult<String> {
        let result = self
            .call(
                "eth_sendRawTransaction",
                serde_json::json!([format!("0x{}", hex::encode(raw))]),
                BROADCAST_TIMEOUT,
            )
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::Transient("no tx hash in broadcast response".into()))
    }

    pub async fn get_receipt(&self, tx_hash: &str) -> EngineResult<Option<TxReceipt>> {
        let result = self
            .call(
                "eth_getTransactionReceipt",
                serde_json::json!([tx_hash]),
                READ_TIMEOUT,
            )
            .await;
        match result {
            Ok(value) if !value.is_null() => {
                let receipt: TxReceipt = serde_json::from_value(value)
                    .map_err(|e| EngineError::Transient(format!("receipt decode: {e}")))?;
                Ok(Some(receipt))
            }
            Ok(_) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Poll until the receipt lands. On exhausted attempts the hash is
    /// surfaced in the error for out-of-band inspection.
    pub async fn wait_for_receipt(
        &self,
        tx_hash: &str,
        shutdown: &ShutdownSignal,
    ) -> EngineResult<TxReceipt> {
        for attempt in 0..RECEIPT_ATTEMPTS {
            tokio::select! {
                _ = tokio::time::sleep(RECEIPT_INTERVAL) => {}
                _ = shutdown.cancelled() => {
                    return Err(EngineError::Transient(format!(
                        "receipt wait cancelled, tx {tx_hash} pending"
                    )));
                }
            }

            match self.get_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {
                    if attempt % 6 == 5 {
                        debug!("still waiting on receipt {tx_hash} ({attempt})");
                    }
                }
                Err(e) => debug!("receipt poll error: {e}"),
            }
        }
        Err(EngineError::Transient(format!(
            "receipt timed out, tx {tx_hash} still pending"
        )))
    }
}

fn parse_hex_u256(value: &serde_json::Value) -> EngineResult<U256> {
    let raw = value.as_str().unwrap_or("0x0");
    U256::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| EngineError::Transient(format!("bad hex quantity {raw}: {e}")))
}

/// CTF position id for a binary-outcome slot with the null parent
/// collection:
///   collectionId = keccak256(conditionId ++ indexSet)
///   positionId = keccak256(collateral ++ collectionId)
pub fn compute_position_id(condition_id: B256, index_set: u32, collateral: Address) -> U256 {
    let mut packed = Vec::with_capacity(64);
    packed.extend_from_slice(condition_id.as_slice());
    packed.extend_from_slice(&U256::from(index_set).to_be_bytes::<32>());
    let collection_id = keccak256(&packed);

    let mut packed = Vec::with_capacity(52);
    packed.extend_from_slice(collateral.as_slice());
    packed.extend_from_slice(collection_id.as_slice());
    U256::from_be_bytes(keccak256(&packed).into())
}

pub fn parse_condition_id(condition_id: &str) -> EngineResult<B256> {
    let hex_str = condition_id.strip_prefix("0x").unwrap_or(condition_id);
    let bytes = hex::decode(hex_str)
        .map_err(|e| EngineError::Validation(format!("bad condition id: {e}")))?;
    if bytes.len() != 32 {
        return Err(EngineError::Validation(format!(
            "condition id must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(B256::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_ids_differ_per_index_set() {
        let condition =
            parse_condition_id("0x1111111111111111111111111111111111111111111111111111111111111111")
                .unwrap();
        let collateral: Address = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174"
            .parse()
            .unwrap();
        let up = compute_position_id(condition, 1, collateral);
        let down = compute_position_id(condition, 2, collateral);
        assert_ne!(up, down);
        assert_ne!(up, U256::ZERO);
    }

    #[test]
    fn condition_id_length_checked() {
        assert!(parse_condition_id("0x1234").is_err());
        assert!(parse_condition_id("not-hex").is_err());
        assert!(parse_condition_id(
            "0x1111111111111111111111111111111111111111111111111111111111111111"
        )
        .is_ok());
    }
}
