use alloy_primitives::{keccak256, Address, B256, U256};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::Signer;
use crate::error::{EngineError, EngineResult};
use crate::runtime::shutdown::ShutdownSignal;

const POLL_ATTEMPTS: u32 = 60;
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// One meta-transaction executed by the funder wallet.
#[derive(Debug, Clone)]
pub struct SafeTransaction {
    pub to: Address,
    /// 0 = CALL, 1 = DELEGATECALL
    pub operation: u8,
    pub data: Vec<u8>,
    pub value: U256,
}

#[derive(Debug, Clone)]
pub struct RelayedTx {
    pub tx_id: String,
    pub tx_hash: Option<String>,
    pub state: String,
}

impl RelayedTx {
    pub fn is_final_success(&self) -> bool {
        matches!(self.state.as_str(), "STATE_MINED" | "STATE_CONFIRMED")
    }

    pub fn is_final_failure(&self) -> bool {
        matches!(self.state.as_str(), "STATE_FAILED" | "STATE_INVALID")
    }
}

/// Gasless execution through the relayer: the EOA signs the Safe
/// transaction digest (EIP-191 personal-sign) and the relayer broadcasts on
/// the funder wallet's behalf.
pub struct RelayerClient {
    url: String,
    http: reqwest::Client,
    signer: Arc<Signer>,
    chain_id: u64,
    api_key: String,
    secret: String,
    passphrase: String,
}

impl RelayerClient {
    pub fn new(
        url: &str,
        signer: Arc<Signer>,
        chain_id: u64,
        api_key: String,
        secret: String,
        passphrase: String,
    ) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("relayer http client"),
            signer,
            chain_id,
            api_key,
            secret,
            passphrase,
        }
    }

    fn builder_headers(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("BUILDER_API_KEY", &self.api_key)
            .header("BUILDER_SECRET", &self.secret)
            .header("BUILDER_PASS_PHRASE", &self.passphrase)
    }

    /// Submit one Safe transaction and poll it to a final state.
    pub async fn execute(
        &self,
        funder: Address,
        tx: SafeTransaction,
        metadata: &str,
        shutdown: &ShutdownSignal,
    ) -> EngineResult<RelayedTx> {
        let nonce = self.fetch_nonce().await?;
        debug!("relayer nonce: {nonce}");

        let digest = safe_tx_digest(self.chain_id, funder, &tx, &nonce);
        let signature = self.signer.sign_personal(digest.as_slice()).await?;
        // Safe distinguishes eth_sign-style signatures by v + 4.
        let signature = bump_safe_v(&signature)?;

        let body = serde_json::json!({
            "from": format!("{:?}", self.signer.address()),
            "proxyWallet": format!("{:?}", funder),
            "transactions": [{
                "to": format!("{:?}", tx.to),
                "operation": tx.operation,
                "data": format!("0x{}", hex::encode(&tx.data)),
                "value": tx.value.to_string(),
            }],
            "nonce": nonce,
            "signature": signature,
            "metadata": metadata,
        })
        .to_string();

        let resp = self
            .builder_headers(self.http.post(format!("{}/submit", self.url)))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!("relayer submit failed: {status} {text}");
            return Err(EngineError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        #[derive(Deserialize)]
        struct SubmitResponse {
            #[serde(rename = "transactionID", default)]
            transaction_id: Option<String>,
            #[serde(rename = "transactionHash", default)]
            transaction_hash: Option<String>,
        }

        let submitted: SubmitResponse = serde_json::from_str(&text).map_err(|_| {
            EngineError::Decode {
                context: "relayer submit".into(),
                preview: crate::error::body_preview(&text),
            }
        })?;

        let tx_id = submitted.transaction_id.unwrap_or_default();
        if tx_id.is_empty() {
            return Err(EngineError::ChainTerminal(
                "relayer returned no transaction id".into(),
            ));
        }
        info!("relayer accepted {metadata}: tx_id={tx_id}");

        self.poll(&tx_id, submitted.transaction_hash, shutdown).await
    }

    async fn fetch_nonce(&self) -> EngineResult<String> {
        let path = format!(
            "/nonce?address={:?}&type=SAFE",
            self.signer.address()
        );
        let resp = self
            .builder_headers(self.http.get(format!("{}{}", self.url, path)))
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(EngineError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        #[derive(Deserialize)]
        struct NonceResponse {
            nonce: serde_json::Value,
        }

        let parsed: NonceResponse = serde_json::from_str(&text).map_err(|_| {
            EngineError::Decode {
                context: "relayer nonce".into(),
                preview: crate::error::body_preview(&text),
            }
        })?;

        match parsed.nonce {
            serde_json::Value::Number(n) => Ok(n.to_string()),
            serde_json::Value::String(s) => Ok(s),
            other => Err(EngineError::Decode {
                context: "relayer nonce".into(),
                preview: other.to_string(),
            }),
        }
    }

    async fn poll(
        &self,
        tx_id: &str,
        mut tx_hash: Option<String>,
        shutdown: &ShutdownSignal,
    ) -> EngineResult<RelayedTx> {
        for attempt in 0..POLL_ATTEMPTS {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.cancelled() => {
                    return Ok(RelayedTx {
                        tx_id: tx_id.to_string(),
                        tx_hash,
                        state: "STATE_UNKNOWN".into(),
                    });
                }
            }

            let path = format!("/transaction?id={tx_id}");
            let resp = self
                .builder_headers(self.http.get(format!("{}{}", self.url, path)))
                .send()
                .await;

            let Ok(resp) = resp else { continue };
            let Ok(txns) = resp.json::<Vec<serde_json::Value>>().await else {
                continue;
            };
            let Some(txn) = txns.first() else { continue };

            let state = txn
                .get("state")
                .and_then(|s| s.as_str())
                .unwrap_or("")
                .to_string();
            if let Some(hash) = txn.get("transactionHash").and_then(|h| h.as_str()) {
                tx_hash = Some(hash.to_string());
            }

            let result = RelayedTx {
                tx_id: tx_id.to_string(),
                tx_hash: tx_hash.clone(),
                state: state.clone(),
            };

            if result.is_final_success() {
                info!("relayed tx confirmed: {:?}", result.tx_hash);
                return Ok(result);
            }
            if result.is_final_failure() {
                warn!("relayed tx failed: state={state} hash={:?}", result.tx_hash);
                return Err(EngineError::ChainTerminal(format!(
                    "relayed tx {tx_id} {state}, hash {:?}",
                    result.tx_hash
                )));
            }
            if attempt % 6 == 5 {
                debug!("relayer polling {tx_id}: state={state} ({attempt})");
            }
        }

        // Timed out: surface the hash for out-of-band inspection.
        Ok(RelayedTx {
            tx_id: tx_id.to_string(),
            tx_hash,
            state: "STATE_PENDING".into(),
        })
    }
}

/// EIP-712 digest of the Safe transaction the relayer executes. This is the
/// request digest the EOA then signs with EIP-191 personal-sign.
pub fn safe_tx_digest(
    chain_id: u64,
    safe_address: Address,
    tx: &SafeTransaction,
    nonce: &str,
) -> B256 {
    let domain_typehash = keccak256(b"EIP712Domain(uint256 chainId,address verifyingContract)");
    let mut domain_data = Vec::with_capacity(96);
    domain_data.extend_from_slice(domain_typehash.as_slice());
    domain_data.extend_from_slice(&U256::from(chain_id).to_be_bytes::<32>());
    let mut addr_padded = [0u8; 32];
    addr_padded[12..].copy_from_slice(safe_address.as_slice());
    domain_data.extend_from_slice(&addr_padded);
    let domain_separator = keccak256(&domain_data);

    let safe_tx_typehash = keccak256(
        b"SafeTx(address to,uint256 value,bytes data,uint8 operation,uint256 safeTxGas,uint256 baseGas,uint256 gasPrice,address gasToken,address refundReceiver,uint256 nonce)",
    );

    let nonce_u256 = U256::from_str_radix(nonce, 10).unwrap_or(U256::ZERO);
    let data_hash = keccak256(&tx.data);

    let mut struct_data = Vec::with_capacity(352);
    struct_data.extend_from_slice(safe_tx_typehash.as_slice());

    let mut to_padded = [0u8; 32];
    to_padded[12..].copy_from_slice(tx.to.as_slice());
    struct_data.extend_from_slice(&to_padded);

    struct_data.extend_from_slice(&tx.value.to_be_bytes::<32>());
    // bytes fields are encoded as their hash
    struct_data.extend_from_slice(data_hash.as_slice());
    struct_data.extend_from_slice(&U256::from(tx.operation).to_be_bytes::<32>());
    // safeTxGas, baseGas, gasPrice all zero for relayed transactions
    struct_data.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());
    struct_data.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());
    struct_data.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());
    // gasToken, refundReceiver = address(0)
    struct_data.extend_from_slice(&[0u8; 32]);
    struct_data.extend_from_slice(&[0u8; 32]);
    struct_data.extend_from_slice(&nonce_u256.to_be_bytes::<32>());

    let struct_hash = keccak256(&struct_data);

    let mut final_data = Vec::with_capacity(66);
    final_data.push(0x19);
    final_data.push(0x01);
    final_data.extend_from_slice(domain_separator.as_slice());
    final_data.extend_from_slice(struct_hash.as_slice());
    keccak256(&final_data)
}

/// Safe marks eth_sign-style signatures with v in {31, 32}.
fn bump_safe_v(signature_hex: &str) -> EngineResult<String> {
    let raw = signature_hex.trim_start_matches("0x");
    let mut bytes = hex::decode(raw)
        .map_err(|e| EngineError::Auth(format!("bad signature hex: {e}")))?;
    if bytes.len() != 65 {
        return Err(EngineError::Auth(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[64] < 31 {
        bytes[64] += 4;
    }
    Ok(format!("0x{}", hex::encode(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> SafeTransaction {
        SafeTransaction {
            to: "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045".parse().unwrap(),
            operation: 0,
            data: vec![0xde, 0xad, 0xbe, 0xef],
            value: U256::ZERO,
        }
    }

    #[test]
    fn digest_changes_with_nonce_and_data() {
        let safe: Address = "0x0000000000000000000000000000000000000123"
            .parse()
            .unwrap();
        let tx = sample_tx();
        let a = safe_tx_digest(137, safe, &tx, "1");
        let b = safe_tx_digest(137, safe, &tx, "2");
        assert_ne!(a, b);

        let mut other = sample_tx();
        other.data = vec![0x00];
        let c = safe_tx_digest(137, safe, &other, "1");
        assert_ne!(a, c);
    }

    #[test]
    fn safe_v_bump() {
        let sig = format!("0x{}{}", "11".repeat(64), "1b"); // v = 27
        let bumped = bump_safe_v(&sig).unwrap();
        assert!(bumped.ends_with("1f")); // 31

        let sig = format!("0x{}{}", "11".repeat(64), "1c"); // v = 28
        let bumped = bump_safe_v(&sig).unwrap();
        assert!(bumped.ends_with("20")); // 32

        assert!(bump_safe_v("0x1234").is_err());
    }
}
