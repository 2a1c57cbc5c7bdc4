use alloy_primitives::{keccak256, Address, U256};
use alloy_rlp::{Encodable, Header};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use super::rpc::RpcClient;
use crate::auth::Signer;
use crate::error::EngineResult;

/// Fallback when gas estimation fails; covers the heaviest CTF call.
const GAS_LIMIT_FALLBACK: u64 = 600_000;

/// Builds, signs and broadcasts EIP-155 legacy transactions from the EOA.
/// Consecutive sends are debounced so nonce races cannot occur.
pub struct DirectExecutor {
    rpc: Arc<RpcClient>,
    signer: Arc<Signer>,
    chain_id: u64,
    debounce: Duration,
    last_send: Mutex<Option<Instant>>,
}

impl DirectExecutor {
    pub fn new(
        rpc: Arc<RpcClient>,
        signer: Arc<Signer>,
        chain_id: u64,
        debounce_secs: u64,
    ) -> Self {
        Self {
            rpc,
            signer,
            chain_id,
            debounce: Duration::from_secs(debounce_secs),
            last_send: Mutex::new(None),
        }
    }

    /// Native-token balance of the EOA, for gas sanity checks.
    pub async fn gas_balance(&self) -> EngineResult<f64> {
        let wei = self.rpc.get_balance(self.signer.address()).await?;
        Ok(wei.to::<u128>() as f64 / 1e18)
    }

    /// Sign and broadcast a contract call. Returns the transaction hash;
    /// the caller decides whether to await the receipt.
    pub async fn send_contract_call(&self, to: Address, calldata: &[u8]) -> EngineResult<String> {
        self.debounce().await;

        let from = self.signer.address();
        let nonce = self.rpc.get_nonce(from).await?;
        let gas_price = self.rpc.gas_price().await?;
        let gas_limit = match self.rpc.estimate_gas(from, to, calldata).await {
            // Estimation can under-shoot on proxied calls; pad by 25%.
            Ok(estimated) => estimated + estimated / 4,
            Err(e) => {
                debug!("gas estimation failed ({e}), using fallback");
                GAS_LIMIT_FALLBACK
            }
        };

        let sign_rlp = rlp_encode_unsigned(
            nonce,
            gas_price,
            gas_limit,
            to,
            0,
            calldata,
            self.chain_id,
        );
        let tx_hash = keccak256(&sign_rlp);

        let (r, s, parity) = self.signer.sign_tx_hash(tx_hash).await?;
        let v = self.chain_id * 2 + 35 + parity;

        let signed_rlp =
            rlp_encode_signed(nonce, gas_price, gas_limit, to, 0, calldata, v, r, s);

        let hash = self.rpc.send_raw_transaction(&signed_rlp).await?;
        info!("direct tx sent: {hash} (nonce={nonce} gas={gas_limit})");
        Ok(hash)
    }

    async fn debounce(&self) {
        let mut last = self.last_send.lock().await;
        if let Some(prev) = *last {
            let since = prev.elapsed();
            if since < self.debounce {
                tokio::time::sleep(self.debounce - since).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// RLP of the EIP-155 signing payload:
/// [nonce, gasPrice, gasLimit, to, value, data, chainId, 0, 0]
fn rlp_encode_unsigned(
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
    to: Address,
    value: u128,
    data: &[u8],
    chain_id: u64,
) -> Vec<u8> {
    let mut payload = Vec::new();
    nonce.encode(&mut payload);
    gas_price.encode(&mut payload);
    gas_limit.encode(&mut payload);
    to.encode(&mut payload);
    value.encode(&mut payload);
    data.encode(&mut payload);
    chain_id.encode(&mut payload);
    0u8.encode(&mut payload);
    0u8.encode(&mut payload);

    wrap_list(payload)
}

/// RLP of the signed transaction:
/// [nonce, gasPrice, gasLimit, to, value, data, v, r, s]
#[allow(clippy::too_many_arguments)]
fn rlp_encode_signed(
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
    to: Address,
    value: u128,
    data: &[u8],
    v: u64,
    r: U256,
    s: U256,
) -> Vec<u8> {
    let mut payload = Vec::new();
    nonce.encode(&mut payload);
    gas_price.encode(&mut payload);
    gas_limit.encode(&mut payload);
    to.encode(&mut payload);
    value.encode(&mut payload);
    data.encode(&mut payload);
    v.encode(&mut payload);
    r.encode(&mut payload);
    s.encode(&mut payload);

    wrap_list(payload)
}

fn wrap_list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}
