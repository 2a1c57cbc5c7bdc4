use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::{sol, SolCall};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::direct::DirectExecutor;
use super::relayer::{RelayerClient, SafeTransaction};
use super::rpc::{compute_position_id, parse_condition_id, RpcClient};
use crate::auth::{Signer, SIG_TYPE_EOA};
use crate::config::ChainConfig;
use crate::error::{EngineError, EngineResult};
use crate::runtime::shutdown::ShutdownSignal;

// CTF surface for the binary partition.
sol! {
    function splitPosition(
        address collateralToken,
        bytes32 parentCollectionId,
        bytes32 conditionId,
        uint256[] partition,
        uint256 amount
    );

    function mergePositions(
        address collateralToken,
        bytes32 parentCollectionId,
        bytes32 conditionId,
        uint256[] partition,
        uint256 amount
    );

    function redeemPositions(
        address collateralToken,
        bytes32 parentCollectionId,
        bytes32 conditionId,
        uint256[] indexSets
    );
}

// balanceOf is overloaded between the token standards; keep the ABIs in
// separate modules.
mod erc20_abi {
    alloy_sol_types::sol! {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

mod erc1155_abi {
    alloy_sol_types::sol! {
        function balanceOf(address account, uint256 id) external view returns (uint256);
        function isApprovedForAll(address account, address operator) external view returns (bool);
        function setApprovalForAll(address operator, bool approved);
    }
}

const BASE_UNITS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Gasless Safe meta-transaction through the relayer.
    Relayer,
    /// EIP-155 transaction broadcast from the EOA.
    Direct,
}

#[derive(Debug, Clone)]
pub struct LifecycleOutcome {
    pub tx_id: Option<String>,
    pub tx_hash: Option<String>,
    pub state: String,
}

/// Result of the once-per-cycle split attempt.
#[derive(Debug, Clone)]
pub enum SplitDecision {
    Done(LifecycleOutcome),
    /// Holdings already cover the cycle; nothing sent.
    HoldingsOk,
    /// A split for this cycle was already attempted.
    AlreadyAttempted,
}

/// Drives split / merge / redeem with balance-gated preflight and
/// idempotent per-cycle split tracking.
pub struct ChainCoordinator {
    rpc: Arc<RpcClient>,
    direct: DirectExecutor,
    relayer: Option<RelayerClient>,
    signer: Arc<Signer>,
    ctf: Address,
    collateral: Address,
    holdings_min_ratio: f64,
    shutdown: ShutdownSignal,
    split_attempted: Mutex<HashSet<String>>,
}

impl ChainCoordinator {
    pub fn new(
        config: &ChainConfig,
        chain_id: u64,
        signer: Arc<Signer>,
        shutdown: ShutdownSignal,
    ) -> EngineResult<Self> {
        let rpc = Arc::new(RpcClient::new(&config.rpc_url));
        let direct = DirectExecutor::new(
            rpc.clone(),
            signer.clone(),
            chain_id,
            config.direct_mode_debounce,
        );

        // Relayer mode needs builder credentials and a contract funder.
        let relayer = if config.has_builder_creds()
            && signer.signature_type() != SIG_TYPE_EOA
        {
            Some(RelayerClient::new(
                &config.relayer_url,
                signer.clone(),
                chain_id,
                config.builder_api_key.clone().unwrap_or_default(),
                config.builder_secret.clone().unwrap_or_default(),
                config.builder_passphrase.clone().unwrap_or_default(),
            ))
        } else {
            None
        };

        let ctf = config
            .ctf_address
            .parse::<Address>()
            .map_err(|e| EngineError::Validation(format!("bad ctf address: {e}")))?;
        let collateral = config
            .collateral_address
            .parse::<Address>()
            .map_err(|e| EngineError::Validation(format!("bad collateral address: {e}")))?;

        Ok(Self {
            rpc,
            direct,
            relayer,
            signer,
            ctf,
            collateral,
            holdings_min_ratio: config.holdings_min_ratio,
            shutdown,
            split_attempted: Mutex::new(HashSet::new()),
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        if self.relayer.is_some() {
            ExecutionMode::Relayer
        } else {
            ExecutionMode::Direct
        }
    }

    /// The wallet that holds collateral and outcome tokens.
    fn holder(&self) -> Address {
        self.signer.funder()
    }

    // --- view calls ---

    pub async fn collateral_balance(&self) -> EngineResult<Decimal> {
        let call = erc20_abi::balanceOfCall {
            account: self.holder(),
        };
        let raw = self
            .rpc
            .eth_call_u256(self.collateral, &call.abi_encode())
            .await?;
        Ok(raw_to_decimal(raw))
    }

    pub async fn collateral_allowance(&self) -> EngineResult<Decimal> {
        let call = erc20_abi::allowanceCall {
            owner: self.holder(),
            spender: self.ctf,
        };
        let raw = self
            .rpc
            .eth_call_u256(self.collateral, &call.abi_encode())
            .await?;
        Ok(raw_to_decimal(raw))
    }

    /// (UP, DOWN) outcome-token balances for a condition.
    pub async fn outcome_balances(&self, condition_id: &str) -> EngineResult<(Decimal, Decimal)> {
        let condition = parse_condition_id(condition_id)?;
        let up_id = compute_position_id(condition, 1, self.collateral);
        let down_id = compute_position_id(condition, 2, self.collateral);

        let up = self.erc1155_balance(up_id).await?;
        let down = self.erc1155_balance(down_id).await?;
        Ok((up, down))
    }

    async fn erc1155_balance(&self, position_id: U256) -> EngineResult<Decimal> {
        let call = erc1155_abi::balanceOfCall {
            account: self.holder(),
            id: position_id,
        };
        let raw = self.rpc.eth_call_u256(self.ctf, &call.abi_encode()).await?;
        Ok(raw_to_decimal(raw))
    }

    // --- lifecycle operations ---

    /// Split collateral into a complete UP/DOWN set.
    /// Preflight: balance and CTF allowance must cover the amount.
    pub async fn split(&self, condition_id: &str, amount: Decimal) -> EngineResult<LifecycleOutcome> {
        let condition = parse_condition_id(condition_id)?;
        let raw = decimal_to_raw(amount)?;

        let balance = self.collateral_balance().await?;
        if balance < amount {
            return Err(EngineError::Validation(format!(
                "split preflight: balance {balance} < amount {amount}"
            )));
        }
        let allowance = self.collateral_allowance().await?;
        if allowance < amount {
            return Err(EngineError::Validation(format!(
                "split preflight: ctf allowance {allowance} < amount {amount}"
            )));
        }

        let call = splitPositionCall {
            collateralToken: self.collateral,
            parentCollectionId: B256::ZERO,
            conditionId: condition,
            partition: vec![U256::from(1), U256::from(2)],
            amount: U256::from(raw),
        };

        info!("split {amount} collateral on {}", short(condition_id));
        self.execute(self.ctf, call.abi_encode(), "split").await
    }

    /// Merge a complete UP/DOWN set back into collateral.
    /// Preflight: min(UP, DOWN) must cover the amount.
    pub async fn merge(&self, condition_id: &str, amount: Decimal) -> EngineResult<LifecycleOutcome> {
        let condition = parse_condition_id(condition_id)?;
        let raw = decimal_to_raw(amount)?;

        let (up, down) = self.outcome_balances(condition_id).await?;
        let available = up.min(down);
        if available < amount {
            return Err(EngineError::Validation(format!(
                "merge preflight: min(UP={up}, DOWN={down}) < amount {amount}"
            )));
        }

        let call = mergePositionsCall {
            collateralToken: self.collateral,
            parentCollectionId: B256::ZERO,
            conditionId: condition,
            partition: vec![U256::from(1), U256::from(2)],
            amount: U256::from(raw),
        };

        info!("merge {amount} pairs on {}", short(condition_id));
        self.execute(self.ctf, call.abi_encode(), "merge").await
    }

    /// Merge whatever complete set the wallet holds; no-op when empty.
    pub async fn merge_all(&self, condition_id: &str) -> EngineResult<Option<LifecycleOutcome>> {
        let (up, down) = self.outcome_balances(condition_id).await?;
        let available = up.min(down);
        if available <= Decimal::ZERO {
            return Ok(None);
        }
        self.merge(condition_id, available).await.map(Some)
    }

    /// Redeem winnings after resolution.
    pub async fn redeem(&self, condition_id: &str) -> EngineResult<LifecycleOutcome> {
        let condition = parse_condition_id(condition_id)?;
        let call = redeemPositionsCall {
            collateralToken: self.collateral,
            parentCollectionId: B256::ZERO,
            conditionId: condition,
            indexSets: vec![U256::from(1), U256::from(2)],
        };

        info!("redeem on {}", short(condition_id));
        self.execute(self.ctf, call.abi_encode(), "redeem").await
    }

    /// Once-per-cycle split with a holdings gate: when the wallet already
    /// holds enough of both outcome tokens, the split is skipped and the
    /// cycle is marked holdings-ok.
    pub async fn split_for_cycle(
        &self,
        cycle_slug: &str,
        condition_id: &str,
        amount: Decimal,
    ) -> EngineResult<SplitDecision> {
        {
            let mut attempted = self.split_attempted.lock().await;
            if attempted.contains(cycle_slug) {
                return Ok(SplitDecision::AlreadyAttempted);
            }
            // Reserve the attempt before the (slow) chain calls so a
            // concurrent caller cannot double-split the cycle.
            attempted.insert(cycle_slug.to_string());
            if attempted.len() > 64 {
                let keep = cycle_slug.to_string();
                attempted.retain(|slug| *slug == keep);
            }
        }

        let (up, down) = self.outcome_balances(condition_id).await?;
        let floor = amount
            * Decimal::from_f64_retain(self.holdings_min_ratio).unwrap_or(Decimal::ONE);
        if up.min(down) >= floor {
            info!(
                "split skipped for {cycle_slug}: holdings UP={up} DOWN={down} cover {floor}"
            );
            return Ok(SplitDecision::HoldingsOk);
        }

        match self.split(condition_id, amount).await {
            Ok(outcome) => Ok(SplitDecision::Done(outcome)),
            Err(e) => {
                warn!("split for {cycle_slug} failed: {e}");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        to: Address,
        calldata: Vec<u8>,
        metadata: &str,
    ) -> EngineResult<LifecycleOutcome> {
        match &self.relayer {
            Some(relayer) => {
                let tx = SafeTransaction {
                    to,
                    operation: 0,
                    data: calldata,
                    value: U256::ZERO,
                };
                let relayed = relayer
                    .execute(self.holder(), tx, metadata, &self.shutdown)
                    .await?;
                Ok(LifecycleOutcome {
                    tx_id: Some(relayed.tx_id),
                    tx_hash: relayed.tx_hash,
                    state: relayed.state,
                })
            }
            None => {
                let hash = self.direct.send_contract_call(to, &calldata).await?;
                let receipt = self.rpc.wait_for_receipt(&hash, &self.shutdown).await?;
                if !receipt.succeeded() {
                    return Err(EngineError::ChainTerminal(format!(
                        "{metadata} reverted, tx {hash}"
                    )));
                }
                Ok(LifecycleOutcome {
                    tx_id: None,
                    tx_hash: Some(hash),
                    state: "MINED".into(),
                })
            }
        }
    }
}

fn raw_to_decimal(raw: U256) -> Decimal {
    Decimal::from_str(&raw.to_string()).unwrap_or(Decimal::ZERO) / Decimal::from(BASE_UNITS)
}

fn decimal_to_raw(amount: Decimal) -> EngineResult<u64> {
    use rust_decimal::prelude::ToPrimitive;
    let raw = (amount * Decimal::from(BASE_UNITS)).to_u64().unwrap_or(0);
    if raw == 0 {
        return Err(EngineError::Validation(format!(
            "amount {amount} rounds to zero base units"
        )));
    }
    Ok(raw)
}

fn short(condition_id: &str) -> &str {
    &condition_id[..12.min(condition_id.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn offline_coordinator() -> ChainCoordinator {
        let config = ChainConfig {
            // Unroutable endpoint: every chain call fails fast, which is
            // what these tests rely on.
            rpc_url: "http://127.0.0.1:1".into(),
            relayer_url: "http://127.0.0.1:1".into(),
            ctf_address: "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045".into(),
            collateral_address: "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174".into(),
            builder_api_key: None,
            builder_secret: None,
            builder_passphrase: None,
            direct_mode_debounce: 0,
            holdings_min_ratio: 0.95,
            split_amount: 1.0,
        };
        let (trigger, shutdown) = crate::runtime::shutdown::ShutdownSignal::new();
        std::mem::forget(trigger);
        ChainCoordinator::new(&config, 137, Arc::new(Signer::random(137)), shutdown).unwrap()
    }

    const CONDITION: &str =
        "0xabababababababababababababababababababababababababababababababab";

    #[tokio::test]
    async fn split_is_attempted_at_most_once_per_cycle() {
        let coordinator = offline_coordinator();

        // First attempt reserves the cycle, then fails on the dead RPC.
        let first = coordinator
            .split_for_cycle("btc-updown-15m-1700000000", CONDITION, dec!(1))
            .await;
        assert!(first.is_err());

        // Second attempt never reaches the chain.
        let second = coordinator
            .split_for_cycle("btc-updown-15m-1700000000", CONDITION, dec!(1))
            .await
            .unwrap();
        assert!(matches!(second, SplitDecision::AlreadyAttempted));

        // A different cycle gets its own attempt.
        let other = coordinator
            .split_for_cycle("btc-updown-15m-1700000900", CONDITION, dec!(1))
            .await;
        assert!(other.is_err());
    }

    #[tokio::test]
    async fn eoa_without_builder_creds_runs_direct() {
        let coordinator = offline_coordinator();
        assert_eq!(coordinator.mode(), ExecutionMode::Direct);
    }

    #[test]
    fn raw_conversions() {
        assert_eq!(decimal_to_raw(dec!(1.5)).unwrap(), 1_500_000);
        assert_eq!(decimal_to_raw(dec!(0.000001)).unwrap(), 1);
        assert!(decimal_to_raw(dec!(0)).is_err());
        assert_eq!(raw_to_decimal(U256::from(2_500_000u64)), dec!(2.5));
    }

    #[test]
    fn split_calldata_shape() {
        let condition = parse_condition_id(
            "0xabababababababababababababababababababababababababababababababab",
        )
        .unwrap();
        let collateral: Address = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174"
            .parse()
            .unwrap();
        let call = splitPositionCall {
            collateralToken: collateral,
            parentCollectionId: B256::ZERO,
            conditionId: condition,
            partition: vec![U256::from(1), U256::from(2)],
            amount: U256::from(1_000_000u64),
        };
        let encoded = call.abi_encode();
        // 4-byte selector + well-formed ABI payload
        assert!(encoded.len() > 4 + 5 * 32);
        assert_eq!(&encoded[..4], splitPositionCall::SELECTOR.as_slice());
    }
}
