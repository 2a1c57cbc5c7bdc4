use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub wallet: WalletConfig,
    pub exchange: ExchangeConfig,
    pub market: MarketSpecConfig,
    pub proxy: ProxyConfig,
    pub engine: EngineConfig,
    pub chain: ChainConfig,
    pub persistence: PersistenceConfig,
    pub strategies: Vec<StrategyMount>,
    pub log_level: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    pub private_key: String,
    /// Proxy/Safe wallet holding funds. When set, it becomes the order maker
    /// and the EOA stays the signer.
    pub funder_address: Option<String>,
    /// 0 = EOA, 1 = Poly proxy, 2 = Gnosis Safe
    pub signature_type: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub clob_host: String,
    pub market_ws_url: String,
    pub user_ws_url: String,
    pub chain_id: u64,
    pub exchange_address: String,
    pub neg_risk_exchange_address: String,
}

/// Describes the recurring market family the scheduler trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSpecConfig {
    /// Underlying symbol, e.g. "btc"
    pub symbol: String,
    /// Cycle length in seconds, e.g. 900 for 15-minute markets
    pub timeframe_secs: u64,
    /// Market family, e.g. "updown"
    pub kind: String,
    /// Slug template with {symbol}, {kind}, {tf} and {start} placeholders
    pub slug_template: String,
    /// Human timeframe token used in slugs, e.g. "15m"
    pub timeframe_label: String,
    /// Price precision in decimal places for display
    pub precision: u32,
    /// Seconds before cycle start at which pre-warm fires
    pub pre_warm_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub enabled: bool,
}

impl ProxyConfig {
    /// In-file proxy wins over HTTP(S)_PROXY env vars when enabled.
    pub fn resolve_url(&self) -> Option<String> {
        if self.enabled && !self.host.is_empty() {
            return Some(format!("http://{}:{}", self.host, self.port));
        }
        std::env::var("HTTPS_PROXY")
            .or_else(|_| std::env::var("HTTP_PROXY"))
            .ok()
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Reconcile interval while orders are open (seconds)
    pub order_status_sync_interval_with_orders: u64,
    /// Reconcile interval while the map is empty (seconds)
    pub order_status_sync_interval_without_orders: u64,
    /// Minimum collateral per order, in dollars
    pub min_order_size: f64,
    /// Minimum token count per GTC order
    pub min_share_size: f64,
    /// Cancel everything bound to the new market at activation
    pub cancel_open_orders_on_cycle_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub relayer_url: String,
    pub ctf_address: String,
    pub collateral_address: String,
    pub builder_api_key: Option<String>,
    pub builder_secret: Option<String>,
    pub builder_passphrase: Option<String>,
    /// Debounce between direct-mode transactions (seconds)
    pub direct_mode_debounce: u64,
    /// Skip the split when min(UP, DOWN) >= expected * this ratio
    pub holdings_min_ratio: f64,
    /// Collateral to split at each cycle start, in dollars; 0 disables
    pub split_amount: f64,
}

impl ChainConfig {
    pub fn has_builder_creds(&self) -> bool {
        self.builder_api_key.is_some()
            && self.builder_secret.is_some()
            && self.builder_passphrase.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub dir: String,
    pub flush_interval_secs: u64,
}

/// One strategy mount: which strategy, which sessions it attaches to, and an
/// opaque config blob the strategy validates itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyMount {
    pub strategy_id: String,
    #[serde(default)]
    pub on: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wallet: WalletConfig {
                private_key: String::new(),
                funder_address: None,
                signature_type: 0,
            },
            exchange: ExchangeConfig {
                clob_host: "https://clob.polymarket.com".into(),
                market_ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".into(),
                user_ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/user".into(),
                chain_id: 137,
                exchange_address: "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E".into(),
                neg_risk_exchange_address: "0xC5d563A36AE78145C45a50134d48A1215220f80a".into(),
            },
            market: MarketSpecConfig {
                symbol: "btc".into(),
                timeframe_secs: 900,
                kind: "updown".into(),
                slug_template: "{symbol}-{kind}-{tf}-{start}".into(),
                timeframe_label: "15m".into(),
                precision: 2,
                pre_warm_secs: 60,
            },
            proxy: ProxyConfig {
                host: String::new(),
                port: 0,
                enabled: false,
            },
            engine: EngineConfig {
                order_status_sync_interval_with_orders: 5,
                order_status_sync_interval_without_orders: 30,
                min_order_size: 1.0,
                min_share_size: 5.0,
                cancel_open_orders_on_cycle_start: false,
            },
            chain: ChainConfig {
                rpc_url: "https://polygon-rpc.com".into(),
                relayer_url: "https://relayer-v2.polymarket.com".into(),
                ctf_address: "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045".into(),
                collateral_address: "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174".into(),
                builder_api_key: None,
                builder_secret: None,
                builder_passphrase: None,
                direct_mode_debounce: 5,
                holdings_min_ratio: 0.95,
                split_amount: 0.0,
            },
            persistence: PersistenceConfig {
                dir: "state".into(),
                flush_interval_secs: 30,
            },
            strategies: Vec::new(),
            log_level: "info".into(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (.env file) on top of
    /// defaults.
    ///
    /// Recognized env vars:
    ///   WALLET_PRIVATE_KEY, WALLET_FUNDER_ADDRESS, WALLET_SIGNATURE_TYPE
    ///   BUILDER_API_KEY, BUILDER_SECRET, BUILDER_PASS_PHRASE
    ///   CHAIN_RPC_URL, HTTP_PROXY, HTTPS_PROXY
    ///   MARKET_SYMBOL, MARKET_TIMEFRAME_SECS
    ///   RUST_LOG, DRY_RUN, PERSIST_DIR
    pub fn load_or_default() -> Self {
        let _ = dotenv::dotenv();

        let mut config = Self::default();

        if let Ok(key) = std::env::var("WALLET_PRIVATE_KEY") {
            if !key.is_empty() {
                config.wallet.private_key = key;
            }
        }
        if let Ok(addr) = std::env::var("WALLET_FUNDER_ADDRESS") {
            if !addr.is_empty() {
                config.wallet.funder_address = Some(addr);
            }
        }
        if let Ok(st) = std::env::var("WALLET_SIGNATURE_TYPE") {
            config.wallet.signature_type = st.parse().unwrap_or(0);
        }

        if let Ok(v) = std::env::var("BUILDER_API_KEY") {
            if !v.is_empty() {
                config.chain.builder_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("BUILDER_SECRET") {
            if !v.is_empty() {
                config.chain.builder_secret = Some(v);
            }
        }
        if let Ok(v) = std::env::var("BUILDER_PASS_PHRASE") {
            if !v.is_empty() {
                config.chain.builder_passphrase = Some(v);
            }
        }
        if let Ok(v) = std::env::var("CHAIN_RPC_URL") {
            if !v.is_empty() {
                config.chain.rpc_url = v;
            }
        }

        if let Ok(v) = std::env::var("MARKET_SYMBOL") {
            if !v.is_empty() {
                config.market.symbol = v;
            }
        }
        if let Ok(v) = std::env::var("MARKET_TIMEFRAME_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.market.timeframe_secs = secs;
                config.market.timeframe_label = match secs {
                    300 => "5m".into(),
                    900 => "15m".into(),
                    3600 => "1h".into(),
                    _ => format!("{secs}s"),
                };
            }
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            config.log_level = level;
        }
        if let Ok(dir) = std::env::var("PERSIST_DIR") {
            if !dir.is_empty() {
                config.persistence.dir = dir;
            }
        }

        config.dry_run = std::env::var("DRY_RUN")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        config
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.dry_run {
            anyhow::ensure!(
                !self.wallet.private_key.is_empty(),
                "WALLET_PRIVATE_KEY must be set (or set DRY_RUN=true)"
            );
        }
        anyhow::ensure!(
            self.market.timeframe_secs >= 60,
            "timeframe must be at least 60s"
        );
        anyhow::ensure!(
            self.market.pre_warm_secs < self.market.timeframe_secs,
            "pre-warm window must be shorter than the cycle"
        );
        anyhow::ensure!(
            self.engine.min_order_size > 0.0,
            "min_order_size must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.chain.holdings_min_ratio),
            "holdings_min_ratio must be in [0, 1]"
        );
        if self.wallet.signature_type > 2 {
            anyhow::bail!("signature_type must be 0 (EOA), 1 (proxy) or 2 (Safe)");
        }
        Ok(())
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run || self.wallet.private_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_validates_in_dry_run() {
        let mut config = Config::default();
        config.dry_run = true;
        config.validate().unwrap();
    }

    #[test]
    fn missing_key_rejected_when_live() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn proxy_file_wins_when_enabled() {
        let proxy = ProxyConfig {
            host: "127.0.0.1".into(),
            port: 8888,
            enabled: true,
        };
        assert_eq!(proxy.resolve_url().as_deref(), Some("http://127.0.0.1:8888"));
    }

    #[test]
    fn bad_signature_type_rejected() {
        let mut config = Config::default();
        config.dry_run = true;
        config.wallet.signature_type = 7;
        assert!(config.validate().is_err());
    }
}
