use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_signer::Signer as _;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{sol, Eip712Domain, SolStruct};
use chrono::Utc;

use super::headers::{l2_signature, ApiCreds, L1Headers, L2Headers};
use super::wallet::{derive_proxy_wallet, derive_safe_wallet};
use crate::error::{EngineError, EngineResult};
use crate::models::order::{OrderSide, SignedOrder};

pub const SIG_TYPE_EOA: u8 = 0;
pub const SIG_TYPE_POLY_PROXY: u8 = 1;
pub const SIG_TYPE_POLY_GNOSIS_SAFE: u8 = 2;

// EIP-712 domain for order signing
const ORDER_DOMAIN_NAME: &str = "Polymarket CTF Exchange";
const ORDER_DOMAIN_VERSION: &str = "1";

// EIP-712 domain for L1 auth
const CLOB_AUTH_DOMAIN_NAME: &str = "ClobAuthDomain";
const CLOB_AUTH_DOMAIN_VERSION: &str = "1";
const CLOB_AUTH_MESSAGE: &str = "This message attests that I control the given wallet";

// Struct name and field order must match the exchange contract's type hash.
sol! {
    #[derive(Debug)]
    struct Order {
        uint256 salt;
        address maker;
        address signer;
        address taker;
        uint256 tokenId;
        uint256 makerAmount;
        uint256 takerAmount;
        uint256 expiration;
        uint256 nonce;
        uint256 feeRateBps;
        uint8 side;
        uint8 signatureType;
    }
}

/// Fully-computed order fields ready for signing. Amount integers are 1e6
/// base units produced by the engine's rounding pass; `salt` is supplied by
/// the caller so signing stays deterministic in its inputs.
#[derive(Debug, Clone)]
pub struct OrderArgs {
    pub salt: u64,
    pub token_id: String,
    pub maker_amount: u64,
    pub taker_amount: u64,
    pub side: OrderSide,
    pub expiration: u64,
    pub nonce: u64,
    pub fee_rate_bps: u32,
    pub taker: Option<String>,
}

/// Holds the long-lived private key; the only component that signs.
/// Exposes order signing (EIP-712), L1/L2 auth headers, and EIP-191
/// personal-sign for the relayer. No I/O.
pub struct Signer {
    signer: PrivateKeySigner,
    address: Address,
    funder: Address,
    signature_type: u8,
    chain_id: u64,
}

impl Signer {
    pub fn new(
        private_key: &str,
        chain_id: u64,
        funder_address: Option<&str>,
        signature_type: u8,
    ) -> EngineResult<Self> {
        let key_hex = private_key.strip_prefix("0x").unwrap_or(private_key);
        let signer = key_hex
            .parse::<PrivateKeySigner>()
            .map_err(|e| EngineError::Auth(format!("invalid private key: {e}")))?;
        Ok(Self::from_signer(signer, chain_id, funder_address, signature_type))
    }

    /// Random key, for dry runs only.
    pub fn random(chain_id: u64) -> Self {
        Self::from_signer(PrivateKeySigner::random(), chain_id, None, SIG_TYPE_EOA)
    }

    fn from_signer(
        signer: PrivateKeySigner,
        chain_id: u64,
        funder_address: Option<&str>,
        signature_type: u8,
    ) -> Self {
        let address = signer.address();

        // With a proxy/Safe wallet the contract is the maker; the EOA only
        // signs. An explicit funder wins; otherwise derive via CREATE2.
        let funder = match signature_type {
            SIG_TYPE_POLY_PROXY => funder_address
                .and_then(|f| f.parse::<Address>().ok())
                .unwrap_or_else(|| derive_proxy_wallet(address)),
            SIG_TYPE_POLY_GNOSIS_SAFE => funder_address
                .and_then(|f| f.parse::<Address>().ok())
                .unwrap_or_else(|| derive_safe_wallet(address)),
            _ => funder_address
                .and_then(|f| f.parse::<Address>().ok())
                .unwrap_or(address),
        };

        Self {
            signer,
            address,
            funder,
            signature_type,
            chain_id,
        }
    }

    /// The EOA address: keccak256(uncompressed pubkey)[12..].
    pub fn address(&self) -> Address {
        self.address
    }

    /// The order maker: the funder contract when configured, else the EOA.
    pub fn funder(&self) -> Address {
        self.funder
    }

    pub fn signature_type(&self) -> u8 {
        self.signature_type
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Sign an order against the given exchange contract. Deterministic in
    /// (key, chain id, exchange, args).
    pub async fn sign_order(
        &self,
        exchange_address: Address,
        args: &OrderArgs,
    ) -> EngineResult<SignedOrder> {
        let token_id = parse_token_id(&args.token_id)?;
        let taker = match &args.taker {
            Some(t) => t
                .parse::<Address>()
                .map_err(|e| EngineError::Validation(format!("bad taker address: {e}")))?,
            None => Address::ZERO,
        };

        let order = Order {
            salt: U256::from(args.salt),
            maker: self.funder,
            signer: self.address,
            taker,
            tokenId: token_id,
            makerAmount: U256::from(args.maker_amount),
            takerAmount: U256::from(args.taker_amount),
            expiration: U256::from(args.expiration),
            nonce: U256::from(args.nonce),
            feeRateBps: U256::from(args.fee_rate_bps),
            side: side_code(args.side),
            signatureType: self.signature_type,
        };

        let domain = Eip712Domain {
            name: Some(ORDER_DOMAIN_NAME.into()),
            version: Some(ORDER_DOMAIN_VERSION.into()),
            chain_id: Some(U256::from(self.chain_id)),
            verifying_contract: Some(exchange_address),
            salt: None,
        };

        let digest = order.eip712_signing_hash(&domain);
        let sig_hex = self.sign_digest(digest).await?;

        Ok(SignedOrder {
            salt: args.salt,
            maker: format!("{:?}", self.funder),
            signer: format!("{:?}", self.address),
            taker: format!("{:?}", taker),
            token_id: args.token_id.clone(),
            maker_amount: args.maker_amount.to_string(),
            taker_amount: args.taker_amount.to_string(),
            expiration: args.expiration.to_string(),
            nonce: args.nonce.to_string(),
            fee_rate_bps: args.fee_rate_bps.to_string(),
            side: args.side.as_str().to_string(),
            signature_type: self.signature_type,
            signature: sig_hex,
        })
    }

    /// L1 auth headers: EIP-712 over ClobAuth with the attestation message.
    /// The signed timestamp is also returned as the header value.
    pub async fn l1_headers(&self, nonce: u64) -> EngineResult<L1Headers> {
        let timestamp = Utc::now().timestamp().to_string();

        // ClobAuth(address address,string timestamp,uint256 nonce,string message)
        let type_hash = keccak256(
            "ClobAuth(address address,string timestamp,uint256 nonce,string message)",
        );

        let mut struct_data = Vec::with_capacity(5 * 32);
        struct_data.extend_from_slice(type_hash.as_slice());

        let mut addr_padded = [0u8; 32];
        addr_padded[12..].copy_from_slice(self.address.as_slice());
        struct_data.extend_from_slice(&addr_padded);

        // string fields are encoded as keccak256 of their bytes
        struct_data.extend_from_slice(keccak256(timestamp.as_bytes()).as_slice());
        struct_data.extend_from_slice(&U256::from(nonce).to_be_bytes::<32>());
        struct_data.extend_from_slice(keccak256(CLOB_AUTH_MESSAGE.as_bytes()).as_slice());

        let struct_hash = keccak256(&struct_data);
        let domain_sep = self.clob_auth_domain_separator();

        let mut digest_input = Vec::with_capacity(66);
        digest_input.push(0x19);
        digest_input.push(0x01);
        digest_input.extend_from_slice(domain_sep.as_slice());
        digest_input.extend_from_slice(struct_hash.as_slice());
        let digest = keccak256(&digest_input);

        let signature = self.sign_digest(digest).await?;

        Ok(L1Headers {
            address: format!("{:?}", self.address),
            signature,
            timestamp,
            nonce: nonce.to_string(),
        })
    }

    /// L2 auth headers: HMAC over timestamp + METHOD + path + body.
    pub fn l2_headers(
        &self,
        creds: &ApiCreds,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> EngineResult<L2Headers> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = l2_signature(&creds.secret, &timestamp, method, request_path, body)?;
        Ok(L2Headers {
            address: format!("{:?}", self.address),
            signature,
            timestamp,
            key: creds.key.clone(),
            passphrase: creds.passphrase.clone(),
        })
    }

    /// EIP-191 personal-sign over an arbitrary payload (relayer request
    /// digests). Returns a 65-byte 0x-hex signature with v in {27, 28}.
    pub async fn sign_personal(&self, payload: &[u8]) -> EngineResult<String> {
        let sig = self
            .signer
            .sign_message(payload)
            .await
            .map_err(|e| EngineError::Auth(format!("signing failed: {e}")))?;
        let mut bytes = sig.as_bytes();
        if bytes[64] < 27 {
            bytes[64] += 27;
        }
        Ok(format!("0x{}", hex::encode(bytes)))
    }

    /// Sign a transaction hash, returning (r, s, y_parity) for EIP-155 v
    /// computation by the transaction encoder.
    pub async fn sign_tx_hash(&self, digest: B256) -> EngineResult<(U256, U256, u64)> {
        let sig = self
            .signer
            .sign_hash(&digest)
            .await
            .map_err(|e| EngineError::Auth(format!("signing failed: {e}")))?;
        let bytes = sig.as_bytes();
        let parity = if bytes[64] >= 27 {
            (bytes[64] - 27) as u64
        } else {
            bytes[64] as u64
        };
        Ok((
            U256::from_be_slice(&bytes[0..32]),
            U256::from_be_slice(&bytes[32..64]),
            parity,
        ))
    }

    async fn sign_digest(&self, digest: B256) -> EngineResult<String> {
        let sig = self
            .signer
            .sign_hash(&digest)
            .await
            .map_err(|e| EngineError::Auth(format!("signing failed: {e}")))?;
        let mut bytes = sig.as_bytes();
        // alloy returns recovery parity 0/1; the exchange expects v >= 27
        if bytes[64] < 27 {
            bytes[64] += 27;
        }
        Ok(format!("0x{}", hex::encode(bytes)))
    }

    // Domain separator without verifyingContract, per the auth domain.
    fn clob_auth_domain_separator(&self) -> B256 {
        let domain_type =
            keccak256("EIP712Domain(string name,string version,uint256 chainId)");

        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(domain_type.as_slice());
        buf.extend_from_slice(keccak256(CLOB_AUTH_DOMAIN_NAME.as_bytes()).as_slice());
        buf.extend_from_slice(keccak256(CLOB_AUTH_DOMAIN_VERSION.as_bytes()).as_slice());
        buf.extend_from_slice(&U256::from(self.chain_id).to_be_bytes::<32>());
        keccak256(&buf)
    }
}

fn side_code(side: OrderSide) -> u8 {
    match side {
        OrderSide::Buy => 0,
        OrderSide::Sell => 1,
    }
}

/// Token IDs arrive as decimal strings; only 0x-prefixed values are hex.
fn parse_token_id(token_id: &str) -> EngineResult<U256> {
    let parsed = if let Some(hex_part) = token_id
        .strip_prefix("0x")
        .or_else(|| token_id.strip_prefix("0X"))
    {
        U256::from_str_radix(hex_part, 16)
    } else {
        U256::from_str_radix(token_id, 10)
    };
    parsed.map_err(|e| EngineError::Validation(format!("bad token id {token_id}: {e}")))
}
