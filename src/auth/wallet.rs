use alloy_primitives::{keccak256, Address, B256};

/// Polymarket proxy wallet factory on Polygon.
const PROXY_WALLET_FACTORY: &str = "0xaB45c5A4B0c941a2F231C04C3f49182e1A254052";
/// Init code hash for the EIP-1167 minimal proxy wallets.
const PROXY_INIT_CODE_HASH: &str =
    "0xd21df8dc65880a8606f09fe0ce3df9b8869287ab0b058be05aa9e8af6330a00b";

/// Gnosis Safe proxy factory on Polygon.
const SAFE_FACTORY: &str = "0xaacFeEa03eb1561C4e67d661e40682Bd20E3541b";
const SAFE_INIT_CODE_HASH: &str =
    "0x2bce2127ff07fb632d16c8347c4ebf501f4841168bed00d9e6ef715ddb6fcecf";

/// CREATE2 address = keccak256(0xff ++ factory ++ salt ++ init_code_hash)[12..]
fn create2(factory: Address, salt: B256, init_code_hash: B256) -> Address {
    let mut input = Vec::with_capacity(85);
    input.push(0xff);
    input.extend_from_slice(factory.as_slice());
    input.extend_from_slice(salt.as_slice());
    input.extend_from_slice(init_code_hash.as_slice());
    Address::from_slice(&keccak256(&input)[12..])
}

/// Derive the Polymarket proxy wallet for an EOA.
/// Salt is the keccak of the packed 20-byte address.
pub fn derive_proxy_wallet(eoa: Address) -> Address {
    let salt = keccak256(eoa.as_slice());
    let factory: Address = PROXY_WALLET_FACTORY.parse().expect("const address");
    let init_hash: B256 = PROXY_INIT_CODE_HASH.parse().expect("const hash");
    create2(factory, salt, init_hash)
}

/// Derive the Gnosis Safe wallet for an EOA.
/// Salt is the keccak of the address left-padded to 32 bytes.
pub fn derive_safe_wallet(eoa: Address) -> Address {
    let mut padded = [0u8; 32];
    padded[12..].copy_from_slice(eoa.as_slice());
    let salt = keccak256(padded);
    let factory: Address = SAFE_FACTORY.parse().expect("const address");
    let init_hash: B256 = SAFE_INIT_CODE_HASH.parse().expect("const hash");
    create2(factory, salt, init_hash)
}
