pub mod headers;
pub mod signer;
pub mod wallet;

pub use headers::{ApiCreds, L1Headers, L2Headers};
pub use signer::{OrderArgs, Signer, SIG_TYPE_EOA, SIG_TYPE_POLY_GNOSIS_SAFE, SIG_TYPE_POLY_PROXY};
