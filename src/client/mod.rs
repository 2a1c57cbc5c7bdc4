pub mod rate_limit;
pub mod rest;

pub use rate_limit::{classes, RateLimiter};
pub use rest::RestClient;
