pub mod auth;
pub mod rate_limit;
pub mod rest;
pub mod ws;

pub use auth::{HashkeyManager, HashkeyProvider, TokenManager, TokenProvider};
pub use rate_limit::RateLimiter;
pub use rest::{KisError, KisRestClient};
pub use ws::KisWsClient;
