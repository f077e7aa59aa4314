// Outbound API plumbing: throttling, credentials, order placement
pub mod auth;
pub mod orders;
pub mod rate_limiter;

pub use auth::{AuthProvider, StaticTokenAuth};
pub use orders::{HttpOrderGateway, OrderGateway, PaperOrderGateway};
pub use rate_limiter::{RateLimitStatus, RateLimiter, RateLimiterConfig, RateWindow};
