pub mod breaker;
pub mod context;
pub mod key;
pub mod pool;
pub mod pricing;
pub mod strategy;

pub use breaker::{BreakerConfig, BreakerSet, CircuitBreaker, CircuitState};
pub use context::RequestContext;
pub use key::{ApiKey, KeyId, epoch_now};
pub use pool::{KeyPool, RequestOutcome, RotateError, RotationOutcome};
pub use pricing::{PricingTable, UnitPrice};
pub use strategy::{SelectionStrategy, StrategyKind, StrategyRegistry};
