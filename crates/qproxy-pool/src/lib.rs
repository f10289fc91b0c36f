mod identity;
mod jwt;
mod pool;

pub use identity::{Health, Identity};
pub use pool::{
    ExchangeError, FailureSignal, IdentityPool, IdentityStatus, PoolConfig, PoolStatus,
    RefreshOutcome, TokenExchanger,
};
