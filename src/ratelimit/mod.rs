//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod key;
mod limiter;
mod policy;
mod quota;
mod rules;

pub use bucket::{Bucket, Decision, Limits};
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{RateLimitKey, ACCOUNT_HEADER};
pub use limiter::{LimiterStats, RateLimiter};
pub use policy::{LimitPolicy, StaticLimits};
pub use quota::{QuotaCache, QuotaSource};
pub use rules::{QuotaFile, QuotaRules};
