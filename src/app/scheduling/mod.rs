pub mod clock;
pub mod daily;
pub mod enqueue;
pub mod idempotency;
pub mod recovery;
pub mod runtime;
pub mod timezone;

pub use clock::{Clock, ManualClock, SystemClock};
pub use daily::{DailyRunSummary, DailyScheduler};
pub use enqueue::MinuteEnqueuer;
pub use idempotency::IdempotencyKey;
pub use recovery::{RecoveryLoop, RecoverySummary};
pub use runtime::Pipeline;
pub use timezone::{InvalidTimeSpec, TimezoneEngine};
