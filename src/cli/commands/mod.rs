pub mod logs;
pub mod migrate;
pub mod queue;
pub mod recover;
pub mod schedule;
pub mod serve;
