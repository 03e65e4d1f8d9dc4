pub mod cache;
pub mod metrics;
pub mod outcomes;
pub mod queue;
pub mod retry;
