pub mod guard;
pub mod metrics;
