pub mod backoff;
pub mod consumer;
pub mod dead_letter;
pub mod errors;
pub mod orchestrator;
pub mod prediction;
pub mod queue;
pub mod shutdown;
pub mod store;
