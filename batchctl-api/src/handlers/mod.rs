pub mod batches;
pub mod files;
pub mod health;
pub mod jobs;
pub mod queue;
pub mod webhooks;
