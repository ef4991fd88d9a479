//! Courier - transactional outbox ingestion and dispatch
//!
//! Commands are accepted once per idempotency key and written together with
//! an outbox event in a single store transaction. Dispatchers claim pending
//! events with fenced leases, publish them to a broker and record the
//! outcome, retrying with backoff and dead-lettering after a bounded number
//! of attempts.

pub mod config;
pub mod dispatcher;
pub mod dlq;
pub mod ingest;
pub mod model;
pub mod publisher;
pub mod storage;
pub mod utils;
