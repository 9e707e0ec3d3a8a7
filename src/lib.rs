//! Moderation Worker
//!
//! Consumes "item needs moderation" events from Redis Streams, classifies the
//! item, and records a terminal outcome on its pending moderation task.
//! Transient failures are retried with exponential backoff; permanent ones and
//! exhausted retries are dead-lettered. The read position advances only after
//! an event reaches a terminal outcome.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
