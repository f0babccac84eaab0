//! Olla: a reverse proxy purpose-built to front a pool of AI inference
//! backends. This crate is the request-handling dataplane — admission,
//! endpoint selection under a circuit breaker, connection pooling,
//! resilient streaming, and stats aggregation.

pub mod admission;
pub mod balancer;
pub mod breaker;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod events;
pub mod pool;
pub mod stats;
pub mod streaming;
pub mod web;
