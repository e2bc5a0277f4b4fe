//! Turnstile - Token Bucket Admission Control
//!
//! This crate implements a request-admission rate limiter and the HTTP
//! front end that consults it. Every caller, identified by account ID or
//! source address, draws from its own token bucket; per-account quotas can
//! be looked up asynchronously and cached.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
