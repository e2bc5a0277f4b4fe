//! HTTP front end guarded by the rate limiter.

mod server;
mod service;

pub use server::HttpServer;
pub use service::{admission_control, router, ThrottleBody};
