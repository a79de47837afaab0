//! Webhook-triggered deployment listener.
//!
//! Accepts signed push notifications over HTTP, checks the HMAC signature
//! against the raw body, and runs one external deploy action at a time.
//! See [`http_server::router`] for the endpoint and [`deployer::Deployer`]
//! for admission and run semantics.

pub mod action;
pub mod config;
pub mod deployer;
pub mod error;
pub mod http_server;
pub mod journal;
pub mod lock;
pub mod telemetry;
pub mod types;
pub mod verification;
