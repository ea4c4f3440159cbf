//! Usage metering, quota enforcement and rate limiting.
pub mod cache;
pub mod config;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod ratelimit;
pub mod services;
pub mod startup;
pub mod store;
