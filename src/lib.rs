//! Quotaguard - Distributed Rate Limiting for HTTP Fleets
//!
//! This crate throttles callers of a horizontally scaled HTTP service. Counts
//! live in a shared Redis store so every instance sees the same quota, and a
//! process-local fixed-window counter takes over whenever the store is
//! unreachable, so an outage coarsens throttling instead of failing requests.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod web;
