//! Wakegate - scale-to-zero gateway for containerized services
//!
//! This library provides a reverse proxy that:
//! - Routes HTTP traffic by subdomain to managed container services
//! - Wakes stopped services on the first request and serves a loading page meanwhile
//! - Runs single images or compose projects through the Docker engine
//! - Keeps the routing table of a Caddy edge proxy in sync with running services
//! - Samples resource usage and puts idle or underused services back to sleep
//! - Uses connection pooling for efficient upstream communication

pub mod admin;
pub mod caddy;
pub mod config;
pub mod docker;
pub mod error;
pub mod loading;
pub mod monitor;
pub mod orchestrator;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod service;

/// Stub runtime and edge proxy for tests of this crate and its users
#[doc(hidden)]
pub mod testing;
