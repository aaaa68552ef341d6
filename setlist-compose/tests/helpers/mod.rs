//! Test helper modules for setlist-compose integration tests
//!
//! Provides reusable test infrastructure components:
//! - Fixture: in-memory store with one service, hands out connected clients
//! - TestClient: composer plus its store link and dispatcher
//! - eventually: poll a condition until it holds or a deadline passes

#![allow(dead_code)]

pub mod fixture;

pub use fixture::{eventually, fast_config, Fixture, TestClient, SETTLE};
