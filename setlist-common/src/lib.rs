//! # Setlist Common Library
//!
//! Shared code for the setlist workspace including:
//! - Identifier newtypes (services, entries, songs, clients, users)
//! - Store record models (entries, services, usage)
//! - Change event types and the broadcast EventBus
//! - Configuration loading and resolution
//! - Error types and time helpers

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod models;
pub mod time;

pub use error::{Error, Result};
pub use ids::{ClientId, EntryId, MutationId, ServiceId, SongId, TenantId, UserId};
