//! # Setlist Composer Library (setlist-compose)
//!
//! Collaborative, offline-tolerant editing of one service's ordered setlist.
//!
//! **Purpose:** Let several clients reorder, add, remove, and annotate entries
//! of the same service at once. Every local change is visible immediately,
//! confirmed or rolled back by the backing store, and merged with everyone
//! else's changes so that all clients converge on the same order.
//!
//! **Architecture:**
//! - [`session::CompositionSession`]: synchronous core (canonical state,
//!   pending mutations, projection)
//! - [`composer::Composer`]: thread-safe facade for UI code
//! - [`dispatcher::Dispatcher`]: async task talking to a [`store::BackingStore`]
//! - [`availability`] and [`usage`]: song repetition rule over a usage ledger

pub mod authz;
pub mod availability;
pub mod composer;
pub mod dispatcher;
pub mod identity;
pub mod mutation;
pub mod notify;
pub mod order;
pub mod position;
pub mod session;
pub mod store;
pub mod usage;

pub use availability::{Availability, AvailabilityPolicy};
pub use composer::{Composer, SharedLedger};
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use notify::{ChangeCause, Notice, NoticeKind, StateChange, Subscription};
pub use order::EntryView;
pub use session::{CompositionSession, ConnectionState};
pub use setlist_common::{Error, Result};
