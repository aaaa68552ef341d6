//! Backing store contract
//!
//! The store is the only resource clients share. It persists entries,
//! assigns versions and timestamps, re-validates every write against the
//! acting user's role, and broadcasts the resulting record of every change to
//! all subscribers (including the writer).

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use setlist_common::events::ChangeEvent;
use setlist_common::models::{
    DeleteAck, EntryPatch, EntryRecord, MutationOrigin, NewEntry, ServiceRecord, ServiceStatus,
};
use setlist_common::{ClientId, EntryId, MutationId, ServiceId, UserId};

pub use memory::{InMemoryStore, StoreLink};

/// At-least-once change stream
pub type EventStream = broadcast::Receiver<ChangeEvent>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures reported by the store (or by the transport in front of it)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// `current` is the record as the store holds it now
    #[error("Version conflict on entry {} (now at version {})", current.id, current.version)]
    Conflict { current: EntryRecord },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// No response within the submission timeout
    #[error("Store did not respond in time")]
    Timeout,
}

impl StoreError {
    /// Network-level failure, as opposed to a decision by the store
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_) | StoreError::Timeout)
    }
}

impl From<StoreError> for setlist_common::Error {
    fn from(err: StoreError) -> Self {
        use setlist_common::Error;
        match err {
            StoreError::PermissionDenied(reason) => Error::Denied(reason),
            StoreError::Conflict { current } => Error::Conflict { entry: current.id },
            StoreError::NotFound(what) => Error::NotFound(what),
            StoreError::Transport(reason) => Error::Network(reason),
            StoreError::Timeout => Error::Timeout,
        }
    }
}

/// Who is asking, and on behalf of which local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub user: UserId,
    pub client: ClientId,
    pub mutation: Option<MutationId>,
}

impl RequestContext {
    pub fn new(user: UserId, client: ClientId) -> Self {
        Self {
            user,
            client,
            mutation: None,
        }
    }

    pub fn for_mutation(self, mutation: MutationId) -> Self {
        Self {
            mutation: Some(mutation),
            ..self
        }
    }

    /// Origin stamped on records written under this context
    pub fn origin(&self, client_ref: Option<EntryId>) -> Option<MutationOrigin> {
        self.mutation.map(|mutation| MutationOrigin {
            client: self.client,
            mutation,
            client_ref,
        })
    }
}

/// One write, as the dispatcher submits it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreRequest {
    Create(NewEntry),
    Update {
        id: EntryId,
        patch: EntryPatch,
        /// Only sent for override edits; moves are last-write-wins
        expected_version: Option<u64>,
    },
    Delete {
        id: EntryId,
    },
}

impl StoreRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreRequest::Create(_) => "create",
            StoreRequest::Update { .. } => "update",
            StoreRequest::Delete { .. } => "delete",
        }
    }
}

/// Successful write result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    Record(EntryRecord),
    Deleted(DeleteAck),
}

#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Create an entry; a repeated `client_ref` from the same client returns
    /// the existing record
    async fn create(&self, ctx: &RequestContext, entry: NewEntry) -> StoreResult<EntryRecord>;

    async fn update(
        &self,
        ctx: &RequestContext,
        id: EntryId,
        patch: EntryPatch,
        expected_version: Option<u64>,
    ) -> StoreResult<EntryRecord>;

    /// Delete an entry; deleting an already deleted entry succeeds
    async fn delete(&self, ctx: &RequestContext, id: EntryId) -> StoreResult<DeleteAck>;

    /// Every live entry of a service
    async fn fetch_entries(
        &self,
        ctx: &RequestContext,
        service_id: ServiceId,
    ) -> StoreResult<Vec<EntryRecord>>;

    async fn set_service_status(
        &self,
        ctx: &RequestContext,
        service_id: ServiceId,
        status: ServiceStatus,
    ) -> StoreResult<ServiceRecord>;

    async fn subscribe(&self) -> StoreResult<EventStream>;

    async fn heartbeat(&self) -> StoreResult<()>;
}

/// Send one request to the store
pub async fn execute(
    store: &dyn BackingStore,
    ctx: &RequestContext,
    request: StoreRequest,
) -> StoreResult<StoreReply> {
    match request {
        StoreRequest::Create(entry) => store.create(ctx, entry).await.map(StoreReply::Record),
        StoreRequest::Update {
            id,
            patch,
            expected_version,
        } => store
            .update(ctx, id, patch, expected_version)
            .await
            .map(StoreReply::Record),
        StoreRequest::Delete { id } => store.delete(ctx, id).await.map(StoreReply::Deleted),
    }
}
