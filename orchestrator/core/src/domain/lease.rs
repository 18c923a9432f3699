// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # LeaseStore Port
//!
//! The registry keeps no durable state of its own: every listing is a key bound
//! to a TTL lease in a replicated key-value store with etcd v3 semantics.
//!
//! - Every mutation bumps a store-wide [`Revision`]; watch events carry it and
//!   consumers order events by revision, never by wall-clock time.
//! - A lease that has expired is gone; `keep_alive` on it fails with
//!   [`LeaseStoreError::LeaseNotFound`] and never revives it.
//! - Revoking or expiring a lease deletes every key attached to it and emits a
//!   `Delete` watch event per key.
//!
//! Implementations: [`crate::infrastructure::lease_store::InMemoryLeaseStore`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::domain::error::ErrorClass;

/// Opaque lease handle returned by [`LeaseStore::grant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Store-wide modification counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub i64);

impl Revision {
    pub const ZERO: Revision = Revision(0);

    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// Why a key disappeared. Informational only; consumers must not branch on it
/// for correctness since real stores do not always report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteCause {
    Deleted,
    LeaseRevoked,
    LeaseExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// For deletes, `value` is empty and `mod_revision` is the delete revision.
    pub kv: KeyValue,
    pub revision: Revision,
    pub cause: Option<DeleteCause>,
}

/// A bounded slice of a prefix range, used for batched resynchronisation.
#[derive(Debug, Clone, Default)]
pub struct RangePage {
    pub kvs: Vec<KeyValue>,
    pub more: bool,
    /// Store revision at the time the page was read.
    pub revision: Revision,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, LeaseStoreError>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseStoreError {
    #[error("lease {0} not found or expired")]
    LeaseNotFound(LeaseId),

    #[error("key {0} already exists")]
    KeyExists(String),

    #[error("requested revision {requested} has been compacted (oldest retained {oldest})")]
    Compacted { requested: Revision, oldest: Revision },

    #[error("watch stream lagged and was closed")]
    WatchLagged,

    #[error("lease store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid lease store request: {0}")]
    InvalidRequest(String),
}

impl LeaseStoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LeaseStoreError::LeaseNotFound(_) => ErrorClass::Expired,
            LeaseStoreError::KeyExists(_) => ErrorClass::Conflict,
            LeaseStoreError::Compacted { .. }
            | LeaseStoreError::WatchLagged
            | LeaseStoreError::Unavailable(_) => ErrorClass::Transient,
            LeaseStoreError::InvalidRequest(_) => ErrorClass::Fatal,
        }
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create a lease that expires `ttl` from now unless kept alive.
    async fn grant(&self, ttl: Duration) -> Result<LeaseGrant, LeaseStoreError>;

    /// Reset the lease deadline to a full TTL from now.
    async fn keep_alive(&self, lease: LeaseId) -> Result<LeaseGrant, LeaseStoreError>;

    /// Revoke a lease and delete its keys. Revoking an unknown lease is a no-op.
    async fn revoke(&self, lease: LeaseId) -> Result<(), LeaseStoreError>;

    /// Remaining time before expiry, `None` if the lease no longer exists.
    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<Duration>, LeaseStoreError>;

    /// Atomically create `key` only if it does not exist.
    async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, LeaseStoreError>;

    /// Create or overwrite `key`.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision, LeaseStoreError>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, LeaseStoreError>;

    /// Delete `key`, returning the delete revision if it existed.
    async fn delete(&self, key: &str) -> Result<Option<Revision>, LeaseStoreError>;

    /// Read at most `limit` keys under `prefix`, strictly after `start_after`, in key order.
    async fn range(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<RangePage, LeaseStoreError>;

    /// Stream every event under `prefix` with revision >= `start_revision`.
    async fn watch(&self, prefix: &str, start_revision: Revision) -> Result<WatchStream, LeaseStoreError>;

    /// Current store revision.
    async fn current_revision(&self) -> Result<Revision, LeaseStoreError>;
}
