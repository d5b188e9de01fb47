// Blockstash - Cached Chain Data Service
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Error types for chain data resolution.

use thiserror::Error;

/// Errors returned by a [`ChainGateway`](crate::gateway::ChainGateway).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The upstream answered, but has no such block/transaction/receipt.
    #[error("not found upstream: {0}")]
    NotFound(String),

    /// Network, timeout, protocol or rate-limit failure talking to the node.
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Errors returned by a [`FastCache`](crate::cache::FastCache).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache backend failed.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// A cached value could not be encoded or decoded.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned by a [`PersistentStore`](crate::store::PersistentStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite database error, including rows that fail to decode.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors from a [`TagPoller`](crate::poller::TagPoller).
#[derive(Debug, Error)]
pub enum PollerError {
    /// `start()` called on a poller that already left `Created`.
    #[error("poller for {tag} cannot start from state {state:?}")]
    InvalidState {
        /// Tag the poller refreshes
        tag: crate::types::BlockTag,
        /// State it was in
        state: crate::poller::PollerState,
    },

    /// The tick's upstream fetch failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The tick's cache write failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Errors surfaced by the [`Resolver`](crate::resolver::Resolver).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// Malformed selector or hash, rejected before any I/O.
    #[error("validation error: {0}")]
    Validation(String),

    /// No such block/transaction/receipt anywhere, including upstream.
    #[error("not found: {0}")]
    NotFound(String),

    /// The upstream node failed; not retried within the call.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The durable store failed on the read path.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<GatewayError> for ResolveError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound(what) => Self::NotFound(what),
            GatewayError::Upstream(reason) => Self::Upstream(reason),
        }
    }
}

impl From<StoreError> for ResolveError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result type for resolution operations.
pub type ResolveResult<T> = Result<T, ResolveError>;
