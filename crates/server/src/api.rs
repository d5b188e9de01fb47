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

//! The three read operations exposed to clients
//!
//! Every call runs admission first, then input validation, then resolution, so
//! a rejected client never costs a lookup and malformed input never costs I/O.

use crate::{
    admission::{Admission, AdmissionController},
    error::ResolveError,
    resolver::Resolver,
    types::{BlockRecord, BlockSelector, ReceiptRecord, TransactionRecord},
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors returned to API clients
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The client exceeded its request budget
    #[error("rate limit exceeded, try again later")]
    RateLimited,

    /// Validation or resolution failed
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl ApiError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Resolve(ResolveError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Resolve(ResolveError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Resolve(ResolveError::Upstream(_)) => StatusCode::BAD_GATEWAY,
            Self::Resolve(ResolveError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Admission-guarded front of the [`Resolver`]
pub struct ReadApi {
    resolver: Arc<Resolver>,
    admission: Arc<AdmissionController>,
}

impl ReadApi {
    /// Creates the API over a resolver and an admission controller
    pub fn new(resolver: Arc<Resolver>, admission: Arc<AdmissionController>) -> Self {
        Self { resolver, admission }
    }

    /// The underlying resolver
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// The admission controller
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Block by number or tag
    pub async fn fetch_block(
        &self,
        client: &str,
        selector: &str,
        full: bool,
    ) -> Result<BlockRecord, ApiError> {
        self.admit(client)?;
        let selector: BlockSelector = selector.parse()?;
        debug!(client, %selector, full, "Fetching block");
        Ok(self.resolver.resolve_block(selector, full).await?)
    }

    /// Transaction by hash
    pub async fn fetch_transaction(
        &self,
        client: &str,
        hash: &str,
    ) -> Result<TransactionRecord, ApiError> {
        self.admit(client)?;
        debug!(client, hash, "Fetching transaction");
        Ok(self.resolver.resolve_transaction(hash).await?)
    }

    /// Receipt by transaction hash
    pub async fn fetch_receipt(&self, client: &str, hash: &str) -> Result<ReceiptRecord, ApiError> {
        self.admit(client)?;
        debug!(client, hash, "Fetching receipt");
        Ok(self.resolver.resolve_receipt(hash).await?)
    }

    fn admit(&self, client: &str) -> Result<(), ApiError> {
        match self.admission.allow(client) {
            Admission::Admitted => Ok(()),
            Admission::Rejected => Err(ApiError::RateLimited),
        }
    }
}
