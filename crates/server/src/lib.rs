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

//! Blockstash Server
//!
//! A read service for blocks, transactions and receipts that answers from the
//! cheapest tier holding the data: an in-memory fast cache for the moving
//! `head`/`finalized`/`safe` tags, a SQLite store for immutable data, and the
//! upstream JSON-RPC node only as a last resort.
//!
//! Background pollers keep the tag entries warm, and a per-client fixed
//! window bounds how often each caller may reach the resolver.

pub mod admission;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod poller;
pub mod resolver;
pub mod service;
pub mod store;
pub mod testing;
pub mod types;

pub use admission::{Admission, AdmissionController};
pub use api::{ApiError, ReadApi};
pub use cache::{FastCache, MemoryCache};
pub use config::ServiceConfig;
pub use error::{GatewayError, ResolveError, ResolveResult};
pub use gateway::{ChainGateway, HttpGateway};
pub use poller::{PollSchedule, PollerState, TagPoller, TagPollers};
pub use resolver::Resolver;
pub use service::{Service, ServiceBuilder};
pub use store::{PersistentStore, SqliteStore};
pub use types::{BlockRecord, BlockSelector, BlockTag, ReceiptRecord, TransactionRecord};
