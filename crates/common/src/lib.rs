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

//! Blockstash Common - Shared functionality for Blockstash components
//!
//! This crate provides the pieces every Blockstash binary and test suite
//! needs: logging setup and resolution of the on-disk data directory.

/// Logging setup and utilities for consistent logging across Blockstash components
pub mod logging;
/// Data directory resolution for durable chain data
pub mod paths;

pub use logging::*;
pub use paths::*;
