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

//! Liveness and process information for `/health` and `/info`

use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

const SERVICE_NAME: &str = "blockstash";

/// Health check service reporting status, version and uptime
pub struct HealthService {
    start_time: u64,
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthService {
    /// Records the current time as the service start time
    pub fn new() -> Self {
        Self { start_time: unix_now() }
    }

    /// Seconds since the service started
    pub fn uptime(&self) -> u64 {
        unix_now().saturating_sub(self.start_time)
    }

    /// Simple liveness answer
    pub fn ping(&self) -> Value {
        json!({
            "status": "ok",
            "service": SERVICE_NAME,
            "timestamp": unix_now(),
        })
    }

    /// Version, uptime and process id
    pub fn info(&self) -> Value {
        json!({
            "service": SERVICE_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": self.uptime(),
            "started_at": self.start_time,
            "pid": std::process::id(),
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
