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

//! Per-client request admission
//!
//! A fixed-window counter per client key. Up to twice `rate` requests can pass
//! around a window boundary; a sliding window or token bucket would tighten
//! that if it ever matters.

use crate::metrics::{AdmissionMetrics, AdmissionStats};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request may proceed
    Admitted,
    /// Client exceeded its budget for the current window
    Rejected,
}

#[derive(Debug, Clone, Copy)]
struct Visitor {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}

/// Fixed-window limiter keyed by client
pub struct AdmissionController {
    visitors: Mutex<HashMap<String, Visitor>>,
    rate: u32,
    window: Duration,
    metrics: AdmissionMetrics,
}

impl AdmissionController {
    /// Admits up to `rate` requests per client per `window`
    pub fn new(rate: u32, window: Duration) -> Self {
        Self {
            visitors: Mutex::new(HashMap::new()),
            rate,
            window,
            metrics: AdmissionMetrics::default(),
        }
    }

    /// Requests admitted per window
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Window length
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Counts one request from `client` and decides whether it may proceed
    pub fn allow(&self, client: &str) -> Admission {
        let now = Instant::now();
        let admission = {
            let mut visitors = self.visitors.lock();
            let visitor = visitors.entry(client.to_string()).or_insert(Visitor {
                count: 0,
                window_start: now,
                last_seen: now,
            });

            if now.duration_since(visitor.window_start) >= self.window {
                visitor.count = 0;
                visitor.window_start = now;
            }
            visitor.count = visitor.count.saturating_add(1);
            visitor.last_seen = now;

            if visitor.count > self.rate {
                Admission::Rejected
            } else {
                Admission::Admitted
            }
        };

        match admission {
            Admission::Admitted => self.metrics.admitted.incr(),
            Admission::Rejected => {
                self.metrics.rejected.incr();
                debug!(client, "Request rejected by admission control");
            }
        }
        admission
    }

    /// Forgets clients idle for longer than the window, returning how many
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut visitors = self.visitors.lock();
        let before = visitors.len();
        visitors.retain(|_, visitor| now.duration_since(visitor.last_seen) <= self.window);
        before - visitors.len()
    }

    /// Number of tracked clients
    pub fn visitor_count(&self) -> usize {
        self.visitors.lock().len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            admitted: self.metrics.admitted.get(),
            rejected: self.metrics.rejected.get(),
            visitors: self.visitor_count() as u64,
        }
    }

    /// Runs [`Self::sweep`] once per window until `cancel` fires
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + controller.window, controller.window);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = controller.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept idle visitors");
                        }
                    }
                }
            }
            info!("Admission sweeper stopped");
        })
    }
}
