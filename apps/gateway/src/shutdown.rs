// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `ShutdownCoordinator` (§4.8): once the root cancellation token fires,
//! every connection's write-pump sees it on its next select-loop turn and
//! closes with `going_away` (1001); this coordinator's job is to bound how
//! long shutdown waits for that drain to finish before declaring it
//! incomplete and returning control to the caller so the process can exit
//! anyway — shutdown completing only once every client is gone would let
//! a single stuck client hang the whole process forever.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::state::AppState;

#[derive(Debug)]
pub struct ShutdownIncomplete {
    pub remaining_connections: usize,
}

impl std::fmt::Display for ShutdownIncomplete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} connection(s) still open after the drain deadline", self.remaining_connections)
    }
}

impl std::error::Error for ShutdownIncomplete {}

/// Drives the drain-and-exit sequence described in §4.8. Idempotent: the
/// root cancellation token can only be cancelled once, and polling an
/// already-empty registry is a no-op.
pub struct ShutdownCoordinator {
    app_state: Arc<AppState>,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(app_state: Arc<AppState>) -> Self {
        Self { app_state }
    }

    /// Cancels the root token (idempotent) and polls the connection
    /// registry until it drains or `deadline` elapses.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownIncomplete` if connections remain open once
    /// `deadline` elapses; resources are released regardless.
    pub async fn run(&self, deadline: Duration) -> Result<(), ShutdownIncomplete> {
        self.app_state.shutdown_cancel.cancel();

        let start = tokio::time::Instant::now();
        let mut poll = tokio::time::interval(Duration::from_millis(100));

        loop {
            let remaining = self.app_state.registry.connection_count();
            if remaining == 0 {
                info!("shutdown drain complete: all connections closed");
                return Ok(());
            }
            if start.elapsed() >= deadline {
                warn!(remaining, "shutdown drain deadline reached with connections still open");
                return Err(ShutdownIncomplete { remaining_connections: remaining });
            }
            poll.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn run_completes_immediately_with_no_connections() {
        let app_state = Arc::new(AppState::new(Config::default()));
        let result = ShutdownCoordinator::new(Arc::clone(&app_state)).run(Duration::from_millis(500)).await;
        assert!(result.is_ok());
        assert!(app_state.shutdown_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn run_reports_incomplete_when_a_connection_lingers() {
        let app_state = Arc::new(AppState::new(Config::default()));
        let queue = crate::registry::OutboundQueue::new(1);
        app_state.registry.register(uuid::Uuid::new_v4(), "u1", queue).unwrap();

        let result = ShutdownCoordinator::new(Arc::clone(&app_state)).run(Duration::from_millis(150)).await;
        assert!(result.is_err());
    }
}
