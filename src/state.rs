//! # Application State Management
//!
//! Handles shared by every connection: configuration, the completion
//! provider, and process-wide counters.
//!
//! ## What is NOT in here:
//! Per-call state (the stream-id watermark, in-flight turns) lives in each
//! connection's [`TurnCoordinator`](crate::coordinator::TurnCoordinator) and
//! dies with the socket. Nothing about one call is visible to another.
//!
//! ## Thread Safety Pattern:
//! Configuration and provider are immutable after startup, so a plain `Arc`
//! is enough. Counters are atomics: they are bumped from relay tasks on any
//! worker thread and only ever read for the health endpoint.

use crate::config::AppConfig;
use crate::coordinator::TurnStatus;
use crate::relay::CompletionProvider;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Loaded and validated once at startup
    pub config: Arc<AppConfig>,

    /// Upstream chat-completion client shared by all calls
    pub provider: Arc<dyn CompletionProvider>,

    pub metrics: Arc<AppMetrics>,

    /// When the server started
    pub start_time: Instant,
}

/// Call and turn counters since server start.
#[derive(Debug, Default)]
pub struct AppMetrics {
    active_calls: AtomicU64,
    total_calls: AtomicU64,
    turns_started: AtomicU64,
    turns_completed: AtomicU64,
    turns_failed: AtomicU64,
    turns_abandoned: AtomicU64,
}

/// Point-in-time copy of [`AppMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active_calls: u64,
    pub total_calls: u64,
    pub turns_started: u64,
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub turns_abandoned: u64,
}

impl AppState {
    pub fn new(config: AppConfig, provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            metrics: Arc::new(AppMetrics::default()),
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn call_started(&self) {
        self.active_calls.fetch_add(1, Ordering::Relaxed);
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Never goes below zero, even if a teardown runs twice.
    pub fn call_ended(&self) {
        let _ = self
            .active_calls
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |active| {
                active.checked_sub(1)
            });
    }

    pub fn turn_started(&self) {
        self.turns_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how a turn ended. Non-terminal statuses are ignored.
    pub fn turn_finished(&self, status: TurnStatus) {
        let counter = match status {
            TurnStatus::Completed => &self.turns_completed,
            TurnStatus::Failed => &self.turns_failed,
            TurnStatus::Abandoned => &self.turns_abandoned,
            TurnStatus::Pending | TurnStatus::Streaming => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_calls: self.active_calls.load(Ordering::Relaxed),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            turns_started: self.turns_started.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            turns_failed: self.turns_failed.load(Ordering::Relaxed),
            turns_abandoned: self.turns_abandoned.load(Ordering::Relaxed),
        }
    }
}
