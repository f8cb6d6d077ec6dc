//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket session through `web::Data`.
//!
//! ## What lives here:
//! - **config**: immutable after startup, so a plain `Arc<AppConfig>` suffices
//! - **metrics**: counters bumped by every connection; atomics instead of a lock, because
//!   voice relaying would otherwise take a write lock per frame
//! - **registry**: address of the [`RoomRegistry`] actor. Connection handlers reach rooms
//!   only through it, there is no global room map
//! - **start_time**: for uptime reporting
//!
//! ## Arc vs Addr
//! `Arc<T>` shares data; `Addr<A>` shares a mailbox. Both are cheap to clone, which is why
//! `AppState` itself derives `Clone` and is copied into every worker.

use crate::config::AppConfig;
use crate::server::RoomRegistry;
use actix::{Actor, Addr};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<SessionMetrics>,
    pub registry: Addr<RoomRegistry>,
    pub start_time: Instant,
}

/// Counters collected across all connections since server start.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    connections_total: AtomicU64,
    active_connections: AtomicU64,
    joins: AtomicU64,
    messages_received: AtomicU64,
    protocol_errors: AtomicU64,
    voice_frames_relayed: AtomicU64,
    voice_frames_dropped: AtomicU64,
    chat_messages: AtomicU64,
    whiteboard_updates: AtomicU64,
}

/// Plain-number copy of [`SessionMetrics`] for serialization.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub active_connections: u64,
    pub joins: u64,
    pub messages_received: u64,
    pub protocol_errors: u64,
    pub voice_frames_relayed: u64,
    pub voice_frames_dropped: u64,
    pub chat_messages: u64,
    pub whiteboard_updates: u64,
}

impl SessionMetrics {
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Never goes below zero.
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn joined(&self) {
        self.joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn voice_relayed(&self) {
        self.voice_frames_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn voice_dropped(&self) {
        self.voice_frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chat_posted(&self) {
        self.chat_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn whiteboard_updated(&self) {
        self.whiteboard_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            voice_frames_relayed: self.voice_frames_relayed.load(Ordering::Relaxed),
            voice_frames_dropped: self.voice_frames_dropped.load(Ordering::Relaxed),
            chat_messages: self.chat_messages.load(Ordering::Relaxed),
            whiteboard_updates: self.whiteboard_updates.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Protocol errors per received message (0.0 to 1.0).
    pub fn protocol_error_rate(&self) -> f64 {
        if self.messages_received > 0 {
            self.protocol_errors as f64 / self.messages_received as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    /// Build the state and start the room registry.
    ///
    /// Must be called inside a running actix system (`#[actix_web::main]` or `#[actix::test]`).
    pub fn new(config: AppConfig) -> Self {
        let registry =
            RoomRegistry::new(config.rooms.max_participants, config.idle_close()).start();
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: AppConfig, registry: Addr<RoomRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(SessionMetrics::default()),
            registry,
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
