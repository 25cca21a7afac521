//! Real-time multi-channel chat coordinator.
//!
//! Clients connect over WebSocket, claim a nickname, and exchange JSON
//! events with channels backed by SQLite. Messages are persisted before
//! fanout; joins replay history; a relay bus keeps peer workers in sync
//! with at-least-once delivery and per-event dedup.

pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod events;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod web;
