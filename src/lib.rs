//! Alert matching and notification dispatch for environmental-monitoring
//! datasets: consumes "dataset updated" events, resolves each matching
//! subscription's area of interest, queries and classifies the alerts in
//! the window, and hands per-language notification payloads to delivery.

pub mod alerts;
pub mod channel;
pub mod classify;
pub mod config;
pub mod db;
pub mod delivery;
pub mod geostore;
pub mod humanize;
pub mod model;
pub mod payload;
pub mod pipeline;
