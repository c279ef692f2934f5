// src/lib.rs
pub mod ports {
    pub mod paper_broker;
}
pub mod alert_notifier;
pub mod broker;
pub mod config;
pub mod email_client;
pub mod engine;
pub mod regime;
pub mod risk;
pub mod stats;
pub mod trade;
