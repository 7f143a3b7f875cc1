pub mod bybit_api;
pub mod circuit_breaker;
pub mod commands;
pub mod confidence;
pub mod config;
pub mod engine;
pub mod entry_gate;
pub mod error;
pub mod exchange;
pub mod indicators;
pub mod journal;
pub mod liquidation_feed;
pub mod market_structure;
pub mod orchestrator;
pub mod overrides;
pub mod planner;
pub mod position_monitor;
pub mod risk;
pub mod telegram;
pub mod types;
