pub mod canonical;
pub mod client;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod metrics;
pub mod providers;
pub mod single_flight;
pub mod storage;
