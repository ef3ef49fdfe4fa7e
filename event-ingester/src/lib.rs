pub mod batch;
pub mod commit_log;
pub mod config;
pub mod consumer;
pub mod consumer_worker;
pub mod dead_letter;
pub mod error;
pub mod events;
pub mod metrics;
pub mod metrics_consts;
pub mod producer;
pub mod service;
pub mod source;
pub mod storage;
pub mod test_utils;
pub mod types;
pub mod worker;
