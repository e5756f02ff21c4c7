pub mod batch;
pub mod batch_runner;
pub mod broker;
pub mod channel;
pub mod commands;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod models;
pub mod param_utils;
pub mod performance;
pub mod scanner;
pub mod signals;
pub mod strategy;
pub mod trading_rules;
