// src/lib.rs
pub mod broker;
pub mod bus;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod ingestor;
pub mod logger;
pub mod models;
pub mod shutdown;
pub mod translator;
