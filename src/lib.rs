pub mod bid;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod grabber;
pub mod notifier;
pub mod parser;
pub mod rate;
pub mod reconcile;
pub mod registry;
pub mod resource;
pub mod scheduled_task;
pub mod scheduler;
pub mod stats;
pub mod trader;
pub mod transaction;
pub mod websocket;
