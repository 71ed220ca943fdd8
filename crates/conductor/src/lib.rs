pub mod agent;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod errors;
pub mod logging;
pub mod models;
pub mod providers;
pub mod registry;
pub mod remote;
pub mod retry;
