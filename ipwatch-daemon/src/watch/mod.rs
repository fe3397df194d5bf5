pub mod config;
pub mod exec;
pub mod notifier;
pub mod script;
