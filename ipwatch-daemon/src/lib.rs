pub mod cmd;
pub mod raw_config;
pub mod signal;
pub mod watch;
