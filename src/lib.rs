pub mod cli;
pub mod config;
pub mod conversation;
pub mod logging;
pub mod replay;
