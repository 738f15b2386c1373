pub mod config;
pub mod consistency;
pub mod runner;
pub mod script;
