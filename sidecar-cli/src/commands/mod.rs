//! CLI subcommands.

pub mod cache;
pub mod config;
mod demo;
pub mod run;
