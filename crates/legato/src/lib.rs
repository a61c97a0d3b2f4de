//! Command line front end for the legato motion core.

pub mod cli;
pub mod config;
pub mod job;
