// signal: Standalone signaling broker.

pub mod config;
