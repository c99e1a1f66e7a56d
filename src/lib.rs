//! Library crate for proxy-audit exposing the probe engine and its collaborators.
pub mod controller;
pub mod parser;
pub mod progress;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod tabular;
pub mod transport;
pub mod types;
