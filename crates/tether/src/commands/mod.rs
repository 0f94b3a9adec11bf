//! Command handlers for the tether CLI.

pub mod connect;
pub mod serve;

use clap::ValueEnum;

/// Wire transport selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    Stdio,
    Ws,
    Http,
}
