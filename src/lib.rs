#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// Serial port transport.
pub mod serial;

/// Mocked modem.
pub mod mock;

/// Serializes AT commands onto the modem's line.
pub mod engine;

/// Parses unread message listings.
pub mod parser;

/// Background polling of the modem's inbox.
pub mod poller;

/// Outbound SMS.
pub mod sender;

/// The message log.
pub mod store;

/// The HTTP API.
pub mod server;

/// Wires modem, store, poller and API together.
pub mod gateway;

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;
