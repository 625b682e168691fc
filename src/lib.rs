#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! portgate library — expose local serial ports and TCP endpoints through a
//! public relay server.
//!
//! Serial devices are bridged to loopback TCP listeners, and an external
//! forwarding client (frpc-compatible) is supervised to publish each
//! mapping's local endpoint on a public port. The
//! [`manager::ConnectionManager`] drives the whole lifecycle and feeds
//! observers through a broadcast channel of [`events::Event`]s.

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod ports;
pub mod tunnel;

pub use config::Config;
pub use error::{Error, Result};
pub use events::Event;
pub use manager::ConnectionManager;
