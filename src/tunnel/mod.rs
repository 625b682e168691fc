//! The managed external forwarding client.
//!
//! `writer` renders the per-mapping forwarding stanzas into the client's
//! INI config at a temp path; `supervisor` owns the singleton child process
//! pointed at that config.

pub mod supervisor;
pub mod writer;
