//! Host-link services for the programmable services engine.
//!
//! Exposes the HECI bus driver and its configuration. Platform glue
//! (doorbell registers, copy-engine registers, interrupt wiring) plugs in
//! through the [`heci::Transport`] and [`heci::DmaEngine`] traits.

#![deny(unused_must_use)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod heci;

pub use error::{HeciError, Result};
