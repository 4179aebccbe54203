//! Tag-addressable multiplexing of local byte streams.
//!
//! A [`Mux`] hands out one [`TagWriter`] per tag. Producers (threads, or child
//! processes given a writer as stdout/stderr) write to their writers, and a
//! single consumer drains everything back as [`Record`]s, either one chunk at
//! a time with [`Mux::read`] or while some work runs with
//! [`Mux::read_while`].
//!
//! ```no_run
//! use std::io::Write;
//!
//! let mux = iomux_core::Mux::new()?;
//! let mut out = mux.tag("out")?;
//! let mut err = mux.tag("err")?;
//! let records = mux
//!     .read_while(|| {
//!         out.write_all(b"hello")?;
//!         err.write_all(b"oops")?;
//!         Ok::<(), std::io::Error>(())
//!     })
//!     .map_err(|e| e.error)?;
//! assert_eq!(records[0].tag, "out");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod config;
mod error;
pub(crate) mod muxer;

pub use config::MuxConfig;
pub use error::{DrainError, Error, Interrupted, ParseTransportError, Result};
pub use muxer::{Mux, Record, TagWriter, TransportKind};
