//! # lens-engine
//!
//! `lens-engine` composes user-supplied WebAssembly modules — *lenses* — into
//! a lazy, pull-based transformation pipeline. Each lens is a small WASM
//! module exporting a `transform` function; the host drives the pipeline by
//! asking its last stage for values one at a time, and every stage in turn
//! pulls from the stage (or host-side source) behind it through the guest's
//! single `lens.next` import. Nothing downstream of the final pull is ever
//! materialized eagerly.
//!
//! To build a pipeline, describe its stages in a [`config::LensConfig`] and
//! hand it, together with a host-side [`source::Source`], to
//! [`config::load`]:
//!
//! ```no_run
//! use lens_engine::prelude::*;
//!
//! # fn main() -> lens_engine::error::Result<()> {
//! let config = LensConfig::from_str(r#"{"lenses":[{"path":"./double.wasm"}]}"#)?;
//! let source: Box<dyn Source<i32>> = Box::new(VecSource::new(vec![1, 2, 3]));
//!
//! let mut pipe = config::load(&config, source)?;
//! while pipe.next()? {
//!     println!("{}", pipe.value()?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! A long-lived host that builds many pipelines and wants to reuse compiled
//! modules across them should use [`config::load_into`] instead, supplying
//! its own [`runtime::Runtime`] and keeping a [`config::ModuleCache`] alive
//! between calls.
//!
//! # Notes
//! A lens is *reactive*: it never initiates a pull on its own, only in
//! response to its own `transform` being invoked. Lenses may pull from
//! upstream as many times as they like within one `transform` call (fan-in),
//! or not at all (fan-out, filtering), but must not retain the address
//! `lens.next` returns past their next pull or the end of the call — the
//! host reuses and frees that memory eagerly.
//!
//! Keep lens modules fast and deterministic: a slow or panicking lens stalls
//! or fails the whole pipeline pulling through it, and this crate assumes a
//! single-threaded, synchronous execution model throughout.

pub mod compose;
pub mod config;
pub mod error;
pub mod pipe;
pub mod prelude;
pub mod runtime;
pub mod source;
pub mod wire;

pub use error::{LensError, Result};
