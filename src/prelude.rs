//! Re-exports of the types most callers need, so `use lens_engine::prelude::*;`
//! is usually enough.

pub use crate::compose;
pub use crate::config::{self, LensConfig, LensStage};
pub use crate::error::{LensError, Result};
pub use crate::pipe::{FromPipe, FromSource, IdentityPipe};
pub use crate::runtime::wasmtime_backend::WasmtimeRuntime;
pub use crate::runtime::{CompiledModule, HostNext, Instance, Runtime};
pub use crate::source::{Pipe, Source, VecSource};
pub use crate::wire::Frame;
