//! The WASM runtime abstraction (C2, §4.1).
//!
//! Core code never names a specific back-end; it only depends on these
//! three traits. [`wasmtime_backend`] is the one concrete back-end this
//! crate ships.

pub mod wasmtime_backend;

use crate::error::Result;
use std::rc::Rc;

/// A closure invoked by the guest's `lens.next` import. Returns the already
/// wire-encoded bytes of the next input frame (produced by pulling and
/// encoding the upstream value, or by forwarding another stage's frame
/// verbatim). The back-end is responsible for allocating guest memory,
/// writing these bytes, and returning the resulting address to the guest —
/// see [`wasmtime_backend`] for why that split exists.
pub type HostNext = Box<dyn FnMut() -> Result<Vec<u8>>>;

/// Compiles module bytes into a reusable, back-end-specific artifact.
///
/// Compilation is expensive; a [`Runtime`] should be reused across many
/// [`compile`](Runtime::compile) calls, and the resulting [`CompiledModule`]
/// shared by every instance derived from the same module bytes.
pub trait Runtime {
    /// Validates `bytes` as a WASM binary and compiles it.
    fn compile(&self, bytes: &[u8]) -> Result<Rc<dyn CompiledModule>>;
}

/// A compiled, not-yet-instantiated guest module.
pub trait CompiledModule {
    /// Instantiates the module, resolving the `lens.next` host import and
    /// locating the exports required by the guest ABI (§6.2): `memory`,
    /// `alloc`, `free`, and `export_name` (`transform` or `inverse`).
    ///
    /// Returns [`LensError::ExportMissing`](crate::error::LensError::ExportMissing)
    /// if any required export is absent.
    fn instantiate(&self, export_name: &str) -> Result<Box<dyn Instance>>;
}

/// One live guest invocation context bound to one [`CompiledModule`].
///
/// All methods take `&self`: implementations guard their underlying runtime
/// state (e.g. a `wasmtime::Store`) behind interior mutability. The
/// `lens.next` pull closure passed to [`transform`](Instance::transform) only
/// ever produces bytes — it never calls back into
/// [`alloc`](Instance::alloc)/[`free`](Instance::free) itself, since that
/// would reenter the same interior-mutability guard `transform` is already
/// holding. The back-end performs the actual memory operations for each pull
/// from outside that guard instead (see `wasmtime_backend`).
///
/// An `Instance` *can* legitimately be reentered: §5 "Shared resources"
/// allows the same instance to sit at more than one position of a single
/// pipeline, which nests `transform` calls on it. Implementations must
/// support that nesting rather than treat it as invariant 1's "at most one
/// `transform` on the stack per instance" being violated — invariant 1 is
/// about one instance never running two *unrelated, concurrent* pipelines at
/// once, not about forbidding self-reuse within one pipeline. See
/// `wasmtime_backend` for how the shipped back-end drives a nested call on
/// the same instance without a second, impossible exclusive borrow.
pub trait Instance {
    /// Allocates `size` bytes in the instance's linear memory, returning the
    /// start address of the allocated block.
    fn alloc(&self, size: u32) -> Result<u32>;

    /// Releases a block previously returned by [`alloc`](Instance::alloc).
    fn free(&self, address: u32, size: u32) -> Result<()>;

    /// Writes `data` verbatim starting at `address`. Used both to write
    /// freshly encoded frames and to forward another stage's framed bytes
    /// without re-encoding.
    fn write_raw(&self, address: u32, data: &[u8]) -> Result<()>;

    /// Reads and decodes the frame at `address`, returning the frame and the
    /// number of bytes it occupies on the wire (needed so the caller can
    /// later `free` exactly that many bytes).
    fn read_frame(&self, address: u32) -> Result<(crate::wire::Frame, u32)>;

    /// Invokes the guest's `transform` (or `inverse`) export.
    ///
    /// `next` is bound to the instance's `lens.next` import immediately
    /// before the guest call, allowing the same `Instance` to be shared
    /// across multiple pipeline positions (§5 "Shared resources"). Returns
    /// the address of the guest's output frame.
    fn transform(&self, next: HostNext) -> Result<u32>;

    /// Invokes the guest's optional `set_param` export.
    fn set_param(&self, address: u32) -> Result<u32>;

    /// Whether this instance's module exports `set_param`.
    fn has_set_param(&self) -> bool;
}
