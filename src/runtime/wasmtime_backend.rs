//! The one concrete [`Runtime`] back-end this crate ships, built on the
//! `wasmtime` crate (§4.1).
//!
//! Design note on reentrancy: the guest's `transform` export calls back into
//! the host via the `lens.next` import, and that import must itself
//! allocate, write, and free frames in the *same* instance's memory. Doing
//! that through the public [`Instance::alloc`]/[`Instance::free`] methods
//! (which borrow a `RefCell<Store<_>>`) would double-borrow and panic, since
//! those methods are also borrowed by the outer `transform` call that is
//! still on the stack. wasmtime solves exactly this with `Caller<'_, T>`:
//! within the `lens.next` closure we reach the guest's `alloc`/`free`/
//! `memory` exports through the `Caller` that wasmtime hands us for the
//! duration of the nested call, rather than through our own `RefCell`.
//!
//! The same problem shows up one level up when the *same* `Instance` is
//! reused at more than one position of a single pipeline (§5 "Shared
//! resources"): the tail stage's `transform` call is still on the stack when
//! an upstream stage drives the identical instance again. There is no sound
//! way to open a second, independent `&mut Store` borrow there — wasmtime
//! only lets a running call reenter its own `Store` through the `Caller`
//! already open for it. So every [`Instance`] method below first tries the
//! ordinary `self.state` borrow, and when that's already taken — which only
//! happens when this instance is being driven reentrantly — falls back to
//! running the call through whichever `Caller` is currently live for this
//! instance, tracked on [`InstanceShared`].
use std::cell::RefCell;
use std::rc::Rc;

use wasmtime::{Caller, Engine, Linker, Memory, Module, Store, TypedFunc};

use crate::error::{LensError, Result};
use crate::runtime::{CompiledModule, HostNext, Instance, Runtime};
use crate::wire::Frame;

/// A [`Runtime`] backed by the `wasmtime` crate.
pub struct WasmtimeRuntime {
    engine: Engine,
}

impl WasmtimeRuntime {
    pub fn new() -> Self {
        WasmtimeRuntime {
            engine: Engine::default(),
        }
    }
}

impl Default for WasmtimeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for WasmtimeRuntime {
    fn compile(&self, bytes: &[u8]) -> Result<Rc<dyn CompiledModule>> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| LensError::Compile(e.to_string()))?;
        log::debug!("compiled wasm module ({} bytes)", bytes.len());
        Ok(Rc::new(WasmtimeModule {
            engine: self.engine.clone(),
            module,
        }))
    }
}

struct WasmtimeModule {
    engine: Engine,
    module: Module,
}

/// State shared between a [`WasmtimeInstance`] and its `lens.next` import
/// closure.
///
/// `next_slots`/`prev_pulls` are stacks with one entry per `transform` call
/// of this instance currently on the Rust call stack — normally one, more
/// than one exactly when the instance is shared across several positions of
/// the same pipeline and is being driven reentrantly. `active_callers` is a
/// stack of raw pointers to the `Caller` live for each `lens.next` import
/// invocation in progress; the borrowed lifetime can't be named in a struct
/// field, so it's erased to `*mut ()` and recovered at the one unsafe use
/// site below. This crate is single-threaded throughout (everything here is
/// built on `Rc`, never `Arc`), so there's only ever one logical caller of
/// these stacks at a time.
struct InstanceShared {
    next_slots: RefCell<Vec<HostNext>>,
    prev_pulls: RefCell<Vec<Option<(u32, u32)>>>,
    active_callers: RefCell<Vec<*mut ()>>,
    export_name: String,
}

impl CompiledModule for WasmtimeModule {
    fn instantiate(&self, export_name: &str) -> Result<Box<dyn Instance>> {
        let mut store = Store::new(&self.engine, ());
        let mut linker = Linker::new(&self.engine);

        let shared = Rc::new(InstanceShared {
            next_slots: RefCell::new(Vec::new()),
            prev_pulls: RefCell::new(Vec::new()),
            active_callers: RefCell::new(Vec::new()),
            export_name: export_name.to_string(),
        });

        let shared_for_import = shared.clone();
        linker
            .func_wrap(
                "lens",
                "next",
                move |mut caller: Caller<'_, ()>| -> anyhow::Result<i32> {
                    pull_one(&mut caller, &shared_for_import)
                },
            )
            .map_err(|e| LensError::Runtime(format!("failed to define `lens.next` import: {e}")))?;

        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| LensError::Runtime(format!("failed to instantiate guest module: {e}")))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| LensError::ExportMissing("memory".to_string()))?;
        let alloc = instance
            .get_typed_func::<u32, u32>(&mut store, "alloc")
            .map_err(|_| LensError::ExportMissing("alloc".to_string()))?;
        let free = instance
            .get_typed_func::<(u32, u32), ()>(&mut store, "free")
            .map_err(|_| LensError::ExportMissing("free".to_string()))?;
        let transform = instance
            .get_typed_func::<(), u32>(&mut store, export_name)
            .map_err(|_| LensError::ExportMissing(export_name.to_string()))?;
        let set_param = instance
            .get_typed_func::<u32, u32>(&mut store, "set_param")
            .ok();

        Ok(Box::new(WasmtimeInstance {
            state: RefCell::new(InstanceState {
                store,
                memory,
                alloc,
                free,
                transform,
                set_param,
            }),
            shared,
        }))
    }
}

/// Reads the current level's `next` callback, produces the bytes for the
/// next input frame, writes them into guest memory via `caller`, and frees
/// the previous pull's frame for this level. Returns the address of the
/// newly written frame, or propagates a trap if allocation itself fails
/// (§4.3 "error resilience": a failure to write even the converted error
/// frame bubbles out of the guest call, since there is nowhere else for it
/// to go).
///
/// `shared.next_slots`/`prev_pulls` always have at least one entry while
/// this runs: the guest can only call `lens.next` from inside a `transform`/
/// `inverse` call, and every such call pushes an entry before invoking the
/// guest and pops it after — see [`WasmtimeInstance::transform`].
fn pull_one(caller: &mut Caller<'_, ()>, shared: &InstanceShared) -> anyhow::Result<i32> {
    shared
        .active_callers
        .borrow_mut()
        .push(caller as *mut Caller<'_, ()> as *mut ());
    let result = pull_one_inner(caller, shared);
    shared.active_callers.borrow_mut().pop();
    result
}

fn pull_one_inner(caller: &mut Caller<'_, ()>, shared: &InstanceShared) -> anyhow::Result<i32> {
    let previous = shared
        .prev_pulls
        .borrow_mut()
        .last_mut()
        .expect("lens.next called with no active transform level")
        .take();
    if let Some((addr, size)) = previous {
        caller_free(caller, addr, size)?;
    }

    let bytes = {
        let mut slots = shared.next_slots.borrow_mut();
        let current = slots
            .last_mut()
            .expect("lens.next called with no active transform level");
        match current() {
            Ok(bytes) => bytes,
            Err(e) => Frame::Error(e.to_string()).encode(),
        }
    };

    let address = caller_alloc(caller, bytes.len() as u32)?;
    caller_write(caller, address, &bytes)?;
    *shared
        .prev_pulls
        .borrow_mut()
        .last_mut()
        .expect("lens.next called with no active transform level") = Some((address, bytes.len() as u32));
    Ok(address as i32)
}

fn caller_alloc(caller: &mut Caller<'_, ()>, size: u32) -> anyhow::Result<u32> {
    let func = caller
        .get_export("alloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| anyhow::anyhow!("guest module does not export `alloc`"))?;
    let typed = func.typed::<u32, u32>(&*caller)?;
    typed.call(&mut *caller, size)
}

fn caller_free(caller: &mut Caller<'_, ()>, address: u32, size: u32) -> anyhow::Result<()> {
    let func = caller
        .get_export("free")
        .and_then(|e| e.into_func())
        .ok_or_else(|| anyhow::anyhow!("guest module does not export `free`"))?;
    let typed = func.typed::<(u32, u32), ()>(&*caller)?;
    typed.call(&mut *caller, (address, size))
}

fn caller_write(caller: &mut Caller<'_, ()>, address: u32, data: &[u8]) -> anyhow::Result<()> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("guest module does not export `memory`"))?;
    memory.write(&mut *caller, address as usize, data)?;
    Ok(())
}

fn caller_transform(caller: &mut Caller<'_, ()>, export_name: &str) -> Result<u32> {
    let func = caller
        .get_export(export_name)
        .and_then(|e| e.into_func())
        .ok_or_else(|| LensError::ExportMissing(export_name.to_string()))?;
    let typed = func
        .typed::<(), u32>(&*caller)
        .map_err(|e| LensError::Runtime(format!("export `{export_name}` has an unexpected signature: {e}")))?;
    typed
        .call(&mut *caller, ())
        .map_err(|e| LensError::Transform(e.to_string()))
}

struct InstanceState {
    store: Store<()>,
    memory: Memory,
    alloc: TypedFunc<u32, u32>,
    free: TypedFunc<(u32, u32), ()>,
    transform: TypedFunc<(), u32>,
    set_param: Option<TypedFunc<u32, u32>>,
}

/// A live instance of a guest module, backed by a `wasmtime::Store`.
///
/// See the module-level doc comment for the two layers of reentrancy this
/// type handles: the guest calling back into the host mid-`transform`
/// (always), and this same `Instance` being driven again while its own
/// `transform` call is still on the stack (only when a caller shares one
/// instance across multiple positions of one pipeline).
pub struct WasmtimeInstance {
    state: RefCell<InstanceState>,
    shared: Rc<InstanceShared>,
}

impl WasmtimeInstance {
    /// Runs `f` against whichever `Caller` is currently live for this
    /// instance, i.e. the `lens.next` invocation that is, directly or
    /// transitively, still on the stack. Used as the fallback by every
    /// `Instance` method below when `self.state` is already borrowed: that
    /// only happens when this instance is being reused at another position
    /// of the same pipeline while its own `transform` call hasn't returned
    /// yet, and the only sound way to touch the guest in that window is
    /// through the `Caller` already open for it.
    fn with_active_caller<T>(&self, f: impl FnOnce(&mut Caller<'_, ()>) -> Result<T>) -> Result<T> {
        let ptr = *self.shared.active_callers.borrow().last().ok_or_else(|| {
            LensError::Runtime(
                "instance reused at another pipeline position outside of an active guest call"
                    .to_string(),
            )
        })?;
        // SAFETY: `ptr` was pushed by the `pull_one` invocation that is
        // still on the Rust call stack right now (it is only popped after
        // that invocation returns), so the `Caller` it points to is valid
        // for the lifetime of this borrow. This crate never shares an
        // `Instance` across threads — everything here is built on `Rc`, not
        // `Arc` — so there is no concurrent access to race against.
        let caller: &mut Caller<'_, ()> = unsafe { &mut *(ptr as *mut Caller<'_, ()>) };
        f(caller)
    }
}

impl Instance for WasmtimeInstance {
    fn alloc(&self, size: u32) -> Result<u32> {
        match self.state.try_borrow_mut() {
            Ok(mut state) => {
                let InstanceState { store, alloc, .. } = &mut *state;
                alloc
                    .call(&mut *store, size)
                    .map_err(|e| LensError::Runtime(format!("alloc trapped: {e}")))
            }
            Err(_) => self.with_active_caller(|caller| {
                caller_alloc(caller, size).map_err(|e| LensError::Runtime(format!("alloc trapped: {e}")))
            }),
        }
    }

    fn free(&self, address: u32, size: u32) -> Result<()> {
        match self.state.try_borrow_mut() {
            Ok(mut state) => {
                let InstanceState { store, free, .. } = &mut *state;
                free.call(&mut *store, (address, size))
                    .map_err(|e| LensError::Runtime(format!("free trapped: {e}")))
            }
            Err(_) => self.with_active_caller(|caller| {
                caller_free(caller, address, size)
                    .map_err(|e| LensError::Runtime(format!("free trapped: {e}")))
            }),
        }
    }

    fn write_raw(&self, address: u32, data: &[u8]) -> Result<()> {
        match self.state.try_borrow_mut() {
            Ok(mut state) => {
                let InstanceState { store, memory, .. } = &mut *state;
                memory
                    .write(&mut *store, address as usize, data)
                    .map_err(|e| LensError::Runtime(format!("memory write out of bounds: {e}")))
            }
            Err(_) => self.with_active_caller(|caller| {
                caller_write(caller, address, data)
                    .map_err(|e| LensError::Runtime(format!("memory write out of bounds: {e}")))
            }),
        }
    }

    fn read_frame(&self, address: u32) -> Result<(Frame, u32)> {
        match self.state.try_borrow_mut() {
            Ok(mut state) => {
                let InstanceState { store, memory, .. } = &mut *state;
                let data = memory.data(&mut *store);
                Frame::decode(data, address)
            }
            Err(_) => self.with_active_caller(|caller| {
                let memory = caller
                    .get_export("memory")
                    .and_then(|e| e.into_memory())
                    .ok_or_else(|| LensError::ExportMissing("memory".to_string()))?;
                let data = memory.data(&mut *caller);
                Frame::decode(data, address)
            }),
        }
    }

    fn transform(&self, next: HostNext) -> Result<u32> {
        match self.state.try_borrow_mut() {
            Ok(mut state) => {
                self.shared.next_slots.borrow_mut().push(next);
                self.shared.prev_pulls.borrow_mut().push(None);

                let result = {
                    let InstanceState { store, transform, .. } = &mut *state;
                    transform.call(&mut *store, ())
                };

                self.shared.next_slots.borrow_mut().pop();
                self.shared.prev_pulls.borrow_mut().pop();
                result.map_err(|e| LensError::Transform(e.to_string()))
            }
            // This instance's own `transform` call is already on the stack
            // further up — it's being reused at another position of this
            // pipeline (§5). There's no second `&mut Store` to be had here,
            // so the nested call is driven through the `Caller` that
            // invocation is running under instead.
            Err(_) => {
                self.shared.next_slots.borrow_mut().push(next);
                self.shared.prev_pulls.borrow_mut().push(None);

                let result =
                    self.with_active_caller(|caller| caller_transform(caller, &self.shared.export_name));

                self.shared.next_slots.borrow_mut().pop();
                self.shared.prev_pulls.borrow_mut().pop();
                result
            }
        }
    }

    fn set_param(&self, address: u32) -> Result<u32> {
        let mut state = self.state.borrow_mut();
        let InstanceState { store, set_param, .. } = &mut *state;
        let f = set_param
            .as_ref()
            .ok_or_else(|| LensError::ExportMissing("set_param".to_string()))?;
        f.call(&mut *store, address)
            .map_err(|e| LensError::Param(e.to_string()))
    }

    fn has_set_param(&self) -> bool {
        self.state.borrow().set_param.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiling_invalid_bytes_is_a_compile_error() {
        let runtime = WasmtimeRuntime::new();
        let err = runtime.compile(b"not a wasm module").unwrap_err();
        assert!(matches!(err, LensError::Compile(_)));
    }
}
