//! Drives guests compiled with the stack-unwind/rewind transformation.
//!
//! WebAssembly execution is synchronous: a call into the guest runs to
//! completion and cannot await anything. Transformed binaries export five
//! functions that let the host save the entire call stack into a scratch
//! region of linear memory (`unwind`), return control to the host, and
//! later replay that stack to resume exactly at the suspension point
//! (`rewind`). The loop below recognizes the two suspension signals — the
//! guest's own state export and the pending flag `fd_read` raises — and
//! performs the resume at the right time, which is all it takes to make a
//! blocking read over an async stream look ordinary to the guest.

use crate::ctx::HostCtx;
use anyhow::{anyhow, bail, Context, Result};
use wasmtime::{Caller, Extern, Instance, Store, TypedFunc};
use wasmtime_wasi::I32Exit;

/// Size of the scratch region reserved for stack-save data, including its
/// 8-byte header.
const STACK_REGION_SIZE: u32 = 64 * 1024;

/// Backstop against host/guest protocol violations. Reaching it means a
/// suspension cycle that can never settle; ordinary interactive sessions
/// stay orders of magnitude below it.
const MAX_DRIVE_CYCLES: usize = 1 << 20;

/// Execution state reported by `asyncify_get_state`, values defined by the
/// transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuestState {
    Normal,
    Unwinding,
    Rewinding,
}

impl GuestState {
    fn from_raw(raw: i32) -> Result<GuestState> {
        match raw {
            0 => Ok(GuestState::Normal),
            1 => Ok(GuestState::Unwinding),
            2 => Ok(GuestState::Rewinding),
            other => bail!("guest reported unknown asyncify state {other}"),
        }
    }
}

fn caller_typed<P, R>(caller: &mut Caller<'_, HostCtx>, name: &str) -> Result<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    caller
        .get_export(name)
        .and_then(Extern::into_func)
        .with_context(|| format!("guest does not export `{name}`"))?
        .typed(&mut *caller)
        .with_context(|| format!("`{name}` has an unexpected signature"))
}

/// Ask the calling instance for its asyncify state. Usable from inside a
/// host function: `Caller::get_export` resolves against the live instance.
pub(crate) fn guest_state(caller: &mut Caller<'_, HostCtx>) -> Result<GuestState> {
    let f = caller_typed::<(), i32>(caller, "asyncify_get_state")?;
    GuestState::from_raw(f.call(&mut *caller, ())?)
}

/// Begin saving the guest's call stack into the scratch region.
pub(crate) fn start_unwind(caller: &mut Caller<'_, HostCtx>, data_addr: u32) -> Result<()> {
    let f = caller_typed::<i32, ()>(caller, "asyncify_start_unwind")?;
    f.call(&mut *caller, data_addr as i32)?;
    Ok(())
}

/// Finalize a stack replay; the guest is back in its normal state after.
pub(crate) fn stop_rewind(caller: &mut Caller<'_, HostCtx>) -> Result<()> {
    let f = caller_typed::<(), ()>(caller, "asyncify_stop_rewind")?;
    f.call(&mut *caller, ())?;
    Ok(())
}

struct AsyncifyExports {
    get_state: TypedFunc<(), i32>,
    stop_unwind: TypedFunc<(), ()>,
    start_rewind: TypedFunc<i32, ()>,
    stop_rewind: TypedFunc<(), ()>,
}

impl AsyncifyExports {
    fn resolve(store: &mut Store<HostCtx>, instance: &Instance) -> Result<Self> {
        Ok(AsyncifyExports {
            get_state: instance
                .get_typed_func(&mut *store, "asyncify_get_state")
                .context("guest does not export `asyncify_get_state`")?,
            stop_unwind: instance
                .get_typed_func(&mut *store, "asyncify_stop_unwind")
                .context("guest does not export `asyncify_stop_unwind`")?,
            start_rewind: instance
                .get_typed_func(&mut *store, "asyncify_start_rewind")
                .context("guest does not export `asyncify_start_rewind`")?,
            stop_rewind: instance
                .get_typed_func(&mut *store, "asyncify_stop_rewind")
                .context("guest does not export `asyncify_stop_rewind`")?,
        })
    }

    fn state(&self, store: &mut Store<HostCtx>) -> Result<GuestState> {
        GuestState::from_raw(self.get_state.call(&mut *store, ())?)
    }
}

/// Reserve the scratch region and write its bounds into the 8-byte header
/// the transformation expects: `[data_addr]` = start of the stack area,
/// `[data_addr + 4]` = its end.
fn setup_stack_region(store: &mut Store<HostCtx>, instance: &Instance) -> Result<u32> {
    let memory = store
        .data()
        .memory
        .ok_or_else(|| anyhow!("no linear memory to place the asyncify stack in"))?;

    let data_addr = match instance.get_typed_func::<i32, i32>(&mut *store, "malloc") {
        Ok(malloc) => {
            let addr = malloc.call(&mut *store, STACK_REGION_SIZE as i32)? as u32;
            if addr != 0 {
                addr
            } else {
                grow_for_stack(store, memory)?
            }
        }
        // no allocator export: carve space past the guest's current heap
        Err(_) => grow_for_stack(store, memory)?,
    };

    let region_end = data_addr
        .checked_add(STACK_REGION_SIZE)
        .ok_or_else(|| anyhow!("asyncify stack region {data_addr:#x} wraps linear memory"))?;
    let data = memory.data_mut(&mut *store);
    let start = data_addr as usize;
    let Some(header) = data.get_mut(start..start + 8) else {
        bail!("asyncify stack region {data_addr:#x} is outside linear memory");
    };
    header[0..4].copy_from_slice(&(data_addr + 8).to_le_bytes());
    header[4..8].copy_from_slice(&region_end.to_le_bytes());

    store.data_mut().asyncify.data_addr = data_addr;
    Ok(data_addr)
}

fn grow_for_stack(store: &mut Store<HostCtx>, memory: wasmtime::Memory) -> Result<u32> {
    let pages = u64::from(STACK_REGION_SIZE).div_ceil(65536);
    let old_pages = memory
        .grow(&mut *store, pages)
        .context("cannot grow linear memory for the asyncify stack")?;
    Ok((old_pages * 65536) as u32)
}

/// Run a transformed guest to completion, suspending on empty stdin and
/// resuming when input arrives. Always yields an exit code.
pub(crate) async fn drive(
    store: &mut Store<HostCtx>,
    instance: Instance,
    entry: TypedFunc<(), ()>,
) -> Result<i32> {
    let exports = AsyncifyExports::resolve(&mut *store, &instance)?;
    setup_stack_region(&mut *store, &instance)?;
    store.data_mut().asyncify.pending = false;
    let stdin = store.data().stdin_queue();

    for _ in 0..MAX_DRIVE_CYCLES {
        // First iteration starts the program. Later iterations only arrive
        // here with the guest in its rewinding state, where the transformed
        // entry fast-forwards the saved stack instead of restarting; the
        // loop never re-invokes a mid-unwind guest.
        let state = match entry.call(&mut *store, ()) {
            Ok(()) => exports.state(&mut *store)?,
            Err(err) => {
                if let Some(exit) = err.downcast_ref::<I32Exit>() {
                    return Ok(exit.0);
                }
                // A throw during replay may be an artifact of the saved
                // stack rather than a real trap: finalize the rewind and
                // accept completion if the guest settles.
                if exports.state(&mut *store).unwrap_or(GuestState::Normal)
                    == GuestState::Rewinding
                {
                    exports.stop_rewind.call(&mut *store, ())?;
                    if exports.state(&mut *store)? == GuestState::Normal
                        && !store.data().asyncify.pending
                    {
                        tracing::debug!("treating rewind-phase throw as completion: {err:#}");
                        return Ok(0);
                    }
                }
                tracing::error!("guest trapped: {err:#}");
                return Ok(1);
            }
        };

        if state == GuestState::Unwinding || store.data().asyncify.pending {
            exports.stop_unwind.call(&mut *store, ())?;
            stdin.ready().await;
            store.data_mut().asyncify.pending = false;
            let data_addr = store.data().asyncify.data_addr;
            exports.start_rewind.call(&mut *store, data_addr as i32)?;
            continue;
        }

        // completed this leg without a fresh suspension
        if state == GuestState::Rewinding {
            exports.stop_rewind.call(&mut *store, ())?;
        }
        return Ok(0);
    }

    tracing::error!(
        "asyncify drive loop did not settle within {MAX_DRIVE_CYCLES} cycles; \
         host/guest protocol mismatch"
    );
    Ok(1)
}
