//! The import surface a Preview-1 command module expects, wired by hand.
//!
//! Generated bindings cannot express the one thing this host is really
//! about: `fd_read` must interleave with the Asyncify side channel (write
//! the zero count, flag the suspension, start the unwind) in an exact
//! order. So the surface is a plain `Linker` population: the
//! `wasi_snapshot_preview1` namespace implements stream I/O, args, clocks,
//! randomness, and exit; the `env` namespace carries the linear memory plus
//! the compatibility tail common toolchains emit unconditionally.

use crate::asyncify::{self, GuestState};
use crate::ctx::HostCtx;
use crate::error::Errno;
use crate::introspect::{MemoryLimits, MAX_MEMORY_PAGES};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use wasmtime::{Caller, FuncType, Linker, Memory, MemoryType, Store, Val, ValType};
use wasmtime_wasi::I32Exit;

// Pages created for a guest that does not declare a memory import.
const DEFAULT_MEMORY_PAGES: u64 = 128;

const WASM_PAGE_SIZE: u64 = 65536;

// Rights bits reported by fd_fdstat_get for the standard descriptors.
const RIGHTS_FD_READ: u64 = 1 << 1;
const RIGHTS_FD_WRITE: u64 = 1 << 6;

/// Define every host function the Preview-1 path provides. The memory
/// import is defined separately by [`create_memory`], once its size is
/// known.
pub fn add_to_linker(linker: &mut Linker<HostCtx>) -> Result<()> {
    add_wasi_snapshot(linker)?;
    add_emscripten_env(linker)?;
    add_syscall_stubs(linker)?;
    Ok(())
}

/// Allocate the linear memory eagerly, sized by the guest's own import
/// declaration (or a safe default), and publish it as `env`/`memory`. The
/// context keeps the handle as its active memory; the loader swaps it for
/// the instance's exported memory after instantiation when one exists.
pub fn create_memory(
    store: &mut Store<HostCtx>,
    linker: &mut Linker<HostCtx>,
    limits: Option<&MemoryLimits>,
) -> Result<Memory> {
    let initial = limits
        .map(|l| l.initial)
        .unwrap_or(DEFAULT_MEMORY_PAGES)
        .min(MAX_MEMORY_PAGES);
    let maximum = limits.and_then(|l| l.maximum).map(|m| m.min(MAX_MEMORY_PAGES));
    let ty = MemoryType::new(initial as u32, maximum.map(|m| m as u32));
    let memory = Memory::new(&mut *store, ty).context("failed to allocate linear memory")?;
    store.data_mut().set_memory(memory);
    linker.define(&mut *store, "env", "memory", memory)?;
    Ok(memory)
}

fn active_memory(caller: &Caller<'_, HostCtx>) -> Result<Memory> {
    caller
        .data()
        .memory
        .ok_or_else(|| anyhow!("no active linear memory for this instance"))
}

// -- raw guest-memory accessors ------------------------------------------

fn range(at: u32, len: u32) -> Result<std::ops::Range<usize>, Errno> {
    let start = at as usize;
    let end = start.checked_add(len as usize).ok_or(Errno::Fault)?;
    Ok(start..end)
}

fn slice<'a>(data: &'a [u8], at: u32, len: u32) -> Result<&'a [u8], Errno> {
    data.get(range(at, len)?).ok_or(Errno::Fault)
}

fn slice_mut<'a>(data: &'a mut [u8], at: u32, len: u32) -> Result<&'a mut [u8], Errno> {
    data.get_mut(range(at, len)?).ok_or(Errno::Fault)
}

fn read_u32_at(data: &[u8], at: u32) -> Result<u32, Errno> {
    Ok(u32::from_le_bytes(slice(data, at, 4)?.try_into().unwrap()))
}

fn write_u32_at(data: &mut [u8], at: u32, value: u32) -> Result<(), Errno> {
    slice_mut(data, at, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn write_u64_at(data: &mut [u8], at: u32, value: u64) -> Result<(), Errno> {
    slice_mut(data, at, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn errno_from(result: Result<(), Errno>) -> i32 {
    match result {
        Ok(()) => Errno::Success.raw(),
        Err(no) => no.raw(),
    }
}

// -- wasi_snapshot_preview1 ----------------------------------------------

fn add_wasi_snapshot(linker: &mut Linker<HostCtx>) -> Result<()> {
    const M: &str = "wasi_snapshot_preview1";

    linker.func_wrap(M, "args_get", args_get)?;
    linker.func_wrap(M, "args_sizes_get", args_sizes_get)?;
    linker.func_wrap(
        M,
        "environ_get",
        |_caller: Caller<'_, HostCtx>, _environ: i32, _buf: i32| -> i32 {
            // the environment is always empty: nothing to write
            Errno::Success.raw()
        },
    )?;
    linker.func_wrap(
        M,
        "environ_sizes_get",
        |mut caller: Caller<'_, HostCtx>, count: i32, size: i32| -> Result<i32> {
            let memory = active_memory(&caller)?;
            let data = memory.data_mut(&mut caller);
            Ok(errno_from(
                write_u32_at(data, count as u32, 0)
                    .and_then(|()| write_u32_at(data, size as u32, 0)),
            ))
        },
    )?;
    linker.func_wrap(M, "clock_time_get", clock_time_get)?;
    linker.func_wrap(M, "clock_res_get", clock_res_get)?;
    linker.func_wrap(M, "random_get", random_get)?;
    linker.func_wrap(M, "fd_read", fd_read)?;
    linker.func_wrap(M, "fd_write", fd_write)?;
    linker.func_wrap(
        M,
        "proc_exit",
        |code: i32| -> Result<()> { Err(anyhow!(I32Exit(code))) },
    )?;
    linker.func_wrap(
        M,
        "fd_seek",
        |_caller: Caller<'_, HostCtx>, fd: i32, _offset: i64, _whence: i32, _new: i32| -> i32 {
            // no seekable descriptors: stdio is a pipe, everything else is closed
            if (0..=2).contains(&fd) {
                Errno::Spipe.raw()
            } else {
                Errno::Badf.raw()
            }
        },
    )?;
    linker.func_wrap(M, "fd_close", |fd: i32| -> i32 {
        if (0..=2).contains(&fd) {
            Errno::Success.raw()
        } else {
            Errno::Badf.raw()
        }
    })?;
    linker.func_wrap(M, "fd_fdstat_get", fd_fdstat_get)?;
    linker.func_wrap(M, "fd_prestat_get", |_fd: i32, _out: i32| -> i32 {
        // no preopened directories; Badf ends wasi-libc's startup probe
        Errno::Badf.raw()
    })?;
    linker.func_wrap(
        M,
        "fd_prestat_dir_name",
        |_fd: i32, _path: i32, _len: i32| -> i32 { Errno::Badf.raw() },
    )?;
    linker.func_wrap(
        M,
        "path_open",
        |_caller: Caller<'_, HostCtx>,
         _dirfd: i32,
         _dirflags: i32,
         _path: i32,
         _path_len: i32,
         _oflags: i32,
         _rights_base: i64,
         _rights_inheriting: i64,
         _fdflags: i32,
         _fd_out: i32|
         -> i32 { Errno::Noent.raw() },
    )?;
    linker.func_wrap(M, "sched_yield", || -> i32 { Errno::Success.raw() })?;
    Ok(())
}

fn args_get(mut caller: Caller<'_, HostCtx>, argv: i32, argv_buf: i32) -> Result<i32> {
    let memory = active_memory(&caller)?;
    let (data, ctx) = memory.data_and_store_mut(&mut caller);
    Ok(errno_from(
        ctx.args.write_to_guest(data, argv as u32, argv_buf as u32),
    ))
}

fn args_sizes_get(mut caller: Caller<'_, HostCtx>, count: i32, size: i32) -> Result<i32> {
    let memory = active_memory(&caller)?;
    let (data, ctx) = memory.data_and_store_mut(&mut caller);
    Ok(errno_from(
        write_u32_at(data, count as u32, ctx.args.number_elements())
            .and_then(|()| write_u32_at(data, size as u32, ctx.args.cumulative_size())),
    ))
}

fn clock_time_get(
    mut caller: Caller<'_, HostCtx>,
    id: i32,
    _precision: i64,
    out: i32,
) -> Result<i32> {
    let memory = active_memory(&caller)?;
    let (data, ctx) = memory.data_and_store_mut(&mut caller);
    let now = match id {
        0 => ctx.clocks.wall.now().as_nanos() as u64,
        1 => ctx.clocks.monotonic.now(),
        _ => return Ok(Errno::Badf.raw()),
    };
    Ok(errno_from(write_u64_at(data, out as u32, now)))
}

fn clock_res_get(mut caller: Caller<'_, HostCtx>, id: i32, out: i32) -> Result<i32> {
    let memory = active_memory(&caller)?;
    let (data, ctx) = memory.data_and_store_mut(&mut caller);
    let resolution = match id {
        0 => ctx.clocks.wall.resolution().as_nanos() as u64,
        1 => ctx.clocks.monotonic.resolution(),
        _ => return Ok(Errno::Badf.raw()),
    };
    Ok(errno_from(write_u64_at(data, out as u32, resolution)))
}

fn random_get(mut caller: Caller<'_, HostCtx>, buf: i32, len: i32) -> Result<i32> {
    let memory = active_memory(&caller)?;
    let (data, ctx) = memory.data_and_store_mut(&mut caller);
    let dst = match slice_mut(data, buf as u32, len as u32) {
        Ok(dst) => dst,
        Err(no) => return Ok(no.raw()),
    };
    Ok(match ctx.random.get(dst) {
        Ok(()) => Errno::Success.raw(),
        Err(_) => Errno::Io.raw(),
    })
}

fn fd_write(
    mut caller: Caller<'_, HostCtx>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nwritten: i32,
) -> Result<i32> {
    let memory = active_memory(&caller)?;
    let (data, ctx) = memory.data_and_store_mut(&mut caller);
    let writer = match fd {
        1 => &ctx.stdout,
        2 => &ctx.stderr,
        _ => return Ok(Errno::Badf.raw()),
    };
    let result = (|| -> Result<(), Errno> {
        let mut total: u32 = 0;
        for i in 0..iovs_len as u32 {
            let entry = (iovs as u32)
                .checked_add(i.checked_mul(8).ok_or(Errno::Overflow)?)
                .ok_or(Errno::Overflow)?;
            let buf = read_u32_at(data, entry)?;
            let len = read_u32_at(data, entry.checked_add(4).ok_or(Errno::Overflow)?)?;
            let bytes = slice(data, buf, len)?;
            if !bytes.is_empty() {
                // ordering is the writer's problem; the guest sees the
                // write as already complete
                writer.write(Bytes::copy_from_slice(bytes));
            }
            total = total.checked_add(len).ok_or(Errno::Overflow)?;
        }
        write_u32_at(data, nwritten as u32, total)
    })();
    Ok(errno_from(result))
}

fn fd_read(
    mut caller: Caller<'_, HostCtx>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nread: i32,
) -> Result<i32> {
    if fd != 0 {
        return Ok(Errno::Badf.raw());
    }
    let memory = active_memory(&caller)?;
    let asyncify_enabled = caller.data().asyncify.enabled;

    // a read issued during stack replay finalizes the rewind first, so the
    // retry below observes the guest back in its normal state
    if asyncify_enabled && asyncify::guest_state(&mut caller)? == GuestState::Rewinding {
        asyncify::stop_rewind(&mut caller)?;
    }

    let queue = caller.data().stdin_queue();
    if !queue.has_data() && !queue.is_closed() {
        let data_addr = caller.data().asyncify.data_addr;
        if asyncify_enabled && data_addr != 0 {
            // nread must land before the unwind so that replay sees
            // consistent memory
            {
                let data = memory.data_mut(&mut caller);
                if let Err(no) = write_u32_at(data, nread as u32, 0) {
                    return Ok(no.raw());
                }
            }
            caller.data_mut().asyncify.pending = true;
            asyncify::start_unwind(&mut caller, data_addr)?;
            return Ok(Errno::Success.raw());
        }
        // no way to suspend a synchronous guest: report "would block"
        return Ok(Errno::Again.raw());
    }

    let data = memory.data_mut(&mut caller);
    let result = (|| -> Result<(), Errno> {
        let mut total: u32 = 0;
        for i in 0..iovs_len as u32 {
            let entry = (iovs as u32)
                .checked_add(i.checked_mul(8).ok_or(Errno::Overflow)?)
                .ok_or(Errno::Overflow)?;
            let buf = read_u32_at(data, entry)?;
            let len = read_u32_at(data, entry.checked_add(4).ok_or(Errno::Overflow)?)?;
            let dst = slice_mut(data, buf, len)?;
            let n = queue.read(dst) as u32;
            total = total.checked_add(n).ok_or(Errno::Overflow)?;
            if n < len {
                break;
            }
        }
        write_u32_at(data, nread as u32, total)
    })();
    Ok(errno_from(result))
}

fn fd_fdstat_get(mut caller: Caller<'_, HostCtx>, fd: i32, out: i32) -> Result<i32> {
    if !(0..=2).contains(&fd) {
        return Ok(Errno::Badf.raw());
    }
    let memory = active_memory(&caller)?;
    let data = memory.data_mut(&mut caller);
    let rights = if fd == 0 {
        RIGHTS_FD_READ
    } else {
        RIGHTS_FD_WRITE
    };
    let result = (|| -> Result<(), Errno> {
        let stat = slice_mut(data, out as u32, 24)?;
        stat.fill(0);
        stat[0] = 2; // character_device
        stat[8..16].copy_from_slice(&rights.to_le_bytes());
        stat[16..24].copy_from_slice(&rights.to_le_bytes());
        Ok(())
    })();
    Ok(errno_from(result))
}

// -- env: Emscripten utility imports -------------------------------------

enum ConsoleLevel {
    Info,
    Warn,
    Error,
}

fn guest_console(caller: &mut Caller<'_, HostCtx>, msg: i32, level: ConsoleLevel) -> Result<()> {
    let memory = active_memory(caller)?;
    let data = memory.data(&caller);
    let text = read_cstr(data, msg as u32);
    match level {
        ConsoleLevel::Info => tracing::info!(target: "guest", "{text}"),
        ConsoleLevel::Warn => tracing::warn!(target: "guest", "{text}"),
        ConsoleLevel::Error => tracing::error!(target: "guest", "{text}"),
    }
    Ok(())
}

fn read_cstr(data: &[u8], at: u32) -> String {
    let Some(tail) = data.get(at as usize..) else {
        return String::new();
    };
    let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
    String::from_utf8_lossy(&tail[..end]).into_owned()
}

fn add_emscripten_env(linker: &mut Linker<HostCtx>) -> Result<()> {
    linker.func_wrap(
        "env",
        "emscripten_console_log",
        |mut caller: Caller<'_, HostCtx>, msg: i32| -> Result<()> {
            guest_console(&mut caller, msg, ConsoleLevel::Info)
        },
    )?;
    linker.func_wrap(
        "env",
        "emscripten_console_warn",
        |mut caller: Caller<'_, HostCtx>, msg: i32| -> Result<()> {
            guest_console(&mut caller, msg, ConsoleLevel::Warn)
        },
    )?;
    linker.func_wrap(
        "env",
        "emscripten_console_error",
        |mut caller: Caller<'_, HostCtx>, msg: i32| -> Result<()> {
            guest_console(&mut caller, msg, ConsoleLevel::Error)
        },
    )?;
    linker.func_wrap(
        "env",
        "emscripten_date_now",
        |caller: Caller<'_, HostCtx>| -> f64 {
            caller.data().clocks.wall.now().as_secs_f64() * 1000.0
        },
    )?;
    linker.func_wrap(
        "env",
        "emscripten_get_now",
        |caller: Caller<'_, HostCtx>| -> f64 {
            caller.data().clocks.monotonic.now() as f64 / 1_000_000.0
        },
    )?;
    linker.func_wrap(
        "env",
        "emscripten_get_heap_max",
        |mut caller: Caller<'_, HostCtx>| -> Result<i32> {
            let memory = active_memory(&caller)?;
            let max_pages = memory
                .ty(&mut caller)
                .maximum()
                .unwrap_or(MAX_MEMORY_PAGES / 2);
            Ok((max_pages * WASM_PAGE_SIZE).min(0x7fff_0000) as i32)
        },
    )?;
    linker.func_wrap(
        "env",
        "emscripten_resize_heap",
        |mut caller: Caller<'_, HostCtx>, requested: i32| -> Result<i32> {
            let memory = active_memory(&caller)?;
            let requested = requested as u32 as u64;
            let current = memory.data_size(&caller) as u64;
            if requested <= current {
                return Ok(1);
            }
            let delta = (requested - current).div_ceil(WASM_PAGE_SIZE);
            match memory.grow(&mut caller, delta) {
                Ok(_) => Ok(1),
                Err(e) => {
                    tracing::warn!("guest heap growth to {requested} bytes refused: {e}");
                    Ok(0)
                }
            }
        },
    )?;
    for name in ["emscripten_memcpy_big", "_emscripten_memcpy_js"] {
        linker.func_wrap(
            "env",
            name,
            |mut caller: Caller<'_, HostCtx>, dest: i32, src: i32, len: i32| -> Result<()> {
                let memory = active_memory(&caller)?;
                let data = memory.data_mut(&mut caller);
                let src_range = range(src as u32, len as u32).map_err(|e| anyhow!(e))?;
                if src_range.end > data.len() || range(dest as u32, len as u32).map_err(|e| anyhow!(e))?.end > data.len() {
                    bail!("memcpy out of bounds");
                }
                data.copy_within(src_range, dest as u32 as usize);
                Ok(())
            },
        )?;
    }
    linker.func_wrap(
        "env",
        "_tzset_js",
        |mut caller: Caller<'_, HostCtx>,
         timezone: i32,
         daylight: i32,
         std_name: i32,
         dst_name: i32|
         -> Result<()> {
            // this host lives in UTC
            let memory = active_memory(&caller)?;
            let data = memory.data_mut(&mut caller);
            let result = (|| -> Result<(), Errno> {
                write_u32_at(data, timezone as u32, 0)?;
                write_u32_at(data, daylight as u32, 0)?;
                slice_mut(data, std_name as u32, 4)?.copy_from_slice(b"UTC\0");
                slice_mut(data, dst_name as u32, 4)?.copy_from_slice(b"UTC\0");
                Ok(())
            })();
            result.map_err(|no| anyhow!(no))
        },
    )?;
    for name in ["_localtime_js", "_gmtime_js"] {
        linker.func_wrap(
            "env",
            name,
            |mut caller: Caller<'_, HostCtx>, time: i64, tm: i32| -> Result<()> {
                let memory = active_memory(&caller)?;
                let data = memory.data_mut(&mut caller);
                write_tm(data, tm as u32, time).map_err(|no| anyhow!(no))
            },
        )?;
    }
    linker.func_wrap(
        "env",
        "_mktime_js",
        |mut caller: Caller<'_, HostCtx>, tm: i32| -> Result<f64> {
            let memory = active_memory(&caller)?;
            let data = memory.data(&caller);
            read_tm_as_epoch(data, tm as u32).map_err(|no| anyhow!(no))
        },
    )?;
    linker.func_wrap(
        "env",
        "_mmap_js",
        |_len: i32, _prot: i32, _flags: i32, _fd: i32, _offset: i64, _allocated: i32, _addr: i32| -> i32 {
            -Errno::Nosys.raw()
        },
    )?;
    linker.func_wrap(
        "env",
        "_munmap_js",
        |_addr: i32, _len: i32, _prot: i32, _flags: i32, _fd: i32, _offset: i64| -> i32 {
            -Errno::Nosys.raw()
        },
    )?;
    linker.func_wrap("env", "abort", || -> Result<()> {
        Err(anyhow!("abort() called by guest"))
    })?;
    linker.func_wrap("env", "_abort_js", || -> Result<()> {
        Err(anyhow!("abort() called by guest"))
    })?;
    linker.func_wrap(
        "env",
        "__assert_fail",
        |mut caller: Caller<'_, HostCtx>, cond: i32, file: i32, line: i32, func: i32| -> Result<()> {
            let memory = active_memory(&caller)?;
            let data = memory.data(&caller);
            let cond = read_cstr(data, cond as u32);
            let file = read_cstr(data, file as u32);
            let func = read_cstr(data, func as u32);
            Err(anyhow!(
                "guest assertion failed: {cond} ({file}:{line}, in {func})"
            ))
        },
    )?;
    linker.func_wrap("env", "_emscripten_throw_longjmp", || -> Result<()> {
        Err(anyhow!("longjmp is not supported by this host"))
    })?;
    linker.func_wrap(
        "env",
        "getentropy",
        |mut caller: Caller<'_, HostCtx>, buf: i32, len: i32| -> Result<i32> {
            let memory = active_memory(&caller)?;
            let (data, ctx) = memory.data_and_store_mut(&mut caller);
            let dst = match slice_mut(data, buf as u32, len as u32) {
                Ok(dst) => dst,
                Err(no) => return Ok(-no.raw()),
            };
            Ok(match ctx.random.get(dst) {
                Ok(()) => 0,
                Err(_) => -Errno::Io.raw(),
            })
        },
    )?;
    Ok(())
}

// -- env: legacy syscall stubs -------------------------------------------

/// What a stubbed syscall answers. The host is sandboxed and single-user:
/// nothing exists, mutations of ownership/permissions quietly succeed, and
/// identity is fixed.
#[derive(Clone, Copy)]
enum StubPolicy {
    /// Query fails with the given errno (returned negated, syscall-style).
    Fail(Errno),
    /// No-op success.
    Ok,
    /// Fixed return value.
    Fixed(i32),
    /// Write "/" into (buf, size) and return the byte count.
    Getcwd,
}

const SYSCALL_STUBS: &[(&str, usize, StubPolicy)] = &[
    // existence / permission queries: nothing to find
    ("__syscall_stat64", 2, StubPolicy::Fail(Errno::Noent)),
    ("__syscall_lstat64", 2, StubPolicy::Fail(Errno::Noent)),
    ("__syscall_fstat64", 2, StubPolicy::Fail(Errno::Badf)),
    ("__syscall_newfstatat", 4, StubPolicy::Fail(Errno::Noent)),
    ("__syscall_faccessat", 4, StubPolicy::Fail(Errno::Noent)),
    ("__syscall_openat", 4, StubPolicy::Fail(Errno::Noent)),
    ("__syscall_readlinkat", 4, StubPolicy::Fail(Errno::Noent)),
    ("__syscall_unlinkat", 3, StubPolicy::Fail(Errno::Noent)),
    ("__syscall_renameat", 4, StubPolicy::Fail(Errno::Noent)),
    ("__syscall_rmdir", 1, StubPolicy::Fail(Errno::Noent)),
    ("__syscall_mkdirat", 3, StubPolicy::Fail(Errno::Perm)),
    ("__syscall_dup", 1, StubPolicy::Fail(Errno::Badf)),
    ("__syscall_dup3", 3, StubPolicy::Fail(Errno::Badf)),
    // ownership / permission mutations: quietly succeed
    ("__syscall_chmod", 2, StubPolicy::Ok),
    ("__syscall_fchmod", 2, StubPolicy::Ok),
    ("__syscall_fchmodat", 4, StubPolicy::Ok),
    ("__syscall_chown32", 3, StubPolicy::Ok),
    ("__syscall_fchown32", 3, StubPolicy::Ok),
    ("__syscall_fchownat", 5, StubPolicy::Ok),
    ("__syscall_ioctl", 3, StubPolicy::Ok),
    ("__syscall_fcntl64", 3, StubPolicy::Ok),
    // fixed identity: pid 1, uid/gid 0
    ("__syscall_getpid", 0, StubPolicy::Fixed(1)),
    ("__syscall_getuid32", 0, StubPolicy::Fixed(0)),
    ("__syscall_getgid32", 0, StubPolicy::Fixed(0)),
    ("__syscall_geteuid32", 0, StubPolicy::Fixed(0)),
    ("__syscall_getegid32", 0, StubPolicy::Fixed(0)),
    ("__syscall_getcwd", 2, StubPolicy::Getcwd),
];

fn add_syscall_stubs(linker: &mut Linker<HostCtx>) -> Result<()> {
    let engine = linker.engine().clone();
    for (name, arity, policy) in SYSCALL_STUBS {
        let params = std::iter::repeat(ValType::I32).take(*arity);
        let ty = FuncType::new(&engine, params, [ValType::I32]);
        let policy = *policy;
        linker.func_new(
            "env",
            name,
            ty,
            move |mut caller, params, results| {
                results[0] = Val::I32(match policy {
                    StubPolicy::Fail(no) => -no.raw(),
                    StubPolicy::Ok => 0,
                    StubPolicy::Fixed(v) => v,
                    StubPolicy::Getcwd => syscall_getcwd(&mut caller, params)?,
                });
                Ok(())
            },
        )?;
    }
    Ok(())
}

fn syscall_getcwd(caller: &mut Caller<'_, HostCtx>, params: &[Val]) -> Result<i32> {
    let buf = params[0].unwrap_i32() as u32;
    let size = params[1].unwrap_i32() as u32;
    if size < 2 {
        return Ok(-Errno::Range.raw());
    }
    let memory = active_memory(caller)?;
    let data = memory.data_mut(&mut *caller);
    match slice_mut(data, buf, 2) {
        Ok(dst) => {
            dst.copy_from_slice(b"/\0");
            Ok(2)
        }
        Err(no) => Ok(-no.raw()),
    }
}

// -- UTC civil-time conversion for the Emscripten date imports -----------

// Howard Hinnant's civil-from-days; the host has no timezone database, so
// local time and UTC coincide.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719468;
    let era = (if z >= 0 { z } else { z - 146096 }) / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe as i64 + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = year - if month <= 2 { 1 } else { 0 };
    let era = (if year >= 0 { year } else { year - 399 }) / 400;
    let yoe = (year - era * 400) as u64;
    let mp = if month > 2 { month - 3 } else { month + 9 } as u64;
    let doy = (153 * mp + 2) / 5 + day as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe as i64 - 719468
}

fn write_tm(data: &mut [u8], tm: u32, epoch_seconds: i64) -> Result<(), Errno> {
    let days = epoch_seconds.div_euclid(86400);
    let rem = epoch_seconds.rem_euclid(86400);
    let (year, month, day) = civil_from_days(days);
    let yday = days - days_from_civil(year, 1, 1);
    let wday = (days + 4).rem_euclid(7); // 1970-01-01 was a Thursday

    let fields: [i64; 9] = [
        rem % 60,          // tm_sec
        (rem / 60) % 60,   // tm_min
        rem / 3600,        // tm_hour
        day as i64,        // tm_mday
        month as i64 - 1,  // tm_mon
        year - 1900,       // tm_year
        wday,              // tm_wday
        yday,              // tm_yday
        0,                 // tm_isdst
    ];
    for (i, field) in fields.iter().enumerate() {
        let at = tm.checked_add(4 * i as u32).ok_or(Errno::Fault)?;
        write_u32_at(data, at, *field as i32 as u32)?;
    }
    // tm_gmtoff
    write_u32_at(data, tm.checked_add(36).ok_or(Errno::Fault)?, 0)
}

fn read_tm_as_epoch(data: &[u8], tm: u32) -> Result<f64, Errno> {
    let field = |i: u32| -> Result<i64, Errno> {
        let at = tm.checked_add(4 * i).ok_or(Errno::Fault)?;
        Ok(read_u32_at(data, at)? as i32 as i64)
    };
    let (sec, min, hour) = (field(0)?, field(1)?, field(2)?);
    let (mday, mon, year) = (field(3)?, field(4)?, field(5)?);
    let days = days_from_civil(year + 1900, (mon + 1) as u32, mday as u32);
    Ok((days * 86400 + hour * 3600 + min * 60 + sec) as f64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn civil_time_round_trips() {
        // 2026-08-07 12:34:56 UTC
        let t = 1_786_106_096i64;
        let days = t.div_euclid(86400);
        let (y, m, d) = civil_from_days(days);
        assert_eq!(days_from_civil(y, m, d), days);
        assert_eq!((y, m, d), (2026, 8, 7));
    }

    #[test]
    fn epoch_day_zero_is_thursday() {
        let (y, m, d) = civil_from_days(0);
        assert_eq!((y, m, d), (1970, 1, 1));
        assert_eq!((0i64 + 4).rem_euclid(7), 4);
    }

    #[test]
    fn tm_round_trip_through_guest_memory() {
        let mut data = vec![0u8; 64];
        let t = 86400 + 3661; // 1970-01-02 01:01:01 UTC
        write_tm(&mut data, 0, t).unwrap();
        assert_eq!(read_tm_as_epoch(&data, 0).unwrap(), t as f64);
    }
}
