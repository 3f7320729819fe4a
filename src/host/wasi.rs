// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A minimal `wasi_snapshot_preview1` import surface.
//!
//! These are thin adapters between guest memory and the per-instance
//! capability set from [`InstanceConfig`]: byte-stream stdio, args/environ,
//! a random source and two clocks. `proc_exit` surfaces as
//! [`Error::Exit`] carrying the guest's exit code.

use crate::config::{ClockFn, InstanceConfig};
use crate::errors::Error;
use crate::func::Caller;
use crate::linker::Linker;
use crate::types::{FuncType, ValType};
use crate::vm::VMVal;
use rand_core::RngCore;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;

const WASI_MODULE: &str = "wasi_snapshot_preview1";

// The errno subset these shims produce.
const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;
const ERRNO_FAULT: i32 = 21;
const ERRNO_INVAL: i32 = 28;
const ERRNO_IO: i32 = 29;

/// Per-instance system-interface state, built from the instantiation
/// configuration. Omitted options default to discarding sinks and empty
/// sources.
pub struct WasiCtx {
    pub(crate) name: Option<String>,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<Box<dyn Read + Send>>,
    stdout: Option<Box<dyn Write + Send>>,
    stderr: Option<Box<dyn Write + Send>>,
    random: Box<dyn RngCore + Send>,
    wall_clock: ClockFn,
    monotonic_clock: ClockFn,
}

impl core::fmt::Debug for WasiCtx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WasiCtx")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl WasiCtx {
    pub(crate) fn new(config: InstanceConfig) -> Self {
        let monotonic_base = Instant::now();
        Self {
            name: config.name,
            args: config.args,
            env: config.env,
            stdin: config.stdin,
            stdout: config.stdout,
            stderr: config.stderr,
            random: config
                .random
                .unwrap_or_else(|| Box::new(rand_core::OsRng)),
            wall_clock: config
                .wall_clock
                .unwrap_or_else(|| Box::new(InstanceConfig::default_wall_clock)),
            monotonic_clock: config.monotonic_clock.unwrap_or_else(move || {
                Box::new(move || {
                    u64::try_from(monotonic_base.elapsed().as_nanos()).unwrap_or(u64::MAX)
                })
            }),
        }
    }

    fn writer(&mut self, fd: i32) -> Option<&mut (dyn Write + Send + 'static)> {
        match fd {
            1 => self.stdout.as_deref_mut(),
            2 => self.stderr.as_deref_mut(),
            _ => None,
        }
    }
}

// ===== guest-memory accessors =====

fn mem_range(mem: &[u8], addr: u32, len: u32) -> Result<core::ops::Range<usize>, i32> {
    let start = addr as usize;
    let end = start.checked_add(len as usize).ok_or(ERRNO_FAULT)?;
    if end > mem.len() {
        return Err(ERRNO_FAULT);
    }
    Ok(start..end)
}

fn read_u32(mem: &[u8], addr: u32) -> Result<u32, i32> {
    let range = mem_range(mem, addr, 4)?;
    Ok(u32::from_le_bytes(mem[range].try_into().unwrap()))
}

fn write_u32(mem: &mut [u8], addr: u32, value: u32) -> Result<(), i32> {
    let range = mem_range(mem, addr, 4)?;
    mem[range].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn write_u64(mem: &mut [u8], addr: u32, value: u64) -> Result<(), i32> {
    let range = mem_range(mem, addr, 8)?;
    mem[range].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Runs `f` with the caller's wasi context and memory, translating a missing
/// context or memory into `EBADF`-style failures and mapping the inner errno
/// result onto the single `i32` wasi result.
fn with_ctx(
    caller: &mut Caller<'_>,
    results: &mut [VMVal],
    f: impl FnOnce(&mut WasiCtx, &mut [u8]) -> Result<(), i32>,
) -> crate::Result<()> {
    let Some(mut wasi) = caller.take_wasi() else {
        results[0] = VMVal::i32(ERRNO_INVAL);
        return Ok(());
    };
    let errno = match caller.memory_mut() {
        Some(memory) => match f(&mut wasi, memory) {
            Ok(()) => ERRNO_SUCCESS,
            Err(errno) => errno,
        },
        None => ERRNO_FAULT,
    };
    caller.put_back_wasi(wasi);
    results[0] = VMVal::i32(errno);
    Ok(())
}

/// Registers the `wasi_snapshot_preview1` shims on `linker`.
pub fn define_wasi(linker: &mut Linker) -> crate::Result<()> {
    use ValType::{I32, I64};

    // proc_exit(code) -> !
    linker.define_host_raw(
        WASI_MODULE,
        "proc_exit",
        FuncType::new([I32], []),
        Arc::new(|_caller, params, _results| {
            Err(Error::Exit {
                code: params[0].get_i32() as u32,
            })
        }),
    )?;

    // fd_write(fd, iovs, iovs_len, nwritten) -> errno
    linker.define_host_raw(
        WASI_MODULE,
        "fd_write",
        FuncType::new([I32, I32, I32, I32], [I32]),
        Arc::new(|caller, params, results| {
            let (fd, iovs, iovs_len, nwritten_ptr) = (
                params[0].get_i32(),
                params[1].get_i32() as u32,
                params[2].get_i32() as u32,
                params[3].get_i32() as u32,
            );
            with_ctx(caller, results, |wasi, mem| {
                let writer = wasi.writer(fd).ok_or(ERRNO_BADF)?;
                let mut written = 0u32;
                for i in 0..iovs_len {
                    let base = read_u32(mem, iovs + i * 8)?;
                    let len = read_u32(mem, iovs + i * 8 + 4)?;
                    let range = mem_range(mem, base, len)?;
                    writer.write_all(&mem[range]).map_err(|_| ERRNO_IO)?;
                    written += len;
                }
                writer.flush().map_err(|_| ERRNO_IO)?;
                write_u32(mem, nwritten_ptr, written)
            })
        }),
    )?;

    // fd_read(fd, iovs, iovs_len, nread) -> errno
    linker.define_host_raw(
        WASI_MODULE,
        "fd_read",
        FuncType::new([I32, I32, I32, I32], [I32]),
        Arc::new(|caller, params, results| {
            let (fd, iovs, iovs_len, nread_ptr) = (
                params[0].get_i32(),
                params[1].get_i32() as u32,
                params[2].get_i32() as u32,
                params[3].get_i32() as u32,
            );
            with_ctx(caller, results, |wasi, mem| {
                if fd != 0 {
                    return Err(ERRNO_BADF);
                }
                let mut total = 0u32;
                for i in 0..iovs_len {
                    let base = read_u32(mem, iovs + i * 8)?;
                    let len = read_u32(mem, iovs + i * 8 + 4)?;
                    let range = mem_range(mem, base, len)?;
                    let n = match wasi.stdin.as_deref_mut() {
                        Some(stdin) => stdin.read(&mut mem[range]).map_err(|_| ERRNO_IO)?,
                        // The default stdin is an empty source.
                        None => 0,
                    };
                    total += u32::try_from(n).unwrap();
                    if n < len as usize {
                        break;
                    }
                }
                write_u32(mem, nread_ptr, total)
            })
        }),
    )?;

    // args_sizes_get(argc, argv_buf_size) -> errno
    linker.define_host_raw(
        WASI_MODULE,
        "args_sizes_get",
        FuncType::new([I32, I32], [I32]),
        Arc::new(|caller, params, results| {
            let (argc_ptr, size_ptr) = (params[0].get_i32() as u32, params[1].get_i32() as u32);
            with_ctx(caller, results, |wasi, mem| {
                let count = u32::try_from(wasi.args.len()).unwrap();
                let size: usize = wasi.args.iter().map(|a| a.len() + 1).sum();
                write_u32(mem, argc_ptr, count)?;
                write_u32(mem, size_ptr, u32::try_from(size).unwrap())
            })
        }),
    )?;

    // args_get(argv, argv_buf) -> errno
    linker.define_host_raw(
        WASI_MODULE,
        "args_get",
        FuncType::new([I32, I32], [I32]),
        Arc::new(|caller, params, results| {
            let (argv, mut buf) = (params[0].get_i32() as u32, params[1].get_i32() as u32);
            with_ctx(caller, results, |wasi, mem| {
                for (i, arg) in wasi.args.iter().enumerate() {
                    write_u32(mem, argv + u32::try_from(i).unwrap() * 4, buf)?;
                    let bytes = arg.as_bytes();
                    let range = mem_range(mem, buf, u32::try_from(bytes.len() + 1).unwrap())?;
                    mem[range.start..range.end - 1].copy_from_slice(bytes);
                    mem[range.end - 1] = 0;
                    buf += u32::try_from(bytes.len() + 1).unwrap();
                }
                Ok(())
            })
        }),
    )?;

    // environ_sizes_get(count, buf_size) -> errno
    linker.define_host_raw(
        WASI_MODULE,
        "environ_sizes_get",
        FuncType::new([I32, I32], [I32]),
        Arc::new(|caller, params, results| {
            let (count_ptr, size_ptr) = (params[0].get_i32() as u32, params[1].get_i32() as u32);
            with_ctx(caller, results, |wasi, mem| {
                let count = u32::try_from(wasi.env.len()).unwrap();
                let size: usize = wasi.env.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
                write_u32(mem, count_ptr, count)?;
                write_u32(mem, size_ptr, u32::try_from(size).unwrap())
            })
        }),
    )?;

    // environ_get(environ, environ_buf) -> errno
    linker.define_host_raw(
        WASI_MODULE,
        "environ_get",
        FuncType::new([I32, I32], [I32]),
        Arc::new(|caller, params, results| {
            let (environ, mut buf) = (params[0].get_i32() as u32, params[1].get_i32() as u32);
            with_ctx(caller, results, |wasi, mem| {
                for (i, (key, value)) in wasi.env.iter().enumerate() {
                    write_u32(mem, environ + u32::try_from(i).unwrap() * 4, buf)?;
                    let entry = format!("{key}={value}");
                    let bytes = entry.as_bytes();
                    let range = mem_range(mem, buf, u32::try_from(bytes.len() + 1).unwrap())?;
                    mem[range.start..range.end - 1].copy_from_slice(bytes);
                    mem[range.end - 1] = 0;
                    buf += u32::try_from(bytes.len() + 1).unwrap();
                }
                Ok(())
            })
        }),
    )?;

    // random_get(buf, len) -> errno
    linker.define_host_raw(
        WASI_MODULE,
        "random_get",
        FuncType::new([I32, I32], [I32]),
        Arc::new(|caller, params, results| {
            let (buf, len) = (params[0].get_i32() as u32, params[1].get_i32() as u32);
            with_ctx(caller, results, |wasi, mem| {
                let range = mem_range(mem, buf, len)?;
                wasi.random
                    .try_fill_bytes(&mut mem[range])
                    .map_err(|_| ERRNO_IO)
            })
        }),
    )?;

    // clock_time_get(id, precision, time) -> errno
    linker.define_host_raw(
        WASI_MODULE,
        "clock_time_get",
        FuncType::new([I32, I64, I32], [I32]),
        Arc::new(|caller, params, results| {
            let (clock_id, time_ptr) = (params[0].get_i32(), params[2].get_i32() as u32);
            with_ctx(caller, results, |wasi, mem| {
                let now = match clock_id {
                    0 => (wasi.wall_clock)(),
                    1 => (wasi.monotonic_clock)(),
                    _ => return Err(ERRNO_INVAL),
                };
                write_u64(mem, time_ptr, now)
            })
        }),
    )?;

    Ok(())
}
