//! C ABI consumed by the host engine.
//!
//! Every entry point returns `0` on success or a [`LoliError::code`]; a panic caught at the
//! boundary is reported as `-1`. Nothing here aborts the host.
#![allow(non_snake_case)]

use std::{
    ffi::CStr,
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    time::Duration,
};

use libc::{c_char, c_int, c_uint};

use crate::{
    config::{HookConfig, LoliConf},
    error::{LoliError, Result},
    exporter::{default_dump_path, dump_smaps, AutoDump},
    profiler,
};

/// Read when `loliHookFromConf` is given no path.
pub const DEFAULT_CONF_PATH: &str = "/data/local/tmp/loli.conf";

fn init_logger() {
    _ = pretty_env_logger::try_init();
}

fn call<F>(name: &str, f: F) -> c_int
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            log::error!("{} failed, code {}: {}", name, err.code(), err);
            err.code()
        }
        Err(_) => {
            log::error!("{} panicked", name);
            -1
        }
    }
}

/// `None` for a null pointer, an error for non UTF-8 content.
unsafe fn optional_str<'a>(value: *const c_char, what: &str) -> Result<Option<&'a str>> {
    if value.is_null() {
        return Ok(None);
    }

    CStr::from_ptr(value)
        .to_str()
        .map(Some)
        .map_err(|_| LoliError::InvalidArgument(format!("{} is not utf-8", what)))
}

unsafe fn required_str<'a>(value: *const c_char, what: &str) -> Result<&'a str> {
    match optional_str(value, what)? {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(LoliError::InvalidArgument(format!("{} is empty", what))),
    }
}

/// Install the allocation hooks over the comma separated libraries in `soNames`.
///
/// A negative `minRecSize` records every allocation.
#[no_mangle]
pub unsafe extern "C" fn loliHook(minRecSize: c_int, soNames: *const c_char) -> c_int {
    init_logger();

    call("loliHook", || {
        let so_names = required_str(soNames, "soNames")?;

        let config = HookConfig::new(minRecSize.max(0) as usize, so_names);

        if config.libraries().is_empty() {
            return Err(LoliError::InvalidArgument("soNames lists no library".into()));
        }

        profiler::install(config).map(|_| ())
    })
}

/// Read the [`LoliConf`] at `confPath` (or [`DEFAULT_CONF_PATH`]) and install once its delay has
/// passed, on a background thread.
#[no_mangle]
pub unsafe extern "C" fn loliHookFromConf(confPath: *const c_char) -> c_int {
    init_logger();

    call("loliHookFromConf", || {
        let path = optional_str(confPath, "confPath")?
            .filter(|path| !path.is_empty())
            .unwrap_or(DEFAULT_CONF_PATH);

        profiler::install_deferred(LoliConf::load(path)?)
    })
}

/// Per host frame.
#[no_mangle]
pub extern "C" fn loliTick() {
    call("loliTick", || {
        profiler::tick();
        Ok(())
    });
}

/// Export the live allocations to `path`, a null or empty `path` picks a timestamped file in the
/// working directory.
#[no_mangle]
pub unsafe extern "C" fn loliDump(append: bool, path: *const c_char) -> c_int {
    call("loliDump", || {
        let path = match optional_str(path, "path")? {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => default_dump_path(),
        };

        profiler::dump(append, path).map(|_| ())
    })
}

/// Dump to `path` from `loliTick` every `intervalMs`, `0` cancels.
#[no_mangle]
pub unsafe extern "C" fn loliSetAutoDump(
    path: *const c_char,
    intervalMs: c_uint,
    append: bool,
) -> c_int {
    call("loliSetAutoDump", || {
        if intervalMs == 0 {
            return profiler::set_auto_dump(None);
        }

        let path = required_str(path, "path")?;

        profiler::set_auto_dump(Some(AutoDump {
            path: PathBuf::from(path),
            interval: Duration::from_millis(intervalMs as u64),
            append,
        }))
    })
}

/// Copy the memory map of the process to `path`.
#[no_mangle]
pub unsafe extern "C" fn loliDumpSmaps(path: *const c_char) -> c_int {
    call("loliDumpSmaps", || dump_smaps(required_str(path, "path")?))
}
