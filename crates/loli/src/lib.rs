//! A Lightweight Opensource profiLing Instrument for native allocations.
//!
//! `loli` hooks the allocator imports (`malloc`, `calloc`, `realloc`, `memalign`,
//! `posix_memalign`, `free`) of chosen shared libraries, keeps every live block at or above a
//! minimum size together with the call stack that allocated it, and dumps that table to a text
//! file, one `address,size,fingerprint,timestamp` row per block.
//!
//! The library is built as a `cdylib` and driven by the host through the [`ffi`] entry points:
//!
//! ```c
//! loliHook(512, "libil2cpp,libunity");      // once, after the libraries are loaded
//! loliTick();                               // every frame
//! loliDump(false, "/sdcard/loli.csv");      // whenever a snapshot is wanted
//! ```
//!
//! The same operations are available from rust:
//!
//! ```no_run
//! use loli::{HookConfig, install, dump};
//!
//! install(HookConfig::new(512, "libil2cpp,libunity")).unwrap();
//!
//! loop {
//!     // working...
//!     dump(false, "loli.csv").unwrap();
//! }
//! ```

mod helper;

mod config;
pub use config::*;

mod error;
pub use error::*;

mod fingerprint;
pub use fingerprint::*;

mod store;
pub use store::*;

mod recorder;
pub use recorder::*;

mod exporter;
pub use exporter::*;

pub mod interceptor;

mod profiler;
pub use profiler::*;

pub mod ffi;
