//! Redirection of allocator imports to the recording trampolines.
//!
//! The recorder and the exporter only see the [`Interceptor`] trait; how the redirection is done
//! is private to the implementation ([`GotInterceptor`] rewrites global offset table slots).

mod elf;
mod hooks;

pub use elf::*;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Allocator entry points routed through the recorder.
pub const HOOKED_SYMBOLS: [&str; 6] = [
    "malloc",
    "calloc",
    "realloc",
    "memalign",
    "posix_memalign",
    "free",
];

/// Address of the trampoline standing in for `symbol`.
pub(crate) fn trampoline(symbol: &str) -> Option<usize> {
    let hook = match symbol {
        "malloc" => hooks::loli_malloc as usize,
        "calloc" => hooks::loli_calloc as usize,
        "realloc" => hooks::loli_realloc as usize,
        "memalign" => hooks::loli_memalign as usize,
        "posix_memalign" => hooks::loli_posix_memalign as usize,
        "free" => hooks::loli_free as usize,
        _ => return None,
    };

    Some(hook)
}

/// Outcome of a successful install, per library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    pub libraries: Vec<LibraryReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryReport {
    pub name: String,
    pub path: String,
    /// Symbols whose slots now point at a trampoline, one entry per slot.
    pub patched: Vec<String>,
}

impl InstallReport {
    pub fn patched_slots(&self) -> usize {
        self.libraries.iter().map(|lib| lib.patched.len()).sum()
    }
}

/// A strategy for routing the allocator calls of named shared libraries through the trampolines.
pub trait Interceptor: Send + Sync {
    /// Hook every library in `libraries`. On error no slot is left redirected, whether a library
    /// was missing or a write failed halfway.
    fn install(&self, libraries: &[String]) -> Result<InstallReport>;
}
