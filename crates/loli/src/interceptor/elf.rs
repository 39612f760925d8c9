use crate::error::{LoliError, Result};

use super::{InstallReport, Interceptor};

/// Rewrites the GOT slots of the allocator imports of the target libraries.
///
/// Loaded objects are enumerated with `dl_iterate_phdr`, their `DT_JMPREL` and `DT_RELA` tables
/// are scanned for `JUMP_SLOT`/`GLOB_DAT` relocations against a hooked symbol, and each slot is
/// overwritten with the trampoline address. Available on 64-bit Linux/Android (x86_64, aarch64).
#[derive(Debug, Default, Clone, Copy)]
pub struct GotInterceptor;

/// Returns true if the object file name `file_name` is the library `library`, given either as
/// `libfoo`, which matches `libfoo.so` and `libfoo.so.<version>`, or as `libfoo.so`.
pub fn matches_library(file_name: &str, library: &str) -> bool {
    if file_name.is_empty() || library.is_empty() {
        return false;
    }

    let rest = match file_name.strip_prefix(library) {
        Some(rest) => rest,
        None => return false,
    };

    if library.ends_with(".so") {
        rest.is_empty() || rest.starts_with('.')
    } else {
        rest == ".so" || rest.starts_with(".so.")
    }
}

#[cfg(not(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
impl Interceptor for GotInterceptor {
    fn install(&self, _libraries: &[String]) -> Result<InstallReport> {
        Err(LoliError::Unsupported)
    }
}

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub use imp::*;

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
mod imp {
    use std::{
        ffi::CStr,
        io,
        mem::size_of,
        ops::Range,
        ptr, slice,
    };

    use libc::{c_char, c_int, c_void, size_t};

    use super::*;
    use crate::interceptor::{trampoline, LibraryReport, HOOKED_SYMBOLS};

    const PT_DYNAMIC: u32 = 2;
    const PT_GNU_RELRO: u32 = 0x6474_e552;

    const DT_NULL: i64 = 0;
    const DT_PLTRELSZ: i64 = 2;
    const DT_STRTAB: i64 = 5;
    const DT_SYMTAB: i64 = 6;
    const DT_RELA: i64 = 7;
    const DT_RELASZ: i64 = 8;
    const DT_STRSZ: i64 = 10;
    const DT_PLTREL: i64 = 20;
    const DT_JMPREL: i64 = 23;

    #[cfg(target_arch = "x86_64")]
    const R_GLOB_DAT: u32 = 6;
    #[cfg(target_arch = "x86_64")]
    const R_JUMP_SLOT: u32 = 7;

    #[cfg(target_arch = "aarch64")]
    const R_GLOB_DAT: u32 = 1025;
    #[cfg(target_arch = "aarch64")]
    const R_JUMP_SLOT: u32 = 1026;

    #[repr(C)]
    struct Elf64Dyn {
        d_tag: i64,
        d_val: u64,
    }

    #[allow(dead_code)]
    #[repr(C)]
    struct Elf64Rela {
        r_offset: u64,
        r_info: u64,
        r_addend: i64,
    }

    impl Elf64Rela {
        fn symbol(&self) -> usize {
            (self.r_info >> 32) as usize
        }

        fn kind(&self) -> u32 {
            (self.r_info & 0xffff_ffff) as u32
        }
    }

    #[allow(dead_code)]
    #[repr(C)]
    struct Elf64Sym {
        st_name: u32,
        st_info: u8,
        st_other: u8,
        st_shndx: u16,
        st_value: u64,
        st_size: u64,
    }

    /// A shared object mapped in the current process.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LoadedObject {
        /// Path reported by the loader, empty for the main executable.
        pub path: String,
        pub base: usize,
        dynamic: Option<usize>,
        relro: Option<Range<usize>>,
    }

    /// An import slot in a global offset table.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ImportSlot {
        pub symbol: String,
        pub address: usize,
    }

    struct DynamicInfo {
        symtab: usize,
        strtab: usize,
        strsz: usize,
        tables: Vec<(usize, usize)>,
    }

    /// Every object currently mapped, in loader order.
    pub fn loaded_objects() -> Vec<LoadedObject> {
        let mut objects: Vec<LoadedObject> = vec![];

        unsafe {
            libc::dl_iterate_phdr(
                Some(collect_object),
                &mut objects as *mut Vec<LoadedObject> as *mut c_void,
            );
        }

        objects
    }

    unsafe extern "C" fn collect_object(
        info: *mut libc::dl_phdr_info,
        _size: size_t,
        data: *mut c_void,
    ) -> c_int {
        let objects = &mut *(data as *mut Vec<LoadedObject>);
        let info = &*info;

        let path = if info.dlpi_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };

        let base = info.dlpi_addr as usize;

        let phdrs = if info.dlpi_phdr.is_null() {
            &[][..]
        } else {
            slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
        };

        let mut dynamic = None;
        let mut relro = None;

        for phdr in phdrs {
            match phdr.p_type {
                PT_DYNAMIC => dynamic = Some(base + phdr.p_vaddr as usize),
                PT_GNU_RELRO => {
                    let start = base + phdr.p_vaddr as usize;
                    relro = Some(start..start + phdr.p_memsz as usize);
                }
                _ => {}
            }
        }

        objects.push(LoadedObject {
            path,
            base,
            dynamic,
            relro,
        });

        0
    }

    fn page_size() -> usize {
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as usize,
            _ => 4096,
        }
    }

    impl LoadedObject {
        pub fn file_name(&self) -> &str {
            self.path.rsplit('/').next().unwrap_or(&self.path)
        }

        pub fn matches(&self, library: &str) -> bool {
            matches_library(self.file_name(), library)
        }

        /// Returns true if this object holds the trampolines themselves.
        pub fn is_self(&self) -> bool {
            let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };

            let hook = trampoline("malloc").unwrap_or_default();

            if unsafe { libc::dladdr(hook as *const c_void, &mut info) } == 0 {
                return false;
            }

            info.dli_fbase as usize == self.base
        }

        /// Loaders differ on whether the dynamic section holds relocated addresses (glibc) or
        /// object relative ones (bionic, musl).
        fn absolute(&self, value: u64) -> usize {
            let value = value as usize;

            if value < self.base {
                self.base + value
            } else {
                value
            }
        }

        fn dynamic_info(&self) -> Option<DynamicInfo> {
            let mut entry = self.dynamic? as *const Elf64Dyn;

            let mut symtab = None;
            let mut strtab = None;
            let mut strsz = 0;
            let mut jmprel = None;
            let mut pltrelsz = 0;
            let mut pltrel_is_rela = true;
            let mut rela = None;
            let mut relasz = 0;

            unsafe {
                while (*entry).d_tag != DT_NULL {
                    let value = (*entry).d_val;

                    match (*entry).d_tag {
                        DT_SYMTAB => symtab = Some(self.absolute(value)),
                        DT_STRTAB => strtab = Some(self.absolute(value)),
                        DT_STRSZ => strsz = value as usize,
                        DT_JMPREL => jmprel = Some(self.absolute(value)),
                        DT_PLTRELSZ => pltrelsz = value as usize,
                        DT_PLTREL => pltrel_is_rela = value == DT_RELA as u64,
                        DT_RELA => rela = Some(self.absolute(value)),
                        DT_RELASZ => relasz = value as usize,
                        _ => {}
                    }

                    entry = entry.add(1);
                }
            }

            let mut tables = vec![];

            if let (Some(jmprel), true) = (jmprel, pltrel_is_rela) {
                tables.push((jmprel, pltrelsz));
            }

            if let Some(rela) = rela {
                tables.push((rela, relasz));
            }

            Some(DynamicInfo {
                symtab: symtab?,
                strtab: strtab?,
                strsz,
                tables,
            })
        }

        /// GOT slots bound to one of `symbols`.
        pub fn import_slots(&self, symbols: &[&str]) -> Vec<ImportSlot> {
            let mut slots = vec![];

            let info = match self.dynamic_info() {
                Some(info) => info,
                None => return slots,
            };

            for (table, size) in &info.tables {
                let relocations = unsafe {
                    slice::from_raw_parts(
                        *table as *const Elf64Rela,
                        size / size_of::<Elf64Rela>(),
                    )
                };

                for relocation in relocations {
                    if relocation.kind() != R_JUMP_SLOT && relocation.kind() != R_GLOB_DAT {
                        continue;
                    }

                    let symbol = unsafe {
                        &*((info.symtab as *const Elf64Sym).add(relocation.symbol()))
                    };

                    let name_offset = symbol.st_name as usize;

                    if name_offset == 0 || (info.strsz != 0 && name_offset >= info.strsz) {
                        continue;
                    }

                    let name =
                        unsafe { CStr::from_ptr((info.strtab + name_offset) as *const c_char) };

                    let name = match name.to_str() {
                        Ok(name) if symbols.contains(&name) => name,
                        _ => continue,
                    };

                    slots.push(ImportSlot {
                        symbol: name.to_string(),
                        address: self.base + relocation.r_offset as usize,
                    });
                }
            }

            slots
        }

        /// Point the slot at `value`, returns the value it held before.
        ///
        /// # Safety
        ///
        /// `slot` must be a GOT slot of this object and `value` a function of the same signature
        /// as the one bound to it.
        pub unsafe fn patch(&self, slot: usize, value: usize) -> io::Result<usize> {
            let page_size = page_size();
            let page = slot & !(page_size - 1);

            if libc::mprotect(
                page as *mut c_void,
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }

            let previous = ptr::read_volatile(slot as *const usize);

            if previous != value {
                ptr::write_volatile(slot as *mut usize, value);
            }

            // the loader only sealed the whole pages of the relro segment.
            let sealed = self.relro.as_ref().map_or(false, |relro| {
                page >= relro.start & !(page_size - 1)
                    && page + page_size <= relro.end & !(page_size - 1)
            });

            if sealed && libc::mprotect(page as *mut c_void, page_size, libc::PROT_READ) != 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(previous)
        }
    }

    /// One slot to redirect.
    struct SlotPatch<'a> {
        library: &'a str,
        object: &'a LoadedObject,
        symbol: String,
        slot: usize,
        hook: usize,
    }

    /// Write every planned slot or none of them. When a write fails, the slots already written
    /// get their previous value back before the error is returned.
    unsafe fn apply(plan: &[SlotPatch<'_>]) -> Result<()> {
        let mut written: Vec<(&SlotPatch<'_>, usize)> = vec![];

        for patch in plan {
            match patch.object.patch(patch.slot, patch.hook) {
                Ok(previous) => {
                    log::debug!(
                        "{}: {} slot {:#x} -> {:#x}",
                        patch.object.file_name(),
                        patch.symbol,
                        patch.slot,
                        patch.hook
                    );

                    written.push((patch, previous));
                }
                Err(source) => {
                    log::error!(
                        "error hooking {}'s {}(): {}",
                        patch.library,
                        patch.symbol,
                        source
                    );

                    for (done, previous) in written.iter().rev() {
                        if let Err(err) = done.object.patch(done.slot, *previous) {
                            log::error!(
                                "error restoring {}'s {}(): {}",
                                done.library,
                                done.symbol,
                                err
                            );
                        }
                    }

                    return Err(LoliError::Patch {
                        library: patch.library.to_string(),
                        symbol: patch.symbol.clone(),
                        source,
                    });
                }
            }
        }

        Ok(())
    }

    impl Interceptor for GotInterceptor {
        fn install(&self, libraries: &[String]) -> Result<InstallReport> {
            let objects = loaded_objects();

            let mut targets = vec![];

            for library in libraries {
                let matched = objects
                    .iter()
                    .filter(|object| object.matches(library))
                    .collect::<Vec<_>>();

                if matched.is_empty() {
                    return Err(LoliError::LibraryNotFound(library.clone()));
                }

                targets.push((library, matched));
            }

            let mut plan = vec![];
            let mut report = InstallReport::default();

            for (library, objects) in targets {
                for object in objects {
                    if object.is_self() {
                        log::warn!("skip {}, it holds the hooks", object.path);
                        continue;
                    }

                    log::info!("hooking {} ({})", library, object.path);

                    let mut patched = vec![];

                    for slot in object.import_slots(&HOOKED_SYMBOLS) {
                        if let Some(hook) = trampoline(&slot.symbol) {
                            patched.push(slot.symbol.clone());

                            plan.push(SlotPatch {
                                library,
                                object,
                                symbol: slot.symbol,
                                slot: slot.address,
                                hook,
                            });
                        }
                    }

                    if patched.is_empty() {
                        log::warn!("{} imports no allocator symbol", object.path);
                    }

                    report.libraries.push(LibraryReport {
                        name: library.clone(),
                        path: object.path.clone(),
                        patched,
                    });
                }
            }

            unsafe { apply(&plan)? };

            Ok(report)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_names() {
        assert!(matches_library("libunity.so", "libunity"));
        assert!(matches_library("libc.so.6", "libc"));
        assert!(matches_library("libil2cpp.so", "libil2cpp.so"));

        assert!(!matches_library("libunity_ext.so", "libunity"));
        assert!(!matches_library("libc++.so", "libc"));
        assert!(!matches_library("libunity.so", ""));
        assert!(!matches_library("", "libunity"));
    }
}
