use std::{ffi::CString, ptr::null};

use loli::ffi::*;

fn scratch(name: &str) -> CString {
    let path = std::env::temp_dir().join(format!("loli-ffi-{}-{}", std::process::id(), name));

    CString::new(path.to_string_lossy().as_bytes()).unwrap()
}

#[test]
fn calls_before_install_report_codes() {
    let path = scratch("early.csv");

    unsafe {
        assert_eq!(loliDump(false, path.as_ptr()), 7);
        assert_eq!(loliSetAutoDump(path.as_ptr(), 1000, false), 7);
    }

    loliTick();
}

#[test]
fn hook_rejects_bad_arguments() {
    let blank = CString::new(" , ").unwrap();

    unsafe {
        assert_eq!(loliHook(512, null()), 6);
        assert_eq!(loliHook(512, blank.as_ptr()), 6);
    }
}

#[test]
fn hook_of_missing_library_fails() {
    let names = CString::new("libloli_not_loaded,").unwrap();

    unsafe {
        assert_eq!(loliHook(512, names.as_ptr()), 2);
    }

    assert!(!loli::global_engine().is_installed());
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn smaps_dump() {
    let path = scratch("smaps.txt");

    unsafe {
        assert_eq!(loliDumpSmaps(path.as_ptr()), 0);
        assert_eq!(loliDumpSmaps(null()), 6);
    }

    let content = std::fs::read_to_string(path.to_str().unwrap()).unwrap();

    assert!(!content.is_empty());

    std::fs::remove_file(path.to_str().unwrap()).unwrap();
}
