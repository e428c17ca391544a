//! Minimal native spider exporting the host's C ABI.
//!
//! `Demo` echoes the arguments it receives as JSON; any other name fails
//! to create.

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::sync::Mutex;

struct Demo {
    init_args: Mutex<String>,
}

fn text(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: the host passes NUL-terminated strings that outlive the call.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

fn out(value: String) -> *mut c_char {
    CString::new(value).map_or(ptr::null_mut(), CString::into_raw)
}

#[no_mangle]
pub extern "C" fn spider_init() -> i32 {
    0
}

#[no_mangle]
pub extern "C" fn spider_proxy(_params: *const c_char) -> *mut c_char {
    // body is base64 of "native"
    out(r#"[200, "text/plain", "bmF0aXZl", {"X-Native": "1"}]"#.to_string())
}

#[no_mangle]
pub extern "C" fn spider_create(name: *const c_char) -> *mut c_void {
    if text(name) != "Demo" {
        return ptr::null_mut();
    }
    let demo = Box::new(Demo {
        init_args: Mutex::new(String::from("null")),
    });
    Box::into_raw(demo).cast()
}

#[no_mangle]
pub extern "C" fn spider_call(handle: *mut c_void, method: *const c_char, args: *const c_char) -> *mut c_char {
    // SAFETY: `handle` came from `spider_create` and is still alive.
    let demo = unsafe { &*handle.cast::<Demo>() };
    let args = text(args);
    let Ok(mut init_args) = demo.init_args.lock() else {
        return ptr::null_mut();
    };
    match text(method).as_str() {
        "init" => {
            *init_args = args;
            out(String::new())
        }
        "homeContent" => out(format!(r#"{{"init":{},"args":{args}}}"#, *init_args)),
        "searchContent" | "playerContent" => out(format!(r#"{{"args":{args}}}"#)),
        "manualVideoCheck" => out("true".to_string()),
        "isVideoFormat" => out(args.contains(".m3u8").to_string()),
        _ => ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn spider_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        // SAFETY: every non-null string handed out came from `CString::into_raw`.
        drop(unsafe { CString::from_raw(ptr) });
    }
}

#[no_mangle]
pub extern "C" fn spider_destroy(handle: *mut c_void) {
    if !handle.is_null() {
        // SAFETY: `handle` came from `spider_create` and is destroyed once.
        drop(unsafe { Box::from_raw(handle.cast::<Demo>()) });
    }
}
