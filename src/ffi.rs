//! C ABI surface, regrounded from the original oplog-era FFI onto the
//! Storage Engine: opaque handles, thread-local last-error, and JSON
//! payloads crossing the boundary as owned C strings the caller frees with
//! `sync_string_free`. Concrete platform adapters/transports are out of
//! scope (spec.md §1); this surface binds to the in-memory reference
//! adapter so a host language can exercise the engine directly.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use crate::adapter::InMemoryAdapter;
use crate::engine::StorageEngine;
use crate::hlc::HlcService;
use crate::row::PutOptions;

/// Opaque handle owning one engine instance bound to the in-memory
/// reference adapter. Swift/Kotlin/etc. hold this as an unsafe pointer and
/// pass it back into every other call.
pub struct SyncEngineHandle {
    engine: Arc<StorageEngine>,
}

thread_local! {
    static LAST_ERROR: RefCell<(i32, String)> = RefCell::new((0, String::new()));
}

fn clear_last_error() {
    LAST_ERROR.with(|le| *le.borrow_mut() = (0, String::new()));
}

fn set_last_error(code: i32, msg: impl AsRef<str>) {
    LAST_ERROR.with(|le| *le.borrow_mut() = (code, msg.as_ref().to_string()));
}

fn ptr_to_str<'a>(ptr: *const c_char) -> Result<&'a str, ()> {
    if ptr.is_null() {
        return Err(());
    }
    unsafe { CStr::from_ptr(ptr).to_str().map_err(|_| ()) }
}

fn to_cstring_ptr(s: &str) -> *mut c_char {
    CString::new(s)
        .map(|cs| cs.into_raw())
        .unwrap_or(std::ptr::null_mut())
}

/// Frees a C string previously returned by this library.
#[unsafe(no_mangle)]
pub extern "C" fn sync_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(s);
    }
}

/// Opens a fresh in-process engine bound to `namespace`/`device_id`.
/// Returns null on failure; check `sync_last_error_message`.
#[unsafe(no_mangle)]
pub extern "C" fn sync_engine_open(
    namespace: *const c_char,
    device_id: *const c_char,
) -> *mut SyncEngineHandle {
    let (namespace, device_id) = match (ptr_to_str(namespace), ptr_to_str(device_id)) {
        (Ok(n), Ok(d)) => (n, d),
        _ => {
            set_last_error(4, "invalid namespace or device_id");
            return std::ptr::null_mut();
        }
    };

    let adapter = Arc::new(InMemoryAdapter::new(namespace));
    let hlc = match HlcService::new(device_id) {
        Ok(hlc) => Arc::new(hlc),
        Err(e) => {
            set_last_error(1, e.to_string());
            return std::ptr::null_mut();
        }
    };
    let engine = match StorageEngine::new(adapter, hlc) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            set_last_error(1, e.to_string());
            return std::ptr::null_mut();
        }
    };

    clear_last_error();
    Box::into_raw(Box::new(SyncEngineHandle { engine }))
}

/// Closes a previously opened engine handle.
#[unsafe(no_mangle)]
pub extern "C" fn sync_engine_close(handle: *mut SyncEngineHandle) {
    if handle.is_null() {
        return;
    }
    unsafe {
        let _ = Box::from_raw(handle);
    }
}

/// Writes a row. `data_json` must be a JSON object. Returns a newly
/// allocated JSON `WriteResult`, or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn sync_engine_put(
    handle: *mut SyncEngineHandle,
    collection_id: *const c_char,
    id: *const c_char,
    data_json: *const c_char,
) -> *mut c_char {
    let handle = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return std::ptr::null_mut();
        }
    };
    let (collection_id, id, data_json) = match (
        ptr_to_str(collection_id),
        ptr_to_str(id),
        ptr_to_str(data_json),
    ) {
        (Ok(c), Ok(i), Ok(d)) => (c, i, d),
        _ => {
            set_last_error(4, "invalid string argument");
            return std::ptr::null_mut();
        }
    };
    let data: serde_json::Value = match serde_json::from_str(data_json) {
        Ok(v) => v,
        Err(e) => {
            set_last_error(2, e.to_string());
            return std::ptr::null_mut();
        }
    };

    match handle.engine.put(collection_id, id, data, PutOptions::default()) {
        Ok(result) => encode_or_fail(&result),
        Err(e) => {
            set_last_error(1, e.to_string());
            std::ptr::null_mut()
        }
    }
}

/// Deletes (tombstones) a row. Returns a newly allocated JSON `WriteResult`,
/// or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn sync_engine_delete(
    handle: *mut SyncEngineHandle,
    collection_id: *const c_char,
    id: *const c_char,
) -> *mut c_char {
    let handle = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return std::ptr::null_mut();
        }
    };
    let (collection_id, id) = match (ptr_to_str(collection_id), ptr_to_str(id)) {
        (Ok(c), Ok(i)) => (c, i),
        _ => {
            set_last_error(4, "invalid string argument");
            return std::ptr::null_mut();
        }
    };

    match handle.engine.delete(collection_id, id, None) {
        Ok(result) => encode_or_fail(&result),
        Err(e) => {
            set_last_error(1, e.to_string());
            std::ptr::null_mut()
        }
    }
}

/// Reads one row. Returns JSON `Row`, the literal string `"null"` if no
/// live row exists, or null (the C pointer) on error.
#[unsafe(no_mangle)]
pub extern "C" fn sync_engine_get(
    handle: *mut SyncEngineHandle,
    collection_id: *const c_char,
    id: *const c_char,
) -> *mut c_char {
    let handle = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return std::ptr::null_mut();
        }
    };
    let (collection_id, id) = match (ptr_to_str(collection_id), ptr_to_str(id)) {
        (Ok(c), Ok(i)) => (c, i),
        _ => {
            set_last_error(4, "invalid string argument");
            return std::ptr::null_mut();
        }
    };

    match handle.engine.get(collection_id, id) {
        Ok(row) => encode_or_fail(&row),
        Err(e) => {
            set_last_error(1, e.to_string());
            std::ptr::null_mut()
        }
    }
}

/// Reads every live row in a collection as a JSON array.
#[unsafe(no_mangle)]
pub extern "C" fn sync_engine_get_all(
    handle: *mut SyncEngineHandle,
    collection_id: *const c_char,
) -> *mut c_char {
    let handle = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return std::ptr::null_mut();
        }
    };
    let collection_id = match ptr_to_str(collection_id) {
        Ok(c) => c,
        Err(_) => {
            set_last_error(4, "invalid collection_id");
            return std::ptr::null_mut();
        }
    };

    match handle.engine.get_all(collection_id) {
        Ok(rows) => encode_or_fail(&rows),
        Err(e) => {
            set_last_error(1, e.to_string());
            std::ptr::null_mut()
        }
    }
}

/// Returns up to `limit` pending ops as a JSON array, ascending by
/// sequence.
#[unsafe(no_mangle)]
pub extern "C" fn sync_engine_get_pending_json(
    handle: *mut SyncEngineHandle,
    limit: usize,
) -> *mut c_char {
    let handle = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return std::ptr::null_mut();
        }
    };

    match handle.engine.get_pending(limit) {
        Ok(ops) => encode_or_fail(&ops),
        Err(e) => {
            set_last_error(1, e.to_string());
            std::ptr::null_mut()
        }
    }
}

/// Truncates the pending log through `seq_inclusive`. Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn sync_engine_remove_pending_through(
    handle: *mut SyncEngineHandle,
    seq_inclusive: u64,
) -> c_int {
    let handle = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return 2;
        }
    };

    match handle.engine.remove_pending_through(seq_inclusive) {
        Ok(()) => {
            clear_last_error();
            0
        }
        Err(e) => {
            set_last_error(1, e.to_string());
            1
        }
    }
}

/// Returns the last error code for the current thread. `0` means no error
/// is pending.
#[unsafe(no_mangle)]
pub extern "C" fn sync_last_error_code() -> c_int {
    LAST_ERROR.with(|le| le.borrow().0)
}

/// Returns the last error message for the current thread as a newly
/// allocated C string. Caller must free with `sync_string_free`.
#[unsafe(no_mangle)]
pub extern "C" fn sync_last_error_message() -> *mut c_char {
    to_cstring_ptr(&LAST_ERROR.with(|le| le.borrow().1.clone()))
}

fn encode_or_fail<T: serde::Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(s) => {
            clear_last_error();
            to_cstring_ptr(&s)
        }
        Err(e) => {
            set_last_error(2, e.to_string());
            std::ptr::null_mut()
        }
    }
}
