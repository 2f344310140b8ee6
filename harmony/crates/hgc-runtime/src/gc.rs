//! GC Runtime - C FFI wrapper for HGC
//!
//! Every handle crossing the boundary is a boxed Rust value owned by the
//! caller until the matching `*_release` / `*_destroy` call. Thread
//! attachment is per OS thread and kept in a thread local.

use hgc::{GcConfig, MutatorThread, ObjectBuilder, Reference, Root, Runtime, ThreadId};
use std::cell::RefCell;
use std::ffi::{c_char, CStr};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

/// Opaque runtime handle
pub struct HgcRuntime {
    runtime: Arc<Runtime>,
}

/// Opaque strong handle to a managed object
pub struct HgcObject {
    root: Root,
}

/// Opaque handle to a weak reference
pub struct HgcReference {
    reference: Reference,
}

thread_local! {
    static MUTATOR: RefCell<Option<MutatorThread>> = const { RefCell::new(None) };
}

fn boxed<T>(value: T) -> *mut T {
    Box::into_raw(Box::new(value))
}

fn object_ptr(root: Root) -> *mut HgcObject {
    boxed(HgcObject { root })
}

// === Runtime ===

/// Create and start a runtime
///
/// `heap_capacity` of 0 keeps the configured default (`HGC_HEAP_CAPACITY`
/// or 64MB). Returns null on failure.
#[no_mangle]
pub extern "C" fn hgc_runtime_create(heap_capacity: usize) -> *mut HgcRuntime {
    let mut config = GcConfig::from_env();
    if heap_capacity != 0 {
        config.heap_capacity = heap_capacity;
    }

    let runtime = match Runtime::new(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to create GC runtime: {}", e);
            return ptr::null_mut();
        },
    };
    if let Err(e) = runtime.start() {
        log::error!("failed to start GC runtime: {}", e);
        return ptr::null_mut();
    }

    boxed(HgcRuntime {
        runtime: Arc::new(runtime),
    })
}

/// Stop and free a runtime
///
/// # Safety
///
/// `rt` must come from [`hgc_runtime_create`] and not be used afterwards.
/// Object and reference handles stay valid to release.
#[no_mangle]
pub unsafe extern "C" fn hgc_runtime_destroy(rt: *mut HgcRuntime) {
    if rt.is_null() {
        return;
    }
    let rt = Box::from_raw(rt);
    if let Err(e) = rt.runtime.stop() {
        log::error!("GC runtime shutdown failed: {}", e);
    }
}

/// Run a full collection, returns false on failure
///
/// # Safety
///
/// `rt` must be null or a live runtime handle.
#[no_mangle]
pub unsafe extern "C" fn hgc_collect(rt: *const HgcRuntime) -> bool {
    let Some(rt) = rt.as_ref() else {
        return false;
    };
    match rt.runtime.collect() {
        Ok(_) => true,
        Err(e) => {
            log::error!("collection failed: {}", e);
            false
        },
    }
}

/// Wait up to `timeout_ms` for scheduled finalizers, false on timeout
///
/// # Safety
///
/// `rt` must be null or a live runtime handle.
#[no_mangle]
pub unsafe extern "C" fn hgc_finalize_objects(rt: *const HgcRuntime, timeout_ms: u64) -> bool {
    match rt.as_ref() {
        Some(rt) => rt.runtime.run_finalization(Duration::from_millis(timeout_ms)),
        None => false,
    }
}

/// # Safety
///
/// `rt` must be null or a live runtime handle.
#[no_mangle]
pub unsafe extern "C" fn hgc_pending_finalizers(rt: *const HgcRuntime) -> usize {
    rt.as_ref().map_or(0, |rt| rt.runtime.pending_finalizers())
}

// === Objects ===

/// Allocate an object with `size` payload bytes and `fields` reference slots
///
/// Returns null when the heap is exhausted.
///
/// # Safety
///
/// `rt` must be null or a live runtime handle.
#[no_mangle]
pub unsafe extern "C" fn hgc_alloc(rt: *const HgcRuntime, size: usize, fields: usize) -> *mut HgcObject {
    let Some(rt) = rt.as_ref() else {
        return ptr::null_mut();
    };
    match rt.runtime.allocate(ObjectBuilder::new(size).fields(fields)) {
        Ok(root) => object_ptr(root),
        Err(e) => {
            log::error!("GC allocation of {} bytes failed: {}", size, e);
            ptr::null_mut()
        },
    }
}

/// Release a strong handle
///
/// # Safety
///
/// `obj` must be null or a handle not yet released.
#[no_mangle]
pub unsafe extern "C" fn hgc_object_release(obj: *mut HgcObject) {
    if !obj.is_null() {
        drop(Box::from_raw(obj));
    }
}

/// Store `value` (null to clear) into field `index` of `obj`
///
/// # Safety
///
/// All handles must be null or live; `value` may be null.
#[no_mangle]
pub unsafe extern "C" fn hgc_object_set_field(
    rt: *const HgcRuntime,
    obj: *const HgcObject,
    index: usize,
    value: *const HgcObject,
) -> bool {
    let (Some(rt), Some(obj)) = (rt.as_ref(), obj.as_ref()) else {
        return false;
    };
    let value = value.as_ref().map(|value| &value.root);
    match rt.runtime.heap().set_field(&obj.root, index, value) {
        Ok(()) => true,
        Err(e) => {
            log::error!("set_field failed: {}", e);
            false
        },
    }
}

/// New strong handle to field `index` of `obj`, null when empty
///
/// # Safety
///
/// All handles must be null or live.
#[no_mangle]
pub unsafe extern "C" fn hgc_object_get_field(
    rt: *const HgcRuntime,
    obj: *const HgcObject,
    index: usize,
) -> *mut HgcObject {
    let (Some(rt), Some(obj)) = (rt.as_ref(), obj.as_ref()) else {
        return ptr::null_mut();
    };
    match rt.runtime.heap().get_field(&obj.root, index) {
        Ok(Some(root)) => object_ptr(root),
        Ok(None) => ptr::null_mut(),
        Err(e) => {
            log::error!("get_field failed: {}", e);
            ptr::null_mut()
        },
    }
}

// === References ===

/// Weak reference to `obj`, without a queue
///
/// # Safety
///
/// All handles must be null or live.
#[no_mangle]
pub unsafe extern "C" fn hgc_weak_new(rt: *const HgcRuntime, obj: *const HgcObject) -> *mut HgcReference {
    let (Some(rt), Some(obj)) = (rt.as_ref(), obj.as_ref()) else {
        return ptr::null_mut();
    };
    match rt.runtime.new_weak_reference(&obj.root, None) {
        Ok(reference) => boxed(HgcReference { reference }),
        Err(e) => {
            log::error!("weak reference creation failed: {}", e);
            ptr::null_mut()
        },
    }
}

/// New strong handle to the referent, null once cleared
///
/// # Safety
///
/// `reference` must be null or a live reference handle.
#[no_mangle]
pub unsafe extern "C" fn hgc_reference_get(reference: *const HgcReference) -> *mut HgcObject {
    reference
        .as_ref()
        .and_then(|reference| reference.reference.get())
        .map_or(ptr::null_mut(), object_ptr)
}

/// # Safety
///
/// `reference` must be null or a handle not yet released.
#[no_mangle]
pub unsafe extern "C" fn hgc_reference_release(reference: *mut HgcReference) {
    if !reference.is_null() {
        drop(Box::from_raw(reference));
    }
}

// === Threads ===

/// Attach the calling thread, returns its id or 0 on failure
///
/// # Safety
///
/// `rt` must be null or a live runtime handle; `name` null or a valid C
/// string.
#[no_mangle]
pub unsafe extern "C" fn hgc_attach_current_thread(rt: *const HgcRuntime, name: *const c_char) -> u64 {
    let Some(rt) = rt.as_ref() else {
        return 0;
    };
    let name = if name.is_null() {
        "native".into()
    } else {
        CStr::from_ptr(name).to_string_lossy()
    };

    match rt.runtime.attach_current_thread(&name) {
        Ok(mutator) => {
            let id = mutator.id().as_raw();
            MUTATOR.with(|slot| *slot.borrow_mut() = Some(mutator));
            id
        },
        Err(e) => {
            log::error!("thread attach failed: {}", e);
            0
        },
    }
}

/// Detach the calling thread, false if it was not attached
#[no_mangle]
pub extern "C" fn hgc_detach_current_thread() -> bool {
    MUTATOR.with(|slot| slot.borrow_mut().take()).is_some()
}

/// Safepoint poll for the calling thread; no-op when unattached
#[no_mangle]
pub extern "C" fn hgc_safepoint_poll() {
    MUTATOR.with(|slot| {
        if let Some(mutator) = slot.borrow().as_ref() {
            mutator.safepoint();
        }
    });
}

fn count_or_error(result: hgc::Result<u32>, action: &str) -> i64 {
    match result {
        Ok(count) => i64::from(count),
        Err(e) => {
            log::error!("{} failed: {}", action, e);
            -1
        },
    }
}

/// Suspend thread `id`, returns the new suspend count or -1
///
/// # Safety
///
/// `rt` must be null or a live runtime handle.
#[no_mangle]
pub unsafe extern "C" fn hgc_thread_suspend(rt: *const HgcRuntime, id: u64) -> i64 {
    match rt.as_ref() {
        Some(rt) => count_or_error(rt.runtime.suspend_thread(ThreadId::from_raw(id)), "suspend"),
        None => -1,
    }
}

/// Resume thread `id`, returns the new suspend count or -1
///
/// # Safety
///
/// `rt` must be null or a live runtime handle.
#[no_mangle]
pub unsafe extern "C" fn hgc_thread_resume(rt: *const HgcRuntime, id: u64) -> i64 {
    match rt.as_ref() {
        Some(rt) => count_or_error(rt.runtime.resume_thread(ThreadId::from_raw(id)), "resume"),
        None => -1,
    }
}

/// Current suspend count of thread `id`, or -1
///
/// # Safety
///
/// `rt` must be null or a live runtime handle.
#[no_mangle]
pub unsafe extern "C" fn hgc_thread_suspend_count(rt: *const HgcRuntime, id: u64) -> i64 {
    match rt.as_ref() {
        Some(rt) => count_or_error(
            rt.runtime
                .thread_info(ThreadId::from_raw(id))
                .map(|info| info.suspend_count),
            "suspend count",
        ),
        None => -1,
    }
}

/// Interrupt thread `id`, waking it from a reference queue wait
///
/// # Safety
///
/// `rt` must be null or a live runtime handle.
#[no_mangle]
pub unsafe extern "C" fn hgc_thread_interrupt(rt: *const HgcRuntime, id: u64) -> bool {
    let Some(rt) = rt.as_ref() else {
        return false;
    };
    match rt.runtime.interrupt_thread(ThreadId::from_raw(id)) {
        Ok(()) => true,
        Err(e) => {
            log::error!("interrupt failed: {}", e);
            false
        },
    }
}
