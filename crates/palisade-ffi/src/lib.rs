//! C FFI bindings for palisade
//!
//! This crate provides a C-compatible API over a filter collection. Calls
//! returning `int` yield 0 on success and a negative errno on failure; the
//! message for the last failure on the calling thread is available from
//! `palisade_last_error()`.
//!
//! # Example (C)
//! ```c
//! #include <palisade.h>
//!
//! PalisadeFilter* ctx = palisade_init(PALISADE_ACT_KILL);
//! PalisadeArgCmp fd = { 0, PALISADE_CMP_EQ, 1, 0 };
//! palisade_rule_add(ctx, PALISADE_ACT_ALLOW, palisade_syscall_resolve_name("write"), 1, &fd);
//! palisade_release(ctx);
//! ```

#![allow(clippy::missing_safety_doc)]

use libc::{c_char, c_int, c_uint, size_t};
use once_cell::sync::Lazy;
use palisade_core::arch::{self, ArchRef};
use palisade_core::export::{self, CollectionExport};
use palisade_core::{
    ARG_COUNT_MAX, Action, ArchToken, ArgCmp, CompareOp, FilterAttr, FilterCollection, FilterError,
};
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ptr;

pub const PALISADE_ACT_KILL: u32 = 0x0000_0000;
pub const PALISADE_ACT_TRAP: u32 = 0x0003_0000;
pub const PALISADE_ACT_ERRNO_BASE: u32 = 0x0005_0000;
pub const PALISADE_ACT_TRACE_BASE: u32 = 0x7ff0_0000;
pub const PALISADE_ACT_ALLOW: u32 = 0x7fff_0000;

pub const PALISADE_CMP_NE: c_uint = 1;
pub const PALISADE_CMP_LT: c_uint = 2;
pub const PALISADE_CMP_LE: c_uint = 3;
pub const PALISADE_CMP_EQ: c_uint = 4;
pub const PALISADE_CMP_GE: c_uint = 5;
pub const PALISADE_CMP_GT: c_uint = 6;
pub const PALISADE_CMP_MASKED_EQ: c_uint = 7;

pub const PALISADE_ATTR_ACT_DEFAULT: c_uint = 1;
pub const PALISADE_ATTR_ACT_BADARCH: c_uint = 2;
pub const PALISADE_ATTR_CTL_NNP: c_uint = 3;
pub const PALISADE_ATTR_CTL_TSYNC: c_uint = 4;

/// Returned by `palisade_syscall_resolve_name` for unknown names.
pub const PALISADE_SYSCALL_ERROR: c_int = -1;

/// Opaque handle to a filter collection
pub struct PalisadeFilter {
    inner: FilterCollection,
}

/// One argument comparison
///
/// For `PALISADE_CMP_MASKED_EQ`, `datum_a` is the mask and `datum_b` the
/// value.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PalisadeArgCmp {
    pub arg: c_uint,
    pub op: c_uint,
    pub datum_a: u64,
    pub datum_b: u64,
}

// Thread-local error message
thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_last_error(msg: String) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some(msg);
    });
}

fn status(result: Result<(), FilterError>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => {
            tracing::debug!(errno = err.errno(), "palisade call failed: {err}");
            let code = err.errno();
            set_last_error(err.to_string());
            code
        }
    }
}

fn null_handle() -> c_int {
    set_last_error("filter handle is null".into());
    -libc::EINVAL
}

/// Run `f` against the collection behind `ctx`.
unsafe fn with_filter(
    ctx: *mut PalisadeFilter,
    f: impl FnOnce(&mut FilterCollection) -> Result<(), FilterError>,
) -> c_int {
    // SAFETY: Caller guarantees ctx is null or a live handle from palisade_init
    match unsafe { ctx.as_mut() } {
        Some(filter) => status(f(&mut filter.inner)),
        None => null_handle(),
    }
}

/// Resolve an architecture token, 0 meaning the collection's native.
///
/// Handles from `palisade_init` always use the build architecture as
/// native, which is also what `palisade_syscall_resolve_name` numbers
/// against.
fn arch_for(ctx: &FilterCollection, token: u32) -> Result<ArchRef, FilterError> {
    if token == 0 {
        return Ok(ctx.native());
    }
    arch::by_token(ArchToken(token))
        .ok_or_else(|| FilterError::InvalidArgument(format!("unknown architecture {token:#010x}")))
}

unsafe fn read_args(args: *const PalisadeArgCmp, count: c_uint) -> Result<Vec<ArgCmp>, FilterError> {
    let count = count as usize;
    if count == 0 {
        return Ok(Vec::new());
    }
    if args.is_null() {
        return Err(FilterError::InvalidArgument("argument array is null".into()));
    }
    if count > ARG_COUNT_MAX {
        return Err(FilterError::InvalidArgument(format!(
            "{count} comparisons given, at most {ARG_COUNT_MAX} allowed"
        )));
    }

    // SAFETY: Caller guarantees args points to count valid comparisons
    let raw = unsafe { std::slice::from_raw_parts(args, count) };
    raw.iter()
        .map(|cmp| -> Result<ArgCmp, FilterError> {
            let op = CompareOp::from_raw(cmp.op).ok_or_else(|| {
                FilterError::InvalidArgument(format!("unknown comparison operator {}", cmp.op))
            })?;
            Ok(ArgCmp {
                arg: cmp.arg,
                op,
                datum_a: cmp.datum_a,
                datum_b: cmp.datum_b,
            })
        })
        .collect()
}

unsafe fn read_str<'a>(text: *const c_char, what: &str) -> Result<&'a str, FilterError> {
    if text.is_null() {
        return Err(FilterError::InvalidArgument(format!("{what} is null")));
    }
    // SAFETY: Caller guarantees text is a valid C string
    unsafe { CStr::from_ptr(text) }
        .to_str()
        .map_err(|_| FilterError::InvalidArgument(format!("invalid UTF-8 in {what}")))
}

/// Get the last error message
///
/// Returns NULL if no error. The returned string is valid until the next
/// palisade call on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn palisade_last_error() -> *const c_char {
    thread_local! {
        static ERROR_BUF: RefCell<Option<CString>> = const { RefCell::new(None) };
    }

    LAST_ERROR.with(|e| {
        let err = e.borrow();
        match &*err {
            Some(msg) => ERROR_BUF.with(|buf| {
                let cstr = CString::new(msg.as_str()).unwrap_or_default();
                let ptr = cstr.as_ptr();
                *buf.borrow_mut() = Some(cstr);
                ptr
            }),
            None => ptr::null(),
        }
    })
}

/// Create a filter collection for the native architecture
///
/// Returns NULL on failure. Call `palisade_last_error()` for details.
/// The caller must free the handle with `palisade_release()`.
#[unsafe(no_mangle)]
pub extern "C" fn palisade_init(def_action: u32) -> *mut PalisadeFilter {
    let created = Action::from_raw(def_action).and_then(FilterCollection::new);
    match created {
        Ok(inner) => Box::into_raw(Box::new(PalisadeFilter { inner })),
        Err(err) => {
            set_last_error(err.to_string());
            ptr::null_mut()
        }
    }
}

/// Drop all rules and architectures and start over
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_reset(ctx: *mut PalisadeFilter, def_action: u32) -> c_int {
    // SAFETY: forwarded caller guarantee
    unsafe { with_filter(ctx, |col| col.reset(Action::from_raw(def_action)?)) }
}

/// Free a filter collection
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_release(ctx: *mut PalisadeFilter) {
    if !ctx.is_null() {
        // SAFETY: Caller guarantees ctx is valid and was allocated by Box
        let mut filter = unsafe { Box::from_raw(ctx) };
        filter.inner.release();
    }
}

/// Move every architecture of `src` into `dst`
///
/// On success `src` is freed and must not be used again.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_merge(dst: *mut PalisadeFilter, src: *mut PalisadeFilter) -> c_int {
    if src.is_null() || ptr::eq(dst, src) {
        set_last_error("source handle is null or equal to the destination".into());
        return -libc::EINVAL;
    }
    // SAFETY: Caller guarantees src is a live handle distinct from dst
    let source = unsafe { &mut *src };
    // SAFETY: forwarded caller guarantee
    let rc = unsafe { with_filter(dst, |col| col.merge(&mut source.inner)) };
    if rc == 0 {
        // SAFETY: src was allocated by Box in palisade_init
        drop(unsafe { Box::from_raw(src) });
    }
    rc
}

/// Audit token of the native architecture
#[unsafe(no_mangle)]
pub extern "C" fn palisade_arch_native() -> u32 {
    arch::native().map_or(0, |arch| arch.token().0)
}

/// Audit token for an architecture name, 0 if unknown
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_arch_resolve_name(name: *const c_char) -> u32 {
    // SAFETY: forwarded caller guarantee
    match unsafe { read_str(name, "architecture name") } {
        Ok(name) => arch::by_name(name).map_or(0, |arch| arch.token().0),
        Err(err) => {
            set_last_error(err.to_string());
            0
        }
    }
}

/// 0 if the collection has a filter for `token`, `-ENOENT` otherwise
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_arch_exist(ctx: *mut PalisadeFilter, token: u32) -> c_int {
    // SAFETY: forwarded caller guarantee
    unsafe {
        with_filter(ctx, |col| {
            let arch = arch_for(col, token)?;
            if col.has_architecture(arch.token()) {
                Ok(())
            } else {
                Err(FilterError::NotFound(format!("architecture {}", arch.name())))
            }
        })
    }
}

/// Add an empty filter for `token` (0 for native)
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_arch_add(ctx: *mut PalisadeFilter, token: u32) -> c_int {
    // SAFETY: forwarded caller guarantee
    unsafe {
        with_filter(ctx, |col| {
            let arch = arch_for(col, token)?;
            col.add_architecture(arch)
        })
    }
}

/// Remove the filter for `token` (0 for native)
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_arch_remove(ctx: *mut PalisadeFilter, token: u32) -> c_int {
    // SAFETY: forwarded caller guarantee
    unsafe {
        with_filter(ctx, |col| {
            let arch = arch_for(col, token)?;
            col.remove_architecture(arch.token())
        })
    }
}

/// Read an attribute into `value`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_attr_get(ctx: *mut PalisadeFilter, attr: c_uint, value: *mut u32) -> c_int {
    if value.is_null() {
        set_last_error("value pointer is null".into());
        return -libc::EINVAL;
    }
    // SAFETY: forwarded caller guarantee
    unsafe {
        with_filter(ctx, |col| {
            let current = col.attribute(FilterAttr::try_from(attr)?)?;
            // SAFETY: value checked non-null, caller guarantees it is writable
            *value = current;
            Ok(())
        })
    }
}

/// Set an attribute
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_attr_set(ctx: *mut PalisadeFilter, attr: c_uint, value: u32) -> c_int {
    // SAFETY: forwarded caller guarantee
    unsafe { with_filter(ctx, |col| col.set_attribute(FilterAttr::try_from(attr)?, value)) }
}

/// Native syscall number for `name`, `PALISADE_SYSCALL_ERROR` if unknown
///
/// Numbers come from the build architecture, the native of every handle
/// `palisade_init` returns, so they can be passed straight to
/// `palisade_rule_add`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_syscall_resolve_name(name: *const c_char) -> c_int {
    // SAFETY: forwarded caller guarantee
    let name = match unsafe { read_str(name, "syscall name") } {
        Ok(name) => name,
        Err(err) => {
            set_last_error(err.to_string());
            return PALISADE_SYSCALL_ERROR;
        }
    };
    arch::native()
        .and_then(|native| native.resolve_name(name))
        .unwrap_or(PALISADE_SYSCALL_ERROR)
}

/// Raise the evaluation priority of `syscall`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_syscall_priority(ctx: *mut PalisadeFilter, syscall: c_int, priority: u16) -> c_int {
    // SAFETY: forwarded caller guarantee
    unsafe { with_filter(ctx, |col| col.set_syscall_priority(syscall, priority)) }
}

unsafe fn rule_add(
    ctx: *mut PalisadeFilter,
    strict: bool,
    action: u32,
    syscall: c_int,
    arg_cnt: c_uint,
    args: *const PalisadeArgCmp,
) -> c_int {
    // SAFETY: forwarded caller guarantee
    let cmps = match unsafe { read_args(args, arg_cnt) } {
        Ok(cmps) => cmps,
        Err(err) => return status(Err(err)),
    };
    // SAFETY: forwarded caller guarantee
    unsafe { with_filter(ctx, |col| col.add_rule(strict, Action::from_raw(action)?, syscall, &cmps)) }
}

/// Add a rule, adapting it per architecture where needed
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_rule_add(
    ctx: *mut PalisadeFilter,
    action: u32,
    syscall: c_int,
    arg_cnt: c_uint,
    args: *const PalisadeArgCmp,
) -> c_int {
    // SAFETY: forwarded caller guarantee
    unsafe { rule_add(ctx, false, action, syscall, arg_cnt, args) }
}

/// Add a rule that must apply exactly as written
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_rule_add_exact(
    ctx: *mut PalisadeFilter,
    action: u32,
    syscall: c_int,
    arg_cnt: c_uint,
    args: *const PalisadeArgCmp,
) -> c_int {
    // SAFETY: forwarded caller guarantee
    unsafe { rule_add(ctx, true, action, syscall, arg_cnt, args) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_transaction_start(ctx: *mut PalisadeFilter) -> c_int {
    // SAFETY: forwarded caller guarantee
    unsafe { with_filter(ctx, FilterCollection::transaction_start) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_transaction_abort(ctx: *mut PalisadeFilter) -> c_int {
    // SAFETY: forwarded caller guarantee
    unsafe { with_filter(ctx, FilterCollection::transaction_abort) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_transaction_commit(ctx: *mut PalisadeFilter) -> c_int {
    // SAFETY: forwarded caller guarantee
    unsafe { with_filter(ctx, FilterCollection::transaction_commit) }
}

/// Export the compiled trees as MessagePack
///
/// On success `*buf` and `*len` describe a buffer the caller must free with
/// `palisade_buffer_free()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_export(ctx: *mut PalisadeFilter, buf: *mut *mut u8, len: *mut size_t) -> c_int {
    if buf.is_null() || len.is_null() {
        set_last_error("output pointer is null".into());
        return -libc::EINVAL;
    }
    // SAFETY: forwarded caller guarantee
    unsafe {
        with_filter(ctx, |col| {
            let view = CollectionExport::from_collection(col);
            let bytes = export::encode(&view)
                .map_err(|e| FilterError::InvalidArgument(format!("export failed: {e}")))?;
            let boxed = bytes.into_boxed_slice();
            // SAFETY: both pointers checked non-null, caller guarantees they are writable
            *len = boxed.len();
            *buf = Box::into_raw(boxed).cast::<u8>();
            Ok(())
        })
    }
}

/// Free a buffer returned by `palisade_export()`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_buffer_free(buf: *mut u8, len: size_t) {
    if !buf.is_null() {
        // SAFETY: Caller passes back the pointer and length from palisade_export
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(buf, len)) });
    }
}

/// Get library version
#[unsafe(no_mangle)]
pub extern "C" fn palisade_version() -> *const c_char {
    static VERSION: Lazy<CString> =
        Lazy::new(|| CString::new(env!("CARGO_PKG_VERSION")).unwrap_or_default());
    VERSION.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(text: &str) -> CString {
        CString::new(text).unwrap()
    }

    fn last_error() -> String {
        let msg = palisade_last_error();
        assert!(!msg.is_null());
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }

    #[test]
    fn version_matches_crate() {
        let version = unsafe { CStr::from_ptr(palisade_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn null_handles_are_rejected() {
        let rc = unsafe { palisade_rule_add(ptr::null_mut(), PALISADE_ACT_ALLOW, 0, 0, ptr::null()) };
        assert_eq!(rc, -libc::EINVAL);
        assert!(last_error().contains("null"));
        unsafe { palisade_release(ptr::null_mut()) };
    }

    #[test]
    fn invalid_default_action() {
        assert!(palisade_init(0x1234_0000).is_null());
        assert!(last_error().contains("invalid action"));
    }

    #[test]
    fn resolved_numbers_use_the_handle_native() {
        let Some(native) = arch::native() else {
            return;
        };
        let ctx = palisade_init(PALISADE_ACT_KILL);
        let col = unsafe { &(*ctx).inner };
        assert_eq!(col.native().token(), native.token());
        assert_eq!(palisade_arch_native(), native.token().0);

        let read = unsafe { palisade_syscall_resolve_name(name("read").as_ptr()) };
        assert_eq!(Some(read), col.native().resolve_name("read"));
        unsafe { palisade_release(ctx) };
    }

    #[test]
    fn rules_attributes_and_transactions() {
        if arch::native().is_none() {
            return;
        }
        let ctx = palisade_init(PALISADE_ACT_KILL);
        assert!(!ctx.is_null());

        let write = unsafe { palisade_syscall_resolve_name(name("write").as_ptr()) };
        assert!(write >= 0);
        assert_eq!(
            unsafe { palisade_syscall_resolve_name(name("frobnicate").as_ptr()) },
            PALISADE_SYSCALL_ERROR
        );

        let fd = PalisadeArgCmp { arg: 0, op: PALISADE_CMP_EQ, datum_a: 1, datum_b: 0 };
        assert_eq!(unsafe { palisade_rule_add_exact(ctx, PALISADE_ACT_ALLOW, write, 1, &fd) }, 0);
        assert_eq!(
            unsafe { palisade_rule_add_exact(ctx, PALISADE_ACT_TRAP, write, 1, &fd) },
            -libc::EEXIST
        );
        let bad_op = PalisadeArgCmp { op: 42, ..fd };
        assert_eq!(unsafe { palisade_rule_add(ctx, PALISADE_ACT_ALLOW, write, 1, &bad_op) }, -libc::EINVAL);

        let mut value = 99;
        assert_eq!(unsafe { palisade_attr_get(ctx, PALISADE_ATTR_CTL_NNP, &mut value) }, 0);
        assert_eq!(value, 1);
        assert_eq!(
            unsafe { palisade_attr_set(ctx, PALISADE_ATTR_ACT_DEFAULT, PALISADE_ACT_ALLOW) },
            -libc::EACCES
        );
        assert_eq!(unsafe { palisade_attr_get(ctx, 17, &mut value) }, -libc::ENOENT);

        assert_eq!(unsafe { palisade_arch_exist(ctx, 0) }, 0);
        assert_eq!(unsafe { palisade_arch_add(ctx, 0) }, -libc::EEXIST);
        assert_eq!(unsafe { palisade_arch_add(ctx, 0xdead) }, -libc::EINVAL);

        assert_eq!(unsafe { palisade_transaction_start(ctx) }, 0);
        assert_eq!(unsafe { palisade_arch_remove(ctx, 0) }, 0);
        assert_eq!(unsafe { palisade_arch_exist(ctx, 0) }, -libc::ENOENT);
        assert_eq!(unsafe { palisade_transaction_abort(ctx) }, 0);
        assert_eq!(unsafe { palisade_arch_exist(ctx, 0) }, 0);
        assert_eq!(unsafe { palisade_transaction_commit(ctx) }, -libc::ENOENT);

        let mut buf: *mut u8 = ptr::null_mut();
        let mut len: size_t = 0;
        assert_eq!(unsafe { palisade_export(ctx, &mut buf, &mut len) }, 0);
        let bytes = unsafe { std::slice::from_raw_parts(buf, len) };
        let view: CollectionExport = export::decode(bytes).unwrap();
        assert_eq!(view.filters.len(), 1);
        assert!(view.filters[0].syscalls.iter().any(|s| s.number == write));
        unsafe { palisade_buffer_free(buf, len) };

        unsafe { palisade_release(ctx) };
    }

    #[test]
    fn merge_frees_source() {
        let Some(native) = arch::native() else {
            return;
        };
        let dst = palisade_init(PALISADE_ACT_KILL);
        let other = arch::BUILTIN
            .iter()
            .copied()
            .find(|a| a.token() != native.token() && a.endian() == native.endian())
            .unwrap();

        let src = palisade_init(PALISADE_ACT_KILL);
        assert_eq!(unsafe { palisade_arch_add(src, other.token().0) }, 0);
        assert_eq!(unsafe { palisade_arch_remove(src, 0) }, 0);
        assert_eq!(unsafe { palisade_merge(dst, src) }, 0);
        assert_eq!(unsafe { palisade_arch_exist(dst, other.token().0) }, 0);

        let clash = palisade_init(PALISADE_ACT_KILL);
        assert_eq!(unsafe { palisade_merge(dst, clash) }, -libc::EEXIST);
        unsafe { palisade_release(clash) };
        unsafe { palisade_release(dst) };
    }
}
