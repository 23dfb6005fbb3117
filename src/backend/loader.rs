//! # Backend Loader & Instance Manager
//!
//! Dynamically loads a named backend plug-in and manages the instances
//! driver-outputs open against it. Loaded images are kept in a
//! process-wide arena keyed by backend name, each behind an
//! `Arc<BackendImage>`; the arena drops an image once its last `Arc`
//! clone goes away.
//!
//! Instance handles are exclusively owned by one driver-output and
//! touched only from the single core thread, so the raw FFI handle
//! inside [`Instance`] is safe to mark `Send` even though `*mut c_void`
//! is not `Send` by default.

use std::ffi::{c_void, CString};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use libloading::{Library, Symbol};

use crate::backend::abi::encode_row;
use crate::error::BackendError;

type RawHandle = *mut c_void;

type OpenFn = unsafe extern "C" fn(args: *const *const c_char, argc: usize, var_count: usize) -> RawHandle;
type CloseFn = unsafe extern "C" fn(RawHandle);
type AddFn = unsafe extern "C" fn(RawHandle, *const u8, usize) -> c_int;
type DelFn = unsafe extern "C" fn(RawHandle, *const u8, usize) -> c_int;
type ResetFn = unsafe extern "C" fn(RawHandle);
type PrepareFn = unsafe extern "C" fn(RawHandle) -> c_int;
type CommitFn = unsafe extern "C" fn(RawHandle) -> c_int;
type RollbackFn = unsafe extern "C" fn(RawHandle) -> c_int;
type CollaborateFn = unsafe extern "C" fn(RawHandle, RawHandle) -> c_int;

/// A loaded backend image: the open `.so`/`.dylib`/`.dll` plus its nine
/// resolved entry points. Kept alive by `Arc` for as long as any instance references
/// it.
pub struct BackendImage {
    _lib: Library,
    open: Symbol<'static, OpenFn>,
    close: Symbol<'static, CloseFn>,
    add: Symbol<'static, AddFn>,
    del: Symbol<'static, DelFn>,
    reset: Symbol<'static, ResetFn>,
    prepare: Option<Symbol<'static, PrepareFn>>,
    commit: Symbol<'static, CommitFn>,
    rollback: Symbol<'static, RollbackFn>,
    collaborate: Symbol<'static, CollaborateFn>,
}

// SAFETY: the raw symbols borrow from `_lib`, which this struct owns and
// drops last (field drop order); no symbol outlives its library.
unsafe impl Send for BackendImage {}
unsafe impl Sync for BackendImage {}

impl BackendImage {
    fn load(path: &Path) -> Result<Self, BackendError> {
        let lib = unsafe { Library::new(path) }.map_err(|source| BackendError::Load {
            path: path.display().to_string(),
            source,
        })?;

        unsafe fn required_symbol<'l, T>(
            lib: &'l Library,
            name: &'static [u8],
            backend: &str,
        ) -> Result<Symbol<'static, T>, BackendError> {
            let sym: Symbol<'l, T> = lib.get(name).map_err(|_| BackendError::MissingSymbol {
                backend: backend.to_string(),
                symbol: String::from_utf8_lossy(name).into_owned(),
            })?;
            // Extend the lifetime: valid because `lib` (and thus every
            // symbol borrowed from it) is kept alive for as long as the
            // enclosing `BackendImage` lives.
            Ok(std::mem::transmute::<Symbol<'l, T>, Symbol<'static, T>>(sym))
        }

        let backend_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let open = unsafe { required_symbol(&lib, b"pulley_backend_open\0", &backend_name)? };
        let close = unsafe { required_symbol(&lib, b"pulley_backend_close\0", &backend_name)? };
        let add = unsafe { required_symbol(&lib, b"pulley_backend_add\0", &backend_name)? };
        let del = unsafe { required_symbol(&lib, b"pulley_backend_del\0", &backend_name)? };
        let reset = unsafe { required_symbol(&lib, b"pulley_backend_reset\0", &backend_name)? };
        let commit = unsafe { required_symbol(&lib, b"pulley_backend_commit\0", &backend_name)? };
        let rollback = unsafe { required_symbol(&lib, b"pulley_backend_rollback\0", &backend_name)? };
        let collaborate = unsafe { required_symbol(&lib, b"pulley_backend_collaborate\0", &backend_name)? };
        let prepare = unsafe { lib.get::<PrepareFn>(b"pulley_backend_prepare\0") }
            .ok()
            .map(|sym: Symbol<PrepareFn>| unsafe { std::mem::transmute::<Symbol<PrepareFn>, Symbol<'static, PrepareFn>>(sym) });

        Ok(BackendImage {
            _lib: lib,
            open,
            close,
            add,
            del,
            reset,
            prepare,
            commit,
            rollback,
            collaborate,
        })
    }
}

/// Process-wide table of loaded images, keyed by backend name: multiple
/// instances of the same backend share one loaded image.
#[derive(Default)]
pub struct BackendArena {
    images: DashMap<String, Arc<BackendImage>>,
    dir: Option<PathBuf>,
}

impl BackendArena {
    pub fn new(backend_dir: Option<PathBuf>) -> Self {
        BackendArena {
            images: DashMap::new(),
            dir: backend_dir,
        }
    }

    fn image_for(&self, name: &str) -> Result<Arc<BackendImage>, BackendError> {
        if let Some(existing) = self.images.get(name) {
            return Ok(existing.clone());
        }
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(BackendError::InvalidName(name.to_string()));
        }
        let dir = self.dir.clone().unwrap_or_else(|| PathBuf::from("."));
        let file_name = format!(
            "{}{name}{}",
            std::env::consts::DLL_PREFIX,
            std::env::consts::DLL_SUFFIX
        );
        let path = dir.join(file_name);
        let image = Arc::new(BackendImage::load(&path)?);
        self.images.insert(name.to_string(), image.clone());
        Ok(image)
    }

    /// Open a new instance of the named backend.
    pub fn open(&self, name: &str, args: &[String], var_count: usize) -> Result<Instance, BackendError> {
        let image = self.image_for(name)?;
        let c_args: Vec<CString> = args.iter().map(|a| CString::new(a.as_str()).unwrap_or_default()).collect();
        let ptrs: Vec<*const c_char> = c_args.iter().map(|c| c.as_ptr()).collect();

        let handle = unsafe { (image.open)(ptrs.as_ptr(), ptrs.len(), var_count) };
        if handle.is_null() {
            return Err(BackendError::OpenFailed {
                backend: name.to_string(),
            });
        }

        Ok(Instance {
            image,
            handle,
            state: InstanceState::Open,
            backend_name: name.to_string(),
        })
    }
}

/// State machine of one open instance: `Open -> (InTransaction -> Prepared?
/// -> Commit | Rollback) -> Open | Closed`. `Uninitialized` is not
/// represented: an `Instance` only exists once `open()` has already
/// succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceState {
    Open,
    InTransaction,
    Prepared,
    Closed,
}

/// A single driver-output's handle into a loaded backend.
pub struct Instance {
    image: Arc<BackendImage>,
    handle: RawHandle,
    state: InstanceState,
    backend_name: String,
}

// SAFETY: touched only from the single core thread; the raw
// handle is opaque to any other component.
unsafe impl Send for Instance {}

impl Instance {
    fn require(&self, allowed: &[InstanceState], op: &'static str) -> Result<(), BackendError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(BackendError::InvalidState {
                backend: self.backend_name.clone(),
                op,
            })
        }
    }

    pub fn add(&mut self, values: &[Vec<u8>]) -> Result<(), BackendError> {
        self.require(&[InstanceState::Open, InstanceState::InTransaction], "add")?;
        let encoded = encode_row(values);
        let rc = unsafe { (self.image.add)(self.handle, encoded.as_ptr(), encoded.len()) };
        self.state = InstanceState::InTransaction;
        self.check_rc(rc, "add")
    }

    pub fn del(&mut self, values: &[Vec<u8>]) -> Result<(), BackendError> {
        self.require(&[InstanceState::Open, InstanceState::InTransaction], "del")?;
        let encoded = encode_row(values);
        let rc = unsafe { (self.image.del)(self.handle, encoded.as_ptr(), encoded.len()) };
        self.state = InstanceState::InTransaction;
        self.check_rc(rc, "del")
    }

    pub fn reset(&mut self) -> Result<(), BackendError> {
        self.require(&[InstanceState::Open, InstanceState::InTransaction, InstanceState::Prepared], "reset")?;
        unsafe { (self.image.reset)(self.handle) };
        self.state = InstanceState::Open;
        Ok(())
    }

    /// Optional vote-to-commit; a backend without `prepare` is treated
    /// as always voting yes, since that symbol may be absent from a
    /// plug-in's exports.
    pub fn prepare(&mut self) -> Result<bool, BackendError> {
        self.require(&[InstanceState::InTransaction], "prepare")?;
        let vote = match &self.image.prepare {
            Some(prepare) => unsafe { prepare(self.handle) } != 0,
            None => true,
        };
        if vote {
            self.state = InstanceState::Prepared;
        }
        Ok(vote)
    }

    pub fn commit(&mut self) -> Result<(), BackendError> {
        self.require(&[InstanceState::InTransaction, InstanceState::Prepared], "commit")?;
        let rc = unsafe { (self.image.commit)(self.handle) };
        self.state = InstanceState::Open;
        self.check_rc(rc, "commit")
    }

    pub fn rollback(&mut self) -> Result<(), BackendError> {
        self.require(&[InstanceState::InTransaction, InstanceState::Prepared], "rollback")?;
        let rc = unsafe { (self.image.rollback)(self.handle) };
        self.state = InstanceState::Open;
        self.check_rc(rc, "rollback")
    }

    /// Enroll `other` into the same transaction as `self`. Called
    /// pairwise over every instance touched by a change before the
    /// controller's prepare/commit sweep, so a single backend's abort
    /// vote rolls back every enrolled instance, not just its own.
    pub fn collaborate(&mut self, other: &mut Instance) -> Result<(), BackendError> {
        self.require(&[InstanceState::Open, InstanceState::InTransaction], "collaborate")?;
        let rc = unsafe { (self.image.collaborate)(self.handle, other.handle) };
        self.check_rc(rc, "collaborate")
    }

    fn check_rc(&self, rc: c_int, op: &'static str) -> Result<(), BackendError> {
        if rc == 0 {
            Ok(())
        } else {
            Err(BackendError::InvalidState {
                backend: self.backend_name.clone(),
                op,
            })
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe { (self.image.close)(self.handle) };
        self.state = InstanceState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_name_with_path_separator_is_rejected() {
        let arena = BackendArena::new(None);
        let err = arena.open("../evil", &[], 0).unwrap_err();
        assert!(matches!(err, BackendError::InvalidName(_)));
    }
}
