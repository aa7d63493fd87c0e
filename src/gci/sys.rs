//! Raw C declarations of the thread-safe GCI and the runtime loader for its shared library.

use crate::gci::error::{ErrorRecord, GciError, MAX_ERR_ARGS};
use crate::gci::oop::Oop;
use nix::libc::{self, c_char, c_int, c_uint, c_ushort, c_void, size_t, ssize_t};
use smallvec::SmallVec;
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};

pub type OopType = u64;
pub type BoolType = c_int;
pub type ByteType = u8;
pub type GciSession = *mut c_void;

pub const GCI_ERR_STR_SIZE: usize = 1024;
pub const GCI_ERR_REASON_SIZE: usize = 1024;

/// Traversal status codes of `GciTsFetchTraversal`/`GciTsMoreTraversal`.
pub const TRAV_COMPLETE: c_int = 1;
pub const TRAV_MORE: c_int = 0;

#[repr(C)]
pub struct GciErrSType {
    pub category: OopType,
    pub context: OopType,
    pub exception_obj: OopType,
    pub args: [OopType; MAX_ERR_ARGS],
    pub number: c_int,
    pub arg_count: c_int,
    pub fatal: u8,
    pub message: [c_char; GCI_ERR_STR_SIZE + 1],
    pub reason: [c_char; GCI_ERR_REASON_SIZE + 1],
}

impl GciErrSType {
    pub fn boxed() -> Box<Self> {
        Box::new(Self {
            category: Oop::NIL.raw(),
            context: Oop::NIL.raw(),
            exception_obj: Oop::NIL.raw(),
            args: [Oop::NIL.raw(); MAX_ERR_ARGS],
            number: 0,
            arg_count: 0,
            fatal: 0,
            message: [0; GCI_ERR_STR_SIZE + 1],
            reason: [0; GCI_ERR_REASON_SIZE + 1],
        })
    }

    pub fn to_record(&self) -> ErrorRecord {
        let arg_count = self.arg_count.clamp(0, MAX_ERR_ARGS as c_int) as usize;
        ErrorRecord {
            category: Oop::from_raw(self.category),
            context: Oop::from_raw(self.context),
            exception_obj: Oop::from_raw(self.exception_obj),
            args: self.args[..arg_count]
                .iter()
                .map(|raw| Oop::from_raw(*raw))
                .collect::<SmallVec<_>>(),
            number: self.number,
            arg_count: self.arg_count,
            fatal: self.fatal != 0,
            message: c_chars_to_string(&self.message),
            reason: c_chars_to_string(&self.reason),
        }
    }
}

fn c_chars_to_string(chars: &[c_char]) -> String {
    let bytes: Vec<u8> = chars
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[repr(C)]
#[derive(Default)]
pub struct GciTsObjInfo {
    pub obj_id: OopType,
    pub obj_class: OopType,
    pub obj_size: i64,
    pub named_size: c_int,
    pub access: c_uint,
    pub object_security_policy_id: c_ushort,
    pub bits: c_ushort,
}

#[repr(C)]
pub struct GciClampedTravArgsSType {
    pub clamp_spec: OopType,
    pub result_oop: OopType,
    pub trav_buff_size: c_int,
    pub level: c_int,
    pub retrieval_flags: c_int,
    pub is_rpc: BoolType,
}

/// Handle of a `dlopen`ed library.
pub struct DynLib {
    handle: *mut c_void,
    path: PathBuf,
}

// SAFETY: dl* functions are thread safe, the handle is only used to resolve symbols.
unsafe impl Send for DynLib {}
unsafe impl Sync for DynLib {}

fn dl_error() -> String {
    // SAFETY: dlerror returns a thread local, null terminated message or null.
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            "unknown dl error".to_string()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

impl DynLib {
    pub fn open(path: &Path) -> Result<Self, GciError> {
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| GciError::Library(format!("invalid library path {}", path.display())))?;
        // SAFETY: c_path is a valid C string.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(GciError::Library(format!(
                "load {}: {}",
                path.display(),
                dl_error()
            )));
        }
        Ok(Self {
            handle,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, name: &str) -> Result<*mut c_void, GciError> {
        let c_name = CString::new(name).map_err(|_| GciError::Library(name.to_string()))?;
        // SAFETY: handle is a live dlopen handle, c_name is a valid C string.
        let sym = unsafe { libc::dlsym(self.handle, c_name.as_ptr()) };
        if sym.is_null() {
            return Err(GciError::Library(format!(
                "symbol {name} not found in {}: {}",
                self.path.display(),
                dl_error()
            )));
        }
        Ok(sym)
    }
}

impl Drop for DynLib {
    fn drop(&mut self) {
        // SAFETY: handle was returned by dlopen and is closed once.
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

macro_rules! gci_api {
    ($($name:ident: fn($($arg:ty),* $(,)?) -> $ret:ty;)+) => {
        /// Function table of the thread-safe GCI.
        #[allow(non_snake_case)]
        pub struct GciTsApi {
            $(pub $name: unsafe extern "C" fn($($arg),*) -> $ret,)+
        }

        impl GciTsApi {
            /// Resolve every entry point, fails on the first missing symbol.
            pub fn resolve(lib: &DynLib) -> Result<Self, GciError> {
                Ok(Self {
                    $(
                        // SAFETY: the symbol is declared with this signature by the GCI headers.
                        $name: unsafe {
                            std::mem::transmute::<*mut c_void, unsafe extern "C" fn($($arg),*) -> $ret>(
                                lib.symbol(stringify!($name))?,
                            )
                        },
                    )+
                })
            }
        }
    };
}

type ErrPtr = *mut GciErrSType;

gci_api! {
    GciTsVersion: fn(*mut c_char, size_t) -> c_uint;
    GciTsLogin: fn(
        *const c_char,
        *const c_char,
        *const c_char,
        BoolType,
        *const c_char,
        *const c_char,
        *const c_char,
        c_uint,
        c_int,
        *mut BoolType,
        ErrPtr,
    ) -> GciSession;
    GciTsLogout: fn(GciSession, ErrPtr) -> BoolType;
    GciTsAbort: fn(GciSession, ErrPtr) -> BoolType;
    GciTsBegin: fn(GciSession, ErrPtr) -> BoolType;
    GciTsCommit: fn(GciSession, ErrPtr) -> BoolType;
    GciTsResolveSymbol: fn(GciSession, *const c_char, OopType, ErrPtr) -> OopType;
    GciTsExecute: fn(GciSession, *const c_char, OopType, OopType, OopType, c_int, c_ushort, ErrPtr)
        -> OopType;
    GciTsExecuteFetchBytes: fn(
        GciSession,
        *const c_char,
        ssize_t,
        OopType,
        OopType,
        OopType,
        *mut ByteType,
        ssize_t,
        ErrPtr,
    ) -> ssize_t;
    GciTsPerform: fn(
        GciSession,
        OopType,
        OopType,
        *const c_char,
        *const OopType,
        c_int,
        c_int,
        c_ushort,
        ErrPtr,
    ) -> OopType;
    GciTsPerformFetchBytes: fn(
        GciSession,
        OopType,
        *const c_char,
        *const OopType,
        c_int,
        *mut ByteType,
        ssize_t,
        ErrPtr,
    ) -> ssize_t;
    GciTsNbExecute: fn(
        GciSession,
        *const c_char,
        OopType,
        OopType,
        OopType,
        c_int,
        c_ushort,
        ErrPtr,
    ) -> BoolType;
    GciTsNbPerform: fn(
        GciSession,
        OopType,
        OopType,
        *const c_char,
        *const OopType,
        c_int,
        c_int,
        c_ushort,
        ErrPtr,
    ) -> BoolType;
    GciTsNbPoll: fn(GciSession, c_int, ErrPtr) -> c_int;
    GciTsNbResult: fn(GciSession, ErrPtr) -> OopType;
    GciTsBreak: fn(GciSession, BoolType, ErrPtr) -> BoolType;
    GciTsClearStack: fn(GciSession, OopType, ErrPtr) -> BoolType;
    GciTsContinueWith: fn(GciSession, OopType, OopType, ErrPtr, c_int, ErrPtr) -> OopType;
    GciTsFetchClass: fn(GciSession, OopType, ErrPtr) -> OopType;
    GciTsFetchSize: fn(GciSession, OopType, ErrPtr) -> i64;
    GciTsFetchVaryingSize: fn(GciSession, OopType, ErrPtr) -> i64;
    GciTsFetchObjInfo: fn(
        GciSession,
        OopType,
        BoolType,
        *mut GciTsObjInfo,
        *mut ByteType,
        size_t,
        ErrPtr,
    ) -> i64;
    GciTsFetchBytes: fn(GciSession, OopType, i64, *mut ByteType, i64, ErrPtr) -> i64;
    GciTsFetchUtf8Bytes: fn(
        GciSession,
        OopType,
        i64,
        *mut ByteType,
        i64,
        *mut OopType,
        ErrPtr,
        c_int,
    ) -> i64;
    GciTsStoreBytes: fn(GciSession, OopType, i64, *const ByteType, i64, OopType, ErrPtr) -> BoolType;
    GciTsFetchOops: fn(GciSession, OopType, i64, *mut OopType, c_int, ErrPtr) -> c_int;
    GciTsStoreOops: fn(GciSession, OopType, i64, *const OopType, c_int, ErrPtr, BoolType) -> BoolType;
    GciTsNewObj: fn(GciSession, OopType, ErrPtr) -> OopType;
    GciTsNewString_: fn(GciSession, *const c_char, size_t, ErrPtr) -> OopType;
    GciTsNewSymbol: fn(GciSession, *const c_char, ErrPtr) -> OopType;
    GciTsCompileMethod: fn(
        GciSession,
        OopType,
        OopType,
        OopType,
        OopType,
        OopType,
        c_int,
        c_ushort,
        ErrPtr,
    ) -> OopType;
    GciTsI64ToOop: fn(GciSession, i64, ErrPtr) -> OopType;
    GciTsOopToI64: fn(GciSession, OopType, *mut i64, ErrPtr) -> BoolType;
    GciTsDoubleToOop: fn(GciSession, f64, ErrPtr) -> OopType;
    GciTsOopToDouble: fn(GciSession, OopType, *mut f64, ErrPtr) -> BoolType;
    GciTsFetchTraversal: fn(
        GciSession,
        *const OopType,
        c_int,
        *mut GciClampedTravArgsSType,
        *mut u8,
        ErrPtr,
    ) -> c_int;
    GciTsMoreTraversal: fn(GciSession, *mut u8, ErrPtr) -> c_int;
    GciTsStoreTrav: fn(GciSession, *mut u8, c_int, ErrPtr) -> BoolType;
}
