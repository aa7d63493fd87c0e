use crate::gci::error::{ErrorRecord, GciError};
use crate::gci::oop::Oop;
use crate::gci::sys::{
    BoolType, DynLib, GciClampedTravArgsSType, GciErrSType, GciSession, GciTsApi, GciTsObjInfo,
    TRAV_COMPLETE, TRAV_MORE,
};
use crate::gci::traversal::{TraversalBuffer, TraversalStatus};
use crate::gci::{
    ClampedTravArgs, CompileRequest, ExecRequest, Gci, LoginParams, ObjInfo, PerformRequest,
    PollStatus, SessionHandle, Utf8Fetch,
};
use nix::libc::{c_char, c_int, ssize_t};
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr;

const VERSION_BUF_SIZE: usize = 256;

/// Thread-safe GCI shared library loaded at runtime.
pub struct GciLibrary {
    api: GciTsApi,
    lib: DynLib,
}

fn c_string(s: &str) -> Result<CString, GciError> {
    CString::new(s).map_err(|_| GciError::InvalidArgument(format!("interior NUL in {s:?}")))
}

fn opt_c_string(s: Option<&str>) -> Result<Option<CString>, GciError> {
    s.map(c_string).transpose()
}

fn opt_ptr(s: &Option<CString>) -> *const c_char {
    s.as_ref().map(|s| s.as_ptr()).unwrap_or(ptr::null())
}

#[inline(always)]
fn sess(handle: SessionHandle) -> GciSession {
    handle.0 as GciSession
}

fn raw_oops(oops: &[Oop]) -> Vec<u64> {
    oops.iter().map(|o| o.raw()).collect()
}

fn c_bool(b: bool) -> BoolType {
    b as BoolType
}

fn arg_count(args: &[Oop]) -> Result<c_int, GciError> {
    c_int::try_from(args.len())
        .map_err(|_| GciError::InvalidArgument(format!("too many arguments: {}", args.len())))
}

impl GciLibrary {
    /// Names probed when no explicit library path is configured.
    const DEFAULT_NAME: &'static str = "libgcits.so";

    pub fn load(path: &Path) -> Result<Self, GciError> {
        let lib = DynLib::open(path)?;
        let api = GciTsApi::resolve(&lib)?;
        log::info!(target: "gci", "gci library loaded from {}", lib.path().display());
        Ok(Self { api, lib })
    }

    /// Locate the library: explicit path, then `$GEMSTONE/lib/libgcits*.so`,
    /// then the dynamic linker search path.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Some(gemstone) = std::env::var_os("GEMSTONE") {
            let lib_dir = Path::new(&gemstone).join("lib");
            let candidate = std::fs::read_dir(&lib_dir).ok().and_then(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.starts_with("libgcits") && n.ends_with(".so"))
                            .unwrap_or(false)
                    })
                    .max()
            });
            if let Some(candidate) = candidate {
                return candidate;
            }
        }
        PathBuf::from(Self::DEFAULT_NAME)
    }

    pub fn path(&self) -> &Path {
        self.lib.path()
    }

    /// Run a call with a fresh error record and convert the pair into a result.
    fn call<T>(&self, f: impl FnOnce(*mut GciErrSType) -> T) -> Result<T, GciError> {
        let mut err = GciErrSType::boxed();
        let value = f(&mut *err);
        err.to_record().check(value)
    }

    fn call_bool(&self, f: impl FnOnce(*mut GciErrSType) -> BoolType) -> Result<(), GciError> {
        let mut err = GciErrSType::boxed();
        let ok = f(&mut *err);
        let mut record = err.to_record();
        if ok == 0 && record.is_success() {
            record.number = -1;
            record.message = "call failed without an error record".to_string();
        }
        record.check(())
    }

    fn fetch_into(
        &self,
        max: usize,
        f: impl FnOnce(*mut u8, ssize_t, *mut GciErrSType) -> ssize_t,
    ) -> Result<Vec<u8>, GciError> {
        let mut buf = vec![0u8; max];
        let n = self.call(|err| f(buf.as_mut_ptr(), max as ssize_t, err))?;
        buf.truncate((n.max(0) as usize).min(max));
        Ok(buf)
    }
}

impl Gci for GciLibrary {
    fn version(&self) -> String {
        let mut buf = vec![0 as c_char; VERSION_BUF_SIZE];
        // SAFETY: buffer is writable for VERSION_BUF_SIZE bytes.
        unsafe { (self.api.GciTsVersion)(buf.as_mut_ptr(), VERSION_BUF_SIZE) };
        let bytes: Vec<u8> = buf.iter().take_while(|c| **c != 0).map(|c| *c as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn login(&self, params: &LoginParams) -> Result<SessionHandle, GciError> {
        let stone = c_string(&params.stone)?;
        let gem = c_string(&params.gem)?;
        let user = c_string(&params.username)?;
        let password = c_string(&params.password)?;
        let host_user = opt_c_string(params.host_username.as_deref())?;
        let host_password = opt_c_string(params.host_password.as_deref())?;
        let mut executed_session_init: BoolType = 0;

        let session = self.call(|err| unsafe {
            (self.api.GciTsLogin)(
                stone.as_ptr(),
                opt_ptr(&host_user),
                opt_ptr(&host_password),
                0,
                gem.as_ptr(),
                user.as_ptr(),
                password.as_ptr(),
                params.login_flags,
                0,
                &mut executed_session_init,
                err,
            )
        })?;
        if session.is_null() {
            return Err(ErrorRecord::new(-1, "login returned no session").into());
        }
        log::debug!(
            target: "gci",
            "logged in to {}, session init executed: {}",
            params.stone,
            executed_session_init != 0
        );
        Ok(SessionHandle(session as usize))
    }

    fn logout(&self, session: SessionHandle) -> Result<(), GciError> {
        self.call_bool(|err| unsafe { (self.api.GciTsLogout)(sess(session), err) })
    }

    fn abort(&self, session: SessionHandle) -> Result<(), GciError> {
        self.call_bool(|err| unsafe { (self.api.GciTsAbort)(sess(session), err) })
    }

    fn begin(&self, session: SessionHandle) -> Result<(), GciError> {
        self.call_bool(|err| unsafe { (self.api.GciTsBegin)(sess(session), err) })
    }

    fn commit(&self, session: SessionHandle) -> Result<bool, GciError> {
        self.call(|err| unsafe { (self.api.GciTsCommit)(sess(session), err) != 0 })
    }

    fn resolve_symbol(
        &self,
        session: SessionHandle,
        name: &str,
        symbol_list: Oop,
    ) -> Result<Oop, GciError> {
        let name = c_string(name)?;
        self.call(|err| unsafe {
            (self.api.GciTsResolveSymbol)(sess(session), name.as_ptr(), symbol_list.raw(), err)
        })
        .map(Oop::from_raw)
    }

    fn execute(&self, session: SessionHandle, req: &ExecRequest) -> Result<Oop, GciError> {
        let source = c_string(req.source)?;
        self.call(|err| unsafe {
            (self.api.GciTsExecute)(
                sess(session),
                source.as_ptr(),
                req.source_class.raw(),
                req.context.raw(),
                req.symbol_list.raw(),
                req.flags,
                req.env,
                err,
            )
        })
        .map(Oop::from_raw)
    }

    fn execute_fetch_bytes(
        &self,
        session: SessionHandle,
        req: &ExecRequest,
        max: usize,
    ) -> Result<Vec<u8>, GciError> {
        let source = c_string(req.source)?;
        self.fetch_into(max, |buf, cap, err| unsafe {
            (self.api.GciTsExecuteFetchBytes)(
                sess(session),
                source.as_ptr(),
                req.source.len() as ssize_t,
                req.source_class.raw(),
                req.context.raw(),
                req.symbol_list.raw(),
                buf,
                cap,
                err,
            )
        })
    }

    fn perform(&self, session: SessionHandle, req: &PerformRequest) -> Result<Oop, GciError> {
        let selector = c_string(req.selector)?;
        let args = raw_oops(req.args);
        let num_args = arg_count(req.args)?;
        self.call(|err| unsafe {
            (self.api.GciTsPerform)(
                sess(session),
                req.receiver.raw(),
                Oop::ILLEGAL.raw(),
                selector.as_ptr(),
                args.as_ptr(),
                num_args,
                req.flags,
                req.env,
                err,
            )
        })
        .map(Oop::from_raw)
    }

    fn perform_fetch_bytes(
        &self,
        session: SessionHandle,
        req: &PerformRequest,
        max: usize,
    ) -> Result<Vec<u8>, GciError> {
        let selector = c_string(req.selector)?;
        let args = raw_oops(req.args);
        let num_args = arg_count(req.args)?;
        self.fetch_into(max, |buf, cap, err| unsafe {
            (self.api.GciTsPerformFetchBytes)(
                sess(session),
                req.receiver.raw(),
                selector.as_ptr(),
                args.as_ptr(),
                num_args,
                buf,
                cap,
                err,
            )
        })
    }

    fn compile_method(
        &self,
        session: SessionHandle,
        req: &CompileRequest,
    ) -> Result<Oop, GciError> {
        self.call(|err| unsafe {
            (self.api.GciTsCompileMethod)(
                sess(session),
                req.source.raw(),
                req.class.raw(),
                req.category.raw(),
                req.symbol_list.raw(),
                req.override_selector.raw(),
                req.flags,
                req.env,
                err,
            )
        })
        .map(Oop::from_raw)
    }

    fn nb_execute(&self, session: SessionHandle, req: &ExecRequest) -> Result<(), GciError> {
        let source = c_string(req.source)?;
        self.call_bool(|err| unsafe {
            (self.api.GciTsNbExecute)(
                sess(session),
                source.as_ptr(),
                req.source_class.raw(),
                req.context.raw(),
                req.symbol_list.raw(),
                req.flags,
                req.env,
                err,
            )
        })
    }

    fn nb_perform(&self, session: SessionHandle, req: &PerformRequest) -> Result<(), GciError> {
        let selector = c_string(req.selector)?;
        let args = raw_oops(req.args);
        let num_args = arg_count(req.args)?;
        self.call_bool(|err| unsafe {
            (self.api.GciTsNbPerform)(
                sess(session),
                req.receiver.raw(),
                Oop::ILLEGAL.raw(),
                selector.as_ptr(),
                args.as_ptr(),
                num_args,
                req.flags,
                req.env,
                err,
            )
        })
    }

    fn nb_poll(&self, session: SessionHandle, timeout_ms: i32) -> Result<PollStatus, GciError> {
        let status =
            self.call(|err| unsafe { (self.api.GciTsNbPoll)(sess(session), timeout_ms, err) })?;
        match status {
            1 => Ok(PollStatus::Ready),
            0 => Ok(PollStatus::NotReady),
            _ => Err(ErrorRecord::new(-1, format!("poll failed with status {status}")).into()),
        }
    }

    fn nb_result(&self, session: SessionHandle) -> Result<Oop, GciError> {
        self.call(|err| unsafe { (self.api.GciTsNbResult)(sess(session), err) })
            .map(Oop::from_raw)
    }

    fn interrupt(&self, session: SessionHandle, hard: bool) -> Result<(), GciError> {
        self.call_bool(|err| unsafe { (self.api.GciTsBreak)(sess(session), c_bool(hard), err) })
    }

    fn clear_stack(&self, session: SessionHandle, process: Oop) -> Result<(), GciError> {
        self.call_bool(|err| unsafe {
            (self.api.GciTsClearStack)(sess(session), process.raw(), err)
        })
    }

    fn continue_with(
        &self,
        session: SessionHandle,
        process: Oop,
        replace_top: Oop,
        flags: i32,
    ) -> Result<Oop, GciError> {
        self.call(|err| unsafe {
            (self.api.GciTsContinueWith)(
                sess(session),
                process.raw(),
                replace_top.raw(),
                ptr::null_mut(),
                flags,
                err,
            )
        })
        .map(Oop::from_raw)
    }

    fn fetch_class(&self, session: SessionHandle, oop: Oop) -> Result<Oop, GciError> {
        self.call(|err| unsafe { (self.api.GciTsFetchClass)(sess(session), oop.raw(), err) })
            .map(Oop::from_raw)
    }

    fn fetch_size(&self, session: SessionHandle, oop: Oop) -> Result<i64, GciError> {
        self.call(|err| unsafe { (self.api.GciTsFetchSize)(sess(session), oop.raw(), err) })
    }

    fn fetch_varying_size(&self, session: SessionHandle, oop: Oop) -> Result<i64, GciError> {
        self.call(|err| unsafe {
            (self.api.GciTsFetchVaryingSize)(sess(session), oop.raw(), err)
        })
    }

    fn fetch_obj_info(&self, session: SessionHandle, oop: Oop) -> Result<ObjInfo, GciError> {
        let mut info = GciTsObjInfo::default();
        self.call(|err| unsafe {
            (self.api.GciTsFetchObjInfo)(
                sess(session),
                oop.raw(),
                0,
                &mut info,
                ptr::null_mut(),
                0,
                err,
            )
        })?;
        Ok(ObjInfo {
            id: Oop::from_raw(info.obj_id),
            class: Oop::from_raw(info.obj_class),
            size: info.obj_size,
            named_size: info.named_size,
            access: info.access,
            security_policy: info.object_security_policy_id,
            bits: info.bits,
        })
    }

    fn fetch_bytes(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        max: usize,
    ) -> Result<Vec<u8>, GciError> {
        self.fetch_into(max, |buf, cap, err| unsafe {
            (self.api.GciTsFetchBytes)(sess(session), oop.raw(), start, buf, cap as i64, err)
                as ssize_t
        })
    }

    fn fetch_utf8_bytes(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        max: usize,
    ) -> Result<Utf8Fetch, GciError> {
        let mut buf = vec![0u8; max];
        let mut utf8_string = Oop::NIL.raw();
        let total = self.call(|err| unsafe {
            (self.api.GciTsFetchUtf8Bytes)(
                sess(session),
                oop.raw(),
                start,
                buf.as_mut_ptr(),
                max as i64,
                &mut utf8_string,
                err,
                0,
            )
        })?;
        let total = total.max(0) as usize;
        buf.truncate(total.min(max));
        Ok(Utf8Fetch {
            bytes: buf,
            required: total,
        })
    }

    fn store_bytes(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        bytes: &[u8],
        of_class: Oop,
    ) -> Result<(), GciError> {
        self.call_bool(|err| unsafe {
            (self.api.GciTsStoreBytes)(
                sess(session),
                oop.raw(),
                start,
                bytes.as_ptr(),
                bytes.len() as i64,
                of_class.raw(),
                err,
            )
        })
    }

    fn fetch_oops(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        count: usize,
    ) -> Result<Vec<Oop>, GciError> {
        let num = c_int::try_from(count)
            .map_err(|_| GciError::InvalidArgument(format!("oop count {count} too large")))?;
        let mut buf = vec![0u64; count];
        let n = self.call(|err| unsafe {
            (self.api.GciTsFetchOops)(sess(session), oop.raw(), start, buf.as_mut_ptr(), num, err)
        })?;
        buf.truncate((n.max(0) as usize).min(count));
        Ok(buf.into_iter().map(Oop::from_raw).collect())
    }

    fn store_oops(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        oops: &[Oop],
        overlay: bool,
    ) -> Result<(), GciError> {
        let raw = raw_oops(oops);
        let num = arg_count(oops)?;
        self.call_bool(|err| unsafe {
            (self.api.GciTsStoreOops)(
                sess(session),
                oop.raw(),
                start,
                raw.as_ptr(),
                num,
                err,
                c_bool(overlay),
            )
        })
    }

    fn new_obj(&self, session: SessionHandle, class: Oop) -> Result<Oop, GciError> {
        self.call(|err| unsafe { (self.api.GciTsNewObj)(sess(session), class.raw(), err) })
            .map(Oop::from_raw)
    }

    fn new_string(&self, session: SessionHandle, s: &str) -> Result<Oop, GciError> {
        let c = c_string(s)?;
        self.call(|err| unsafe {
            (self.api.GciTsNewString_)(sess(session), c.as_ptr(), s.len(), err)
        })
        .map(Oop::from_raw)
    }

    fn new_symbol(&self, session: SessionHandle, s: &str) -> Result<Oop, GciError> {
        let c = c_string(s)?;
        self.call(|err| unsafe { (self.api.GciTsNewSymbol)(sess(session), c.as_ptr(), err) })
            .map(Oop::from_raw)
    }

    fn i64_to_oop(&self, session: SessionHandle, i: i64) -> Result<Oop, GciError> {
        self.call(|err| unsafe { (self.api.GciTsI64ToOop)(sess(session), i, err) })
            .map(Oop::from_raw)
    }

    fn oop_to_i64(&self, session: SessionHandle, oop: Oop) -> Result<i64, GciError> {
        let mut value = 0i64;
        self.call_bool(|err| unsafe {
            (self.api.GciTsOopToI64)(sess(session), oop.raw(), &mut value, err)
        })?;
        Ok(value)
    }

    fn double_to_oop(&self, session: SessionHandle, d: f64) -> Result<Oop, GciError> {
        self.call(|err| unsafe { (self.api.GciTsDoubleToOop)(sess(session), d, err) })
            .map(Oop::from_raw)
    }

    fn oop_to_double(&self, session: SessionHandle, oop: Oop) -> Result<f64, GciError> {
        let mut value = 0f64;
        self.call_bool(|err| unsafe {
            (self.api.GciTsOopToDouble)(sess(session), oop.raw(), &mut value, err)
        })?;
        Ok(value)
    }

    fn fetch_traversal(
        &self,
        session: SessionHandle,
        oops: &[Oop],
        args: &ClampedTravArgs,
        buf: &mut TraversalBuffer,
    ) -> Result<TraversalStatus, GciError> {
        let raw = raw_oops(oops);
        let num = arg_count(oops)?;
        let mut c_args = GciClampedTravArgsSType {
            clamp_spec: args.clamp_spec.raw(),
            result_oop: args.result_oop.raw(),
            trav_buff_size: args.trav_buff_size,
            level: args.level,
            retrieval_flags: args.retrieval_flags,
            is_rpc: c_bool(args.is_rpc),
        };
        let status = self.call(|err| unsafe {
            (self.api.GciTsFetchTraversal)(
                sess(session),
                raw.as_ptr(),
                num,
                &mut c_args,
                buf.as_mut_ptr(),
                err,
            )
        })?;
        traversal_status(status)
    }

    fn more_traversal(
        &self,
        session: SessionHandle,
        buf: &mut TraversalBuffer,
    ) -> Result<TraversalStatus, GciError> {
        let status = self.call(|err| unsafe {
            (self.api.GciTsMoreTraversal)(sess(session), buf.as_mut_ptr(), err)
        })?;
        traversal_status(status)
    }

    fn store_traversal(
        &self,
        session: SessionHandle,
        buf: &mut TraversalBuffer,
        flags: i32,
    ) -> Result<(), GciError> {
        self.call_bool(|err| unsafe {
            (self.api.GciTsStoreTrav)(sess(session), buf.as_mut_ptr(), flags, err)
        })
    }
}

fn traversal_status(status: c_int) -> Result<TraversalStatus, GciError> {
    match status {
        TRAV_COMPLETE => Ok(TraversalStatus::Complete),
        TRAV_MORE => Ok(TraversalStatus::More),
        other => Err(ErrorRecord::new(-1, format!("traversal failed with status {other}")).into()),
    }
}
