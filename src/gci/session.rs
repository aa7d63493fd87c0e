use crate::gci::error::GciError;
use crate::gci::oop::Oop;
use crate::gci::{Gci, LoginParams, PollStatus, SessionHandle};
use crate::version::Version;
use crate::weak_error;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Class used to wrap source strings into VM objects.
const HELPER_CLASS_NAME: &str = "String";

/// In-flight call state of a session. At most one non-blocking call may be outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// A non-blocking call was submitted and its result is not fetched yet.
    Outstanding,
    /// The caller gave up on a non-blocking call, its result must be drained
    /// before the session is usable again.
    Draining,
}

/// A logged in session.
pub struct GemSession {
    id: u32,
    gci: Arc<dyn Gci>,
    handle: SessionHandle,
    vm_version: String,
    helper_class: OnceCell<Oop>,
    call_state: Mutex<CallState>,
}

impl GemSession {
    pub fn login(id: u32, gci: Arc<dyn Gci>, params: &LoginParams) -> Result<Self, GciError> {
        let handle = gci.login(params)?;
        let vm_version = gci.version();
        log::info!(target: "gci", "session {id} logged in as {} ({vm_version})", params.username);
        if let Some(version) = Version::parse(&vm_version) {
            if !crate::version::probe(&version) {
                log::warn!(
                    target: "gci",
                    "VM version {version} is not supported, supported: {}",
                    crate::version::supported_versions_to_string()
                );
            }
        }
        Ok(Self {
            id,
            gci,
            handle,
            vm_version,
            helper_class: OnceCell::new(),
            call_state: Mutex::new(CallState::Idle),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn gci(&self) -> &dyn Gci {
        self.gci.as_ref()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn vm_version(&self) -> &str {
        &self.vm_version
    }

    /// Class OOP used to wrap source strings, resolved once per session.
    pub fn helper_class(&self) -> Result<Oop, GciError> {
        self.helper_class
            .get_or_try_init(|| {
                self.gci
                    .resolve_symbol(self.handle, HELPER_CLASS_NAME, Oop::NIL)
            })
            .copied()
    }

    fn state(&self) -> MutexGuard<'_, CallState> {
        self.call_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn call_state(&self) -> CallState {
        *self.state()
    }

    /// Fail with [`GciError::SessionBusy`] when a non-blocking call is still running.
    ///
    /// An abandoned call is drained first if its result is already available.
    pub fn ensure_idle(&self) -> Result<(), GciError> {
        let mut state = self.state();
        match *state {
            CallState::Idle => Ok(()),
            CallState::Outstanding => Err(GciError::SessionBusy),
            CallState::Draining => {
                if self.drain_once() {
                    *state = CallState::Idle;
                    Ok(())
                } else {
                    Err(GciError::SessionBusy)
                }
            }
        }
    }

    /// Mark a non-blocking call as outstanding.
    pub fn begin_nb(&self) -> Result<NbCall<'_>, GciError> {
        self.ensure_idle()?;
        let mut state = self.state();
        if *state != CallState::Idle {
            return Err(GciError::SessionBusy);
        }
        *state = CallState::Outstanding;
        Ok(NbCall {
            session: self,
            done: false,
        })
    }

    /// Poll once for the result of an abandoned call. Returns true when nothing is
    /// outstanding anymore.
    pub(crate) fn drain_once(&self) -> bool {
        match self.gci.nb_poll(self.handle, 0) {
            Ok(PollStatus::Ready) => {
                if let Err(e) = self.gci.nb_result(self.handle) {
                    if let Some(process) = e.debuggable_context() {
                        weak_error!(
                            self.gci.clear_stack(self.handle, process),
                            "clear stack of drained call:"
                        );
                    }
                }
                log::debug!(target: "gci", "session {}: abandoned call drained", self.id);
                true
            }
            Ok(PollStatus::NotReady) => false,
            Err(e) => {
                log::warn!(target: "gci", "session {}: poll of abandoned call: {e}", self.id);
                true
            }
        }
    }

    /// Encode an integer, remotely when it is outside the SmallInteger range.
    pub fn i64_to_oop(&self, i: i64) -> Result<Oop, GciError> {
        match Oop::from_i64(i) {
            Some(oop) => Ok(oop),
            None => self.gci.i64_to_oop(self.handle, i),
        }
    }

    pub fn oop_to_i64(&self, oop: Oop) -> Result<i64, GciError> {
        match oop.as_i64() {
            Some(i) => Ok(i),
            None => self.gci.oop_to_i64(self.handle, oop),
        }
    }

    /// Encode a float. The VM picks between a SmallDouble and a heap Float.
    pub fn f64_to_oop(&self, d: f64) -> Result<Oop, GciError> {
        self.gci.double_to_oop(self.handle, d)
    }

    /// Decode a float, locally for a SmallDouble.
    pub fn oop_to_f64(&self, oop: Oop) -> Result<f64, GciError> {
        match oop.as_f64() {
            Some(d) => Ok(d),
            None => self.gci.oop_to_double(self.handle, oop),
        }
    }

    pub fn abort(&self) -> Result<(), GciError> {
        self.ensure_idle()?;
        self.gci.abort(self.handle)
    }

    pub fn begin(&self) -> Result<(), GciError> {
        self.ensure_idle()?;
        self.gci.begin(self.handle)
    }

    pub fn commit(&self) -> Result<bool, GciError> {
        self.ensure_idle()?;
        self.gci.commit(self.handle)
    }

    fn logout(&self) -> Result<(), GciError> {
        self.gci.logout(self.handle)
    }
}

/// Outstanding non-blocking call. Dropping it without [`NbCall::finish`] leaves the session
/// draining.
pub struct NbCall<'a> {
    session: &'a GemSession,
    done: bool,
}

impl NbCall<'_> {
    /// The result was fetched, the session is idle again.
    pub fn finish(mut self) {
        self.done = true;
        *self.session.state() = CallState::Idle;
    }
}

impl Drop for NbCall<'_> {
    fn drop(&mut self) {
        if !self.done {
            *self.session.state() = CallState::Draining;
        }
    }
}

/// All logged in sessions keyed by a small integer id.
pub struct SessionRegistry {
    gci: Arc<dyn Gci>,
    sessions: Mutex<IndexMap<u32, Arc<GemSession>>>,
    next_id: AtomicU32,
}

impl SessionRegistry {
    pub fn new(gci: Arc<dyn Gci>) -> Self {
        Self {
            gci,
            sessions: Mutex::new(IndexMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, IndexMap<u32, Arc<GemSession>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn login(&self, params: &LoginParams) -> Result<Arc<GemSession>, GciError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(GemSession::login(id, self.gci.clone(), params)?);
        self.sessions().insert(id, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: u32) -> Option<Arc<GemSession>> {
        self.sessions().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.sessions().keys().copied().collect()
    }

    pub fn logout(&self, id: u32) -> Result<(), GciError> {
        let Some(session) = self.sessions().shift_remove(&id) else {
            return Err(GciError::NotLoggedIn);
        };
        log::info!(target: "gci", "session {id} logout");
        session.logout()
    }

    /// Logout every session, errors are logged.
    pub fn logout_all(&self) {
        for id in self.ids() {
            weak_error!(self.logout(id), "logout:");
        }
    }
}
