//! # Execution Streams
//!
//! An execution stream (ES) is one kernel thread running a stack of
//! schedulers; the top of the stack is the one currently scheduling.
//! Secondary ESes are spawned threads whose bottom (MAIN) scheduler runs
//! directly on the thread's native context. The primary ES is the thread
//! that initialized the runtime: its native context belongs to the
//! application, so its bottom scheduler runs on a dedicated host ULT and
//! the application enters it by yielding.
//!
//! Every ES carries a top-scheduler lock serializing scheduler-stack
//! changes and incoming migrations against the schedulers' own
//! drained-pool checks.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;

use crate::context::{self, Context};
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::runtime;
use crate::sched::{self, Sched, SchedConfig, SchedPredef, SchedState, SchedUsed};
use crate::ult::{Ult, UltState, UltType};

/// Lifecycle state of an execution stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XstreamState {
    Created = 0,
    Ready = 1,
    Running = 2,
    Terminated = 3,
}

impl XstreamState {
    fn from_u8(v: u8) -> XstreamState {
        match v {
            0 => XstreamState::Created,
            1 => XstreamState::Ready,
            2 => XstreamState::Running,
            _ => XstreamState::Terminated,
        }
    }
}

pub(crate) struct XstreamInner {
    id: u64,
    rank: u64,
    is_primary: bool,
    state: AtomicU8,
    sched_stack: spin::Mutex<Vec<Sched>>,
    /// Serializes scheduler-stack transitions and migration against the
    /// drained-pool double check in `Sched::has_to_stop`.
    top_mutex: spin::Mutex<()>,
    /// Bottom scheduler; kept here so `main_pools` works after the stack
    /// has drained.
    main_sched: spin::Mutex<Option<Sched>>,
    /// ULT wrapping the kernel thread's native context.
    main_ult: spin::Mutex<Option<Ult>>,
    thread: StdMutex<Option<JoinHandle<()>>>,
}

impl XstreamInner {
    fn new(rank: u64, is_primary: bool) -> Arc<XstreamInner> {
        Arc::new(XstreamInner {
            id: runtime::next_id(),
            rank,
            is_primary,
            state: AtomicU8::new(XstreamState::Created as u8),
            sched_stack: spin::Mutex::new(Vec::new()),
            top_mutex: spin::Mutex::new(()),
            main_sched: spin::Mutex::new(None),
            main_ult: spin::Mutex::new(None),
            thread: StdMutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn rank(&self) -> u64 {
        self.rank
    }

    pub(crate) fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub(crate) fn set_state(&self, s: XstreamState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub(crate) fn get_state(&self) -> XstreamState {
        XstreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn lock_top(&self) -> spin::MutexGuard<'_, ()> {
        self.top_mutex.lock()
    }

    pub(crate) fn top_sched(&self) -> Option<Sched> {
        self.sched_stack.lock().last().cloned()
    }

    pub(crate) fn sched_snapshot(&self) -> Vec<Sched> {
        self.sched_stack.lock().clone()
    }

    pub(crate) fn main_ult(&self) -> Option<Ult> {
        self.main_ult.lock().clone()
    }

    pub(crate) fn main_sched(&self) -> Option<Sched> {
        self.main_sched.lock().clone()
    }

    /// Remove a scheduler from the stack (normally the top, when it has
    /// terminated) and sever its ES association.
    pub(crate) fn pop_sched(&self, sched: &Sched) {
        let _top = self.lock_top();
        let mut stack = self.sched_stack.lock();
        if let Some(pos) = stack.iter().position(|s| s == sched) {
            stack.remove(pos);
        }
        drop(stack);
        sched.dissociate();
        log::debug!("ES {} popped scheduler {}", self.rank, sched.id());
    }

    /// Context an empty, request-free scheduler parks into: the main ULT
    /// for the primary ES's bottom scheduler, the scheduler beneath for
    /// stacked ones. Secondary MAIN schedulers have none and keep
    /// polling.
    pub(crate) fn parent_ctx(&self, sched: &Sched) -> Option<*mut Context> {
        let stack = self.sched_stack.lock();
        let pos = stack.iter().position(|s| s == sched)?;
        if pos == 0 {
            if self.is_primary {
                drop(stack);
                self.main_ult().map(|m| m.ctx_ptr())
            } else {
                None
            }
        } else {
            stack[pos - 1].host_ult().map(|h| h.ctx_ptr())
        }
    }
}

/// Handle to an execution stream.
#[derive(Clone)]
pub struct Xstream {
    pub(crate) inner: Arc<XstreamInner>,
}

impl PartialEq for Xstream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Xstream {}

impl std::fmt::Debug for Xstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xstream")
            .field("rank", &self.inner.rank)
            .field("state", &self.inner.get_state())
            .finish()
    }
}

impl Xstream {
    /// Create a secondary ES running `sched` (or a default basic
    /// scheduler over one automatic FIFO pool). The kernel thread starts
    /// immediately.
    pub fn create(sched: Option<Sched>) -> Result<Xstream> {
        let global = runtime::global()?;
        runtime::current_es_id().ok_or(Error::InvalidXstream)?;
        let sched = match sched {
            Some(s) => s,
            None => Sched::create_basic(SchedPredef::Basic, &[], &SchedConfig::default())?,
        };
        let inner = XstreamInner::new(global.next_rank(), false);
        let main_ult = Ult::new_main(inner.id());
        *inner.main_ult.lock() = Some(main_ult.clone());
        // Bind the scheduler (and its pools' consumer side) to the new ES
        // before the user can touch the pools.
        sched.associate(&inner, SchedUsed::Main, main_ult)?;
        *inner.main_sched.lock() = Some(sched.clone());
        inner.sched_stack.lock().push(sched.clone());
        global.register_xstream(inner.clone());
        inner.set_state(XstreamState::Ready);
        let es = inner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("weft-es-{}", inner.rank()))
            .spawn(move || xstream_main(es, sched));
        let handle = match spawned {
            Ok(h) => h,
            Err(_) => {
                global.unregister_xstream(inner.id());
                return Err(Error::Resource);
            }
        };
        *inner.thread.lock().map_err(|_| Error::Sched)? = Some(handle);
        log::debug!("ES {} created", inner.rank());
        Ok(Xstream { inner })
    }

    /// The ES the caller is running on.
    pub fn current() -> Result<Xstream> {
        runtime::current_es()
            .map(|inner| Xstream { inner })
            .ok_or(Error::InvalidXstream)
    }

    pub fn rank(&self) -> u64 {
        self.inner.rank()
    }

    pub fn state(&self) -> XstreamState {
        self.inner.get_state()
    }

    /// The first `max` pools of the ES's bottom scheduler.
    pub fn main_pools(&self, max: usize) -> Result<Vec<Pool>> {
        let sched = self.inner.main_sched().ok_or(Error::InvalidXstream)?;
        let max = max.min(sched.num_pools());
        sched.pools(max, 0)
    }

    /// Ask every scheduler on the ES to finish, then wait for the kernel
    /// thread to exit. A ULT caller keeps yielding instead of blocking
    /// its own ES on the OS-level join.
    pub fn join(&self) -> Result<()> {
        if self.inner.is_primary() {
            return Err(Error::InvalidXstream);
        }
        if runtime::current_es_id() == Some(self.inner.id()) {
            // Waiting for one's own kernel thread can never finish.
            return Err(Error::InvalidXstream);
        }
        for sched in self.inner.sched_snapshot() {
            let _ = sched.finish();
        }
        if let Some(cur) = runtime::current_ult() {
            if cur.ty() == UltType::User {
                while self.inner.get_state() != XstreamState::Terminated {
                    crate::ult::yield_now()?;
                }
            }
        }
        let handle = self.inner.thread.lock().map_err(|_| Error::Sched)?.take();
        match handle {
            Some(h) => h.join().map_err(|_| Error::Sched),
            None if self.inner.get_state() == XstreamState::Terminated => Ok(()),
            None => Err(Error::InvalidXstream),
        }
    }

    /// Release a terminated ES and the automatic resources it carried.
    pub fn free(&self) -> Result<()> {
        if self.inner.is_primary() {
            return Err(Error::InvalidXstream);
        }
        if self.inner.get_state() != XstreamState::Terminated {
            return Err(Error::InvalidXstream);
        }
        runtime::global()?.unregister_xstream(self.inner.id());
        let sched = self.inner.main_sched.lock().take();
        if let Some(sched) = sched {
            if sched.is_automatic() {
                let _ = sched.free();
            }
        }
        *self.inner.main_ult.lock() = None;
        log::debug!("ES {} freed", self.inner.rank());
        Ok(())
    }

    /// Start `sched` on a fresh host ULT stacked above the current
    /// scheduler of this ES and switch to it. Control returns to the
    /// scheduler beneath when the new one terminates. Must be called from
    /// this ES.
    pub fn push_scheduler(&self, sched: &Sched) -> Result<()> {
        let cur_es = runtime::current_es().ok_or(Error::InvalidXstream)?;
        if cur_es.id() != self.inner.id() {
            return Err(Error::InvalidXstream);
        }
        let prev_top = self.inner.top_sched().ok_or(Error::InvalidXstream)?;
        let parent_host = prev_top.host_ult().ok_or(Error::InvalidSched)?;
        let host = make_sched_host(sched, &self.inner)?;
        sched.associate(&self.inner, SchedUsed::Stacked, host.clone())?;
        host.set_caller_ctx(parent_host.ctx_ptr());
        {
            let _top = self.inner.lock_top();
            self.inner.sched_stack.lock().push(sched.clone());
        }
        log::debug!(
            "ES {} stacked scheduler {} above {}",
            self.inner.rank(),
            sched.id(),
            prev_top.id()
        );
        let cur = runtime::current_ult().ok_or(Error::InvalidXstream)?;
        if cur.ty() == UltType::User {
            // The dispatcher beneath re-queues us once it regains control.
            cur.inner.set_state(UltState::Ready);
        }
        runtime::set_current_ult(Some(host.clone()));
        unsafe {
            context::switch(cur.ctx_ptr(), host.ctx_ptr());
        }
        runtime::set_current_ult(Some(cur));
        Ok(())
    }

    /// Destination pool on this ES for a ULT migrating out of `source`,
    /// as chosen by the top scheduler.
    pub(crate) fn migration_target(&self, source: &Pool) -> Result<Pool> {
        let _top = self.inner.lock_top();
        let top = self.inner.top_sched().ok_or(Error::InvalidXstream)?;
        sched::migration_pool(&top, source)
    }
}

/// Entry of a secondary ES's kernel thread: adopt the native context as
/// the MAIN ULT, run the scheduler stack until it drains, tear down.
fn xstream_main(es: Arc<XstreamInner>, sched: Sched) {
    let main_ult = match es.main_ult() {
        Some(m) => m,
        None => return,
    };
    runtime::install_local(es.clone(), main_ult.clone());
    es.set_state(XstreamState::Running);
    log::debug!("ES {} running", es.rank());
    sched::run_sched(&sched);
    es.pop_sched(&sched);
    // Stacked schedulers normally pop themselves on termination; drive
    // any stragglers so the stack is empty before the thread exits.
    loop {
        let top = match es.top_sched() {
            Some(t) => t,
            None => break,
        };
        if top.state() == SchedState::Terminated {
            es.pop_sched(&top);
            continue;
        }
        let host = match top.host_ult() {
            Some(h) => h,
            None => break,
        };
        unsafe {
            context::switch(main_ult.ctx_ptr(), host.ctx_ptr());
        }
        runtime::set_current_ult(Some(main_ult.clone()));
    }
    es.set_state(XstreamState::Terminated);
    runtime::clear_local();
    log::debug!("ES {} terminated", es.rank());
}

/// Build the host ULT for a scheduler's run loop. When the loop returns,
/// the host removes the scheduler from its ES's stack; the generic ULT
/// epilogue then hands control to the host's recorded caller.
pub(crate) fn make_sched_host(sched: &Sched, es: &Arc<XstreamInner>) -> Result<Ult> {
    let s = sched.clone();
    let es_weak = Arc::downgrade(es);
    Ult::new_sched_host(Box::new(move || {
        sched::run_sched(&s);
        if let Some(es) = es_weak.upgrade() {
            es.pop_sched(&s);
        }
    }))
}

/// Adopt the caller of `init` as the primary ES: wrap its native context
/// in a MAIN ULT, install the thread-local state and stand up the default
/// scheduler on a dedicated host ULT.
pub(crate) fn new_primary() -> Arc<XstreamInner> {
    XstreamInner::new(0, true)
}

pub(crate) fn bootstrap_primary(es: &Arc<XstreamInner>) -> Result<()> {
    let main_ult = Ult::new_main(es.id());
    *es.main_ult.lock() = Some(main_ult.clone());
    runtime::install_local(es.clone(), main_ult.clone());
    let sched = Sched::create_basic(SchedPredef::Basic, &[], &SchedConfig::default())?;
    let host = make_sched_host(&sched, es)?;
    sched.associate(es, SchedUsed::Main, host.clone())?;
    host.set_caller_ctx(main_ult.ctx_ptr());
    *es.main_sched.lock() = Some(sched.clone());
    es.sched_stack.lock().push(sched);
    es.set_state(XstreamState::Running);
    Ok(())
}

/// Give a scheduler stacked above `sched` a turn, once. Called from the
/// scheduling loops so a freshly pushed scheduler gets the processor
/// even while the one beneath is mid-loop.
pub(crate) fn ensure_top(sched: &Sched) {
    let es = match sched.bound_es() {
        Some(es) => es,
        None => return,
    };
    let top = match es.top_sched() {
        Some(t) => t,
        None => return,
    };
    if top == *sched {
        return;
    }
    let (my_host, top_host) = match (sched.host_ult(), top.host_ult()) {
        (Some(a), Some(b)) => (a, b),
        _ => return,
    };
    unsafe {
        context::switch(my_host.ctx_ptr(), top_host.ctx_ptr());
    }
    runtime::set_current_ult(Some(my_host));
}
