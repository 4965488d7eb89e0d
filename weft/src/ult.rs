//! # User-Level Threads
//!
//! A ULT is a stackful cooperative task: it owns a stack and a saved
//! context, runs when a scheduler switches to it, and gives the processor
//! back only at explicit points (yield, join, exit, blocking). Terminated
//! ULTs can be revived with a new entry closure, reusing the stack and
//! descriptor — the cheap path for iteration-shaped workloads.
//!
//! Three descriptor types share this machinery: `User` ULTs made by the
//! application, the per-ES `Main` ULT wrapping the kernel thread's native
//! context, and `MainSched` ULTs hosting stacked scheduler loops.

use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::context::{self, Context, UltStack};
use crate::error::{Error, Result};
use crate::pool::{Pool, Unit};
use crate::runtime;
use crate::xstream::Xstream;

bitflags! {
    /// Pending asynchronous requests against a ULT. Set with an atomic
    /// fetch-or; observed at the next suspension point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Request: u32 {
        const CANCEL = 1 << 0;
        const MIGRATE = 1 << 1;
        const JOIN = 1 << 2;
        const EXIT = 1 << 3;
    }
}

/// Lifecycle state of a ULT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UltState {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Terminated = 3,
}

impl UltState {
    fn from_u8(v: u8) -> UltState {
        match v {
            0 => UltState::Ready,
            1 => UltState::Running,
            2 => UltState::Blocked,
            _ => UltState::Terminated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UltType {
    User,
    /// The ES's bootstrap ULT, wrapping the kernel thread's own context.
    Main,
    /// Host of a scheduler's run loop.
    MainSched,
}

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// Creation attributes for a ULT.
#[derive(Debug, Clone)]
pub struct UltAttrs {
    stack_size: Option<usize>,
    joinable: bool,
}

impl Default for UltAttrs {
    fn default() -> Self {
        UltAttrs {
            stack_size: None,
            joinable: true,
        }
    }
}

impl UltAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack size in bytes for this ULT; the runtime default otherwise.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Whether the ULT may be joined. Defaults to true.
    pub fn joinable(mut self, joinable: bool) -> Self {
        self.joinable = joinable;
        self
    }
}

pub(crate) struct UltInner {
    id: u64,
    ty: UltType,
    state: AtomicU8,
    request: AtomicU32,
    joinable: bool,
    /// Retired automatically at termination; no handle was handed out.
    automatic: bool,
    stack: spin::Mutex<Option<UltStack>>,
    ctx: UnsafeCell<Context>,
    /// Context to switch to when this ULT suspends or terminates: the
    /// dispatching scheduler's host for user ULTs, the parent context for
    /// scheduler hosts.
    caller_ctx: AtomicPtr<Context>,
    entry: spin::Mutex<Option<EntryFn>>,
    home: spin::Mutex<Option<Pool>>,
    joiner: spin::Mutex<Option<Ult>>,
    migrate_dest: spin::Mutex<Option<(Xstream, Pool)>>,
    /// True from the moment a dispatcher decides to run this ULT until
    /// that dispatcher has regained control and the context is fully
    /// saved. Anyone about to switch in must wait for it to clear, so a
    /// unit woken onto a shared pool cannot be entered with a
    /// half-written context.
    on_cpu: AtomicBool,
    released: AtomicBool,
    /// Owning ES for `Main` ULTs; joining them from elsewhere is illegal.
    owner_es: Option<u64>,
}

// ctx is only written by the ULT itself or its current dispatcher, and
// the on_cpu handshake orders those accesses; the rest is atomics and
// locks.
unsafe impl Send for UltInner {}
unsafe impl Sync for UltInner {}

impl UltInner {
    pub(crate) fn set_state(&self, s: UltState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub(crate) fn get_state(&self) -> UltState {
        UltState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn request(&self) -> Request {
        Request::from_bits_truncate(self.request.load(Ordering::Acquire))
    }

    pub(crate) fn add_request(&self, r: Request) {
        self.request.fetch_or(r.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_request(&self, r: Request) {
        self.request.fetch_and(!r.bits(), Ordering::AcqRel);
    }
}

/// Handle to a user-level thread.
#[derive(Clone)]
pub struct Ult {
    pub(crate) inner: Arc<UltInner>,
}

impl PartialEq for Ult {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Ult {}

impl std::fmt::Debug for Ult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ult")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Ult {
    fn alloc(
        ty: UltType,
        entry: Option<EntryFn>,
        stack: Option<UltStack>,
        joinable: bool,
        automatic: bool,
        owner_es: Option<u64>,
    ) -> Ult {
        Ult {
            inner: Arc::new(UltInner {
                id: runtime::next_id(),
                ty,
                state: AtomicU8::new(UltState::Ready as u8),
                request: AtomicU32::new(0),
                joinable,
                automatic,
                stack: spin::Mutex::new(stack),
                ctx: UnsafeCell::new(Context::null()),
                caller_ctx: AtomicPtr::new(std::ptr::null_mut()),
                entry: spin::Mutex::new(entry),
                home: spin::Mutex::new(None),
                joiner: spin::Mutex::new(None),
                migrate_dest: spin::Mutex::new(None),
                on_cpu: AtomicBool::new(false),
                released: AtomicBool::new(false),
                owner_es,
            }),
        }
    }

    /// Rebuild the saved context so the next switch starts the entry
    /// closure from the top of the existing stack.
    fn init_context(&self) -> Result<()> {
        let guard = self.inner.stack.lock();
        let stack = guard.as_ref().ok_or(Error::InvalidThread)?;
        let arg = Arc::as_ptr(&self.inner) as *mut u8;
        unsafe {
            *self.inner.ctx.get() = context::make_context(stack.top(), ult_main, arg);
        }
        Ok(())
    }

    /// Create a ULT running `f` and queue it READY into `pool`.
    pub fn create<F>(pool: &Pool, f: F, attrs: &UltAttrs) -> Result<Ult>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(pool, Box::new(f), attrs, false)
    }

    /// Create an unnamed ULT: no handle is returned and the descriptor is
    /// retired automatically when the ULT terminates.
    pub fn spawn<F>(pool: &Pool, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(pool, Box::new(f), &UltAttrs::default(), true)?;
        Ok(())
    }

    fn build(pool: &Pool, entry: EntryFn, attrs: &UltAttrs, automatic: bool) -> Result<Ult> {
        let es = runtime::current_es_id().ok_or(Error::InvalidXstream)?;
        if pool.inner.is_released() {
            return Err(Error::InvalidPool);
        }
        pool.inner.check_push(es)?;
        let size = attrs.stack_size.unwrap_or_else(runtime::default_stack_size);
        let stack = UltStack::new(size)?;
        let ult = Self::alloc(
            UltType::User,
            Some(entry),
            Some(stack),
            attrs.joinable,
            automatic,
            None,
        );
        ult.init_context()?;
        *ult.inner.home.lock() = Some(pool.clone());
        pool.inner.unit_homed();
        pool.inner.enqueue(Unit::Ult(ult.clone()));
        log::trace!("ULT {} created in pool {}", ult.inner.id, pool.id());
        Ok(ult)
    }

    /// Restart a terminated ULT with a new entry closure, reusing its
    /// stack and descriptor. No allocation happens here.
    pub fn revive<F>(pool: &Pool, f: F, ult: &Ult) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &ult.inner;
        if inner.released.load(Ordering::Acquire) || inner.ty != UltType::User {
            return Err(Error::InvalidThread);
        }
        if inner.get_state() != UltState::Terminated {
            return Err(Error::InvalidThread);
        }
        let es = runtime::current_es_id().ok_or(Error::InvalidXstream)?;
        if pool.inner.is_released() {
            return Err(Error::InvalidPool);
        }
        pool.inner.check_push(es)?;
        inner.request.store(0, Ordering::Release);
        *inner.joiner.lock() = None;
        *inner.entry.lock() = Some(Box::new(f));
        ult.init_context()?;
        inner.set_state(UltState::Ready);
        *inner.home.lock() = Some(pool.clone());
        pool.inner.unit_homed();
        pool.inner.enqueue(Unit::Ult(ult.clone()));
        log::trace!("ULT {} revived into pool {}", inner.id, pool.id());
        Ok(())
    }

    /// Block until the target terminates.
    ///
    /// A ULT caller blocks and is woken into its home pool by the
    /// target's terminator; a main-ULT caller drives its scheduler
    /// until the target is done.
    pub fn join(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.released.load(Ordering::Acquire) || !inner.joinable {
            return Err(Error::InvalidThread);
        }
        if runtime::current_task().is_some() {
            // Tasklets cannot block.
            return Err(Error::InvalidThread);
        }
        let es = runtime::current_es_id().ok_or(Error::InvalidXstream)?;
        if inner.ty == UltType::Main && inner.owner_es != Some(es) {
            return Err(Error::InvalidThread);
        }
        let cur = runtime::current_ult();
        if let Some(cur) = &cur {
            if *cur == *self {
                return Err(Error::InvalidThread);
            }
        }
        match cur {
            Some(cur) if cur.inner.ty == UltType::User => {
                if inner.get_state() == UltState::Terminated {
                    return Ok(());
                }
                {
                    let mut joiner = inner.joiner.lock();
                    if inner.get_state() == UltState::Terminated {
                        return Ok(());
                    }
                    if joiner.is_some() {
                        return Err(Error::InvalidThread);
                    }
                    *joiner = Some(cur.clone());
                }
                inner.add_request(Request::JOIN);
                cur.inner.set_state(UltState::Blocked);
                cur.switch_to_caller();
                debug_assert_eq!(inner.get_state(), UltState::Terminated);
                Ok(())
            }
            _ => {
                // Main ULT (or a scheduler context): keep the ES moving
                // until the target terminates.
                while inner.get_state() != UltState::Terminated {
                    runtime::progress()?;
                }
                Ok(())
            }
        }
    }

    /// Release a terminated ULT's stack and descriptor. Freeing a live
    /// ULT is a programming error.
    pub fn free(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.released.load(Ordering::Acquire) || inner.ty == UltType::Main {
            return Err(Error::InvalidThread);
        }
        let state = inner.get_state();
        debug_assert_eq!(state, UltState::Terminated, "freeing a live ULT");
        if state != UltState::Terminated {
            return Err(Error::InvalidThread);
        }
        inner.released.store(true, Ordering::Release);
        *inner.stack.lock() = None;
        *inner.entry.lock() = None;
        *inner.joiner.lock() = None;
        *inner.home.lock() = None;
        Ok(())
    }

    /// Request cooperative cancellation; the target terminates at its
    /// next suspension point.
    pub fn cancel(&self) -> Result<()> {
        if self.inner.released.load(Ordering::Acquire) {
            return Err(Error::InvalidThread);
        }
        self.inner.add_request(Request::CANCEL);
        Ok(())
    }

    /// Request migration to a pool of `xs`, chosen by the target's top
    /// scheduler. The move happens at the ULT's next yield.
    pub fn migrate_to(&self, xs: &Xstream) -> Result<()> {
        let inner = &self.inner;
        if inner.released.load(Ordering::Acquire) || inner.ty != UltType::User {
            return Err(Error::InvalidThread);
        }
        runtime::current_es_id().ok_or(Error::InvalidXstream)?;
        let source = inner.home.lock().clone().ok_or(Error::InvalidThread)?;
        let dest = xs.migration_target(&source)?;
        *inner.migrate_dest.lock() = Some((xs.clone(), dest));
        inner.add_request(Request::MIGRATE);
        Ok(())
    }

    /// The calling ULT. Fails inside a tasklet and outside the runtime.
    pub fn current() -> Result<Ult> {
        if runtime::current_task().is_some() {
            return Err(Error::InvalidThread);
        }
        runtime::current_ult().ok_or(Error::InvalidXstream)
    }

    pub fn state(&self) -> UltState {
        self.inner.get_state()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    // ---- crate-internal plumbing ----

    pub(crate) fn new_main(owner_es: u64) -> Ult {
        let ult = Self::alloc(UltType::Main, None, None, true, false, Some(owner_es));
        ult.inner.set_state(UltState::Running);
        ult
    }

    pub(crate) fn new_sched_host(entry: EntryFn) -> Result<Ult> {
        let stack = UltStack::new(runtime::default_stack_size())?;
        let ult = Self::alloc(UltType::MainSched, Some(entry), Some(stack), false, false, None);
        ult.init_context()?;
        Ok(ult)
    }

    pub(crate) fn ty(&self) -> UltType {
        self.inner.ty
    }

    pub(crate) fn is_automatic(&self) -> bool {
        self.inner.automatic
    }

    pub(crate) fn ctx_ptr(&self) -> *mut Context {
        self.inner.ctx.get()
    }

    pub(crate) fn set_caller_ctx(&self, ctx: *mut Context) {
        self.inner.caller_ctx.store(ctx, Ordering::Release);
    }

    pub(crate) fn home_pool(&self) -> Option<Pool> {
        self.inner.home.lock().clone()
    }

    pub(crate) fn set_home_pool(&self, pool: Option<Pool>) {
        *self.inner.home.lock() = pool;
    }

    pub(crate) fn take_joiner(&self) -> Option<Ult> {
        self.inner.joiner.lock().take()
    }

    pub(crate) fn take_migration(&self) -> Option<(Xstream, Pool)> {
        self.inner.migrate_dest.lock().take()
    }

    /// Base address of the current stack, if any. Lets tests observe that
    /// revive reuses the allocation.
    pub(crate) fn stack_base(&self) -> Option<usize> {
        self.inner.stack.lock().as_ref().map(|s| s.base() as usize)
    }

    /// Spin until the ULT's context is fully saved, then mark it on-CPU.
    pub(crate) fn begin_dispatch(&self) {
        while self.inner.on_cpu.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        self.inner.on_cpu.store(true, Ordering::Release);
    }

    /// The dispatcher has regained control; the context is saved.
    pub(crate) fn end_dispatch(&self) {
        self.inner.on_cpu.store(false, Ordering::Release);
    }

    /// Switch from this ULT to whoever dispatched it. On resume, the ULT
    /// reinstalls itself as the running one.
    pub(crate) fn switch_to_caller(&self) {
        let caller = self.inner.caller_ctx.load(Ordering::Acquire);
        debug_assert!(!caller.is_null());
        unsafe {
            context::switch(self.inner.ctx.get(), caller);
        }
        runtime::set_current_ult(Some(self.clone()));
    }
}

/// Entry shim for every stackful context: run the entry closure, mark the
/// ULT terminated and leave for the dispatcher. Panics are contained so
/// they cannot unwind across the context-switch frames.
extern "C" fn ult_main(arg: *mut u8) -> ! {
    let inner = unsafe { &*(arg as *const UltInner) };
    let entry = inner.entry.lock().take();
    if let Some(f) = entry {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            log::error!("ULT {} panicked; treating it as terminated", inner.id);
        }
    }
    inner.set_state(UltState::Terminated);
    let caller = inner.caller_ctx.load(Ordering::Acquire);
    unsafe {
        context::switch(inner.ctx.get(), caller);
    }
    unreachable!("terminated ULT resumed without revive")
}

/// Give the processor back to the scheduler; the ULT is re-queued READY
/// in its home pool (or terminated, if cancellation is pending). From the
/// main ULT this instead drives the ES's top scheduler.
pub fn yield_now() -> Result<()> {
    if runtime::current_task().is_some() {
        return Err(Error::InvalidThread);
    }
    let cur = runtime::current_ult().ok_or(Error::InvalidXstream)?;
    match cur.inner.ty {
        UltType::Main => runtime::progress(),
        _ => {
            if cur.inner.request().contains(Request::CANCEL) {
                cur.inner.set_state(UltState::Terminated);
            } else {
                cur.inner.set_state(UltState::Ready);
            }
            cur.switch_to_caller();
            Ok(())
        }
    }
}

/// Terminate the calling ULT immediately.
pub fn exit() -> Result<()> {
    if runtime::current_task().is_some() {
        return Err(Error::InvalidThread);
    }
    let cur = runtime::current_ult().ok_or(Error::InvalidXstream)?;
    if cur.inner.ty != UltType::User {
        return Err(Error::InvalidThread);
    }
    cur.inner.set_state(UltState::Terminated);
    cur.switch_to_caller();
    unreachable!("terminated ULT resumed without revive")
}
