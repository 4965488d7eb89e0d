//! # Schedulers
//!
//! A scheduler drains an ordered vector of pools and dispatches the units
//! it pops, until a stop request tells it to return. Its behavior is a
//! capability record ([`SchedDef`]) of `init`/`run`/`free`/
//! `get_migration_pool` functions; the record's address doubles as the
//! scheduler kind tag, so user-defined schedulers are just more records.
//!
//! ## Stop protocol
//!
//! `finish` asks the scheduler to stop once all of its pools have drained
//! (counting blocked and migrating units); `exit` asks it to stop now.
//! The emptiness re-check for `finish` happens under the owning ES's
//! top-scheduler lock so a migration cannot slip a unit into a pool that
//! was just declared empty.
//!
//! When its pools are empty and nothing was requested, a scheduler with a
//! parent context — the primary ES's bottom scheduler (parent: the
//! application's main ULT) or any stacked scheduler (parent: the
//! scheduler beneath) — parks there instead of spinning, which is what
//! lets nested schedulers and the primary thread make progress.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::context;
use crate::error::{Error, Result};
use crate::pool::{self, Pool, PoolAccess, PoolKind, Unit};
use crate::runtime;
use crate::task::{Task, TaskState};
use crate::ult::{Request, Ult, UltState};
use crate::xstream::XstreamInner;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SchedRequest: u32 {
        const FINISH = 1 << 0;
        const EXIT = 1 << 1;
    }
}

/// Lifecycle state of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedState {
    Ready = 0,
    Running = 1,
    Stopped = 2,
    Terminated = 3,
}

impl SchedState {
    fn from_u8(v: u8) -> SchedState {
        match v {
            0 => SchedState::Ready,
            1 => SchedState::Running,
            2 => SchedState::Stopped,
            _ => SchedState::Terminated,
        }
    }
}

/// How a scheduler is currently referenced by an ES.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedUsed {
    NotUsed,
    /// Bottom of an ES's scheduler stack.
    Main,
    /// Stacked above another scheduler.
    Stacked,
}

/// Predefined scheduler kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPredef {
    Default,
    /// Round-robin over its pools (one FIFO pool when none are supplied).
    Basic,
    /// Highest-index non-empty pool first.
    Priority,
    /// Basic loop over caller-supplied pools only.
    NoPool,
}

/// Configuration applied when a scheduler fabricates pools for empty
/// slots, plus the automatic flag for predefined schedulers.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    pub access: PoolAccess,
    pub automatic: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            access: PoolAccess::PrSw,
            automatic: true,
        }
    }
}

/// Scheduler capability record. The address of the record identifies the
/// scheduler kind.
pub struct SchedDef {
    /// Called once at creation, after the pools are in place.
    pub init: Option<fn(&Sched, &SchedConfig) -> Result<()>>,
    /// The scheduling loop. Must call [`Sched::has_to_stop`] regularly
    /// and return when it reports true.
    pub run: fn(&Sched),
    /// Called when the scheduler is freed.
    pub free: Option<fn(&Sched)>,
    /// Destination pool for a ULT migrating toward this scheduler; the
    /// first pool when absent.
    pub get_migration_pool: Option<fn(&Sched, &Pool) -> Option<Pool>>,
}

/// Built-in round-robin scheduler.
pub static BASIC_SCHED_DEF: SchedDef = SchedDef {
    init: None,
    run: basic_run,
    free: None,
    get_migration_pool: None,
};

/// Built-in priority scheduler.
pub static PRIO_SCHED_DEF: SchedDef = SchedDef {
    init: None,
    run: prio_run,
    free: None,
    get_migration_pool: None,
};

/// Pools fabricated for a priority scheduler created without any.
const NUM_PRIORITY_POOLS: usize = 3;

pub(crate) struct SchedInner {
    id: u64,
    def: &'static SchedDef,
    automatic: AtomicBool,
    used: spin::Mutex<SchedUsed>,
    state: AtomicU8,
    request: AtomicU32,
    /// Pools this scheduler draws from: the creation-time vector plus
    /// anything attached later through `Pool::add_sched`. Swapped as a
    /// whole so scheduling loops work on a snapshot without holding a
    /// lock across dispatch.
    pools: spin::Mutex<Arc<Vec<Pool>>>,
    /// The ULT hosting this scheduler's run loop: a dedicated one for the
    /// primary bottom scheduler and stacked schedulers, the ES main ULT
    /// otherwise.
    host: spin::Mutex<Option<Ult>>,
    es: spin::Mutex<Weak<XstreamInner>>,
    data: spin::Mutex<Option<Box<dyn Any + Send>>>,
    released: AtomicBool,
}

impl SchedInner {
    pub(crate) fn set_state(&self, s: SchedState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub(crate) fn get_state(&self) -> SchedState {
        SchedState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn request(&self) -> SchedRequest {
        SchedRequest::from_bits_truncate(self.request.load(Ordering::Acquire))
    }
}

/// Handle to a scheduler.
#[derive(Clone)]
pub struct Sched {
    pub(crate) inner: Arc<SchedInner>,
}

impl PartialEq for Sched {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Sched {}

impl std::fmt::Debug for Sched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sched")
            .field("id", &self.inner.id)
            .field("state", &self.inner.get_state())
            .field("num_pools", &self.num_pools())
            .finish()
    }
}

impl Sched {
    /// Create a scheduler from a definition record. Empty pool slots get
    /// automatic FIFO pools with the configured access.
    pub fn create(
        def: &'static SchedDef,
        pools: &[Option<Pool>],
        config: &SchedConfig,
    ) -> Result<Sched> {
        runtime::current_es_id().ok_or(Error::InvalidXstream)?;
        let mut list = Vec::with_capacity(pools.len());
        for slot in pools {
            let pool = match slot {
                Some(p) => {
                    if p.inner.is_released() {
                        return Err(Error::InvalidPool);
                    }
                    p.clone()
                }
                None => Pool::create_basic(PoolKind::Fifo, config.access, true)?,
            };
            pool.inner.sched_attached();
            list.push(pool);
        }
        let sched = Sched {
            inner: Arc::new(SchedInner {
                id: runtime::next_id(),
                def,
                automatic: AtomicBool::new(false),
                used: spin::Mutex::new(SchedUsed::NotUsed),
                state: AtomicU8::new(SchedState::Ready as u8),
                request: AtomicU32::new(0),
                pools: spin::Mutex::new(Arc::new(list)),
                host: spin::Mutex::new(None),
                es: spin::Mutex::new(Weak::new()),
                data: spin::Mutex::new(None),
                released: AtomicBool::new(false),
            }),
        };
        if let Some(init) = def.init {
            init(&sched, config)?;
        }
        log::debug!(
            "scheduler {} created with {} pool(s)",
            sched.inner.id,
            sched.num_pools()
        );
        Ok(sched)
    }

    /// Create a predefined scheduler. `NoPool` requires the caller to
    /// supply every pool; the other kinds fabricate their defaults when
    /// `pools` is empty.
    pub fn create_basic(
        predef: SchedPredef,
        pools: &[Option<Pool>],
        config: &SchedConfig,
    ) -> Result<Sched> {
        let fabricated;
        let (def, slots): (&'static SchedDef, &[Option<Pool>]) = match predef {
            SchedPredef::Default | SchedPredef::Basic => {
                if pools.is_empty() {
                    fabricated = vec![None];
                    (&BASIC_SCHED_DEF, &fabricated)
                } else {
                    (&BASIC_SCHED_DEF, pools)
                }
            }
            SchedPredef::Priority => {
                if pools.is_empty() {
                    fabricated = vec![None; NUM_PRIORITY_POOLS];
                    (&PRIO_SCHED_DEF, &fabricated)
                } else {
                    (&PRIO_SCHED_DEF, pools)
                }
            }
            SchedPredef::NoPool => {
                if pools.is_empty() {
                    return Err(Error::InvalidSchedPredef);
                }
                (&BASIC_SCHED_DEF, pools)
            }
        };
        let sched = Self::create(def, slots, config)?;
        sched.inner.automatic.store(config.automatic, Ordering::Release);
        Ok(sched)
    }

    /// Release the scheduler, detaching its pools (automatic pools with
    /// no remaining attachment are freed with it).
    pub fn free(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.released.load(Ordering::Acquire) {
            return Err(Error::InvalidSched);
        }
        {
            let used = inner.used.lock();
            if *used != SchedUsed::NotUsed && inner.get_state() != SchedState::Terminated {
                return Err(Error::InvalidSched);
            }
        }
        inner.released.store(true, Ordering::Release);
        // Release every attachment: the creation-time pools and anything
        // added later through `Pool::add_sched`.
        for pool in self.pool_snapshot().iter() {
            if pool.inner.sched_detached() == 0 && pool.inner.automatic() && !pool.inner.is_released()
            {
                let _ = pool.free();
            }
        }
        *inner.host.lock() = None;
        *inner.data.lock() = None;
        if let Some(free) = inner.def.free {
            free(self);
        }
        log::debug!("scheduler {} freed", inner.id);
        Ok(())
    }

    pub fn num_pools(&self) -> usize {
        self.pool_snapshot().len()
    }

    /// `max` pools starting at `idx`.
    pub fn pools(&self, max: usize, idx: usize) -> Result<Vec<Pool>> {
        let pools = self.pool_snapshot();
        if idx + max > pools.len() {
            return Err(Error::Sched);
        }
        Ok(pools[idx..idx + max].to_vec())
    }

    /// Units currently queued across this scheduler's pools.
    pub fn size(&self) -> usize {
        self.pool_snapshot().iter().map(|p| p.size()).sum()
    }

    /// Live units across this scheduler's pools, including blocked and
    /// migrating ones.
    pub fn total_size(&self) -> usize {
        self.pool_snapshot().iter().map(|p| p.total_size()).sum()
    }

    /// Ask the scheduler to stop once its pools are drained.
    pub fn finish(&self) -> Result<()> {
        if self.inner.released.load(Ordering::Acquire) {
            return Err(Error::InvalidSched);
        }
        self.inner
            .request
            .fetch_or(SchedRequest::FINISH.bits(), Ordering::AcqRel);
        Ok(())
    }

    /// Ask the scheduler to stop now, drained or not. Remaining units are
    /// the caller's responsibility.
    pub fn exit(&self) -> Result<()> {
        if self.inner.released.load(Ordering::Acquire) {
            return Err(Error::InvalidSched);
        }
        self.inner
            .request
            .fetch_or(SchedRequest::EXIT.bits(), Ordering::AcqRel);
        Ok(())
    }

    /// Stop check for scheduling loops: reports true once the scheduler
    /// has terminated, and parks empty idle schedulers into their parent
    /// context (see the module docs).
    pub fn has_to_stop(&self) -> Result<bool> {
        let inner = &self.inner;
        if inner.released.load(Ordering::Acquire) {
            return Err(Error::InvalidSched);
        }
        let es = runtime::current_es().ok_or(Error::InvalidXstream)?;
        let req = inner.request();
        if req.contains(SchedRequest::EXIT) {
            let _top = es.lock_top();
            inner.set_state(SchedState::Terminated);
            return Ok(true);
        }
        if self.total_size() == 0 {
            if req.contains(SchedRequest::FINISH) {
                // Re-check under the top-scheduler lock: a migration may
                // be moving a unit in right now.
                let _top = es.lock_top();
                if self.total_size() == 0 {
                    inner.set_state(SchedState::Terminated);
                    return Ok(true);
                }
            } else if let Some(parent) = es.parent_ctx(self) {
                let host = self.host_ult().ok_or(Error::InvalidSched)?;
                unsafe {
                    context::switch(host.ctx_ptr(), parent);
                }
                runtime::set_current_ult(Some(host));
            }
        }
        Ok(false)
    }

    /// Attach user state to the scheduler (for `init`/`run` callbacks of
    /// user-defined kinds).
    pub fn set_data(&self, data: Box<dyn Any + Send>) {
        *self.inner.data.lock() = Some(data);
    }

    /// Access the user state attached with [`set_data`].
    ///
    /// [`set_data`]: Sched::set_data
    pub fn with_data<R>(&self, f: impl FnOnce(Option<&mut (dyn Any + Send)>) -> R) -> R {
        let mut guard = self.inner.data.lock();
        f(guard.as_deref_mut())
    }

    /// Dispatch a unit popped from one of this scheduler's pools. For use
    /// inside a user-defined scheduler's `run` callback, on the ES
    /// running that callback.
    pub fn run_unit(&self, unit: Unit, from: &Pool) {
        dispatch_unit(self, unit, from);
    }

    pub fn state(&self) -> SchedState {
        self.inner.get_state()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    // ---- crate-internal plumbing ----

    /// Current pool set; scheduling loops iterate the snapshot so an
    /// attachment landing mid-loop shows up on their next pass.
    pub(crate) fn pool_snapshot(&self) -> Arc<Vec<Pool>> {
        self.inner.pools.lock().clone()
    }

    /// Register one more pool for this scheduler to draw from.
    pub(crate) fn attach_pool(&self, pool: &Pool) {
        let mut guard = self.inner.pools.lock();
        let mut list = (**guard).clone();
        list.push(pool.clone());
        *guard = Arc::new(list);
    }

    pub(crate) fn is_automatic(&self) -> bool {
        self.inner.automatic.load(Ordering::Acquire)
    }

    /// The ES this scheduler is associated with, if any.
    pub(crate) fn bound_es_id(&self) -> Option<u64> {
        self.inner.es.lock().upgrade().map(|es| es.id())
    }

    pub(crate) fn bound_es(&self) -> Option<Arc<XstreamInner>> {
        self.inner.es.lock().upgrade()
    }

    /// Mark the scheduler as used by `es` and claim the consumer side of
    /// every pool it carries for that ES.
    pub(crate) fn associate(
        &self,
        es: &Arc<XstreamInner>,
        used: SchedUsed,
        host: Ult,
    ) -> Result<()> {
        {
            let used_now = self.inner.used.lock();
            if *used_now != SchedUsed::NotUsed {
                return Err(Error::InvalidSched);
            }
        }
        for pool in self.pool_snapshot().iter() {
            pool.inner.claim_consumer(es.id())?;
        }
        *self.inner.used.lock() = used;
        *self.inner.es.lock() = Arc::downgrade(es);
        *self.inner.host.lock() = Some(host);
        self.inner.set_state(SchedState::Ready);
        Ok(())
    }

    pub(crate) fn dissociate(&self) {
        *self.inner.used.lock() = SchedUsed::NotUsed;
        *self.inner.es.lock() = Weak::new();
    }

    pub(crate) fn host_ult(&self) -> Option<Ult> {
        self.inner.host.lock().clone()
    }
}

/// Run a scheduler's loop on the current context.
pub(crate) fn run_sched(sched: &Sched) {
    sched.inner.set_state(SchedState::Running);
    log::debug!("scheduler {} entering its run loop", sched.id());
    (sched.inner.def.run)(sched);
    if sched.inner.get_state() != SchedState::Terminated {
        // The run callback returned without a stop request being granted.
        sched.inner.set_state(SchedState::Stopped);
    }
    log::debug!("scheduler {} left its run loop", sched.id());
}

/// Shared tail of the built-in run loops.
fn scheduling_loop(sched: &Sched, mut select: impl FnMut(&[Pool]) -> Option<(Unit, Pool)>) {
    loop {
        crate::xstream::ensure_top(sched);
        let pools = sched.pool_snapshot();
        let popped = select(pools.as_slice());
        let had_work = popped.is_some();
        if let Some((unit, from)) = popped {
            dispatch_unit(sched, unit, &from);
        }
        match sched.has_to_stop() {
            Ok(true) | Err(_) => break,
            Ok(false) => {}
        }
        if !had_work {
            // Idle without a parent to park into; be polite to the OS.
            std::thread::yield_now();
        }
    }
}

/// Round-robin over the pools by index, one unit per iteration.
fn basic_run(sched: &Sched) {
    let mut start = 0usize;
    scheduling_loop(sched, move |pools| {
        let n = pools.len();
        for k in 0..n {
            let idx = (start + k) % n;
            if let Some(unit) = pools[idx].inner.dequeue() {
                start = (idx + 1) % n;
                return Some((unit, pools[idx].clone()));
            }
        }
        None
    });
}

/// Highest-index non-empty pool first.
fn prio_run(sched: &Sched) {
    scheduling_loop(sched, |pools| {
        for pool in pools.iter().rev() {
            if let Some(unit) = pool.inner.dequeue() {
                return Some((unit, pool.clone()));
            }
        }
        None
    });
}

/// Dispatch one popped unit on behalf of `sched`.
pub(crate) fn dispatch_unit(sched: &Sched, unit: Unit, from: &Pool) {
    match unit {
        Unit::Task(task) => {
            if task.cancel_requested() && task.state() == TaskState::Ready {
                task.set_state(TaskState::Terminated);
                finish_task(&task);
                return;
            }
            log::trace!("dispatching tasklet {}", task.id());
            task.execute();
            finish_task(&task);
        }
        Unit::Ult(ult) => run_ult(sched, ult, from),
    }
}

fn run_ult(sched: &Sched, ult: Ult, from: &Pool) {
    if ult.inner.request().contains(Request::CANCEL) && ult.state() == UltState::Ready {
        ult.inner.set_state(UltState::Terminated);
        finish_ult(&ult);
        return;
    }
    let host = match sched.host_ult() {
        Some(h) => h,
        None => return,
    };
    log::trace!("dispatching ULT {}", ult.id());
    ult.inner.set_state(UltState::Running);
    ult.set_caller_ctx(host.ctx_ptr());
    ult.begin_dispatch();
    runtime::set_current_ult(Some(ult.clone()));
    unsafe {
        context::switch(host.ctx_ptr(), ult.ctx_ptr());
    }
    runtime::set_current_ult(Some(host));
    ult.end_dispatch();
    post_dispatch(ult, from);
}

/// The ULT gave control back; act on the state it left behind.
fn post_dispatch(ult: Ult, from: &Pool) {
    match ult.state() {
        UltState::Ready => {
            if ult.inner.request().contains(Request::MIGRATE) {
                migrate_or_requeue(ult, from);
            } else {
                let home = ult.home_pool().unwrap_or_else(|| from.clone());
                home.inner.enqueue(Unit::Ult(ult));
            }
        }
        // A blocked ULT is re-queued by whoever wakes it.
        UltState::Blocked => {}
        UltState::Terminated => finish_ult(&ult),
        UltState::Running => debug_assert!(false, "dispatched ULT came back RUNNING"),
    }
}

/// Execute a pending migration, falling back to the home pool when the
/// destination no longer accepts the unit.
fn migrate_or_requeue(ult: Ult, from: &Pool) {
    ult.inner.clear_request(Request::MIGRATE);
    if let Some((xs, dest)) = ult.take_migration() {
        let es = runtime::current_es_id().unwrap_or(0);
        let moved = {
            let _top = xs.inner.lock_top();
            if !dest.inner.is_released() && dest.inner.check_push(es).is_ok() {
                if let Some(old) = ult.home_pool() {
                    old.inner.unit_retired();
                }
                ult.set_home_pool(Some(dest.clone()));
                dest.inner.unit_homed();
                dest.inner.enqueue(Unit::Ult(ult.clone()));
                true
            } else {
                false
            }
        };
        if moved {
            log::trace!("ULT {} migrated to pool {}", ult.id(), dest.id());
            return;
        }
    }
    let home = ult.home_pool().unwrap_or_else(|| from.clone());
    home.inner.enqueue(Unit::Ult(ult));
}

/// Retire a terminated ULT: wake its joiner, release its pool slot and,
/// for unnamed ULTs, its stack.
pub(crate) fn finish_ult(ult: &Ult) {
    log::trace!("ULT {} terminated", ult.id());
    if let Some(joiner) = ult.take_joiner() {
        joiner.inner.set_state(UltState::Ready);
        if let Some(pool) = joiner.home_pool() {
            // The target may have terminated on another ES than the one
            // owning the joiner's home pool.
            pool.inner.wake_enqueue(Unit::Ult(joiner));
        }
    }
    if let Some(home) = ult.home_pool() {
        home.inner.unit_retired();
    }
    ult.set_home_pool(None);
    if ult.is_automatic() {
        let _ = ult.free();
    }
}

fn finish_task(task: &Task) {
    log::trace!("tasklet {} terminated", task.id());
    if let Some(home) = task.home_pool() {
        home.inner.unit_retired();
    }
    task.set_home_pool(None);
    if task.is_automatic() {
        let _ = task.free();
    }
}

/// Pick the pool of `sched` that should receive a ULT migrating out of
/// `source`, honoring the definition's override and the access policies.
pub(crate) fn migration_pool(sched: &Sched, source: &Pool) -> Result<Pool> {
    if sched.inner.released.load(Ordering::Acquire)
        || sched.inner.get_state() == SchedState::Terminated
    {
        return Err(Error::InvalidSched);
    }
    let pick = match sched.inner.def.get_migration_pool {
        Some(f) => f(sched, source),
        None => sched.pool_snapshot().first().cloned(),
    };
    let dest = pick.ok_or(Error::InvalidPool)?;
    if pool::accept_migration(&dest, source) {
        Ok(dest)
    } else {
        Err(Error::InvalidPoolAccess)
    }
}
