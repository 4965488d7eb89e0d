//! # Work-Unit Pools
//!
//! A pool is a queue of ready work units with an access policy saying
//! which execution streams may feed it (produce) and which may drain it
//! (consume). The policy is a pair of private/shared markers per side;
//! private sides are bound to a single ES and let the queue skip its lock
//! entirely, shared sides lock.
//!
//! ## Binding rules
//!
//! Private sides are bound to a concrete ES as follows:
//!
//! - `Prw`: both sides bound at creation to the creating ES. The pool is
//!   single-threaded.
//! - `PrPw`: the consumer is bound at creation; the producer slot is
//!   claimed by the first ES that pushes, which may be a different ES
//!   (a single-producer/single-consumer feed).
//! - `PrSw`: anyone produces; the consumer slot is claimed by the first
//!   scheduler attachment or pop.
//! - `SrPw`: the creating ES produces; consumers form a registered group
//!   (the creator plus every ES whose scheduler attaches).
//! - `SrSw`: no bindings, fully shared.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::runtime;
use crate::sched::Sched;
use crate::task::Task;
use crate::ult::Ult;

/// Producer/consumer access policy, read side first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAccess {
    /// Private read, private write, one ES on both sides.
    Prw,
    /// Private read, private write, the two sides may be different ESes.
    PrPw,
    /// Private read, shared write.
    PrSw,
    /// Shared read, private write.
    SrPw,
    /// Shared read, shared write.
    SrSw,
}

impl PoolAccess {
    fn single_threaded(self) -> bool {
        matches!(self, PoolAccess::Prw)
    }
}

/// Queueing discipline. FIFO is the supplied kind; the enum leaves room
/// for user-defined disciplines beside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Fifo,
}

/// A queued work unit: either a ULT or a tasklet.
#[derive(Clone)]
pub enum Unit {
    Ult(Ult),
    Task(Task),
}

impl Unit {
    pub(crate) fn home(&self) -> Option<Pool> {
        match self {
            Unit::Ult(u) => u.home_pool(),
            Unit::Task(t) => t.home_pool(),
        }
    }

    pub(crate) fn set_home(&self, pool: Option<Pool>) {
        match self {
            Unit::Ult(u) => u.set_home_pool(pool),
            Unit::Task(t) => t.set_home_pool(pool),
        }
    }
}

/// Consumer-side binding state.
enum Consumers {
    /// At most one ES may pop; `None` until the slot is claimed.
    Exclusive(Option<u64>),
    /// Registered group of ESes allowed to pop.
    Group(Vec<u64>),
    Any,
}

/// Producer-side binding state.
enum Producer {
    /// Only this ES may push.
    Fixed(u64),
    /// First pusher claims the slot.
    Claimed(Option<u64>),
    Any,
}

struct Bindings {
    consumers: Consumers,
    producer: Producer,
}

/// The queue itself. Single-ES pools bypass the lock for the owner's
/// push/pop; a woken joiner may arrive from the ES its target terminated
/// on, so those wake-ups land in the locked `inbox` and the owner drains
/// it before popping.
enum PoolQueue {
    Unlocked {
        queue: UnsafeCell<VecDeque<Unit>>,
        inbox: spin::Mutex<VecDeque<Unit>>,
        inbox_pending: AtomicBool,
    },
    Locked(spin::Mutex<VecDeque<Unit>>),
}

pub(crate) struct PoolInner {
    id: u64,
    kind: PoolKind,
    access: PoolAccess,
    automatic: bool,
    queue: PoolQueue,
    /// Queue length mirrored atomically so `size` needs no queue access.
    num_queued: AtomicUsize,
    /// Live units homed here: queued, running, blocked or migrating.
    num_units: AtomicUsize,
    /// Scheduler attachments.
    num_scheds: AtomicUsize,
    bindings: spin::Mutex<Bindings>,
    released: AtomicBool,
}

// The Unlocked queue variant is only reached by the single ES the access
// policy binds; cross-ES joiner wake-ups go through the locked inbox
// instead of touching it. Everything else is atomics and locks.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl PoolInner {
    pub(crate) fn new(kind: PoolKind, access: PoolAccess, automatic: bool, creator: u64) -> Self {
        let bindings = match access {
            PoolAccess::Prw => Bindings {
                consumers: Consumers::Exclusive(Some(creator)),
                producer: Producer::Fixed(creator),
            },
            PoolAccess::PrPw => Bindings {
                consumers: Consumers::Exclusive(Some(creator)),
                producer: Producer::Claimed(None),
            },
            PoolAccess::PrSw => Bindings {
                consumers: Consumers::Exclusive(None),
                producer: Producer::Any,
            },
            PoolAccess::SrPw => Bindings {
                consumers: Consumers::Group(vec![creator]),
                producer: Producer::Fixed(creator),
            },
            PoolAccess::SrSw => Bindings {
                consumers: Consumers::Any,
                producer: Producer::Any,
            },
        };
        let queue = if access.single_threaded() {
            PoolQueue::Unlocked {
                queue: UnsafeCell::new(VecDeque::new()),
                inbox: spin::Mutex::new(VecDeque::new()),
                inbox_pending: AtomicBool::new(false),
            }
        } else {
            PoolQueue::Locked(spin::Mutex::new(VecDeque::new()))
        };
        PoolInner {
            id: runtime::next_id(),
            kind,
            access,
            automatic,
            queue,
            num_queued: AtomicUsize::new(0),
            num_units: AtomicUsize::new(0),
            num_scheds: AtomicUsize::new(0),
            bindings: spin::Mutex::new(bindings),
            released: AtomicBool::new(false),
        }
    }

    /// Append from the queue's owning side (creation, revive, the
    /// dispatcher's re-queue, access-checked public pushes).
    pub(crate) fn enqueue(&self, unit: Unit) {
        match &self.queue {
            PoolQueue::Unlocked { queue, .. } => unsafe { (*queue.get()).push_back(unit) },
            PoolQueue::Locked(q) => q.lock().push_back(unit),
        }
        self.num_queued.fetch_add(1, Ordering::AcqRel);
    }

    /// Append from a possibly foreign ES (a joiner woken by its target's
    /// terminator). Single-ES queues take the inbox detour so the
    /// unlocked fast path is never touched off-owner.
    pub(crate) fn wake_enqueue(&self, unit: Unit) {
        match &self.queue {
            PoolQueue::Unlocked {
                inbox,
                inbox_pending,
                ..
            } => {
                inbox.lock().push_back(unit);
                inbox_pending.store(true, Ordering::Release);
            }
            PoolQueue::Locked(q) => q.lock().push_back(unit),
        }
        self.num_queued.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dequeue(&self) -> Option<Unit> {
        let unit = match &self.queue {
            PoolQueue::Unlocked {
                queue,
                inbox,
                inbox_pending,
            } => unsafe {
                if inbox_pending.swap(false, Ordering::AcqRel) {
                    let mut inbox = inbox.lock();
                    while let Some(woken) = inbox.pop_front() {
                        (*queue.get()).push_back(woken);
                    }
                }
                (*queue.get()).pop_front()
            },
            PoolQueue::Locked(q) => q.lock().pop_front(),
        };
        if unit.is_some() {
            self.num_queued.fetch_sub(1, Ordering::AcqRel);
        }
        unit
    }

    fn clear_queue(&self) {
        match &self.queue {
            PoolQueue::Unlocked {
                queue,
                inbox,
                inbox_pending,
            } => {
                inbox_pending.store(false, Ordering::Release);
                inbox.lock().clear();
                unsafe { (*queue.get()).clear() }
            }
            PoolQueue::Locked(q) => q.lock().clear(),
        }
        self.num_queued.store(0, Ordering::Release);
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.num_queued.load(Ordering::Acquire)
    }

    /// Claim or validate the consumer side for `es`. Scheduler association
    /// and pops both funnel through here.
    pub(crate) fn claim_consumer(&self, es: u64) -> Result<()> {
        let mut b = self.bindings.lock();
        match &mut b.consumers {
            Consumers::Exclusive(slot) => match slot {
                Some(owner) if *owner == es => Ok(()),
                Some(_) => Err(Error::InvalidPoolAccess),
                None => {
                    *slot = Some(es);
                    Ok(())
                }
            },
            Consumers::Group(group) => {
                if !group.contains(&es) {
                    group.push(es);
                }
                Ok(())
            }
            Consumers::Any => Ok(()),
        }
    }

    /// Validate a pop by `es`. Exclusive consumers claim lazily; group
    /// consumers must already be registered.
    fn check_pop(&self, es: u64) -> Result<()> {
        let mut b = self.bindings.lock();
        match &mut b.consumers {
            Consumers::Exclusive(slot) => match slot {
                Some(owner) if *owner == es => Ok(()),
                Some(_) => Err(Error::InvalidPoolAccess),
                None => {
                    *slot = Some(es);
                    Ok(())
                }
            },
            Consumers::Group(group) => {
                if group.contains(&es) {
                    Ok(())
                } else {
                    Err(Error::InvalidPoolAccess)
                }
            }
            Consumers::Any => Ok(()),
        }
    }

    /// Validate a push by `es`, claiming the lazy producer slot if free.
    pub(crate) fn check_push(&self, es: u64) -> Result<()> {
        let mut b = self.bindings.lock();
        match &mut b.producer {
            Producer::Fixed(owner) => {
                if *owner == es {
                    Ok(())
                } else {
                    Err(Error::InvalidPoolAccess)
                }
            }
            Producer::Claimed(slot) => match slot {
                Some(owner) if *owner == es => Ok(()),
                Some(_) => Err(Error::InvalidPoolAccess),
                None => {
                    *slot = Some(es);
                    Ok(())
                }
            },
            Producer::Any => Ok(()),
        }
    }

    /// Non-claiming variant of [`check_push`], used when probing a
    /// migration destination.
    fn would_accept_push(&self, es: u64) -> bool {
        let b = self.bindings.lock();
        match &b.producer {
            Producer::Fixed(owner) => *owner == es,
            Producer::Claimed(Some(owner)) => *owner == es,
            Producer::Claimed(None) | Producer::Any => true,
        }
    }

    /// The ES bound to the consumer side, when there is exactly one.
    fn bound_consumer(&self) -> Option<u64> {
        let b = self.bindings.lock();
        match &b.consumers {
            Consumers::Exclusive(slot) => *slot,
            Consumers::Group(group) if group.len() == 1 => Some(group[0]),
            _ => None,
        }
    }

    pub(crate) fn unit_homed(&self) {
        self.num_units.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unit_retired(&self) {
        self.num_units.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn sched_attached(&self) {
        self.num_scheds.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sched_detached(&self) -> usize {
        self.num_scheds.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn automatic(&self) -> bool {
        self.automatic
    }
}

/// Handle to a pool of ready work units.
#[derive(Clone)]
pub struct Pool {
    pub(crate) inner: Arc<PoolInner>,
}

impl PartialEq for Pool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Pool {}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("access", &self.inner.access)
            .field("size", &self.size())
            .finish()
    }
}

impl Pool {
    /// Create a pool with the given discipline and access policy. The
    /// calling ES becomes the pool's owner for every binding the policy
    /// fixes at creation.
    pub fn create_basic(kind: PoolKind, access: PoolAccess, automatic: bool) -> Result<Pool> {
        let creator = runtime::current_es_id().ok_or(Error::InvalidXstream)?;
        let pool = Pool {
            inner: Arc::new(PoolInner::new(kind, access, automatic, creator)),
        };
        log::debug!(
            "pool {} created ({:?}, {:?}) on ES {}",
            pool.inner.id,
            kind,
            access,
            creator
        );
        Ok(pool)
    }

    /// Number of units queued right now.
    pub fn size(&self) -> usize {
        self.inner.queue_len()
    }

    /// Number of live units homed in this pool, including blocked,
    /// running and migrating ones. Always `>= size()`.
    pub fn total_size(&self) -> usize {
        self.inner.num_units.load(Ordering::Acquire)
    }

    /// Number of schedulers attached to this pool.
    pub fn num_scheds(&self) -> usize {
        self.inner.num_scheds.load(Ordering::Acquire)
    }

    pub fn access(&self) -> PoolAccess {
        self.inner.access
    }

    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    /// Append a unit, enforcing the producer policy for the calling ES.
    /// A unit homed elsewhere is re-homed here.
    pub fn push(&self, unit: Unit) -> Result<()> {
        if self.inner.is_released() {
            return Err(Error::InvalidPool);
        }
        let es = runtime::current_es_id().ok_or(Error::InvalidXstream)?;
        self.inner.check_push(es)?;
        match unit.home() {
            Some(old) if old == *self => {}
            old => {
                if let Some(old) = old {
                    old.inner.unit_retired();
                }
                unit.set_home(Some(self.clone()));
                self.inner.unit_homed();
            }
        }
        self.inner.enqueue(unit);
        Ok(())
    }

    /// Remove the unit at the head, enforcing the consumer policy for the
    /// calling ES. `Ok(None)` when the pool is empty.
    pub fn pop(&self) -> Result<Option<Unit>> {
        if self.inner.is_released() {
            return Err(Error::InvalidPool);
        }
        let es = runtime::current_es_id().ok_or(Error::InvalidXstream)?;
        self.inner.check_pop(es)?;
        Ok(self.inner.dequeue())
    }

    /// Attach a scheduler: it starts drawing work from this pool and the
    /// attachment is released again by `Sched::free`. If the scheduler
    /// already runs on an ES, that ES must be a legal consumer for this
    /// pool's policy; otherwise the claim is deferred to the scheduler's
    /// association with an ES.
    pub fn add_sched(&self, sched: &Sched) -> Result<()> {
        if self.inner.is_released() {
            return Err(Error::InvalidPool);
        }
        if let Some(es) = sched.bound_es_id() {
            self.inner.claim_consumer(es)?;
        }
        sched.attach_pool(self);
        self.inner.sched_attached();
        log::debug!("pool {} attached to scheduler {}", self.inner.id, sched.id());
        Ok(())
    }

    /// Release the pool. Queued units are dropped; live handles to them
    /// stay valid.
    pub fn free(&self) -> Result<()> {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidPool);
        }
        self.inner.clear_queue();
        log::debug!("pool {} freed", self.inner.id);
        Ok(())
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }
}

/// Can a ULT homed in `source` legally be handed to `dest`? The push into
/// `dest` will come from the ES draining `source`.
pub(crate) fn accept_migration(dest: &Pool, source: &Pool) -> bool {
    let es = source
        .inner
        .bound_consumer()
        .or_else(runtime::current_es_id);
    match es {
        Some(es) => dest.inner.would_accept_push(es),
        None => false,
    }
}
