//! # Global Runtime State
//!
//! One process-wide singleton holds the live execution streams and the
//! defaults read at [`init`]; one thread-local slot per ES kernel thread
//! tracks the ES itself and whatever ULT or tasklet its scheduler is
//! currently running. Every entry point that needs an ES goes through
//! these accessors and reports `InvalidXstream` from foreign threads.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::DEFAULT_STACK_SIZE;
use crate::error::{Error, Result};
use crate::sched::SchedState;
use crate::task::Task;
use crate::ult::{Ult, UltType};
use crate::xstream::{self, Xstream, XstreamInner};

/// Environment variable overriding the default ULT stack size (bytes).
pub const STACK_SIZE_ENV: &str = "WEFT_STACK_SIZE";

pub(crate) struct Global {
    /// Live ESes in creation order; index 0 is the primary.
    xstreams: spin::Mutex<Vec<Arc<XstreamInner>>>,
    primary: Arc<XstreamInner>,
    next_rank: AtomicU64,
    default_stack_size: usize,
}

impl Global {
    pub(crate) fn next_rank(&self) -> u64 {
        self.next_rank.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn register_xstream(&self, es: Arc<XstreamInner>) {
        self.xstreams.lock().push(es);
    }

    pub(crate) fn unregister_xstream(&self, id: u64) {
        self.xstreams.lock().retain(|es| es.id() != id);
    }

    fn secondaries(&self) -> Vec<Arc<XstreamInner>> {
        self.xstreams
            .lock()
            .iter()
            .filter(|es| !es.is_primary())
            .cloned()
            .collect()
    }
}

static GLOBAL: spin::Mutex<Option<Arc<Global>>> = spin::Mutex::new(None);

/// Monotonic descriptor ids, shared by every handle type.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

struct Local {
    es: Arc<XstreamInner>,
    main_ult: Ult,
    cur_ult: Option<Ult>,
    cur_task: Option<Task>,
}

thread_local! {
    static LOCAL: RefCell<Option<Local>> = const { RefCell::new(None) };
}

pub(crate) fn global() -> Result<Arc<Global>> {
    GLOBAL.lock().clone().ok_or(Error::InvalidXstream)
}

/// Has [`init`] completed (and [`finalize`] not yet run)?
pub fn is_initialized() -> bool {
    GLOBAL.lock().is_some()
}

pub(crate) fn install_local(es: Arc<XstreamInner>, main_ult: Ult) {
    LOCAL.with(|l| {
        *l.borrow_mut() = Some(Local {
            es,
            cur_ult: Some(main_ult.clone()),
            main_ult,
            cur_task: None,
        });
    });
}

pub(crate) fn clear_local() {
    LOCAL.with(|l| *l.borrow_mut() = None);
}

pub(crate) fn current_es() -> Option<Arc<XstreamInner>> {
    LOCAL.with(|l| l.borrow().as_ref().map(|local| local.es.clone()))
}

pub(crate) fn current_es_id() -> Option<u64> {
    LOCAL.with(|l| l.borrow().as_ref().map(|local| local.es.id()))
}

pub(crate) fn current_ult() -> Option<Ult> {
    LOCAL.with(|l| l.borrow().as_ref().and_then(|local| local.cur_ult.clone()))
}

pub(crate) fn set_current_ult(ult: Option<Ult>) {
    LOCAL.with(|l| {
        if let Some(local) = l.borrow_mut().as_mut() {
            local.cur_ult = ult;
        }
    });
}

pub(crate) fn current_task() -> Option<Task> {
    LOCAL.with(|l| l.borrow().as_ref().and_then(|local| local.cur_task.clone()))
}

pub(crate) fn set_current_task(task: Option<Task>) {
    LOCAL.with(|l| {
        if let Some(local) = l.borrow_mut().as_mut() {
            local.cur_task = task;
        }
    });
}

pub(crate) fn main_ult() -> Option<Ult> {
    LOCAL.with(|l| l.borrow().as_ref().map(|local| local.main_ult.clone()))
}

pub(crate) fn default_stack_size() -> usize {
    GLOBAL
        .lock()
        .as_ref()
        .map(|g| g.default_stack_size)
        .unwrap_or(DEFAULT_STACK_SIZE)
}

/// Initialize the runtime and adopt the calling thread as the primary
/// execution stream. Idempotent: a second call is a no-op.
pub fn init() -> Result<()> {
    {
        if GLOBAL.lock().is_some() {
            return Ok(());
        }
    }
    let default_stack_size = std::env::var(STACK_SIZE_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_STACK_SIZE);
    let primary = xstream::new_primary();
    let global = Arc::new(Global {
        xstreams: spin::Mutex::new(vec![primary.clone()]),
        primary: primary.clone(),
        next_rank: AtomicU64::new(1),
        default_stack_size,
    });
    {
        let mut slot = GLOBAL.lock();
        if slot.is_some() {
            // Lost an init race; the other caller's runtime stands.
            return Ok(());
        }
        *slot = Some(global);
    }
    xstream::bootstrap_primary(&primary)?;
    log::info!(
        "runtime initialized (default stack size {} bytes)",
        default_stack_size
    );
    Ok(())
}

/// Tear the runtime down: drain the primary scheduler stack, join and
/// free surviving secondary ESes newest-first, release the primary's
/// automatic scheduler and clear all global state. Must be called from
/// the primary main ULT.
pub fn finalize() -> Result<()> {
    let global = global()?;
    let es = current_es().ok_or(Error::InvalidXstream)?;
    if !Arc::ptr_eq(&es, &global.primary) {
        return Err(Error::InvalidXstream);
    }
    match current_ult() {
        Some(cur) if cur.ty() == UltType::Main => {}
        _ => return Err(Error::InvalidXstream),
    }
    // Drain the primary stack: ask everything to finish, then keep
    // entering the top scheduler until the stack is empty.
    loop {
        let scheds = es.sched_snapshot();
        if scheds.is_empty() {
            break;
        }
        for sched in &scheds {
            let _ = sched.finish();
        }
        progress()?;
    }
    for secondary in global.secondaries().into_iter().rev() {
        let xs = Xstream { inner: secondary };
        xs.join()?;
        xs.free()?;
    }
    let main_sched = es.main_sched();
    if let Some(sched) = main_sched {
        if sched.is_automatic() {
            let _ = sched.free();
        }
    }
    clear_local();
    *GLOBAL.lock() = None;
    log::info!("runtime finalized");
    Ok(())
}

/// Hand the primary main ULT's processor to the ES's top scheduler for
/// one visit; returns when the scheduler parks back (empty pools) or
/// terminates.
pub(crate) fn progress() -> Result<()> {
    let es = current_es().ok_or(Error::InvalidXstream)?;
    let main = main_ult().ok_or(Error::InvalidXstream)?;
    let top = match es.top_sched() {
        Some(t) => t,
        None => return Ok(()),
    };
    if top.state() == SchedState::Terminated {
        es.pop_sched(&top);
        return Ok(());
    }
    let host = top.host_ult().ok_or(Error::InvalidSched)?;
    if host == main {
        // The scheduler runs inline on this very context (a secondary
        // ES's MAIN scheduler); there is nothing to enter.
        return Ok(());
    }
    unsafe {
        crate::context::switch(main.ctx_ptr(), host.ctx_ptr());
    }
    set_current_ult(Some(main));
    Ok(())
}
