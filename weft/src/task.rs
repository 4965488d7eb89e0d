//! # Tasklets
//!
//! A tasklet is the stackless sibling of a ULT: one entry closure that
//! runs to completion on the dispatching scheduler's own context. It
//! cannot yield or block, so it has no stack, no saved context and no
//! joiner; cancellation is only observed before it starts running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::{Pool, Unit};
use crate::runtime;
use crate::ult::Request;

/// Lifecycle state of a tasklet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Ready = 0,
    Running = 1,
    Terminated = 2,
}

impl TaskState {
    fn from_u8(v: u8) -> TaskState {
        match v {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            _ => TaskState::Terminated,
        }
    }
}

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct TaskInner {
    id: u64,
    state: AtomicU8,
    request: AtomicU32,
    automatic: bool,
    entry: spin::Mutex<Option<EntryFn>>,
    home: spin::Mutex<Option<Pool>>,
    released: AtomicBool,
}

/// Handle to a tasklet.
#[derive(Clone)]
pub struct Task {
    pub(crate) inner: Arc<TaskInner>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Task {}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    fn build(pool: &Pool, entry: EntryFn, automatic: bool) -> Result<Task> {
        let es = runtime::current_es_id().ok_or(Error::InvalidXstream)?;
        if pool.inner.is_released() {
            return Err(Error::InvalidPool);
        }
        pool.inner.check_push(es)?;
        let task = Task {
            inner: Arc::new(TaskInner {
                id: runtime::next_id(),
                state: AtomicU8::new(TaskState::Ready as u8),
                request: AtomicU32::new(0),
                automatic,
                entry: spin::Mutex::new(Some(entry)),
                home: spin::Mutex::new(None),
                released: AtomicBool::new(false),
            }),
        };
        *task.inner.home.lock() = Some(pool.clone());
        pool.inner.unit_homed();
        pool.inner.enqueue(Unit::Task(task.clone()));
        log::trace!("tasklet {} created in pool {}", task.inner.id, pool.id());
        Ok(task)
    }

    /// Create a tasklet running `f` and queue it READY into `pool`.
    pub fn create<F>(pool: &Pool, f: F) -> Result<Task>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(pool, Box::new(f), false)
    }

    /// Create an unnamed tasklet, retired automatically on completion.
    pub fn spawn<F>(pool: &Pool, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(pool, Box::new(f), true)?;
        Ok(())
    }

    /// Release a terminated tasklet's descriptor.
    pub fn free(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.released.load(Ordering::Acquire) {
            return Err(Error::InvalidThread);
        }
        let state = self.state();
        debug_assert_eq!(state, TaskState::Terminated, "freeing a live tasklet");
        if state != TaskState::Terminated {
            return Err(Error::InvalidThread);
        }
        inner.released.store(true, Ordering::Release);
        *inner.entry.lock() = None;
        *inner.home.lock() = None;
        Ok(())
    }

    /// Request cancellation; effective only while the tasklet is still
    /// queued.
    pub fn cancel(&self) -> Result<()> {
        if self.inner.released.load(Ordering::Acquire) {
            return Err(Error::InvalidThread);
        }
        self.inner
            .request
            .fetch_or(Request::CANCEL.bits(), Ordering::AcqRel);
        Ok(())
    }

    /// The tasklet the caller is running inside of, if any.
    pub fn current() -> Result<Task> {
        runtime::current_task().ok_or(Error::InvalidXstream)
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    // ---- crate-internal plumbing ----

    pub(crate) fn home_pool(&self) -> Option<Pool> {
        self.inner.home.lock().clone()
    }

    pub(crate) fn set_home_pool(&self, pool: Option<Pool>) {
        *self.inner.home.lock() = pool;
    }

    pub(crate) fn is_automatic(&self) -> bool {
        self.inner.automatic
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        Request::from_bits_truncate(self.inner.request.load(Ordering::Acquire))
            .contains(Request::CANCEL)
    }

    pub(crate) fn set_state(&self, s: TaskState) {
        self.inner.state.store(s as u8, Ordering::Release);
    }

    /// Run the entry closure to completion on the caller's context.
    pub(crate) fn execute(&self) {
        self.set_state(TaskState::Running);
        runtime::set_current_task(Some(self.clone()));
        let entry = self.inner.entry.lock().take();
        if let Some(f) = entry {
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                log::error!("tasklet {} panicked; treating it as terminated", self.inner.id);
            }
        }
        runtime::set_current_task(None);
        self.set_state(TaskState::Terminated);
    }
}
