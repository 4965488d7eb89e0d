//! # weft
//!
//! A user-level threading runtime: many lightweight cooperative tasks
//! multiplexed over a small, caller-chosen number of OS threads.
//!
//! ## Model
//!
//! - An **execution stream** ([`Xstream`]) is a kernel thread running a
//!   stack of schedulers. The thread that calls [`init`] becomes the
//!   *primary* ES; more are created explicitly.
//! - A **scheduler** ([`Sched`]) drains an ordered set of pools and
//!   dispatches what it pops. The built-in kinds are round-robin and
//!   priority; user-defined kinds supply a [`SchedDef`] callback record.
//! - A **pool** ([`Pool`]) queues ready work units under a
//!   producer/consumer access policy ([`PoolAccess`]) that says which
//!   ESes may push and pop.
//! - A **ULT** ([`Ult`]) is a stackful cooperative thread: it yields,
//!   joins, blocks and can be *revived* after termination, reusing its
//!   stack. A **tasklet** ([`Task`]) is its stackless one-shot sibling.
//!
//! Scheduling is cooperative: within one ES exactly one ULT runs at a
//! time and control only changes hands at explicit points ([`yield_now`],
//! [`Ult::join`], [`exit`], scheduler dispatch). Across ESes, kernel
//! threads run in parallel.
//!
//! ## Example
//!
//! ```
//! use weft::{Ult, UltAttrs, Xstream};
//!
//! weft::init()?;
//! let xs = Xstream::current()?;
//! let pool = xs.main_pools(1)?.remove(0);
//! let ult = Ult::create(&pool, || println!("hello from a ULT"), &UltAttrs::default())?;
//! ult.join()?;
//! ult.free()?;
//! weft::finalize()?;
//! # Ok::<(), weft::Error>(())
//! ```

mod context;
mod error;
mod pool;
mod runtime;
mod sched;
mod task;
mod ult;
mod xstream;

#[cfg(test)]
mod tests;

pub use context::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
pub use error::{Error, Result};
pub use pool::{Pool, PoolAccess, PoolKind, Unit};
pub use runtime::{finalize, init, is_initialized, STACK_SIZE_ENV};
pub use sched::{
    Sched, SchedConfig, SchedDef, SchedPredef, SchedState, BASIC_SCHED_DEF, PRIO_SCHED_DEF,
};
pub use task::{Task, TaskState};
pub use ult::{exit, yield_now, Ult, UltAttrs, UltState};
pub use xstream::{Xstream, XstreamState};
