//! End-to-end scenarios driven through the public API: lifecycle laws,
//! the pool access outcome matrix, nested schedulers, migration,
//! cancellation and teardown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::pool::{Pool, PoolAccess, PoolKind};
use crate::sched::{Sched, SchedConfig, SchedDef, SchedPredef, SchedState};
use crate::task::Task;
use crate::ult::{yield_now, Ult, UltAttrs, UltState};
use crate::xstream::Xstream;
use crate::{finalize, init};

/// The runtime is a process-wide singleton; scenarios serialize on this
/// lock so cargo's parallel test threads cannot interleave init/finalize
/// cycles.
fn serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    let _ = env_logger::builder().is_test(true).try_init();
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn primary_pool() -> Pool {
    Xstream::current()
        .unwrap()
        .main_pools(1)
        .unwrap()
        .remove(0)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

// ---------------------------------------------------------------- lifecycle

#[test]
fn create_join_free_roundtrip() {
    let _serial = serial();
    init().unwrap();
    let pool = primary_pool();
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    let ult = Ult::create(
        &pool,
        move || {
            r.fetch_add(1, Ordering::SeqCst);
        },
        &UltAttrs::default(),
    )
    .unwrap();
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.total_size(), 1);
    ult.join().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(ult.state(), UltState::Terminated);
    assert_eq!(pool.total_size(), 0);
    ult.free().unwrap();
    // A freed handle is dead for every operation.
    assert_eq!(ult.join(), Err(Error::InvalidThread));
    assert_eq!(ult.free(), Err(Error::InvalidThread));
    assert_eq!(ult.cancel(), Err(Error::InvalidThread));
    finalize().unwrap();
}

#[test]
fn self_join_is_rejected() {
    let _serial = serial();
    init().unwrap();
    let pool = primary_pool();
    let observed = Arc::new(Mutex::new(None));
    let o = observed.clone();
    let ult = Ult::create(
        &pool,
        move || {
            let me = Ult::current().unwrap();
            *o.lock().unwrap() = Some(me.join());
        },
        &UltAttrs::default(),
    )
    .unwrap();
    ult.join().unwrap();
    assert_eq!(*observed.lock().unwrap(), Some(Err(Error::InvalidThread)));
    ult.free().unwrap();
    finalize().unwrap();
}

#[test]
fn non_joinable_ults_reject_join() {
    let _serial = serial();
    init().unwrap();
    let pool = primary_pool();
    let attrs = UltAttrs::new().joinable(false);
    let ult = Ult::create(&pool, || {}, &attrs).unwrap();
    assert_eq!(ult.join(), Err(Error::InvalidThread));
    // Drain it so free is legal.
    wait_loop_until_terminated(&ult);
    ult.free().unwrap();
    finalize().unwrap();
}

fn wait_loop_until_terminated(ult: &Ult) {
    while ult.state() != UltState::Terminated {
        yield_now().unwrap();
    }
}

#[test]
fn revive_reuses_stack_and_descriptor() {
    let _serial = serial();
    init().unwrap();
    let pool = primary_pool();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let ult = Ult::create(
        &pool,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        &UltAttrs::default(),
    )
    .unwrap();
    ult.join().unwrap();
    let base = ult.stack_base().unwrap();
    for round in 1..=4 {
        let h = hits.clone();
        Ult::revive(
            &pool,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            &ult,
        )
        .unwrap();
        ult.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), round + 1);
        assert_eq!(ult.stack_base().unwrap(), base, "revive must reuse the stack");
    }
    ult.free().unwrap();
    finalize().unwrap();
}

#[test]
fn revive_requires_termination() {
    let _serial = serial();
    init().unwrap();
    let pool = primary_pool();
    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    let ult = Ult::create(
        &pool,
        move || {
            while !s.load(Ordering::SeqCst) {
                yield_now().unwrap();
            }
        },
        &UltAttrs::default(),
    )
    .unwrap();
    // Still READY / RUNNING somewhere in its loop: revive must refuse.
    assert_eq!(
        Ult::revive(&pool, || {}, &ult),
        Err(Error::InvalidThread)
    );
    stop.store(true, Ordering::SeqCst);
    ult.join().unwrap();
    ult.free().unwrap();
    finalize().unwrap();
}

#[test]
fn freeing_a_live_ult_is_an_error() {
    let _serial = serial();
    init().unwrap();
    let pool = primary_pool();
    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    let ult = Ult::create(
        &pool,
        move || {
            while !s.load(Ordering::SeqCst) {
                yield_now().unwrap();
            }
        },
        &UltAttrs::default(),
    )
    .unwrap();
    if cfg!(not(debug_assertions)) {
        assert_eq!(ult.free(), Err(Error::InvalidThread));
    }
    stop.store(true, Ordering::SeqCst);
    ult.join().unwrap();
    ult.free().unwrap();
    finalize().unwrap();
}

#[test]
fn yield_round_robin_is_fair() {
    let _serial = serial();
    init().unwrap();
    let pool = primary_pool();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut ults = Vec::new();
    const K: usize = 4;
    const ROUNDS: usize = 5;
    for id in 0..K {
        let log = log.clone();
        ults.push(
            Ult::create(
                &pool,
                move || {
                    for _ in 0..ROUNDS {
                        log.lock().unwrap().push(id);
                        yield_now().unwrap();
                    }
                },
                &UltAttrs::default(),
            )
            .unwrap(),
        );
    }
    for ult in &ults {
        ult.join().unwrap();
        ult.free().unwrap();
    }
    let log = log.lock().unwrap();
    assert_eq!(log.len(), K * ROUNDS);
    // FIFO pool + one ES: the dispatch order is exactly round-robin, so
    // every window of K dispatches contains every ULT.
    for (i, id) in log.iter().enumerate() {
        assert_eq!(*id, i % K, "dispatch order must stay round-robin");
    }
    finalize().unwrap();
}

// ------------------------------------------------------------------- pools

#[test]
fn pool_counters_track_queued_and_live_units() {
    let _serial = serial();
    init().unwrap();
    let pool = Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false).unwrap();
    for _ in 0..3 {
        Task::create(&pool, || {}).unwrap();
    }
    assert_eq!(pool.size(), 3);
    assert_eq!(pool.total_size(), 3);
    let unit = pool.pop().unwrap().expect("three units queued");
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.total_size(), 3, "popped unit is still live");
    assert!(pool.total_size() >= pool.size());
    pool.push(unit).unwrap();
    assert_eq!(pool.size(), 3);
    pool.free().unwrap();
    assert_eq!(pool.free(), Err(Error::InvalidPool));
    finalize().unwrap();
}

#[test]
fn sched_attachments_are_counted_per_pool() {
    let _serial = serial();
    init().unwrap();
    let pool = Pool::create_basic(PoolKind::Fifo, PoolAccess::SrSw, false).unwrap();
    assert_eq!(pool.num_scheds(), 0);
    let cfg = SchedConfig::default();
    let s1 = Sched::create_basic(SchedPredef::Basic, &[Some(pool.clone())], &cfg).unwrap();
    let s2 = Sched::create_basic(SchedPredef::Basic, &[Some(pool.clone())], &cfg).unwrap();
    assert_eq!(pool.num_scheds(), 2);
    s1.free().unwrap();
    assert_eq!(pool.num_scheds(), 1);
    s2.free().unwrap();
    assert_eq!(pool.num_scheds(), 0);
    // Attachments made after creation are released the same way.
    let s3 = Sched::create_basic(SchedPredef::Basic, &[], &cfg).unwrap();
    pool.add_sched(&s3).unwrap();
    assert_eq!(pool.num_scheds(), 1);
    s3.free().unwrap();
    assert_eq!(pool.num_scheds(), 0);
    pool.free().unwrap();
    finalize().unwrap();
}

#[test]
fn add_sched_extends_the_dispatch_set() {
    let _serial = serial();
    init().unwrap();
    let cfg = SchedConfig::default();
    let sched = Sched::create_basic(SchedPredef::Basic, &[], &cfg).unwrap();
    let es = Xstream::create(Some(sched.clone())).unwrap();
    // Attach another pool while the scheduler is already running.
    let extra = Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false).unwrap();
    extra.add_sched(&sched).unwrap();
    assert_eq!(sched.num_pools(), 2);
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let ran = ran.clone();
        Task::spawn(&extra, move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    wait_until("tasklets from the attached pool to run", || {
        ran.load(Ordering::SeqCst) == 3
    });
    es.join().unwrap();
    es.free().unwrap();
    assert_eq!(extra.num_scheds(), 0, "freeing the scheduler releases the attachment");
    extra.free().unwrap();
    finalize().unwrap();
}

/// Build a pool owned by the given secondary ES by creating it from a
/// tasklet running there.
fn pool_owned_by(xs: &Xstream, access: PoolAccess) -> Pool {
    let main = xs.main_pools(1).unwrap().remove(0);
    let (tx, rx) = mpsc::channel();
    Task::spawn(&main, move || {
        let _ = tx.send(Pool::create_basic(PoolKind::Fifo, access, false));
    })
    .unwrap();
    rx.recv().unwrap().unwrap()
}

#[test]
fn pool_access_outcome_matrix() {
    let _serial = serial();
    init().unwrap();
    let ok = Ok(());
    let denied = Err(Error::InvalidPoolAccess);

    let cfg = SchedConfig::default();
    let s1 = Sched::create_basic(SchedPredef::Basic, &[], &cfg).unwrap();
    let s2 = Sched::create_basic(SchedPredef::Basic, &[], &cfg).unwrap();
    let es1 = Xstream::create(Some(s1.clone())).unwrap();
    let es2 = Xstream::create(Some(s2.clone())).unwrap();

    let accesses = [
        PoolAccess::Prw,
        PoolAccess::PrPw,
        PoolAccess::PrSw,
        PoolAccess::SrPw,
        PoolAccess::SrSw,
    ];
    // Attaching schedulers bound to two different ESes.
    let expect_second_attach = [denied, denied, denied, ok, ok];
    // Pushing a tasklet from an ES other than the pool's owner.
    let expect_foreign_push = [denied, ok, ok, denied, ok];
    // Popping from an ES other than the pool's owner.
    let expect_foreign_pop = [denied, denied, ok, denied, ok];

    for (i, access) in accesses.into_iter().enumerate() {
        // (A) attach on two ESes. The pool is owned by the primary, so
        // for creation-bound consumers even the first attach fails; the
        // tabulated outcome is the second attach.
        let pool = Pool::create_basic(PoolKind::Fifo, access, false).unwrap();
        let first = pool.add_sched(&s1);
        let second = pool.add_sched(&s2);
        assert_eq!(second, expect_second_attach[i], "two-ES attach for {access:?}");
        match access {
            PoolAccess::Prw | PoolAccess::PrPw => assert_eq!(first, denied),
            _ => assert_eq!(first, ok),
        }
        pool.free().unwrap();

        // (B) push a tasklet from a foreign ES (the primary) into a pool
        // owned by es1.
        let pool = pool_owned_by(&es1, access);
        let push = Task::create(&pool, || {}).map(|_| ());
        assert_eq!(push, expect_foreign_push[i], "foreign push for {access:?}");
        pool.free().unwrap();

        // (C) pop from a foreign ES (the primary).
        let pool = pool_owned_by(&es1, access);
        let pop = pool.pop().map(|_| ());
        assert_eq!(pop, expect_foreign_pop[i], "foreign pop for {access:?}");
        pool.free().unwrap();
    }

    es1.join().unwrap();
    es1.free().unwrap();
    es2.join().unwrap();
    es2.free().unwrap();
    finalize().unwrap();
}

// -------------------------------------------------------------- schedulers

#[test]
fn sched_exit_terminates_without_draining() {
    let _serial = serial();
    init().unwrap();
    let pool = Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false).unwrap();
    let cfg = SchedConfig::default();
    let sched = Sched::create_basic(SchedPredef::Basic, &[Some(pool.clone())], &cfg).unwrap();
    let es = Xstream::create(Some(sched.clone())).unwrap();
    let started = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let started = started.clone();
        Ult::spawn(&pool, move || {
            started.fetch_add(1, Ordering::SeqCst);
            loop {
                yield_now().unwrap();
            }
        })
        .unwrap();
    }
    wait_until("the yield loops to start", || {
        started.load(Ordering::SeqCst) == 2
    });
    assert_eq!(sched.exit(), Ok(()));
    es.join().unwrap();
    assert_eq!(sched.state(), SchedState::Terminated);
    assert!(pool.size() > 0, "exit must not drain the pools");
    es.free().unwrap();
    pool.free().unwrap();
    finalize().unwrap();
}

#[test]
fn sched_finish_drains_before_terminating() {
    let _serial = serial();
    init().unwrap();
    let pool = Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false).unwrap();
    let cfg = SchedConfig::default();
    let sched = Sched::create_basic(SchedPredef::Basic, &[Some(pool.clone())], &cfg).unwrap();
    let es = Xstream::create(Some(sched.clone())).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let done = done.clone();
        Ult::spawn(&pool, move || {
            yield_now().unwrap();
            yield_now().unwrap();
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    sched.finish().unwrap();
    es.join().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 3, "finish waits for the drain");
    assert_eq!(sched.total_size(), 0);
    es.free().unwrap();
    pool.free().unwrap();
    finalize().unwrap();
}

#[test]
fn priority_sched_serves_highest_index_first() {
    let _serial = serial();
    init().unwrap();
    let pools: Vec<Pool> = (0..3)
        .map(|_| Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false).unwrap())
        .collect();
    let slots: Vec<Option<Pool>> = pools.iter().cloned().map(Some).collect();
    let cfg = SchedConfig::default();
    let sched = Sched::create_basic(SchedPredef::Priority, &slots, &cfg).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    for (idx, pool) in pools.iter().enumerate() {
        for _ in 0..2 {
            let log = log.clone();
            Task::spawn(pool, move || log.lock().unwrap().push(idx)).unwrap();
        }
    }
    // Everything is queued before the ES starts, so the order is fixed.
    let es = Xstream::create(Some(sched)).unwrap();
    es.join().unwrap();
    es.free().unwrap();
    assert_eq!(*log.lock().unwrap(), vec![2, 2, 1, 1, 0, 0]);
    for pool in pools {
        pool.free().unwrap();
    }
    finalize().unwrap();
}

#[test]
fn pools_accessor_checks_bounds() {
    let _serial = serial();
    init().unwrap();
    let cfg = SchedConfig::default();
    let sched = Sched::create_basic(SchedPredef::Basic, &[], &cfg).unwrap();
    assert_eq!(sched.num_pools(), 1);
    assert!(sched.pools(1, 0).is_ok());
    assert_eq!(sched.pools(2, 0).err(), Some(Error::Sched));
    assert_eq!(sched.pools(1, 1).err(), Some(Error::Sched));
    sched.free().unwrap();
    finalize().unwrap();
}

#[test]
fn no_pool_predef_requires_pools() {
    let _serial = serial();
    init().unwrap();
    let cfg = SchedConfig::default();
    assert_eq!(
        Sched::create_basic(SchedPredef::NoPool, &[], &cfg).err(),
        Some(Error::InvalidSchedPredef)
    );
    let pool = Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false).unwrap();
    let sched = Sched::create_basic(SchedPredef::NoPool, &[Some(pool.clone())], &cfg).unwrap();
    assert_eq!(sched.num_pools(), 1);
    sched.free().unwrap();
    pool.free().unwrap();
    finalize().unwrap();
}

/// A user-defined scheduler: counts every dispatch in its attached data.
static COUNTING_DEF: SchedDef = SchedDef {
    init: Some(counting_init),
    run: counting_run,
    free: None,
    get_migration_pool: None,
};

fn counting_init(sched: &Sched, _config: &SchedConfig) -> crate::Result<()> {
    sched.set_data(Box::new(0usize));
    Ok(())
}

fn counting_run(sched: &Sched) {
    let pools = sched.pools(sched.num_pools(), 0).unwrap_or_default();
    loop {
        for pool in &pools {
            if let Ok(Some(unit)) = pool.pop() {
                sched.with_data(|data| {
                    if let Some(count) = data.and_then(|d| d.downcast_mut::<usize>()) {
                        *count += 1;
                    }
                });
                sched.run_unit(unit, pool);
                break;
            }
        }
        match sched.has_to_stop() {
            Ok(true) | Err(_) => break,
            Ok(false) => {}
        }
    }
}

#[test]
fn user_defined_sched_runs_units() {
    let _serial = serial();
    init().unwrap();
    let cfg = SchedConfig::default();
    let sched = Sched::create(&COUNTING_DEF, &[None], &cfg).unwrap();
    let pool = sched.pools(1, 0).unwrap().remove(0);
    let es = Xstream::create(Some(sched.clone())).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let ran = ran.clone();
        Task::spawn(&pool, move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    wait_until("the counting scheduler to drain", || {
        ran.load(Ordering::SeqCst) == 5
    });
    let dispatched = sched.with_data(|data| {
        data.and_then(|d| d.downcast_ref::<usize>().copied())
            .unwrap_or(0)
    });
    assert_eq!(dispatched, 5);
    es.join().unwrap();
    es.free().unwrap();
    // Schedulers from a raw definition are not automatic.
    sched.free().unwrap();
    finalize().unwrap();
}

// ---------------------------------------------------- nested schedulers

#[test]
fn stacked_scheduler_runs_then_returns_control() {
    let _serial = serial();
    init().unwrap();
    let pool = primary_pool();
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let o = order.clone();
    let ult = Ult::create(
        &pool,
        move || {
            o.lock().unwrap().push("outer:start".into());
            let cfg = SchedConfig::default();
            let inner = Sched::create_basic(SchedPredef::Basic, &[], &cfg).unwrap();
            let inner_pool = inner.pools(1, 0).unwrap().remove(0);
            for i in 0..3 {
                let o = o.clone();
                Task::spawn(&inner_pool, move || {
                    o.lock().unwrap().push(format!("inner:{i}"));
                })
                .unwrap();
            }
            inner.finish().unwrap();
            let xs = Xstream::current().unwrap();
            xs.push_scheduler(&inner).unwrap();
            // We are re-dispatched by the scheduler beneath, which only
            // regains the ES once the stacked one has terminated.
            o.lock().unwrap().push("outer:resumed".into());
            assert_eq!(inner.state(), SchedState::Terminated);
            inner.free().unwrap();
        },
        &UltAttrs::default(),
    )
    .unwrap();
    ult.join().unwrap();
    ult.free().unwrap();
    assert_eq!(
        *order.lock().unwrap(),
        vec![
            "outer:start".to_string(),
            "inner:0".to_string(),
            "inner:1".to_string(),
            "inner:2".to_string(),
            "outer:resumed".to_string(),
        ]
    );
    finalize().unwrap();
}

// ------------------------------------------------------------- migration

#[test]
fn migration_moves_a_ult_between_eses() {
    let _serial = serial();
    init().unwrap();
    let pa = Pool::create_basic(PoolKind::Fifo, PoolAccess::SrSw, false).unwrap();
    let pb = Pool::create_basic(PoolKind::Fifo, PoolAccess::SrSw, false).unwrap();
    let cfg = SchedConfig::default();
    let sa = Sched::create_basic(SchedPredef::Basic, &[Some(pa.clone())], &cfg).unwrap();
    let sb = Sched::create_basic(SchedPredef::Basic, &[Some(pb.clone())], &cfg).unwrap();
    let ea = Xstream::create(Some(sa)).unwrap();
    let eb = Xstream::create(Some(sb)).unwrap();
    let ea_id = ea.inner.id();
    let eb_id = eb.inner.id();

    let seen = Arc::new(Mutex::new(Vec::<u64>::new()));
    let stop = Arc::new(AtomicBool::new(false));
    let s = seen.clone();
    let st = stop.clone();
    let ult = Ult::create(
        &pa,
        move || {
            while !st.load(Ordering::SeqCst) {
                s.lock()
                    .unwrap()
                    .push(crate::runtime::current_es_id().unwrap());
                yield_now().unwrap();
            }
        },
        &UltAttrs::default(),
    )
    .unwrap();

    wait_until("the ULT to run on its first ES", || {
        seen.lock().unwrap().first() == Some(&ea_id)
    });
    ult.migrate_to(&eb).unwrap();
    wait_until("the ULT to show up on the second ES", || {
        seen.lock().unwrap().last() == Some(&eb_id)
    });
    stop.store(true, Ordering::SeqCst);
    ult.join().unwrap();
    ult.free().unwrap();

    let seen = seen.lock().unwrap().clone();
    let first_b = seen.iter().position(|&id| id == eb_id).unwrap();
    assert!(seen[..first_b].iter().all(|&id| id == ea_id));
    assert!(seen[first_b..].iter().all(|&id| id == eb_id));

    ea.join().unwrap();
    ea.free().unwrap();
    eb.join().unwrap();
    eb.free().unwrap();
    pa.free().unwrap();
    pb.free().unwrap();
    finalize().unwrap();
}

#[test]
fn migration_to_incompatible_pool_is_rejected() {
    let _serial = serial();
    init().unwrap();
    let cfg = SchedConfig::default();
    // Source: a private-read pool drained by its own ES.
    let pa = Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false).unwrap();
    let sa = Sched::create_basic(SchedPredef::Basic, &[Some(pa.clone())], &cfg).unwrap();
    let ea = Xstream::create(Some(sa)).unwrap();
    // Destination: its pool's producer side is bound to the primary, so
    // the source ES may not push into it and the request must be refused
    // up front.
    let pb = Pool::create_basic(PoolKind::Fifo, PoolAccess::SrPw, false).unwrap();
    let sb = Sched::create_basic(SchedPredef::Basic, &[Some(pb.clone())], &cfg).unwrap();
    let eb = Xstream::create(Some(sb)).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let st = stop.clone();
    let ult = Ult::create(
        &pa,
        move || {
            while !st.load(Ordering::SeqCst) {
                yield_now().unwrap();
            }
        },
        &UltAttrs::default(),
    )
    .unwrap();
    assert_eq!(ult.migrate_to(&eb), Err(Error::InvalidPoolAccess));
    stop.store(true, Ordering::SeqCst);
    ult.join().unwrap();
    ult.free().unwrap();
    ea.join().unwrap();
    ea.free().unwrap();
    eb.join().unwrap();
    eb.free().unwrap();
    pa.free().unwrap();
    pb.free().unwrap();
    finalize().unwrap();
}

// ------------------------------------------------------------ cancellation

#[test]
fn cancel_terminates_within_one_dispatch() {
    let _serial = serial();
    init().unwrap();
    let pool = Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false).unwrap();
    let cfg = SchedConfig::default();
    let sched = Sched::create_basic(SchedPredef::Basic, &[Some(pool.clone())], &cfg).unwrap();
    let es = Xstream::create(Some(sched)).unwrap();
    let spins = Arc::new(AtomicUsize::new(0));
    let s = spins.clone();
    let ult = Ult::create(
        &pool,
        move || loop {
            s.fetch_add(1, Ordering::SeqCst);
            yield_now().unwrap();
        },
        &UltAttrs::default(),
    )
    .unwrap();
    wait_until("the loop to spin", || spins.load(Ordering::SeqCst) > 2);
    ult.cancel().unwrap();
    let at_cancel = spins.load(Ordering::SeqCst);
    ult.join().unwrap();
    let total = spins.load(Ordering::SeqCst);
    assert!(
        total <= at_cancel + 1,
        "cancelled ULT ran {} extra dispatches",
        total - at_cancel
    );
    ult.free().unwrap();
    es.join().unwrap();
    es.free().unwrap();
    pool.free().unwrap();
    finalize().unwrap();
}

#[test]
fn cancel_before_first_dispatch_skips_the_body() {
    let _serial = serial();
    init().unwrap();
    let pool = primary_pool();
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let ult = Ult::create(&pool, move || r.store(true, Ordering::SeqCst), &UltAttrs::default())
        .unwrap();
    ult.cancel().unwrap();
    ult.join().unwrap();
    assert!(!ran.load(Ordering::SeqCst), "cancelled before dispatch");
    ult.free().unwrap();
    finalize().unwrap();
}

// --------------------------------------------------------- cross-ES joins

#[test]
fn ult_blocks_on_join_and_is_woken_by_the_terminator() {
    let _serial = serial();
    init().unwrap();
    let remote_pool = Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false).unwrap();
    let cfg = SchedConfig::default();
    let sched = Sched::create_basic(SchedPredef::Basic, &[Some(remote_pool.clone())], &cfg).unwrap();
    let es = Xstream::create(Some(sched)).unwrap();

    let target = Ult::create(
        &remote_pool,
        || {
            for _ in 0..3 {
                yield_now().unwrap();
            }
        },
        &UltAttrs::default(),
    )
    .unwrap();

    let joined = Arc::new(AtomicBool::new(false));
    let j = joined.clone();
    let t = target.clone();
    let joiner = Ult::create(
        &primary_pool(),
        move || {
            t.join().unwrap();
            j.store(true, Ordering::SeqCst);
        },
        &UltAttrs::default(),
    )
    .unwrap();

    joiner.join().unwrap();
    assert!(joined.load(Ordering::SeqCst));
    assert_eq!(target.state(), UltState::Terminated);
    joiner.free().unwrap();
    target.free().unwrap();
    es.join().unwrap();
    es.free().unwrap();
    remote_pool.free().unwrap();
    finalize().unwrap();
}

#[test]
fn foreign_terminator_wakes_joiner_in_private_pool() {
    let _serial = serial();
    init().unwrap();
    let cfg = SchedConfig::default();
    let s1 = Sched::create_basic(SchedPredef::Basic, &[], &cfg).unwrap();
    let es1 = Xstream::create(Some(s1.clone())).unwrap();
    let es1_main = es1.main_pools(1).unwrap().remove(0);
    // A single-ES pool on es1, dispatched by es1's scheduler.
    let prw = pool_owned_by(&es1, PoolAccess::Prw);
    prw.add_sched(&s1).unwrap();

    // The join target lives on a second ES, so its terminator wakes the
    // joiner from a foreign kernel thread.
    let pool2 = Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false).unwrap();
    let s2 = Sched::create_basic(SchedPredef::Basic, &[Some(pool2.clone())], &cfg).unwrap();
    let es2 = Xstream::create(Some(s2)).unwrap();
    let go = Arc::new(AtomicBool::new(false));
    let g = go.clone();
    let target = Ult::create(
        &pool2,
        move || {
            while !g.load(Ordering::SeqCst) {
                yield_now().unwrap();
            }
        },
        &UltAttrs::default(),
    )
    .unwrap();

    // The joiner must be created from es1 itself; only es1 may feed the
    // private pool.
    let joined = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let t = target.clone();
    let j = joined.clone();
    let prw2 = prw.clone();
    Task::spawn(&es1_main, move || {
        let joiner = Ult::create(
            &prw2,
            move || {
                t.join().unwrap();
                j.store(true, Ordering::SeqCst);
            },
            &UltAttrs::default(),
        );
        let _ = tx.send(joiner);
    })
    .unwrap();
    let joiner = rx.recv().unwrap().unwrap();

    wait_until("the joiner to block on its target", || {
        joiner.state() == UltState::Blocked
    });
    go.store(true, Ordering::SeqCst);
    wait_until("the woken joiner to finish", || joined.load(Ordering::SeqCst));

    joiner.join().unwrap();
    joiner.free().unwrap();
    target.join().unwrap();
    target.free().unwrap();
    es1.join().unwrap();
    es1.free().unwrap();
    es2.join().unwrap();
    es2.free().unwrap();
    prw.free().unwrap();
    pool2.free().unwrap();
    finalize().unwrap();
}

// ---------------------------------------------------------------- teardown

#[test]
fn finalize_retires_spawned_ults() {
    let _serial = serial();
    init().unwrap();
    let pool = primary_pool();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let ran = ran.clone();
        Ult::spawn(&pool, move || {
            ran.fetch_add(1, Ordering::SeqCst);
            yield_now().unwrap();
        })
        .unwrap();
    }
    finalize().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 100);
    assert!(!crate::is_initialized());
}

#[test]
fn runtime_apis_fail_off_the_runtime() {
    let _serial = serial();
    init().unwrap();
    let outcome = std::thread::spawn(|| {
        (
            Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false).err(),
            Ult::current().err(),
            Xstream::current().err(),
            yield_now().err(),
        )
    })
    .join()
    .unwrap();
    assert_eq!(
        outcome,
        (
            Some(Error::InvalidXstream),
            Some(Error::InvalidXstream),
            Some(Error::InvalidXstream),
            Some(Error::InvalidXstream),
        )
    );
    finalize().unwrap();
}

#[test]
fn init_is_idempotent() {
    let _serial = serial();
    init().unwrap();
    init().unwrap();
    let xs = Xstream::current().unwrap();
    assert_eq!(xs.rank(), 0);
    finalize().unwrap();
}

// ----------------------------------------------------------------- stencil

const NBX: usize = 4;
const NBY: usize = 4;
const BLOCKSIZE: usize = 16;
const ITERS: usize = 10;
const WIDTH: usize = NBX * BLOCKSIZE + 2;
const HEIGHT: usize = NBY * BLOCKSIZE + 2;

fn idx(x: usize, y: usize) -> usize {
    y * WIDTH + x
}

fn init_grid() -> Vec<f64> {
    let mut values = vec![0.0; WIDTH * HEIGHT];
    for y in 1..HEIGHT - 1 {
        for x in 1..WIDTH - 1 {
            values[idx(x, y)] = ((x * 7 + y * 13) % 10) as f64;
        }
    }
    values
}

fn stencil_block(old: *const f64, new: *mut f64, bx: usize, by: usize) {
    for y in by * BLOCKSIZE + 1..(by + 1) * BLOCKSIZE + 1 {
        for x in bx * BLOCKSIZE + 1..(bx + 1) * BLOCKSIZE + 1 {
            unsafe {
                *new.add(idx(x, y)) = *old.add(idx(x, y)) * 0.5
                    + (*old.add(idx(x + 1, y))
                        + *old.add(idx(x - 1, y))
                        + *old.add(idx(x, y + 1))
                        + *old.add(idx(x, y - 1)))
                        * 0.125;
            }
        }
    }
}

fn serial_stencil() -> Vec<f64> {
    let mut old = init_grid();
    let mut new = vec![0.0; WIDTH * HEIGHT];
    for _ in 0..ITERS {
        for by in 0..NBY {
            for bx in 0..NBX {
                stencil_block(old.as_ptr(), new.as_mut_ptr(), bx, by);
            }
        }
        std::mem::swap(&mut old, &mut new);
    }
    old
}

/// Raw grid pointers handed to the block kernels. Blocks write disjoint
/// regions, so the unguarded sharing is sound.
#[derive(Clone, Copy)]
struct GridPtr {
    old: *const f64,
    new: *mut f64,
}
unsafe impl Send for GridPtr {}

#[test]
fn stencil_fork_join_revive_matches_serial() {
    let _serial = serial();
    init().unwrap();
    let es2 = Xstream::create(None).unwrap();
    let pools = [
        primary_pool(),
        es2.main_pools(1).unwrap().remove(0),
    ];

    let mut old = init_grid();
    let mut new = vec![0.0; WIDTH * HEIGHT];
    let mut ults: Vec<Ult> = Vec::with_capacity(NBX * NBY);
    let mut bases = Vec::new();

    for t in 0..ITERS {
        let grid = GridPtr {
            old: old.as_ptr(),
            new: new.as_mut_ptr(),
        };
        for by in 0..NBY {
            for bx in 0..NBX {
                let index = bx + by * NBX;
                let pool = &pools[index % pools.len()];
                let body = move || {
                    let grid = grid;
                    stencil_block(grid.old, grid.new, bx, by)
                };
                if t == 0 {
                    ults.push(Ult::create(pool, body, &UltAttrs::default()).unwrap());
                } else {
                    Ult::revive(pool, body, &ults[index]).unwrap();
                }
            }
        }
        let live: usize = pools.iter().map(|p| p.total_size()).sum();
        assert!(live <= NBX * NBY, "never more live ULTs than blocks");
        for ult in &ults {
            ult.join().unwrap();
        }
        if t == 0 {
            bases = ults.iter().map(|u| u.stack_base().unwrap()).collect();
        } else {
            // No stack is allocated after the first iteration.
            for (ult, base) in ults.iter().zip(&bases) {
                assert_eq!(ult.stack_base().unwrap(), *base);
            }
        }
        std::mem::swap(&mut old, &mut new);
    }
    for ult in &ults {
        ult.free().unwrap();
    }

    es2.join().unwrap();
    es2.free().unwrap();
    finalize().unwrap();

    let reference = serial_stencil();
    for (a, b) in old.iter().zip(&reference) {
        assert!((a - b).abs() <= 1e-12, "stencil diverged: {a} vs {b}");
    }
}
