use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tutti::{
    prelude::*,
    shape::{block_range, blocks},
};

fn topology(domains: usize, pus_per_domain: usize) -> Arc<dyn Topology> {
    Arc::new(LogicalTopology::with_domains(domains, pus_per_domain))
}

fn hierarchical(domains: usize, pus_per_domain: usize) -> (Arc<dyn Topology>, BlockForkJoinExecutor) {
    let topology = topology(domains, pus_per_domain);
    let targets = topology.numa_domains();
    let exec = BlockForkJoinExecutor::with_topology(
        Arc::clone(&topology),
        targets,
        ForkJoinParams::default(),
    )
    .unwrap();
    (topology, exec)
}

#[test]
fn blocks_are_balanced_and_exhaustive() {
    for len in 0..50 {
        for parts in 1..8 {
            let mut covered = vec![0; len];
            for block in blocks(0..len, parts) {
                for index in block {
                    covered[index] += 1;
                }
            }
            assert!(covered.iter().all(|&hits| hits == 1));
        }
    }
}

#[test]
fn single_target_forwards_to_one_executor() {
    let topology = topology(1, 4);
    let exec = BlockForkJoinExecutor::with_topology(
        Arc::clone(&topology),
        topology.numa_domains(),
        ForkJoinParams::default(),
    )
    .unwrap();
    assert!(!exec.is_hierarchical());
    assert!(exec.inner_executors().is_empty());
    assert_eq!(exec.num_targets(), 1);

    let direct = ForkJoinExecutor::with_topology(
        Arc::clone(&topology),
        topology.numa_domains()[0].mask(),
        ForkJoinParams::default(),
    )
    .unwrap();

    let run = |bulk: &dyn Fn(&(dyn Fn(usize) + Sync))| {
        let seen: Vec<_> = (0..37).map(|_| Mutex::new(Vec::new())).collect();
        bulk(&|i| seen[i].lock().unwrap().push(topology.current_pu()));
        seen.into_iter()
            .map(|cell| cell.into_inner().unwrap())
            .collect::<Vec<_>>()
    };
    let through_block = run(&|f| exec.bulk_execute(f, 0..37));
    let through_direct = run(&|f| direct.bulk_execute(f, 0..37));
    assert_eq!(through_block, through_direct);
}

#[test]
fn every_index_runs_once_on_its_target() {
    let (topology, exec) = hierarchical(3, 2);
    assert!(exec.is_hierarchical());
    assert_eq!(exec.inner_executors().len(), 3);

    let len = 101;
    let pus: Vec<_> = (0..len).map(|_| AtomicUsize::new(usize::MAX)).collect();
    let hits: Vec<_> = (0..len).map(|_| AtomicUsize::new(0)).collect();
    exec.bulk_execute(
        |i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
            pus[i].store(topology.current_pu(), Ordering::Relaxed);
        },
        0..len,
    );

    assert!(hits.iter().all(|hits| hits.load(Ordering::Relaxed) == 1));
    for (target_index, target) in exec.targets().iter().enumerate() {
        for i in block_range(&(0..len), target_index, exec.num_targets()) {
            assert!(target.mask().test(pus[i].load(Ordering::Relaxed)));
        }
    }
}

#[test]
fn shapes_with_an_offset_are_split_like_any_other() {
    let (_topology, exec) = hierarchical(2, 2);
    let sum = AtomicUsize::new(0);
    exec.bulk_execute(
        |i| {
            sum.fetch_add(i, Ordering::Relaxed);
        },
        10..20,
    );
    assert_eq!(sum.load(Ordering::Relaxed), (10..20).sum::<usize>());

    // Fewer items than targets leaves some targets without work.
    let hits = AtomicUsize::new(0);
    exec.bulk_execute(
        |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        },
        0..1,
    );
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn repeated_runs_are_identical() {
    let (_topology, exec) = hierarchical(2, 3);
    let run = || {
        let out: Vec<_> = (0..64).map(|_| AtomicUsize::new(0)).collect();
        exec.bulk_execute(|i| out[i].store(i * i, Ordering::Relaxed), 0..64);
        out.into_iter()
            .map(AtomicUsize::into_inner)
            .collect::<Vec<_>>()
    };
    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert_eq!(first[9], 81);
}

#[test]
fn the_caller_must_belong_to_a_target() {
    let topology = topology(4, 2);
    for _ in 0..5 {
        let targets = vec![Target::from_pus(2..4), Target::from_pus(4..6)];
        let err = BlockForkJoinExecutor::with_topology(
            Arc::clone(&topology),
            targets,
            ForkJoinParams::default(),
        )
        .unwrap_err();
        assert!(err.is_bad_parameter());
    }
}

#[test]
fn invalid_parameters_are_rejected() {
    let topology = topology(2, 2);
    let err = BlockForkJoinExecutor::with_topology(
        Arc::clone(&topology),
        Vec::new(),
        ForkJoinParams::default(),
    )
    .unwrap_err();
    assert!(err.is_bad_parameter());

    let err = BlockForkJoinExecutor::with_topology(
        Arc::clone(&topology),
        topology.numa_domains(),
        ForkJoinParams::default().stack_size(StackSize::NoStack),
    )
    .unwrap_err();
    assert!(err.is_bad_parameter());
}

#[test]
fn panics_are_resumed_after_every_target_finishes() {
    let (_topology, exec) = hierarchical(2, 2);
    let ran = AtomicUsize::new(0);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        exec.bulk_execute(
            |i| {
                ran.fetch_add(1, Ordering::Relaxed);
                if i == 3 {
                    panic!("bad index {i}");
                }
            },
            0..16,
        )
    }));
    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<String>().map(String::as_str), Some("bad index 3"));
    assert_eq!(ran.load(Ordering::Relaxed), 16);

    match exec.bulk_async_execute(|_| panic!("async"), 0..4).into_completion() {
        Completion::Error(panic) => assert_eq!(panic.message(), "async"),
        _ => panic!("expected the panic to be captured"),
    }
    assert_eq!(
        exec.bulk_async_execute(|_| {}, 0..4).sync_wait().unwrap(),
        Some(())
    );
}

#[test]
fn copies_share_workers_and_annotations_go_to_the_outer_executor() {
    let (_topology, exec) = hierarchical(2, 2);
    let copy = exec.clone();
    assert_eq!(exec, copy);

    let labelled = exec.with_annotation("stencil");
    assert_eq!(labelled, exec);
    assert_eq!(labelled.annotation(), Some("stencil"));
    assert_eq!(exec.annotation(), None);
    assert!(labelled
        .inner_executors()
        .iter()
        .all(|inner| inner.annotation().is_none()));

    let (_topology, other) = hierarchical(2, 2);
    assert_ne!(exec, other);
}

#[test]
fn dynamic_schedules_apply_inside_each_target() {
    let topology = topology(2, 3);
    let exec = BlockForkJoinExecutor::with_topology(
        Arc::clone(&topology),
        topology.numa_domains(),
        ForkJoinParams::default()
            .schedule(LoopSchedule::Dynamic)
            .yield_delay(Duration::ZERO),
    )
    .unwrap();
    assert!(exec
        .inner_executors()
        .iter()
        .all(|inner| inner.params().schedule == LoopSchedule::Dynamic));

    let hits: Vec<_> = (0..200).map(|_| AtomicUsize::new(0)).collect();
    for _ in 0..10 {
        exec.bulk_execute(
            |i| {
                hits[i].fetch_add(1, Ordering::Relaxed);
            },
            0..200,
        );
    }
    assert!(hits.iter().all(|hits| hits.load(Ordering::Relaxed) == 10));
}
