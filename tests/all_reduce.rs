use std::{
    sync::{Arc, Barrier},
    thread,
};

use tutti::{prelude::*, Error};

const VALUES: [u64; 4] = [3, 10, 200, 4000];

/// Deposits the values of four sites in `order` from one thread, then
/// collects every result.
fn sum_in_order(order: [usize; 4], generation: u64) -> Vec<u64> {
    let fabric = Fabric::new(4).unwrap();
    let sites = fabric.sites();
    let mut handles: Vec<Option<AllReduce<u64>>> = (0..4).map(|_| None).collect();
    for site in order {
        let handle = sites[site]
            .all_reduce(
                "sum",
                VALUES[site],
                |a, b| a + b,
                CollectiveArgs::default().generation(generation),
            )
            .unwrap();
        handles[site] = Some(handle);
    }
    handles
        .into_iter()
        .map(|handle| handle.unwrap().get().unwrap())
        .collect()
}

#[test]
fn every_site_sees_the_sum_for_any_arrival_order() {
    let expected: u64 = VALUES.iter().sum();
    for order in [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]] {
        assert_eq!(sum_in_order(order, 1), vec![expected; 4], "order {order:?}");
    }
}

#[test]
fn concurrent_sites_agree() {
    let fabric = Fabric::new(4).unwrap();
    let barrier = Arc::new(Barrier::new(4));
    let workers: Vec<_> = fabric
        .sites()
        .into_iter()
        .map(|site| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let communicator = site
                    .create_communicator("rounds", CollectiveArgs::default())
                    .unwrap();
                let mut results = Vec::new();
                for round in 0..20u64 {
                    barrier.wait();
                    let value = VALUES[site.locality_id()] * (round + 1);
                    let handle = communicator
                        .all_reduce(value, |a, b| a + b, CollectiveArgs::default())
                        .unwrap();
                    assert_eq!(handle.generation(), round + 1);
                    results.push(handle.get().unwrap());
                }
                results
            })
        })
        .collect();

    let expected: Vec<u64> = (1..=20).map(|round| VALUES.iter().sum::<u64>() * round).collect();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), expected);
    }
}

#[test]
fn generation_zero_fails_for_every_site() {
    let fabric = Fabric::new(4).unwrap();
    for site in fabric.sites() {
        let err = site
            .all_reduce("zero", 1u64, |a, b| a + b, CollectiveArgs::default().generation(0))
            .unwrap_err();
        assert!(err.is_bad_parameter());
    }

    let communicator = fabric
        .site(0)
        .unwrap()
        .create_communicator("zero", CollectiveArgs::default())
        .unwrap();
    assert!(communicator
        .deposit_and_maybe_finalize(0, 0, 1u64, |a, b| a + b)
        .unwrap_err()
        .is_bad_parameter());
    assert_eq!(communicator.active_generations(), 0);
}

#[test]
fn generations_of_one_basename_are_independent() {
    let fabric = Fabric::new(2).unwrap();
    let sites = fabric.sites();
    let args = CollectiveArgs::default();

    let first_a = sites[0].all_reduce("gen", 1, |a, b| a * b, args.generation(1)).unwrap();
    let second_a = sites[0].all_reduce("gen", 5, |a, b| a * b, args.generation(2)).unwrap();
    let second_b = sites[1].all_reduce("gen", 7, |a, b| a * b, args.generation(2)).unwrap();
    assert_eq!(second_a.get().unwrap(), 35);
    assert_eq!(second_b.get().unwrap(), 35);
    assert!(first_a.try_get().is_none());

    let first_b = sites[1].all_reduce("gen", 3, |a, b| a * b, args.generation(1)).unwrap();
    assert_eq!(first_a.get().unwrap(), 3);
    assert_eq!(first_b.get().unwrap(), 3);
}

#[test]
fn results_can_be_awaited() {
    let fabric = Fabric::new(2).unwrap();
    let sites = fabric.sites();
    let late = {
        let site = sites[1].clone();
        thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            site.all_reduce("await", 2, |a, b| a + b, CollectiveArgs::default())
                .unwrap()
        })
    };
    let early = sites[0]
        .all_reduce("await", 1, |a, b| a + b, CollectiveArgs::default())
        .unwrap();
    assert_eq!(block_on(early).unwrap(), 3);
    assert_eq!(late.join().unwrap().get().unwrap(), 3);
}

#[test]
fn results_can_be_chained_as_senders() {
    let fabric = Fabric::new(3).unwrap();
    let handles: Vec<_> = fabric
        .sites()
        .iter()
        .map(|site| {
            site.all_reduce(
                "chain",
                site.locality_id() as i64,
                i64::max,
                CollectiveArgs::default(),
            )
            .unwrap()
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.then(|max| max * 10).sync_wait().unwrap(), Some(20));
    }
}

#[test]
fn mismatched_types_are_reported() {
    let fabric = Fabric::new(2).unwrap();
    let sites = fabric.sites();
    let args = CollectiveArgs::default().generation(4);
    let _first = sites[0].all_reduce("types", 1u32, |a, b| a + b, args).unwrap();
    let err = sites[1]
        .all_reduce("types", "one".to_owned(), |a, b| a + &b, args)
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { generation: 4, .. }));
}

#[test]
fn a_rejected_deposit_keeps_sites_in_step() {
    let fabric = Fabric::new(2).unwrap();
    let args = CollectiveArgs::default();
    let comms: Vec<Communicator> = fabric
        .sites()
        .iter()
        .map(|site| site.create_communicator("retry", args).unwrap())
        .collect();

    let peer = comms[1].all_reduce(1u32, |a, b| a + b, args).unwrap();
    assert_eq!(peer.generation(), 1);
    let err = comms[0].all_reduce(2u64, |a, b| a + b, args).unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { generation: 1, .. }));

    let retry = comms[0].all_reduce(2u32, |a, b| a + b, args).unwrap();
    assert_eq!(retry.generation(), 1);
    assert_eq!(retry.get().unwrap(), 3);
    assert_eq!(peer.get().unwrap(), 3);
}

#[test]
fn one_communicator_serves_explicit_generations_and_sites() {
    let fabric = Fabric::new(2).unwrap();
    let shared = fabric
        .site(0)
        .unwrap()
        .create_communicator("explicit", CollectiveArgs::default())
        .unwrap();
    let args = CollectiveArgs::default();

    let late = shared.all_reduce(10, |a, b| a - b, args.generation(7)).unwrap();
    let early = shared
        .all_reduce(1, |a, b| a - b, args.generation(3).this_site(1))
        .unwrap();
    let early_root = shared.all_reduce(5, |a, b| a - b, args.generation(3)).unwrap();
    let late_peer = shared
        .all_reduce(4, |a, b| a - b, args.generation(7).this_site(1))
        .unwrap();

    assert_eq!((early.site(), early.generation()), (1, 3));
    assert_eq!(early_root.get().unwrap(), 4);
    assert_eq!(early.get().unwrap(), 4);
    assert_eq!(late.get().unwrap(), 6);
    assert_eq!(late_peer.get().unwrap(), 6);

    assert!(shared
        .all_reduce(1, |a, b| a - b, args.generation(0))
        .unwrap_err()
        .is_bad_parameter());
    assert!(matches!(
        shared.all_reduce(1, |a, b| a - b, args.this_site(2)),
        Err(Error::SiteOutOfRange { site: 2, num_sites: 2 })
    ));
    assert!(shared
        .all_reduce(1, |a, b| a - b, args.root_site(1))
        .unwrap_err()
        .is_bad_parameter());
}
