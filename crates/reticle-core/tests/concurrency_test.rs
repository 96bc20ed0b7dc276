//! One compiled network shared by sessions on many threads

use rayon::prelude::*;
use reticle_core::test_utils::*;
use reticle_core::{NetworkBuilder, ReteNetwork, Session};
use std::sync::Arc;

fn assert_send_sync<T: Send + Sync>() {}
fn assert_send<T: Send>() {}

#[test]
fn test_network_and_session_thread_bounds() {
    assert_send_sync::<ReteNetwork>();
    assert_send::<Session>();
}

#[test]
fn test_parallel_sessions_are_isolated() {
    let network = Arc::new(NetworkBuilder::compile(&[overdraft_rule()]).unwrap());

    let results: Vec<(u64, usize)> = (0..16u64)
        .into_par_iter()
        .map(|worker| {
            let mut session = Session::new(Arc::clone(&network)).unwrap();
            let accounts = (worker + 1) as i64;
            for id in 0..accounts {
                session.insert(account_type(), account(id, -1)).unwrap();
            }
            // Hold every other account
            for id in (0..accounts).step_by(2) {
                session.insert(hold_type(), hold(id, id)).unwrap();
            }
            (worker, session.agenda().len())
        })
        .collect();

    for (worker, matched) in results {
        let accounts = worker as usize + 1;
        assert_eq!(matched, accounts / 2, "worker {worker}");
    }
}

#[test]
fn test_sessions_get_distinct_ids() {
    let network = Arc::new(NetworkBuilder::compile(&[overdraft_rule()]).unwrap());
    let mut ids: Vec<_> = (0..8)
        .into_par_iter()
        .map(|_| Session::new(Arc::clone(&network)).unwrap().id())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
}
