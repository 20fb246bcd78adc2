use std::sync::{Arc, Barrier};
use std::thread;

use crate::fixtures::node::{LINK_TIMEOUT, TestNode};

#[test]
fn concurrent_lookups_share_one_proxy() {
    let a = TestNode::start();
    let b = Arc::new(TestNode::start());
    let target = a.address();
    let barrier = Arc::new(Barrier::new(8));

    let workers = (0..8)
        .map(|_| {
            let b = Arc::clone(&b);
            let target = target.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                b.manager()
                    .get_or_create_remote_node(&target, true)
                    .expect("proxy created")
            })
        })
        .collect::<Vec<_>>();
    let proxies = workers
        .into_iter()
        .map(|worker| worker.join().unwrap())
        .collect::<Vec<_>>();

    let first = &proxies[0];
    assert!(proxies.iter().all(|proxy| Arc::ptr_eq(proxy, first)));
    assert!(first.wait_for_link_established(LINK_TIMEOUT), "{first:?}");
    assert_eq!(b.manager().list_remote_nodes().len(), 1);
    assert_eq!(a.manager().list_remote_nodes().len(), 1);
}
