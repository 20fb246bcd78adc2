use std::time::{Duration, Instant};

use crate::fixtures::node::{LINK_TIMEOUT, TestNode, unused_address, wait_until};

#[test]
fn startup_sync_exchanges_queue_contents() {
    let a = TestNode::start();
    a.push_items(&["job-1", "job-2"]);
    let b = TestNode::start();
    b.push_items(&["local-1"]);

    let report = b
        .manager()
        .synchronize_with_peers(&[a.address()], LINK_TIMEOUT);
    assert_eq!(report.linked, [a.address()]);
    assert!(report.failed.is_empty());

    let events = b.queue.events();
    assert_eq!(
        events.peer_items.get(&a.address()).map(Vec::as_slice),
        Some(&["job-1".to_string(), "job-2".to_string()][..])
    );
    assert!(wait_until(LINK_TIMEOUT, || {
        a.queue.events().peer_items.get(&b.address())
            == Some(&vec!["local-1".to_string()])
    }));
    assert!(a.queue.events().synchronized_with.contains(&b.address()));
}

#[test]
fn unreachable_peer_fails_without_blocking_others() {
    let a = TestNode::start();
    let b = TestNode::start();
    let missing = unused_address();

    let started = Instant::now();
    let report = b
        .manager()
        .synchronize_with_peers(&[missing.clone(), a.address()], Duration::from_secs(2));

    assert_eq!(report.linked, [a.address()]);
    assert_eq!(report.failed, [missing]);
    // One shared deadline, not one per peer.
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn startup_sync_with_no_peers_is_immediate() {
    let a = TestNode::start();
    let report = a.manager().synchronize_with_peers(&[], LINK_TIMEOUT);
    assert!(report.linked.is_empty());
    assert!(report.failed.is_empty());
}
