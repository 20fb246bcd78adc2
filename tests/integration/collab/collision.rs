use std::sync::{Arc, Barrier};
use std::thread;

use qcollab::ProxyState;

use crate::fixtures::node::{LINK_TIMEOUT, TestNode, wait_until};

#[test]
fn simultaneous_dial_keeps_one_connection() {
    let a = Arc::new(TestNode::start());
    let b = Arc::new(TestNode::start());
    let barrier = Arc::new(Barrier::new(2));

    let dial = |from: Arc<TestNode>, to: Arc<TestNode>, barrier: Arc<Barrier>| {
        thread::spawn(move || {
            barrier.wait();
            from.manager()
                .get_or_create_remote_node(&to.address(), true)
                .is_some()
        })
    };
    let from_a = dial(a.clone(), b.clone(), barrier.clone());
    let from_b = dial(b.clone(), a.clone(), barrier);
    assert!(from_a.join().unwrap());
    assert!(from_b.join().unwrap());

    let at_a = a.proxy(&b.address()).expect("a keeps a proxy for b");
    let at_b = b.proxy(&a.address()).expect("b keeps a proxy for a");
    assert!(at_a.wait_for_link_established(LINK_TIMEOUT), "{at_a:?}");
    assert!(at_b.wait_for_link_established(LINK_TIMEOUT), "{at_b:?}");

    // Both sides settled on the same connection.
    assert!(at_a.magic().is_some());
    assert_eq!(at_a.magic(), at_b.magic());

    assert_eq!(a.manager().list_remote_nodes().len(), 1);
    assert_eq!(b.manager().list_remote_nodes().len(), 1);

    // The losing connection's teardown must not disturb the link.
    assert!(!wait_until(std::time::Duration::from_millis(600), || {
        at_a.state() != ProxyState::LinkEstablished || at_b.state() != ProxyState::LinkEstablished
    }));
}
