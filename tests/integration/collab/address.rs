use std::sync::{Arc, Barrier};
use std::thread;

use qcollab::{NodeAddress, ProxyState};

use crate::fixtures::node::{LINK_TIMEOUT, TestNode, wait_until};

fn localhost(node: &TestNode) -> NodeAddress {
    NodeAddress::new("localhost", node.address().port())
}

#[test]
fn host_name_and_ip_share_one_proxy() {
    let a = TestNode::start();
    let b = TestNode::start();

    let proxy = a
        .manager()
        .get_or_create_remote_node(&localhost(&b), true)
        .expect("proxy created");
    assert!(proxy.wait_for_link_established(LINK_TIMEOUT), "{proxy:?}");
    assert_eq!(proxy.address(), Some(b.address()));

    let by_ip = a.proxy(&b.address()).expect("lookup by ip");
    let by_name = a.proxy(&localhost(&b)).expect("lookup by host name");
    assert!(Arc::ptr_eq(&by_ip, &proxy));
    assert!(Arc::ptr_eq(&by_name, &proxy));
    assert_eq!(a.manager().list_remote_nodes().len(), 1);

    let back = b.proxy(&a.address()).expect("inbound proxy on b");
    assert!(back.wait_for_link_established(LINK_TIMEOUT), "{back:?}");
    assert_eq!(b.manager().list_remote_nodes().len(), 1);
}

#[test]
fn simultaneous_dial_by_host_name_converges() {
    let a = TestNode::start();
    let b = TestNode::start();
    let start = Barrier::new(2);

    thread::scope(|scope| {
        scope.spawn(|| {
            start.wait();
            a.manager().get_or_create_remote_node(&localhost(&b), true);
        });
        scope.spawn(|| {
            start.wait();
            b.manager().get_or_create_remote_node(&localhost(&a), true);
        });
    });

    for (node, peer) in [(&a, &b), (&b, &a)] {
        let proxy = node.proxy(&peer.address()).expect("proxy registered");
        assert!(proxy.wait_for_link_established(LINK_TIMEOUT), "{proxy:?}");
        assert!(wait_until(LINK_TIMEOUT, || node.manager().list_remote_nodes().len() == 1));
        assert_eq!(proxy.state(), ProxyState::LinkEstablished);
    }
    assert!(a.queue.events().links_lost.is_empty());
    assert!(b.queue.events().links_lost.is_empty());
}
