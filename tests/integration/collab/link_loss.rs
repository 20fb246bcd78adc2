use std::sync::Arc;
use std::thread;
use std::time::Duration;

use qcollab::core::CommandKind;
use qcollab::{Command, NodeMetadata, ProxyState};

use crate::fixtures::node::{LINK_TIMEOUT, TestNode, fast_config, wait_until};

#[test]
fn lost_peer_without_reconnect_budget_is_reported_once() {
    let a = TestNode::start();
    let mut config = fast_config();
    config.link.max_reconnect_attempts = 0;
    let b = TestNode::start_with(config);

    let proxy = b.link_to(&a);
    let a_addr = a.address();
    a.shutdown();

    assert!(wait_until(LINK_TIMEOUT, || proxy.state() == ProxyState::Destroyed));
    assert!(wait_until(LINK_TIMEOUT, || b.queue.events().links_lost == [a_addr.clone()]));

    // Commands to a destroyed proxy fail right away.
    proxy.dispatch_command(Command::Status {
        target: a_addr.clone(),
        metadata: NodeMetadata::default(),
    });
    assert!(
        b.queue
            .events()
            .deliveries_of(CommandKind::Status)
            .any(|d| !d.success)
    );

    // After lingering the proxy is dropped from the directory, and the
    // loss is never reported a second time.
    assert!(wait_until(LINK_TIMEOUT, || b.proxy(&a_addr).is_none()));
    thread::sleep(Duration::from_millis(400));
    assert_eq!(b.queue.events().links_lost.len(), 1);
}

#[test]
fn peer_restart_is_survived_by_reconnect() {
    let a = TestNode::start();
    let mut config = fast_config();
    config.link.max_reconnect_attempts = 50;
    let b = TestNode::start_with(config);

    let proxy = b.link_to(&a);
    let a_addr = a.address();
    a.shutdown();
    assert!(wait_until(LINK_TIMEOUT, || proxy.state() != ProxyState::LinkEstablished));

    let mut restarted_config = fast_config();
    restarted_config.listen_addr = a_addr.to_string();
    let restarted = TestNode::start_with(restarted_config);
    assert_eq!(restarted.address(), a_addr);

    assert!(proxy.wait_for_link_established(LINK_TIMEOUT), "{proxy:?}");
    assert_eq!(proxy.reconnect_attempts(), 0);
    assert!(b.queue.events().links_lost.is_empty());
    let registered = b.proxy(&a_addr).expect("proxy kept across reconnect");
    assert!(Arc::ptr_eq(&registered, &proxy));
}
