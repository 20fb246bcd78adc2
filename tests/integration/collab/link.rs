use std::time::Duration;

use qcollab::ProxyState;
use qcollab::core::{CommandKind, META_SERVER_NAME};

use crate::fixtures::node::{LINK_TIMEOUT, TestNode, fast_config, wait_until};

#[test]
fn two_nodes_link_and_exchange_metadata() {
    let a = TestNode::start();
    let mut config = fast_config();
    config.server_name = "node-b".to_string();
    let b = TestNode::start_with(config);

    let proxy = b.link_to(&a);
    assert_eq!(proxy.state(), ProxyState::LinkEstablished);
    assert_eq!(proxy.address(), Some(a.address()));
    assert_eq!(
        proxy.remote_metadata().extra.get(META_SERVER_NAME).map(String::as_str),
        Some("test-node")
    );

    let inbound = a.proxy(&b.address()).expect("acceptor registered dialer");
    assert!(inbound.wait_for_link_established(LINK_TIMEOUT));
    assert_eq!(
        inbound.remote_metadata().server_name(),
        Some("node-b")
    );
    assert_eq!(
        inbound.remote_metadata().heartbeat_interval(),
        Some(Duration::from_millis(200))
    );
}

#[test]
fn heartbeats_flow_and_are_reported() {
    let a = TestNode::start();
    let b = TestNode::start();
    let proxy = b.link_to(&a);

    assert!(wait_until(LINK_TIMEOUT, || proxy.last_status_message().is_some()
        && b.queue.events().deliveries_of(CommandKind::Status).any(|d| d.success)));
    assert!(wait_until(LINK_TIMEOUT, || {
        a.queue
            .events()
            .deliveries_of(CommandKind::Status)
            .any(|d| d.success && d.target == b.address())
    }));
    assert!(!proxy.is_stale());
}

#[test]
fn unregister_destroys_and_is_idempotent() {
    let a = TestNode::start();
    let b = TestNode::start();
    let proxy = b.link_to(&a);

    assert!(b.manager().unregister(&a.address()));
    assert!(!b.manager().unregister(&a.address()));
    assert_eq!(proxy.state(), ProxyState::Destroyed);
    assert!(b.proxy(&a.address()).is_none());
}

#[test]
fn intervals_can_be_tuned_live() {
    let a = TestNode::start();
    let manager = a.manager();

    manager
        .set_status_interval(Duration::from_millis(300))
        .expect("valid interval");
    assert_eq!(manager.status_interval(), Duration::from_millis(300));
    assert!(manager.set_check_interval(Duration::from_millis(100)).is_err());
    assert_eq!(manager.check_interval(), Duration::from_millis(150));
}

#[test]
fn self_address_is_never_proxied() {
    let a = TestNode::start();
    assert!(
        a.manager()
            .get_or_create_remote_node(&a.address(), true)
            .is_none()
    );
    assert!(a.manager().list_remote_nodes().is_empty());
}
