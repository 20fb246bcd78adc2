use qcollab::core::CommandKind;

use crate::fixtures::node::{LINK_TIMEOUT, TestNode, fast_config, wait_until};

#[test]
fn transfer_moves_item_and_piggybacks_status() {
    let a = TestNode::start();
    let b = TestNode::start();
    let proxy = a.link_to(&b);
    a.push_items(&["job-1", "job-2"]);

    let request = a.queue.begin_transfer(&b.address()).expect("item to transfer");
    assert!(a.manager().dispatch_command(request).is_some());

    assert!(wait_until(LINK_TIMEOUT, || b.queue.item_ids() == ["job-1"]));
    assert!(wait_until(LINK_TIMEOUT, || a.queue.in_flight() == 0));
    assert_eq!(a.queue.item_ids(), ["job-2"]);

    // The response carried B's queue length back.
    assert!(wait_until(LINK_TIMEOUT, || proxy.expected_remote_queue_length() == 1));
    assert_eq!(proxy.remote_metadata().status.queue_length, 1);
    assert_eq!(proxy.remote_metadata().server_name(), Some("test-node"));

    assert!(wait_until(LINK_TIMEOUT, || {
        let events = a.queue.events();
        let sent = events
            .deliveries_of(CommandKind::TransferRequest)
            .collect::<Vec<_>>();
        sent.len() == 1 && sent[0].success
    }));
    assert!(wait_until(LINK_TIMEOUT, || {
        b.queue
            .events()
            .deliveries_of(CommandKind::TransferResponse)
            .any(|d| d.success && d.target == a.address())
    }));
}

#[test]
fn refused_transfer_returns_item_to_head() {
    let a = TestNode::start();
    let b = TestNode::start_with(fast_config());
    // Fill B so it refuses.
    let fill = (0..64).map(|i| format!("b-{i}")).collect::<Vec<_>>();
    b.push_items(&fill.iter().map(String::as_str).collect::<Vec<_>>());

    a.link_to(&b);
    a.push_items(&["job-1", "job-2"]);
    let request = a.queue.begin_transfer(&b.address()).expect("item to transfer");
    a.manager().dispatch_command(request);

    assert!(wait_until(LINK_TIMEOUT, || {
        a.queue.in_flight() == 0 && a.queue.len() == 2
    }));
    assert_eq!(a.queue.item_ids(), ["job-1", "job-2"]);
    assert_eq!(b.queue.len(), 64);
}

#[test]
fn dispatch_before_link_is_held_until_established() {
    let a = TestNode::start();
    let b = TestNode::start();
    a.push_items(&["early"]);

    let request = a.queue.begin_transfer(&b.address()).expect("item to transfer");
    assert!(a.manager().dispatch_command(request).is_some());

    assert!(wait_until(LINK_TIMEOUT, || b.queue.item_ids() == ["early"]));
    assert!(a.proxy(&b.address()).is_some());
    assert!(wait_until(LINK_TIMEOUT, || {
        let events = a.queue.events();
        let sent = events
            .deliveries_of(CommandKind::TransferRequest)
            .collect::<Vec<_>>();
        sent.len() == 1 && sent[0].success
    }));
}
