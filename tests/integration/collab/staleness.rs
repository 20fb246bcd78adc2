use std::thread;
use std::time::Duration;

use qcollab::ProxyState;

use crate::fixtures::node::{LINK_TIMEOUT, TestNode, unused_address, wait_until};
use crate::fixtures::peer::SilentPeer;

#[test]
fn silent_peer_goes_stale_and_is_reported_lost_once() {
    let node = TestNode::start();
    // Reconnects go to the advertised address, where nothing listens.
    let peer = SilentPeer::link(&node.address(), unused_address());

    let proxy = node.proxy(&peer.address).expect("inbound proxy registered");
    assert!(proxy.wait_for_link_established(LINK_TIMEOUT), "{proxy:?}");

    assert!(
        wait_until(LINK_TIMEOUT * 2, || proxy.state() == ProxyState::Destroyed),
        "{proxy:?}"
    );
    assert!(wait_until(LINK_TIMEOUT, || {
        node.queue.events().links_lost == [peer.address.clone()]
    }));
    thread::sleep(Duration::from_millis(400));
    assert_eq!(node.queue.events().links_lost, [peer.address.clone()]);
}
