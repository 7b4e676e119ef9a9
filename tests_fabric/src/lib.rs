//! Shared helpers for fabric integration tests.
//!
//! Everything here runs on the in-process simulated driver, so multi-node
//! scenarios execute deterministically under `cargo test`.

use driver_api::Transport;
use fabric::{ConnectMode, Node, NodeType, Portal};
use sim_driver::{SimDriver, SimTransport};
use std::sync::Arc;

/// Creates a broker node on the simulated driver.
pub fn new_broker() -> Arc<Node> {
    Node::new(NodeType::Broker, Arc::new(SimDriver::new()))
}

/// Creates a non-broker node on the simulated driver.
pub fn new_normal() -> Arc<Node> {
    Node::new(NodeType::Normal, Arc::new(SimDriver::new()))
}

/// Connects `broker` and `normal` with `num_portals` initial portals each,
/// returning (broker-side portals, normal-side portals).
pub fn connect_pair(
    broker: &Arc<Node>,
    normal: &Arc<Node>,
    num_portals: usize,
) -> (Vec<Portal>, Vec<Portal>) {
    let (t0, t1) = SimDriver::create_sim_transport_pair();
    let broker_portals = broker
        .connect_node(t0, ConnectMode::BrokerToNonBroker, num_portals)
        .expect("broker connect");
    let normal_portals = normal
        .connect_node(t1, ConnectMode::NonBrokerToBroker, num_portals)
        .expect("non-broker connect");
    (broker_portals, normal_portals)
}

/// Like [`connect_pair`], but also returns the raw transport endpoints so a
/// test can inject transport failures.
pub fn connect_pair_with_transports(
    broker: &Arc<Node>,
    normal: &Arc<Node>,
    num_portals: usize,
) -> (
    Vec<Portal>,
    Vec<Portal>,
    Arc<SimTransport>,
    Arc<SimTransport>,
) {
    let (t0, t1) = SimDriver::create_sim_transport_pair();
    let broker_portals = broker
        .connect_node(
            t0.clone() as Arc<dyn Transport>,
            ConnectMode::BrokerToNonBroker,
            num_portals,
        )
        .expect("broker connect");
    let normal_portals = normal
        .connect_node(
            t1.clone() as Arc<dyn Transport>,
            ConnectMode::NonBrokerToBroker,
            num_portals,
        )
        .expect("non-broker connect");
    (broker_portals, normal_portals, t0, t1)
}

/// A broker with two connected non-broker nodes and one bootstrap portal
/// pair to each.
pub struct ThreeNodes {
    pub broker: Arc<Node>,
    pub first: Arc<Node>,
    pub second: Arc<Node>,
    /// Broker end and first-node end of their bootstrap pair.
    pub to_first: (Portal, Portal),
    /// Broker end and second-node end of their bootstrap pair.
    pub to_second: (Portal, Portal),
}

pub fn three_nodes() -> ThreeNodes {
    let broker = new_broker();
    let first = new_normal();
    let second = new_normal();
    let (mut bf, mut fb) = connect_pair(&broker, &first, 1);
    let (mut bs, mut sb) = connect_pair(&broker, &second, 1);
    ThreeNodes {
        broker,
        first,
        second,
        to_first: (bf.remove(0), fb.remove(0)),
        to_second: (bs.remove(0), sb.remove(0)),
    }
}
