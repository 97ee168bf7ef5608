use crate::pastry::PastryNode;
use crate::tests::{CONFIG, titles};
use pretty_assertions::assert_eq;
use ringleaf_types::errors::DhtError;
use ringleaf_types::ids::Id;
use ringleaf_types::message::{Request, Response};
use ringleaf_types::peer::{Lifecycle, NodeInfo};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use utils::protocol::OverlayProtocol;
use utils::server::ServerHandle;

async fn start_node() -> (Arc<PastryNode>, ServerHandle) {
    PastryNode::start(&CONFIG).await.expect("could not start node")
}

/// Starts `count` nodes and wires every leaf set to the full membership,
/// the dense layout the comparison harness uses.
async fn start_mesh(count: usize) -> Vec<(Arc<PastryNode>, ServerHandle)> {
    let mut cluster = Vec::with_capacity(count);
    for _ in 0..count {
        cluster.push(start_node().await);
    }
    let members: Vec<NodeInfo> = cluster.iter().map(|(node, _)| node.info().clone()).collect();
    for (node, _) in &cluster {
        node.wire_leaf_set(members.clone()).await;
    }
    cluster
}

async fn shutdown(cluster: Vec<(Arc<PastryNode>, ServerHandle)>) {
    for (_, server) in &cluster {
        server.shutdown().await;
    }
}

fn closest_of(key: &Id, members: &[NodeInfo]) -> NodeInfo {
    members
        .iter()
        .min_by_key(|member| member.id.distance(key))
        .expect("nonempty membership")
        .clone()
}

#[tokio::test]
async fn single_node_round_trip() {
    let (node, server) = start_node().await;
    node.insert_key("Toy Story", json!({"popularity": "80"}))
        .await
        .unwrap();
    let (val, hops) = node.lookup_key("Toy Story").await.unwrap();
    assert_eq!(val, Some(json!({"popularity": "80"})));
    assert_eq!(hops, 0);
    let (val, _) = node.lookup_key("Not There").await.unwrap();
    assert_eq!(val, None);
    server.shutdown().await;
}

#[tokio::test]
async fn dense_mesh_routes_from_every_member() {
    let cluster = start_mesh(10).await;
    let members: Vec<NodeInfo> = cluster.iter().map(|(node, _)| node.info().clone()).collect();
    let seeded = titles(50);
    for title in &seeded {
        cluster[0]
            .0
            .insert_key(title, json!({ "title": title }))
            .await
            .unwrap();
    }
    let mut total = 0;
    for (node, _) in &cluster {
        total += node.entry_count().await;
    }
    assert_eq!(total, 50);

    for (i, title) in seeded.iter().enumerate() {
        let (node, _) = &cluster[i % cluster.len()];
        let (val, hops) = node.lookup_key(title).await.unwrap();
        assert_eq!(val, Some(json!({ "title": title })), "{title} missing");
        assert!(hops <= 3, "{title} took {hops} hops");
    }

    // entries sit at the numerically closest member
    for (node, _) in &cluster {
        for key in node.local_keys().await {
            assert_eq!(closest_of(&key, &members).id, node.info().id);
        }
    }
    shutdown(cluster).await;
}

#[tokio::test]
async fn joins_pull_exactly_the_closer_keys() {
    let (a, a_server) = start_node().await;
    let seeded = titles(50);
    for title in &seeded {
        a.insert_key(title, json!({ "title": title })).await.unwrap();
    }
    assert_eq!(a.entry_count().await, 50);

    let (b, b_server) = start_node().await;
    b.join(a.info()).await.unwrap();
    assert_eq!(b.lifecycle().await, Lifecycle::Active);
    assert!(a.leaf_set().await.contains(b.info()));

    let two = vec![a.info().clone(), b.info().clone()];
    let mut expected: Vec<Id> = seeded
        .iter()
        .map(|title| Id::hash_of(title))
        .filter(|key| closest_of(key, &two).id == b.info().id)
        .collect();
    expected.sort();
    assert_eq!(b.local_keys().await, expected);
    assert_eq!(a.entry_count().await + b.entry_count().await, 50);

    let (c, c_server) = start_node().await;
    c.join(b.info()).await.unwrap();
    let three = vec![a.info().clone(), b.info().clone(), c.info().clone()];
    let mut expected: Vec<Id> = seeded
        .iter()
        .map(|title| Id::hash_of(title))
        .filter(|key| closest_of(key, &three).id == c.info().id)
        .collect();
    expected.sort();
    assert_eq!(c.local_keys().await, expected);
    assert_eq!(
        a.entry_count().await + b.entry_count().await + c.entry_count().await,
        50
    );

    for title in &seeded {
        for node in [&a, &b, &c] {
            let (val, _) = node.lookup_key(title).await.unwrap();
            assert_eq!(val, Some(json!({ "title": title })), "{title} missing");
        }
    }

    a_server.shutdown().await;
    b_server.shutdown().await;
    c_server.shutdown().await;
}

#[tokio::test]
async fn leave_hands_everything_to_the_nearest_neighbor() {
    let cluster = start_mesh(3).await;
    let seeded = titles(30);
    for title in &seeded {
        cluster[0]
            .0
            .insert_key(title, json!({ "title": title }))
            .await
            .unwrap();
    }

    let departing = Arc::clone(&cluster[2].0);
    let others: Vec<&Arc<PastryNode>> = cluster[..2].iter().map(|(node, _)| node).collect();
    let receiver = others
        .iter()
        .min_by_key(|node| node.info().id.distance(&departing.info().id))
        .unwrap();
    let receiver_before = receiver.entry_count().await;
    let departing_before = departing.entry_count().await;

    departing.leave().await.unwrap();
    assert_eq!(departing.lifecycle().await, Lifecycle::Dead);
    assert_eq!(departing.entry_count().await, 0);
    assert_eq!(
        receiver.entry_count().await,
        receiver_before + departing_before
    );
    let mut total = 0;
    for node in &others {
        total += node.entry_count().await;
    }
    assert_eq!(total, 30, "entries lost on leave");

    let err = departing.lookup_key("anything").await.unwrap_err();
    assert!(matches!(err, DhtError::BadState(Lifecycle::Dead)));
    shutdown(cluster).await;
}

#[tokio::test]
async fn update_overwrites_without_duplicating() {
    let cluster = start_mesh(3).await;
    cluster[0].0.insert_key("X", json!({"v": 1})).await.unwrap();
    cluster[1].0.update_key("X", json!({"v": 2})).await.unwrap();
    let (val, _) = cluster[2].0.lookup_key("X").await.unwrap();
    assert_eq!(val, Some(json!({"v": 2})));
    let mut total = 0;
    for (node, _) in &cluster {
        total += node.entry_count().await;
    }
    assert_eq!(total, 1);

    assert!(cluster[0].0.delete_key("X").await.unwrap());
    assert!(!cluster[1].0.delete_key("X").await.unwrap());
    let (val, _) = cluster[2].0.lookup_key("X").await.unwrap();
    assert_eq!(val, None);
    shutdown(cluster).await;
}

#[tokio::test]
async fn unreachable_bootstrap_aborts_the_join() {
    let (node, server) = start_node().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = NodeInfo::new("127.0.0.1", listener.local_addr().unwrap().port());
    drop(listener);

    let err = node.join(&dead).await.unwrap_err();
    assert!(matches!(err, DhtError::Transport { .. }));
    assert_eq!(node.lifecycle().await, Lifecycle::Dead);
    server.shutdown().await;
}

#[tokio::test]
async fn routing_survives_a_dead_leaf_peer() {
    let (node, server) = start_node().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = NodeInfo::new("127.0.0.1", listener.local_addr().unwrap().port());
    drop(listener);
    node.wire_leaf_set(vec![dead.clone()]).await;

    // find a title the dead peer is numerically closer to, so routing
    // must attempt the forward and fall back
    let title = (0..)
        .map(|i| format!("probe-{i}"))
        .find(|t| {
            let key = Id::hash_of(t);
            dead.id.distance(&key) < node.info().id.distance(&key)
        })
        .unwrap();
    let (val, hops) = node.lookup_key(&title).await.unwrap();
    assert_eq!(val, None);
    assert_eq!(hops, 0);
    server.shutdown().await;
}

#[tokio::test]
async fn exhausted_hop_allowance_claims_the_key() {
    let (node, server) = start_node().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closer = NodeInfo::new("127.0.0.1", listener.local_addr().unwrap().port());
    drop(listener);
    node.wire_leaf_set(vec![closer.clone()]).await;
    let key = (0..)
        .map(|i| Id::hash_of(&format!("probe-{i}")))
        .find(|key| closer.id.distance(key) < node.info().id.distance(key))
        .unwrap();

    // at the hop bound the node answers for the key instead of forwarding
    let response = node
        .handle(Request::LookupRecursive {
            key_hex: key,
            hops: crate::pastry::MAX_ROUTE_HOPS,
        })
        .await;
    let (owner, hops) = response.into_owner().unwrap();
    assert_eq!(owner, *node.info());
    assert_eq!(hops, crate::pastry::MAX_ROUTE_HOPS);
    server.shutdown().await;
}

#[tokio::test]
async fn announcements_merge_into_leaf_sets() {
    let (a, a_server) = start_node().await;
    let (b, b_server) = start_node().await;

    let response = a
        .call(
            b.info(),
            Request::UpdateLeafSet {
                leaf_set: vec![a.info().clone()],
            },
        )
        .await
        .unwrap();
    assert_eq!(response, Response::ok());
    assert_eq!(b.leaf_set().await, vec![a.info().clone()]);

    // duplicates and the receiver itself are not incorporated
    a.call(
        b.info(),
        Request::UpdateLeafSet {
            leaf_set: vec![a.info().clone(), b.info().clone()],
        },
    )
    .await
    .unwrap();
    assert_eq!(b.leaf_set().await.len(), 1);

    let leaf_set = a
        .call(b.info(), Request::GetLeafSet {})
        .await
        .unwrap()
        .into_leaf_set()
        .unwrap();
    assert_eq!(leaf_set, vec![a.info().clone()]);

    a_server.shutdown().await;
    b_server.shutdown().await;
}

#[tokio::test]
async fn route_verb_reports_the_forwarding_decision() {
    let (a, a_server) = start_node().await;
    let (b, b_server) = start_node().await;
    a.wire_leaf_set(vec![b.info().clone()]).await;

    let mut toward_peer = None;
    let mut handled_here = None;
    for i in 0.. {
        let key = Id::hash_of(&format!("probe-{i}"));
        if b.info().id.distance(&key) < a.info().id.distance(&key) {
            toward_peer.get_or_insert(key);
        } else {
            handled_here.get_or_insert(key);
        }
        if toward_peer.is_some() && handled_here.is_some() {
            break;
        }
    }

    let (node, forward) = a
        .handle(Request::Route {
            key_hex: toward_peer.unwrap(),
        })
        .await
        .into_route()
        .unwrap();
    assert!(forward);
    assert_eq!(node, *b.info());

    let (node, forward) = a
        .handle(Request::Route {
            key_hex: handled_here.unwrap(),
        })
        .await
        .into_route()
        .unwrap();
    assert!(!forward);
    assert_eq!(node, *a.info());

    a_server.shutdown().await;
    b_server.shutdown().await;
}

#[tokio::test]
async fn foreign_overlay_verbs_are_rejected() {
    let (node, server) = start_node().await;
    let response = node
        .handle(Request::FindSuccessor {
            key: Id::hash_of("x"),
            hops: 0,
        })
        .await;
    assert_eq!(response, Response::error());
    let response = node.handle(Request::GetPredecessor {}).await;
    assert_eq!(response, Response::error());
    server.shutdown().await;
}
