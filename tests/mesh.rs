// ABOUTME: End-to-end scenarios connecting two in-process Peers over a duplex stream
// ABOUTME: Covers handshake, round-trip call, cyclic arguments, and disconnect flush

use meshrpc::peer::PeerEvent;
use meshrpc::value::{procedure, Value};
use meshrpc::{Agent, Transport};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, split};

fn connected_pair() -> (
    Transport<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    Transport<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
) {
    let (a, b) = duplex(16 * 1024);
    let (ar, aw) = split(a);
    let (br, bw) = split(b);
    (Transport::new(ar, aw), Transport::new(br, bw))
}

#[tokio::test]
async fn handshake_exposes_published_procedures_as_proxies() {
    let agent_a = Agent::builder()
        .publish(
            "add",
            procedure(|args| async move {
                let (Value::Int(x), Value::Int(y)) = (&args[0], &args[1]) else {
                    return;
                };
                if let Value::Procedure(cb) = &args[2] {
                    cb.call(vec![Value::Null, Value::Int(x + y)]).await;
                }
            }),
        )
        .build();
    let agent_b = Agent::builder().build();

    let (transport_a, transport_b) = connected_pair();
    let peer_a = agent_a.connect(transport_a);
    let peer_b = agent_b.connect(transport_b);
    let (peer_a, peer_b) = tokio::join!(peer_a, peer_b);
    let peer_a = peer_a.unwrap();
    let peer_b = peer_b.unwrap();

    assert!(peer_b.api().contains_key("add"));
    assert!(peer_a.api().is_empty());
}

#[tokio::test]
async fn round_trip_call_delivers_result_to_callback() {
    let agent_a = Agent::builder()
        .publish(
            "add",
            procedure(|args| async move {
                let (Value::Int(x), Value::Int(y)) = (&args[0], &args[1]) else {
                    return;
                };
                if let Value::Procedure(cb) = &args[2] {
                    cb.call(vec![Value::Null, Value::Int(x + y)]).await;
                }
            }),
        )
        .build();
    let agent_b = Agent::builder().build();

    let (transport_a, transport_b) = connected_pair();
    let peer_a = agent_a.connect(transport_a);
    let peer_b = agent_b.connect(transport_b);
    let (peer_a, peer_b) = tokio::join!(peer_a, peer_b);
    let _peer_a = peer_a.unwrap();
    let peer_b = peer_b.unwrap();

    let add = peer_b.api().get("add").cloned().expect("add proxy installed");

    let result = Arc::new(AtomicI64::new(0));
    let got_result = Arc::new(AtomicBool::new(false));
    let result_clone = result.clone();
    let got_clone = got_result.clone();
    let reply = procedure(move |args| {
        let result = result_clone.clone();
        let got = got_clone.clone();
        async move {
            assert!(matches!(args[0], Value::Null));
            if let Value::Int(sum) = args[1] {
                result.store(sum, Ordering::SeqCst);
            }
            got.store(true, Ordering::SeqCst);
        }
    });

    add.call(vec![Value::Int(2), Value::Int(3), Value::Procedure(reply)])
        .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(got_result.load(Ordering::SeqCst));
    assert_eq!(result.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn cyclic_argument_round_trips_through_echo() {
    let agent_a = Agent::builder()
        .publish(
            "echo",
            procedure(|args| async move {
                if args.len() < 2 {
                    return;
                }
                let value = args[0].clone();
                if let Value::Procedure(cb) = &args[1] {
                    cb.call(vec![Value::Null, value]).await;
                }
            }),
        )
        .build();
    let agent_b = Agent::builder().build();

    let (transport_a, transport_b) = connected_pair();
    let peer_a = agent_a.connect(transport_a);
    let peer_b = agent_b.connect(transport_b);
    let (peer_a, peer_b) = tokio::join!(peer_a, peer_b);
    let _peer_a = peer_a.unwrap();
    let peer_b = peer_b.unwrap();

    let echo = peer_b.api().get("echo").cloned().expect("echo proxy installed");

    let cyclic = Value::map(indexmap::IndexMap::new());
    if let Value::Map(m) = &cyclic {
        m.write().unwrap().insert("self".to_string(), cyclic.clone());
    }

    let got_cycle = Arc::new(AtomicBool::new(false));
    let got_cycle_clone = got_cycle.clone();
    let reply = procedure(move |args| {
        let got_cycle = got_cycle_clone.clone();
        async move {
            let Value::Map(outer) = &args[1] else {
                panic!("expected a map");
            };
            let inner = outer.read().unwrap().get("self").cloned().unwrap();
            let Value::Map(inner_map) = inner else {
                panic!("expected a map");
            };
            got_cycle.store(Arc::ptr_eq(outer, &inner_map), Ordering::SeqCst);
        }
    });

    echo.call(vec![cyclic, Value::Procedure(reply)]).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(got_cycle.load(Ordering::SeqCst));
}

#[tokio::test]
async fn disconnect_flushes_outstanding_callbacks_with_edisconnect() {
    // "accept" deliberately never invokes its callback, so the callback
    // stays outstanding in A's table until A is disconnected.
    let agent_a = Agent::builder().build();
    let agent_b = Agent::builder()
        .publish("accept", procedure(|_args| async move {}))
        .build();

    let (transport_a, transport_b) = connected_pair();
    let peer_a = agent_a.connect(transport_a);
    let peer_b = agent_b.connect(transport_b);
    let (peer_a, peer_b) = tokio::join!(peer_a, peer_b);
    let peer_a = peer_a.unwrap();
    let _peer_b = peer_b.unwrap();

    let accept = peer_a.api().get("accept").cloned().expect("accept proxy installed");

    let flush_count = Arc::new(AtomicI64::new(0));
    let mut outstanding = Vec::new();
    for _ in 0..3 {
        let flush_count = flush_count.clone();
        outstanding.push(procedure(move |args| {
            let flush_count = flush_count.clone();
            async move {
                if matches!(args.first(), Some(Value::Str(_))) {
                    flush_count.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }

    for cb in outstanding {
        accept.call(vec![Value::Procedure(cb)]).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut events_a = peer_a.events();
    peer_a.disconnect(None).await;

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if matches!(events_a.recv().await, Ok(PeerEvent::Disconnect(_))) {
                break;
            }
        }
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(flush_count.load(Ordering::SeqCst), 3);
    assert_eq!(peer_a.state(), meshrpc::PeerState::Disconnected);
}
