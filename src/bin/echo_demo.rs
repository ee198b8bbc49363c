// ABOUTME: Minimal runnable demo of two in-process Peers handshaking and calling a procedure
// ABOUTME: Connects a pair of duplex-stream Peers, calls a published "add", and prints the reply

use meshrpc::value::{procedure, Value};
use meshrpc::{Agent, Transport};
use tokio::io::{duplex, split};
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> meshrpc::Result<()> {
    let server = Agent::builder()
        .publish(
            "add",
            procedure(|args| async move {
                let (Value::Int(x), Value::Int(y)) = (&args[0], &args[1]) else {
                    return;
                };
                if let Value::Procedure(reply) = &args[2] {
                    reply.call(vec![Value::Null, Value::Int(x + y)]).await;
                }
            }),
        )
        .build();
    let client = Agent::builder().build();

    let (server_side, client_side) = duplex(64 * 1024);
    let (sr, sw) = split(server_side);
    let (cr, cw) = split(client_side);

    let (server_peer, client_peer) = tokio::join!(
        server.connect(Transport::new(sr, sw)),
        client.connect(Transport::new(cr, cw)),
    );
    let _server_peer = server_peer?;
    let client_peer = client_peer?;

    let add = client_peer
        .api()
        .get("add")
        .cloned()
        .expect("server published add");

    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Arc::new(std::sync::Mutex::new(Some(tx)));
    let reply = procedure(move |args| {
        let tx = tx.clone();
        async move {
            if let Value::Int(sum) = args[1] {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(sum);
                }
            }
        }
    });

    add.call(vec![Value::Int(2), Value::Int(3), Value::Procedure(reply)])
        .await;

    let sum = rx.await.expect("server replied");
    println!("2 + 3 = {sum}");

    Ok(())
}
