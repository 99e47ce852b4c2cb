//! Exercises the TCP transport method's server-side accept handshake and
//! per-connection address lifecycle: a server accepts several concurrent
//! client connections, each gets a distinct `TransportAddr`, and dropping
//! one connection's address does not disturb the others — the multi-peer
//! half of the TCP transport's contract the single-exchange
//! `integration_tcp_round_trip` test doesn't cover.

use std::sync::Arc;
use std::time::Duration;

use bmi_core::mp::Mp;
use bmi_core::transport::tcp::TcpTransportMethod;

async fn wait_for_completion(mp: &Mp, op_id: u64, context_id: u64) -> bmi_core::mp::Completion {
    for _ in 0..200 {
        if let Some(completion) = mp.test(op_id, context_id, 10).await.unwrap() {
            return completion;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("operation {op_id} never completed");
}

#[tokio::test]
async fn server_accepts_multiple_clients_with_distinct_addresses() {
    let listen_addr = "127.0.0.1:28735";
    let server_tcp = Arc::new(TcpTransportMethod::new());
    server_tcp.start_server(listen_addr).await.unwrap();

    let mp_a = Mp::new_client();
    let mp_b = Mp::new_client();
    let addr_a = mp_a.addr_lookup(&format!("tcp://{listen_addr}")).await.unwrap();
    let addr_b = mp_b.addr_lookup(&format!("tcp://{listen_addr}")).await.unwrap();

    // Each client dialed the same listener but established its own
    // connection, so the two resulting MP addresses must not collide even
    // though they resolve from the same address string in two separate MP
    // instances.
    assert_ne!(
        mp_a.addr_rev_lookup(addr_a),
        None,
        "addr_lookup must register a reverse-lookupable entry"
    );
    assert_eq!(mp_b.addr_rev_lookup(addr_b).as_deref(), Some(format!("tcp://{listen_addr}").as_str()));

    // Give the server's accept loop a moment to register both incoming
    // sockets before either client posts anything against them.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let ctx_a = mp_a.open_context().unwrap();
    let ctx_b = mp_b.open_context().unwrap();
    let send_a = mp_a
        .post_send_unexpected(addr_a, 1, 0, b"from-a".to_vec(), ctx_a, 0)
        .await
        .unwrap();
    let send_b = mp_b
        .post_send_unexpected(addr_b, 2, 0, b"from-b".to_vec(), ctx_b, 0)
        .await
        .unwrap();

    let completion_a = wait_for_completion(&mp_a, send_a, ctx_a).await;
    let completion_b = wait_for_completion(&mp_b, send_b, ctx_b).await;
    assert!(completion_a.error.is_none());
    assert!(completion_b.error.is_none());

    // Tearing down one client's address must not affect the other's
    // in-flight connection (the accept handshake gave each its own
    // `TransportAddr`/socket, never a shared one).
    mp_a.dec_addr_ref(addr_a).await.unwrap();
    assert_eq!(mp_a.addr_rev_lookup(addr_a), None, "dropped address must be reaped");
    assert!(
        mp_b.addr_rev_lookup(addr_b).is_some(),
        "the other client's address must survive the first client's teardown"
    );
}
