//! Integration coverage for the codec + protocol pair: a full register →
//! registered → request → connect → data → end exchange over an in-memory
//! duplex pipe, the way a real control connection would sequence frames.

use base64::Engine;
use bifrost_shared::{ClientMessage, Delimited, RequestId, ServerMessage};
use tokio::io::duplex;

#[tokio::test]
async fn full_handshake_and_data_exchange() {
    let (server_io, agent_io) = duplex(8192);
    let mut server = Delimited::new(server_io);
    let mut agent = Delimited::new(agent_io);

    agent
        .send(ClientMessage::Register {
            api_key: "sk_live_demo".into(),
        })
        .await
        .unwrap();
    let msg: ClientMessage = server.recv().await.unwrap().unwrap();
    assert_eq!(
        msg,
        ClientMessage::Register {
            api_key: "sk_live_demo".into()
        }
    );

    server
        .send(ServerMessage::Registered {
            backend_id: "b1".into(),
        })
        .await
        .unwrap();
    let msg: ServerMessage = agent.recv().await.unwrap().unwrap();
    assert_eq!(
        msg,
        ServerMessage::Registered {
            backend_id: "b1".into()
        }
    );

    let request_id = RequestId::generate();
    server
        .send(ServerMessage::Request {
            request_id,
            tunnel_id: "t1".into(),
            local_port: 8080,
            target_ip: "127.0.0.1".into(),
        })
        .await
        .unwrap();
    match agent.recv::<ServerMessage>().await.unwrap().unwrap() {
        ServerMessage::Request {
            request_id: got, ..
        } => assert_eq!(got, request_id),
        other => panic!("unexpected message: {other:?}"),
    }

    agent
        .send(ClientMessage::Connect { request_id })
        .await
        .unwrap();
    let msg: ClientMessage = server.recv().await.unwrap().unwrap();
    assert_eq!(msg, ClientMessage::Connect { request_id });

    let payload = b"GET / HTTP/1.1\r\n\r\n";
    let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
    server
        .send(ServerMessage::Data {
            request_id,
            data: encoded.clone(),
        })
        .await
        .unwrap();
    match agent.recv::<ServerMessage>().await.unwrap().unwrap() {
        ServerMessage::Data { data, .. } => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(data)
                .unwrap();
            assert_eq!(decoded, payload);
        }
        other => panic!("unexpected message: {other:?}"),
    }

    server.send(ServerMessage::End { request_id }).await.unwrap();
    let msg: ServerMessage = agent.recv().await.unwrap().unwrap();
    assert_eq!(msg, ServerMessage::End { request_id });
}

#[tokio::test]
async fn unauthorized_is_delivered_and_is_terminal() {
    let (server_io, agent_io) = duplex(1024);
    let mut server = Delimited::new(server_io);
    let mut agent = Delimited::new(agent_io);

    server.send(ServerMessage::Unauthorized).await.unwrap();
    drop(server);

    let msg: ServerMessage = agent.recv().await.unwrap().unwrap();
    assert_eq!(msg, ServerMessage::Unauthorized);
    let eof: Option<ServerMessage> = agent.recv().await.unwrap();
    assert!(eof.is_none(), "connection should be closed after unauthorized");
}
