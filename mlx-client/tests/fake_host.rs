//! Exercises `ClientConnection` against a hand-written fake host: a raw
//! `UnixListener` that speaks the wire protocol directly (no dispatcher),
//! covering connect/handshake/demux behavior without depending on `mlx-host`.

use mlx_client::{ClientConfig, ClientConnection, StreamEvent};
use mlx_protocol::{decode_envelope, encode_envelope, Envelope};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

async fn read_one(stream: &mut UnixStream) -> Envelope {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    decode_envelope(&buf[..n]).unwrap()
}

async fn write_one(stream: &mut UnixStream, env: &Envelope) {
    stream.write_all(&encode_envelope(env).unwrap()).await.unwrap();
}

#[tokio::test]
async fn connect_performs_handshake_before_declaring_ready() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("fake.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let host_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let handshake = read_one(&mut stream).await;
        assert_eq!(handshake.kind, "handshake");
        let token = handshake.payload.unwrap()["authToken"].as_str().unwrap().to_string();
        assert_eq!(token, "s3cr3t");

        let reply = Envelope::with_id(
            handshake.id.unwrap(),
            "handshake.ok",
            Some(serde_json::json!({"serverVersion": "0.1.0", "capabilities": {"chatCompletions": true, "stream": true, "download": true}})),
        );
        write_one(&mut stream, &reply).await;
        stream
    });

    let config = ClientConfig { socket_path: Some(socket_path), auth_token: Some("s3cr3t".to_string()), ..Default::default() };
    let conn = ClientConnection::connect(config).await.unwrap();
    assert!(!conn.is_closed());

    host_task.await.unwrap();
}

#[tokio::test]
async fn connect_surfaces_handshake_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("fake.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let handshake = read_one(&mut stream).await;
        let reply = Envelope::error(handshake.id, "unauthorized", "Invalid auth token");
        write_one(&mut stream, &reply).await;
    });

    let config = ClientConfig { socket_path: Some(socket_path), auth_token: Some("wrong".to_string()), ..Default::default() };
    let err = ClientConnection::connect(config).await.unwrap_err();
    assert!(matches!(err, mlx_client::Error::Handshake { code, .. } if code == "unauthorized"));
}

#[tokio::test]
async fn stream_demux_and_transport_close() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("fake.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let host_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let req = read_one(&mut stream).await;
        assert_eq!(req.kind, "inference.stream");
        let id = req.id.unwrap();

        write_one(&mut stream, &Envelope::with_id(id.clone(), "inference.stream.start", Some(serde_json::json!({"requestId": id})))).await;
        write_one(&mut stream, &Envelope::with_id(id.clone(), "inference.stream.token", Some(serde_json::json!({"requestId": id, "text": "Hel"})))).await;
        write_one(&mut stream, &Envelope::with_id(id.clone(), "inference.stream.token", Some(serde_json::json!({"requestId": id, "text": "lo"})))).await;
        write_one(
            &mut stream,
            &Envelope::with_id(
                id.clone(),
                "inference.stream.end",
                Some(serde_json::json!({"requestId": id, "final": {"requestId": id, "text": "Hello", "usage": {"completionTokens": 2}}})),
            ),
        )
        .await;
        drop(stream);
    });

    let config = ClientConfig { socket_path: Some(socket_path), ..Default::default() };
    let conn = ClientConnection::connect(config).await.unwrap();

    let req = serde_json::json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
    let mut handle = conn.stream(req, None).await.unwrap();

    let mut text = String::new();
    loop {
        match handle.next().await.expect("stream closed before terminal event") {
            StreamEvent::Start { .. } => {}
            StreamEvent::Token { text: chunk, .. } => text.push_str(&chunk),
            StreamEvent::End { final_response, .. } => {
                assert_eq!(final_response.text, "Hello");
                break;
            }
            StreamEvent::Error { .. } => panic!("unexpected stream error"),
        }
    }
    assert_eq!(text, "Hello");

    host_task.await.unwrap();
}
