use crate::{LineCodec, Reply, Request, Server};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_http_pipeline::connection::Connection;
use tokio_http_pipeline::pipeline::{Exit, Pipeline};
use tokio_http_pipeline::upgrade::Upgraded;
use tokio_http_pipeline::ws::{Message, RawWebSocket};
use tokio_http_pipeline::{Error, Overflow, RequestTask, TaskQueue, TaskState};

fn keep_stream(mut reply: Reply, io: Upgraded<DuplexStream>) -> Reply {
    reply.upgraded = Some(io);
    reply
}

#[tokio::test]
async fn upgrade_hands_over_the_connection() {
    let (client, server) = tokio::io::duplex(4096);
    let mut server = Server::new(server);
    let queue = TaskQueue::new(4, Overflow::Wait);
    let (task, upgrade) = RequestTask::new(Request::upgrade("/chat"));
    queue.try_enqueue(task).unwrap();
    let (task, behind) = RequestTask::new(Request::get("/after"));
    queue.try_enqueue(task).unwrap();

    let pipeline = Pipeline::builder(Connection::new(client), queue.clone(), LineCodec)
        .upgrade(keep_stream)
        .build();
    let pipeline = tokio::spawn(pipeline);

    assert_eq!(server.request().await.unwrap(), "UPGRADE /chat");
    // bytes of the new protocol may arrive in the same segment as the response
    server.write(b"101 switching\nhello").await.unwrap();

    assert_eq!(pipeline.await.unwrap().unwrap(), Exit::Upgraded);
    let reply = upgrade.await.unwrap();
    assert_eq!(reply.status, 101);
    let mut io = reply.upgraded.unwrap();

    let mut buf = [0u8; 5];
    io.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    io.write_all(b"ping").await.unwrap();
    let mut server = server.into_inner();
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // nothing may follow an upgrade request on the wire
    assert_eq!(behind.state(), TaskState::Queued);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn upgrade_without_handler_fails() {
    let (client, server) = tokio::io::duplex(4096);
    let mut server = Server::new(server);
    let queue = TaskQueue::new(4, Overflow::Wait);
    let (task, upgrade) = RequestTask::new(Request::upgrade("/chat"));
    queue.try_enqueue(task).unwrap();
    let pipeline = tokio::spawn(Pipeline::new(
        Connection::new(client),
        queue.clone(),
        LineCodec,
    ));

    server.request().await.unwrap();
    server.respond(101, "switching").await.unwrap();

    assert!(matches!(upgrade.await, Err(Error::UpgradeUnsupported)));
    assert!(matches!(pipeline.await.unwrap(), Err(Error::UpgradeUnsupported)));
    assert_eq!(server.request().await, None);
}

#[tokio::test]
async fn websocket_over_upgraded_connection() {
    let (client, server) = tokio::io::duplex(4096);
    let mut server = Server::new(server);
    let queue = TaskQueue::new(4, Overflow::Wait);
    let (task, upgrade) = RequestTask::new(Request::upgrade("/ws"));
    queue.try_enqueue(task).unwrap();
    let pipeline = Pipeline::builder(Connection::new(client), queue.clone(), LineCodec)
        .upgrade(keep_stream)
        .build();
    tokio::spawn(pipeline);

    server.request().await.unwrap();
    server.respond(101, "websocket").await.unwrap();
    let reply = upgrade.await.unwrap();

    let mut client = RawWebSocket::client(reply.upgraded.unwrap());
    let mut server = RawWebSocket::new(server.into_inner(), false);

    client.send(Message::Text("hi".into())).await.unwrap();
    assert_eq!(server.next().await.unwrap().unwrap(), Message::Text("hi".into()));

    server
        .send(Message::Binary(Bytes::from_static(b"\x00\x01")))
        .await
        .unwrap();
    assert_eq!(
        client.next().await.unwrap().unwrap(),
        Message::Binary(Bytes::from_static(b"\x00\x01"))
    );

    client.send(Message::Close(Some((1000, "bye".into())))).await.unwrap();
    assert_eq!(
        server.next().await.unwrap().unwrap(),
        Message::Close(Some((1000, "bye".into())))
    );
}
