use crate::{serve, LineCodec, Request};
use futures_util::future::{join_all, poll_fn, BoxFuture, FutureExt};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio_http_pipeline::connection::{Connection, Dialer, TcpDialer};
use tokio_http_pipeline::endpoint::Endpoint;
use tokio_http_pipeline::pipeline;
use tokio_http_pipeline::{Error, Overflow, RequestTask, TaskState};
use tower::load::Load;
use tower_service::Service;

async fn server() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    tokio::spawn(serve(listener, accepted.clone()));
    (addr, accepted)
}

#[tokio::test]
async fn requests_are_answered() {
    let (addr, _) = server().await;
    let endpoint = Endpoint::builder(TcpDialer::new(addr), LineCodec).build();

    let replies = join_all((0..20).map(|i| {
        let endpoint = endpoint.clone();
        async move { endpoint.send(Request::get(&format!("/{}", i))).await }
    }))
    .await;

    for (i, reply) in replies.into_iter().enumerate() {
        let reply = reply.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, format!("/{}", i));
    }
    let stats = endpoint.stats();
    assert!(stats.connections_opened >= 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn connection_count_is_bounded() {
    let (addr, accepted) = server().await;
    let endpoint = Endpoint::builder(TcpDialer::new(addr), LineCodec)
        .max_connections(2)
        .pipeline(pipeline::Config {
            pipeline_max_size: 1,
            ..Default::default()
        })
        .build();

    let replies = join_all((0..10).map(|i| {
        let endpoint = endpoint.clone();
        async move { endpoint.send(Request::get(&format!("/{}", i))).await }
    }))
    .await;

    assert!(replies.into_iter().all(|r| r.is_ok()));
    assert!(accepted.load(Ordering::SeqCst) <= 2);
    assert!(endpoint.stats().connections_opened <= 2);
}

#[tokio::test]
async fn idle_connections_are_reused() {
    let (addr, accepted) = server().await;
    let endpoint = Endpoint::builder(TcpDialer::new(addr), LineCodec).build();

    for i in 0..5 {
        let reply = endpoint.send(Request::get(&format!("/{}", i))).await.unwrap();
        assert_eq!(reply.body, format!("/{}", i));
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_server_fails_with_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let endpoint = Endpoint::builder(TcpDialer::new(addr), LineCodec)
        .connect_attempts(2, Duration::from_millis(10))
        .build();

    let err = endpoint.send(Request::get("/")).await.err().unwrap();
    assert!(matches!(err, Error::Connect(_)));
    assert!(err.is_retryable());

    endpoint.closed().await;
    assert_eq!(endpoint.stats().connections_opened, 0);
}

#[tokio::test]
async fn full_queue_rejects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // accepts, but never answers
    let _listener = listener;

    let endpoint = Endpoint::builder(TcpDialer::new(addr), LineCodec)
        .max_connections(1)
        .queue(1, Overflow::Reject)
        .pipeline(pipeline::Config {
            pipeline_max_size: 1,
            ..Default::default()
        })
        .build();

    let mut accepted = Vec::new();
    let mut rejected = 0;
    for i in 0..5 {
        match endpoint.execute(Request::get(&format!("/{}", i))).await {
            Ok(handle) => accepted.push(handle),
            Err(Error::QueueFull) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
        tokio::task::yield_now().await;
    }
    assert!(rejected >= 1);
    assert!(!accepted.is_empty());
}

#[tokio::test]
async fn close_drains_and_refuses_new_work() {
    let (addr, _) = server().await;
    let endpoint = Endpoint::builder(TcpDialer::new(addr), LineCodec).build();

    let pending = endpoint.execute(Request::get("/last")).await.unwrap();
    endpoint.close();
    assert_eq!(pending.await.unwrap().body, "/last");

    assert!(matches!(
        endpoint.send(Request::get("/late")).await,
        Err(Error::QueueClosed)
    ));
    endpoint.closed().await;
    let stats = endpoint.stats();
    assert_eq!(stats.live_connections, 0);
    assert_eq!(stats.connections_opened, stats.connections_closed);
}

#[tokio::test]
async fn works_as_a_tower_service() {
    let (addr, _) = server().await;
    let mut endpoint = Endpoint::builder(TcpDialer::new(addr), LineCodec).build();
    assert_eq!(endpoint.load(), 0);

    poll_fn(|cx| endpoint.poll_ready(cx)).await.unwrap();
    let reply = endpoint.call(Request::get("/svc")).await.unwrap();
    assert_eq!(reply.body, "/svc");

    endpoint.close();
    assert!(matches!(
        poll_fn(|cx| endpoint.poll_ready(cx)).await,
        Err(Error::QueueClosed)
    ));
}

/// How a [`Scripted`] dialer answers each dial.
#[derive(Clone, Copy)]
enum Dial {
    /// Connect to a server that reads nothing and never answers.
    Silent,
    Refuse,
    /// Never complete.
    Hang,
}

/// A dialer that answers the first dial one way and every later one another.
#[derive(Clone)]
struct Scripted {
    first: Dial,
    then: Dial,
    dials: Arc<AtomicUsize>,
    servers: Arc<Mutex<Vec<DuplexStream>>>,
}

impl Scripted {
    fn new(first: Dial, then: Dial) -> Self {
        Scripted {
            first,
            then,
            dials: Arc::new(AtomicUsize::new(0)),
            servers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Dialer for Scripted {
    type Io = DuplexStream;
    type Future = BoxFuture<'static, io::Result<Connection<DuplexStream>>>;

    fn dial(&self) -> Self::Future {
        let how = if self.dials.fetch_add(1, Ordering::SeqCst) == 0 {
            self.first
        } else {
            self.then
        };
        match how {
            Dial::Silent => {
                let (client, server) = tokio::io::duplex(4096);
                self.servers.lock().unwrap().push(server);
                futures_util::future::ready(io::Result::Ok(Connection::new(client))).boxed()
            }
            Dial::Refuse => {
                let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
                futures_util::future::ready(Err(refused)).boxed()
            }
            Dial::Hang => futures_util::future::pending::<io::Result<_>>().boxed(),
        }
    }
}

async fn until_written(handle: &tokio_http_pipeline::ResponseHandle<crate::Reply>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.state() != TaskState::Written {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn refused_dials_back_off_while_a_connection_is_busy() {
    let dialer = Scripted::new(Dial::Silent, Dial::Refuse);
    let endpoint = Endpoint::builder(dialer.clone(), LineCodec)
        .max_connections(2)
        .connect_attempts(1, Duration::from_millis(50))
        .pipeline(pipeline::Config {
            pipeline_max_size: 1,
            ..Default::default()
        })
        .build();

    let mut handles = Vec::new();
    for i in 0..3 {
        handles.push(endpoint.execute(Request::get(&format!("/{}", i))).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dials = dialer.dials();
    assert!(dials < 20, "dialed {} times in 200ms", dials);
    // the open connection may still get to these
    assert_eq!(handles[1].state(), TaskState::Queued);
    assert_eq!(handles[2].state(), TaskState::Queued);
    assert_eq!(endpoint.stats().queued, 2);
}

#[tokio::test]
async fn failed_dial_fails_the_whole_backlog() {
    let dialer = Scripted::new(Dial::Refuse, Dial::Refuse);
    let endpoint = Endpoint::builder(dialer.clone(), LineCodec)
        .max_connections(1)
        .build();

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(endpoint.execute(Request::get(&format!("/{}", i))).await.unwrap());
    }
    for handle in handles {
        match handle.await {
            Err(Error::Connect(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("unexpected response"),
        }
    }
    assert_eq!(dialer.dials(), 1);
    assert_eq!(endpoint.stats().queued, 0);
}

#[tokio::test]
async fn connect_timeout_bounds_each_dial() {
    let dialer = Scripted::new(Dial::Hang, Dial::Hang);
    let endpoint = Endpoint::builder(dialer.clone(), LineCodec)
        .connect_timeout(Some(Duration::from_millis(20)))
        .build();

    match endpoint.send(Request::get("/")).await {
        Err(Error::Connect(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("unexpected response"),
    }
    endpoint.closed().await;
}

#[tokio::test]
async fn cancelled_requests_do_not_open_connections() {
    let dialer = Scripted::new(Dial::Silent, Dial::Silent);
    let endpoint = Endpoint::builder(dialer.clone(), LineCodec)
        .max_connections(2)
        .pipeline(pipeline::Config {
            pipeline_max_size: 1,
            ..Default::default()
        })
        .build();

    let first = endpoint.execute(Request::get("/first")).await.unwrap();
    until_written(&first).await;

    // queued behind the busy connection, then abandoned
    let (task, abandoned) = RequestTask::new(Request::get("/abandoned"));
    endpoint.queue().try_enqueue(task).unwrap();
    assert!(abandoned.cancel());

    // closing looks for work that still needs a connection
    endpoint.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sustained_load_over_several_connections() {
    const CONNECTIONS: usize = 4;
    const DEPTH: usize = 8;

    let (addr, accepted) = server().await;
    let endpoint = Endpoint::builder(TcpDialer::new(addr), LineCodec)
        .max_connections(CONNECTIONS)
        .queue(256, Overflow::Wait)
        .pipeline(pipeline::Config {
            pipeline_max_size: DEPTH,
            ..Default::default()
        })
        .build();

    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let endpoint = endpoint.clone();
        let done = done.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                let stats = endpoint.stats();
                assert!(stats.live_connections <= CONNECTIONS, "{:?}", stats);
                assert!(stats.in_flight <= CONNECTIONS * DEPTH, "{:?}", stats);
                tokio::task::yield_now().await;
            }
        })
    };

    let requests: Vec<_> = (0..4000)
        .map(|i| {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let path = format!("/{}", i);
                let reply = endpoint.send(Request::get(&path)).await.unwrap();
                assert_eq!(reply.status, 200);
                assert_eq!(reply.body, path);
            })
        })
        .collect();
    for request in requests {
        request.await.unwrap();
    }

    done.store(true, Ordering::SeqCst);
    watcher.await.unwrap();

    endpoint.close();
    endpoint.closed().await;
    let stats = endpoint.stats();
    assert_eq!(stats.connections_opened, stats.connections_closed);
    assert!(stats.connections_opened <= accepted.load(Ordering::SeqCst));
    assert_eq!(stats.live_connections, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.queued, 0);
}
