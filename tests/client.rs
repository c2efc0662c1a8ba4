use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_core::future::BoxFuture;
use futures_util::{future, FutureExt};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use tachyon::admission::AdmissionPolicy;
use tachyon::event::{Event, EventKind};
use tachyon::transport::mock::{MockResponse, MockTransport};
use tachyon::transport::{
    Connection, ConnectionId, FrameHandler, FrameSink, Notifier, Transport,
};
use tachyon::{
    BodyConsumer, BoxError, BytesConsumer, Client, Destination, Error, ErrorKind, RequestOptions,
    TimeoutKind,
};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn counter(client: &Client, kind: EventKind) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    client.events().subscribe_permanently(kind, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    count
}

#[derive(Debug, Clone)]
struct Seen {
    method: Method,
    path: String,
    host: Option<HeaderValue>,
    connection: Option<HeaderValue>,
    body: Bytes,
}

type Log = Arc<Mutex<Vec<Seen>>>;

fn routed<F>(route: F) -> (MockTransport, Log)
where
    F: Fn(&str) -> MockResponse + Send + Sync + 'static,
{
    let log: Log = Arc::default();
    let record = log.clone();
    let transport = MockTransport::new(move |request| {
        record.lock().push(Seen {
            method: request.method().clone(),
            path: request.uri().path().to_owned(),
            host: request.headers().get(HOST).cloned(),
            connection: request.headers().get(CONNECTION).cloned(),
            body: request.body().clone(),
        });
        route(request.uri().path())
    });
    (transport, log)
}

/// What an [`InlineConnection`] reports from inside `write`.
#[derive(Debug, Clone, Copy)]
enum Inline {
    Respond,
    Fail,
}

/// A transport which reports progress synchronously, before `write` returns.
#[derive(Debug, Clone)]
struct InlineTransport {
    mode: Inline,
    connections: Arc<AtomicUsize>,
}

impl InlineTransport {
    fn new(mode: Inline) -> Self {
        Self {
            mode,
            connections: Arc::default(),
        }
    }
}

impl Transport for InlineTransport {
    fn connect(
        &self,
        _destination: &Destination,
    ) -> BoxFuture<'static, Result<Box<dyn Connection>, BoxError>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let connection: Box<dyn Connection> = Box::new(InlineConnection {
            id: ConnectionId::next(),
            mode: self.mode,
            open: true,
        });
        future::ready(Ok(connection)).boxed()
    }
}

#[derive(Debug)]
struct InlineConnection {
    id: ConnectionId,
    mode: Inline,
    open: bool,
}

impl Connection for InlineConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn write(
        &mut self,
        _request: http::Request<Bytes>,
        notifier: Notifier,
    ) -> BoxFuture<'static, Result<(), BoxError>> {
        notifier.headers_written();
        match self.mode {
            Inline::Respond => {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_LENGTH, HeaderValue::from_static("6"));
                notifier.status(StatusCode::OK);
                notifier.headers(headers);
                notifier.content(Bytes::from_static(b"inline"));
                notifier.complete();
            }
            Inline::Fail => notifier.error("connection reset"),
        }
        future::ready(Ok(())).boxed()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn upgrade(
        self: Box<Self>,
        _frames: Arc<dyn FrameHandler>,
    ) -> Result<Box<dyn FrameSink>, BoxError> {
        Err("upgrade not supported".into())
    }
}

#[tokio::test]
async fn get_returns_body() {
    init_tracing();
    let client = Client::builder().transport(MockTransport::ok()).build();

    let response = client.get("http://example.com/".parse().unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), "hello");
    assert_eq!(client.stats().in_flight, 0);
}

#[tokio::test]
async fn connections_are_pooled_and_reused() {
    init_tracing();
    let transport = MockTransport::ok();
    let client = Client::builder().transport(transport.clone()).build();

    let created = counter(&client, EventKind::CreatedConnection);
    let reused = counter(&client, EventKind::ReusedConnection);
    let pooled = counter(&client, EventKind::PooledConnection);

    for _ in 0..2 {
        let response = client.get("http://example.com/".parse().unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(transport.connections(), 1);
    assert_eq!(transport.requests(), 2);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(reused.load(Ordering::SeqCst), 1);
    assert_eq!(pooled.load(Ordering::SeqCst), 2);
    assert_eq!(client.stats().pool.idle, 1);
}

#[tokio::test]
async fn connection_close_is_not_pooled() {
    init_tracing();
    let transport = MockTransport::new(|_| {
        MockResponse::ok()
            .header(CONNECTION, HeaderValue::from_static("close"))
            .body("bye")
    });
    let client = Client::builder().transport(transport.clone()).build();
    let closed = counter(&client, EventKind::ClosedConnection);

    for _ in 0..2 {
        client.get("http://example.com/".parse().unwrap()).await.unwrap();
    }

    assert_eq!(transport.connections(), 2);
    assert_eq!(closed.load(Ordering::SeqCst), 2);
    assert_eq!(client.stats().pool.idle, 0);
}

#[tokio::test]
async fn without_keep_alive_requests_close() {
    init_tracing();
    let (transport, log) = routed(|_| MockResponse::ok());
    let client = Client::builder()
        .keep_alive(false)
        .transport(transport.clone())
        .build();

    client.get("http://example.com/".parse().unwrap()).await.unwrap();
    client.get("http://example.com/".parse().unwrap()).await.unwrap();

    assert_eq!(transport.connections(), 2);
    assert!(log
        .lock()
        .iter()
        .all(|seen| seen.connection.as_ref().is_some_and(|value| value == "close")));
}

#[tokio::test]
async fn write_error_discards_connection() {
    init_tracing();
    let transport = MockTransport::new(|_| MockResponse::ok().write_error());
    let client = Client::builder().transport(transport.clone()).build();
    let closed = counter(&client, EventKind::ClosedConnection);
    let errors = counter(&client, EventKind::Error);

    let error = client
        .get("http://example.com/".parse().unwrap())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::WriteFailed);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(client.stats().pool.idle, 0);
}

#[tokio::test]
async fn connect_failure() {
    init_tracing();
    let client = Client::builder()
        .transport(MockTransport::connection_error())
        .build();

    let error = client
        .get("http://example.com/".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Connect(_)));
    assert_eq!(client.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout() {
    init_tracing();
    let client = Client::builder()
        .connect_timeout(Some(Duration::from_millis(100)))
        .transport(MockTransport::ok().with_connect_delay(Duration::from_secs(1)))
        .build();

    let error = client
        .get("http://example.com/".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Timeout(TimeoutKind::Connect)));
    assert_eq!(error.kind(), ErrorKind::ConnectFailed);
}

#[tokio::test(start_paused = true)]
async fn admission_rejects_and_releases() {
    init_tracing();
    let transport = MockTransport::new(|_| MockResponse::ok().delay(Duration::from_millis(100)));
    let client = Client::builder()
        .with_admission(AdmissionPolicy::Reject {
            max_total: Some(1),
            max_per_host: None,
        })
        .transport(transport)
        .build();

    let first = client.get("http://example.com/".parse().unwrap());
    assert_eq!(client.stats().in_flight, 1);

    let error = client
        .get("http://example.com/".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::TooManyConnections(_)));
    assert_eq!(error.kind(), ErrorKind::AdmissionRejected);
    assert_eq!(client.stats().in_flight, 1);

    first.await.unwrap();
    assert_eq!(client.stats().in_flight, 0);

    client.get("http://example.com/".parse().unwrap()).await.unwrap();
    assert_eq!(client.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_timeout() {
    init_tracing();
    let transport = MockTransport::new(|_| MockResponse::ok().hang());
    let client = Client::builder()
        .idle_timeout(Some(Duration::from_secs(1)))
        .transport(transport)
        .build();
    let closed = counter(&client, EventKind::ClosedConnection);

    let error = client
        .get("http://example.com/".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Timeout(TimeoutKind::Idle)));
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(client.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn slow_body_hits_total_timeout() {
    init_tracing();
    let transport = MockTransport::new(|_| {
        MockResponse::ok()
            .chunks(["a", "b", "c", "d", "e"])
            .chunk_delay(Duration::from_millis(600))
    });
    let client = Client::builder()
        .idle_timeout(Some(Duration::from_secs(1)))
        .request_timeout(Some(Duration::from_secs(2)))
        .transport(transport)
        .build();

    let error = client
        .get("http://example.com/".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Timeout(TimeoutKind::Request)));
}

#[tokio::test(start_paused = true)]
async fn cancel_resolves_once() {
    init_tracing();
    let transport = MockTransport::new(|_| MockResponse::ok().hang());
    let client = Client::builder()
        .idle_timeout(Some(Duration::from_millis(10)))
        .transport(transport)
        .build();
    let errors = counter(&client, EventKind::Error);

    let future = client.get("http://example.com/".parse().unwrap());
    tokio::time::sleep(Duration::from_millis(10)).await;
    future.cancel();

    let error = future.await.unwrap_err();
    assert!(matches!(
        error,
        Error::Cancelled | Error::Timeout(TimeoutKind::Idle)
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(client.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_future_cancels() {
    init_tracing();
    let transport = MockTransport::new(|_| MockResponse::ok().hang());
    let client = Client::builder().transport(transport).build();
    let closed = counter(&client, EventKind::ClosedConnection);

    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    client.events().subscribe(EventKind::Error, move |event| {
        if let (Event::Error(_, error), Some(tx)) = (event, tx.lock().take()) {
            let _ = tx.send(error.clone());
        }
        Ok(())
    });

    let future = client.get("http://example.com/".parse().unwrap());
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(future);

    let error = rx.await.unwrap();
    assert!(matches!(error, Error::Cancelled));
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(client.stats().in_flight, 0);
}

#[tokio::test]
async fn follows_relative_redirect() {
    init_tracing();
    let (transport, log) = routed(|path| match path {
        "/start" => MockResponse::redirect(StatusCode::FOUND, "next"),
        _ => MockResponse::ok().body("done"),
    });
    let client = Client::builder()
        .follow_redirects(true)
        .transport(transport.clone())
        .build();

    let response = client
        .get("http://example.com/start".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), "done");

    let paths: Vec<_> = log.lock().iter().map(|seen| seen.path.clone()).collect();
    assert_eq!(paths, vec!["/start", "/next"]);
    assert_eq!(transport.connections(), 1);
    assert_eq!(client.stats().in_flight, 0);
}

#[tokio::test]
async fn follows_absolute_redirect_to_another_host() {
    init_tracing();
    let (transport, log) = routed(|path| match path {
        "/moved" => MockResponse::redirect(StatusCode::MOVED_PERMANENTLY, "http://other.example:8080/landing"),
        _ => MockResponse::ok(),
    });
    let client = Client::builder()
        .follow_redirects(true)
        .transport(transport.clone())
        .build();

    client
        .get("http://example.com/moved".parse().unwrap())
        .await
        .unwrap();

    let log = log.lock();
    assert_eq!(log[1].path, "/landing");
    assert_eq!(log[1].host.as_ref().unwrap(), "other.example:8080");
    assert_eq!(transport.connections(), 2);
}

#[tokio::test]
async fn see_other_switches_to_get() {
    init_tracing();
    let (transport, log) = routed(|path| match path {
        "/form" => MockResponse::redirect(StatusCode::SEE_OTHER, "/result"),
        _ => MockResponse::ok(),
    });
    let client = Client::builder()
        .follow_redirects(true)
        .transport(transport)
        .build();

    let request = http::Request::post("http://example.com/form")
        .header(CONTENT_TYPE, "text/plain")
        .body(Bytes::from_static(b"payload"))
        .unwrap();
    client.request(request).await.unwrap();

    let log = log.lock();
    assert_eq!(log[0].method, Method::POST);
    assert_eq!(log[0].body, "payload");
    assert_eq!(log[1].method, Method::GET);
    assert!(log[1].body.is_empty());
}

#[tokio::test]
async fn temporary_redirect_keeps_body() {
    init_tracing();
    let (transport, log) = routed(|path| match path {
        "/upload" => MockResponse::redirect(StatusCode::TEMPORARY_REDIRECT, "/upload-here"),
        _ => MockResponse::ok(),
    });
    let client = Client::builder()
        .follow_redirects(true)
        .transport(transport)
        .build();

    let request = http::Request::put("http://example.com/upload")
        .body(Bytes::from_static(b"data"))
        .unwrap();
    client.request(request).await.unwrap();

    let log = log.lock();
    assert_eq!(log[1].method, Method::PUT);
    assert_eq!(log[1].body, "data");
}

#[tokio::test]
async fn redirect_loop_is_detected() {
    init_tracing();
    let (transport, log) = routed(|path| match path {
        "/test1" => MockResponse::redirect(StatusCode::FOUND, "/test2"),
        _ => MockResponse::redirect(StatusCode::FOUND, "/test1"),
    });
    let client = Client::builder()
        .follow_redirects(true)
        .transport(transport)
        .build();

    let error = client
        .get("http://example.com/test1".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::MaxRedirects(_)));
    assert_eq!(log.lock().len(), 2);
    assert_eq!(client.stats().in_flight, 0);
}

#[tokio::test]
async fn redirect_limit() {
    init_tracing();
    let (transport, log) = routed(|path| {
        let hop: usize = path.trim_start_matches("/r").parse().unwrap_or(0);
        MockResponse::redirect(StatusCode::FOUND, &format!("/r{}", hop + 1))
    });
    let client = Client::builder()
        .follow_redirects(true)
        .max_redirects(2)
        .transport(transport)
        .build();

    let error = client
        .get("http://example.com/r0".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::MaxRedirects(2)));
    assert_eq!(log.lock().len(), 3);
}

#[tokio::test]
async fn redirects_are_returned_unless_followed() {
    init_tracing();
    let (transport, _log) = routed(|_| MockResponse::redirect(StatusCode::FOUND, "/elsewhere"));
    let client = Client::builder().transport(transport.clone()).build();

    let response = client
        .get("http://example.com/".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(transport.requests(), 1);
}

#[tokio::test]
async fn request_options_override_client_defaults() {
    init_tracing();
    let (transport, _log) = routed(|path| match path {
        "/start" => MockResponse::redirect(StatusCode::FOUND, "/end"),
        _ => MockResponse::ok().body("end"),
    });
    let client = Client::builder().transport(transport).build();

    let mut options = RequestOptions::from(client.config());
    options.follow_redirects = true;
    let mut request = http::Request::get("http://example.com/start")
        .body(Bytes::new())
        .unwrap();
    request.extensions_mut().insert(options);

    let response = client.request(request).await.unwrap();
    assert_eq!(response.body(), "end");
}

#[derive(Debug)]
struct Failing;

impl BodyConsumer for Failing {
    type Output = ();

    fn on_body_start(
        &mut self,
        _content_type: Option<&str>,
        _charset: Option<&str>,
        _content_length: Option<u64>,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_content_part(&mut self, _chunk: &Bytes) -> Result<(), BoxError> {
        Err("refusing this body".into())
    }

    fn on_completed_body(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    fn body(&mut self) -> Result<Self::Output, BoxError> {
        Ok(())
    }
}

#[tokio::test]
async fn consumer_failure_poisons_connection() {
    init_tracing();
    let transport = MockTransport::ok();
    let client = Client::builder().transport(transport.clone()).build();

    let request = http::Request::get("http://example.com/")
        .body(Bytes::new())
        .unwrap();
    let error = client.execute(request, Failing).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ConsumerFailure);
    assert_eq!(client.stats().pool.idle, 0);

    client.get("http://example.com/".parse().unwrap()).await.unwrap();
    assert_eq!(transport.connections(), 2);
}

#[tokio::test]
async fn body_limit() {
    init_tracing();
    let client = Client::builder().transport(MockTransport::ok()).build();

    let request = http::Request::get("http://example.com/")
        .body(Bytes::new())
        .unwrap();
    let error = client
        .execute(request, BytesConsumer::with_limit(2))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Consumer(_)));
}

#[tokio::test]
async fn peer_closes_early() {
    init_tracing();
    let transport = MockTransport::new(|_| MockResponse::ok().body("partial").close_early());
    let client = Client::builder().transport(transport).build();

    let error = client
        .get("http://example.com/".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::PeerClosed));
    assert_eq!(error.kind(), ErrorKind::PeerClosed);
}

#[tokio::test]
async fn callback_style() {
    init_tracing();
    let client = Client::builder().transport(MockTransport::ok()).build();

    let (tx, rx) = oneshot::channel();
    let request = http::Request::get("http://example.com/")
        .body(Bytes::new())
        .unwrap();
    client.execute_with_callback(
        request,
        BytesConsumer::new(),
        move |result: Result<http::Response<Bytes>, Error>| {
            let _ = tx.send(result.map(|response| response.into_body()));
        },
    );

    assert_eq!(rx.await.unwrap().unwrap(), "hello");
}

#[tokio::test]
async fn callback_receives_errors() {
    init_tracing();
    let client = Client::builder().transport(MockTransport::ok()).build();

    let (tx, rx) = oneshot::channel();
    let request = http::Request::get("ws://example.com/")
        .body(Bytes::new())
        .unwrap();
    client.execute_with_callback(
        request,
        BytesConsumer::new(),
        move |result: Result<http::Response<Bytes>, Error>| {
            let _ = tx.send(result.err());
        },
    );

    let error = rx.await.unwrap().unwrap();
    assert!(matches!(error, Error::InvalidDestination { .. }));
}

#[tokio::test]
async fn tower_service() {
    use tower::ServiceExt;

    init_tracing();
    let client = Client::builder().transport(MockTransport::ok()).build();

    let request = http::Request::get("http://example.com/")
        .body(Bytes::new())
        .unwrap();
    let response = client.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn closed_client() {
    init_tracing();
    let client = Client::builder().transport(MockTransport::ok()).build();
    client.get("http://example.com/".parse().unwrap()).await.unwrap();
    assert_eq!(client.stats().pool.idle, 1);

    client.close();
    assert!(client.is_closed());
    assert_eq!(client.stats().pool.idle, 0);

    let error = client
        .get("http://example.com/".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Closed));
}

#[tokio::test]
async fn response_reported_during_write() {
    init_tracing();
    let transport = InlineTransport::new(Inline::Respond);
    let client = Client::builder().transport(transport.clone()).build();
    let pooled = counter(&client, EventKind::PooledConnection);

    for _ in 0..2 {
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            client.get("http://example.com/".parse().unwrap()),
        )
        .await
        .expect("request stalled")
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "inline");
    }

    assert_eq!(transport.connections.load(Ordering::SeqCst), 1);
    assert_eq!(pooled.load(Ordering::SeqCst), 2);
    assert_eq!(client.stats().in_flight, 0);
}

#[tokio::test]
async fn error_reported_during_write() {
    init_tracing();
    let client = Client::builder()
        .transport(InlineTransport::new(Inline::Fail))
        .build();
    let closed = counter(&client, EventKind::ClosedConnection);

    let error = tokio::time::timeout(
        Duration::from_secs(5),
        client.get("http://example.com/".parse().unwrap()),
    )
    .await
    .expect("request stalled")
    .unwrap_err();
    assert!(matches!(error, Error::Read(_)), "{error:?}");
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(client.stats().in_flight, 0);
    assert_eq!(client.stats().pool.idle, 0);
}
