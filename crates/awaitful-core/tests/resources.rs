//! Integration tests for shared resources: fetch caching and socket
//! subscriptions, using in-process transports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use awaitful_core::{
    CellError, Connection, Connector, Context, Fetcher, Push, Result, Runtime, SocketRequest,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Serves fixed documents after a delay and records every request.
#[derive(Clone)]
struct StaticFetcher {
    routes: Arc<HashMap<String, Value>>,
    delay: Duration,
    calls: Arc<Mutex<Vec<String>>>,
}

impl StaticFetcher {
    fn new(routes: &[(&str, Value)], delay: Duration) -> Self {
        Self {
            routes: Arc::new(
                routes
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.clone()))
                    .collect(),
            ),
            delay,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn calls(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == url)
            .count()
    }
}

impl Fetcher for StaticFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, std::result::Result<Value, CellError>> {
        self.calls.lock().unwrap().push(url.to_string());
        let body = self.routes.get(url).cloned();
        let url = url.to_string();
        let delay = self.delay;
        async move {
            tokio::time::sleep(delay).await;
            body.ok_or(CellError::Fetch {
                url,
                message: "404 Not Found".into(),
            })
        }
        .boxed()
    }
}

/// Hands the server end of every connection to the test.
struct Loopback {
    servers: mpsc::UnboundedSender<Connection>,
}

impl Connector for Loopback {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Connection>> {
        let (client, server) = Connection::pair();
        let _ = self.servers.send(server);
        async move { Ok(client) }.boxed()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn items_fetcher() -> StaticFetcher {
    StaticFetcher::new(
        &[
            ("/items", json!(["test", "test2"])),
            ("/items2", json!(["test3", "test4"])),
            ("/itemUrls", json!(["/items", "/items2"])),
        ],
        Duration::from_secs(1),
    )
}

#[tokio::test(start_paused = true)]
async fn test_shared_fetch_cache() {
    let fetcher = items_fetcher();
    let runtime = Runtime::builder().fetcher(fetcher.clone()).build();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handles = Vec::new();
    for label in ["first", "second"] {
        let tx = tx.clone();
        handles.push(runtime.spawn_loop(
            label,
            |c: Context| async move { c.fetch::<Vec<String>>("/items").await },
            move |items| {
                let _ = tx.send(items);
            },
        ));
    }

    let a = rx.recv().await.unwrap();
    let b = rx.recv().await.unwrap();
    assert_eq!(a, vec!["test", "test2"]);
    assert_eq!(a, b);
    assert_eq!(fetcher.calls("/items"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_item_urls_fetched_once_across_passes() {
    let fetcher = items_fetcher();
    let runtime = Runtime::builder().fetcher(fetcher.clone()).build();
    let ctx = runtime.context();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = awaitful_core::RenderLoop::new("list", &ctx).spawn(
        |c: Context| async move {
            let selected: String = c.state("/selected", "a".to_string()).await?;
            let urls: Vec<String> = c.fetch("/itemUrls").await?;
            let mut items = Vec::new();
            for url in urls {
                items.extend(c.fetch::<Vec<String>>(&url).await?);
            }
            Ok((selected, items))
        },
        move |out| {
            let _ = tx.send(out);
        },
    );

    let (selected, items) = rx.recv().await.unwrap();
    assert_eq!(selected, "a");
    assert_eq!(items, vec!["test", "test2", "test3", "test4"]);

    ctx.set("/selected", "b").unwrap();
    let (selected, _) = rx.recv().await.unwrap();
    assert_eq!(selected, "b");

    // A second instance reuses every cached document.
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let _other = runtime.spawn_loop(
        "other",
        |c: Context| async move { c.fetch::<Vec<String>>("/itemUrls").await },
        move |urls| {
            let _ = tx2.send(urls);
        },
    );
    assert_eq!(rx2.recv().await.unwrap().len(), 2);

    for url in ["/itemUrls", "/items", "/items2"] {
        assert_eq!(fetcher.calls(url), 1, "{url}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_is_retried() {
    let fetcher = StaticFetcher::new(&[], Duration::ZERO);
    let runtime = Runtime::builder()
        .fetcher(fetcher.clone())
        .retry_delay(Duration::from_millis(200))
        .build();
    let handle = runtime.spawn_loop(
        "missing",
        |c: Context| async move { c.fetch::<Value>("/nowhere").await },
        |_| {},
    );

    tokio::time::sleep(Duration::from_millis(650)).await;
    // Initial attempt plus one retry per elapsed backoff.
    assert_eq!(fetcher.calls("/nowhere"), 4);
    assert_eq!(handle.stats().passes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_sends_once_and_rerenders_on_push() {
    let (servers, mut accepted) = mpsc::unbounded_channel();
    let runtime = Runtime::builder().connector(Loopback { servers }).build();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = runtime.spawn_loop(
        "todos",
        |c: Context| async move {
            let ws = c.ws("/wss").await?;
            ws.subscribe::<Vec<u64>>("/todos").await
        },
        move |ids| {
            let _ = tx.send(ids);
        },
    );

    let mut server = accepted.recv().await.unwrap();
    let request: SocketRequest =
        serde_json::from_str(&server.incoming.recv().await.unwrap()).unwrap();
    assert_eq!(
        request,
        SocketRequest::Subscribe {
            path: "/todos".into()
        }
    );

    let push = |data: Value| serde_json::to_string(&Push::new("/todos", data)).unwrap();
    server.outgoing.send(push(json!([1]))).unwrap();
    assert_eq!(rx.recv().await.unwrap(), vec![1]);

    server.outgoing.send(push(json!([1, 2]))).unwrap();
    assert_eq!(rx.recv().await.unwrap(), vec![1, 2]);

    // Pushes for other paths are ignored; no second subscribe was sent and
    // only one connection was opened.
    server
        .outgoing
        .send(serde_json::to_string(&Push::new("/todo/1", json!({}))).unwrap())
        .unwrap();
    settle().await;
    assert_eq!(handle.stats().passes(), 2);
    assert!(server.incoming.try_recv().is_err());
    assert!(accepted.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_socket_send_payload() {
    let (servers, mut accepted) = mpsc::unbounded_channel();
    let runtime = Runtime::builder().connector(Loopback { servers }).build();
    let ctx = runtime.context();

    let ws = ctx.ws("/wss").await.unwrap();
    ws.send(&json!({ "type": "CreateTodo", "text": "milk" }))
        .unwrap();

    let mut server = accepted.recv().await.unwrap();
    let sent: Value = serde_json::from_str(&server.incoming.recv().await.unwrap()).unwrap();
    assert_eq!(sent["type"], "CreateTodo");
    assert_eq!(sent["text"], "milk");
}

#[tokio::test(start_paused = true)]
async fn test_closed_socket_reconnects_after_delay() {
    let (servers, mut accepted) = mpsc::unbounded_channel();
    let runtime = Runtime::builder().connector(Loopback { servers }).build();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = runtime.spawn_loop(
        "todos",
        |c: Context| async move {
            let ws = c.ws("/wss").await?;
            ws.subscribe::<Vec<u64>>("/todos").await
        },
        move |ids| {
            let _ = tx.send(ids);
        },
    );

    // The backend goes away before answering the subscription.
    let mut first = accepted.recv().await.unwrap();
    first.incoming.recv().await.unwrap();
    drop(first);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handle.stats().passes(), 1);
    assert_eq!(handle.stats().failures(), 1);
    assert!(accepted.try_recv().is_err());

    // After the retry delay the pass runs again on a fresh connection.
    let mut second = accepted.recv().await.unwrap();
    let request: SocketRequest =
        serde_json::from_str(&second.incoming.recv().await.unwrap()).unwrap();
    assert_eq!(
        request,
        SocketRequest::Subscribe {
            path: "/todos".into()
        }
    );

    second
        .outgoing
        .send(serde_json::to_string(&Push::new("/todos", json!([7]))).unwrap())
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), vec![7]);
    assert_eq!(handle.stats().passes(), 2);
}
