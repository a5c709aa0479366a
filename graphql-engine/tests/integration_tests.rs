use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use bytes::BytesMut;
use futures::StreamExt;
use futures::stream::BoxStream;
use graphql_engine::BufPair;
use graphql_engine::Configuration;
use graphql_engine::Context;
use graphql_engine::Fetcher;
use graphql_engine::PlanNode;
use graphql_engine::StreamManager;
use graphql_engine::query_planner::DataSource;
use graphql_engine::query_planner::ProcessResponseConfig;
use graphql_engine::query_planner::SingleFetch;
use graphql_engine::resolve_subscription;
use graphql_engine::subscription::EventSource;
use graphql_engine::subscription::EventSourceStreamFactory;
use pretty_assertions::assert_eq;
use serde_json::json;
use test_log::test;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::BoxError;

const GRAPHQL: ProcessResponseConfig = ProcessResponseConfig {
    extract_graphql_response: true,
    extract_federation_entities: false,
};

/// Counts loads and answers after a delay.
struct Accounts {
    calls: AtomicUsize,
    delay: Duration,
}

impl Accounts {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Accounts {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for Accounts {
    async fn load(&self, _input: &[u8], out: &mut BytesMut) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        out.extend_from_slice(br#"{"data":{"id":"1"}}"#);
        Ok(())
    }
}

fn accounts_fetch(data_source: Arc<Accounts>) -> SingleFetch {
    SingleFetch::builder()
        .service_name("accounts")
        .data_source(data_source as Arc<dyn DataSource>)
        .process_response(GRAPHQL)
        .build()
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn concurrent_identical_fetches_share_one_load() {
    let accounts = Accounts::new(Duration::from_millis(50));
    let fetch = accounts_fetch(Arc::clone(&accounts));
    let fetcher = Fetcher::default();
    let ctx = Context::default();

    let results = futures::future::join_all((0..50).map(|_| {
        let (fetcher, fetch, ctx) = (&fetcher, &fetch, &ctx);
        async move {
            let mut out = BufPair::new();
            fetcher.fetch(ctx, fetch, br#"{"id":"1"}"#, &mut out).await.map(|()| out)
        }
    }))
    .await;

    assert_eq!(accounts.calls(), 1);
    for result in results {
        let out = result.unwrap();
        assert_eq!(&out.data[..], br#"{"id":"1"}"#);
        assert!(!out.has_errors());
    }
    assert_eq!(fetcher.inflight_count(), 0);

    // the completed load is not cached
    let mut out = BufPair::new();
    fetcher
        .fetch(&ctx, &fetch, br#"{"id":"1"}"#, &mut out)
        .await
        .unwrap();
    assert_eq!(accounts.calls(), 2);
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn configured_fetcher_without_single_flight_loads_every_time() {
    let configuration = Configuration::from_str(
        r#"
fetch:
  single_flight: false
  buffer_pool_max_size: 4
"#,
    )
    .unwrap();
    let fetcher = Fetcher::from_config(&configuration.fetch);
    let accounts = Accounts::new(Duration::from_millis(10));
    let fetch = accounts_fetch(Arc::clone(&accounts));
    let ctx = Context::default();

    futures::future::join_all((0..3).map(|_| {
        let (fetcher, fetch, ctx) = (&fetcher, &fetch, &ctx);
        async move {
            let mut out = BufPair::new();
            fetcher.fetch(ctx, fetch, b"{}", &mut out).await.unwrap();
        }
    }))
    .await;

    assert_eq!(accounts.calls(), 3);
}

#[test(tokio::test)]
async fn plan_execution_dedups_identical_fetches() {
    let accounts = Accounts::new(Duration::from_millis(20));
    let node = |key: &str| PlanNode::Fetch {
        response_key: key.to_string(),
        fetch: accounts_fetch(Arc::clone(&accounts)),
        input: Bytes::from_static(br#"{"id":"1"}"#),
    };
    let plan = PlanNode::Parallel {
        nodes: vec![node("me"), node("author")],
    };

    let response = plan
        .execute(&Fetcher::default(), &Context::default())
        .await
        .unwrap();

    assert_eq!(accounts.calls(), 1);
    let rendered: serde_json::Value = serde_json::from_slice(&response.to_bytes()).unwrap();
    assert_eq!(
        rendered,
        json!({ "data": { "me": { "id": "1" }, "author": { "id": "1" } } })
    );
}

/// Fans a test controlled broadcast out to every opened upstream.
struct Events {
    opened: AtomicUsize,
    sender: broadcast::Sender<Bytes>,
}

#[async_trait]
impl EventSource for Events {
    async fn open(&self, _input: &[u8]) -> Result<BoxStream<'static, Bytes>, BoxError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let receiver = self.sender.subscribe();
        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.ok().map(|event| (event, receiver))
        })
        .boxed())
    }
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn subscriptions_share_and_release_one_upstream() {
    let configuration = Configuration::from_str(
        r#"
subscription:
  queue_capacity: 16
  idle_stream: evict
"#,
    )
    .unwrap();
    let (sender, _) = broadcast::channel(16);
    let events = Arc::new(Events {
        opened: AtomicUsize::new(0),
        sender: sender.clone(),
    });
    let factory = Arc::new(EventSourceStreamFactory::new(
        Arc::clone(&events) as Arc<dyn EventSource>,
        configuration.subscription.clone(),
    ));
    let manager = Arc::new(StreamManager::from_config(&configuration.subscription));
    let input: &'static [u8] = br#"{"url":"ws://reviews/graphql","body":{"query":"subscription { reviewAdded { id } }"}}"#;

    let cancellation = CancellationToken::new();
    let spawn_subscription = |sink: mpsc::Sender<Bytes>| {
        let ctx = Context::builder().cancellation(cancellation.child_token()).build();
        let (manager, factory) = (Arc::clone(&manager), Arc::clone(&factory));
        tokio::spawn(async move {
            resolve_subscription(&ctx, &manager, factory.as_ref(), input, &GRAPHQL, sink).await
        })
    };

    let (first_sink, mut first) = mpsc::channel(4);
    let (second_sink, mut second) = mpsc::channel(4);
    let tasks = vec![spawn_subscription(first_sink), spawn_subscription(second_sink)];

    eventually(|| manager.stream(input, factory.as_ref()).subscriber_count() == 2).await;
    eventually(|| events.opened.load(Ordering::SeqCst) == 1 && sender.receiver_count() == 1).await;

    sender
        .send(Bytes::from_static(br#"{"data":{"reviewAdded":{"id":"r1"}}}"#))
        .unwrap();
    let expected = json!({ "data": { "reviewAdded": { "id": "r1" } } });
    for received in [&mut first, &mut second] {
        let event: serde_json::Value =
            serde_json::from_slice(&received.recv().await.unwrap()).unwrap();
        assert_eq!(event, expected);
    }

    let stream = manager.stream(input, factory.as_ref());
    cancellation.cancel();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(stream.is_stopped());
    // the last subscription to leave took the stream out of the registry
    assert!(manager.is_empty());
    assert_eq!(manager.evict_idle(), 0);
    assert_eq!(events.opened.load(Ordering::SeqCst), 1);
}
