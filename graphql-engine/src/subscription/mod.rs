//! Subscription fan-out: one upstream [`Stream`] shared by many subscribers.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tower::BoxError;
use tracing::Instrument;

use crate::buf_pair::BufPair;
use crate::configuration::SubscriptionConfig;
use crate::context::Context;
use crate::error::SubscriptionError;
use crate::query_planner::ProcessResponseConfig;
use crate::query_planner::fetch::extract_response;

mod manager;
mod stream;
mod subscriber;
mod trigger;

pub use self::manager::StreamManager;
pub use self::stream::Stream;
pub use self::stream::StreamState;
pub use self::subscriber::Subscriber;
pub use self::subscriber::SubscriberHandle;
pub use self::trigger::Trigger;

pub(crate) const STREAM_SPAN_NAME: &str = "subscription_stream";
pub(crate) const SUBSCRIPTION_SPAN_NAME: &str = "subscription";

/// How many times a subscription looks up a fresh stream when the one it got
/// stopped before it could attach.
const ATTACH_ATTEMPTS: usize = 3;

/// An upstream producing subscription events, such as a websocket connection
/// or a message broker consumer.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Opens the upstream for `input`. The returned stream ends when the
    /// upstream closes.
    async fn open(&self, input: &[u8]) -> Result<BoxStream<'static, Bytes>, BoxError>;
}

/// Builds streams for subscription inputs.
pub trait StreamFactory: Send + Sync {
    /// Creates a stream for `input` without opening its upstream.
    fn stream(&self, input: &[u8]) -> Arc<Stream>;

    /// Subscriptions with the same identifier share one stream.
    fn unique_identifier(&self, input: &[u8]) -> Vec<u8>;
}

/// A [`StreamFactory`] opening every stream on the same [`EventSource`].
///
/// Inputs of the form `{"url": ..., "body": ...}` are identified by their url
/// and body, so identical operations sent to the same upstream share a stream.
/// Other inputs are identified by their raw bytes.
pub struct EventSourceStreamFactory {
    source: Arc<dyn EventSource>,
    config: SubscriptionConfig,
}

#[derive(Deserialize)]
struct UpstreamInput<'a> {
    url: String,
    #[serde(borrow)]
    body: Option<&'a RawValue>,
}

impl EventSourceStreamFactory {
    pub fn new(source: Arc<dyn EventSource>, config: SubscriptionConfig) -> Self {
        EventSourceStreamFactory { source, config }
    }
}

impl StreamFactory for EventSourceStreamFactory {
    fn stream(&self, input: &[u8]) -> Arc<Stream> {
        Arc::new(
            Stream::builder()
                .input(Bytes::copy_from_slice(input))
                .source(Arc::clone(&self.source))
                .queue_capacity(self.config.queue_capacity)
                .idle_stream(self.config.idle_stream)
                .build(),
        )
    }

    fn unique_identifier(&self, input: &[u8]) -> Vec<u8> {
        match serde_json::from_slice::<UpstreamInput<'_>>(input) {
            Ok(upstream) => {
                let mut identifier = upstream.url.into_bytes();
                if let Some(body) = upstream.body {
                    identifier.push(0);
                    identifier.extend_from_slice(body.get().as_bytes());
                }
                identifier
            }
            Err(_) => input.to_vec(),
        }
    }
}

/// Attaches a subscription for `input` and writes every event, rendered as a
/// GraphQL response, to `sink`.
///
/// Returns once the context is cancelled, `sink` is closed or the stream
/// stopped. A stream that could not open its upstream is reported as
/// [`SubscriptionError::UpstreamOpen`].
pub async fn resolve_subscription(
    ctx: &Context,
    manager: &StreamManager,
    factory: &dyn StreamFactory,
    input: &[u8],
    process_response: &ProcessResponseConfig,
    sink: mpsc::Sender<Bytes>,
) -> Result<(), SubscriptionError> {
    let (stream, registration) = attach(manager, factory, input)?;
    let (mut subscriber, handle) = Subscriber::new(ctx.cancellation());

    let forwarding = {
        let stream = Arc::clone(&stream);
        tokio::spawn(async move { stream.forward(registration, &handle).await })
    };

    let mut buf = BufPair::new();
    async {
        while let Some(event) = subscriber.next(ctx.cancellation()).await {
            buf.reset();
            if let Err(err) = extract_response(&event, &mut buf, process_response) {
                tracing::debug!(%err, "malformed subscription event");
                buf.reset();
                match serde_json::to_vec(&err.to_graphql_error(Some(ctx.path().clone()))) {
                    Ok(error) => buf.write_errors(&error),
                    Err(err) => {
                        tracing::error!(%err, "could not serialize a GraphQL error");
                        continue;
                    }
                }
            }
            let sent = tokio::select! {
                biased;
                _ = ctx.cancellation().cancelled() => break,
                sent = sink.send(render(&buf)) => sent,
            };
            if sent.is_err() {
                break;
            }
        }
    }
    .instrument(tracing::info_span!(SUBSCRIPTION_SPAN_NAME, path = %ctx.path()))
    .await;

    subscriber.stop();
    if let Err(err) = forwarding.await {
        tracing::error!(%err, "subscription forwarding task failed");
    }
    // detached by now, an evicted or closed stream leaves the registry
    manager.release(input, factory, &stream);

    match stream.error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn attach(
    manager: &StreamManager,
    factory: &dyn StreamFactory,
    input: &[u8],
) -> Result<(Arc<Stream>, stream::Registration), SubscriptionError> {
    let mut last = SubscriptionError::Closed;
    for _ in 0..ATTACH_ATTEMPTS {
        let stream = manager.stream(input, factory);
        match stream.register() {
            Ok(registration) => return Ok((stream, registration)),
            Err(err) => last = stream.error().unwrap_or(err),
        }
    }
    Err(last)
}

/// Renders `{"data":...,"errors":[...]}`, `errors` only when present.
fn render(buf: &BufPair) -> Bytes {
    let mut out = BytesMut::with_capacity(buf.data.len() + buf.errors.len() + 24);
    out.put_slice(b"{\"data\":");
    if buf.has_data() {
        out.put_slice(&buf.data);
    } else {
        out.put_slice(b"null");
    }
    if buf.has_errors() {
        out.put_slice(b",\"errors\":[");
        out.put_slice(&buf.errors);
        out.put_u8(b']');
    }
    out.put_u8(b'}');
    out.freeze()
}
