//! Executes fetch nodes against their data source.
//!
//! Concurrent fetches presenting the same serialized input can share a
//! single upstream call ("single flight"). The first caller for a key spawns
//! the load and registers it in the in-flight map; later callers subscribe to
//! its completion. The entry is removed as soon as the load completes, so the
//! next identical fetch does fresh work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::Instrument;
use xxhash_rust::xxh64::xxh64;

use crate::buf_pair::BufPair;
use crate::buf_pair::BufPairPool;
use crate::buf_pair::PooledBufPair;
use crate::configuration::DEFAULT_BUFFER_POOL_MAX_SIZE;
use crate::configuration::FetchConfig;
use crate::context::Context;
use crate::error::FetchError;
use crate::hooks::FetchHooks;
use crate::hooks::HookContext;
use crate::hooks::report_failure;
use crate::query_planner::BatchFetch;
use crate::query_planner::SingleFetch;
use crate::query_planner::fetch::extract_response;

pub(crate) const FETCH_SPAN_NAME: &str = "fetch";
pub(crate) const BATCH_FETCH_SPAN_NAME: &str = "batch_fetch";

/// Outcome of one shared load. The pooled buffer goes back to its pool once
/// the last waiter dropped its reference.
struct InflightResult {
    buf: Option<PooledBufPair>,
    error: Option<FetchError>,
}

type InflightSignal = watch::Receiver<Option<Arc<InflightResult>>>;
type InflightMap = Arc<Mutex<HashMap<u64, InflightSignal>>>;

/// Removes the in-flight entry even if the load task unwinds.
struct InflightGuard {
    map: InflightMap,
    key: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.map.lock().remove(&self.key);
    }
}

enum Flight {
    Owner(watch::Sender<Option<Arc<InflightResult>>>, InflightSignal),
    Waiter(InflightSignal),
}

#[derive(Clone)]
pub struct Fetcher {
    enable_single_flight: bool,
    buf_pair_pool: BufPairPool,
    inflight: InflightMap,
}

#[buildstructor::buildstructor]
impl Fetcher {
    #[builder]
    pub fn new(
        enable_single_flight: Option<bool>,
        buffer_pool_max_size: Option<usize>,
        buffer_pool_wait_timeout: Option<Duration>,
    ) -> Self {
        Self {
            enable_single_flight: enable_single_flight.unwrap_or(true),
            buf_pair_pool: BufPairPool::new(
                buffer_pool_max_size.unwrap_or(DEFAULT_BUFFER_POOL_MAX_SIZE),
                buffer_pool_wait_timeout,
            ),
            inflight: Default::default(),
        }
    }
}

impl Fetcher {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(
            Some(config.single_flight),
            Some(config.buffer_pool_max_size),
            config.buffer_pool_wait_timeout,
        )
    }

    pub fn single_flight_enabled(&self) -> bool {
        self.enable_single_flight
    }

    pub fn buf_pair_pool(&self) -> &BufPairPool {
        &self.buf_pair_pool
    }

    /// Number of distinct loads currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Loads `input` through the data source of `fetch` and appends the
    /// result to `out`.
    ///
    /// Data source errors are returned as they are, never retried. A cancelled
    /// context returns [`FetchError::Cancelled`] right away, without aborting a
    /// load other callers may be sharing.
    pub async fn fetch(
        &self,
        ctx: &Context,
        fetch: &SingleFetch,
        input: &[u8],
        out: &mut BufPair,
    ) -> Result<(), FetchError> {
        if let Some(hooks) = ctx.hooks() {
            report_failure(
                "on_before_fetch",
                hooks.on_before_fetch(&ctx.hook_context(), input),
            );
        }

        let span = tracing::info_span!(
            FETCH_SPAN_NAME,
            "service.name" = %fetch.service_name,
            path = %ctx.path(),
        );

        if !self.enable_single_flight || fetch.disallow_single_flight {
            return self.fetch_direct(ctx, fetch, input, out).instrument(span).await;
        }

        self.fetch_single_flight(ctx, fetch, input, out)
            .instrument(span)
            .await
    }

    async fn fetch_direct(
        &self,
        ctx: &Context,
        fetch: &SingleFetch,
        input: &[u8],
        out: &mut BufPair,
    ) -> Result<(), FetchError> {
        let mut scratch = BytesMut::new();

        let result = tokio::select! {
            biased;
            // a cancelled caller gets no after-fetch hook, nothing was loaded for it
            _ = ctx.cancellation().cancelled() => return Err(FetchError::Cancelled),
            result = load(fetch, input, &mut scratch, out) => result,
        };

        after_fetch(ctx.hooks(), &ctx.hook_context(), out, false);
        result
    }

    async fn fetch_single_flight(
        &self,
        ctx: &Context,
        fetch: &SingleFetch,
        input: &[u8],
        out: &mut BufPair,
    ) -> Result<(), FetchError> {
        let key = xxh64(input, 0);

        let flight = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(signal) => Flight::Waiter(signal.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key, rx.clone());
                    Flight::Owner(tx, rx)
                }
            }
        };

        let (signal, single_flight) = match flight {
            Flight::Owner(tx, rx) => {
                self.spawn_load(ctx, fetch, input, key, tx);
                (rx, false)
            }
            Flight::Waiter(rx) => {
                tracing::debug!(key, "joining in-flight fetch");
                (rx, true)
            }
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => return Err(FetchError::Cancelled),
            result = wait_for_result(signal)
                .instrument(tracing::info_span!("fetch::single_flight wait")) => result?,
        };

        if let Some(buf) = &result.buf {
            // the owner's hooks were already invoked by the load task
            if single_flight {
                after_fetch(ctx.hooks(), &ctx.hook_context(), buf, true);
            }
            out.extend_from(buf);
        }

        match &result.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// The load runs detached so that a cancelled owner does not strand the
    /// callers waiting on it.
    fn spawn_load(
        &self,
        ctx: &Context,
        fetch: &SingleFetch,
        input: &[u8],
        key: u64,
        tx: watch::Sender<Option<Arc<InflightResult>>>,
    ) {
        let guard = InflightGuard {
            map: self.inflight.clone(),
            key,
        };
        let pool = self.buf_pair_pool.clone();
        let fetch = fetch.clone();
        let input = Bytes::copy_from_slice(input);
        let hooks = ctx.hooks().cloned();
        let hook_context = ctx.hook_context();

        tokio::spawn(
            async move {
                let result = match pool.get().await {
                    Ok(mut buf) => {
                        let mut scratch = BytesMut::new();
                        let error = load(&fetch, &input, &mut scratch, &mut buf).await.err();
                        after_fetch(hooks.as_ref(), &hook_context, &buf, false);
                        InflightResult {
                            buf: Some(buf),
                            error,
                        }
                    }
                    Err(error) => InflightResult {
                        buf: None,
                        error: Some(error),
                    },
                };

                // the key must be free before anyone observes the result
                drop(guard);
                tx.send_replace(Some(Arc::new(result)));
            }
            .in_current_span(),
        );
    }

    /// Combines `inputs` into one upstream call and splits the response back
    /// into `outputs`, in input order.
    ///
    /// When demultiplexing fails every output is reset, none of them can be trusted.
    pub async fn fetch_batch(
        &self,
        ctx: &Context,
        fetch: &BatchFetch,
        inputs: &[&[u8]],
        outputs: &mut [BufPair],
    ) -> Result<(), FetchError> {
        if inputs.len() != outputs.len() {
            return Err(FetchError::ExecutionInternal {
                reason: format!(
                    "batch fetch to '{}' has {} inputs but {} outputs",
                    fetch.fetch.service_name,
                    inputs.len(),
                    outputs.len()
                ),
            });
        }

        let span = tracing::info_span!(
            BATCH_FETCH_SPAN_NAME,
            "service.name" = %fetch.fetch.service_name,
            batch_size = inputs.len(),
        );

        async {
            let batch = fetch
                .batch_factory
                .create_batch(inputs)
                .map_err(|err| batching_error(&fetch.fetch, err.to_string()))?;

            // the shared load takes the pooled pair, holding a second one here could starve it
            let mut buf = BufPair::new();
            self.fetch(ctx, &fetch.fetch, batch.input(), &mut buf)
                .await?;

            if let Err(err) = batch.demultiplex(&buf, outputs) {
                outputs.iter_mut().for_each(BufPair::reset);
                return Err(batching_error(&fetch.fetch, err.to_string()));
            }
            Ok(())
        }
        .instrument(span)
        .await
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::builder().build()
    }
}

async fn load(
    fetch: &SingleFetch,
    input: &[u8],
    scratch: &mut BytesMut,
    out: &mut BufPair,
) -> Result<(), FetchError> {
    let loaded = fetch.data_source.load(input, scratch).await;
    // whatever was written is kept even if the load failed
    let extracted = extract_response(scratch, out, &fetch.process_response);

    loaded.map_err(|err| FetchError::SubrequestHttpError {
        service: fetch.service_name.to_string(),
        reason: err.to_string(),
    })?;
    extracted
}

async fn wait_for_result(mut signal: InflightSignal) -> Result<Arc<InflightResult>, FetchError> {
    match signal.wait_for(Option::is_some).await {
        Ok(result) => Ok(result
            .clone()
            .expect("wait_for only returns once the value is set; qed")),
        Err(_) => Err(FetchError::ExecutionInternal {
            reason: "in-flight fetch ended without a result".to_string(),
        }),
    }
}

fn after_fetch(
    hooks: Option<&Arc<dyn FetchHooks>>,
    hook_context: &HookContext,
    buf: &BufPair,
    single_flight: bool,
) {
    let Some(hooks) = hooks else {
        return;
    };
    if buf.has_data() {
        report_failure("on_data", hooks.on_data(hook_context, &buf.data, single_flight));
    }
    if buf.has_errors() {
        report_failure(
            "on_error",
            hooks.on_error(hook_context, &buf.errors, single_flight),
        );
    }
}

fn batching_error(fetch: &SingleFetch, reason: String) -> FetchError {
    FetchError::SubrequestBatchingError {
        service: fetch.service_name.to_string(),
        reason,
    }
}
