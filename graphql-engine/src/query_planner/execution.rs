use bytes::Bytes;
use futures::future::BoxFuture;
use futures::future::join_all;
use tracing::Instrument;

use super::PARALLEL_SPAN_NAME;
use super::PlanNode;
use super::SEQUENCE_SPAN_NAME;
use crate::buf_pair::BufPair;
use crate::context::Context;
use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::response::Response;

impl PlanNode {
    /// Execute the plan and return the merged [`Response`].
    ///
    /// A failing fetch only produces an error entry and a `null` value for its
    /// response key; its siblings are unaffected. Internal errors abort the
    /// whole execution.
    pub async fn execute(&self, fetcher: &Fetcher, ctx: &Context) -> Result<Response, FetchError> {
        tracing::trace!("executing plan:\n{:#?}", self);
        self.execute_recursively(fetcher, ctx).await
    }

    fn execute_recursively<'a>(
        &'a self,
        fetcher: &'a Fetcher,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<Response, FetchError>> {
        Box::pin(async move {
            let mut response = Response::default();

            match self {
                PlanNode::Sequence { nodes } => {
                    async {
                        for node in nodes {
                            let partial = node.execute_recursively(fetcher, ctx).await?;
                            response.merge(partial)?;
                        }
                        Ok::<_, FetchError>(())
                    }
                    .instrument(tracing::info_span!(
                        SEQUENCE_SPAN_NAME,
                        "otel.kind" = "INTERNAL",
                    ))
                    .await?;
                }
                PlanNode::Parallel { nodes } => {
                    let partials = join_all(
                        nodes
                            .iter()
                            .map(|node| node.execute_recursively(fetcher, ctx)),
                    )
                    .instrument(tracing::info_span!(
                        PARALLEL_SPAN_NAME,
                        "otel.kind" = "INTERNAL",
                    ))
                    .await;

                    for partial in partials {
                        response.merge(partial?)?;
                    }
                }
                PlanNode::Fetch {
                    response_key,
                    fetch,
                    input,
                } => {
                    let ctx = ctx.at(response_key.as_str());
                    let mut buf = BufPair::new();
                    let result = fetcher.fetch(&ctx, fetch, input, &mut buf).await;
                    record(&mut response, &ctx, response_key, &buf, result)?;
                }
                PlanNode::BatchFetch {
                    response_keys,
                    fetch,
                    inputs,
                } => {
                    if response_keys.len() != inputs.len() {
                        return Err(FetchError::ExecutionInternal {
                            reason: format!(
                                "batch fetch to '{}' has {} response keys for {} inputs",
                                fetch.fetch.service_name,
                                response_keys.len(),
                                inputs.len()
                            ),
                        });
                    }

                    let inputs: Vec<&[u8]> = inputs.iter().map(Bytes::as_ref).collect();
                    let mut outputs = vec![BufPair::new(); inputs.len()];
                    let result = fetcher.fetch_batch(ctx, fetch, &inputs, &mut outputs).await;

                    for (response_key, output) in response_keys.iter().zip(&outputs) {
                        record(
                            &mut response,
                            &ctx.at(response_key.as_str()),
                            response_key,
                            output,
                            result.clone(),
                        )?;
                    }
                }
            }

            Ok(response)
        })
    }
}

fn record(
    response: &mut Response,
    ctx: &Context,
    response_key: &str,
    buf: &BufPair,
    result: Result<(), FetchError>,
) -> Result<(), FetchError> {
    let data = if buf.has_data() {
        Bytes::copy_from_slice(&buf.data)
    } else {
        Bytes::from_static(b"null")
    };
    response.insert(response_key.to_string(), data)?;
    response.push_errors(Bytes::copy_from_slice(&buf.errors));

    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_internal() => Err(err),
        Err(err) => {
            tracing::debug!(path = %ctx.path(), %err, "fetch failed");
            response.push_error(&err.to_graphql_error(Some(ctx.path().clone())));
            Ok(())
        }
    }
}
