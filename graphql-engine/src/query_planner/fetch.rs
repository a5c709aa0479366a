use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use serde::Deserialize;
use serde::Serialize;
use serde_json::value::RawValue;
use tower::BoxError;

use crate::buf_pair::BufPair;
use crate::error::FetchError;

/// Something that can load bytes for a serialized input.
///
/// The sink may be written incrementally. Transport retries are the data
/// source's business, errors are propagated to the caller as they are.
#[async_trait::async_trait]
pub trait DataSource: Send + Sync + 'static {
    async fn load(&self, input: &[u8], out: &mut BytesMut) -> Result<(), BoxError>;
}

/// How the raw payload of a data source is turned into a [`BufPair`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessResponseConfig {
    /// Split a GraphQL response into its `data` and `errors` members.
    pub extract_graphql_response: bool,
    /// Narrow `data` down to `data._entities`.
    pub extract_federation_entities: bool,
}

/// A fetch node: one call to one data source.
#[derive(Clone)]
pub struct SingleFetch {
    /// The name of the service the fetch is querying.
    pub service_name: Arc<str>,
    pub data_source: Arc<dyn DataSource>,
    /// Opt out of single flight even when it is enabled on the fetcher (mutations, uploads).
    pub disallow_single_flight: bool,
    pub process_response: ProcessResponseConfig,
}

#[buildstructor::buildstructor]
impl SingleFetch {
    #[builder]
    pub fn new(
        service_name: String,
        data_source: Arc<dyn DataSource>,
        disallow_single_flight: Option<bool>,
        process_response: Option<ProcessResponseConfig>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            data_source,
            disallow_single_flight: disallow_single_flight.unwrap_or_default(),
            process_response: process_response.unwrap_or_default(),
        }
    }
}

impl fmt::Debug for SingleFetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFetch")
            .field("service_name", &self.service_name)
            .field("disallow_single_flight", &self.disallow_single_flight)
            .field("process_response", &self.process_response)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct GraphqlResponse<'a> {
    #[serde(borrow, default)]
    data: Option<&'a RawValue>,
    #[serde(borrow, default)]
    errors: Option<Vec<&'a RawValue>>,
}

#[derive(Deserialize)]
struct Entities<'a> {
    #[serde(borrow, default, rename = "_entities")]
    entities: Option<&'a RawValue>,
}

/// Writes a raw data source payload into `out` following `config`.
///
/// Errors are written as comma separated JSON objects, without the enclosing
/// brackets, so that the errors of several fetches can be concatenated.
pub(crate) fn extract_response(
    raw: &[u8],
    out: &mut BufPair,
    config: &ProcessResponseConfig,
) -> Result<(), FetchError> {
    if raw.is_empty() {
        return Ok(());
    }
    if !config.extract_graphql_response {
        out.write_data(raw);
        return Ok(());
    }

    let response: GraphqlResponse<'_> =
        serde_json::from_slice(raw).map_err(|err| FetchError::MalformedResponse {
            reason: err.to_string(),
        })?;

    // narrowed before anything is written, a malformed response leaves `out` untouched
    let data = match response.data {
        Some(data) if config.extract_federation_entities => {
            let entities: Entities<'_> = serde_json::from_str(data.get()).map_err(|err| {
                FetchError::MalformedResponse {
                    reason: err.to_string(),
                }
            })?;
            entities.entities
        }
        data => data,
    };

    if let Some(errors) = response.errors {
        for (index, error) in errors.iter().enumerate() {
            if index > 0 || out.has_errors() {
                out.write_errors(b",");
            }
            out.write_errors(error.get().as_bytes());
        }
    }
    if let Some(data) = data.filter(|data| data.get() != "null") {
        out.write_data(data.get().as_bytes());
    }

    Ok(())
}
