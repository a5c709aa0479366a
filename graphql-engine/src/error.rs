//! Engine errors.
use displaydoc::Display;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::context::Path;

/// Error types for fetch execution.
///
/// These are not returned to the client as such, they are converted to JSON
/// error entries with [`FetchError::to_graphql_error`].
#[derive(Error, Display, Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
pub enum FetchError {
    /// HTTP fetch failed from '{service}': {reason}
    ///
    /// note that this relates to a transport error and not a GraphQL error
    SubrequestHttpError {
        /// The service failed.
        service: String,

        /// The reason the fetch failed.
        reason: String,
    },

    /// fetch was cancelled before a result was available
    Cancelled,

    /// Batching error for '{service}': {reason}
    SubrequestBatchingError {
        /// The service for which batch processing failed.
        service: String,

        /// The reason batch processing failed.
        reason: String,
    },

    /// response was malformed: {reason}
    MalformedResponse {
        /// The reason the deserialization failed.
        reason: String,
    },

    /// no buffer available: {reason}
    PoolExhausted { reason: String },

    /// internal error while executing the plan: {reason}
    ExecutionInternal { reason: String },
}

impl FetchError {
    /// Cancellation is the only error a caller may want to retry as a whole.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }

    /// Internal errors stop the enclosing execution instead of becoming a partial error.
    pub fn is_internal(&self) -> bool {
        matches!(self, FetchError::ExecutionInternal { .. })
    }

    pub fn extension_code(&self) -> &'static str {
        match self {
            FetchError::SubrequestHttpError { .. } => "SUBREQUEST_HTTP_ERROR",
            FetchError::Cancelled => "FETCH_CANCELLED",
            FetchError::SubrequestBatchingError { .. } => "SUBREQUEST_BATCHING_ERROR",
            FetchError::MalformedResponse { .. } => "MALFORMED_RESPONSE",
            FetchError::PoolExhausted { .. } => "POOL_EXHAUSTED",
            FetchError::ExecutionInternal { .. } => "EXECUTION_INTERNAL",
        }
    }

    /// Convert the fetch error to a GraphQL error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> Error {
        let mut extensions = Map::new();
        extensions.insert("code".to_string(), self.extension_code().into());
        match self {
            FetchError::SubrequestHttpError { service, .. }
            | FetchError::SubrequestBatchingError { service, .. } => {
                extensions.insert("service".to_string(), service.clone().into());
            }
            _ => (),
        }

        Error {
            message: self.to_string(),
            path,
            extensions,
        }
    }
}

/// A GraphQL error entry as it appears in the `errors` array of a response.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Error {
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<Path>,

    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub extensions: Map<String, Value>,
}

/// Error types for subscriptions.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubscriptionError {
    /// could not open upstream event source: {reason}
    UpstreamOpen { reason: String },

    /// the stream was stopped
    Closed,
}
