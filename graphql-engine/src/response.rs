use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::Error;
use crate::error::FetchError;

/// The merged result of a plan execution.
///
/// Data is kept as raw JSON per response key. Errors are kept as raw JSON
/// chunks, each holding one or more comma separated error objects.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Response {
    data: Vec<(String, Bytes)>,
    errors: Vec<Bytes>,
}

impl Response {
    pub(crate) fn insert(&mut self, key: String, value: Bytes) -> Result<(), FetchError> {
        if self.data.iter().any(|(existing, _)| *existing == key) {
            return Err(FetchError::ExecutionInternal {
                reason: format!("response key '{key}' is written by more than one fetch"),
            });
        }
        self.data.push((key, value));
        Ok(())
    }

    pub(crate) fn push_errors(&mut self, errors: Bytes) {
        if !errors.is_empty() {
            self.errors.push(errors);
        }
    }

    pub(crate) fn push_error(&mut self, error: &Error) {
        match serde_json::to_vec(error) {
            Ok(serialized) => self.errors.push(serialized.into()),
            Err(err) => tracing::error!(%err, "could not serialize a GraphQL error"),
        }
    }

    pub(crate) fn merge(&mut self, other: Response) -> Result<(), FetchError> {
        for (key, value) in other.data {
            self.insert(key, value)?;
        }
        self.errors.extend(other.errors);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.data
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Renders `{"data":{...},"errors":[...]}`. `errors` is omitted when empty.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(b"{\"data\":");
        if self.data.is_empty() {
            out.put_slice(b"null");
        } else {
            out.put_u8(b'{');
            for (index, (key, value)) in self.data.iter().enumerate() {
                if index > 0 {
                    out.put_u8(b',');
                }
                let key = serde_json::to_string(key).expect("a string always serializes; qed");
                out.put_slice(key.as_bytes());
                out.put_u8(b':');
                out.put_slice(value);
            }
            out.put_u8(b'}');
        }
        if !self.errors.is_empty() {
            out.put_slice(b",\"errors\":[");
            for (index, chunk) in self.errors.iter().enumerate() {
                if index > 0 {
                    out.put_u8(b',');
                }
                out.put_slice(chunk);
            }
            out.put_u8(b']');
        }
        out.put_u8(b'}');
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn renders_data_and_errors() {
        let mut response = Response::default();
        response
            .insert("me".to_string(), Bytes::from_static(br#"{"id":"1"}"#))
            .unwrap();
        response
            .insert("topProducts".to_string(), Bytes::from_static(b"null"))
            .unwrap();
        response.push_errors(Bytes::from_static(br#"{"message":"a"},{"message":"b"}"#));
        response.push_error(&FetchError::Cancelled.to_graphql_error(None));

        let rendered: serde_json::Value = serde_json::from_slice(&response.to_bytes()).unwrap();
        assert_eq!(
            rendered,
            json!({
                "data": { "me": { "id": "1" }, "topProducts": null },
                "errors": [
                    { "message": "a" },
                    { "message": "b" },
                    {
                        "message": "fetch was cancelled before a result was available",
                        "extensions": { "code": "FETCH_CANCELLED" }
                    }
                ]
            })
        );
    }

    #[test]
    fn empty_response_has_null_data() {
        assert_eq!(&Response::default().to_bytes()[..], br#"{"data":null}"#);
    }

    #[test]
    fn duplicate_keys_are_internal_errors() {
        let mut response = Response::default();
        response.insert("me".to_string(), Bytes::new()).unwrap();
        let err = response.insert("me".to_string(), Bytes::new()).unwrap_err();
        assert!(err.is_internal());
    }
}
