use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// Ordered key/value parameters for a query command.
///
/// Keys keep insertion order so adapters can serialize them as given.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.pairs.push((key.to_string(), value.to_string()));
        self
    }

    /// Adds `key` only when `value` is present.
    ///
    /// `None` leaves the field out entirely, which the server treats
    /// differently from an empty string.
    pub fn with_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// One record of a query response.
pub type QueryRecord = BTreeMap<String, String>;

/// Parsed response of a query command: zero or more records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryResponse {
    pub records: Vec<QueryRecord>,
}

impl QueryResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(record: QueryRecord) -> Self {
        Self {
            records: vec![record],
        }
    }

    /// Value of `key` in the first record.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.records
            .first()
            .and_then(|r| r.get(key))
            .map(String::as_str)
    }
}

/// A raw server notification (`notifyclientmoved` etc.) with its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Event name without the `notify` prefix, e.g. `clientmoved`.
    pub name: String,
    pub payload: QueryRecord,
}

impl Notification {
    pub fn new(name: &str, payload: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            payload: payload
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }
}

/// Port for the query-protocol connection.
///
/// Adapters own the socket, correlate requests with responses and deliver
/// notifications. The session holds the only reference.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    /// Issue `command` and wait for its response.
    ///
    /// `fields` narrows the response to the listed keys when non-empty.
    async fn request(
        &self,
        command: &str,
        params: QueryParams,
        fields: &[&str],
    ) -> Result<QueryResponse>;

    /// Hand out the notification stream. Only the first call returns `Some`.
    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>>;

    /// Close the connection (`quit`).
    async fn close(&self) -> Result<()>;
}
