//! Connector contracts.
//!
//! A connector yields documents from an external source as a lazy stream of
//! batches. There are three input types:
//!
//! | Input type | Entry point | Driven by |
//! |------------|-------------|-----------|
//! | `load_state` | [`LoadConnector::load_from_state`] | runner, full snapshot |
//! | `poll` | [`PollConnector::poll_source`] | runner, time window |
//! | `event` | [`EventConnector::handle_event`] | external webhooks only |
//!
//! All three share [`Credentialed::load_credentials`]. The runner works with
//! the tagged [`ConnectorHandle`] and dispatches on the tag.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Document;

/// Lazy sequence of document batches.
pub type DocumentBatches<'a> = BoxStream<'a, Result<Vec<Document>>>;

/// How a connector is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    LoadState,
    Poll,
    Event,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::LoadState => "load_state",
            InputType::Poll => "poll",
            InputType::Event => "event",
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "load_state" => Ok(InputType::LoadState),
            "poll" => Ok(InputType::Poll),
            "event" => Ok(InputType::Event),
            other => bail!("Unknown input type: '{}'", other),
        }
    }
}

/// Credential handling shared by every connector.
#[async_trait]
pub trait Credentialed: Send {
    /// Attach credentials. Returns a replacement blob to persist when the
    /// connector refreshed them (e.g. a rotated token).
    async fn load_credentials(&mut self, credentials: &Value) -> Result<Option<Value>>;
}

pub trait LoadConnector: Credentialed {
    /// Everything the source currently holds.
    fn load_from_state(&mut self) -> DocumentBatches<'_>;
}

pub trait PollConnector: Credentialed {
    /// Documents changed in `[start, end]`.
    fn poll_source(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> DocumentBatches<'_>;
}

pub trait EventConnector: Credentialed {
    fn handle_event(&mut self, event: Value) -> DocumentBatches<'_>;
}

/// A constructed connector, tagged with its input type.
pub enum ConnectorHandle {
    Load(Box<dyn LoadConnector>),
    Poll(Box<dyn PollConnector>),
    Event(Box<dyn EventConnector>),
}

impl ConnectorHandle {
    pub fn input_type(&self) -> InputType {
        match self {
            ConnectorHandle::Load(_) => InputType::LoadState,
            ConnectorHandle::Poll(_) => InputType::Poll,
            ConnectorHandle::Event(_) => InputType::Event,
        }
    }

    pub async fn load_credentials(&mut self, credentials: &Value) -> Result<Option<Value>> {
        match self {
            ConnectorHandle::Load(c) => c.load_credentials(credentials).await,
            ConnectorHandle::Poll(c) => c.load_credentials(credentials).await,
            ConnectorHandle::Event(c) => c.load_credentials(credentials).await,
        }
    }

    /// Batches for a scheduled run. `None` for event connectors, which are
    /// fed out of band.
    pub fn scheduled_batches(
        &mut self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Option<DocumentBatches<'_>> {
        match self {
            ConnectorHandle::Load(c) => Some(c.load_from_state()),
            ConnectorHandle::Poll(c) => Some(c.poll_source(window_start, window_end)),
            ConnectorHandle::Event(_) => None,
        }
    }
}

/// Connector over a fixed list of batches.
///
/// As a poll connector it yields only documents whose `updated_at` falls
/// in the window (documents without a timestamp always qualify).
#[derive(Debug, Clone, Default)]
pub struct StaticConnector {
    batches: Vec<Vec<Document>>,
    credentials: Option<Value>,
}

impl StaticConnector {
    pub fn new(batches: Vec<Vec<Document>>) -> Self {
        Self {
            batches,
            credentials: None,
        }
    }

    pub fn credentials(&self) -> Option<&Value> {
        self.credentials.as_ref()
    }
}

#[async_trait]
impl Credentialed for StaticConnector {
    async fn load_credentials(&mut self, credentials: &Value) -> Result<Option<Value>> {
        self.credentials = Some(credentials.clone());
        Ok(None)
    }
}

impl LoadConnector for StaticConnector {
    fn load_from_state(&mut self) -> DocumentBatches<'_> {
        stream::iter(self.batches.clone().into_iter().map(Ok)).boxed()
    }
}

impl PollConnector for StaticConnector {
    fn poll_source(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> DocumentBatches<'_> {
        let batches: Vec<Vec<Document>> = self
            .batches
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .filter(|d| d.updated_at.map_or(true, |t| t >= start && t <= end))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|batch| !batch.is_empty())
            .collect();
        stream::iter(batches.into_iter().map(Ok)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentSource, Section};
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use std::collections::BTreeMap;

    fn doc(id: &str, updated_at: Option<DateTime<Utc>>) -> Document {
        Document {
            id: id.to_string(),
            sections: vec![Section::new("https://x", "text")],
            source: DocumentSource::File,
            semantic_identifier: id.to_string(),
            metadata: BTreeMap::new(),
            updated_at,
        }
    }

    #[test]
    fn test_input_type_roundtrip() {
        for t in [InputType::LoadState, InputType::Poll, InputType::Event] {
            assert_eq!(t.as_str().parse::<InputType>().unwrap(), t);
        }
        assert!("push".parse::<InputType>().is_err());
    }

    #[tokio::test]
    async fn test_load_yields_all_batches() {
        let mut handle = ConnectorHandle::Load(Box::new(StaticConnector::new(vec![
            vec![doc("a", None)],
            vec![doc("b", None), doc("c", None)],
        ])));
        let now = Utc::now();
        let batches: Vec<Vec<Document>> = handle
            .scheduled_batches(now, now)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 2);
    }

    #[tokio::test]
    async fn test_poll_filters_by_window() {
        let t = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        let mut handle = ConnectorHandle::Poll(Box::new(StaticConnector::new(vec![vec![
            doc("old", Some(t(1))),
            doc("new", Some(t(5))),
            doc("undated", None),
        ]])));
        let batches: Vec<Vec<Document>> = handle
            .scheduled_batches(t(3), t(6))
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<&str> = batches[0].iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "undated"]);
    }

    #[tokio::test]
    async fn test_credentials_reach_connector() {
        let mut handle = ConnectorHandle::Load(Box::new(StaticConnector::default()));
        let refreshed = handle
            .load_credentials(&serde_json::json!({"token": "t"}))
            .await
            .unwrap();
        assert!(refreshed.is_none());
    }
}
