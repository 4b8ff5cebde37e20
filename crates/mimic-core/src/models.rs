//! Core data models that flow through indexing and retrieval.
//!
//! A [`Document`] is produced by a connector and never mutated. The chunker
//! turns it into [`Chunk`]s, the embedder into [`EmbeddedChunk`]s, and
//! searches hand back [`InferenceChunk`]s. Every stored chunk carries an
//! [`Acl`]; all chunks of one document share the same one.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Sentinel in `allowed_users` meaning "anyone may read".
pub const PUBLIC_ACL: &str = "PUBLIC";

/// Where a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentSource {
    Web,
    GoogleDrive,
    Github,
    Slack,
    Notion,
    Jira,
    Linear,
    Confluence,
    /// Ad-hoc uploads and local files.
    File,
}

impl DocumentSource {
    pub const ALL: [DocumentSource; 9] = [
        DocumentSource::Web,
        DocumentSource::GoogleDrive,
        DocumentSource::Github,
        DocumentSource::Slack,
        DocumentSource::Notion,
        DocumentSource::Jira,
        DocumentSource::Linear,
        DocumentSource::Confluence,
        DocumentSource::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentSource::Web => "web",
            DocumentSource::GoogleDrive => "google_drive",
            DocumentSource::Github => "github",
            DocumentSource::Slack => "slack",
            DocumentSource::Notion => "notion",
            DocumentSource::Jira => "jira",
            DocumentSource::Linear => "linear",
            DocumentSource::Confluence => "confluence",
            DocumentSource::File => "file",
        }
    }
}

impl fmt::Display for DocumentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match DocumentSource::ALL.iter().find(|src| src.as_str() == s) {
            Some(src) => Ok(*src),
            None => bail!("Unknown document source: '{}'", s),
        }
    }
}

/// A contiguous piece of a document with the link that points at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub link: String,
    pub text: String,
}

impl Section {
    pub fn new(link: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            text: text.into(),
        }
    }
}

/// A source document as yielded by a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier: canonical URL or content hash.
    pub id: String,
    pub sections: Vec<Section>,
    pub source: DocumentSource,
    /// Human-readable name (title, file name, channel name).
    pub semantic_identifier: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A retrieval-sized slice of a document.
///
/// `source_links` maps a byte offset into `content` to the link of the
/// section whose text starts there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub document_id: String,
    pub chunk_id: usize,
    pub content: String,
    pub blurb: String,
    pub source_links: BTreeMap<usize, String>,
    pub section_continuation: bool,
    pub source_type: DocumentSource,
    pub semantic_identifier: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Sub-windows embedded separately; empty unless mini-chunk mode is on.
    #[serde(default)]
    pub mini_chunks: Vec<String>,
}

/// A chunk plus its embeddings: the full content first, then one vector
/// per mini-chunk in order.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embeddings: Vec<Vec<f32>>,
}

/// Which index produced a search hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Semantic,
    Keyword,
}

/// A chunk as returned by a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceChunk {
    pub document_id: String,
    pub chunk_id: usize,
    pub content: String,
    pub blurb: String,
    pub source_links: BTreeMap<usize, String>,
    pub section_continuation: bool,
    pub source_type: DocumentSource,
    pub semantic_identifier: String,
    pub metadata: BTreeMap<String, String>,
    /// Backend score: cosine similarity or lexical score.
    pub score: Option<f64>,
    /// Cross-encoder relevance, once reranked.
    pub rerank_score: Option<f64>,
    pub search_type: SearchType,
}

impl InferenceChunk {
    pub fn from_chunk(chunk: &Chunk, search_type: SearchType, score: Option<f64>) -> Self {
        Self {
            document_id: chunk.document_id.clone(),
            chunk_id: chunk.chunk_id,
            content: chunk.content.clone(),
            blurb: chunk.blurb.clone(),
            source_links: chunk.source_links.clone(),
            section_continuation: chunk.section_continuation,
            source_type: chunk.source_type,
            semantic_identifier: chunk.semantic_identifier.clone(),
            metadata: chunk.metadata.clone(),
            score,
            rerank_score: None,
            search_type,
        }
    }
}

/// Access-control payload stored with every chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub allowed_users: BTreeSet<String>,
    pub allowed_groups: BTreeSet<String>,
}

impl Acl {
    /// ACL for a first write by `user` (`None` means public).
    pub fn for_user(user: Option<&str>) -> Self {
        let mut allowed_users = BTreeSet::new();
        allowed_users.insert(user.unwrap_or(PUBLIC_ACL).to_string());
        Self {
            allowed_users,
            allowed_groups: BTreeSet::new(),
        }
    }

    /// ACL for a re-write: the stored users plus `user`, groups kept.
    pub fn merged_with_user(&self, user: Option<&str>) -> Self {
        let mut merged = self.clone();
        merged
            .allowed_users
            .insert(user.unwrap_or(PUBLIC_ACL).to_string());
        merged
    }

    /// Whether `user` may read a chunk carrying this ACL.
    pub fn permits(&self, user: Option<&str>) -> bool {
        if self.allowed_users.contains(PUBLIC_ACL) {
            return true;
        }
        match user {
            Some(u) => self.allowed_users.contains(u),
            None => false,
        }
    }
}

/// Optional restrictions applied on top of the ACL filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexFilters {
    #[serde(default)]
    pub source_types: Option<Vec<DocumentSource>>,
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
}

impl IndexFilters {
    /// Reject filters that name an empty set; they are programmer errors.
    pub fn validate(&self) -> Result<(), CoreError> {
        if matches!(&self.source_types, Some(s) if s.is_empty()) {
            return Err(CoreError::InvalidFilter(
                "source_types must not be empty when present".to_string(),
            ));
        }
        if matches!(&self.document_ids, Some(d) if d.is_empty()) {
            return Err(CoreError::InvalidFilter(
                "document_ids must not be empty when present".to_string(),
            ));
        }
        Ok(())
    }

    pub fn matches(&self, source_type: DocumentSource, document_id: &str) -> bool {
        if let Some(sources) = &self.source_types {
            if !sources.contains(&source_type) {
                return false;
            }
        }
        if let Some(ids) = &self.document_ids {
            if !ids.iter().any(|id| id == document_id) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_roundtrip_through_str() {
        for src in DocumentSource::ALL {
            assert_eq!(src.as_str().parse::<DocumentSource>().unwrap(), src);
        }
        assert!("sharepoint".parse::<DocumentSource>().is_err());
    }

    #[test]
    fn test_acl_public_when_no_user() {
        let acl = Acl::for_user(None);
        assert!(acl.allowed_users.contains(PUBLIC_ACL));
        assert!(acl.permits(None));
        assert!(acl.permits(Some("anyone")));
    }

    #[test]
    fn test_acl_private_user() {
        let acl = Acl::for_user(Some("u2"));
        assert!(acl.permits(Some("u2")));
        assert!(!acl.permits(Some("u1")));
        assert!(!acl.permits(None));
    }

    #[test]
    fn test_acl_merge_is_union() {
        let mut acl = Acl::for_user(Some("u1"));
        acl.allowed_groups.insert("eng".to_string());
        let merged = acl.merged_with_user(Some("u2"));
        assert!(merged.allowed_users.contains("u1"));
        assert!(merged.allowed_users.contains("u2"));
        assert!(merged.allowed_groups.contains("eng"));
        assert_eq!(merged.merged_with_user(Some("u2")), merged);
    }

    #[test]
    fn test_filters_validate() {
        assert!(IndexFilters::default().validate().is_ok());
        let bad = IndexFilters {
            source_types: Some(vec![]),
            document_ids: None,
        };
        assert!(matches!(bad.validate(), Err(CoreError::InvalidFilter(_))));
    }

    #[test]
    fn test_filters_match() {
        let filters = IndexFilters {
            source_types: Some(vec![DocumentSource::Slack]),
            document_ids: None,
        };
        assert!(filters.matches(DocumentSource::Slack, "d1"));
        assert!(!filters.matches(DocumentSource::Web, "d1"));
    }
}
