//! Local filesystem connector (source `file`).
//!
//! Walks `root`, keeps files matching `include_globs` and not matching
//! `exclude_globs` (plus the default `.git`, `target` and `node_modules`
//! excludes), and turns each into a [`Document`]. Markdown files are split
//! into one section per heading, linked as `file://<path>#<anchor>`; other
//! files become a single section.
//!
//! As a poll connector it yields only files whose modification time falls
//! inside the window.
//!
//! ```json
//! {"root": "./docs", "include_globs": ["**/*.md"], "exclude_globs": ["drafts/**"]}
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use mimic_core::connector::{Credentialed, DocumentBatches, LoadConnector, PollConnector};
use mimic_core::models::{Document, DocumentSource, Section};

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Clone)]
struct ScannedFile {
    path: PathBuf,
    relative: String,
    modified: DateTime<Utc>,
}

pub struct FilesystemConnector {
    config: FilesystemConfig,
    include: GlobSet,
    exclude: GlobSet,
    batch_size: usize,
}

impl FilesystemConnector {
    pub fn new(config: FilesystemConfig, batch_size: usize) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&default_excludes)?;

        Ok(Self {
            config,
            include,
            exclude,
            batch_size: batch_size.max(1),
        })
    }

    /// Build from a connector row's JSON config.
    pub fn from_value(value: &Value, batch_size: usize) -> Result<Self> {
        let config: FilesystemConfig = serde_json::from_value(value.clone())
            .context("Invalid filesystem connector config")?;
        Self::new(config, batch_size)
    }

    fn scan(&self, window: Option<(DateTime<Utc>, DateTime<Utc>)>) -> Result<Vec<ScannedFile>> {
        let root = &self.config.root;
        if !root.exists() {
            bail!(
                "Filesystem connector root does not exist: {}",
                root.display()
            );
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(root).follow_links(self.config.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            let modified = modified_time(path)?;
            if let Some((start, end)) = window {
                if modified < start || modified > end {
                    continue;
                }
            }
            files.push(ScannedFile {
                path: path.to_path_buf(),
                relative: rel_str,
                modified,
            });
        }

        // Sort for deterministic ordering
        files.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(files)
    }

    fn batches(&self, window: Option<(DateTime<Utc>, DateTime<Utc>)>) -> DocumentBatches<'_> {
        let files = match self.scan(window) {
            Ok(files) => files,
            Err(e) => return stream::once(async move { Err::<Vec<Document>, _>(e) }).boxed(),
        };
        let groups: Vec<Vec<ScannedFile>> = files
            .chunks(self.batch_size)
            .map(|group| group.to_vec())
            .collect();
        stream::iter(groups)
            .map(|group| Ok(group.iter().filter_map(file_to_document).collect::<Vec<_>>()))
            .boxed()
    }
}

#[async_trait]
impl Credentialed for FilesystemConnector {
    async fn load_credentials(&mut self, _credentials: &Value) -> Result<Option<Value>> {
        Ok(None)
    }
}

impl LoadConnector for FilesystemConnector {
    fn load_from_state(&mut self) -> DocumentBatches<'_> {
        self.batches(None)
    }
}

impl PollConnector for FilesystemConnector {
    fn poll_source(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> DocumentBatches<'_> {
        self.batches(Some((start, end)))
    }
}

fn modified_time(path: &Path) -> Result<DateTime<Utc>> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let modified = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    Ok(DateTime::<Utc>::from(modified))
}

/// A single file as a document, for ad-hoc uploads. `None` when the file
/// has no text.
pub fn document_from_path(path: &Path) -> Result<Option<Document>> {
    let path = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let relative = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let file = ScannedFile {
        modified: modified_time(&path)?,
        path,
        relative,
    };
    Ok(file_to_document(&file))
}

/// `None` for unreadable or empty files.
fn file_to_document(file: &ScannedFile) -> Option<Document> {
    let body = match std::fs::read_to_string(&file.path) {
        Ok(body) => body,
        Err(e) => {
            warn!(path = %file.path.display(), error = %e, "skipping unreadable file");
            return None;
        }
    };

    let base_link = format!("file://{}", file.path.display());
    let is_markdown = matches!(
        file.path.extension().and_then(|e| e.to_str()),
        Some("md") | Some("markdown")
    );
    let sections = if is_markdown {
        markdown_sections(&body, &base_link)
    } else if body.trim().is_empty() {
        Vec::new()
    } else {
        vec![Section::new(base_link.clone(), body)]
    };
    if sections.is_empty() {
        return None;
    }

    let title = file
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.relative.clone());
    let mut metadata = BTreeMap::new();
    metadata.insert("path".to_string(), file.relative.clone());

    Some(Document {
        id: base_link,
        sections,
        source: DocumentSource::File,
        semantic_identifier: title,
        metadata,
        updated_at: Some(file.modified),
    })
}

/// One section per ATX heading. Text before the first heading links to
/// the file itself.
pub fn markdown_sections(body: &str, base_link: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut link = base_link.to_string();
    let mut text = String::new();
    let mut in_fence = false;

    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        let heading = if in_fence { None } else { heading_text(line) };
        if let Some(heading) = heading {
            if !text.trim().is_empty() {
                sections.push(Section::new(link.clone(), text.trim_end().to_string()));
            }
            link = format!("{}#{}", base_link, slugify(heading));
            text.clear();
        }
        text.push_str(line);
        text.push('\n');
    }
    if !text.trim().is_empty() {
        sections.push(Section::new(link, text.trim_end().to_string()));
    }
    sections
}

fn heading_text(line: &str) -> Option<&str> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    let text = rest.trim().trim_end_matches('#').trim();
    (!text.is_empty()).then_some(text)
}

/// GitHub-style heading anchor.
pub fn slugify(heading: &str) -> String {
    heading
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                Some(c)
            } else if c.is_whitespace() {
                Some('-')
            } else {
                None
            }
        })
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn write(dir: &Path, rel: &str, body: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn connector(root: &Path, batch_size: usize) -> FilesystemConnector {
        FilesystemConnector::from_value(
            &serde_json::json!({"root": root, "exclude_globs": ["drafts/**"]}),
            batch_size,
        )
        .unwrap()
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Getting Started"), "getting-started");
        assert_eq!(slugify("What's new in v2.0?"), "whats-new-in-v20");
    }

    #[test]
    fn test_markdown_sections_split_at_headings() {
        let body = "intro line\n\n# Setup\ninstall it\n```\n# not a heading\n```\n## Usage Notes\nrun it\n";
        let sections = markdown_sections(body, "file:///d.md");
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].link, "file:///d.md");
        assert_eq!(sections[1].link, "file:///d.md#setup");
        assert!(sections[1].text.contains("# not a heading"));
        assert_eq!(sections[2].link, "file:///d.md#usage-notes");
        assert!(sections[2].text.starts_with("## Usage Notes"));
    }

    #[test]
    fn test_heading_requires_space() {
        assert_eq!(heading_text("#tag"), None);
        assert_eq!(heading_text("### Title ###"), Some("Title"));
    }

    #[tokio::test]
    async fn test_load_batches_and_excludes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.md", "# A\nalpha");
        write(dir.path(), "b.txt", "bravo");
        write(dir.path(), "c.md", "# C\ncharlie");
        write(dir.path(), "drafts/d.md", "# D\ndelta");
        write(dir.path(), "image.png", "not text we want");
        write(dir.path(), "empty.md", "   \n");

        let mut fs = connector(dir.path(), 2);
        let batches: Vec<Vec<Document>> = fs.load_from_state().try_collect().await.unwrap();
        assert_eq!(batches.len(), 2);
        let names: Vec<String> = batches
            .iter()
            .flatten()
            .map(|d| d.semantic_identifier.clone())
            .collect();
        assert_eq!(names, vec!["a.md", "b.txt", "c.md"]);
        assert_eq!(batches[0][0].sections[0].link, format!("{}#a", batches[0][0].id));
    }

    #[tokio::test]
    async fn test_poll_window_uses_mtime() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.md", "# A\nalpha");
        let mut fs = connector(dir.path(), 10);

        let now = Utc::now();
        let past = now - chrono::Duration::days(30);
        let stale: Vec<Vec<Document>> = fs
            .poll_source(past, past + chrono::Duration::days(1))
            .try_collect()
            .await
            .unwrap();
        assert!(stale.is_empty());

        let fresh: Vec<Vec<Document>> = fs
            .poll_source(past, now + chrono::Duration::minutes(1))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);
    }

    #[test]
    fn test_document_from_path() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "notes.txt", "plain notes");
        let doc = document_from_path(&dir.path().join("notes.txt")).unwrap().unwrap();
        assert_eq!(doc.source, DocumentSource::File);
        assert_eq!(doc.sections.len(), 1);
        assert!(doc.id.starts_with("file://"));
        assert!(document_from_path(&dir.path().join("missing.txt")).is_err());
    }

    #[tokio::test]
    async fn test_missing_root_errors() {
        let mut fs = FilesystemConnector::from_value(&serde_json::json!({"root": "/no/such/dir"}), 4).unwrap();
        let result: Result<Vec<Vec<Document>>> = fs.load_from_state().try_collect().await;
        assert!(result.is_err());
        assert!(FilesystemConnector::from_value(&serde_json::json!({}), 4).is_err());
    }
}
