//! Connector factory.
//!
//! Maps a [`DocumentSource`] to a builder that turns a connector row's JSON
//! config into a tagged [`ConnectorHandle`]. Each registration also lists
//! the input types the source can be driven by, which the runner consults
//! before rewriting a `load_state` connector to `poll`.
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │          ConnectorFactory           │
//! │  ┌──────────────┐ ┌──────────────┐  │
//! │  │  Built-in    │ │   Custom     │  │
//! │  │  file (fs)   │ │  register()  │  │
//! │  └──────────────┘ └──────────────┘  │
//! └──────────────┬──────────────────────┘
//!                ▼
//!       Runner → IndexingPipeline
//! ```

pub mod filesystem;

use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use mimic_core::connector::{ConnectorHandle, InputType};
use mimic_core::models::DocumentSource;

use self::filesystem::FilesystemConnector;

/// Builds a connector for the requested input type from its JSON config.
pub type ConnectorBuilder = Arc<dyn Fn(InputType, &Value) -> Result<ConnectorHandle> + Send + Sync>;

struct Registration {
    supported: Vec<InputType>,
    builder: ConnectorBuilder,
}

#[derive(Default)]
pub struct ConnectorFactory {
    registrations: HashMap<DocumentSource, Registration>,
}

impl ConnectorFactory {
    /// A factory with no sources registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with the built-in filesystem connector.
    pub fn with_builtins(document_batch_size: usize) -> Self {
        let mut factory = Self::new();
        factory.register(
            DocumentSource::File,
            &[InputType::LoadState, InputType::Poll],
            Arc::new(move |input_type: InputType, config: &Value| -> Result<ConnectorHandle> {
                let connector = FilesystemConnector::from_value(config, document_batch_size)?;
                match input_type {
                    InputType::LoadState => Ok(ConnectorHandle::Load(Box::new(connector))),
                    InputType::Poll => Ok(ConnectorHandle::Poll(Box::new(connector))),
                    InputType::Event => bail!("file connectors do not handle events"),
                }
            }),
        );
        factory
    }

    /// Register (or replace) the builder for `source`.
    pub fn register(&mut self, source: DocumentSource, supported: &[InputType], builder: ConnectorBuilder) {
        self.registrations.insert(
            source,
            Registration {
                supported: supported.to_vec(),
                builder,
            },
        );
    }

    pub fn supports(&self, source: DocumentSource, input_type: InputType) -> bool {
        self.registrations
            .get(&source)
            .map_or(false, |r| r.supported.contains(&input_type))
    }

    pub fn build(&self, source: DocumentSource, input_type: InputType, config: &Value) -> Result<ConnectorHandle> {
        let Some(registration) = self.registrations.get(&source) else {
            bail!("No connector registered for source '{}'", source);
        };
        if !registration.supported.contains(&input_type) {
            bail!("Connector for '{}' does not support {}", source, input_type);
        }
        let handle = (registration.builder)(input_type, config)?;
        if handle.input_type() != input_type {
            bail!(
                "Connector for '{}' built a {} handle, expected {}",
                source,
                handle.input_type(),
                input_type
            );
        }
        Ok(handle)
    }
}
