//! Query flow.
//!
//! ```text
//! query ─┬─ style, chat pairs, org collections (gathered concurrently)
//!        └─ hybrid retrieval over the org's collections
//!              │
//!              ├─ QA chain ──┐  (concurrent)
//!              └─ verify ────┤
//!                            ▼
//!                   style rephrase → AssistantReply
//! ```
//!
//! With no evidence the QA and verify chains are skipped: the reply is the
//! configured not-sure message, rephrased, with `answerable = false` and
//! confidence `0.0`. The QA chain only fails when its model call does, so
//! any QA error answers [`MODEL_FAILURE`] without rephrasing, whether or
//! not the provider classified it.

use anyhow::{Context, Result};
use futures::future::FutureExt;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

use mimic_core::embedding::EmbeddingProvider;
use mimic_core::error::is_provider_failure;
use mimic_core::llm::LanguageModel;
use mimic_core::models::{IndexFilters, InferenceChunk};
use mimic_core::qa::quotes::AttributedQuote;
use mimic_core::qa::{answer_and_verify, QaChain, QaEvent, QaParams};
use mimic_core::retrieval::{HybridRetriever, Reranker, RetrievalParams};
use mimic_core::style::{ChatPair, RephraseInput, StyleChain, StyleParams};
use mimic_core::verify::{VerifyChain, VerifyParams};

use crate::catalog::{Catalog, Organization};
use crate::config::Config;
use crate::sqlite_index::IndexFactory;
use crate::styles::StyleStore;

/// Answer text used when the language model fails.
pub const MODEL_FAILURE: &str = "Model Failure";

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssistantReply {
    /// The answer in the user's voice.
    pub answer: String,
    /// The answer before rephrasing.
    pub raw_answer: Option<String>,
    pub quotes: Vec<AttributedQuote>,
    pub answerable: Option<bool>,
    pub confidence: Option<f64>,
    pub docs_relevant: bool,
    pub top_documents: Vec<InferenceChunk>,
}

/// Events of a streamed reply. `AnswerPiece`s carry the raw answer as it is
/// generated; `Rephrased` carries the whole answer in the user's voice once
/// the raw answer is complete. `Verdict` is always last.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantEvent {
    AnswerPiece { text: String },
    Quotes { quotes: Vec<AttributedQuote> },
    Rephrased { text: String },
    Verdict {
        answerable: Option<bool>,
        confidence: Option<f64>,
    },
}

/// Model-backed collaborators, built once at start-up.
#[derive(Clone)]
pub struct Providers {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub reranker: Arc<dyn Reranker>,
    pub model: Arc<dyn LanguageModel>,
}

impl Providers {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            embedder: crate::embedding::create_provider(&config.embedding)?,
            reranker: crate::rerank::create_reranker(&config.rerank)?,
            model: Arc::new(crate::llm::OpenAIChatModel::new(&config.llm)?),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssistantParams {
    pub retrieval: RetrievalParams,
    pub qa: QaParams,
    pub verify: VerifyParams,
    pub style: StyleParams,
    pub max_pairs_loaded: usize,
}

impl AssistantParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retrieval: config.retrieval_params(),
            qa: config.qa_params(),
            verify: config.verify_params(),
            style: config.style_params(),
            max_pairs_loaded: config.style.max_pairs_loaded,
        }
    }
}

/// Style generation, rephrasing and shuffling over the style store.
pub struct StyleService {
    chain: StyleChain,
    store: StyleStore,
    max_pairs_loaded: usize,
}

impl StyleService {
    pub fn new(chain: StyleChain, store: StyleStore, max_pairs_loaded: usize) -> Self {
        Self {
            chain,
            store,
            max_pairs_loaded,
        }
    }

    pub fn store(&self) -> &StyleStore {
        &self.store
    }

    pub async fn pairs(&self, user_id: &str) -> Result<Vec<ChatPair>> {
        self.store
            .recent_chat_pairs(user_id, self.max_pairs_loaded)
            .await
    }

    /// The stored style, generating and storing it first when there is
    /// none yet and enough chat pairs exist.
    pub async fn ensure_style(&self, user_id: &str) -> Result<Option<String>> {
        if let Some(style) = self.store.conversation_style(user_id).await? {
            return Ok(Some(style));
        }
        self.regenerate(user_id).await
    }

    /// Generate the style from the latest pairs and store it.
    pub async fn regenerate(&self, user_id: &str) -> Result<Option<String>> {
        let pairs = self.pairs(user_id).await?;
        let Some(style) = self.chain.generate_style(&pairs).await? else {
            debug!(user_id, pairs = pairs.len(), "not enough chat pairs for a style");
            return Ok(None);
        };
        self.store.set_conversation_style(user_id, &style).await?;
        Ok(Some(style))
    }

    pub async fn rephrase(&self, input: &RephraseInput<'_>) -> String {
        self.chain.rephrase(input).await
    }

    pub fn chain(&self) -> &StyleChain {
        &self.chain
    }

    /// A creative variant of `answer` in the user's stored style.
    pub async fn shuffle(&self, user_id: &str, answer: &str) -> Result<String> {
        let style = self.store.conversation_style(user_id).await?;
        self.chain.shuffle(answer, style.as_deref()).await
    }
}

/// An owned rephrase request, run once a streamed answer is complete.
struct StreamRephrase {
    chain: StyleChain,
    pairs: Vec<ChatPair>,
    style: Option<String>,
    query: String,
    user: String,
    context: Option<String>,
}

impl StreamRephrase {
    async fn run(&self, answer: Option<&str>) -> String {
        self.chain
            .rephrase(&RephraseInput {
                pairs: &self.pairs,
                style: self.style.as_deref(),
                query: &self.query,
                user: &self.user,
                answer,
                context: self.context.as_deref(),
            })
            .await
    }
}

struct Gathered {
    style: Option<String>,
    pairs: Vec<ChatPair>,
    org: Organization,
}

pub struct Assistant {
    catalog: Arc<dyn Catalog>,
    indexes: Arc<dyn IndexFactory>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Arc<dyn Reranker>,
    retrieval: RetrievalParams,
    qa: QaChain,
    verify: Arc<VerifyChain>,
    style: StyleService,
}

impl Assistant {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        indexes: Arc<dyn IndexFactory>,
        styles: StyleStore,
        providers: Providers,
        params: AssistantParams,
    ) -> Self {
        let style = StyleService::new(
            StyleChain::new(providers.model.clone(), params.style),
            styles,
            params.max_pairs_loaded,
        );
        Self {
            catalog,
            indexes,
            embedder: providers.embedder,
            reranker: providers.reranker,
            retrieval: params.retrieval,
            qa: QaChain::new(providers.model.clone(), params.qa),
            verify: Arc::new(VerifyChain::new(providers.model, params.verify)),
            style,
        }
    }

    pub fn style(&self) -> &StyleService {
        &self.style
    }

    async fn gather(&self, user_id: &str) -> Result<Gathered> {
        let (style, pairs, org) = futures::try_join!(
            async {
                // A missing style only weakens the rephrase.
                Ok::<_, anyhow::Error>(match self.style.ensure_style(user_id).await {
                    Ok(style) => style,
                    Err(e) => {
                        warn!(task = "style", error = %format!("{:#}", e), "style unavailable");
                        None
                    }
                })
            },
            async { self.style.pairs(user_id).await.context("task 'chat_pairs' failed") },
            async {
                self.catalog
                    .organization_for_user(user_id)
                    .await
                    .context("task 'collections' failed")
            },
        )?;
        let org = org.with_context(|| format!("user '{}' does not belong to an organization", user_id))?;
        Ok(Gathered { style, pairs, org })
    }

    fn retriever(&self, org: &Organization) -> HybridRetriever {
        HybridRetriever::new(
            self.embedder.clone(),
            self.indexes.vector(&org.vector_collection),
            self.indexes.keyword(&org.keyword_collection),
            self.reranker.clone(),
            self.retrieval.clone(),
        )
    }

    /// Search the user's organization without answering.
    pub async fn search(&self, user_id: &str, query: &str, filters: &IndexFilters) -> Result<Vec<InferenceChunk>> {
        let org = self
            .catalog
            .organization_for_user(user_id)
            .await?
            .with_context(|| format!("user '{}' does not belong to an organization", user_id))?;
        let retrieved = self.retriever(&org).retrieve(query, Some(user_id), filters).await?;
        Ok(retrieved
            .map(|r| r.ranked().cloned().collect())
            .unwrap_or_default())
    }

    async fn not_sure(&self, gathered: &Gathered, user_id: &str, query: &str) -> String {
        self.style
            .rephrase(&RephraseInput {
                pairs: &gathered.pairs,
                style: gathered.style.as_deref(),
                query,
                user: user_id,
                answer: None,
                context: None,
            })
            .await
    }

    pub async fn ask(&self, user_id: &str, query: &str, filters: &IndexFilters) -> Result<AssistantReply> {
        let gathered = self.gather(user_id).await?;
        let Some(retrieved) = self
            .retriever(&gathered.org)
            .retrieve(query, Some(user_id), filters)
            .await?
        else {
            debug!(user_id, "no evidence found");
            return Ok(AssistantReply {
                answer: self.not_sure(&gathered, user_id, query).await,
                answerable: Some(false),
                confidence: Some(0.0),
                ..AssistantReply::default()
            });
        };

        let evidence = retrieved.reranked;
        let joint = answer_and_verify(&self.qa, &self.verify, query, &evidence).await;
        let quotes = joint.quotes.unwrap_or_default();
        let docs_relevant = joint.answerable.unwrap_or(false);

        if let Some(err) = &joint.qa_error {
            if !is_provider_failure(err) {
                warn!(user_id, error = %format!("{:#}", err), "answer chain failed outside the provider");
            }
            return Ok(AssistantReply {
                answer: MODEL_FAILURE.to_string(),
                raw_answer: Some(MODEL_FAILURE.to_string()),
                quotes,
                answerable: joint.answerable,
                confidence: joint.confidence,
                docs_relevant,
                top_documents: evidence,
            });
        }

        let answer = self
            .style
            .rephrase(&RephraseInput {
                pairs: &gathered.pairs,
                style: gathered.style.as_deref(),
                query,
                user: user_id,
                answer: joint.answer.as_deref(),
                context: evidence.first().map(|c| c.content.as_str()),
            })
            .await;

        Ok(AssistantReply {
            answer,
            raw_answer: joint.answer,
            quotes,
            answerable: joint.answerable,
            confidence: joint.confidence,
            docs_relevant,
            top_documents: evidence,
        })
    }

    /// Stream the raw answer as it is generated, then the quotes, the
    /// rephrased answer and the verdict. Verification runs alongside the
    /// answer stream; dropping the stream cancels both. A model failure
    /// streams [`MODEL_FAILURE`] and is not rephrased.
    pub async fn ask_stream(
        &self,
        user_id: &str,
        query: &str,
        filters: &IndexFilters,
    ) -> Result<BoxStream<'static, Result<AssistantEvent>>> {
        let gathered = self.gather(user_id).await?;
        let Some(retrieved) = self
            .retriever(&gathered.org)
            .retrieve(query, Some(user_id), filters)
            .await?
        else {
            let text = self.not_sure(&gathered, user_id, query).await;
            let events = vec![
                Ok(AssistantEvent::AnswerPiece {
                    text: self.style.chain().params().not_sure_message.clone(),
                }),
                Ok(AssistantEvent::Quotes { quotes: Vec::new() }),
                Ok(AssistantEvent::Rephrased { text }),
                Ok(AssistantEvent::Verdict {
                    answerable: Some(false),
                    confidence: Some(0.0),
                }),
            ];
            return Ok(stream::iter(events).boxed());
        };

        let evidence = retrieved.reranked;
        let rephrase = Arc::new(StreamRephrase {
            chain: self.style.chain().clone(),
            context: evidence.first().map(|c| c.content.clone()),
            pairs: gathered.pairs,
            style: gathered.style,
            query: query.to_string(),
            user: user_id.to_string(),
        });
        let verify = self.verify.clone();
        let (verify_query, verify_chunks) = (query.to_string(), evidence.clone());
        let (verify_task, verdict) =
            async move { verify.verify(&verify_query, &verify_chunks).await }.remote_handle();
        tokio::spawn(verify_task);

        let answers = match self.qa.answer_stream(query, evidence).await {
            Ok(events) => events
                .filter_map(move |event| {
                    let rephrase = rephrase.clone();
                    async move {
                        match event {
                            Ok(QaEvent::AnswerData { text }) => Some(Ok(AssistantEvent::AnswerPiece { text })),
                            Ok(QaEvent::Quotes { quotes }) => Some(Ok(AssistantEvent::Quotes { quotes })),
                            Ok(QaEvent::Final { answer }) => Some(Ok(AssistantEvent::Rephrased {
                                text: rephrase.run(answer.answer.as_deref()).await,
                            })),
                            Err(e) => Some(Err(e)),
                        }
                    }
                })
                .boxed(),
            Err(e) => {
                error!(task = "qa", error = %format!("{:#}", e), "answer stream failed");
                stream::iter(vec![
                    Ok(AssistantEvent::AnswerPiece {
                        text: MODEL_FAILURE.to_string(),
                    }),
                    Ok(AssistantEvent::Quotes { quotes: Vec::new() }),
                ])
                .boxed()
            }
        };

        let verdict = stream::once(async move {
            let (answerable, confidence) = match verdict.await {
                Ok(v) => (Some(v.answerable), Some(v.confidence)),
                Err(e) => {
                    error!(task = "verify", error = %format!("{:#}", e), "verification failed");
                    (None, None)
                }
            };
            Ok(AssistantEvent::Verdict {
                answerable,
                confidence,
            })
        });

        Ok(answers.chain(verdict).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;
    use async_trait::async_trait;
    use mimic_core::llm::LlmRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for CountingModel {
        fn name(&self) -> &str {
            "counting"
        }

        async fn complete(&self, _request: &LlmRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("dry and brief".to_string())
        }
    }

    #[tokio::test]
    async fn test_style_generated_once_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("style.sqlite"))
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        let store = StyleStore::new(pool);
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let service = StyleService::new(
            StyleChain::new(model.clone(), StyleParams::default()),
            store.clone(),
            50,
        );

        for i in 0..4 {
            store
                .add_chat_pair("u1", &ChatPair::new(format!("q{}", i), "ok"))
                .await
                .unwrap();
        }
        assert_eq!(service.ensure_style("u1").await.unwrap(), None);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);

        store
            .add_chat_pair("u1", &ChatPair::new("q4", "ok"))
            .await
            .unwrap();
        assert_eq!(service.ensure_style("u1").await.unwrap().as_deref(), Some("dry and brief"));
        assert_eq!(service.ensure_style("u1").await.unwrap().as_deref(), Some("dry and brief"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);

        service.regenerate("u1").await.unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }
}
