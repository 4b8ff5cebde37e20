//! # Mimic Core
//!
//! Runtime-free logic for Mimic: the document model, chunking, the
//! embedding and index abstractions, hybrid retrieval with reciprocal rank
//! fusion, the indexing pipeline, connector contracts, and the answer,
//! verification, and style chains.
//!
//! This crate contains no tokio, sqlx, or HTTP code. Providers (embedding,
//! language model, reranker) and stores are traits; the `mimic` application
//! crate supplies the SQLite and HTTP implementations, and the in-memory
//! implementations here back the tests.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Documents, chunks, inference chunks, ACLs, filters |
//! | [`chunk`] | Section-aware chunker with overlap and mini-chunks |
//! | [`embedding`] | Embedding provider trait, batching embedder, vector helpers |
//! | [`index`] | Vector/keyword index traits, write planning, in-memory indexes |
//! | [`keyword`] | Query preprocessing and typo matching |
//! | [`retrieval`] | Hybrid retriever: concurrent search, RRF, rerank |
//! | [`pipeline`] | Indexing pipeline: chunk → keyword → embed → vector |
//! | [`connector`] | Load / poll / event connector contracts |
//! | [`llm`] | Language model trait and request type |
//! | [`qa`] | Answer chain: prompt, parsing, quotes, streaming |
//! | [`verify`] | Answerability judgement chain |
//! | [`style`] | Style profile, rephrase, and shuffle chains |
//! | [`tokens`] | Token-count heuristic used for prompt budgets |
//! | [`error`] | Error kinds callers distinguish |

pub mod chunk;
pub mod connector;
pub mod embedding;
pub mod error;
pub mod index;
pub mod keyword;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod qa;
pub mod retrieval;
pub mod style;
pub mod tokens;
pub mod verify;
