//! # Mimic
//!
//! Hybrid-retrieval question answering that replies in a user's own
//! writing style.
//!
//! Connectors pull documents into per-organization vector and keyword
//! collections. A question is answered by fusing both retrieval paths,
//! reranking, asking an LLM for an answer with supporting quotes, verifying
//! that the evidence can answer the question, and finally rephrasing the
//! answer in the asking user's conversational style.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌────────────────┐
//! │ Connectors  │──▶│  Pipeline   │──▶│    SQLite      │
//! │ file / ...  │   │ Chunk+Embed │   │ vectors + FTS  │
//! └──────┬──────┘   └─────────────┘   └───────┬────────┘
//!        │ Runner                             │
//!        ▼                                    ▼
//! ┌─────────────┐                    ┌────────────────┐
//! │  Catalog    │                    │ HybridRetriever│
//! │ attempts    │                    │  RRF + rerank  │
//! └─────────────┘                    └───────┬────────┘
//!                                            ▼
//!                              ┌──────────────────────────┐
//!                              │ QA + Verify → Style      │
//!                              │      (Assistant)         │
//!                              └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mimic init
//! mimic org add acme
//! mimic user add alice --org acme
//! mimic index-file ./handbook.md --org acme
//! mimic style add-pair --user alice "how's it going" "pretty good tbh"
//! mimic ask --user alice "how do I deploy?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`catalog`] | Organizations, connectors, credentials, index attempts |
//! | [`sqlite_index`] | SQLite-backed vector and keyword indexes |
//! | [`connectors`] | Connector factory and the filesystem connector |
//! | [`runner`] | Connector runner: recovery, scheduling, execution |
//! | [`embedding`] | Embedding providers |
//! | [`rerank`] | Cross-encoder reranking over HTTP |
//! | [`llm`] | OpenAI-compatible chat model |
//! | [`http`] | Shared HTTP retry helper |
//! | [`styles`] | Chat pairs and conversation styles |
//! | [`assistant`] | Query flow: retrieve, answer, verify, rephrase |
//! | [`commands`] | CLI command implementations |

pub mod assistant;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod connectors;
pub mod db;
pub mod embedding;
pub mod http;
pub mod llm;
pub mod migrate;
pub mod rerank;
pub mod runner;
pub mod sqlite_index;
pub mod styles;
