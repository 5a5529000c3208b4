//! # doctalk
//!
//! Document question answering with inline, page-anchored citations.
//!
//! Documents are extracted into positioned text, split into retrieval-sized
//! chunks and embedded. A chat turn retrieves fragments, streams a model
//! answer, detects `[n]` citation markers as the tokens arrive, and meters
//! the cost against a per-user credit ledger.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐
//! │ Extract  │──▶│  Chunk   │──▶│  Embed   │──▶│ Vector index │
//! │ PDF/OOXML│   │ layout   │   │ batches  │   │   + SQLite   │
//! └──────────┘   └──────────┘   └──────────┘   └──────┬───────┘
//!                                                     │
//!                ┌──────────┐   ┌──────────┐   ┌──────▼───────┐
//!   client ◀─SSE─│ Citation │◀──│   LLM    │◀──│  Retrieval   │
//!                │  parser  │   │  stream  │   │  + prompt    │
//!                └──────────┘   └──────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Domain error enums and wire codes |
//! | [`extract`] | Per-format page extraction |
//! | [`ocr`] | OCR fallback interface |
//! | [`chunk`] | Layout-aware chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_index`] | Nearest-neighbour index |
//! | [`storage`] | Raw document bytes |
//! | [`store`] | Relational persistence traits |
//! | [`ingest`] | Ingestion pipeline and recovery |
//! | [`teardown`] | Document deletion with cleanup retries |
//! | [`retrieval`] | Fragment retrieval |
//! | [`profiles`] | Model profiles, modes and pricing |
//! | [`ledger`] | Credit accounting |
//! | [`prompt`] | Prompt assembly |
//! | [`llm`] | Streaming chat model abstraction |
//! | [`citation`] | Streaming citation parser |
//! | [`events`] | SSE event types |
//! | [`chat`] | Chat turn orchestration |
//! | [`app`] | Service wiring |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod chat;
pub mod chunk;
pub mod citation;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod events;
pub mod extract;
pub mod ingest;
pub mod ledger;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod profiles;
pub mod prompt;
pub mod retrieval;
pub mod server;
pub mod storage;
pub mod store;
pub mod teardown;
pub mod vector_index;
