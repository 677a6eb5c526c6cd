//! # file2llm
//!
//! **An idempotent, version-aware document indexing pipeline.**
//!
//! file2llm ingests heterogeneous files from external data sources,
//! extracts their text (running OCR on images, rendering PDF pages,
//! walking TAR archives and emails), splits the result into overlapping
//! chunks, computes vector embeddings per chunk and persists them in a
//! vector store for similarity search.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────┐   ┌──────────┐   ┌──────────┐
//! │ Sources  │──▶│   Parser     │──▶│ Chunker │──▶│ Embedder │──▶│ Storage  │
//! │ (files)  │   │ OCR/PDF/TAR/ │   │ sliding │   │ Ollama/  │   │ Postgres │
//! │          │   │ EML streams  │   │ window  │   │ OpenAI   │   │ pgvector │
//! └────┬─────┘   └──────────────┘   └─────────┘   └──────────┘   └────┬─────┘
//!      │                                                              │
//!      │          lifecycle notifications (started/running/done)      │
//!      └────────────────────────── Engine ◀───────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. A **[`source::Source`]** yields file handlers (path, ETag, stream).
//! 2. The **[`engine::Engine`]** consults the catalog: unchanged files
//!    (same ETag, compatible [`storage::ProcessorVersion`]) are skipped.
//! 3. The **[`parser`]** sniffs the content type and streams per-file
//!    progress events; containers surface nested files as sub-results.
//! 4. The **[`chunker`]** cuts the text stream into overlapping windows.
//! 5. The **[`embedder`]** maps each chunk to a unit vector, which the
//!    **[`storage`]** backend persists next to the catalog row.
//! 6. `storage::Storage::search_similar_embeddings` serves cosine
//!    nearest-neighbor queries over everything indexed.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`engine`] | Pipeline coordinator: dedup, notifications, cleanup |
//! | [`parser`] | Streaming parsers: images, raw BGRA, PDF, TAR, EML |
//! | [`chunker`] | Sliding-window and whole-file chunkers |
//! | [`ocr`] | OCR provider contract, worker pool, HTTP server client |
//! | [`embedder`] | Embedding contract, Ollama and OpenAI clients |
//! | [`storage`] | Catalog + vector store contract, Postgres and memory |
//! | [`source`] | Data source contract and the filesystem source |
//! | [`vector`] | Dot product, norm check, in-place normalization |
//!
//! ## Features
//!
//! - `pdf` — PDF page rendering via poppler/cairo. Off by default; when
//!   disabled PDFs finish with a `ParserDisabled` error and the pipeline
//!   continues with the next file.

pub mod chunker;
pub mod config;
pub mod engine;
pub mod embedder;
pub mod ocr;
pub mod parser;
pub mod source;
pub mod storage;
pub mod vector;
