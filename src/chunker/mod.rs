//! Chunkers turn parse streams into embeddable text chunks.
//!
//! A chunker consumes [`StreamResult`] events and produces a totally
//! ordered chunk stream per logical file: one `Start`, any number of
//! `Data` chunks, one `End`. Nested container files keep their own
//! bracketing — the outer `Start` precedes the inner one and the inner
//! `End` precedes the outer one.
//!
//! Window and slide are measured in tokens, where one token is
//! approximated as four bytes of text.

pub mod basic;
pub mod slide;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::parser::{ParseError, ParseStream};

/// One element of the chunk stream. Exactly one arm per event.
#[derive(Debug)]
pub enum Chunk {
    /// A logical file is about to produce data.
    Start { path: String },
    /// A window of text, at most `4·window` bytes.
    Data { path: String, data: String },
    /// The file is finished; carries the terminal parse error, if any.
    End {
        path: String,
        error: Option<ParseError>,
    },
}

impl Chunk {
    pub fn path(&self) -> &str {
        match self {
            Chunk::Start { path } | Chunk::Data { path, .. } | Chunk::End { path, .. } => path,
        }
    }
}

/// Pull iterator over chunks.
#[async_trait]
pub trait ChunkStream: Send {
    async fn next(&mut self) -> Option<Chunk>;
}

/// Builds a chunk stream over a parse stream.
pub trait Chunker: Send + Sync {
    fn generate_chunks(
        &self,
        ctx: CancellationToken,
        stream: Box<dyn ParseStream>,
    ) -> Box<dyn ChunkStream>;
}
