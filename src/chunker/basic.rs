//! Whole-file chunker.
//!
//! Ignores incremental updates and splits each file's complete text in one
//! pass when its terminal event arrives. Same window/slide math as the
//! sliding chunker, but nothing is emitted for a file that ends with an
//! error. Suited to parsers that deliver their full text on the terminal
//! event.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::parser::{ParseStream, Stage};

use super::{Chunk, ChunkStream, Chunker};

const TOKEN_BYTES: usize = 4;

pub struct BasicChunker {
    window: u32,
    slide: u32,
}

impl BasicChunker {
    pub fn new(window: u32, slide: u32) -> Self {
        Self {
            window: window.max(1),
            slide: slide.min(window.saturating_sub(1)),
        }
    }

    fn split(&self, text: &str) -> Vec<String> {
        let size = self.window as usize * TOKEN_BYTES;
        let stride = (self.window - self.slide) as usize * TOKEN_BYTES;
        let mut chunks = Vec::new();

        let mut cursor = 0usize;
        while cursor < text.len() {
            let mut end = (cursor + size).min(text.len());
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            chunks.push(text[cursor..end].to_string());
            if end == text.len() {
                break;
            }
            let mut advance = (cursor + stride).min(text.len());
            while !text.is_char_boundary(advance) {
                advance -= 1;
            }
            if advance <= cursor {
                advance = end;
            }
            cursor = advance;
        }

        chunks
    }
}

impl Chunker for BasicChunker {
    fn generate_chunks(
        &self,
        ctx: CancellationToken,
        stream: Box<dyn ParseStream>,
    ) -> Box<dyn ChunkStream> {
        Box::new(BasicChunkStream {
            ctx,
            stream,
            window: self.window,
            slide: self.slide,
            ready: VecDeque::new(),
        })
    }
}

struct BasicChunkStream {
    ctx: CancellationToken,
    stream: Box<dyn ParseStream>,
    window: u32,
    slide: u32,
    ready: VecDeque<Chunk>,
}

#[async_trait]
impl ChunkStream for BasicChunkStream {
    async fn next(&mut self) -> Option<Chunk> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                return Some(chunk);
            }
            if self.ctx.is_cancelled() {
                return None;
            }

            let event = self.stream.next().await?.into_deepest();
            match event.stage {
                Stage::New => {
                    self.ready.push_back(Chunk::Start {
                        path: event.path,
                    });
                }
                Stage::Update => {}
                Stage::Completed => {
                    if event.error.is_none() {
                        let splitter = BasicChunker {
                            window: self.window,
                            slide: self.slide,
                        };
                        for data in splitter.split(&event.text) {
                            self.ready.push_back(Chunk::Data {
                                path: event.path.clone(),
                                data,
                            });
                        }
                    }
                    self.ready.push_back(Chunk::End {
                        path: event.path,
                        error: event.error,
                    });
                }
            }
        }
    }
}
