//! Sliding-window chunker.
//!
//! Keeps one growing text buffer per active file path. Whenever a buffer
//! holds more than a full window the leading windows are emitted and the
//! cursor advances by `window − slide` tokens, so consecutive chunks share
//! a `slide`-token overlap. The final partial window is held back until the
//! file's terminal event, then flushed.
//!
//! Events are keyed on the *deepest* nested result: for containers that is
//! the inner file currently streaming, so nested files chunk independently
//! of their parent.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::parser::{ParseStream, Stage};

use super::{Chunk, ChunkStream, Chunker};

/// Approximated bytes per token.
const TOKEN_BYTES: usize = 4;

pub struct SlideChunker {
    window: u32,
    slide: u32,
}

impl SlideChunker {
    /// `window` is the chunk size in tokens, `slide` the overlap between
    /// consecutive chunks. `slide` is clamped below `window`.
    pub fn new(window: u32, slide: u32) -> Self {
        Self {
            window: window.max(1),
            slide: slide.min(window.saturating_sub(1)),
        }
    }
}

impl Chunker for SlideChunker {
    fn generate_chunks(
        &self,
        ctx: CancellationToken,
        stream: Box<dyn ParseStream>,
    ) -> Box<dyn ChunkStream> {
        Box::new(SlideChunkStream {
            ctx,
            stream,
            size: self.window as usize * TOKEN_BYTES,
            stride: (self.window - self.slide) as usize * TOKEN_BYTES,
            buffers: HashMap::new(),
            ready: VecDeque::new(),
        })
    }
}

struct SlideChunkStream {
    ctx: CancellationToken,
    stream: Box<dyn ParseStream>,
    size: usize,
    stride: usize,
    buffers: HashMap<String, String>,
    ready: VecDeque<Chunk>,
}

/// Largest char boundary not beyond `at`.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    let mut at = at;
    while !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// First char boundary strictly after `at`.
fn next_char_boundary(s: &str, at: usize) -> usize {
    let mut at = at + 1;
    while at < s.len() && !s.is_char_boundary(at) {
        at += 1;
    }
    at.min(s.len())
}

impl SlideChunkStream {
    /// Emits every full window in `path`'s buffer. Windows that would end
    /// exactly at the buffer end are the potential final chunk and stay
    /// buffered until `flush`; on flush the remainder goes out as one last
    /// chunk (an empty buffer yields no chunk at all).
    fn split(&mut self, path: &str, flush: bool) {
        let Some(buffer) = self.buffers.get_mut(path) else {
            return;
        };

        let mut cursor = 0usize;
        while cursor + self.size < buffer.len() {
            let end = floor_char_boundary(buffer, cursor + self.size);
            self.ready.push_back(Chunk::Data {
                path: path.to_string(),
                data: buffer[cursor..end].to_string(),
            });

            let mut advance = floor_char_boundary(buffer, cursor + self.stride);
            if advance <= cursor {
                advance = next_char_boundary(buffer, cursor);
            }
            cursor = advance;
        }

        if flush {
            if cursor < buffer.len() {
                self.ready.push_back(Chunk::Data {
                    path: path.to_string(),
                    data: buffer[cursor..].to_string(),
                });
            }
            buffer.clear();
        } else if cursor > 0 {
            buffer.drain(..cursor);
        }
    }
}

#[async_trait]
impl ChunkStream for SlideChunkStream {
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
                    self.buffers.insert(event.path.clone(), event.text);
                    self.ready.push_back(Chunk::Start {
                        path: event.path.clone(),
                    });
                    self.split(&event.path, false);
                }
                Stage::Update => {
                    self.buffers
                        .entry(event.path.clone())
                        .or_default()
                        .push_str(&event.text);
                    self.split(&event.path, false);
                }
                Stage::Completed => {
                    self.buffers
                        .entry(event.path.clone())
                        .or_default()
                        .push_str(&event.text);
                    self.split(&event.path, true);
                    self.buffers.remove(&event.path);
                    self.ready.push_back(Chunk::End {
                        path: event.path,
                        error: event.error,
                    });
                }
            }
        }
    }
}
