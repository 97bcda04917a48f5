//! Drives a raw byte stream through a wire decoder and a backend translator.

use crate::error::{LlmError, Result};
use crate::provider::ChunkStream;
use crate::types::ChatChunk;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;

/// Splits bytes into wire units (SSE events, binary frames) across reads.
pub(crate) trait Decoder: Send + 'static {
    type Item;

    fn push(&mut self, bytes: &[u8]) -> Vec<Self::Item>;

    /// Called once at end of input.
    fn finish(&mut self) -> Vec<Self::Item>;
}

/// Maps wire units of one backend onto canonical chunks.
pub(crate) trait Translator<I>: Send + 'static {
    fn on_item(&mut self, item: I) -> Vec<Result<ChatChunk>>;

    fn finish(&mut self) -> Vec<Result<ChatChunk>>;
}

struct Pump<D, T> {
    bytes: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
    decoder: D,
    translator: T,
    pending: VecDeque<Result<ChatChunk>>,
    finished: bool,
}

pub(crate) fn pump<S, E, D, T>(bytes: S, decoder: D, translator: T) -> ChunkStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<LlmError>,
    D: Decoder,
    D::Item: Send,
    T: Translator<D::Item>,
{
    let state = Pump {
        bytes: Box::pin(bytes.map(|r| r.map_err(Into::into))),
        decoder,
        translator,
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for item in state.decoder.push(&chunk) {
                        let out = state.translator.on_item(item);
                        state.pending.extend(out);
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.push_back(Err(e));
                }
                None => {
                    state.finished = true;
                    for item in state.decoder.finish() {
                        let out = state.translator.on_item(item);
                        state.pending.extend(out);
                    }
                    let out = state.translator.finish();
                    state.pending.extend(out);
                }
            }
        }
    }))
}
