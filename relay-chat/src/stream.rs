use crate::error::{ChatError, Result};
use futures_util::Stream;
use futures_util::future::BoxFuture;
use relay_llm::{ChatChunk, ChatMessage};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc::UnboundedReceiver;

/// Chunks of a streaming call as they arrive, resolving to the same final
/// message [`crate::Chat::ask`] returns.
///
/// The conversation only advances while this is polled (or awaited through
/// [`ChatStream::into_message`]). A failed call yields its error as the
/// last item.
pub struct ChatStream<'a> {
    chunks: UnboundedReceiver<ChatChunk>,
    driver: BoxFuture<'a, Result<ChatMessage>>,
    outcome: Option<Result<ChatMessage>>,
    driver_done: bool,
    error_yielded: bool,
}

impl<'a> ChatStream<'a> {
    pub(crate) fn new(
        chunks: UnboundedReceiver<ChatChunk>,
        driver: BoxFuture<'a, Result<ChatMessage>>,
    ) -> Self {
        Self {
            chunks,
            driver,
            outcome: None,
            driver_done: false,
            error_yielded: false,
        }
    }

    /// Drive the call to completion, discarding chunks not yet read.
    pub async fn into_message(mut self) -> Result<ChatMessage> {
        if !self.driver_done {
            let outcome = (&mut self.driver).await;
            self.outcome = Some(outcome);
            self.driver_done = true;
        }
        match self.outcome.take() {
            Some(outcome) => outcome,
            None => Err(ChatError::Validation(
                "chat stream already reported its error".to_string(),
            )),
        }
    }

    fn finish(&mut self) -> Poll<Option<Result<ChatChunk>>> {
        if !self.error_yielded && matches!(self.outcome, Some(Err(_))) {
            self.error_yielded = true;
            if let Some(Err(e)) = self.outcome.take() {
                return Poll::Ready(Some(Err(e)));
            }
        }
        Poll::Ready(None)
    }
}

impl Stream for ChatStream<'_> {
    type Item = Result<ChatChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.chunks.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => return Poll::Ready(Some(Ok(chunk))),
                Poll::Ready(None) => {
                    if this.driver_done {
                        return this.finish();
                    }
                }
                Poll::Pending => {
                    if this.driver_done {
                        return this.finish();
                    }
                }
            }

            match this.driver.as_mut().poll(cx) {
                Poll::Ready(outcome) => {
                    this.outcome = Some(outcome);
                    this.driver_done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
