use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::{Provider, Usage};

/// A provider that replays pre-configured responses, for tests and offline runs
#[derive(Clone, Default)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<Result<Message, String>>>>,
    calls: Arc<AtomicUsize>,
    histories: Arc<Mutex<Vec<Vec<Message>>>>,
    delay: Option<Duration>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Message>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().map(Ok).collect())),
            ..Default::default()
        }
    }

    /// Queue a failure; it is returned in sequence like any other response
    pub fn with_failure<S: Into<String>>(self, error: S) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(Err(error.into()));
        }
        self
    }

    /// Sleep before every reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times `complete` was invoked
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The message history received by each invocation, in order
    pub fn histories(&self) -> Vec<Vec<Message>> {
        self.histories
            .lock()
            .map(|histories| histories.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(&self, messages: &[Message], _tools: &[Tool]) -> Result<(Message, Usage)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut histories) = self.histories.lock() {
            histories.push(messages.to_vec());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut responses = self
                .responses
                .lock()
                .map_err(|_| anyhow!("mock provider state poisoned"))?;
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        };

        match next {
            Some(Ok(message)) => Ok((message, Usage::default())),
            Some(Err(error)) => Err(anyhow!(error)),
            // Return empty response if no more pre-configured responses
            None => Ok((Message::assistant().with_text(""), Usage::default())),
        }
    }
}
