//! Scripted collaborators.

use crate::cache::{CacheBackend, CacheEntry, CacheMetadata};
use crate::errors::{GenerationError, StoreError};
use crate::executor::{GenerationRequest, GenerativeClient};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Return this text.
    Text(String),
    /// Fail with this error.
    Fail(GenerationError),
    /// Sleep, then return the default response.
    Delay(Duration),
}

#[derive(Debug)]
struct Rule {
    needle: String,
    reply: Reply,
    remaining: Option<usize>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A generative client that replays a script.
///
/// Replies are chosen in order: the first matching prompt rule, then the
/// next queued reply, then the default response. Every request is recorded.
#[derive(Debug)]
pub struct ScriptedClient {
    queue: Mutex<VecDeque<Reply>>,
    rules: Mutex<Vec<Rule>>,
    default_response: String,
    latency: Option<Duration>,
    calls: Mutex<Vec<GenerationRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            rules: Mutex::new(Vec::new()),
            default_response: r#"{"ok": true}"#.to_string(),
            latency: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl ScriptedClient {
    /// Creates a client answering `{"ok": true}` to everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default response.
    #[must_use]
    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// Adds latency to every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues a successful reply.
    #[must_use]
    pub fn then_ok(self, text: impl Into<String>) -> Self {
        self.queue.lock().push_back(Reply::Text(text.into()));
        self
    }

    /// Queues a failure.
    #[must_use]
    pub fn then_err(self, error: GenerationError) -> Self {
        self.queue.lock().push_back(Reply::Fail(error));
        self
    }

    /// Queues a slow reply.
    #[must_use]
    pub fn then_delay(self, delay: Duration) -> Self {
        self.queue.lock().push_back(Reply::Delay(delay));
        self
    }

    /// Replies with `reply` to every prompt containing `needle`.
    #[must_use]
    pub fn on_prompt(self, needle: impl Into<String>, reply: Reply) -> Self {
        self.rules.lock().push(Rule {
            needle: needle.into(),
            reply,
            remaining: None,
        });
        self
    }

    /// Replies with `reply` to the next `times` prompts containing `needle`.
    #[must_use]
    pub fn on_prompt_times(self, needle: impl Into<String>, reply: Reply, times: usize) -> Self {
        self.rules.lock().push(Rule {
            needle: needle.into(),
            reply,
            remaining: Some(times),
        });
        self
    }

    /// Returns every recorded request.
    #[must_use]
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().clone()
    }

    /// Returns how many recorded prompts contain `needle`.
    #[must_use]
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.user_prompt.contains(needle))
            .count()
    }

    /// Returns the highest number of concurrent calls observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &GenerationRequest) -> Reply {
        {
            let mut rules = self.rules.lock();
            if let Some(rule) = rules.iter_mut().find(|r| {
                r.remaining != Some(0) && request.user_prompt.contains(&r.needle)
            }) {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                return rule.reply.clone();
            }
        }
        self.queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| Reply::Text(self.default_response.clone()))
    }
}

#[async_trait]
impl GenerativeClient for ScriptedClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.calls.lock().push(request.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let reply = self.next_reply(request);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail(error) => Err(error),
            Reply::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.default_response.clone())
            }
        }
    }
}

/// A backend whose every operation fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingBackend;

fn unavailable() -> StoreError {
    StoreError::Backend("backend unavailable".to_string())
}

#[async_trait]
impl CacheBackend for FailingBackend {
    async fn read(&self, _key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Err(unavailable())
    }

    async fn write(&self, _entry: &CacheEntry) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn remove(&self, _key: &str) -> Result<bool, StoreError> {
        Err(unavailable())
    }

    async fn list(&self) -> Result<Vec<(String, CacheMetadata)>, StoreError> {
        Err(unavailable())
    }
}
