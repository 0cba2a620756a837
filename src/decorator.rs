//! Memoising and invalidating wrappers around async operations.
//!
//! [`CachedOperation`] serves repeated reads from a [`QueryCache`];
//! [`InvalidatingOperation`] purges tagged reads after a successful write.

use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::cache::QueryCache;
use crate::cache_key::generate_key;

/// Computes a cache key from the operation arguments
pub type KeyGenerator<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

/// How a [`CachedOperation`] stores its results
pub struct CacheOptions<A> {
    /// None uses the cache's default TTL
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    /// None derives the key from the operation name and JSON arguments
    pub key_generator: Option<KeyGenerator<A>>,
    /// Bypass the cache on every call
    pub skip_cache: bool,
}

impl<A> Default for CacheOptions<A> {
    fn default() -> Self {
        Self {
            ttl: None,
            tags: Vec::new(),
            key_generator: None,
            skip_cache: false,
        }
    }
}

impl<A> Clone for CacheOptions<A> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            tags: self.tags.clone(),
            key_generator: self.key_generator.clone(),
            skip_cache: self.skip_cache,
        }
    }
}

impl<A> fmt::Debug for CacheOptions<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("ttl", &self.ttl)
            .field("tags", &self.tags)
            .field("key_generator", &self.key_generator.is_some())
            .field("skip_cache", &self.skip_cache)
            .finish()
    }
}

impl<A> CacheOptions<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_key_generator<G>(mut self, generator: G) -> Self
    where
        G: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    pub fn skip_cache(mut self, skip: bool) -> Self {
        self.skip_cache = skip;
        self
    }
}

/// An async operation whose successful results are memoised.
pub struct CachedOperation<A, V, F> {
    name: String,
    cache: Arc<QueryCache<V>>,
    options: CacheOptions<A>,
    operation: F,
}

impl<A, V, F, Fut, E> CachedOperation<A, V, F>
where
    A: Serialize,
    V: Clone + Serialize,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<V, E>>,
    E: Display,
{
    /// Wraps `operation`; `name` qualifies generated keys, e.g. `WordService.search_words`
    pub fn new(
        cache: Arc<QueryCache<V>>,
        name: impl Into<String>,
        options: CacheOptions<A>,
        operation: F,
    ) -> Self {
        Self {
            name: name.into(),
            cache,
            options,
            operation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The key a call with `args` reads and writes, if one can be built
    pub fn key_for(&self, args: &A) -> Option<String> {
        if let Some(generator) = &self.options.key_generator {
            return Some(generator(args));
        }
        match serde_json::to_value(args) {
            Ok(args) => Some(generate_key(&self.name, &json!({ "args": args }))),
            Err(e) => {
                warn!("Cannot build cache key for {}: {}", self.name, e);
                None
            }
        }
    }

    /// Returns the cached result for `args`, or runs the operation and caches it
    pub async fn call(&self, args: A) -> Result<V, E> {
        if self.options.skip_cache {
            return self.run(args).await;
        }
        let Some(key) = self.key_for(&args) else {
            return self.run(args).await;
        };

        if let Some(cached) = self.cache.get(&key) {
            debug!("Cache hit: {}", key);
            return Ok(cached);
        }

        let value = self.run(args).await?;
        let tags: Vec<&str> = self.options.tags.iter().map(String::as_str).collect();
        self.cache.set(&key, value.clone(), self.options.ttl, &tags);
        debug!("Cache set: {}", key);
        Ok(value)
    }

    /// Runs the operation without reading or writing the cache
    pub async fn call_uncached(&self, args: A) -> Result<V, E> {
        self.run(args).await
    }

    async fn run(&self, args: A) -> Result<V, E> {
        match (self.operation)(args).await {
            Ok(value) => Ok(value),
            Err(e) => {
                error!("Operation {} failed: {}", self.name, e);
                Err(e)
            }
        }
    }
}

/// An async write that invalidates cached reads by tag once it succeeds.
pub struct InvalidatingOperation<V, F> {
    name: String,
    cache: Arc<QueryCache<V>>,
    tags: Vec<String>,
    operation: F,
}

impl<V, F> InvalidatingOperation<V, F>
where
    V: Clone + Serialize,
{
    pub fn new<I, S>(cache: Arc<QueryCache<V>>, name: impl Into<String>, tags: I, operation: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            cache,
            tags: tags.into_iter().map(Into::into).collect(),
            operation,
        }
    }

    pub async fn call<A, T, E, Fut>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        match (self.operation)(args).await {
            Ok(result) => {
                let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
                let invalidated = self.cache.invalidate_by_tags(&tags);
                info!(
                    "Cache invalidated: {} entries for tags: {}",
                    invalidated,
                    self.tags.join(", ")
                );
                Ok(result)
            }
            Err(e) => {
                error!("Operation {} failed: {}", self.name, e);
                Err(e)
            }
        }
    }
}
