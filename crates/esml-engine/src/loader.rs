//! Module graph loader
//!
//! One pipeline per module id: fetch, cache probe, transform, recursive
//! dependency import, host execution. Callers importing an id that is
//! already in flight are queued on it and released when it settles.

use crate::cache::{CacheEntry, ContentCache, MemoryCache, content_hash};
use crate::config::{ImportMap, LoaderConfig};
use crate::error::{CacheResult, EngineError, EngineResult};
use crate::fetch::{DefaultTransport, FetchedSource, Transport};
use crate::host::{ExecutionContext, ModuleHost};
use crate::module::{DependencyMap, Exports, ModuleRecord, ModuleStatus, ModuleView};
use crate::pool::TransformPool;
use crate::resolver::{Resolution, ResolutionKind, ScopeResolver};
use crate::transform::TransformOutput;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, try_join_all};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const EVENT_CAPACITY: usize = 256;

/// Which cache probe produced a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheProbe {
    /// Logical id lookup before the fetch finished
    Id,
    /// Content hash lookup after the fetch
    Hash,
}

/// Loader lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderEvent {
    /// Fetch started for a module
    Fetch { id: String },
    /// Fetch delivered bytes
    FetchEnd { id: String },
    /// Transform skipped thanks to the cache
    CacheHit { id: String, probe: CacheProbe },
    /// Revalidation found changed bytes
    UpdateStart { id: String },
    /// Revalidation stored the new artifact
    UpdateEnd { id: String, content_hash: u64 },
    /// Pipeline reached a terminal state
    Settled { id: String, status: ModuleStatus },
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub fetches: u64,
    pub transforms: u64,
    pub cache_hits_by_id: u64,
    pub cache_hits_by_hash: u64,
    pub updates: u64,
    pub executions: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    fetches: AtomicU64,
    transforms: AtomicU64,
    cache_hits_by_id: AtomicU64,
    cache_hits_by_hash: AtomicU64,
    updates: AtomicU64,
    executions: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LoaderStats {
        LoaderStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            transforms: self.transforms.load(Ordering::Relaxed),
            cache_hits_by_id: self.cache_hits_by_id.load(Ordering::Relaxed),
            cache_hits_by_hash: self.cache_hits_by_hash.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
        }
    }
}

type Waiter = oneshot::Sender<EngineResult<ModuleView>>;

/// Registry, pending table and wait-for graph. Guarded by one lock.
#[derive(Default)]
struct LoaderState {
    registry: HashMap<String, Arc<ModuleRecord>>,
    pending: HashMap<String, Vec<Waiter>>,
    /// pending id -> ids it is waiting on
    waits_on: HashMap<String, HashSet<String>>,
}

impl LoaderState {
    /// Record that `waiter` waits on `target`, unless that closes a cycle.
    fn add_wait(&mut self, waiter: &str, target: &str) -> EngineResult<()> {
        if !self.pending.contains_key(waiter) {
            return Ok(());
        }
        if let Some(path) = self.wait_path(target, waiter) {
            let mut chain = Vec::with_capacity(path.len() + 1);
            chain.push(waiter.to_string());
            chain.extend(path);
            return Err(EngineError::CircularDependency { chain });
        }
        self.waits_on
            .entry(waiter.to_string())
            .or_default()
            .insert(target.to_string());
        Ok(())
    }

    /// Path `from -> ... -> to` through the wait-for graph
    fn wait_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.search(from, to, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn search<'s>(
        &'s self,
        node: &'s str,
        to: &str,
        visited: &mut HashSet<&'s str>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(node.to_string());
        if node == to {
            return true;
        }
        if visited.insert(node) {
            if let Some(targets) = self.waits_on.get(node) {
                for next in targets {
                    if self.search(next, to, visited, path) {
                        return true;
                    }
                }
            }
        }
        path.pop();
        false
    }

    /// Dynamic imports add no edge: the importer may never await them.
    /// Importing yourself while pending still can never complete.
    fn add_dynamic_wait(&mut self, waiter: &str, target: &str) -> EngineResult<()> {
        if waiter == target && self.pending.contains_key(waiter) {
            return Err(EngineError::CircularDependency {
                chain: vec![waiter.to_string(), target.to_string()],
            });
        }
        Ok(())
    }

    fn clear_waits(&mut self, id: &str) {
        self.waits_on.remove(id);
        for targets in self.waits_on.values_mut() {
            targets.remove(id);
        }
    }
}

/// How the importer depends on the module it asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    /// Static import: the importer cannot execute before it settles
    Static,
    /// `import()` or a direct call: may be fire-and-forget
    Dynamic,
}

enum Admission {
    Ready(ModuleView),
    Wait(oneshot::Receiver<EngineResult<ModuleView>>),
}

struct LoaderInner {
    config: LoaderConfig,
    resolver: ScopeResolver,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn ContentCache>,
    host: Arc<dyn ModuleHost>,
    pool: TransformPool,
    state: Mutex<LoaderState>,
    events: broadcast::Sender<LoaderEvent>,
    stats: StatCounters,
}

/// Builder for [`ModuleGraphLoader`]
pub struct LoaderBuilder {
    config: LoaderConfig,
    host: Arc<dyn ModuleHost>,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<Arc<dyn ContentCache>>,
}

impl LoaderBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ContentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Build the loader and install the configured import map.
    pub fn build(self) -> EngineResult<ModuleGraphLoader> {
        let resolver = ScopeResolver::new(self.config.base_url.clone());
        resolver.install(&self.config.import_map)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let pool = TransformPool::new(self.config.transform_concurrency);

        Ok(ModuleGraphLoader {
            inner: Arc::new(LoaderInner {
                resolver,
                transport: self
                    .transport
                    .unwrap_or_else(|| Arc::new(DefaultTransport::new())),
                cache: self.cache.unwrap_or_else(|| Arc::new(MemoryCache::new())),
                host: self.host,
                pool,
                state: Mutex::new(LoaderState::default()),
                events,
                stats: StatCounters::default(),
                config: self.config,
            }),
        })
    }
}

/// Dynamic module graph loader. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ModuleGraphLoader {
    inner: Arc<LoaderInner>,
}

impl ModuleGraphLoader {
    /// Loader with the default transport and an in-memory cache
    pub fn new(config: LoaderConfig, host: Arc<dyn ModuleHost>) -> EngineResult<Self> {
        Self::builder(config, host).build()
    }

    pub fn builder(config: LoaderConfig, host: Arc<dyn ModuleHost>) -> LoaderBuilder {
        LoaderBuilder {
            config,
            host,
            transport: None,
            cache: None,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// The content cache backing this loader
    pub fn cache(&self) -> Arc<dyn ContentCache> {
        self.inner.cache.clone()
    }

    /// Replace the installed import map.
    pub fn set_import_map(&self, map: &ImportMap) -> EngineResult<()> {
        self.inner.resolver.install(map)
    }

    /// Resolve without loading
    pub fn resolve(
        &self,
        specifier: &str,
        parent: Option<&ModuleView>,
    ) -> EngineResult<Resolution> {
        self.inner
            .resolver
            .resolve(specifier, parent.map(ModuleView::referrer))
    }

    /// Import a module and everything it depends on.
    ///
    /// With a parent this behaves like `import()` from that module.
    pub async fn import(
        &self,
        specifier: &str,
        parent: Option<&ModuleView>,
    ) -> EngineResult<ModuleView> {
        self.load(specifier, parent, Edge::Dynamic).await
    }

    async fn load(
        &self,
        specifier: &str,
        parent: Option<&ModuleView>,
        edge: Edge,
    ) -> EngineResult<ModuleView> {
        let resolution = self.resolve(specifier, parent)?;
        let name = match resolution.kind {
            ResolutionKind::Mapped => specifier.to_string(),
            ResolutionKind::Inherit | ResolutionKind::Relative => resolution.url.to_string(),
        };

        match self.admit(resolution, name, parent.map(ModuleView::id), edge)? {
            Admission::Ready(view) => Ok(view),
            Admission::Wait(rx) => rx
                .await
                .map_err(|_| EngineError::internal("module pipeline dropped its waiters"))?,
        }
    }

    /// View over a registered module
    pub fn get(&self, id: &str) -> Option<ModuleView> {
        let state = self.inner.state.lock();
        state.registry.get(id).cloned().map(ModuleView::new)
    }

    pub fn status(&self, id: &str) -> Option<ModuleStatus> {
        let state = self.inner.state.lock();
        state.registry.get(id).map(|record| record.status())
    }

    /// Registered module ids, sorted
    pub fn modules(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut ids: Vec<String> = state.registry.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forget a settled module so the next import loads it afresh.
    ///
    /// Views already handed out keep the old record. Pending modules are
    /// never evicted.
    pub fn evict(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock();
        if state.pending.contains_key(id) {
            return false;
        }
        let evicted = state.registry.remove(id).is_some();
        if evicted {
            debug!(id = %id, "module evicted");
        }
        evicted
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> LoaderStats {
        self.inner.stats.snapshot()
    }

    /// Check state and enqueue or create, in one critical section.
    fn admit(
        &self,
        resolution: Resolution,
        name: String,
        parent: Option<&str>,
        edge: Edge,
    ) -> EngineResult<Admission> {
        let id = resolution.url.as_str().to_string();
        let mut state = self.inner.state.lock();

        if let Some(record) = state.registry.get(&id).cloned() {
            match record.status() {
                ModuleStatus::Fulfilled => return Ok(Admission::Ready(ModuleView::new(record))),
                ModuleStatus::Rejected => {
                    return Err(record
                        .error()
                        .unwrap_or_else(|| EngineError::internal("rejected without error")));
                }
                ModuleStatus::Pending => {
                    self.link(&mut state, parent, &id, edge)?;
                    let (tx, rx) = oneshot::channel();
                    state.pending.entry(id).or_default().push(tx);
                    return Ok(Admission::Wait(rx));
                }
            }
        }

        self.link(&mut state, parent, &id, edge)?;

        let record = Arc::new(ModuleRecord::pending(
            resolution.url,
            name,
            resolution.scopes,
        ));
        let (tx, rx) = oneshot::channel();
        state.registry.insert(id.clone(), record.clone());
        state.pending.insert(id, vec![tx]);
        drop(state);

        self.spawn_pipeline(ModuleView::new(record));
        Ok(Admission::Wait(rx))
    }

    fn link(
        &self,
        state: &mut LoaderState,
        parent: Option<&str>,
        id: &str,
        edge: Edge,
    ) -> EngineResult<()> {
        match (self.inner.config.detect_cycles, parent, edge) {
            (true, Some(parent), Edge::Static) => state.add_wait(parent, id),
            (true, Some(parent), Edge::Dynamic) => state.add_dynamic_wait(parent, id),
            _ => Ok(()),
        }
    }

    fn spawn_pipeline(&self, module: ModuleView) {
        let loader = self.clone();
        tokio::spawn(async move {
            let task = {
                let loader = loader.clone();
                let module = module.clone();
                tokio::spawn(async move { loader.run_pipeline(module).await })
            };
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(EngineError::internal(format!("module pipeline failed: {}", e))),
            };
            loader.settle(&module, outcome);
        });
    }

    async fn run_pipeline(&self, module: ModuleView) -> EngineResult<(Exports, DependencyMap)> {
        let id = module.id().to_string();
        let fetch = self.start_fetch(&module);

        let output = match self.cached_by_id(&id).await {
            Some(entry) => {
                StatCounters::bump(&self.inner.stats.cache_hits_by_id);
                self.emit(LoaderEvent::CacheHit {
                    id: id.clone(),
                    probe: CacheProbe::Id,
                });
                if self.inner.config.revalidate_cached {
                    self.spawn_revalidation(id.clone(), entry.content_hash, fetch);
                } else {
                    fetch.abort();
                }
                entry.output()
            }
            None => {
                let source = fetch.await.map_err(|e| EngineError::fetch(&id, e))??;
                self.emit(LoaderEvent::FetchEnd { id: id.clone() });
                self.artifact(&id, source).await?
            }
        };

        let imports: DependencyMap = try_join_all(
            output
                .dependencies
                .iter()
                .map(|specifier| self.import_dependency(specifier.clone(), module.clone())),
        )
        .await?
        .into_iter()
        .collect();

        let ctx = ExecutionContext {
            imports: imports.clone(),
            module: module.clone(),
            loader: self.clone(),
        };

        StatCounters::bump(&self.inner.stats.executions);
        trace!(id = %id, "executing module");
        let exports = self
            .inner
            .host
            .execute(&output.text, ctx)
            .await
            .map_err(|e| EngineError::ExecutionFailure {
                url: id.clone(),
                message: e.message,
            })?;

        Ok((exports, imports))
    }

    fn start_fetch(&self, module: &ModuleView) -> JoinHandle<EngineResult<FetchedSource>> {
        StatCounters::bump(&self.inner.stats.fetches);
        self.emit(LoaderEvent::Fetch {
            id: module.id().to_string(),
        });

        let transport = self.inner.transport.clone();
        let url = module.url().clone();
        tokio::spawn(async move { transport.fetch(&url).await })
    }

    /// Artifact for freshly fetched bytes: hash probe, else transform.
    async fn artifact(&self, id: &str, source: FetchedSource) -> EngineResult<TransformOutput> {
        if !self.inner.config.is_javascript(&source.content_type) {
            return Err(EngineError::UnsupportedContentType {
                url: id.to_string(),
                content_type: source.content_type,
            });
        }

        let hash = content_hash(&source.bytes);

        if let Some(entry) = self.cached_by_hash(hash).await {
            StatCounters::bump(&self.inner.stats.cache_hits_by_hash);
            self.emit(LoaderEvent::CacheHit {
                id: id.to_string(),
                probe: CacheProbe::Hash,
            });
            let output = entry.output();
            if entry.logical_id != id {
                self.store(CacheEntry::new(hash, id, output.clone())).await;
            }
            return Ok(output);
        }

        let output = self.inner.pool.transform(source.bytes).await?;
        StatCounters::bump(&self.inner.stats.transforms);
        self.store(CacheEntry::new(hash, id, output.clone())).await;
        Ok(output)
    }

    /// Finish the fetch behind a cache hit and refresh the cache entry when
    /// the bytes changed. The already loaded record is left alone.
    fn spawn_revalidation(
        &self,
        id: String,
        cached_hash: u64,
        fetch: JoinHandle<EngineResult<FetchedSource>>,
    ) {
        let loader = self.clone();
        tokio::spawn(async move {
            let source = match fetch.await {
                Ok(Ok(source)) => source,
                Ok(Err(e)) => {
                    debug!(id = %id, error = %e, "revalidation fetch failed");
                    return;
                }
                Err(e) => {
                    debug!(id = %id, error = %e, "revalidation fetch task failed");
                    return;
                }
            };
            loader.emit(LoaderEvent::FetchEnd { id: id.clone() });

            if !loader.inner.config.is_javascript(&source.content_type) {
                debug!(id = %id, content_type = %source.content_type, "revalidation skipped");
                return;
            }

            let hash = content_hash(&source.bytes);
            if hash == cached_hash {
                trace!(id = %id, "cached module is current");
                return;
            }

            loader.emit(LoaderEvent::UpdateStart { id: id.clone() });
            match loader.inner.pool.transform(source.bytes).await {
                Ok(output) => {
                    StatCounters::bump(&loader.inner.stats.transforms);
                    loader.store(CacheEntry::new(hash, id.as_str(), output)).await;
                    StatCounters::bump(&loader.inner.stats.updates);
                    debug!(id = %id, hash, "cached module updated");
                    loader.emit(LoaderEvent::UpdateEnd {
                        id,
                        content_hash: hash,
                    });
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "updated module failed to transform");
                    let target = id.clone();
                    loader
                        .cache_call("invalidate", move |cache| cache.invalidate(&target))
                        .await;
                }
            }
        });
    }

    fn import_dependency(
        &self,
        specifier: String,
        parent: ModuleView,
    ) -> BoxFuture<'static, EngineResult<(String, ModuleView)>> {
        let loader = self.clone();
        async move {
            let view = loader.load(&specifier, Some(&parent), Edge::Static).await?;
            Ok((specifier, view))
        }
        .boxed()
    }

    /// Store the outcome and release every waiter, in one critical section.
    fn settle(&self, module: &ModuleView, outcome: EngineResult<(Exports, DependencyMap)>) {
        let id = module.id().to_string();
        let record = module.record();

        let mut state = self.inner.state.lock();
        let waiters = state.pending.remove(&id).unwrap_or_default();
        state.clear_waits(&id);

        let status = match outcome {
            Ok((exports, dependencies)) => {
                record.fulfill(exports, dependencies);
                for waiter in waiters {
                    let _ = waiter.send(Ok(ModuleView::new(record.clone())));
                }
                debug!(id = %id, "module fulfilled");
                ModuleStatus::Fulfilled
            }
            Err(error) => {
                debug!(id = %id, error = %error, "module rejected");
                record.reject(error.clone());
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                ModuleStatus::Rejected
            }
        };
        drop(state);

        self.emit(LoaderEvent::Settled { id, status });
    }

    async fn cached_by_id(&self, id: &str) -> Option<CacheEntry> {
        let id = id.to_string();
        self.cache_call("lookup_by_id", move |cache| cache.lookup_by_id(&id))
            .await
            .flatten()
    }

    async fn cached_by_hash(&self, hash: u64) -> Option<CacheEntry> {
        self.cache_call("lookup_by_hash", move |cache| cache.lookup_by_hash(hash))
            .await
            .flatten()
    }

    async fn store(&self, entry: CacheEntry) {
        self.cache_call("put", move |cache| cache.put(entry)).await;
    }

    /// Run a cache operation on the blocking pool. Failures count as a miss.
    async fn cache_call<T, F>(&self, op: &'static str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ContentCache) -> CacheResult<T> + Send + 'static,
    {
        let cache = self.inner.cache.clone();
        match tokio::task::spawn_blocking(move || f(cache.as_ref())).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "content cache failure");
                None
            }
            Err(e) => {
                warn!(op, error = %e, "content cache task failed");
                None
            }
        }
    }

    fn emit(&self, event: LoaderEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}
