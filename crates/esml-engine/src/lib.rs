//! esml engine core.
//!
//! Dynamic ES module graph loading with import-map scopes and a
//! content-addressed artifact cache.
//!
//! # Features
//!
//! - **Scoped import maps**: bare names resolve through a module's scope chain
//! - **Source rewrite**: static imports/exports become an injectable factory body
//! - **Single-flight loading**: one pipeline per module id, callers coalesce
//! - **Caching**: artifacts keyed by content hash, stale-while-revalidate by id
//! - **Cycle detection**: a module can never wait on itself
//!
//! # Example
//!
//! ```no_run
//! use esml_engine::{
//!     ExecutionContext, Exports, HostResult, LoaderConfig, ModuleGraphLoader, ModuleHost,
//! };
//! use std::sync::Arc;
//!
//! struct Host;
//!
//! #[async_trait::async_trait]
//! impl ModuleHost for Host {
//!     async fn execute(&self, body: &str, ctx: ExecutionContext) -> HostResult<Exports> {
//!         // hand `body` and `ctx.imports` to the JavaScript engine
//!         Ok(Exports::new())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let loader = ModuleGraphLoader::new(LoaderConfig::default(), Arc::new(Host))?;
//!     let main = loader.import("./main.js", None).await?;
//!     println!("{:?}", main.keys());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod host;
pub mod intercept;
pub mod loader;
pub mod module;
pub mod pool;
pub mod resolver;
pub mod transform;

pub use cache::{CacheEntry, ContentCache, MemoryCache, content_hash};
pub use config::{ImportMap, ImportRule, LoaderConfig};
pub use error::{CacheError, CacheResult, EngineError, EngineResult};
pub use fetch::{DefaultTransport, FetchedSource, Transport};
pub use host::{ExecutionContext, HostError, HostResult, ModuleHost};
pub use intercept::{PACKAGE_PREFIX, PackageInterceptor};
pub use loader::{CacheProbe, LoaderBuilder, LoaderEvent, LoaderStats, ModuleGraphLoader};
pub use module::{DependencyMap, ExportValue, Exports, HostHandle, ModuleStatus, ModuleView};
pub use pool::TransformPool;
pub use resolver::{Referrer, Resolution, ResolutionKind, ScopeChain, ScopeName, ScopeResolver};
pub use transform::{
    DEFAULT_EXPORT_LOCAL, DYNAMIC_IMPORT_PARAM, FACTORY_PARAMS, IMPORTS_PARAM, SELF_PARAM,
    TransformOutput, transform, transform_source,
};
