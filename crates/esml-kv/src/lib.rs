//! esml KV - durable content cache for the esml module loader
//!
//! Stores transform artifacts in redb (pure Rust, no FFI), keyed by
//! content hash and logical module id.
//!
//! # Usage
//!
//! ```no_run
//! use esml_engine::{LoaderConfig, ModuleGraphLoader};
//! use esml_kv::RedbCache;
//! use std::sync::Arc;
//!
//! # fn host() -> Arc<dyn esml_engine::ModuleHost> { unimplemented!() }
//! let cache = RedbCache::open("./.esml/cache.redb")?;   // file-based
//! let loader = ModuleGraphLoader::builder(LoaderConfig::default(), host())
//!     .cache(Arc::new(cache))
//!     .build()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod store;

pub use store::RedbCache;
