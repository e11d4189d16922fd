//! Host execution contract.
//!
//! The host owns the JavaScript engine. It receives the rewritten body
//! (see [`crate::transform`]) and evaluates it as an async function over
//! [`FACTORY_PARAMS`](crate::transform::FACTORY_PARAMS).

use crate::loader::ModuleGraphLoader;
use crate::module::{DependencyMap, Exports, ModuleView};
use async_trait::async_trait;
use thiserror::Error;

/// Error raised by a module body
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;

/// Everything a body needs besides its text
#[derive(Clone)]
pub struct ExecutionContext {
    /// `__imports__`: specifier -> dependency
    pub imports: DependencyMap,
    /// `__self__`: the module being executed
    pub module: ModuleView,
    /// Backs `__import__`; route calls through [`ExecutionContext::import`]
    pub loader: ModuleGraphLoader,
}

impl ExecutionContext {
    /// Dynamic import with this module as parent
    pub async fn import(&self, specifier: &str) -> crate::EngineResult<ModuleView> {
        self.loader.import(specifier, Some(&self.module)).await
    }
}

/// Pluggable JavaScript execution primitive
#[async_trait]
pub trait ModuleHost: Send + Sync {
    /// Evaluate `body` and return the record it produced.
    async fn execute(&self, body: &str, ctx: ExecutionContext) -> HostResult<Exports>;
}
