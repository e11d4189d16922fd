//! Module records and the views handed to callers.

use crate::error::EngineError;
use crate::resolver::{Referrer, ScopeChain};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Opaque value owned by the host (functions, class objects, ...)
pub type HostHandle = Arc<dyn Any + Send + Sync>;

/// Value bound to one export name
#[derive(Clone)]
pub enum ExportValue {
    /// Plain data
    Data(serde_json::Value),
    /// A whole module (namespace import, `export * as ns`)
    Namespace(ModuleView),
    /// Host-owned value
    Opaque(HostHandle),
}

impl ExportValue {
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            ExportValue::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_namespace(&self) -> Option<&ModuleView> {
        match self {
            ExportValue::Namespace(view) => Some(view),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for ExportValue {
    fn from(value: serde_json::Value) -> Self {
        ExportValue::Data(value)
    }
}

impl PartialEq for ExportValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExportValue::Data(a), ExportValue::Data(b)) => a == b,
            (ExportValue::Namespace(a), ExportValue::Namespace(b)) => a.same_record(b),
            (ExportValue::Opaque(a), ExportValue::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for ExportValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportValue::Data(value) => write!(f, "Data({})", value),
            ExportValue::Namespace(view) => write!(f, "Namespace({})", view.id()),
            ExportValue::Opaque(_) => f.write_str("Opaque"),
        }
    }
}

/// Export table, ordered by name
pub type Exports = BTreeMap<String, ExportValue>;

/// Dependency map injected into a module body: specifier -> module
pub type DependencyMap = HashMap<String, ModuleView>;

/// Lifecycle state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Pending,
    Fulfilled,
    Rejected,
}

#[derive(Debug, Clone)]
pub(crate) enum ModuleState {
    Pending,
    Fulfilled {
        exports: Exports,
        dependencies: DependencyMap,
    },
    Rejected(EngineError),
}

/// Canonical record for one module id
#[derive(Debug)]
pub struct ModuleRecord {
    id: String,
    name: String,
    url: Url,
    scopes: ScopeChain,
    state: RwLock<ModuleState>,
}

impl ModuleRecord {
    pub(crate) fn pending(url: Url, name: String, scopes: ScopeChain) -> Self {
        Self {
            id: url.as_str().to_string(),
            name,
            url,
            scopes,
            state: RwLock::new(ModuleState::Pending),
        }
    }

    pub(crate) fn fulfill(&self, exports: Exports, dependencies: DependencyMap) {
        *self.state.write() = ModuleState::Fulfilled {
            exports,
            dependencies,
        };
    }

    pub(crate) fn reject(&self, error: EngineError) {
        *self.state.write() = ModuleState::Rejected(error);
    }

    pub(crate) fn status(&self) -> ModuleStatus {
        match &*self.state.read() {
            ModuleState::Pending => ModuleStatus::Pending,
            ModuleState::Fulfilled { .. } => ModuleStatus::Fulfilled,
            ModuleState::Rejected(_) => ModuleStatus::Rejected,
        }
    }

    pub(crate) fn error(&self) -> Option<EngineError> {
        match &*self.state.read() {
            ModuleState::Rejected(error) => Some(error.clone()),
            _ => None,
        }
    }
}

/// Read-only handle over a shared record.
///
/// Views are cheap to clone and distinct per caller; every read goes to
/// the canonical record, so export reads always see its current table.
#[derive(Clone)]
pub struct ModuleView {
    record: Arc<ModuleRecord>,
}

impl ModuleView {
    pub(crate) fn new(record: Arc<ModuleRecord>) -> Self {
        Self { record }
    }

    /// Canonical absolute URL
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Import-map name for mapped modules, the id otherwise
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn url(&self) -> &Url {
        &self.record.url
    }

    pub fn scopes(&self) -> &ScopeChain {
        &self.record.scopes
    }

    pub fn status(&self) -> ModuleStatus {
        self.record.status()
    }

    /// Rejection reason, if the module failed
    pub fn error(&self) -> Option<EngineError> {
        self.record.error()
    }

    /// Read one export
    pub fn get(&self, key: &str) -> Option<ExportValue> {
        match &*self.record.state.read() {
            ModuleState::Fulfilled { exports, .. } => exports.get(key).cloned(),
            _ => None,
        }
    }

    /// Export names, in order
    pub fn keys(&self) -> Vec<String> {
        match &*self.record.state.read() {
            ModuleState::Fulfilled { exports, .. } => exports.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Snapshot of the export table
    pub fn exports(&self) -> Option<Exports> {
        match &*self.record.state.read() {
            ModuleState::Fulfilled { exports, .. } => Some(exports.clone()),
            _ => None,
        }
    }

    /// Dependency map the body was executed with
    pub fn dependencies(&self) -> Option<DependencyMap> {
        match &*self.record.state.read() {
            ModuleState::Fulfilled { dependencies, .. } => Some(dependencies.clone()),
            _ => None,
        }
    }

    /// Whether both views front the same canonical record
    pub fn same_record(&self, other: &ModuleView) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }

    /// This module as the parent of a nested resolution
    pub fn referrer(&self) -> Referrer<'_> {
        Referrer {
            url: &self.record.url,
            scopes: &self.record.scopes,
        }
    }

    pub(crate) fn record(&self) -> &Arc<ModuleRecord> {
        &self.record
    }
}

impl fmt::Debug for ModuleView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleView")
            .field("id", &self.record.id)
            .field("name", &self.record.name)
            .field("status", &self.status())
            .finish()
    }
}
