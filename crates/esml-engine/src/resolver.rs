//! Import-map scope resolution
//!
//! Maps a specifier plus an optional referring module to a canonical URL,
//! the scope chain the resolved module will itself resolve in, and a tag
//! telling how the result was obtained.
//!
//! Scopes are held in a table keyed by name; chains refer to scopes by
//! name so a module's chain never owns the scopes it points at.

use crate::config::ImportMap;
use crate::error::{EngineError, EngineResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use url::Url;

/// Reference to a scope in the resolver's table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeName {
    /// Named local scope
    Local(String),
    /// The shared global scope
    Global,
}

impl fmt::Display for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeName::Local(name) => f.write_str(name),
            ScopeName::Global => f.write_str("global"),
        }
    }
}

/// Ordered scopes, most specific first, always ending in global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeChain(Vec<ScopeName>);

impl ScopeChain {
    /// Chain containing only the global scope
    pub fn global() -> Self {
        Self(vec![ScopeName::Global])
    }

    /// Local scopes followed by global
    pub fn with_locals<I, S>(locals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut scopes: Vec<ScopeName> = Vec::new();
        for name in locals {
            let scope = ScopeName::Local(name.into());
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        scopes.push(ScopeName::Global);
        Self(scopes)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScopeName> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How a resolution was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    /// Found in an import-map scope
    Mapped,
    /// Relative to the referring module
    Inherit,
    /// Relative to the base URL
    Relative,
}

/// Resolver output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub url: Url,
    pub scopes: ScopeChain,
    pub kind: ResolutionKind,
}

/// The referring module, as far as resolution is concerned
#[derive(Debug, Clone, Copy)]
pub struct Referrer<'a> {
    pub url: &'a Url,
    pub scopes: &'a ScopeChain,
}

#[derive(Debug, Clone)]
struct ScopeEntry {
    target: Url,
    scopes: ScopeChain,
}

type Scope = HashMap<String, Vec<ScopeEntry>>;

#[derive(Debug, Default)]
struct ScopeTable {
    global: Scope,
    local: HashMap<String, Scope>,
}

impl ScopeTable {
    fn scope(&self, name: &ScopeName) -> Option<&Scope> {
        match name {
            ScopeName::Global => Some(&self.global),
            ScopeName::Local(name) => self.local.get(name),
        }
    }

    fn scope_mut(&mut self, name: &ScopeName) -> &mut Scope {
        match name {
            ScopeName::Global => &mut self.global,
            ScopeName::Local(name) => self.local.entry(name.clone()).or_default(),
        }
    }
}

/// Scope-aware specifier resolver
pub struct ScopeResolver {
    base_url: Url,
    table: RwLock<ScopeTable>,
}

impl ScopeResolver {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            table: RwLock::new(ScopeTable::default()),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Install an import map, replacing every previously installed rule.
    ///
    /// Each rule is registered in the global scope and in every local
    /// scope it names. Rules sharing a name within one scope are kept
    /// side by side and make resolution of that name fail.
    pub fn install(&self, map: &ImportMap) -> EngineResult<()> {
        let mut table = ScopeTable::default();

        for rule in &map.imports {
            let target = self.base_url.join(&rule.path).map_err(|e| {
                EngineError::InvalidSpecifier {
                    specifier: rule.path.clone(),
                    base: self.base_url.to_string(),
                    reason: e.to_string(),
                }
            })?;
            let chain = ScopeChain::with_locals(rule.scopes.iter().cloned());

            for scope in chain.iter() {
                table
                    .scope_mut(scope)
                    .entry(rule.name.clone())
                    .or_default()
                    .push(ScopeEntry {
                        target: target.clone(),
                        scopes: chain.clone(),
                    });
            }
        }

        tracing::debug!(rules = map.imports.len(), "import map installed");
        *self.table.write() = table;
        Ok(())
    }

    /// Resolve `specifier` as seen from `referrer`.
    pub fn resolve(
        &self,
        specifier: &str,
        referrer: Option<Referrer<'_>>,
    ) -> EngineResult<Resolution> {
        let global = ScopeChain::global();
        let chain = referrer.map(|r| r.scopes).unwrap_or(&global);

        {
            let table = self.table.read();
            for name in chain.iter() {
                let Some(entries) = table.scope(name).and_then(|scope| scope.get(specifier))
                else {
                    continue;
                };
                return match entries.as_slice() {
                    [entry] => Ok(Resolution {
                        url: entry.target.clone(),
                        scopes: entry.scopes.clone(),
                        kind: ResolutionKind::Mapped,
                    }),
                    _ => Err(EngineError::ResolutionCollision {
                        specifier: specifier.to_string(),
                        scope: name.to_string(),
                    }),
                };
            }
        }

        match referrer {
            Some(referrer) => Ok(Resolution {
                url: join(referrer.url, specifier)?,
                scopes: referrer.scopes.clone(),
                kind: ResolutionKind::Inherit,
            }),
            None => Ok(Resolution {
                url: join(&self.base_url, specifier)?,
                scopes: global,
                kind: ResolutionKind::Relative,
            }),
        }
    }
}

fn join(base: &Url, specifier: &str) -> EngineResult<Url> {
    base.join(specifier)
        .map_err(|e| EngineError::InvalidSpecifier {
            specifier: specifier.to_string(),
            base: base.to_string(),
            reason: e.to_string(),
        })
}
