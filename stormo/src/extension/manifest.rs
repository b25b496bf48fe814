//! Text manifests binding extension names to factory symbols.
//!
//! A manifest is the in-code analog of an extension descriptor file: one
//! `name=symbol` entry per line, `#` starts a comment, blank lines are
//! skipped. Manifests come in three tiers loaded in order; a later tier may
//! override a wrapper entry, while a second plain binding of a name is
//! recorded as a duplicate.

use std::{collections::HashMap, sync::Arc};

use faststr::FastStr;

use super::{
    ExtensionError, ExtensionLoader, ExtensionRegistry, PlainFactory, WrapperFactory,
};

/// Where a manifest comes from. Tiers are loaded internal-first; the tier is
/// carried for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestTier {
    Internal,
    Public,
    Compat,
}

enum Provider<T: ?Sized> {
    Plain(PlainFactory<T>),
    Wrapper(WrapperFactory<T>),
    Adaptive(PlainFactory<T>),
}

impl<T: ?Sized> Clone for Provider<T> {
    fn clone(&self) -> Self {
        match self {
            Provider::Plain(f) => Provider::Plain(f.clone()),
            Provider::Wrapper(f) => Provider::Wrapper(f.clone()),
            Provider::Adaptive(f) => Provider::Adaptive(f.clone()),
        }
    }
}

/// The symbol table a manifest resolves against.
pub struct ManifestProviders<T: ?Sized> {
    symbols: HashMap<FastStr, Provider<T>>,
}

impl<T: ?Sized> Default for ManifestProviders<T> {
    fn default() -> Self {
        Self {
            symbols: HashMap::new(),
        }
    }
}

impl<T: ?Sized> ManifestProviders<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plain<F>(mut self, symbol: impl Into<FastStr>, factory: F) -> Self
    where
        F: Fn(&ExtensionRegistry) -> Arc<T> + Send + Sync + 'static,
    {
        self.symbols
            .insert(symbol.into(), Provider::Plain(Arc::new(factory)));
        self
    }

    pub fn wrapper<F>(mut self, symbol: impl Into<FastStr>, factory: F) -> Self
    where
        F: Fn(Arc<T>, &ExtensionRegistry) -> Arc<T> + Send + Sync + 'static,
    {
        self.symbols
            .insert(symbol.into(), Provider::Wrapper(Arc::new(factory)));
        self
    }

    pub fn adaptive<F>(mut self, symbol: impl Into<FastStr>, factory: F) -> Self
    where
        F: Fn(&ExtensionRegistry) -> Arc<T> + Send + Sync + 'static,
    {
        self.symbols
            .insert(symbol.into(), Provider::Adaptive(Arc::new(factory)));
        self
    }
}

impl<T: ?Sized + Send + Sync + 'static> ExtensionLoader<T> {
    /// Parses `text` and registers every entry against `providers`.
    ///
    /// Syntax errors abort the load; an entry whose symbol is unknown is
    /// recorded as a deferred load error for its name and surfaces when that
    /// name is requested.
    pub fn load_manifest(
        &self,
        tier: ManifestTier,
        text: &str,
        providers: &ManifestProviders<T>,
    ) -> Result<(), ExtensionError> {
        for (idx, raw_line) in text.lines().enumerate() {
            let line = match raw_line.find('#') {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let Some((name, symbol)) = line.split_once('=') else {
                return Err(ExtensionError::BadManifest {
                    line: idx + 1,
                    text: line.to_string(),
                });
            };
            let name = FastStr::new(name.trim());
            let symbol = FastStr::new(symbol.trim());
            if name.is_empty() || symbol.is_empty() {
                return Err(ExtensionError::BadManifest {
                    line: idx + 1,
                    text: line.to_string(),
                });
            }
            match providers.symbols.get(&symbol) {
                Some(Provider::Plain(factory)) => {
                    self.register_plain(name, factory.clone());
                }
                Some(Provider::Wrapper(factory)) => {
                    self.register_wrapper_factory(name, factory.clone());
                }
                Some(Provider::Adaptive(factory)) => {
                    self.register_adaptive_factory(Some(name), factory.clone());
                }
                None => {
                    tracing::warn!(
                        "[STORMO] manifest ({tier:?}) entry {name:?} refers to unknown symbol {symbol:?}"
                    );
                    self.record_error(
                        name.clone(),
                        ExtensionError::UnresolvedSymbol {
                            capability: self.capability(),
                            name,
                            symbol,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}
