//! Named-implementation resolution for the engine's capability interfaces.
//!
//! Every pluggable seam (load balancer, cluster strategy, router factory) is
//! a trait object resolved by name at runtime. The registry hands out one
//! [`ExtensionLoader`] per capability interface; the loader turns names into
//! wired, wrapped singletons.
//!
//! The moving parts:
//!
//! - *plain* implementations are instantiated once per name and cached;
//! - *wrappers* are decorators applied in registration order around every
//!   plain instance;
//! - the *adaptive* implementation is a dispatcher that picks the concrete
//!   implementation per call from url parameters;
//! - *activate* metadata marks implementations for conditional, ordered
//!   group activation via [`ExtensionLoader::get_active`].
//!
//! Load-time problems (duplicate names, unresolved manifest symbols) are
//! recorded and only surface when someone actually asks for the name.

use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

use dashmap::DashMap;
use faststr::FastStr;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use thiserror::Error;

use crate::{error::RpcError, invocation::Invocation, url::Url};

mod activate;
mod manifest;

pub use activate::ActivateMeta;
use activate::{sort_activates, ActivateEntry};
pub use manifest::{ManifestProviders, ManifestTier};

/// Builds a plain or adaptive instance. The registry is passed in so the
/// implementation can wire its own capability dependencies (typically as
/// adaptive instances) at construction time.
pub type PlainFactory<T> = Arc<dyn Fn(&ExtensionRegistry) -> Arc<T> + Send + Sync>;

/// Decorates an instance; applied in registration order, inside-out.
pub type WrapperFactory<T> = Arc<dyn Fn(Arc<T>, &ExtensionRegistry) -> Arc<T> + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum ExtensionError {
    #[error("no extension named {name:?} for capability {capability} (recorded load errors: {causes:?})")]
    NoSuchExtension {
        capability: &'static str,
        name: FastStr,
        causes: Vec<String>,
    },
    #[error("duplicate extension name {name:?} for capability {capability}")]
    DuplicateName {
        capability: &'static str,
        name: FastStr,
    },
    #[error("more than one adaptive implementation registered for capability {capability}")]
    MultipleAdaptive { capability: &'static str },
    #[error("default extension {name:?} of capability {capability} is its adaptive implementation")]
    CyclicDefault {
        capability: &'static str,
        name: FastStr,
    },
    #[error("manifest line {line} is not a `name=symbol` entry: {text:?}")]
    BadManifest { line: usize, text: String },
    #[error("manifest entry {name:?} refers to unknown symbol {symbol:?} for capability {capability}")]
    UnresolvedSymbol {
        capability: &'static str,
        name: FastStr,
        symbol: FastStr,
    },
}

impl From<ExtensionError> for RpcError {
    fn from(err: ExtensionError) -> Self {
        RpcError::config(err.to_string()).with_source(err)
    }
}

struct LoaderState<T: ?Sized> {
    plain: HashMap<FastStr, PlainFactory<T>>,
    // (name, factory); order is application order, later manifest tiers
    // replace the factory in place
    wrappers: Vec<(FastStr, WrapperFactory<T>)>,
    adaptive: Option<(Option<FastStr>, PlainFactory<T>)>,
    adaptive_dup: bool,
    default_name: Option<FastStr>,
    activates: Vec<ActivateEntry>,
    errors: HashMap<FastStr, ExtensionError>,
}

impl<T: ?Sized> Default for LoaderState<T> {
    fn default() -> Self {
        Self {
            plain: HashMap::new(),
            wrappers: Vec::new(),
            adaptive: None,
            adaptive_dup: false,
            default_name: None,
            activates: Vec::new(),
            errors: HashMap::new(),
        }
    }
}

struct LoaderInner<T: ?Sized> {
    capability: &'static str,
    state: RwLock<LoaderState<T>>,
    instances: DashMap<FastStr, Arc<T>>,
    adaptive_instance: OnceCell<Arc<T>>,
}

/// Resolves named implementations of one capability interface `T` (a trait
/// object type such as `dyn LoadBalance`).
///
/// Cheap to clone; all clones share the same per-capability state.
pub struct ExtensionLoader<T: ?Sized + Send + Sync + 'static> {
    registry: ExtensionRegistry,
    inner: Arc<LoaderInner<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> Clone for ExtensionLoader<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            inner: self.inner.clone(),
        }
    }
}

/// Process-wide home of the per-capability loaders. A cheap-to-clone handle;
/// clones share the same state.
///
/// Registration takes the per-capability write lock; resolution after wiring
/// touches only the singleton cache.
#[derive(Clone)]
pub struct ExtensionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    loaders: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                loaders: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The loader scoped to capability interface `T`, created on first use.
    pub fn load<T: ?Sized + Send + Sync + 'static>(&self) -> ExtensionLoader<T> {
        let id = TypeId::of::<T>();
        if let Some(existing) = self.inner.loaders.read().get(&id) {
            let inner = existing
                .clone()
                .downcast::<LoaderInner<T>>()
                .unwrap_or_else(|_| unreachable!("loader map keyed by TypeId"));
            return ExtensionLoader {
                registry: self.clone(),
                inner,
            };
        }
        let mut loaders = self.inner.loaders.write();
        let entry = loaders.entry(id).or_insert_with(|| {
            Arc::new(LoaderInner::<T> {
                capability: type_name::<T>(),
                state: RwLock::new(LoaderState::default()),
                instances: DashMap::new(),
                adaptive_instance: OnceCell::new(),
            }) as Arc<dyn Any + Send + Sync>
        });
        let inner = entry
            .clone()
            .downcast::<LoaderInner<T>>()
            .unwrap_or_else(|_| unreachable!("loader map keyed by TypeId"));
        ExtensionLoader {
            registry: self.clone(),
            inner,
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> ExtensionLoader<T> {
    /// The capability interface name, used in error messages.
    pub fn capability(&self) -> &'static str {
        self.inner.capability
    }

    /// Declares the implementation name returned by [`get_default`].
    ///
    /// [`get_default`]: ExtensionLoader::get_default
    pub fn set_default(&self, name: impl Into<FastStr>) {
        self.inner.state.write().default_name = Some(name.into());
    }

    /// Registers a plain implementation. The first registration of a name
    /// wins; a duplicate is recorded and surfaces when the name is requested.
    pub fn register<F>(&self, name: impl Into<FastStr>, factory: F)
    where
        F: Fn(&ExtensionRegistry) -> Arc<T> + Send + Sync + 'static,
    {
        self.register_plain(name.into(), Arc::new(factory));
    }

    fn register_plain(&self, name: FastStr, factory: PlainFactory<T>) {
        let mut state = self.inner.state.write();
        if state.plain.contains_key(&name) || state.errors.contains_key(&name) {
            state.errors.insert(
                name.clone(),
                ExtensionError::DuplicateName {
                    capability: self.inner.capability,
                    name,
                },
            );
            return;
        }
        state.plain.insert(name, factory);
    }

    /// Registers a wrapper under a name. Registration order is application
    /// order; re-registering a name replaces the factory in place.
    pub fn register_wrapper<F>(&self, name: impl Into<FastStr>, factory: F)
    where
        F: Fn(Arc<T>, &ExtensionRegistry) -> Arc<T> + Send + Sync + 'static,
    {
        self.register_wrapper_factory(name.into(), Arc::new(factory));
    }

    fn register_wrapper_factory(&self, name: FastStr, factory: WrapperFactory<T>) {
        let mut state = self.inner.state.write();
        if let Some(slot) = state.wrappers.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = factory;
        } else {
            state.wrappers.push((name, factory));
        }
    }

    /// Registers the adaptive (dispatching) implementation. At most one per
    /// capability.
    pub fn register_adaptive<F>(&self, name: Option<FastStr>, factory: F)
    where
        F: Fn(&ExtensionRegistry) -> Arc<T> + Send + Sync + 'static,
    {
        self.register_adaptive_factory(name, Arc::new(factory));
    }

    fn register_adaptive_factory(&self, name: Option<FastStr>, factory: PlainFactory<T>) {
        let mut state = self.inner.state.write();
        if state.adaptive.is_some() {
            state.adaptive_dup = true;
            return;
        }
        state.adaptive = Some((name, factory));
    }

    fn record_error(&self, name: FastStr, err: ExtensionError) {
        self.inner.state.write().errors.insert(name, err);
    }

    /// Attaches activation metadata to a registered name.
    pub fn mark_activate(&self, name: impl Into<FastStr>, meta: ActivateMeta) {
        let mut state = self.inner.state.write();
        let index = state.activates.len();
        state.activates.push(ActivateEntry {
            name: name.into(),
            meta,
            index,
        });
    }

    /// Resolves `name` into its wired, wrapped singleton.
    pub fn get(&self, name: impl AsRef<str>) -> Result<Arc<T>, ExtensionError> {
        let name = name.as_ref();
        if let Some(instance) = self.inner.instances.get(name) {
            return Ok(instance.clone());
        }
        let (factory, wrappers) = {
            let state = self.inner.state.read();
            if let Some(err) = state.errors.get(name) {
                return Err(err.clone());
            }
            let Some(factory) = state.plain.get(name).cloned() else {
                return Err(ExtensionError::NoSuchExtension {
                    capability: self.inner.capability,
                    name: FastStr::new(name),
                    causes: state.errors.values().map(ToString::to_string).collect(),
                });
            };
            (factory, state.wrappers.clone())
        };
        // Instantiate outside the lock. A racing call may build a second
        // instance; the cache keeps whichever landed first, so callers always
        // observe one singleton.
        let mut instance = factory(&self.registry);
        for (_, wrap) in &wrappers {
            instance = wrap(instance, &self.registry);
        }
        let instance = self
            .inner
            .instances
            .entry(FastStr::new(name))
            .or_insert(instance)
            .clone();
        Ok(instance)
    }

    /// The implementation named by the declared default, or `None` when the
    /// capability declares none.
    pub fn get_default(&self) -> Result<Option<Arc<T>>, ExtensionError> {
        let default_name = {
            let state = self.inner.state.read();
            let Some(name) = state.default_name.clone() else {
                return Ok(None);
            };
            if let Some((Some(adaptive_name), _)) = &state.adaptive {
                if *adaptive_name == name {
                    return Err(ExtensionError::CyclicDefault {
                        capability: self.inner.capability,
                        name,
                    });
                }
            }
            name
        };
        self.get(default_name).map(Some)
    }

    /// The single dispatching instance of this capability.
    pub fn get_adaptive(&self) -> Result<Arc<T>, ExtensionError> {
        if let Some(instance) = self.inner.adaptive_instance.get() {
            return Ok(instance.clone());
        }
        let factory = {
            let state = self.inner.state.read();
            if state.adaptive_dup {
                return Err(ExtensionError::MultipleAdaptive {
                    capability: self.inner.capability,
                });
            }
            let Some((name, factory)) = state.adaptive.clone() else {
                return Err(ExtensionError::NoSuchExtension {
                    capability: self.inner.capability,
                    name: FastStr::from_static_str("<adaptive>"),
                    causes: state.errors.values().map(ToString::to_string).collect(),
                });
            };
            if let (Some(adaptive_name), Some(default_name)) = (&name, &state.default_name) {
                if adaptive_name == default_name {
                    return Err(ExtensionError::CyclicDefault {
                        capability: self.inner.capability,
                        name: default_name.clone(),
                    });
                }
            }
            factory
        };
        let instance = factory(&self.registry);
        Ok(self
            .inner
            .adaptive_instance
            .get_or_init(move || instance)
            .clone())
    }

    /// The ordered list of activate-flagged implementations for `group`,
    /// interleaved with the names listed under `url.param(key)`.
    ///
    /// Explicit names appear in their listed order; `-name` excludes an
    /// entry, `-default` drops the flagged block, and the literal `default`
    /// positions the flagged block among the named entries (it goes in front
    /// when absent).
    pub fn get_active(
        &self,
        url: &Url,
        key: &str,
        group: &str,
    ) -> Result<Vec<Arc<T>>, ExtensionError> {
        let names: Vec<FastStr> = url
            .param(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(FastStr::new)
                    .collect()
            })
            .unwrap_or_default();
        let excluded = |name: &str| names.iter().any(|n| n.strip_prefix('-') == Some(name));
        let default_excluded = excluded("default");

        let mut flagged: Vec<ActivateEntry> = Vec::new();
        if !default_excluded {
            let state = self.inner.state.read();
            flagged = state
                .activates
                .iter()
                .filter(|e| {
                    e.meta.accepts_group(group)
                        && !excluded(&e.name)
                        && !names.iter().any(|n| *n == e.name)
                        && e.meta.url_condition_holds(url)
                })
                .cloned()
                .collect();
        }
        sort_activates(&mut flagged);

        let mut flagged_instances = Vec::with_capacity(flagged.len());
        for entry in &flagged {
            flagged_instances.push(self.get(&entry.name)?);
        }

        let mut result = Vec::new();
        let mut placed_default = false;
        for name in &names {
            if name.starts_with('-') {
                continue;
            }
            if name == "default" {
                result.append(&mut flagged_instances);
                placed_default = true;
            } else {
                result.push(self.get(name)?);
            }
        }
        if !placed_default {
            let mut tail = std::mem::take(&mut result);
            result = flagged_instances;
            result.append(&mut tail);
        }
        Ok(result)
    }
}

/// Resolves the implementation name an adaptive dispatcher should forward
/// to: the method-scoped first key, falling back through the global keys in
/// order, then the declared default. When `use_protocol` is set the url's
/// protocol is the name and parameters are ignored.
pub fn resolve_adaptive_name(
    url: &Url,
    invocation: Option<&Invocation>,
    keys: &[&str],
    default: &'static str,
    use_protocol: bool,
) -> FastStr {
    if use_protocol {
        return FastStr::new(url.protocol());
    }
    let mut resolved = default;
    for key in keys.iter().rev() {
        resolved = url.param_or(key, resolved);
    }
    if let (Some(inv), Some(first)) = (invocation, keys.first()) {
        if let Some(scoped) = url.method_param(inv.method(), first) {
            return scoped.clone();
        }
    }
    FastStr::new(resolved)
}
