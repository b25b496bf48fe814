use std::cmp::Ordering;

use faststr::FastStr;

use crate::url::Url;

/// Conditions and ordering directives for group activation.
#[derive(Clone, Debug, Default)]
pub struct ActivateMeta {
    /// Groups this implementation activates for; empty means every group.
    pub group: Vec<FastStr>,
    /// When set, the implementation only activates if the url carries this
    /// parameter with a non-empty value.
    pub value: Option<FastStr>,
    pub order: i32,
    /// Names this implementation must precede.
    pub before: Vec<FastStr>,
    /// Names this implementation must follow.
    pub after: Vec<FastStr>,
}

impl ActivateMeta {
    pub fn for_group<G: Into<FastStr>>(groups: impl IntoIterator<Item = G>) -> Self {
        Self {
            group: groups.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn value(mut self, key: impl Into<FastStr>) -> Self {
        self.value = Some(key.into());
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn before<N: Into<FastStr>>(mut self, names: impl IntoIterator<Item = N>) -> Self {
        self.before = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn after<N: Into<FastStr>>(mut self, names: impl IntoIterator<Item = N>) -> Self {
        self.after = names.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn accepts_group(&self, group: &str) -> bool {
        self.group.is_empty() || self.group.iter().any(|g| g == group)
    }

    pub(crate) fn url_condition_holds(&self, url: &Url) -> bool {
        match &self.value {
            None => true,
            Some(key) => url.param(key).is_some_and(|v| !v.is_empty()),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ActivateEntry {
    pub(crate) name: FastStr,
    pub(crate) meta: ActivateMeta,
    pub(crate) index: usize,
}

/// Orders activate entries by `before`/`after` directives, then `order`.
///
/// The comparison never yields `Equal`: entries with the same `order` fall
/// back to registration index, so order-sensitive consumers that store the
/// result in set-like structures keep every entry.
pub(crate) fn sort_activates(entries: &mut [ActivateEntry]) {
    entries.sort_by(|a, b| {
        if a.meta.before.contains(&b.name) || b.meta.after.contains(&a.name) {
            return Ordering::Less;
        }
        if a.meta.after.contains(&b.name) || b.meta.before.contains(&a.name) {
            return Ordering::Greater;
        }
        a.meta
            .order
            .cmp(&b.meta.order)
            .then_with(|| a.index.cmp(&b.index))
    });
}
