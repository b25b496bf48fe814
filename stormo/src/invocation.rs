use std::collections::HashMap;

use bytes::Bytes;
use faststr::FastStr;
use metainfo::Forward;

/// A single method call: what the caller wants executed, plus the string
/// attachments that travel with it. Carries no transport state, so cloning
/// one per forked child is cheap.
#[derive(Clone, Debug, Default)]
pub struct Invocation {
    method: FastStr,
    parameter_types: Vec<FastStr>,
    arguments: Vec<Bytes>,
    attachments: HashMap<FastStr, FastStr>,
}

impl Invocation {
    pub fn new(method: impl Into<FastStr>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_parameter_types<T: Into<FastStr>>(
        mut self,
        types: impl IntoIterator<Item = T>,
    ) -> Self {
        self.parameter_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_arguments<B: Into<Bytes>>(mut self, args: impl IntoIterator<Item = B>) -> Self {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    #[inline]
    pub fn method(&self) -> &FastStr {
        &self.method
    }

    #[inline]
    pub fn parameter_types(&self) -> &[FastStr] {
        &self.parameter_types
    }

    #[inline]
    pub fn arguments(&self) -> &[Bytes] {
        &self.arguments
    }

    #[inline]
    pub fn attachment(&self, key: &str) -> Option<&FastStr> {
        self.attachments.get(key)
    }

    #[inline]
    pub fn set_attachment(&mut self, key: impl Into<FastStr>, value: impl Into<FastStr>) {
        self.attachments.insert(key.into(), value.into());
    }

    #[inline]
    pub fn attachments(&self) -> &HashMap<FastStr, FastStr> {
        &self.attachments
    }

    /// Copies the string key/values of the ambient [`metainfo`] context into
    /// this invocation's attachments. Keys already set on the invocation win.
    ///
    /// Outside of a `METAINFO` scope this is a no-op.
    pub fn bind_ambient(&mut self) {
        let _ = metainfo::METAINFO.try_with(|mi| {
            let mi = mi.borrow();
            if let Some(persistents) = mi.get_all_persistents() {
                for (k, v) in persistents {
                    self.attachments
                        .entry(FastStr::new(k))
                        .or_insert_with(|| FastStr::new(v));
                }
            }
            if let Some(transients) = mi.get_all_transients() {
                for (k, v) in transients {
                    self.attachments
                        .entry(FastStr::new(k))
                        .or_insert_with(|| FastStr::new(v));
                }
            }
        });
    }
}

/// The successful half of an invocation outcome: an opaque payload plus reply
/// attachments.
#[derive(Clone, Debug, Default)]
pub struct Reply {
    payload: Option<Bytes>,
    attachments: HashMap<FastStr, FastStr>,
}

impl Reply {
    /// The empty successful reply, returned by the fail-safe and fail-back
    /// strategies in place of an error.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: Some(payload.into()),
            attachments: HashMap::new(),
        }
    }

    #[inline]
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    #[inline]
    pub fn attachment(&self, key: &str) -> Option<&FastStr> {
        self.attachments.get(key)
    }

    #[inline]
    pub fn set_attachment(&mut self, key: impl Into<FastStr>, value: impl Into<FastStr>) {
        self.attachments.insert(key.into(), value.into());
    }
}
