use std::{any::Any, fmt, sync::Arc};

use crate::{
    error::{Error, Result},
    value::HostRef,
};

/// Zero-based index of an object in a [`ReferenceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(usize);

impl Handle {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Handle> for serde_json::Value {
    fn from(handle: Handle) -> Self {
        handle.0.into()
    }
}

/// Append-only table of host objects handed to the guest by handle.
///
/// Entries live as long as the table; there is no removal, so a long-running
/// session grows the table with every fresh reference it hands out.
#[derive(Default)]
pub struct ReferenceTable {
    entries: Vec<Arc<dyn Any + Send + Sync>>,
}

impl ReferenceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, object: Arc<dyn Any + Send + Sync>) -> Handle {
        self.entries.push(object);
        Handle(self.entries.len() - 1)
    }

    /// Resolve a handle as received on the wire.
    ///
    /// # Errors
    /// Returns [`Error::InvalidHandle`] for negative or out-of-range handles.
    pub fn get(&self, handle: i64) -> Result<HostRef> {
        usize::try_from(handle)
            .ok()
            .and_then(|index| {
                self.entries
                    .get(index)
                    .map(|object| HostRef::with_handle(Handle(index), Arc::clone(object)))
            })
            .ok_or(Error::InvalidHandle {
                handle,
                len: self.entries.len(),
            })
    }

    /// Handle for `reference`, reusing the one it was resolved from when it
    /// still names the same object in this table.
    pub fn insert(&mut self, reference: &HostRef) -> Handle {
        match self.find(reference) {
            Some(handle) => handle,
            None => self.put(Arc::clone(reference.object())),
        }
    }

    /// The handle `reference` already has in this table, if any.
    #[must_use]
    pub fn find(&self, reference: &HostRef) -> Option<Handle> {
        reference.handle().filter(|handle| {
            self.entries
                .get(handle.index())
                .is_some_and(|object| Arc::ptr_eq(object, reference.object()))
        })
    }

    /// Handle the next [`Self::put`] will return.
    #[must_use]
    pub const fn next_handle(&self) -> Handle {
        Handle(self.entries.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ReferenceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceTable")
            .field("len", &self.entries.len())
            .finish()
    }
}
