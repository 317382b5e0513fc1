//! Nested property views
//!
//! A `NestedProperty` addresses values inside the graph held by one
//! property cell using dotted paths. Writes mutate the graph in place.
//! Nested listeners registered on the view are re-fired with the freshly
//! resolved value after every write through the view whose path overlaps
//! theirs (one path is a prefix of the other).

use std::fmt;
use std::sync::Arc;

use keystate_core::{
    assign, resolve, NestedPath, StateError, StateResult, StateValue, SubscriptionId, Value,
};
use parking_lot::Mutex;
use tracing::trace;

use crate::property::{Listener, PropertyCell};

struct NestedListener {
    id: SubscriptionId,
    path: NestedPath,
    listener: Listener,
}

/// Path-addressed view over a property's value graph
pub struct NestedProperty {
    cell: Arc<PropertyCell>,
    listeners: Mutex<Vec<NestedListener>>,
}

impl NestedProperty {
    /// Standalone view owning `root`
    pub fn new(root: impl Into<Value>) -> Self {
        NestedProperty::from_cell(Arc::new(PropertyCell::new(
            "<nested>",
            Some(root.into()),
        )))
    }

    pub(crate) fn from_cell(cell: Arc<PropertyCell>) -> Self {
        NestedProperty {
            cell,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the whole graph
    pub fn root(&self) -> Option<Value> {
        self.cell.snapshot()
    }

    /// Resolve `path` and convert the result to `V`
    pub fn get_nested_value<V: StateValue>(&self, path: &str) -> StateResult<Option<V>> {
        match self.get_nested_raw(path)? {
            None => Ok(None),
            Some(raw) => V::from_value(&raw)
                .map(Some)
                .ok_or_else(|| StateError::TypeMismatch {
                    key: path.to_string(),
                    expected: V::TYPE_NAME,
                    found: raw.type_name().to_string(),
                }),
        }
    }

    /// Resolve `path`; `None` when the root or any segment is missing
    pub fn get_nested_raw(&self, path: &str) -> StateResult<Option<Value>> {
        let path = NestedPath::parse(path)?;
        Ok(self
            .cell
            .with_value(|root| root.and_then(|r| resolve(r, &path)).cloned()))
    }

    /// Write `value` at `path`, creating missing intermediate maps
    pub fn set_nested_value(&self, path: &str, value: impl Into<Value>) -> StateResult<()> {
        if !self.cell.with_value(|root| root.is_some()) {
            return Err(StateError::invalid_state(format!(
                "cannot set '{path}': '{}' has no root value",
                self.cell.label()
            )));
        }
        let path = NestedPath::parse(path)?;
        let value = value.into();
        self.cell.mutate(|root| assign(root, &path, value))?;
        trace!(key = %self.cell.label(), path = %path, "nested value written");

        self.refire(&path);
        Ok(())
    }

    /// Listen to the value at `path`, replaying it now if present
    pub fn add_nested_listener<F>(&self, path: &str, listener: F) -> StateResult<SubscriptionId>
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        let path = NestedPath::parse(path)?;
        let id = SubscriptionId::next();
        let listener: Listener = Arc::new(listener);

        self.listeners.lock().push(NestedListener {
            id,
            path: path.clone(),
            listener: Arc::clone(&listener),
        });

        let current = self.resolve_owned(&path);
        if current.is_some() {
            self.cell.invoke(id, &listener, current.as_ref());
        }
        Ok(id)
    }

    pub fn remove_nested_listener(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn nested_listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn resolve_owned(&self, path: &NestedPath) -> Option<Value> {
        self.cell
            .with_value(|root| root.and_then(|r| resolve(r, path)).cloned())
    }

    fn refire(&self, written: &NestedPath) {
        let affected: Vec<(SubscriptionId, NestedPath, Listener)> = self
            .listeners
            .lock()
            .iter()
            .filter(|l| overlaps(&l.path, written))
            .map(|l| (l.id, l.path.clone(), Arc::clone(&l.listener)))
            .collect();

        for (id, path, listener) in &affected {
            let value = self.resolve_owned(path);
            self.cell.invoke(*id, listener, value.as_ref());
        }
    }
}

fn overlaps(a: &NestedPath, b: &NestedPath) -> bool {
    a.segments()
        .iter()
        .zip(b.segments())
        .all(|(x, y)| x == y)
}

impl fmt::Debug for NestedProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedProperty")
            .field("name", &self.cell.label())
            .field("root", &self.cell.snapshot())
            .field("listeners", &self.nested_listener_count())
            .finish()
    }
}
