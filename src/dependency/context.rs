//! Named contexts a node provides to its descendants.

use std::any::Any;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use super::{BoxFuture, ContextValue, NodeId};
use crate::error::BoxError;

type DisposeFn = Box<dyn FnOnce(ContextValue) -> BoxFuture<Result<(), BoxError>> + Send + Sync>;

/// What a context's `mounted` factory sees of the node it is registered on.
#[derive(Debug, Clone)]
pub struct MountInfo {
    pub id: NodeId,
    pub name: String,
    pub path: Option<PathBuf>,
}

/// A named value with an optional async teardown.
///
/// ```ignore
/// setup.register(
///     Context::new("pool", |_| Ok(Pool::open()?))
///         .on_dispose(|pool| async move { pool.close().await }),
/// )?;
/// ```
pub struct Context<T> {
    name: String,
    mounted: Box<dyn FnOnce(&MountInfo) -> Result<T, BoxError> + Send + Sync>,
    dispose: Option<Box<dyn FnOnce(Arc<T>) -> BoxFuture<Result<(), BoxError>> + Send + Sync>>,
}

impl<T: Any + Send + Sync> Context<T> {
    pub fn new<F>(name: impl Into<String>, mounted: F) -> Self
    where
        F: FnOnce(&MountInfo) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            mounted: Box::new(mounted),
            dispose: None,
        }
    }

    /// Context whose value is already built.
    pub fn value(name: impl Into<String>, value: T) -> Self {
        Self::new(name, move |_| Ok(value))
    }

    pub fn on_dispose<F, Fut>(mut self, dispose: F) -> Self
    where
        F: FnOnce(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.dispose = Some(Box::new(move |value| Box::pin(dispose(value))));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `mounted` and erase the value type.
    pub(crate) fn mount(self, info: &MountInfo) -> Result<(ContextEntry, Arc<T>), BoxError> {
        let typed = Arc::new((self.mounted)(info)?);
        let value: ContextValue = typed.clone();
        let dispose: Option<DisposeFn> = self.dispose.map(|dispose| {
            Box::new(move |value: ContextValue| -> BoxFuture<Result<(), BoxError>> {
                match value.downcast::<T>() {
                    Ok(typed) => dispose(typed),
                    Err(_) => Box::pin(async { Err("context value changed type".into()) }),
                }
            }) as DisposeFn
        });
        let entry = ContextEntry {
            name: self.name,
            value,
            dispose,
        };
        Ok((entry, typed))
    }
}

/// A mounted context stored on a node.
pub(crate) struct ContextEntry {
    pub(crate) name: String,
    pub(crate) value: ContextValue,
    pub(crate) dispose: Option<DisposeFn>,
}

impl ContextEntry {
    /// Run the teardown, if any.
    pub(crate) async fn dispose(self) -> Result<(), BoxError> {
        match self.dispose {
            Some(dispose) => dispose(self.value).await,
            None => Ok(()),
        }
    }
}

/// Insert or replace `entry` by name. Returns the replaced entry.
pub(crate) fn upsert(entries: &mut Vec<ContextEntry>, entry: ContextEntry) -> Option<ContextEntry> {
    match entries.iter_mut().find(|e| e.name == entry.name) {
        Some(slot) => Some(std::mem::replace(slot, entry)),
        None => {
            entries.push(entry);
            None
        }
    }
}
