//! Resource scopes: everything a build opens, released together.

use std::sync::Arc;

use async_trait::async_trait;

/// Something a build opened and someone must eventually release.
#[async_trait]
pub trait ScopedResource: Send + Sync {
    /// Short description for logs.
    fn label(&self) -> String;

    /// Release the resource. Must be safe to call more than once.
    async fn release(&self);
}

/// Owns the resources opened while compiling one graph.
///
/// Resources are released in reverse order of acquisition. `close` is
/// idempotent; a scope dropped without being closed logs a warning, since
/// subprocesses and connections would otherwise outlive their graph.
pub struct ResourceScope {
    owner: String,
    resources: Vec<Arc<dyn ScopedResource>>,
    closed: bool,
}

impl ResourceScope {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            resources: Vec::new(),
            closed: false,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn push(&mut self, resource: Arc<dyn ScopedResource>) {
        self.resources.push(resource);
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let resources = std::mem::take(&mut self.resources);
        tracing::debug!(
            "[ResourceScope] Releasing {} resource(s) for '{}'",
            resources.len(),
            self.owner
        );
        for resource in resources.into_iter().rev() {
            tracing::debug!("[ResourceScope] Releasing {}", resource.label());
            resource.release().await;
        }
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if !self.closed && !self.resources.is_empty() {
            tracing::warn!(
                "[ResourceScope] Scope '{}' dropped with {} unreleased resource(s)",
                self.owner,
                self.resources.len()
            );
        }
    }
}

impl std::fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceScope")
            .field("owner", &self.owner)
            .field("resources", &self.resources.len())
            .field("closed", &self.closed)
            .finish()
    }
}
