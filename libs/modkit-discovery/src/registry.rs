//! Scheme to resolver-builder registry.
//!
//! Populated once at startup and passed explicitly to whatever dials clients.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::resolver::{ClientConn, Resolver, ResolverBuilder, Target};

#[derive(Default, Clone)]
pub struct ResolverRegistry {
    builders: HashMap<String, Arc<dyn ResolverBuilder>>,
}

impl ResolverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `builder` under its scheme, returning the builder it replaced.
    pub fn register(&mut self, builder: Arc<dyn ResolverBuilder>) -> Option<Arc<dyn ResolverBuilder>> {
        let scheme = builder.scheme().to_owned();
        let previous = self.builders.insert(scheme.clone(), builder);
        if previous.is_some() {
            tracing::warn!(scheme = %scheme, "resolver builder replaced");
        }
        previous
    }

    #[must_use]
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.get(scheme).cloned()
    }

    /// Registered schemes, sorted.
    #[must_use]
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.builders.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Parse `target` and build a resolver for it with the builder of its scheme.
    ///
    /// # Errors
    /// Returns `InvalidTarget` for an unparsable target, `UnknownScheme` when no
    /// builder is registered for its scheme, or the builder's own error.
    pub async fn build(
        &self,
        target: &str,
        conn: Arc<dyn ClientConn>,
    ) -> DiscoveryResult<Box<dyn Resolver>> {
        let target = Target::parse(target)?;
        let builder = self
            .get(&target.scheme)
            .ok_or_else(|| DiscoveryError::UnknownScheme {
                scheme: target.scheme.clone(),
            })?;
        builder.build(&target, conn).await
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}
