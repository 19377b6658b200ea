// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hooked root module: persistent hook registry and the trait every
//! hooked model implements.
//!
//! [`HookedRootModule`] is the only requirement for a model to take part
//! in capture and patching.  Its single required forward,
//! [`run_with_spec`](HookedRootModule::run_with_spec), receives a
//! [`HookSpec`] for per-call instrumentation; persistent hooks live in a
//! [`HookRegistry`] that the model owns and snapshots at the start of
//! every pass.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use candle_core::Tensor;

use crate::cache::{ActivationCache, CacheMetadata};
use crate::error::{LensError, Result};
use crate::hooks::{Hook, HookCache, HookFilter, HookPoint, HookSpec};

// ---------------------------------------------------------------------------
// HookRegistry
// ---------------------------------------------------------------------------

/// Identifies one persistent hook registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(u64);

/// How long a persistent hook stays attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookLifetime {
    /// Removed by `reset_hooks(false)`.
    Temporary,
    /// Removed only by `reset_hooks(true)` or its handle.
    Permanent,
}

struct Registration {
    handle: HookHandle,
    filter: HookFilter,
    hook: Hook,
    lifetime: HookLifetime,
}

/// Persistent hooks attached to a model.
///
/// Interior mutability keeps the owning model `Send + Sync` with a
/// `&self` forward.  Each forward takes a [`snapshot`](Self::snapshot), so
/// concurrent registrations never affect an in-flight pass.
#[derive(Default)]
pub struct HookRegistry {
    entries: RwLock<Vec<Registration>>,
    next_handle: AtomicU64,
}

impl HookRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a hook and return its handle.
    pub fn add(&self, filter: HookFilter, hook: Hook, lifetime: HookLifetime) -> HookHandle {
        let handle = HookHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                handle,
                filter,
                hook,
                lifetime,
            });
        handle
    }

    /// Detach the hook with `handle`; returns whether it was present.
    pub fn remove(&self, handle: HookHandle) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|r| r.handle != handle);
        entries.len() != before
    }

    /// Detach temporary hooks, and permanent ones too when
    /// `including_permanent` is set.
    pub fn reset(&self, including_permanent: bool) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if including_permanent {
            entries.clear();
        } else {
            entries.retain(|r| r.lifetime == HookLifetime::Permanent);
        }
    }

    /// Copy of the current hooks in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(HookFilter, Hook)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| (r.filter.clone(), r.hook.clone()))
            .collect()
    }

    /// Number of attached hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no hooks are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// HookGuard
// ---------------------------------------------------------------------------

/// Scoped attachment of hooks; removes exactly its own hooks on drop.
///
/// Dropping happens on normal scope exit, on `?` early return and during
/// unwinding, so the hooks never outlive the scope.
#[must_use = "hooks are removed as soon as the guard is dropped"]
#[derive(Debug)]
pub struct HookGuard<'a> {
    registry: &'a HookRegistry,
    handles: Vec<HookHandle>,
}

impl HookGuard<'_> {
    /// Handles of the hooks this guard owns.
    #[must_use]
    pub fn handles(&self) -> &[HookHandle] {
        &self.handles
    }
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            self.registry.remove(handle);
        }
    }
}

// ---------------------------------------------------------------------------
// HookedRootModule
// ---------------------------------------------------------------------------

/// A model whose forward pass runs through named hook points.
///
/// Implementors provide hook discovery, access to their registry, cache
/// metadata, and a single spec-driven forward.  Capture, patching and
/// persistent hook management are provided on top.
pub trait HookedRootModule: Send + Sync {
    /// Forward input (token ids, or a struct of tensors).
    type Input;

    /// Every hook point reachable in this architecture, in forward order.
    fn hook_points(&self) -> Vec<HookPoint>;

    /// Persistent hooks of this model.
    fn registry(&self) -> &HookRegistry;

    /// Shape metadata stored alongside captured activations.
    fn cache_metadata(&self) -> CacheMetadata;

    /// Run the forward pass with the given per-call instrumentation.
    ///
    /// Persistent hooks run before the spec's hooks at every point.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures and propagates
    /// hook errors.
    fn run_with_spec(&self, input: &Self::Input, spec: &HookSpec) -> Result<HookCache>;

    /// Check that `filter` selects at least one hook point of this model.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if nothing matches.
    fn check_filter(&self, filter: &HookFilter) -> Result<()> {
        if matches!(filter, HookFilter::All) {
            return Ok(());
        }
        if self.hook_points().iter().any(|p| filter.matches(p)) {
            Ok(())
        } else {
            Err(LensError::Hook(format!(
                "{filter:?} matches no hook point of this model"
            )))
        }
    }

    /// Run the model and record every activation selected by `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if `filter` matches nothing, and
    /// propagates forward errors.
    fn run_with_cache<F: Into<HookFilter>>(
        &self,
        input: &Self::Input,
        filter: F,
    ) -> Result<(Tensor, ActivationCache)>
    where
        Self: Sized,
    {
        let filter = filter.into();
        self.check_filter(&filter)?;
        let mut spec = HookSpec::new();
        spec.capture(filter);
        let (output, captures) = self.run_with_spec(input, &spec)?.into_parts();
        Ok((output, ActivationCache::new(captures, self.cache_metadata())))
    }

    /// Run the model with `hooks` attached for this one call.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if a filter matches nothing, and
    /// propagates forward and hook errors.
    fn run_with_hooks(&self, input: &Self::Input, hooks: Vec<(HookFilter, Hook)>) -> Result<Tensor>
    where
        Self: Sized,
    {
        let mut spec = HookSpec::new();
        for (filter, hook) in hooks {
            self.check_filter(&filter)?;
            spec.hook(filter, hook);
        }
        Ok(self.run_with_spec(input, &spec)?.into_output())
    }

    /// Attach a persistent hook.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if `filter` matches no hook point.
    fn add_hook<F: Into<HookFilter>>(
        &self,
        filter: F,
        hook: Hook,
        lifetime: HookLifetime,
    ) -> Result<HookHandle>
    where
        Self: Sized,
    {
        let filter = filter.into();
        self.check_filter(&filter)?;
        Ok(self.registry().add(filter, hook, lifetime))
    }

    /// Detach a persistent hook; returns whether it was attached.
    fn remove_hook(&self, handle: HookHandle) -> bool {
        self.registry().remove(handle)
    }

    /// Detach temporary hooks (and permanent ones if requested).
    fn reset_hooks(&self, including_permanent: bool) {
        self.registry().reset(including_permanent);
    }

    /// Attach `hooks` until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if any filter matches no hook point;
    /// in that case nothing is attached.
    fn hooks(&self, hooks: Vec<(HookFilter, Hook)>) -> Result<HookGuard<'_>>
    where
        Self: Sized,
    {
        for (filter, _) in &hooks {
            self.check_filter(filter)?;
        }
        let registry = self.registry();
        let handles = hooks
            .into_iter()
            .map(|(filter, hook)| registry.add(filter, hook, HookLifetime::Temporary))
            .collect();
        Ok(HookGuard { registry, handles })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn noop() -> Hook {
        Hook::observe(|_, _| Ok(()))
    }

    #[test]
    fn registry_add_remove() {
        let registry = HookRegistry::new();
        let a = registry.add(HookFilter::All, noop(), HookLifetime::Temporary);
        let b = registry.add(HookFilter::All, noop(), HookLifetime::Permanent);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reset_respects_lifetime() {
        let registry = HookRegistry::new();
        registry.add(HookFilter::All, noop(), HookLifetime::Temporary);
        registry.add(HookFilter::All, noop(), HookLifetime::Permanent);
        registry.reset(false);
        assert_eq!(registry.len(), 1);
        registry.reset(true);
        assert!(registry.is_empty());
    }

    #[test]
    fn guard_removes_only_its_hooks() {
        let registry = HookRegistry::new();
        let kept = registry.add(HookFilter::All, noop(), HookLifetime::Temporary);
        {
            let guard = HookGuard {
                registry: &registry,
                handles: vec![registry.add(HookFilter::All, noop(), HookLifetime::Temporary)],
            };
            assert_eq!(guard.handles().len(), 1);
            assert_eq!(registry.len(), 2);
        }
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(kept));
    }

    #[test]
    fn guard_drops_during_unwind() {
        let registry = HookRegistry::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = HookGuard {
                registry: &registry,
                handles: vec![registry.add(HookFilter::All, noop(), HookLifetime::Temporary)],
            };
            panic!("forward failed");
        }));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }
}
