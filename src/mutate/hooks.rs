//! Typed hook registry for the mutation executor.
//!
//! Hooks are registered per phase and run in registration order. A failing
//! pre-phase hook aborts the operation before the store is touched; post-phase
//! hooks observe the committed event.

use std::collections::HashMap;

use serde_json::Value;

use crate::models::{Entity, Event, EventOp};

use super::MutationError;

/// Hook phases around a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    PreMutation,
    PreCreate,
    PreUpdate,
    PreDelete,
    PostCreate,
    PostUpdate,
    PostDelete,
    PostMutation,
}

/// What a hook sees.
#[derive(Debug)]
pub struct HookContext<'a> {
    pub namespace: &'a str,
    pub op: EventOp,
    /// The entity as of this phase (pre: incoming state; post: committed).
    pub entity: Option<&'a Entity>,
    /// The committed event; present in post phases only.
    pub event: Option<&'a Event>,
    /// The raw update payload, when the operation had one.
    pub update: Option<&'a Value>,
}

type HookFn = Box<dyn Fn(&HookContext<'_>) -> Result<(), MutationError> + Send + Sync>;

/// Removal handle returned by [`HookRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHandle {
    phase: HookPhase,
    id: u64,
}

/// Registry of hooks keyed by phase.
#[derive(Default)]
pub struct HookRegistry {
    next_id: u64,
    hooks: HashMap<HookPhase, Vec<(u64, HookFn)>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook; returns a handle for later removal.
    pub fn register<F>(&mut self, phase: HookPhase, hook: F) -> HookHandle
    where
        F: Fn(&HookContext<'_>) -> Result<(), MutationError> + Send + Sync + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.hooks
            .entry(phase)
            .or_default()
            .push((id, Box::new(hook)));
        HookHandle { phase, id }
    }

    /// Remove a previously registered hook.
    pub fn remove(&mut self, handle: HookHandle) -> bool {
        if let Some(hooks) = self.hooks.get_mut(&handle.phase) {
            let before = hooks.len();
            hooks.retain(|(id, _)| *id != handle.id);
            return hooks.len() != before;
        }
        false
    }

    /// Run all hooks of a phase in registration order. The first error stops
    /// the chain and propagates.
    pub fn run(&self, phase: HookPhase, ctx: &HookContext<'_>) -> Result<(), MutationError> {
        if let Some(hooks) = self.hooks.get(&phase) {
            for (_, hook) in hooks {
                hook(ctx)?;
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(|h| h.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ctx() -> HookContext<'static> {
        HookContext {
            namespace: "posts",
            op: EventOp::Create,
            entity: None,
            event: None,
            update: None,
        }
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.register(HookPhase::PreCreate, move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }

        registry.run(HookPhase::PreCreate, &ctx()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_hook_stops_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HookRegistry::new();

        registry.register(HookPhase::PreUpdate, |_| {
            Err(MutationError::Hook {
                hook: "guard".to_string(),
                message: "rejected".to_string(),
            })
        });
        let calls2 = Arc::clone(&calls);
        registry.register(HookPhase::PreUpdate, move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(registry.run(HookPhase::PreUpdate, &ctx()).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_by_handle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HookRegistry::new();

        let calls2 = Arc::clone(&calls);
        let handle = registry.register(HookPhase::PostMutation, move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(registry.remove(handle));
        assert!(!registry.remove(handle));

        registry.run(HookPhase::PostMutation, &ctx()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_phases_are_independent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HookRegistry::new();

        let calls2 = Arc::clone(&calls);
        registry.register(HookPhase::PreDelete, move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        registry.run(HookPhase::PostDelete, &ctx()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        registry.run(HookPhase::PreDelete, &ctx()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
