//! Subsystem registry and context.
//!
//! A write-only, insertion-ordered, name-unique [`SubsystemsRegistry`] is
//! populated up front, then consumed (`freeze`) into a read-only
//! [`SubsystemsContext`] that every subsystem can use to look up its
//! siblings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::RegistrationConflict;
use crate::future::FutureAny;

/// A long-lived piece of the host application wired into the scheduler's
/// lifecycle.
///
/// * [`get_future`](Subsystem::get_future) exposes a shutdown fence: once
///   it reports done, the subsystem has nothing left to finish.
/// * [`link`](Subsystem::link) is called exactly once, right after every
///   subsystem has been registered, so a subsystem can look up its
///   dependencies by name in the now-frozen [`SubsystemsContext`].
/// * [`tick`](Subsystem::tick) is called once per driving cycle, with the
///   elapsed time since the previous one.
pub trait Subsystem: Send {
    fn get_future(&self) -> FutureAny;
    fn link(&mut self, ctx: &SubsystemsContext);
    fn tick(&mut self, delta: Duration);
}

type Handle = Arc<Mutex<Box<dyn Subsystem>>>;

/// Write-only, pre-freeze collection of subsystems. Insertion order is
/// preserved and becomes tick order; names must be unique.
#[derive(Default)]
pub struct SubsystemsRegistry {
    order: Vec<String>,
    subsystems: HashMap<String, Handle>,
}

impl SubsystemsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `subsystem` under `name`.
    ///
    /// # Errors
    /// Returns [`RegistrationConflict`] if `name` is already taken.
    pub fn add<S>(&mut self, name: impl Into<String>, subsystem: S) -> Result<(), RegistrationConflict>
    where
        S: Subsystem + 'static,
    {
        let name = name.into();
        if self.subsystems.contains_key(&name) {
            return Err(RegistrationConflict(name));
        }
        self.order.push(name.clone());
        self.subsystems
            .insert(name, Arc::new(Mutex::new(Box::new(subsystem))));
        Ok(())
    }

    /// Consumes the registry, builds the read-only [`SubsystemsContext`],
    /// then calls [`Subsystem::link`] on every subsystem with that context
    /// in hand so each can resolve its siblings by name.
    pub fn freeze(self) -> SubsystemsContext {
        let ctx = SubsystemsContext {
            order: self.order,
            subsystems: self.subsystems,
        };
        for name in &ctx.order {
            let handle = ctx.subsystems[name].clone();
            handle.lock().unwrap().link(&ctx);
        }
        ctx
    }
}

/// Read-only, post-freeze view of a set of subsystems, addressable by name.
pub struct SubsystemsContext {
    order: Vec<String>,
    subsystems: HashMap<String, Handle>,
}

impl SubsystemsContext {
    /// Looks up a subsystem by name. Returns a shared, lockable handle so a
    /// linked subsystem can retain it beyond the `link` call.
    pub fn get(&self, name: &str) -> Option<Handle> {
        self.subsystems.get(name).cloned()
    }

    /// Names of every registered subsystem, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Calls [`Subsystem::tick`] on every subsystem, in registration order,
    /// passing the same `delta` to each.
    pub fn tick_all(&self, delta: Duration) {
        for name in &self.order {
            if let Some(handle) = self.subsystems.get(name) {
                handle.lock().unwrap().tick(delta);
            }
        }
    }

    /// Requests cancellation on every subsystem's shutdown fence.
    pub fn begin_shutdown(&self) {
        for name in &self.order {
            if let Some(handle) = self.subsystems.get(name) {
                handle.lock().unwrap().get_future().request_cancel();
            }
        }
    }

    /// True once every subsystem's shutdown fence has settled.
    pub fn all_shutdown(&self) -> bool {
        self.order.iter().all(|name| {
            self.subsystems
                .get(name)
                .map(|handle| handle.lock().unwrap().get_future().is_done())
                .unwrap_or(true)
        })
    }
}
