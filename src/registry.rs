//! Per-port interface registry with interpose stacks.
//!
//! Each `(addr, interface type)` key owns a stack of layers ordered
//! innermost-to-outermost: index 0 is the driver's original implementation,
//! every interpose pushes a new layer on top. A layer never points at its
//! neighbours; instead the interposer receives a handle to the layer it
//! shadows at interpose time and forwards to that handle from then on.
//!
//! Lookups for a device address fall back to the port-wide entry (`addr -1`)
//! when the address has no stack of its own.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use crate::error::AsynResult;
use crate::interfaces::InterfaceType;

/// Unique identifier of one registered interface layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerId(pub u64);

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Address key of port-wide entries.
pub(crate) const PORT_ADDR: i32 = -1;

#[derive(Clone)]
struct Layer {
    id: LayerId,
    /// Holds an `Arc<T>` for the interface's trait object type `T`.
    methods: Arc<dyn Any + Send + Sync>,
}

impl Layer {
    fn new<T: InterfaceType + ?Sized>(methods: Arc<T>) -> Self {
        Self {
            id: LayerId(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed)),
            methods: Arc::new(methods),
        }
    }

    fn typed<T: InterfaceType + ?Sized>(&self, depth: usize) -> AsynResult<Interface<T>> {
        match (*self.methods).downcast_ref::<Arc<T>>() {
            Some(methods) => Ok(Interface {
                methods: Arc::clone(methods),
                layer: self.id,
                depth,
            }),
            None => asyn_err!(NotFound, "{} registered with a different type", T::NAME),
        }
    }
}

/// A resolved interface layer.
///
/// Dereferences to the interface trait object.
pub struct Interface<T: ?Sized> {
    methods: Arc<T>,
    layer: LayerId,
    depth: usize,
}

impl<T: ?Sized> Interface<T> {
    /// Gets the trait object.
    #[inline]
    pub fn methods(&self) -> &Arc<T> {
        &self.methods
    }

    /// Gets the layer identifier, usable as a key for per-user layer data.
    #[inline]
    pub fn layer(&self) -> LayerId {
        self.layer
    }

    /// Gets the position in the stack; 0 is the driver's own implementation.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl<T: ?Sized> Clone for Interface<T> {
    fn clone(&self) -> Self {
        Self {
            methods: Arc::clone(&self.methods),
            layer: self.layer,
            depth: self.depth,
        }
    }
}

impl<T: ?Sized> Deref for Interface<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.methods
    }
}

impl<T: ?Sized> fmt::Debug for Interface<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("layer", &self.layer)
            .field("depth", &self.depth)
            .finish()
    }
}

/// Interface table of one port.
///
/// Written at configuration time, read on every lookup; guarded by a
/// read-write lock so lookups proceed concurrently.
pub(crate) struct InterfaceRegistry {
    stacks: RwLock<BTreeMap<(i32, &'static str), Vec<Layer>>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self {
            stacks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registers the driver's implementation of `T` at `addr`.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if `T` already has an entry at exactly `addr`.
    pub fn register<T: InterfaceType + ?Sized>(&self, addr: i32, methods: Arc<T>) -> AsynResult<Interface<T>> {
        let mut stacks = self.stacks.write();
        if stacks.contains_key(&(addr, T::NAME)) {
            return asyn_err!(AlreadyRegistered, "{} already registered at addr {}", T::NAME, addr);
        }
        let layer = Layer::new(methods);
        let handle = layer.typed(0)?;
        stacks.insert((addr, T::NAME), vec![layer]);
        Ok(handle)
    }

    /// Pushes a new layer of `T` at `addr` and returns the layer it shadows.
    ///
    /// If `addr` has no stack of its own the port-wide stack is copied first,
    /// so the new layer shadows what lookups at `addr` resolved to until now.
    ///
    /// # Errors
    ///
    /// `NotFound` if `T` was never registered for `addr` or the port.
    pub fn interpose<T: InterfaceType + ?Sized>(
        &self,
        addr: i32,
        methods: Arc<T>,
    ) -> AsynResult<(Interface<T>, Interface<T>)> {
        self.interpose_with(addr, |_| methods)
    }

    /// Like [`interpose`](Self::interpose), but the new layer is built from
    /// the layer it shadows, so it is never visible without it.
    ///
    /// `build` runs with the registry locked and must not call back into it.
    pub fn interpose_with<T, F>(&self, addr: i32, build: F) -> AsynResult<(Interface<T>, Interface<T>)>
    where
        T: InterfaceType + ?Sized,
        F: FnOnce(Interface<T>) -> Arc<T>,
    {
        let mut stacks = self.stacks.write();
        if !stacks.contains_key(&(addr, T::NAME)) {
            let inherited = match stacks.get(&(PORT_ADDR, T::NAME)) {
                Some(port_stack) => port_stack.clone(),
                None => return asyn_err!(NotFound, "{} not registered at addr {}", T::NAME, addr),
            };
            stacks.insert((addr, T::NAME), inherited);
        }
        let stack = match stacks.get_mut(&(addr, T::NAME)) {
            Some(stack) => stack,
            None => return asyn_err!(NotFound, "{} not registered at addr {}", T::NAME, addr),
        };

        let depth = stack.len();
        let previous: Interface<T> = match stack.last() {
            Some(top) => top.typed(depth - 1)?,
            None => return asyn_err!(NotFound, "{} has an empty stack", T::NAME),
        };
        let layer = Layer::new(build(previous.clone()));
        let handle = layer.typed(depth)?;
        stack.push(layer);
        Ok((handle, previous))
    }

    /// Resolves `T` at `addr`: the top layer, or the bottom one when
    /// `interpose_ok` is false.
    pub fn find<T: InterfaceType + ?Sized>(&self, addr: i32, interpose_ok: bool) -> AsynResult<Interface<T>> {
        let stacks = self.stacks.read();
        let stack = stacks
            .get(&(addr, T::NAME))
            .or_else(|| stacks.get(&(PORT_ADDR, T::NAME)));
        let Some(stack) = stack else {
            return asyn_err!(NotFound, "{} not registered at addr {}", T::NAME, addr);
        };
        let depth = if interpose_ok { stack.len() - 1 } else { 0 };
        stack[depth].typed(depth)
    }

    /// Lists `(addr, name, stack depth)` for every registered key.
    pub fn entries(&self) -> Vec<(i32, &'static str, usize)> {
        self.stacks
            .read()
            .iter()
            .map(|((addr, name), stack)| (*addr, *name, stack.len()))
            .collect()
    }

    /// Drops every layer.
    pub fn clear(&self) {
        self.stacks.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{Int32, Octet};
    use crate::user::AsynUser;

    struct Constant(i32);

    impl Int32 for Constant {
        fn write(&self, _user: &AsynUser, _value: i32) -> AsynResult {
            Ok(())
        }

        fn read(&self, _user: &AsynUser) -> AsynResult<i32> {
            Ok(self.0)
        }
    }

    fn constant(value: i32) -> Arc<dyn Int32> {
        Arc::new(Constant(value))
    }

    #[test]
    fn test_registry_register_and_find() {
        let registry = InterfaceRegistry::new();
        let user = AsynUser::new();
        registry.register::<dyn Int32>(PORT_ADDR, constant(1)).unwrap();

        let found = registry.find::<dyn Int32>(PORT_ADDR, true).unwrap();
        assert_eq!(found.read(&user).unwrap(), 1);
        assert_eq!(found.depth(), 0);

        // Device addresses fall back to the port entry
        assert_eq!(registry.find::<dyn Int32>(3, true).unwrap().read(&user).unwrap(), 1);
        assert_eq!(registry.find::<dyn Octet>(3, true).err(), Some(crate::AsynError::NotFound));
    }

    #[test]
    fn test_registry_duplicate_base() {
        let registry = InterfaceRegistry::new();
        registry.register::<dyn Int32>(PORT_ADDR, constant(1)).unwrap();
        let result = registry.register::<dyn Int32>(PORT_ADDR, constant(2));
        assert_eq!(result.err(), Some(crate::AsynError::AlreadyRegistered));
    }

    #[test]
    fn test_registry_interpose_stack() {
        let registry = InterfaceRegistry::new();
        let user = AsynUser::new();
        let base = registry.register::<dyn Int32>(PORT_ADDR, constant(1)).unwrap();

        let (second, prev) = registry.interpose::<dyn Int32>(PORT_ADDR, constant(2)).unwrap();
        assert_eq!(prev.layer(), base.layer());
        assert_eq!(second.depth(), 1);

        let (_third, prev) = registry.interpose::<dyn Int32>(PORT_ADDR, constant(3)).unwrap();
        assert_eq!(prev.layer(), second.layer());

        assert_eq!(registry.find::<dyn Int32>(PORT_ADDR, true).unwrap().read(&user).unwrap(), 3);
        assert_eq!(registry.find::<dyn Int32>(PORT_ADDR, false).unwrap().read(&user).unwrap(), 1);
        assert_eq!(registry.entries(), vec![(PORT_ADDR, "asynInt32", 3)]);
    }

    #[test]
    fn test_registry_interpose_per_address() {
        let registry = InterfaceRegistry::new();
        let user = AsynUser::new();
        registry.register::<dyn Int32>(PORT_ADDR, constant(1)).unwrap();
        let (_, prev) = registry.interpose::<dyn Int32>(2, constant(20)).unwrap();
        assert_eq!(prev.read(&user).unwrap(), 1);

        assert_eq!(registry.find::<dyn Int32>(2, true).unwrap().read(&user).unwrap(), 20);
        assert_eq!(registry.find::<dyn Int32>(2, false).unwrap().read(&user).unwrap(), 1);
        assert_eq!(registry.find::<dyn Int32>(1, true).unwrap().read(&user).unwrap(), 1);
    }

    #[test]
    fn test_registry_interpose_without_base() {
        let registry = InterfaceRegistry::new();
        let result = registry.interpose::<dyn Int32>(PORT_ADDR, constant(2));
        assert_eq!(result.err(), Some(crate::AsynError::NotFound));
        assert_eq!(
            registry.find::<dyn Int32>(0, true).err(),
            Some(crate::AsynError::NotFound)
        );
    }
}
