//! Entity identity and safe cross-tick referencing.
//!
//! Every entity gets two stamps when it is constructed:
//! - an [`EntityId`], unique for the lifetime of the allocator that issued it
//!   and never reused, and
//! - an [`InstanceToken`], unique per construction, drawn from a dedicated
//!   counter so two constructions can never collide even within the same
//!   clock tick.
//!
//! Entities live in slots of an [`EntityArena`]. Anything that needs to refer
//! to an entity across ticks holds an [`EntityHandle`]: the slot index plus the
//! token observed at bind time. Resolving a handle is one indexed lookup and a
//! token comparison. A handle whose slot has been vacated or reused resolves to
//! nothing, and drops its reference as it does so.
//!
//! Handles count as references on their slot. The count only keeps the slot
//! from being recycled while someone still points at it; destroying the entity
//! is always the arena owner's decision.

use crate::error::EntityError;
use log::{error, trace};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceToken(u64);

/// Issues entity identities and instance tokens.
///
/// Both counters start at 1 and only move forward.
#[derive(Debug)]
pub struct IdentityAllocator {
    next_id: AtomicU64,
    next_token: AtomicU64,
}

impl IdentityAllocator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn new_identity(&self) -> EntityId {
        EntityId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn new_instance_token(&self) -> InstanceToken {
        InstanceToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdentityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Slot<T> {
    token: InstanceToken,
    entity: Option<EntityId>,
    occupant: Option<T>,
    refs: u32,
}

impl<T> Slot<T> {
    fn is_current(&self, token: InstanceToken) -> bool {
        self.occupant.is_some() && self.token == token
    }
}

/// Slot storage for entities, indexed by slot and by identity.
pub struct EntityArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    by_id: HashMap<EntityId, u32>,
    identities: IdentityAllocator,
}

impl<T> EntityArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            identities: IdentityAllocator::new(),
        }
    }

    /// Constructs an entity in a vacant slot.
    ///
    /// The closure receives the freshly issued identity and instance token so
    /// the entity can carry its own copy of both.
    pub fn insert_with<F>(&mut self, build: F) -> EntityId
    where
        F: FnOnce(EntityId, InstanceToken) -> T,
    {
        let id = self.identities.new_identity();
        let token = self.identities.new_instance_token();
        let occupant = build(id, token);

        let slot = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.token = token;
                entry.entity = Some(id);
                entry.occupant = Some(occupant);
                slot
            }
            None => {
                self.slots.push(Slot {
                    token,
                    entity: Some(id),
                    occupant: Some(occupant),
                    refs: 0,
                });
                (self.slots.len() - 1) as u32
            }
        };

        self.by_id.insert(id, slot);
        trace!("Entity {} placed in slot {}", id, slot);
        id
    }

    /// Destroys an entity. The slot becomes reusable once no handle
    /// references it any more.
    pub fn remove(&mut self, id: EntityId) -> Option<T> {
        let slot = self.by_id.remove(&id)?;
        let entry = &mut self.slots[slot as usize];
        let occupant = entry.occupant.take();
        entry.entity = None;

        if entry.refs == 0 {
            self.free.push(slot);
        } else {
            trace!(
                "Slot {} retired with {} outstanding references",
                slot,
                entry.refs
            );
        }
        occupant
    }

    pub fn get(&self, id: EntityId) -> Option<&T> {
        let slot = *self.by_id.get(&id)?;
        self.slots[slot as usize].occupant.as_ref()
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        let slot = *self.by_id.get(&id)?;
        self.slots[slot as usize].occupant.as_mut()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.by_id.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.occupant.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|slot| slot.occupant.as_mut())
    }

    /// Current reference count of the slot holding `id`.
    pub fn ref_count(&self, id: EntityId) -> Option<u32> {
        let slot = *self.by_id.get(&id)?;
        Some(self.slots[slot as usize].refs)
    }

    fn acquire(&mut self, slot: u32) {
        self.slots[slot as usize].refs += 1;
    }

    /// Drops one reference from a slot.
    ///
    /// Releasing a slot that holds no references is a double release and is
    /// reported as [`EntityError::ReferenceUnderflow`]; the count is left at
    /// zero.
    pub fn release(&mut self, slot: u32) -> Result<(), EntityError> {
        let entry = self
            .slots
            .get_mut(slot as usize)
            .ok_or(EntityError::UnknownSlot { slot })?;

        if entry.refs == 0 {
            let err = EntityError::ReferenceUnderflow {
                slot,
                entity: entry.entity,
            };
            error!("{}", err);
            return Err(err);
        }

        entry.refs -= 1;
        if entry.refs == 0 && entry.occupant.is_none() {
            self.free.push(slot);
        }
        Ok(())
    }

    fn is_current(&self, slot: u32, token: InstanceToken) -> bool {
        self.slots
            .get(slot as usize)
            .map_or(false, |entry| entry.is_current(token))
    }
}

impl<T> Default for EntityArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A non-owning, self-validating reference to an entity.
///
/// Not `Clone`: every bound handle accounts for exactly one reference, so
/// copies are made through [`EntityHandle::bind`]. A handle dropped while
/// still bound leaks its reference and pins its slot; call
/// [`EntityHandle::unbind`] when done.
#[derive(Debug, PartialEq, Eq)]
pub struct EntityHandle {
    slot: u32,
    entity: EntityId,
    token: Option<InstanceToken>,
}

impl EntityHandle {
    /// Binds a handle to a live entity, taking a reference on its slot.
    pub fn bind<T>(arena: &mut EntityArena<T>, id: EntityId) -> Option<Self> {
        let slot = *arena.by_id.get(&id)?;
        let token = arena.slots[slot as usize].token;
        arena.acquire(slot);
        Some(Self {
            slot,
            entity: id,
            token: Some(token),
        })
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity
    }

    pub fn is_bound(&self) -> bool {
        self.token.is_some()
    }

    /// Checks validity without touching the reference count.
    pub fn is_valid<T>(&self, arena: &EntityArena<T>) -> bool {
        self.token
            .map_or(false, |token| arena.is_current(self.slot, token))
    }

    /// Read-only access; a stale handle stays bound until resolved or unbound.
    pub fn peek<'a, T>(&self, arena: &'a EntityArena<T>) -> Option<&'a T> {
        if self.is_valid(arena) {
            arena.slots[self.slot as usize].occupant.as_ref()
        } else {
            None
        }
    }

    /// Returns the entity if it is still the one this handle was bound to.
    ///
    /// A stale handle releases its reference and becomes unbound.
    pub fn resolve<'a, T>(&mut self, arena: &'a mut EntityArena<T>) -> Option<&'a mut T> {
        let token = self.token?;
        if arena.is_current(self.slot, token) {
            return arena.slots[self.slot as usize].occupant.as_mut();
        }

        trace!(
            "Handle to entity {} in slot {} went stale",
            self.entity,
            self.slot
        );
        self.token = None;
        if let Err(e) = arena.release(self.slot) {
            error!("Stale handle for entity {} failed to release: {}", self.entity, e);
        }
        None
    }

    /// Releases the reference. Unbinding an unbound handle is a no-op.
    pub fn unbind<T>(&mut self, arena: &mut EntityArena<T>) -> Result<(), EntityError> {
        if self.token.take().is_none() {
            return Ok(());
        }
        arena.release(self.slot)
    }
}
