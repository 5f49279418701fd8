//! Coordinate addressing for bridged component trees.
//!
//! Every component or element instance is identified by a small numeric
//! [`ComponentId`] derived from its parent's id and a locally unique
//! [`Segment`]. List items use their declared key as the segment, so inserting,
//! removing or reordering siblings never changes an existing item's id.
//!
//! Each side of a bridge owns one [`CoordinateTable`]. The two tables allocate
//! from disjoint [`AddressSpace`]s (same stride, different offsets) and learn
//! the peer's allocations through [`CoordinateTable::add_mapping`] (mount time)
//! and [`CoordinateTable::merge_mapping`] (afterwards). Only the integer ids
//! ever cross the trust boundary.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

// ============================================================================
// Error Types (codes 11000-11009)
// ============================================================================

/// Error codes for addressing operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CoordErrorCode {
    /// A pair is already bound to a different id
    Conflict = 11000,
    /// The root id cannot be bound to a pair
    ReservedId = 11001,
    /// Offset/stride combination cannot produce ids
    InvalidAddressSpace = 11002,
    /// Every id of the local address space was handed out
    Exhausted = 11003,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("[{code}] Mapping conflict: {message}")]
    Conflict { code: u32, message: String },

    #[error("[{code}] Reserved id: {message}")]
    ReservedId { code: u32, message: String },

    #[error("[{code}] Invalid address space: {message}")]
    InvalidAddressSpace { code: u32, message: String },

    #[error("[{code}] Address space exhausted: {message}")]
    Exhausted { code: u32, message: String },
}

impl CoordError {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            code: CoordErrorCode::Conflict as u32,
            message: message.into(),
        }
    }

    pub fn reserved_id(message: impl Into<String>) -> Self {
        Self::ReservedId {
            code: CoordErrorCode::ReservedId as u32,
            message: message.into(),
        }
    }

    pub fn invalid_address_space(message: impl Into<String>) -> Self {
        Self::InvalidAddressSpace {
            code: CoordErrorCode::InvalidAddressSpace as u32,
            message: message.into(),
        }
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::Exhausted {
            code: CoordErrorCode::Exhausted as u32,
            message: message.into(),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Conflict { code, .. }
            | Self::ReservedId { code, .. }
            | Self::InvalidAddressSpace { code, .. }
            | Self::Exhausted { code, .. } => *code,
        }
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// Numeric id of one mounted instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub u32);

impl ComponentId {
    /// Root of every tree. Never produced by a counter.
    pub const ROOT: ComponentId = ComponentId(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally unique step below a parent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    /// Static slot name (a named ref or child component)
    Slot(Arc<str>),
    /// Item key of a repeated ref, taken from the list's match-by field
    Key(Arc<str>),
}

impl Segment {
    pub fn slot(name: impl AsRef<str>) -> Self {
        Self::Slot(Arc::from(name.as_ref()))
    }

    pub fn key(key: impl AsRef<str>) -> Self {
        Self::Key(Arc::from(key.as_ref()))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Slot(name) => write!(f, "{name}"),
            Segment::Key(key) => write!(f, "#{key}"),
        }
    }
}

/// Full path of an instance, anchored at its topmost known ancestor.
///
/// Coordinates are reconstructed from a table for diagnostics and ordering;
/// they are never shipped across the boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coordinate {
    pub anchor: ComponentId,
    pub segments: Vec<Segment>,
}

impl Coordinate {
    pub fn root() -> Self {
        Self {
            anchor: ComponentId::ROOT,
            segments: Vec::new(),
        }
    }

    /// Child coordinate one segment deeper.
    pub fn child(&self, segment: Segment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self {
            anchor: self.anchor,
            segments,
        }
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.anchor.is_root() {
            write!(f, "@{}", self.anchor)?;
        }
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// Id allocation scheme of one side: `offset, offset + stride, ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    offset: u32,
    stride: u32,
}

impl AddressSpace {
    pub fn new(offset: u32, stride: u32) -> Result<Self, CoordError> {
        if stride == 0 {
            return Err(CoordError::invalid_address_space("stride must be at least 1"));
        }
        if offset == 0 {
            return Err(CoordError::invalid_address_space(
                "offset 0 is the reserved root id",
            ));
        }
        Ok(Self { offset, stride })
    }

    /// Default space of the side that owns the display surface.
    pub fn trusted() -> Self {
        Self {
            offset: 2,
            stride: 2,
        }
    }

    /// Default space of the side that runs component logic.
    pub fn untrusted() -> Self {
        Self {
            offset: 1,
            stride: 2,
        }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Whether `id` is one this space would ever hand out.
    pub fn owns(&self, id: ComponentId) -> bool {
        id.0 >= self.offset && (id.0 - self.offset) % self.stride == 0
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::trusted()
    }
}

/// `(parent, segment) -> id` triple exchanged with the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub parent: ComponentId,
    pub segment: Segment,
    pub id: ComponentId,
}

// ============================================================================
// Coordinate Table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlotId(u32);

/// Index form of a [`Segment`]. Slot names come from shapes and are interned;
/// list keys are data and live only as long as their binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SegmentKey {
    Slot(SlotId),
    Key(Arc<str>),
}

/// Per-session addressing table.
#[derive(Debug)]
pub struct CoordinateTable {
    space: AddressSpace,
    /// `None` once the space is used up
    next: Option<u32>,
    slots: Vec<Arc<str>>,
    slot_ids: HashMap<Arc<str>, SlotId>,
    index: HashMap<(ComponentId, SegmentKey), ComponentId>,
    parents: HashMap<ComponentId, (ComponentId, SegmentKey)>,
    children: HashMap<ComponentId, BTreeSet<ComponentId>>,
    allocated: Vec<Mapping>,
    /// Peer id -> local id, for pairs both sides allocated concurrently
    aliases: HashMap<ComponentId, ComponentId>,
}

pub type SharedTable = Arc<Mutex<CoordinateTable>>;

impl CoordinateTable {
    pub fn new(space: AddressSpace) -> Self {
        debug!(
            offset = space.offset,
            stride = space.stride,
            "Creating coordinate table"
        );
        Self {
            space,
            next: Some(space.offset),
            slots: Vec::new(),
            slot_ids: HashMap::new(),
            index: HashMap::new(),
            parents: HashMap::new(),
            children: HashMap::new(),
            allocated: Vec::new(),
            aliases: HashMap::new(),
        }
    }

    /// Wrap the table for sharing between the layers of one side.
    pub fn shared(self) -> SharedTable {
        Arc::new(Mutex::new(self))
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    /// Number of live (non-root) bindings.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Distinct slot names seen so far.
    pub fn interned_slots(&self) -> usize {
        self.slots.len()
    }

    /// Id for `(parent, segment)`, allocating one the first time the pair is
    /// seen. Fails only once the address space is used up.
    pub fn map(&mut self, parent: ComponentId, segment: &Segment) -> Result<ComponentId, CoordError> {
        let key = self.intern(segment);
        if let Some(id) = self.index.get(&(parent, key.clone())) {
            return Ok(*id);
        }

        let id = self.allocate()?;
        if self.parents.contains_key(&id) {
            warn!(
                id = id.0,
                "Allocated id is already bound; address spaces overlap"
            );
        }
        self.bind(parent, key, id);
        self.allocated.push(Mapping {
            parent,
            segment: segment.clone(),
            id,
        });
        trace!(parent = parent.0, segment = %segment, id = id.0, "coords.map");
        Ok(id)
    }

    /// Pre-seed an id learned from the peer. A pair already bound to another
    /// id is a conflict.
    pub fn add_mapping(
        &mut self,
        parent: ComponentId,
        segment: &Segment,
        id: ComponentId,
    ) -> Result<(), CoordError> {
        if id.is_root() {
            return Err(CoordError::reserved_id(format!(
                "cannot bind {parent}/{segment} to the root id"
            )));
        }

        let key = self.intern(segment);
        match self.index.get(&(parent, key.clone())) {
            Some(existing) if *existing == id => return Ok(()),
            Some(existing) => {
                return Err(CoordError::conflict(format!(
                    "{parent}/{segment} is bound to {existing}, peer sent {id}"
                )));
            }
            None => {}
        }

        self.seed(parent, key, segment, id);
        trace!(parent = parent.0, segment = %segment, id = id.0, "coords.add_mapping");
        Ok(())
    }

    /// Seed several mappings, stopping at the first conflict.
    pub fn add_mappings<'a>(
        &mut self,
        mappings: impl IntoIterator<Item = &'a Mapping>,
    ) -> Result<(), CoordError> {
        for mapping in mappings {
            self.add_mapping(mapping.parent, &mapping.segment, mapping.id)?;
        }
        Ok(())
    }

    /// Learn one peer allocation made after the mount handshake.
    ///
    /// The parent is translated to its local id first. An unbound pair is
    /// seeded with the peer's id, which is returned. A pair this side already
    /// bound to a different id keeps the local id and the peer's id becomes
    /// an alias of it, so both sides can keep using their own id.
    pub fn merge_mapping(&mut self, mapping: &Mapping) -> Result<Option<ComponentId>, CoordError> {
        let Mapping {
            parent,
            segment,
            id,
        } = mapping;
        if id.is_root() {
            return Err(CoordError::reserved_id(format!(
                "cannot bind {parent}/{segment} to the root id"
            )));
        }

        let parent = self.local_id(*parent);
        let key = self.intern(segment);
        match self.index.get(&(parent, key.clone())) {
            Some(existing) if existing == id => Ok(None),
            Some(existing) => {
                let local = *existing;
                debug!(
                    parent = parent.0,
                    segment = %segment,
                    local = local.0,
                    peer = id.0,
                    "Both sides mapped the same pair; aliasing peer id"
                );
                self.aliases.insert(*id, local);
                Ok(None)
            }
            None => {
                self.seed(parent, key, segment, *id);
                trace!(parent = parent.0, segment = %segment, id = id.0, "coords.merge_mapping");
                Ok(Some(*id))
            }
        }
    }

    /// Merge a batch of peer allocations. Returns the ids that were seeded.
    pub fn merge_mappings<'a>(
        &mut self,
        mappings: impl IntoIterator<Item = &'a Mapping>,
    ) -> Result<Vec<ComponentId>, CoordError> {
        let mut seeded = Vec::new();
        for mapping in mappings {
            seeded.extend(self.merge_mapping(mapping)?);
        }
        Ok(seeded)
    }

    /// Local id for an id the peer sent. Ids without an alias are shared by
    /// both sides and come back unchanged.
    pub fn local_id(&self, id: ComponentId) -> ComponentId {
        self.aliases.get(&id).copied().unwrap_or(id)
    }

    pub fn lookup(&self, parent: ComponentId, segment: &Segment) -> Option<ComponentId> {
        let key = match segment {
            Segment::Slot(name) => SegmentKey::Slot(*self.slot_ids.get(name)?),
            Segment::Key(key) => SegmentKey::Key(key.clone()),
        };
        self.index.get(&(parent, key)).copied()
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        id.is_root() || self.parents.contains_key(&id)
    }

    pub fn parent_of(&self, id: ComponentId) -> Option<ComponentId> {
        self.parents.get(&id).map(|(parent, _)| *parent)
    }

    pub fn segment_of(&self, id: ComponentId) -> Option<Segment> {
        self.parents.get(&id).map(|(_, key)| self.segment(key))
    }

    /// Live children of `id`, in id order.
    pub fn children_of(&self, id: ComponentId) -> Vec<ComponentId> {
        self.children
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Reconstruct the path of `id`. `None` for unknown ids.
    pub fn coordinate(&self, id: ComponentId) -> Option<Coordinate> {
        if id.is_root() {
            return Some(Coordinate::root());
        }

        let mut segments = Vec::new();
        let mut current = id;
        let mut guard = self.parents.len() + 1;
        while let Some((parent, key)) = self.parents.get(&current) {
            segments.push(self.segment(key));
            current = *parent;
            guard -= 1;
            if guard == 0 {
                warn!(id = id.0, "Cycle in coordinate table");
                return None;
            }
        }
        if segments.is_empty() {
            return None;
        }
        segments.reverse();
        Some(Coordinate {
            anchor: current,
            segments,
        })
    }

    /// Unmount `id` and everything below it. Returns the released ids,
    /// deepest last. Released ids are never handed out again.
    pub fn release(&mut self, id: ComponentId) -> Vec<ComponentId> {
        if id.is_root() {
            let released: Vec<ComponentId> = self.parents.keys().copied().collect();
            self.index.clear();
            self.parents.clear();
            self.children.clear();
            self.allocated.clear();
            self.aliases.clear();
            debug!(count = released.len(), "Released whole coordinate table");
            return released;
        }

        let mut released = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some((parent, key)) = self.parents.remove(&current) else {
                continue;
            };
            // Only drop the index entry if it still points at this id; a
            // colliding binding may have taken it over.
            let entry = (parent, key);
            if self.index.get(&entry) == Some(&current) {
                self.index.remove(&entry);
            }
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(&current);
            }
            if let Some(kids) = self.children.remove(&current) {
                stack.extend(kids);
            }
            released.push(current);
        }

        if !released.is_empty() {
            let gone: HashSet<ComponentId> = released.iter().copied().collect();
            self.allocated.retain(|m| !gone.contains(&m.id));
            self.aliases.retain(|_, local| !gone.contains(local));
        }
        trace!(id = id.0, count = released.len(), "coords.release");
        released
    }

    /// Mappings allocated locally since the previous drain, oldest first.
    /// Released entries are skipped.
    pub fn drain_allocations(&mut self) -> Vec<Mapping> {
        std::mem::take(&mut self.allocated)
    }

    /// Every live binding, sorted by id.
    pub fn mappings(&self) -> Vec<Mapping> {
        let mut all: Vec<Mapping> = self
            .parents
            .iter()
            .map(|(id, (parent, key))| Mapping {
                parent: *parent,
                segment: self.segment(key),
                id: *id,
            })
            .collect();
        all.sort_by_key(|m| m.id);
        all
    }

    fn allocate(&mut self) -> Result<ComponentId, CoordError> {
        let Some(next) = self.next else {
            error!(
                offset = self.space.offset,
                stride = self.space.stride,
                "Address space exhausted"
            );
            return Err(CoordError::exhausted(format!(
                "no ids left in {}+{}n",
                self.space.offset, self.space.stride
            )));
        };
        self.next = next.checked_add(self.space.stride);
        Ok(ComponentId(next))
    }

    fn intern(&mut self, segment: &Segment) -> SegmentKey {
        match segment {
            Segment::Key(key) => SegmentKey::Key(key.clone()),
            Segment::Slot(name) => {
                if let Some(id) = self.slot_ids.get(name) {
                    return SegmentKey::Slot(*id);
                }
                let id = SlotId(self.slots.len() as u32);
                self.slots.push(name.clone());
                self.slot_ids.insert(name.clone(), id);
                SegmentKey::Slot(id)
            }
        }
    }

    fn segment(&self, key: &SegmentKey) -> Segment {
        match key {
            SegmentKey::Slot(id) => Segment::Slot(self.slots[id.0 as usize].clone()),
            SegmentKey::Key(key) => Segment::Key(key.clone()),
        }
    }

    fn seed(&mut self, parent: ComponentId, key: SegmentKey, segment: &Segment, id: ComponentId) {
        if self.parents.contains_key(&id) {
            warn!(
                id = id.0,
                parent = parent.0,
                segment = %segment,
                "Peer id is already bound to another pair; address spaces overlap"
            );
        }
        self.bind(parent, key, id);
    }

    fn bind(&mut self, parent: ComponentId, key: SegmentKey, id: ComponentId) {
        self.index.insert((parent, key.clone()), id);
        self.parents.insert(id, (parent, key));
        self.children.entry(parent).or_default().insert(id);
    }
}

/// Lock a shared table, recovering from poisoning.
pub fn lock(table: &SharedTable) -> MutexGuard<'_, CoordinateTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Tests
// ============================================================================
