//! Session registry.
//!
//! Owns every distributed object of a process and maps network identities to
//! local instances. A master session mints ids and keeps authoritative
//! objects in `registered`; a slave session keeps proxies, keyed by the
//! master's ids, in `mapped`. An id lives in at most one of the two maps.
//!
//! The master side builds [`ObjectBatch`]es (create, update, snapshot) and the
//! slave side applies them. Batch layout:
//!
//! ```text
//! tombstones: seq<u64>
//! records:    seq<{ id:u64, tag:u32, data:blob }>
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    distributed::{check_identity, DirtyMask, Distributed, ObjectId, TypeTag},
    error::{ProtocolError, ProtocolResult},
    objects::register_builtin_types,
    stream::ByteStream,
};

/// Which side of the cluster a session serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Authority: mints ids and replicates.
    Master,
    /// Proxy: maps incoming ids onto local objects.
    Slave,
}

/// Constructor for a proxy of a given type.
pub type Constructor = fn() -> Box<dyn Distributed>;

/// Maps type tags to proxy constructors.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    ctors: HashMap<TypeTag, Constructor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in scene types.
    pub fn with_builtin() -> Self {
        let mut types = Self::new();
        register_builtin_types(&mut types);
        types
    }

    pub fn register(&mut self, tag: TypeTag, ctor: Constructor) {
        self.ctors.insert(tag, ctor);
    }

    pub fn contains(&self, tag: TypeTag) -> bool {
        self.ctors.contains_key(&tag)
    }

    pub fn create(&self, tag: TypeTag) -> ProtocolResult<Box<dyn Distributed>> {
        self.ctors
            .get(&tag)
            .map(|ctor| ctor())
            .ok_or(ProtocolError::UnknownObjectType(tag))
    }
}

/// One object's packed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub tag: TypeTag,
    /// Output of [`Distributed::pack`]: dirty word then fields.
    pub data: Bytes,
}

impl ObjectRecord {
    pub fn pack(object: &dyn Distributed, bits: DirtyMask) -> Self {
        let mut s = ByteStream::new();
        object.pack(&mut s, bits);
        Self {
            id: object.id(),
            tag: object.type_tag(),
            data: s.into_bytes(),
        }
    }
}

/// Payload of `SG_CREATE`, `SG_UPDATE` and `SG_INIT`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectBatch {
    pub tombstones: Vec<ObjectId>,
    pub records: Vec<ObjectRecord>,
}

impl ObjectBatch {
    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty() && self.records.is_empty()
    }

    pub fn write_to(&self, s: &mut ByteStream) {
        s.write_seq(&self.tombstones, |s, id| s.write_u64(id.0));
        s.write_seq(&self.records, |s, r| {
            s.write_u64(r.id.0);
            s.write_u32(r.tag);
            s.write_blob(&r.data);
        });
    }

    pub fn read_from(s: &mut ByteStream) -> ProtocolResult<Self> {
        let tombstones = s.read_seq(|s| Ok(ObjectId(s.read_u64()?)))?;
        let records = s.read_seq(|s| {
            Ok(ObjectRecord {
                id: ObjectId(s.read_u64()?),
                tag: s.read_u32()?,
                data: s.read_blob()?,
            })
        })?;
        Ok(Self {
            tombstones,
            records,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut s = ByteStream::new();
        self.write_to(&mut s);
        s.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Self::read_from(&mut ByteStream::from_bytes(bytes))
    }
}

/// What a slave-side apply did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub created: usize,
    /// Records parked because their object is not known yet.
    pub held: usize,
    /// Records that missed again on their retry and were discarded.
    pub dropped: Vec<ObjectId>,
    pub tombstoned: usize,
}

/// Process-wide object registry.
pub struct Session {
    role: Role,
    last_id: u64,
    registered: BTreeMap<ObjectId, Box<dyn Distributed>>,
    mapped: BTreeMap<ObjectId, Box<dyn Distributed>>,
    /// Registered since the last create batch.
    created: Vec<ObjectId>,
    /// Every id ever deregistered or announced as destroyed.
    destroyed: BTreeSet<ObjectId>,
    /// Master: tombstones not yet shipped in an update.
    unsent_tombstones: Vec<ObjectId>,
    /// Slave: update records waiting for their object.
    held: Vec<ObjectRecord>,
    types: TypeRegistry,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Self::with_types(role, TypeRegistry::with_builtin())
    }

    pub fn master() -> Self {
        Self::new(Role::Master)
    }

    pub fn slave() -> Self {
        Self::new(Role::Slave)
    }

    pub fn with_types(role: Role, types: TypeRegistry) -> Self {
        Self {
            role,
            last_id: 0,
            registered: BTreeMap::new(),
            mapped: BTreeMap::new(),
            created: Vec::new(),
            destroyed: BTreeSet::new(),
            unsent_tombstones: Vec::new(),
            held: Vec::new(),
            types,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Live objects on this side.
    pub fn len(&self) -> usize {
        self.registered.len() + self.mapped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.registered.keys().chain(self.mapped.keys()).copied()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.registered.contains_key(&id) || self.mapped.contains_key(&id)
    }

    pub fn is_destroyed(&self, id: ObjectId) -> bool {
        self.destroyed.contains(&id)
    }

    pub fn held_records(&self) -> usize {
        self.held.len()
    }

    /// Objects waiting for the next create batch.
    pub fn pending_creates(&self) -> usize {
        self.created.len()
    }

    /// Registers an object.
    ///
    /// With `id == None` the master mints a fresh id, queues the object for the
    /// next create batch and forces it fully dirty. With `Some(id)` a slave maps
    /// a proxy onto the master's id.
    pub fn register(
        &mut self,
        mut object: Box<dyn Distributed>,
        id: Option<ObjectId>,
    ) -> ProtocolResult<ObjectId> {
        match id {
            None => {
                if self.role != Role::Master {
                    return Err(ProtocolError::WrongRole {
                        expected: Role::Master,
                    });
                }
                if object.id().is_defined() {
                    return Err(ProtocolError::AlreadyRegistered(object.id()));
                }
                self.last_id += 1;
                let id = ObjectId(self.last_id);
                object.core_mut().set_id(id);
                object.mark_dirty(DirtyMask::ALL);
                self.registered.insert(id, object);
                self.created.push(id);
                debug!(%id, "Registered object");
                Ok(id)
            }
            Some(id) => {
                if self.role != Role::Slave {
                    return Err(ProtocolError::WrongRole {
                        expected: Role::Slave,
                    });
                }
                if !id.is_defined() {
                    return Err(ProtocolError::UndefinedId);
                }
                if object.id().is_defined() && object.id() != id {
                    return Err(ProtocolError::AlreadyRegistered(object.id()));
                }
                if self.contains(id) {
                    return Err(ProtocolError::DuplicateId(id));
                }
                object.core_mut().set_id(id);
                self.mapped.insert(id, object);
                debug!(%id, "Mapped proxy object");
                Ok(id)
            }
        }
    }

    /// Master convenience for typed objects.
    pub fn insert<T: Distributed>(&mut self, object: T) -> ProtocolResult<ObjectId> {
        self.register(Box::new(object), None)
    }

    /// Removes an object and remembers its id as destroyed.
    pub fn deregister(&mut self, id: ObjectId) -> Option<Box<dyn Distributed>> {
        let removed = self
            .registered
            .remove(&id)
            .or_else(|| self.mapped.remove(&id))?;
        self.created.retain(|c| *c != id);
        if self.destroyed.insert(id) && self.role == Role::Master {
            self.unsent_tombstones.push(id);
        }
        debug!(%id, "Deregistered object");
        Some(removed)
    }

    pub fn find_by_id(&self, id: ObjectId) -> Option<&dyn Distributed> {
        self.registered
            .get(&id)
            .or_else(|| self.mapped.get(&id))
            .map(|b| b.as_ref())
    }

    pub fn find_by_id_mut(&mut self, id: ObjectId) -> Option<&mut (dyn Distributed + 'static)> {
        match self.registered.get_mut(&id) {
            Some(object) => Some(object.as_mut()),
            None => self.mapped.get_mut(&id).map(|b| b.as_mut()),
        }
    }

    pub fn get<T: Distributed>(&self, id: ObjectId) -> Option<&T> {
        self.find_by_id(id)?.as_any().downcast_ref::<T>()
    }

    pub fn get_mut<T: Distributed>(&mut self, id: ObjectId) -> Option<&mut T> {
        self.find_by_id_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    /// Full state of every object registered since the last call.
    pub fn pack_create(&mut self) -> ObjectBatch {
        let ids = std::mem::take(&mut self.created);
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(object) = self.registered.get_mut(&id) {
                records.push(ObjectRecord::pack(object.as_ref(), DirtyMask::ALL));
                object.clear_dirty();
            }
        }
        ObjectBatch {
            tombstones: Vec::new(),
            records,
        }
    }

    /// Dirty fields of every registered object, plus new tombstones.
    /// Dirty bits are cleared once packed.
    pub fn pack_updates(&mut self) -> ObjectBatch {
        let mut records = Vec::new();
        for object in self.registered.values_mut() {
            let bits = object.dirty();
            if bits.is_empty() {
                continue;
            }
            records.push(ObjectRecord::pack(object.as_ref(), bits));
            object.clear_dirty();
        }
        ObjectBatch {
            tombstones: std::mem::take(&mut self.unsent_tombstones),
            records,
        }
    }

    /// Full state of everything, for priming or resynchronizing a slave.
    pub fn pack_snapshot(&self) -> ObjectBatch {
        ObjectBatch {
            tombstones: Vec::new(),
            records: self
                .registered
                .values()
                .map(|o| ObjectRecord::pack(o.as_ref(), DirtyMask::ALL))
                .collect(),
        }
    }

    /// Applies a create batch: builds proxies for unknown ids.
    pub fn apply_create(&mut self, batch: &ObjectBatch) -> ProtocolResult<ApplyReport> {
        let mut report = ApplyReport::default();
        self.record_tombstones(&batch.tombstones, &mut report);
        for record in &batch.records {
            self.materialize(record, &mut report)?;
        }
        self.retry_held(&mut report)?;
        Ok(report)
    }

    /// Applies an update batch. Records for unknown ids are held for one retry.
    pub fn apply_update(&mut self, batch: &ObjectBatch) -> ProtocolResult<ApplyReport> {
        let mut report = ApplyReport::default();
        self.record_tombstones(&batch.tombstones, &mut report);
        self.retry_held(&mut report)?;
        for record in &batch.records {
            match self.mapped.get_mut(&record.id) {
                Some(object) => {
                    apply_record(object.as_mut(), record)?;
                    report.applied += 1;
                }
                None if self.destroyed.contains(&record.id) => {
                    debug!(id = %record.id, "Skipping update for destroyed object");
                }
                None => {
                    debug!(id = %record.id, "Holding update for unknown object");
                    self.held.push(record.clone());
                    report.held += 1;
                }
            }
        }
        Ok(report)
    }

    /// Applies a full snapshot. Held records are superseded.
    pub fn apply_snapshot(&mut self, batch: &ObjectBatch) -> ProtocolResult<ApplyReport> {
        let mut report = ApplyReport::default();
        self.held.clear();
        self.record_tombstones(&batch.tombstones, &mut report);
        for record in &batch.records {
            self.materialize(record, &mut report)?;
        }
        Ok(report)
    }

    fn materialize(&mut self, record: &ObjectRecord, report: &mut ApplyReport) -> ProtocolResult<()> {
        if let Some(object) = self.mapped.get_mut(&record.id) {
            apply_record(object.as_mut(), record)?;
            report.applied += 1;
            return Ok(());
        }
        if self.destroyed.contains(&record.id) {
            debug!(id = %record.id, "Skipping create for destroyed object");
            return Ok(());
        }
        let mut object = self.types.create(record.tag)?;
        object.core_mut().set_id(record.id);
        apply_record(object.as_mut(), record)?;
        self.register(object, Some(record.id))?;
        report.created += 1;
        Ok(())
    }

    /// Gives every held record its one retry. On error the failing record
    /// is dropped and the ones not yet tried stay held.
    fn retry_held(&mut self, report: &mut ApplyReport) -> ProtocolResult<()> {
        let mut held = std::mem::take(&mut self.held).into_iter();
        while let Some(record) = held.next() {
            match self.mapped.get_mut(&record.id) {
                Some(object) => {
                    if let Err(e) = apply_record(object.as_mut(), &record) {
                        self.held.extend(held);
                        return Err(e);
                    }
                    report.applied += 1;
                }
                None => {
                    warn!(id = %record.id, "Dropping update for object that never arrived");
                    report.dropped.push(record.id);
                }
            }
        }
        Ok(())
    }

    fn record_tombstones(&mut self, tombstones: &[ObjectId], report: &mut ApplyReport) {
        for id in tombstones {
            if self.destroyed.insert(*id) {
                report.tombstoned += 1;
            }
        }
        if !tombstones.is_empty() {
            self.held.retain(|r| !tombstones.contains(&r.id));
        }
    }
}

fn apply_record(object: &mut dyn Distributed, record: &ObjectRecord) -> ProtocolResult<()> {
    check_identity(object, record.id)?;
    if object.type_tag() != record.tag {
        return Err(ProtocolError::TypeMismatch {
            id: record.id,
            record: record.tag,
            object: object.type_tag(),
        });
    }
    let mut s = ByteStream::from_bytes(&record.data);
    object.unpack(&mut s)?;
    if !s.is_empty() {
        return Err(ProtocolError::TrailingBytes {
            id: record.id,
            remaining: s.len(),
        });
    }
    Ok(())
}
