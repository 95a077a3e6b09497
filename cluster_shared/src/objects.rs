//! Concrete replicated types.
//!
//! These are the pieces of scene state the cluster ships every frame. The
//! scene graph itself lives outside this crate; these types only carry the
//! fields a slave needs to reproduce the master's view.

use tracing::debug;

use crate::{
    distributed::{DirtyMask, Distributed, ObjectCore, ObjectId, TypeTag},
    distributed_fields,
    math::{Quat, Vec3},
    session::TypeRegistry,
};

pub const TRANSFORM_TAG: TypeTag = 1;
pub const CAMERA_TAG: TypeTag = 2;
pub const NODE_LIST_TAG: TypeTag = 3;

/// Registers every type in this module.
pub fn register_builtin_types(types: &mut TypeRegistry) {
    types.register(TRANSFORM_TAG, || Box::new(Transform::default()) as Box<dyn Distributed>);
    types.register(CAMERA_TAG, || Box::new(Camera::default()) as Box<dyn Distributed>);
    types.register(NODE_LIST_TAG, || Box::new(NodeList::default()) as Box<dyn Distributed>);
}

/// A named scene node transform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transform {
    core: ObjectCore,
    name: String,
    parent: ObjectId,
    position: Vec3,
    rotation: Quat,
    scale: Vec3,
    /// Set once the engine-side node has been created on this process.
    realized: bool,
}

impl Transform {
    pub const NAME: DirtyMask = DirtyMask::bit(1);
    pub const PARENT: DirtyMask = DirtyMask::bit(2);
    pub const POSITION: DirtyMask = DirtyMask::bit(3);
    pub const ROTATION: DirtyMask = DirtyMask::bit(4);
    pub const SCALE: DirtyMask = DirtyMask::bit(5);

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scale: Vec3::ONE,
            realized: true,
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> ObjectId {
        self.parent
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    pub fn is_realized(&self) -> bool {
        self.realized
    }

    pub fn set_parent(&mut self, parent: ObjectId) {
        self.parent = parent;
        self.core.mark(Self::PARENT);
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.core.mark(Self::POSITION);
    }

    pub fn set_rotation(&mut self, rotation: Quat) {
        self.rotation = rotation;
        self.core.mark(Self::ROTATION);
    }

    pub fn set_scale(&mut self, scale: Vec3) {
        self.scale = scale;
        self.core.mark(Self::SCALE);
    }

    fn realize(&mut self, bits: DirtyMask) {
        if !self.realized && bits.intersects(Self::NAME) {
            self.realized = true;
            debug!(id = %self.core.id(), name = %self.name, "Realized transform node");
        }
    }
}

distributed_fields! {
    Transform, tag = TRANSFORM_TAG, core = core, on_unpacked = realize,
    {
        Transform::NAME => name,
        Transform::PARENT => parent,
        Transform::POSITION => position,
        Transform::ROTATION => rotation,
        Transform::SCALE => scale,
    }
}

/// Camera parameters shared by every display.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    core: ObjectCore,
    name: String,
    eye: Vec3,
    target: Vec3,
    fov_y: f32,
    near: f32,
    far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            core: ObjectCore::default(),
            name: String::new(),
            eye: Vec3::new(0.0, 0.0, 5.0),
            target: Vec3::ZERO,
            fov_y: 60.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    pub const NAME: DirtyMask = DirtyMask::bit(1);
    pub const VIEW: DirtyMask = DirtyMask::bit(2);
    pub const PROJECTION: DirtyMask = DirtyMask::bit(3);

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn eye(&self) -> Vec3 {
        self.eye
    }

    pub fn target(&self) -> Vec3 {
        self.target
    }

    pub fn fov_y(&self) -> f32 {
        self.fov_y
    }

    pub fn clip(&self) -> (f32, f32) {
        (self.near, self.far)
    }

    /// Eye and target travel together under one bit.
    pub fn look_at(&mut self, eye: Vec3, target: Vec3) {
        self.eye = eye;
        self.target = target;
        self.core.mark(Self::VIEW);
    }

    pub fn set_projection(&mut self, fov_y: f32, near: f32, far: f32) {
        self.fov_y = fov_y;
        self.near = near;
        self.far = far;
        self.core.mark(Self::PROJECTION);
    }
}

distributed_fields! {
    Camera, tag = CAMERA_TAG, core = core,
    {
        Camera::NAME => name,
        Camera::VIEW => eye,
        Camera::VIEW => target,
        Camera::PROJECTION => fov_y,
        Camera::PROJECTION => near,
        Camera::PROJECTION => far,
    }
}

/// An ordered list of object ids, as kept by a scene manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeList {
    core: ObjectCore,
    name: String,
    members: Vec<ObjectId>,
}

impl NodeList {
    pub const NAME: DirtyMask = DirtyMask::bit(1);
    pub const MEMBERS: DirtyMask = DirtyMask::bit(2);

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[ObjectId] {
        &self.members
    }

    pub fn push(&mut self, id: ObjectId) {
        self.members.push(id);
        self.core.mark(Self::MEMBERS);
    }

    pub fn remove(&mut self, id: ObjectId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| *m != id);
        let removed = self.members.len() != before;
        if removed {
            self.core.mark(Self::MEMBERS);
        }
        removed
    }
}

distributed_fields! {
    NodeList, tag = NODE_LIST_TAG, core = core,
    {
        NodeList::NAME => name,
        NodeList::MEMBERS => members,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ByteStream;

    #[test]
    fn setters_mark_their_own_bit() {
        let mut t = Transform::new("root");
        assert!(t.dirty().is_empty());
        t.set_position(Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(t.dirty(), Transform::POSITION);
        t.set_scale(Vec3::ONE);
        assert_eq!(t.dirty(), Transform::POSITION | Transform::SCALE);
    }

    #[test]
    fn proxy_is_realized_when_name_arrives() {
        let mut master = Transform::new("arm");
        master.set_position(Vec3::new(0.0, 2.0, 0.0));

        let mut s = ByteStream::new();
        master.pack(&mut s, Transform::POSITION);
        let mut proxy = Transform::default();
        proxy.unpack(&mut s).unwrap();
        assert!(!proxy.is_realized());
        assert_eq!(proxy.position(), Vec3::new(0.0, 2.0, 0.0));

        master.pack(&mut s, DirtyMask::ALL);
        proxy.unpack(&mut s).unwrap();
        assert!(proxy.is_realized());
        assert_eq!(proxy.name(), "arm");
    }

    #[test]
    fn grouped_camera_fields_move_together() {
        let mut cam = Camera::new("main");
        cam.look_at(Vec3::new(1.0, 1.0, 1.0), Vec3::ZERO);
        let mut s = ByteStream::new();
        cam.pack(&mut s, cam.dirty());
        assert_eq!(s.len(), 8 + 12 + 12);

        let mut proxy = Camera::default();
        proxy.unpack(&mut s).unwrap();
        assert_eq!(proxy.eye(), Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(proxy.fov_y(), 60.0);
    }

    #[test]
    fn node_list_replicates_membership() {
        let mut list = NodeList::new("scene");
        list.push(ObjectId(4));
        list.push(ObjectId(9));
        assert!(list.remove(ObjectId(4)));
        assert!(!list.remove(ObjectId(4)));

        let mut s = ByteStream::new();
        list.pack(&mut s, DirtyMask::ALL);
        let mut proxy = NodeList::default();
        proxy.unpack(&mut s).unwrap();
        assert_eq!(proxy.members(), &[ObjectId(9)]);
        assert_eq!(proxy.name(), "scene");
    }
}
