//! Math types.
//!
//! Small, deterministic value types for replicated transforms and cameras.
//! Master and slaves must compute identical results, so nothing here uses
//! SIMD or platform intrinsics.

use serde::{Deserialize, Serialize};

use crate::{distributed::Field, error::ProtocolResult, stream::ByteStream};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);
    pub const ONE: Self = Self::new(1.0, 1.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (to.x - self.x) * t,
            self.y + (to.y - self.y) * t,
            self.z + (to.z - self.z) * t,
        )
    }
}

/// Rotation quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Rotation of `angle` radians around the Y axis.
    pub fn from_yaw(angle: f32) -> Self {
        let half = angle * 0.5;
        Self {
            x: 0.0,
            y: half.sin(),
            z: 0.0,
            w: half.cos(),
        }
    }
}

/// 4x4 matrix (column-major).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mat4 {
    pub m: [[f32; 4]; 4],
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mat4 {
    pub const IDENTITY: Self = Self {
        m: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    pub fn translation(t: Vec3) -> Self {
        let mut out = Self::IDENTITY;
        out.m[3] = [t.x, t.y, t.z, 1.0];
        out
    }
}

impl Field for Vec3 {
    fn write_field(&self, stream: &mut ByteStream) {
        stream.write_f32(self.x);
        stream.write_f32(self.y);
        stream.write_f32(self.z);
    }

    fn read_field(stream: &mut ByteStream) -> ProtocolResult<Self> {
        Ok(Self::new(stream.read_f32()?, stream.read_f32()?, stream.read_f32()?))
    }
}

impl Field for Quat {
    fn write_field(&self, stream: &mut ByteStream) {
        stream.write_f32(self.x);
        stream.write_f32(self.y);
        stream.write_f32(self.z);
        stream.write_f32(self.w);
    }

    fn read_field(stream: &mut ByteStream) -> ProtocolResult<Self> {
        Ok(Self {
            x: stream.read_f32()?,
            y: stream.read_f32()?,
            z: stream.read_f32()?,
            w: stream.read_f32()?,
        })
    }
}

impl Field for Mat4 {
    fn write_field(&self, stream: &mut ByteStream) {
        for column in &self.m {
            for v in column {
                stream.write_f32(*v);
            }
        }
    }

    fn read_field(stream: &mut ByteStream) -> ProtocolResult<Self> {
        let mut m = [[0.0; 4]; 4];
        for column in &mut m {
            for v in column.iter_mut() {
                *v = stream.read_f32()?;
            }
        }
        Ok(Self { m })
    }
}
