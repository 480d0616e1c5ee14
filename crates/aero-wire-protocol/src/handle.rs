//! Cross-boundary object identities.

use core::fmt;

pub type ObjectId = u32;
pub type ObjectGeneration = u32;

/// Identity of one object across the wire: an id plus the generation of the id's current
/// lifetime.
///
/// `{ id: 0, generation: 0 }` is the null handle. It is never minted by a [`crate::HandleTable`]
/// and is used on the wire for optional object arguments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle {
    pub id: ObjectId,
    pub generation: ObjectGeneration,
}

impl ObjectHandle {
    pub const NULL: Self = Self { id: 0, generation: 0 };

    pub const fn new(id: ObjectId, generation: ObjectGeneration) -> Self {
        Self { id, generation }
    }

    pub const fn is_null(&self) -> bool {
        self.id == 0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.generation)
    }
}

/// Object families known to the wire. Each family has its own id space on both sides.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    Instance = 0,
    Adapter = 1,
    Device = 2,
    Queue = 3,
    Buffer = 4,
    Texture = 5,
    TextureView = 6,
    Surface = 7,
    ShaderModule = 8,
    CommandEncoder = 9,
    CommandBuffer = 10,
}

impl ObjectType {
    pub const COUNT: usize = 11;

    pub const ALL: [ObjectType; Self::COUNT] = [
        ObjectType::Instance,
        ObjectType::Adapter,
        ObjectType::Device,
        ObjectType::Queue,
        ObjectType::Buffer,
        ObjectType::Texture,
        ObjectType::TextureView,
        ObjectType::Surface,
        ObjectType::ShaderModule,
        ObjectType::CommandEncoder,
        ObjectType::CommandBuffer,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_type_round_trips_through_u32() {
        for ty in ObjectType::ALL {
            assert_eq!(ObjectType::from_u32(ty as u32), Some(ty));
        }
        assert_eq!(ObjectType::from_u32(ObjectType::COUNT as u32), None);
    }

    #[test]
    fn null_handle_is_default() {
        assert!(ObjectHandle::default().is_null());
        assert!(!ObjectHandle::new(1, 0).is_null());
        assert_eq!(ObjectHandle::new(7, 3).to_string(), "7@3");
    }
}
