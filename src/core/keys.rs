use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the domain (world, dimension, map) a tile belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u32);

impl DomainId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain#{}", self.0)
    }
}

impl From<u32> for DomainId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Identifies a 2-D column tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnKey {
    pub domain: DomainId,
    pub x: i32,
    pub z: i32,
}

impl ColumnKey {
    pub fn new(domain: DomainId, x: i32, z: i32) -> Self {
        Self { domain, x, z }
    }

    /// Gets the cube at height `y` inside this column
    pub fn cube(&self, y: i32) -> CubeKey {
        CubeKey::new(self.domain, self.x, y, self.z)
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ ({}, {})", self.domain, self.x, self.z)
    }
}

/// Identifies a 3-D cube tile. Every cube lives inside the column sharing its
/// `x` and `z`, which has to be resolved before the cube can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CubeKey {
    pub domain: DomainId,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CubeKey {
    pub fn new(domain: DomainId, x: i32, y: i32, z: i32) -> Self {
        Self { domain, x, y, z }
    }

    /// Gets the parent column
    pub fn column(&self) -> ColumnKey {
        ColumnKey::new(self.domain, self.x, self.z)
    }

    /// Checks whether the cube stands inside `column`
    pub fn is_in(&self, column: &ColumnKey) -> bool {
        self.column() == *column
    }
}

impl fmt::Display for CubeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ ({}, {}, {})", self.domain, self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keys_are_structural() {
        let a = CubeKey::new(DomainId(1), 3, 0, 4);
        let b = CubeKey::new(DomainId(1), 3, 0, 4);
        let other_domain = CubeKey::new(DomainId(2), 3, 0, 4);

        assert_eq!(a, b);
        assert_ne!(a, other_domain);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&other_domain));
    }

    #[test]
    fn test_cube_parent_column() {
        let cube = CubeKey::new(DomainId(1), -3, 17, 4);
        let column = cube.column();

        assert_eq!(column, ColumnKey::new(DomainId(1), -3, 4));
        assert!(cube.is_in(&column));
        assert_eq!(column.cube(17), cube);
        assert!(!cube.is_in(&ColumnKey::new(DomainId(1), -3, 5)));
    }

    #[test]
    fn test_key_display() {
        let cube = CubeKey::new(DomainId(7), 1, 2, 3);
        assert_eq!(cube.to_string(), "domain#7 @ (1, 2, 3)");
        assert_eq!(cube.column().to_string(), "domain#7 @ (1, 3)");
    }

    #[test]
    fn test_key_serde() {
        let key = ColumnKey::new(DomainId(2), 0, -9);
        let json = serde_json::to_string(&key).unwrap();
        let back: ColumnKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }
}
