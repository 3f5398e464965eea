//! Compute dispatch grid arithmetic.
//!
//! A dispatch is described as a grid of threadgroups ([`DispatchSize`]) and
//! the shape of each group ([`ThreadgroupSize`]). Group counts always come
//! from ceiling division, so partial groups cover the remainder and kernels
//! guard their out-of-range threads.

/// Number of groups of `group` threads needed to cover `extent` threads.
///
/// ```rust
/// use pixlane_core::groups_for;
///
/// assert_eq!(groups_for(1920, 16), 120);
/// assert_eq!(groups_for(1081, 16), 68);
/// assert_eq!(groups_for(0, 16), 0);
/// ```
///
/// # Panics
///
/// Panics if `group` is zero.
#[inline]
pub const fn groups_for(extent: u32, group: u32) -> u32 {
    assert!(group > 0, "threadgroup dimension must be non-zero");
    extent.div_ceil(group)
}

/// Shape of one threadgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadgroupSize {
    /// Threads along x.
    pub x: u32,
    /// Threads along y.
    pub y: u32,
    /// Threads along z.
    pub z: u32,
}

impl ThreadgroupSize {
    /// 2-D group with `z = 1`.
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y, z: 1 }
    }

    /// 3-D group.
    pub const fn new_3d(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Total threads per group.
    pub const fn threads(&self) -> u32 {
        self.x * self.y * self.z
    }

    /// As an `[x, y, z]` array, matching `@workgroup_size` reflection.
    pub const fn to_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[u32; 3]> for ThreadgroupSize {
    fn from(v: [u32; 3]) -> Self {
        Self::new_3d(v[0], v[1], v[2])
    }
}

/// Number of threadgroups dispatched along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchSize {
    /// Groups along x.
    pub x: u32,
    /// Groups along y.
    pub y: u32,
    /// Groups along z.
    pub z: u32,
}

impl DispatchSize {
    /// 2-D grid with `z = 1`.
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y, z: 1 }
    }

    /// Smallest 2-D grid of `group`-shaped threadgroups covering
    /// `width x height` threads.
    pub const fn covering(width: u32, height: u32, group: ThreadgroupSize) -> Self {
        Self::new(groups_for(width, group.x), groups_for(height, group.y))
    }

    /// Total number of threadgroups.
    pub const fn groups(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Total threads launched with the given group shape.
    pub const fn threads(&self, group: ThreadgroupSize) -> [u64; 3] {
        [
            self.x as u64 * group.x as u64,
            self.y as u64 * group.y as u64,
            self.z as u64 * group.z as u64,
        ]
    }

    /// Whether the grid is empty (nothing to run).
    pub const fn is_empty(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_cover_extent() {
        for extent in [1u32, 2, 15, 16, 17, 255, 1080, 1920, 4097] {
            for group in [1u32, 4, 8, 16, 32] {
                let g = groups_for(extent, group);
                assert!(g * group >= extent, "{extent}/{group} dropped work");
                assert!((g - 1) * group < extent, "{extent}/{group} over-dispatched");
                // Recomputing gives the same count
                assert_eq!(g, groups_for(extent, group));
            }
        }
    }

    #[test]
    fn test_covering_odd_dims() {
        let grid = DispatchSize::covering(17, 13, ThreadgroupSize::new(16, 16));
        assert_eq!(grid, DispatchSize::new(2, 1));
        let threads = grid.threads(ThreadgroupSize::new(16, 16));
        assert!(threads[0] >= 17 && threads[1] >= 13);
    }

    #[test]
    fn test_threadgroup_threads() {
        assert_eq!(ThreadgroupSize::new(16, 16).threads(), 256);
        assert_eq!(ThreadgroupSize::from([4, 1, 1]), ThreadgroupSize::new(4, 1));
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn test_zero_group_panics() {
        let _ = groups_for(10, 0);
    }
}
