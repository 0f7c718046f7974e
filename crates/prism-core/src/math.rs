//! Dispatch sizing helpers.

/// Number of workgroups of size `group` needed to cover `extent` items.
///
/// Returns 0 for an empty extent. `group` must be non-zero.
#[inline]
pub const fn workgroup_count(extent: u32, group: u32) -> u32 {
    extent.div_ceil(group)
}

/// Workgroup counts covering a 2D extent with square workgroups.
#[inline]
pub const fn dispatch_size(width: u32, height: u32, group: u32) -> [u32; 3] {
    [workgroup_count(width, group), workgroup_count(height, group), 1]
}

/// Side length of the smallest square grid holding `count` items.
///
/// This is `ceil(sqrt(count))` computed in integers, so the result is exact
/// for every `u32`. The particle pass uses this value both for addressing in
/// the shader and for sizing the dispatch.
pub const fn grid_pitch(count: u32) -> u32 {
    if count == 0 {
        return 0;
    }
    let n = count as u64;
    // Integer square root by Newton iteration, starting above the root.
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    if x * x == n {
        x as u32
    } else {
        (x + 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroup_count_rounds_up() {
        assert_eq!(workgroup_count(100, 32), 4);
        assert_eq!(workgroup_count(96, 32), 3);
        assert_eq!(workgroup_count(1, 16), 1);
        assert_eq!(workgroup_count(0, 16), 0);
    }

    #[test]
    fn dispatch_size_covers_extent() {
        assert_eq!(dispatch_size(4, 4, 16), [1, 1, 1]);
        assert_eq!(dispatch_size(1920, 1080, 16), [120, 68, 1]);
    }

    #[test]
    fn grid_pitch_is_ceil_sqrt() {
        assert_eq!(grid_pitch(0), 0);
        assert_eq!(grid_pitch(1), 1);
        assert_eq!(grid_pitch(2), 2);
        assert_eq!(grid_pitch(4), 2);
        assert_eq!(grid_pitch(5), 3);
        assert_eq!(grid_pitch(1000), 32);
        assert_eq!(grid_pitch(1024), 32);
        assert_eq!(grid_pitch(1025), 33);
        assert_eq!(grid_pitch(u32::MAX), 65536);
    }

    #[test]
    fn grid_pitch_holds_all_items() {
        for count in 1..2000u32 {
            let pitch = grid_pitch(count);
            assert!(pitch * pitch >= count);
            assert!((pitch - 1) * (pitch - 1) < count);
        }
    }
}
