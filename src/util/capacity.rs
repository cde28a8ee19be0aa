//! Buffer capacity policy: never shrink, grow with optional headroom.

/// Capacity to reallocate to, or `None` if `current` already fits `required`.
///
/// `headroom` is a fraction of `required` added on growth (0.25 => +25%).
pub fn grown_capacity(current: u64, required: u64, headroom: f32) -> Option<u64> {
    if required <= current {
        return None;
    }
    let extra = (required as f64 * headroom.max(0.0) as f64).floor() as u64;
    Some(required.saturating_add(extra))
}

/// Round `value` up to a multiple of `alignment` (power of two or zero).
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_growth_when_fitting() {
        assert_eq!(grown_capacity(100, 100, 0.25), None);
        assert_eq!(grown_capacity(100, 0, 0.25), None);
    }

    #[test]
    fn test_growth_with_headroom() {
        assert_eq!(grown_capacity(0, 640, 0.25), Some(800));
        assert_eq!(grown_capacity(0, 640, 0.0), Some(640));
        // integer division semantics for odd sizes
        assert_eq!(grown_capacity(0, 7, 0.25), Some(8));
    }

    #[test]
    fn test_grown_capacity_absorbs_later_requirements() {
        let mut capacity = 64u64;
        let mut reallocations = 0;
        for required in [128u64, 130, 140, 150, 160, 100, 50] {
            if let Some(next) = grown_capacity(capacity, required, 0.25) {
                assert!(next >= required);
                capacity = next;
                reallocations += 1;
            }
        }
        assert_eq!(capacity, 160);
        assert_eq!(reallocations, 1);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 128), 384);
        assert_eq!(align_up(13, 1), 13);
        assert_eq!(align_up(13, 0), 13);
    }
}
