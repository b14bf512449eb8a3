pub mod mmap;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    align_down(addr.wrapping_add(align).wrapping_sub(1), align)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

#[inline(always)]
pub const fn align_usize(value: usize, align: usize) -> usize {
    ((value + align - 1) / align) * align
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

/// Bit-range accessor over a header word, in the style of V8's BitField.
pub trait BitFieldTrait<const SHIFT: u64, const SIZE: u64> {
    const MASK: u64 = ((1 << SHIFT) << SIZE) - (1 << SHIFT);

    fn encode(value: u64) -> u64 {
        value.wrapping_shl(SHIFT as _)
    }

    fn update(previous: u64, value: u64) -> u64 {
        (previous & !Self::MASK) | Self::encode(value)
    }

    fn decode(value: u64) -> u64 {
        (value & Self::MASK).wrapping_shr(SHIFT as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_down(17, 16), 16);
        assert!(is_aligned(64, 16));
        assert!(!is_aligned(68, 16));
        assert_eq!(align_usize(1, 16), 16);
    }

    #[test]
    fn formatted_sizes() {
        assert_eq!(formatted_size(128).to_string(), "128B");
        assert_eq!(formatted_size(4 * 1024).to_string(), "4.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
    }
}
