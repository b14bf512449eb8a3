use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::utils::BitFieldTrait;

// The collector privately owns the low bits of the first header word and
// may replace the whole word with a forwarding pointer. Everything above
// EMBEDDER_SHIFT belongs to the embedding runtime (class index, hash,
// whatever it likes); the collector preserves it across copies.
//
// +------------------+------+--------------------------------------------+
// | name             | bits |                                            |
// +------------------+------+--------------------------------------------+
// | forwarded        |    1 | When set the word is a forwarding pointer. |
// | remembered       |    1 | Object sits in the remembered set.         |
// | age              |    4 | Scavenge survival count, saturating.       |
// | embedder payload | rest |                                            |
// +------------------+------+--------------------------------------------+
//
// Objects are granule (16 byte) aligned, so a forwarding pointer ORed with
// the forwarded bit never collides with the other owned bits.

pub struct ForwardedBit;
pub struct RememberedBit;
pub struct AgeBits;

impl BitFieldTrait<0, 1> for ForwardedBit {}
impl BitFieldTrait<1, 1> for RememberedBit {}
impl BitFieldTrait<2, 4> for AgeBits {}

pub const EMBEDDER_SHIFT: u32 = 6;

#[repr(C)]
pub struct ObjectHeader {
    word: AtomicUsize,
}

impl ObjectHeader {
    /// Header word for a freshly allocated object: age zero, not
    /// remembered, embedder payload in the upper bits.
    pub fn new_word(embedder: usize) -> usize {
        embedder << EMBEDDER_SHIFT
    }

    #[inline(always)]
    pub fn raw(&self) -> usize {
        self.word.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn store_word(&self, word: usize) {
        self.word.store(word, Ordering::Release);
    }

    #[inline(always)]
    pub fn embedder_bits(&self) -> usize {
        self.raw() >> EMBEDDER_SHIFT
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + size_of::<Self>()) as _
    }

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        ForwardedBit::decode(self.word.load(Ordering::Acquire) as u64) != 0
    }

    /// Target of an installed forwarding pointer. Caller must have
    /// observed `is_forwarded()`.
    #[inline(always)]
    pub fn forwarding_pointer(&self) -> *mut ObjectHeader {
        let word = self.word.load(Ordering::Acquire);
        debug_assert!(ForwardedBit::decode(word as u64) != 0);
        (word & !(crate::globals::GRANULE - 1)) as *mut ObjectHeader
    }

    /// Attempts to install a forwarding pointer to `dest`. Exactly one
    /// concurrent caller wins and receives the preserved pre-forwarding
    /// header word; losers receive the winner's destination.
    pub fn try_forward(&self, dest: *mut ObjectHeader) -> Result<usize, *mut ObjectHeader> {
        debug_assert!(crate::utils::is_aligned(dest as usize, crate::globals::GRANULE));
        let forwarded = dest as usize | ForwardedBit::encode(1) as usize;
        let mut old = self.word.load(Ordering::Relaxed);
        loop {
            if ForwardedBit::decode(old as u64) != 0 {
                return Err((old & !(crate::globals::GRANULE - 1)) as *mut ObjectHeader);
            }
            match self
                .word
                .compare_exchange_weak(old, forwarded, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(old),
                Err(x) => old = x,
            }
        }
    }

    #[inline(always)]
    pub fn age(&self) -> u8 {
        AgeBits::decode(self.raw() as u64) as u8
    }

    #[inline(always)]
    pub fn is_remembered(&self) -> bool {
        RememberedBit::decode(self.raw() as u64) != 0
    }

    /// Sets the remembered bit; returns false if it was already set.
    #[inline]
    pub fn try_set_remembered(&self) -> bool {
        let prior = self
            .word
            .fetch_or(RememberedBit::encode(1) as usize, Ordering::AcqRel);
        RememberedBit::decode(prior as u64) == 0
    }

    #[inline]
    pub fn clear_remembered(&self) {
        self.word
            .fetch_and(!(RememberedBit::encode(1) as usize), Ordering::AcqRel);
    }

    /// Word `word` with the age bumped by one, saturating.
    pub fn word_with_bumped_age(word: usize) -> usize {
        let age = AgeBits::decode(word as u64) as u8;
        let next = age.min(crate::globals::MAX_OBJECT_AGE - 1) + 1;
        AgeBits::update(word as u64, next as u64) as usize
    }

    pub fn age_of_word(word: usize) -> u8 {
        AgeBits::decode(word as u64) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarding_single_winner() {
        let header = ObjectHeader {
            word: AtomicUsize::new(ObjectHeader::new_word(7)),
        };
        let dest = 0x4000 as *mut ObjectHeader;

        let preserved = header.try_forward(dest).unwrap();
        assert_eq!(preserved >> EMBEDDER_SHIFT, 7);
        assert!(header.is_forwarded());
        assert_eq!(header.forwarding_pointer(), dest);

        // A later attempt observes the winner's destination.
        let other = 0x8000 as *mut ObjectHeader;
        assert_eq!(header.try_forward(other), Err(dest));
        assert_eq!(header.forwarding_pointer(), dest);
    }

    #[test]
    fn age_saturates() {
        let mut word = ObjectHeader::new_word(0);
        for _ in 0..32 {
            word = ObjectHeader::word_with_bumped_age(word);
        }
        assert_eq!(
            ObjectHeader::age_of_word(word),
            crate::globals::MAX_OBJECT_AGE
        );
    }

    #[test]
    fn remembered_bit_is_sticky_until_cleared() {
        let header = ObjectHeader {
            word: AtomicUsize::new(ObjectHeader::new_word(3)),
        };
        assert!(header.try_set_remembered());
        assert!(!header.try_set_remembered());
        assert_eq!(header.embedder_bits(), 3);
        header.clear_remembered();
        assert!(header.try_set_remembered());
    }
}
