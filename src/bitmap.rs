//! Checkpoint bitmap — C3.
//!
//! Tracks which block indices within a session have been processed so a
//! crashed or aborted session can resume from `first_unset()` instead of
//! rescanning from zero. Only `set` transitions are exposed after
//! construction — a bit never clears during a run (§3).

use std::io::{self, Read, Write};
use std::sync::Mutex;

pub struct Bitmap {
    bits: Mutex<Vec<u8>>,
    bit_count: u64,
}

impl Bitmap {
    /// A zeroed bitmap large enough to hold `bit_count` bits.
    pub fn new(bit_count: u64) -> Self {
        let byte_len = ((bit_count + 7) / 8) as usize;
        Self {
            bits: Mutex::new(vec![0u8; byte_len]),
            bit_count,
        }
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn set(&self, i: u64) {
        assert!(i < self.bit_count, "bitmap index out of range");
        let mut bits = self.bits.lock().unwrap();
        bits[(i / 8) as usize] |= 1 << (i % 8);
    }

    pub fn test(&self, i: u64) -> bool {
        assert!(i < self.bit_count, "bitmap index out of range");
        let bits = self.bits.lock().unwrap();
        bits[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    /// Index of the first unset bit, or `bit_count` if every bit is set —
    /// callers treat that as "no more work".
    pub fn first_unset(&self) -> u64 {
        let bits = self.bits.lock().unwrap();
        for i in 0..self.bit_count {
            if bits[(i / 8) as usize] & (1 << (i % 8)) == 0 {
                return i;
            }
        }
        self.bit_count
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        let bits = self.bits.lock().unwrap();
        w.write_all(&bits)
    }

    pub fn read_from<R: Read>(mut r: R, bit_count: u64) -> io::Result<Bitmap> {
        let byte_len = ((bit_count + 7) / 8) as usize;
        let mut buf = vec![0u8; byte_len];
        r.read_exact(&mut buf)?;
        Ok(Bitmap {
            bits: Mutex::new(buf),
            bit_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_all_unset() {
        let bm = Bitmap::new(10);
        assert_eq!(bm.first_unset(), 0);
        for i in 0..10 {
            assert!(!bm.test(i));
        }
    }

    #[test]
    fn set_marks_bit_and_advances_first_unset() {
        let bm = Bitmap::new(10);
        bm.set(0);
        bm.set(1);
        assert!(bm.test(0));
        assert!(bm.test(1));
        assert_eq!(bm.first_unset(), 2);
    }

    #[test]
    fn first_unset_returns_bit_count_when_full() {
        let bm = Bitmap::new(4);
        for i in 0..4 {
            bm.set(i);
        }
        assert_eq!(bm.first_unset(), 4);
    }

    #[test]
    fn round_trips_through_write_and_read() {
        let bm = Bitmap::new(20);
        bm.set(3);
        bm.set(17);
        let mut buf = Vec::new();
        bm.write_to(&mut buf).unwrap();

        let restored = Bitmap::read_from(&buf[..], 20).unwrap();
        assert!(restored.test(3));
        assert!(restored.test(17));
        assert_eq!(restored.first_unset(), 0);
        assert!(!restored.test(0));
    }

    #[test]
    fn byte_len_rounds_up_to_ceil_of_eight() {
        let bm = Bitmap::new(9);
        let mut buf = Vec::new();
        bm.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 2);
    }
}
