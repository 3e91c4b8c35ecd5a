//! Fixed-length DNA words packed two bits per base.
//!
//! `Kmer<W>` stores up to `32 * W` bases in `W` machine words, with base 0
//! in the most significant bits of word 0. That layout makes numeric
//! comparison of the word array equal to lexicographic comparison of the
//! bases, which is what canonical-form selection relies on.
//!
//! Word buckets cover k up to 32, 64, 96, 128 and 160; a round's k selects
//! the bucket once at dispatch time and every structure in that round is
//! monomorphized on it.

use anyhow::{anyhow, ensure, Result};
use fxhash::FxHasher;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Largest supported word bucket (k up to 160).
pub const MAX_KMER_WORDS: usize = 5;

/// Number of u64 words needed to hold a k-mer of length `k`.
pub const fn words_for_k(k: usize) -> usize {
    (k + 31) / 32
}

const BASE_CHARS: [u8; 4] = *b"ACGT";

/// 2-bit code for a nucleotide, case-insensitive. `None` for anything that
/// is not A, C, G or T.
pub fn base_code(b: u8) -> Option<u64> {
    match b.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        _ => None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Kmer<const W: usize> {
    longs: [u64; W],
    k: u16,
}

impl<const W: usize> Kmer<W> {
    /// Pack a sequence window. Every base must be A/C/G/T (any case).
    pub fn from_seq(seq: &[u8]) -> Result<Self> {
        let k = seq.len();
        ensure!(k > 0 && k <= 32 * W, "k-mer length {} out of range for {} words", k, W);
        let mut longs = [0u64; W];
        for (i, &b) in seq.iter().enumerate() {
            let code = base_code(b)
                .ok_or_else(|| anyhow!("invalid nucleotide '{}' in k-mer", b as char))?;
            longs[i / 32] |= code << (62 - 2 * (i % 32));
        }
        Ok(Self { longs, k: k as u16 })
    }

    pub fn k(&self) -> usize {
        self.k as usize
    }

    /// 2-bit code of the base at position `i`.
    #[inline]
    pub fn base_at(&self, i: usize) -> u64 {
        debug_assert!(i < self.k());
        (self.longs[i / 32] >> (62 - 2 * (i % 32))) & 0b11
    }

    #[inline]
    fn set_base(longs: &mut [u64; W], i: usize, code: u64) {
        let shift = 62 - 2 * (i % 32);
        longs[i / 32] = (longs[i / 32] & !(0b11 << shift)) | (code << shift);
    }

    /// Zero any bits past base `k - 1`.
    fn clear_tail(longs: &mut [u64; W], k: usize) {
        let word = k / 32;
        let rem = k % 32;
        if rem == 0 {
            for w in longs.iter_mut().skip(word) {
                *w = 0;
            }
        } else {
            longs[word] &= !0u64 << (64 - 2 * rem);
            for w in longs.iter_mut().skip(word + 1) {
                *w = 0;
            }
        }
    }

    /// First base as an ASCII character.
    pub fn front(&self) -> u8 {
        BASE_CHARS[self.base_at(0) as usize]
    }

    /// Last base as an ASCII character.
    pub fn back(&self) -> u8 {
        BASE_CHARS[self.base_at(self.k() - 1) as usize]
    }

    /// Reverse complement.
    pub fn revcomp(&self) -> Self {
        let k = self.k();
        let mut longs = [0u64; W];
        for i in 0..k {
            let code = 3 - self.base_at(k - 1 - i);
            Self::set_base(&mut longs, i, code);
        }
        Self { longs, k: self.k }
    }

    /// Shift one base to the right: drop the front base, append `b`.
    pub fn forward_base(&self, b: u8) -> Self {
        let code = base_code(b).expect("extension base must be A, C, G or T");
        let k = self.k();
        let mut longs = [0u64; W];
        for w in 0..W {
            longs[w] = self.longs[w] << 2;
            if w + 1 < W {
                longs[w] |= self.longs[w + 1] >> 62;
            }
        }
        Self::clear_tail(&mut longs, k);
        Self::set_base(&mut longs, k - 1, code);
        Self { longs, k: self.k }
    }

    /// Shift one base to the left: drop the back base, prepend `b`.
    pub fn backward_base(&self, b: u8) -> Self {
        let code = base_code(b).expect("extension base must be A, C, G or T");
        let k = self.k();
        let mut longs = [0u64; W];
        for w in (0..W).rev() {
            longs[w] = self.longs[w] >> 2;
            if w >= 1 {
                longs[w] |= self.longs[w - 1] << 62;
            }
        }
        Self::set_base(&mut longs, 0, code);
        Self::clear_tail(&mut longs, k);
        Self { longs, k: self.k }
    }

    /// Canonical form: the lexicographic minimum of this k-mer and its
    /// reverse complement, with a flag saying whether the canonical form is
    /// the reverse complement.
    pub fn canonical(&self) -> (Self, bool) {
        let rc = self.revcomp();
        if rc < *self {
            (rc, true)
        } else {
            (*self, false)
        }
    }

    /// Stable 64-bit hash of the packed representation.
    pub fn hash64(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.longs.hash(&mut hasher);
        self.k.hash(&mut hasher);
        hasher.finish()
    }

    /// Minimizer hash: the minimum hash over all length-`m` windows of this
    /// k-mer. Used only to pick a home rank; the stored key is always the
    /// canonical k-mer itself.
    pub fn minimizer_hash(&self, m: usize) -> u64 {
        let m = m.clamp(1, self.k().min(32));
        let mask = if m == 32 { !0u64 } else { (1u64 << (2 * m)) - 1 };
        let mut acc = 0u64;
        let mut best = u64::MAX;
        for i in 0..self.k() {
            acc = ((acc << 2) | self.base_at(i)) & mask;
            if i + 1 >= m {
                let mut hasher = FxHasher::default();
                acc.hash(&mut hasher);
                best = best.min(hasher.finish());
            }
        }
        best
    }

    /// Raw packed word, for callers that key maps by the bit representation.
    pub fn packed_word(&self, i: usize) -> u64 {
        self.longs[i]
    }
}

impl<const W: usize> Ord for Kmer<W> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.longs.cmp(&other.longs).then(self.k.cmp(&other.k))
    }
}

impl<const W: usize> PartialOrd for Kmer<W> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const W: usize> fmt::Display for Kmer<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.k() {
            write!(f, "{}", BASE_CHARS[self.base_at(i) as usize] as char)?;
        }
        Ok(())
    }
}

impl<const W: usize> fmt::Debug for Kmer<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kmer({self})")
    }
}

/// All k-mers of `seq` with their start positions. Windows containing
/// anything other than A/C/G/T (any case) are skipped; the scan restarts
/// after the offending base.
pub fn get_kmers<const W: usize>(seq: &[u8], k: usize) -> Vec<(usize, Kmer<W>)> {
    let mut out = Vec::new();
    if seq.len() < k || k == 0 || k > 32 * W {
        return out;
    }
    out.reserve(seq.len() - k + 1);
    let mut i = 0;
    'scan: while i + k <= seq.len() {
        // restart past the rightmost invalid base in this window, if any
        if let Some(bad) = seq[i..i + k].iter().rposition(|&b| base_code(b).is_none()) {
            i += bad + 1;
            continue;
        }
        let mut kmer = Kmer::<W>::from_seq(&seq[i..i + k]).expect("window was validated");
        out.push((i, kmer));
        let mut j = i + k;
        while j < seq.len() {
            if base_code(seq[j]).is_none() {
                i = j + 1;
                continue 'scan;
            }
            kmer = kmer.forward_base(seq[j]);
            out.push((j + 1 - k, kmer));
            j += 1;
        }
        break;
    }
    out
}
