//! Packed in-memory read bank.
//!
//! Each base occupies one byte: three low bits encode the base (A=0, C=1,
//! G=2, T=3, N=4) and five high bits a quality clamped to 0..=31. Once a
//! quality clears the counting cutoff the base is treated as high quality,
//! so the clamp loses nothing the engine cares about. Reads carry a signed
//! 64-bit pair-aware id: pair 1 of a pair is positive, pair 2 is the
//! negated id. Banks keep reads at stable indices with a cursor for
//! sequential scans.

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::fabric::RankCtx;

const NUCLEOTIDES: [u8; 5] = *b"ACGTN";
const MAX_PACKED_QUAL: u8 = 31;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedRead {
    id: i64,
    bytes: Vec<u8>,
}

impl PackedRead {
    pub fn new(id: i64, seq: &[u8], quals: &[u8], qual_offset: u8) -> Result<Self> {
        ensure!(id != 0, "read id 0 is reserved");
        ensure!(
            seq.len() == quals.len(),
            "read {}: sequence length {} != quality length {}",
            id,
            seq.len(),
            quals.len()
        );
        let mut bytes = Vec::with_capacity(seq.len());
        for (i, (&b, &q)) in seq.iter().zip(quals).enumerate() {
            let code: u8 = match b.to_ascii_uppercase() {
                b'A' => 0,
                b'C' => 1,
                b'G' => 2,
                b'T' => 3,
                // IUPAC ambiguity codes degrade to N
                b'N' | b'U' | b'R' | b'Y' | b'K' | b'M' | b'S' | b'W' | b'B' | b'D' | b'H'
                | b'V' => 4,
                other => bail!(
                    "illegal base '{}' at position {} of read {}",
                    other as char,
                    i,
                    id
                ),
            };
            if q < qual_offset {
                bail!(
                    "quality {} below offset {} at position {} of read {}",
                    q,
                    qual_offset,
                    i,
                    id
                );
            }
            bytes.push(code | ((q - qual_offset).min(MAX_PACKED_QUAL) << 3));
        }
        Ok(Self { id, bytes })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode back to sequence and quality bytes (quality re-offset).
    pub fn unpack(&self, qual_offset: u8) -> (Vec<u8>, Vec<u8>) {
        let mut seq = Vec::with_capacity(self.bytes.len());
        let mut quals = Vec::with_capacity(self.bytes.len());
        for &b in &self.bytes {
            seq.push(NUCLEOTIDES[(b & 7) as usize]);
            quals.push(qual_offset + (b >> 3));
        }
        (seq, quals)
    }
}

/// Per-rank bank of packed reads with a sequential-scan cursor.
pub struct PackedReads {
    qual_offset: u8,
    reads: Vec<PackedRead>,
    index: usize,
    max_read_len: usize,
    bases: u64,
}

impl PackedReads {
    pub fn new(qual_offset: u8) -> Self {
        Self { qual_offset, reads: Vec::new(), index: 0, max_read_len: 0, bases: 0 }
    }

    pub fn from_reads(qual_offset: u8, reads: Vec<PackedRead>) -> Self {
        let mut bank = Self::new(qual_offset);
        for read in reads {
            bank.max_read_len = bank.max_read_len.max(read.len());
            bank.bases += read.len() as u64;
            bank.reads.push(read);
        }
        bank
    }

    pub fn add_read(&mut self, id: i64, seq: &[u8], quals: &[u8]) -> Result<()> {
        let read = PackedRead::new(id, seq, quals, self.qual_offset)?;
        self.max_read_len = self.max_read_len.max(read.len());
        self.bases += read.len() as u64;
        self.reads.push(read);
        Ok(())
    }

    /// Rewind the sequential cursor.
    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// Next read in sequence order, or `None` at the end of the bank.
    pub fn get_next_read(&mut self) -> Option<(i64, Vec<u8>, Vec<u8>)> {
        if self.index == self.reads.len() {
            return None;
        }
        let read = &self.reads[self.index];
        self.index += 1;
        let (seq, quals) = read.unpack(self.qual_offset);
        Some((read.id(), seq, quals))
    }

    pub fn get(&self, index: usize) -> &PackedRead {
        &self.reads[index]
    }

    pub fn get_local_num_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn get_max_read_len(&self) -> usize {
        self.max_read_len
    }

    pub fn get_qual_offset(&self) -> u8 {
        self.qual_offset
    }

    pub fn bases(&self) -> u64 {
        self.bases
    }

    /// Log the read balance across ranks.
    pub fn report_balance(&self, ctx: &RankCtx, label: &str) -> Result<()> {
        let num = self.reads.len();
        let total = ctx.reduce(num, |a, b| a + b)?;
        let max = ctx.reduce(num, |a, b| a.max(b))?;
        if ctx.rank_me() == 0 && max > 0 {
            let avg = total as f64 / ctx.rank_n() as f64;
            tracing::info!(
                "{}: {} reads across {} ranks (balance {:.3})",
                label,
                total,
                ctx.rank_n(),
                avg / max as f64
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip_clamps_quality() {
        // 'J' is phred 41 at offset 33, above the 31 clamp
        let read = PackedRead::new(7, b"ACGTN", b"IIJ!#", 33).unwrap();
        let (seq, quals) = read.unpack(33);
        assert_eq!(seq, b"ACGTN".to_vec());
        assert_eq!(quals, vec![33 + 31, 33 + 31, 33 + 31, 33, 33 + 2]);
    }

    #[test]
    fn test_lowercase_and_iupac_bases() {
        let read = PackedRead::new(1, b"acgtRy", b"IIIIII", 33).unwrap();
        let (seq, _) = read.unpack(33);
        assert_eq!(seq, b"ACGTNN".to_vec());
    }

    #[test]
    fn test_illegal_base_is_fatal() {
        let err = PackedRead::new(3, b"ACXGT", b"IIIII", 33).unwrap_err();
        assert!(err.to_string().contains("illegal base"));
        assert!(err.to_string().contains("read 3"));
    }

    #[test]
    fn test_bank_cursor_and_stats() {
        let mut bank = PackedReads::new(33);
        bank.add_read(1, b"ACGT", b"IIII").unwrap();
        bank.add_read(-1, b"ACGTAA", b"IIIIII").unwrap();
        assert_eq!(bank.get_local_num_reads(), 2);
        assert_eq!(bank.get_max_read_len(), 6);
        assert_eq!(bank.bases(), 10);

        let mut seen = Vec::new();
        while let Some((id, seq, _)) = bank.get_next_read() {
            seen.push((id, seq.len()));
        }
        assert_eq!(seen, vec![(1, 4), (-1, 6)]);
        assert!(bank.get_next_read().is_none());
        bank.reset();
        assert!(bank.get_next_read().is_some());
    }
}
