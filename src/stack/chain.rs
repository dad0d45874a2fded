//! Owned chain of byte segments moved between the stack and the relays.

use std::borrow::Cow;
use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// An ordered sequence of zero-copy segments.
///
/// `len()` is the length of the front segment and `tot_len()` the length of
/// the whole chain. Consumption happens from the front only; segments that
/// are fully consumed are dropped immediately.
#[derive(Debug, Default, Clone)]
pub struct SegmentChain {
    segs: VecDeque<Bytes>,
    tot_len: usize,
}

impl SegmentChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one segment. Empty segments are not stored.
    pub fn push(&mut self, seg: Bytes) {
        if seg.is_empty() {
            return;
        }
        self.tot_len += seg.len();
        self.segs.push_back(seg);
    }

    /// Take ownership of `other` and append all of its segments.
    pub fn cat(&mut self, mut other: SegmentChain) {
        self.tot_len += other.tot_len;
        self.segs.append(&mut other.segs);
    }

    /// Length of the front segment.
    pub fn len(&self) -> usize {
        self.segs.front().map_or(0, Bytes::len)
    }

    pub fn tot_len(&self) -> usize {
        self.tot_len
    }

    pub fn is_empty(&self) -> bool {
        self.tot_len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.segs.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.segs.iter()
    }

    /// Advance past `n` bytes, dropping fully consumed segments.
    /// `n` beyond `tot_len()` empties the chain.
    pub fn free_header(&mut self, mut n: usize) {
        debug_assert!(n <= self.tot_len, "free_header past end of chain");
        while n > 0 {
            let Some(front) = self.segs.front_mut() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                self.tot_len -= front.len();
                self.segs.pop_front();
            } else {
                let _ = front.split_to(n);
                self.tot_len -= n;
                n = 0;
            }
        }
    }

    /// Copy up to `dst.len()` bytes starting at `offset` into `dst`.
    /// Returns the number of bytes copied.
    pub fn copy_partial(&self, dst: &mut [u8], mut offset: usize) -> usize {
        let mut copied = 0;
        for seg in &self.segs {
            if copied == dst.len() {
                break;
            }
            if offset >= seg.len() {
                offset -= seg.len();
                continue;
            }
            let src = &seg[offset..];
            let n = src.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&src[..n]);
            copied += n;
            offset = 0;
        }
        copied
    }

    /// The whole chain as one contiguous region. Borrowed when the chain is
    /// a single segment, flattened into a copy otherwise.
    pub fn to_contiguous(&self) -> Cow<'_, [u8]> {
        match self.segs.len() {
            0 => Cow::Borrowed(&[]),
            1 => Cow::Borrowed(&self.segs[0][..]),
            _ => {
                let mut buf = vec![0u8; self.tot_len];
                self.copy_partial(&mut buf, 0);
                Cow::Owned(buf)
            }
        }
    }

    /// Consume the chain into a single `Bytes` without copying when possible.
    pub fn into_bytes(mut self) -> Bytes {
        match self.segs.len() {
            0 => Bytes::new(),
            1 => self.segs.pop_front().unwrap_or_default(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.tot_len);
                for seg in &self.segs {
                    buf.extend_from_slice(seg);
                }
                buf.freeze()
            }
        }
    }

    pub fn clear(&mut self) {
        self.segs.clear();
        self.tot_len = 0;
    }
}

impl From<Bytes> for SegmentChain {
    fn from(seg: Bytes) -> Self {
        let mut chain = SegmentChain::new();
        chain.push(seg);
        chain
    }
}

impl FromIterator<Bytes> for SegmentChain {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        let mut chain = SegmentChain::new();
        for seg in iter {
            chain.push(seg);
        }
        chain
    }
}
