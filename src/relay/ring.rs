//! Bounded FIFO of datagrams waiting for the outbound socket.

use std::collections::VecDeque;

use bytes::Bytes;

pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

#[derive(Debug)]
pub struct DatagramRing {
    queue: VecDeque<Bytes>,
    capacity: usize,
}

impl DatagramRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// 追加一个数据报；队列满时淘汰并返回最旧的一个
    pub fn push(&mut self, datagram: Bytes) -> Option<Bytes> {
        let evicted = if self.queue.len() == self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(datagram);
        evicted
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.queue.front()
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_newest_n() {
        let mut ring = DatagramRing::new(3);
        for i in 0u8..5 {
            let evicted = ring.push(Bytes::from(vec![i]));
            if i < 3 {
                assert!(evicted.is_none());
            } else {
                assert_eq!(evicted.unwrap()[0], i - 3);
            }
            assert!(ring.len() <= ring.capacity());
        }
        let rest: Vec<u8> = std::iter::from_fn(|| ring.pop()).map(|b| b[0]).collect();
        assert_eq!(rest, vec![2, 3, 4]);
    }

    #[test]
    fn zero_capacity_clamps_to_one() {
        let mut ring = DatagramRing::new(0);
        ring.push(Bytes::from_static(b"a"));
        ring.push(Bytes::from_static(b"b"));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.front().unwrap(), &Bytes::from_static(b"b"));
    }
}
