//! Operation token tracking for io_uring completion correlation.
//!
//! Each submitted operation gets a unique token (user_data) that identifies
//! the operation type and associated connection when the completion
//! arrives.

use slab::Slab;

/// Type of in-flight operation. Connections own their own read/write
/// buffers directly, so unlike a shared buffer pool there is no
/// `buf_idx` to carry.
#[derive(Debug, Clone, Copy)]
pub enum OpType {
    Accept,
    Read { conn_id: usize },
    Write { conn_id: usize },
}

/// Allocator for operation tokens with O(1) lookup, backing the
/// `user_data` field io_uring threads through submission and completion.
pub struct TokenAllocator {
    ops: Slab<OpType>,
}

impl TokenAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    pub fn alloc(&mut self, op: OpType) -> u64 {
        self.ops.insert(op) as u64
    }

    pub fn get(&self, token: u64) -> Option<OpType> {
        self.ops.get(token as usize).copied()
    }

    pub fn free(&mut self, token: u64) -> Option<OpType> {
        let idx = token as usize;
        if self.ops.contains(idx) {
            Some(self.ops.remove(idx))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_lookup_and_free() {
        let mut alloc = TokenAllocator::new(16);

        let t1 = alloc.alloc(OpType::Accept);
        let t2 = alloc.alloc(OpType::Read { conn_id: 1 });

        assert_eq!(alloc.len(), 2);
        assert!(matches!(alloc.get(t1), Some(OpType::Accept)));
        assert!(matches!(alloc.get(t2), Some(OpType::Read { conn_id: 1 })));

        alloc.free(t1);
        assert!(alloc.get(t1).is_none());
        assert_eq!(alloc.len(), 1);

        let t3 = alloc.alloc(OpType::Accept);
        assert_eq!(t3, t1, "slab should reuse the freed slot");
    }
}
