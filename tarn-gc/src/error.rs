use thiserror::Error;

/// Failure to satisfy an allocation request. Everything else that can go
/// wrong in the heap is a protocol violation and asserts instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("out of memory while allocating a heap block")]
    OutOfMemory,

    #[error("cell of {size} bytes exceeds the largest size class")]
    CellTooLarge { size: usize },
}
