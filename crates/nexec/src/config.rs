// SPDX-License-Identifier: (MIT OR Apache-2.0)

use std::sync::Arc;
use std::time::Duration;

use nexec_context::{MmapStackAllocator, StackAllocator};

/// Stack size used when `create_fiber` is given zero.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Executive manager settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct ExecutiveConfig {
    pub default_stack_size: usize,
    /// Time slice given to newly created groups.
    pub default_time_slice: Option<Duration>,
    pub allocator: Arc<dyn StackAllocator>,
}

impl ExecutiveConfig {
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.default_stack_size = size;
        self
    }

    pub fn with_time_slice(mut self, slice: Duration) -> Self {
        self.default_time_slice = Some(slice);
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn StackAllocator>) -> Self {
        self.allocator = allocator;
        self
    }
}

impl Default for ExecutiveConfig {
    fn default() -> Self {
        Self {
            default_stack_size: DEFAULT_STACK_SIZE,
            default_time_slice: None,
            allocator: Arc::new(MmapStackAllocator::new()),
        }
    }
}
