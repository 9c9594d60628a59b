use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use crate::backend::StorageLayout;
use crate::error::{JitError, Result};

/// Owns the zeroed storage handed out for globals.
#[derive(Debug, Default)]
pub struct GlobalArena {
    blocks: Vec<(NonNull<u8>, Layout)>,
}

impl GlobalArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, layout: StorageLayout) -> Result<*const u8> {
        let layout = Layout::from_size_align(layout.size.max(1), layout.align.max(1))
            .map_err(|e| JitError::Backend(format!("Invalid global layout: {}", e)))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            JitError::Backend(format!("Out of memory allocating {} bytes", layout.size()))
        })?;
        self.blocks.push((ptr, layout));
        Ok(ptr.as_ptr())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Drop for GlobalArena {
    fn drop(&mut self) {
        for (ptr, layout) in self.blocks.drain(..) {
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}
