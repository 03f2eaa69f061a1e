// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use crate::common::bit;
use std::{
    alloc::{handle_alloc_error, Layout},
    ptr::NonNull,
};

/// All buffers are aligned to 64 bytes.
const ALIGNMENT: usize = 64;

/// A growable raw byte buffer backing partition column storage.
///
/// Very similar to Arrow's `MutableBuffer`, with two differences that matter for the
/// shuffle scatter path: allocations are always aligned to 64 bytes so fixed-width copies
/// can be specialized per element size, and `resize` never shrinks. A smaller request is
/// a no-op, which is what lets capacity growth stay idempotent. Newly allocated bytes
/// are always zero-filled.
#[derive(Debug)]
pub struct AlignedBuffer {
    data: NonNull<u8>,
    capacity: usize,
}

unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates a zero-filled buffer with at least `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let aligned_capacity = bit::round_upto_power_of_2(capacity.max(1), ALIGNMENT);
        unsafe {
            let layout = Layout::from_size_align_unchecked(aligned_capacity, ALIGNMENT);
            let ptr = std::alloc::alloc_zeroed(layout);
            Self {
                data: NonNull::new(ptr).unwrap_or_else(|| handle_alloc_error(layout)),
                capacity: aligned_capacity,
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.capacity) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.capacity) }
    }

    /// Reinterprets the buffer as a slice of fixed-width elements. The 64-byte allocation
    /// alignment satisfies any primitive `T` used by the splitter (widths 1/2/4/8/16).
    pub fn typed_mut<T: Copy>(&mut self) -> &mut [T] {
        debug_assert_eq!(self.data.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.data.as_ptr() as *mut T,
                self.capacity / std::mem::size_of::<T>(),
            )
        }
    }

    pub fn typed<T: Copy>(&self) -> &[T] {
        debug_assert_eq!(self.data.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr() as *const T,
                self.capacity / std::mem::size_of::<T>(),
            )
        }
    }

    /// Grows the buffer to hold at least `new_capacity` bytes, zero-filling the added
    /// region. Requests smaller than the current capacity are a no-op.
    pub fn resize(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity {
            return;
        }
        assert!(new_capacity <= isize::MAX as usize, "capacity too large");
        let new_capacity = bit::round_upto_power_of_2(new_capacity, ALIGNMENT);
        unsafe {
            let raw_ptr = std::alloc::realloc(
                self.data.as_ptr(),
                Layout::from_size_align_unchecked(self.capacity, ALIGNMENT),
                new_capacity,
            );
            let ptr = NonNull::new(raw_ptr).unwrap_or_else(|| {
                handle_alloc_error(Layout::from_size_align_unchecked(new_capacity, ALIGNMENT))
            });
            ptr.as_ptr()
                .add(self.capacity)
                .write_bytes(0, new_capacity - self.capacity);
            self.data = ptr;
            self.capacity = new_capacity;
        }
    }

    /// Fills the whole buffer with `value`. Used to mark validity bitmaps all-valid.
    pub fn fill(&mut self, value: u8) {
        unsafe {
            std::ptr::write_bytes(self.data.as_ptr(), value, self.capacity);
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            std::alloc::dealloc(
                self.data.as_ptr(),
                Layout::from_size_align_unchecked(self.capacity, ALIGNMENT),
            )
        }
    }
}
