//! Shared test fixture: a minimal host runtime.
//!
//! Classes are leaked `ClassInfo` records; an object's vtable word is the
//! address of its class. Threads register with an empty precise stack
//! marker so survivor counts are exact (nothing on the test stack keeps
//! objects alive by accident).

#![allow(dead_code)]

use gengc::object::header::HEADER_SIZE;
use gengc::object::Descriptor;
use gengc::threads::ThreadInfo;
use gengc::{approximate_stack_base, Collector, GcConfig, RuntimeCallbacks, StackMark};
use std::sync::Arc;

pub const WORD: usize = std::mem::size_of::<usize>();

/// Host-side class record; the vtable word points at one of these.
#[repr(C)]
pub struct ClassInfo {
    /// Total object size, header included.
    pub size: usize,
    /// Payload reference bitmap (bit i = payload word i).
    pub ref_bits: u64,
    /// Element size for arrays created through `alloc_array`.
    pub elem_size: usize,
    /// Ephemeron pair count, when this class is an ephemeron array.
    pub pairs: usize,
    pub critical: bool,
    pub finalizer: Option<fn(usize)>,
}

/// Leak a class record and return its address for use as a vtable.
pub fn make_class(info: ClassInfo) -> usize {
    Box::leak(Box::new(info)) as *const ClassInfo as usize
}

/// Plain class: `size` bytes, references at the given payload words.
pub fn data_class(size: usize, ref_slots: &[usize]) -> usize {
    let mut bits = 0u64;
    for &slot in ref_slots {
        bits |= 1 << slot;
    }
    make_class(ClassInfo {
        size,
        ref_bits: bits,
        elem_size: 0,
        pairs: 0,
        critical: false,
        finalizer: None,
    })
}

fn class_of(vtable: usize) -> &'static ClassInfo {
    unsafe { &*(vtable as *const ClassInfo) }
}

fn cb_object_size(_obj: usize, vtable: usize) -> usize {
    class_of(vtable).size
}

fn cb_reference_bitmap(vtable: usize) -> Descriptor {
    Descriptor::Bitmap(class_of(vtable).ref_bits)
}

fn cb_value_size(vtable: usize) -> usize {
    class_of(vtable).size
}

fn cb_array_byte_size(vtable: usize, count: usize) -> usize {
    HEADER_SIZE + count * class_of(vtable).elem_size
}

fn cb_array_elements(obj: usize) -> (usize, usize) {
    let class = class_of(unsafe { gengc::object::vtable(obj) });
    (obj + HEADER_SIZE, class.pairs)
}

fn cb_is_critical(vtable: usize) -> bool {
    class_of(vtable).critical
}

fn cb_run_finalizer(obj: usize, vtable: usize) {
    if let Some(finalizer) = class_of(vtable).finalizer {
        finalizer(obj);
    }
}

pub fn test_callbacks() -> RuntimeCallbacks {
    RuntimeCallbacks {
        object_size: cb_object_size,
        reference_bitmap: cb_reference_bitmap,
        value_size: cb_value_size,
        array_byte_size: cb_array_byte_size,
        array_elements: cb_array_elements,
        is_critical_finalizer: cb_is_critical,
        run_finalizer: cb_run_finalizer,
        ..Default::default()
    }
}

/// Stack marker reporting no references: test roots are all registered
/// explicitly, so collections are exactly reproducible.
pub fn empty_stack_marker(_info: &ThreadInfo, _relay: &mut dyn FnMut(*mut usize)) {}

pub struct GcFixture {
    pub gc: Arc<Collector>,
}

impl GcFixture {
    /// Nursery of 4 MiB, one marking worker, precise stack scanning.
    pub fn with_defaults() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut GcConfig)) -> Self {
        let mut config = GcConfig {
            nursery_size: 4 * 1024 * 1024,
            max_heap_size: 64 * 1024 * 1024,
            soft_heap_limit: 64 * 1024 * 1024,
            workers: 1,
            stack_mark: StackMark::Precise,
            ..Default::default()
        };
        adjust(&mut config);
        let gc = Collector::new(config, test_callbacks()).expect("collector init failed");
        gc.register_thread(approximate_stack_base(), Some(empty_stack_marker));
        Self { gc }
    }

    pub fn alloc(&self, class: usize) -> usize {
        let size = class_of(class).size;
        self.gc.alloc(size, class).expect("allocation failed")
    }

    /// Write a reference into an object's payload word through the
    /// barrier.
    pub fn store_ref(&self, obj: usize, payload_word: usize, value: usize) {
        unsafe {
            self.gc
                .wbarrier_set_field(obj, obj + HEADER_SIZE + payload_word * WORD, value);
        }
    }

    pub fn read_ref(&self, obj: usize, payload_word: usize) -> usize {
        unsafe { *((obj + HEADER_SIZE + payload_word * WORD) as *const usize) }
    }

    /// Leak a root range of `slots` words and register it precisely.
    pub fn precise_root(&self, slots: usize) -> &'static mut [usize] {
        let range: &'static mut [usize] = Box::leak(vec![0usize; slots].into_boxed_slice());
        let start = range.as_ptr() as usize;
        let descr = if slots <= 64 {
            let indexes: Vec<usize> = (0..slots).collect();
            Descriptor::bitmap_from_slots(&indexes)
        } else {
            // Out-of-line bitmap block: length word plus full words.
            let n_words = (slots + 63) / 64;
            let mut block = vec![n_words];
            for word_idx in 0..n_words {
                let mut bits = 0usize;
                for bit in 0..64 {
                    if word_idx * 64 + bit < slots {
                        bits |= 1 << bit;
                    }
                }
                block.push(bits);
            }
            let block: &'static [usize] = Box::leak(block.into_boxed_slice());
            Descriptor::Complex(block.as_ptr() as usize)
        };
        self.gc.register_root(start, slots * WORD, Some(descr));
        range
    }

    /// Leak a root range scanned conservatively (its referents get
    /// pinned).
    pub fn pinned_root(&self, slots: usize) -> &'static mut [usize] {
        let range: &'static mut [usize] = Box::leak(vec![0usize; slots].into_boxed_slice());
        let start = range.as_ptr() as usize;
        self.gc.register_root(start, slots * WORD, None);
        range
    }

    pub fn in_nursery(&self, addr: usize) -> bool {
        let (base, bits) = self.gc.nursery_base_and_bits();
        (addr >> bits) == (base >> bits)
    }

    pub fn vtable_of(&self, obj: usize) -> usize {
        unsafe { gengc::object::vtable(obj) }
    }
}

impl Drop for GcFixture {
    fn drop(&mut self) {
        self.gc.unregister_thread();
    }
}
