//! Mutator thread registry and the cooperative suspension backend.
//!
//! Every mutator must register before touching the allocation or barrier
//! API. The registry owns per-thread collector state: the TLAB, the store
//! buffer, the captured stack window and the handshake flags used by the
//! stop-the-world protocol.
//!
//! Suspension itself is pluggable: a host with signal-based suspension
//! drives the same flags from its signal handler. The in-crate backend is
//! cooperative — mutators poll [`ThreadRegistry::safepoint`] at allocation
//! sites and loop back-edges, park when a stop is requested, and ack
//! through a counting semaphore the collector waits on.

use crate::alloc::tlab::Tlab;
use crate::remset::ssb::StoreBuffer;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub type ThreadId = u64;

/// Precise stack marker a thread may register: called during root scanning
/// with a relay accepting each exact reference slot on the thread's stack.
pub type ThreadMarkFn = fn(info: &ThreadInfo, relay: &mut dyn FnMut(*mut usize));

/// Per-thread collector state.
pub struct ThreadInfo {
    id: ThreadId,
    /// Highest stack address (stacks grow down).
    stack_base: usize,
    /// Stack pointer captured at suspension; zero while running.
    stack_cur: AtomicUsize,
    /// Register snapshot captured at suspension (may be empty under the
    /// cooperative backend, where everything live is spilled to the stack).
    regs: Mutex<Vec<usize>>,

    /// Failed a handshake; ignored by every later pass this cycle.
    pub skip: AtomicBool,
    pub dying: AtomicBool,
    /// Set while the thread is inside the managed allocator slow path.
    pub in_managed_allocator: AtomicBool,

    pub tlab: Tlab,
    pub ssb: StoreBuffer,

    suspend_requested: AtomicBool,
    park: Mutex<bool>,
    unpark: Condvar,
    mark_func: Option<ThreadMarkFn>,
}

impl ThreadInfo {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn stack_base(&self) -> usize {
        self.stack_base
    }

    pub fn stack_cur(&self) -> usize {
        self.stack_cur.load(Ordering::Acquire)
    }

    pub fn set_stack_cur(&self, sp: usize) {
        self.stack_cur.store(sp, Ordering::Release);
    }

    /// Captured register words, for conservative scanning.
    pub fn regs_snapshot(&self) -> Vec<usize> {
        self.regs.lock().clone()
    }

    /// Install a register snapshot (signal-based hosts call this from the
    /// suspend handler).
    pub fn set_regs(&self, regs: Vec<usize>) {
        *self.regs.lock() = regs;
    }

    pub fn mark_func(&self) -> Option<ThreadMarkFn> {
        self.mark_func
    }

    pub fn suspend_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire)
    }

    /// Does `ptr` point into the live part of this thread's stack? Only
    /// meaningful when called from the owning thread (barrier fast paths).
    pub fn ptr_on_stack(&self, ptr: usize) -> bool {
        let probe: usize = 0;
        let sp = &probe as *const usize as usize;
        ptr < self.stack_base && ptr >= sp
    }
}

thread_local! {
    /// Registration cache: (registry address, info) pairs for every
    /// collector this thread is registered with.
    static CURRENT_THREADS: RefCell<Vec<(usize, Arc<ThreadInfo>)>> = const { RefCell::new(Vec::new()) };
}

/// Estimate the current thread's stack base. Good enough for conservative
/// scanning: anything above the true base is unmapped-adjacent but never
/// read, because the captured stack pointer bounds the scan.
#[inline(never)]
pub fn approximate_stack_base() -> usize {
    let probe: usize = 0;
    (&probe as *const usize as usize) + 512
}

/// Registry of live mutator threads.
pub struct ThreadRegistry {
    threads: RwLock<IndexMap<ThreadId, Arc<ThreadInfo>>>,
    /// Serializes suspension requests (the thread-info suspend lock).
    pub suspend_lock: Mutex<()>,
    acks: Mutex<usize>,
    ack_cv: Condvar,
    next_id: AtomicU64,
    ssb_size: usize,
}

impl ThreadRegistry {
    pub fn new(ssb_size: usize) -> Self {
        Self {
            threads: RwLock::new(IndexMap::new()),
            suspend_lock: Mutex::new(()),
            acks: Mutex::new(0),
            ack_cv: Condvar::new(),
            next_id: AtomicU64::new(1),
            ssb_size,
        }
    }

    /// Register the calling thread. `mark_func` enables precise stack
    /// scanning for this thread when the collector runs in precise mode.
    pub fn register_current(
        &self,
        stack_base: usize,
        mark_func: Option<ThreadMarkFn>,
    ) -> Arc<ThreadInfo> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(ThreadInfo {
            id,
            stack_base,
            stack_cur: AtomicUsize::new(0),
            regs: Mutex::new(Vec::new()),
            skip: AtomicBool::new(false),
            dying: AtomicBool::new(false),
            in_managed_allocator: AtomicBool::new(false),
            tlab: Tlab::empty(),
            ssb: StoreBuffer::new(self.ssb_size),
            suspend_requested: AtomicBool::new(false),
            park: Mutex::new(false),
            unpark: Condvar::new(),
            mark_func,
        });
        self.threads.write().insert(id, info.clone());
        CURRENT_THREADS.with(|cell| {
            cell.borrow_mut()
                .push((self as *const _ as usize, info.clone()))
        });
        log::debug!("registered mutator thread {} (stack base {:#x})", id, stack_base);
        info
    }

    /// Drop the calling thread's registration, returning its info so the
    /// caller can flush thread-owned state (store buffers) first.
    pub fn unregister_current(&self) -> Option<Arc<ThreadInfo>> {
        let key = self as *const _ as usize;
        let info = CURRENT_THREADS.with(|cell| {
            let mut list = cell.borrow_mut();
            let idx = list.iter().position(|(reg, _)| *reg == key)?;
            Some(list.remove(idx).1)
        })?;
        info.dying.store(true, Ordering::Release);
        self.threads.write().shift_remove(&info.id);
        Some(info)
    }

    /// The calling thread's registration with this registry, if any.
    pub fn current(&self) -> Option<Arc<ThreadInfo>> {
        let key = self as *const _ as usize;
        CURRENT_THREADS.with(|cell| {
            cell.borrow()
                .iter()
                .find(|(reg, _)| *reg == key)
                .map(|(_, info)| info.clone())
        })
    }

    pub fn snapshot(&self) -> Vec<Arc<ThreadInfo>> {
        self.threads.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    // --- suspension handshake -------------------------------------------

    /// Ask `info` to suspend at its next safepoint. Returns false for a
    /// thread that can no longer respond.
    pub fn request_suspend(&self, info: &ThreadInfo) -> bool {
        if info.dying.load(Ordering::Acquire) {
            return false;
        }
        info.suspend_requested.store(true, Ordering::Release);
        true
    }

    /// Release `info` from its safepoint park. Returns false for a thread
    /// that can no longer respond.
    pub fn resume(&self, info: &ThreadInfo) -> bool {
        let parked = info.park.lock();
        info.suspend_requested.store(false, Ordering::Release);
        info.unpark.notify_all();
        drop(parked);
        !info.dying.load(Ordering::Acquire)
    }

    /// Post one handshake acknowledgement (suspension or restart).
    pub fn post_ack(&self) {
        let mut acks = self.acks.lock();
        *acks += 1;
        self.ack_cv.notify_all();
    }

    /// Consume `count` acknowledgements, blocking until they arrive.
    pub fn wait_for_acks(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut acks = self.acks.lock();
        while *acks < count {
            self.ack_cv.wait(&mut acks);
        }
        *acks -= count;
    }

    /// Cooperative safepoint. Mutators call this at allocation sites and
    /// loop back-edges; when a stop is pending the thread captures its
    /// stack window, acks, and parks until the world restarts.
    pub fn safepoint(&self, info: &ThreadInfo) {
        if !info.suspend_requested.load(Ordering::Acquire) {
            return;
        }
        let probe: usize = 0;
        info.set_stack_cur(&probe as *const usize as usize);
        self.post_ack();
        {
            let mut parked = info.park.lock();
            *parked = true;
            while info.suspend_requested.load(Ordering::Acquire) {
                info.unpark.wait(&mut parked);
            }
            *parked = false;
        }
        self.post_ack();
    }
}
