use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::io;

use log::{debug, trace};

use crate::disk_manager::{DiskManager, PageData, PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::extendible_hash::ExtendibleHashTable;
use crate::lru_replacer::LruReplacer;
use crate::sync::{AtomicBool, AtomicUsize, Mutex, Ordering, RwLock};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IOError(io::Error),
    NoFreeFrames,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IOError(err)
    }
}

pub type FrameId = usize;

/// Bucket capacity of the page table's hash directory.
pub const BUCKET_SIZE: usize = 64;

/// One slot of the pool: a page-sized buffer plus residency metadata. Frames
/// are created once at pool construction and only ever reused; the buffer
/// address is stable for the pool's lifetime.
pub struct Frame {
    id: UnsafeCell<PageId>,
    dirty: AtomicBool,
    pin_count: AtomicUsize,
    data: RwLock<PageData>,
}

// SAFETY: the UnsafeCell<PageId> is written only by the pool, under the pool
// mutex, for frames it owns exclusively (free, or a victim observed at pin
// count zero). Callers read it only while holding a pin, which keeps the pool
// from reassigning the frame. Everything else is atomics or a lock.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    /// Id of the resident page. Meaningful only while the caller holds a pin.
    pub fn id(&self) -> PageId {
        // SAFETY: see the Send/Sync note above.
        unsafe { *self.id.get() }
    }

    pub fn pin_count(&self) -> usize {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// The page bytes. The lock is the latch reserved for higher layers; the
    /// pool itself takes it only for frames it owns exclusively.
    pub fn data(&self) -> &RwLock<PageData> {
        &self.data
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Fixed-size pool of page frames fronting a disk manager. At most one frame
/// holds any given page; pinned frames are never evicted; dirty frames are
/// written back before their frame is reused.
///
/// Every operation runs under a single pool mutex, disk I/O included. Frame
/// metadata uses atomics so a caller holding a pin can read it without the
/// mutex.
pub struct BufferPool {
    capacity: usize,
    frames: Box<[Frame]>,
    inner: Mutex<BufferPoolInner>,
}

struct BufferPoolInner {
    disk_manager: Box<dyn DiskManager + Send>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LruReplacer<FrameId>,
    free_frames: VecDeque<FrameId>,
}

impl BufferPool {
    /// The pool does not flush on drop; callers that need durability must
    /// call [`BufferPool::flush_page`] before tearing it down.
    pub fn new(disk_manager: Box<dyn DiskManager + Send>, capacity: usize) -> BufferPool {
        assert!(capacity > 0, "capacity must be positive");
        let mut frames = Vec::with_capacity(capacity);
        let mut free_frames = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            frames.push(Frame {
                id: UnsafeCell::new(INVALID_PAGE_ID),
                dirty: AtomicBool::new(false),
                pin_count: AtomicUsize::new(0),
                data: RwLock::new([0; PAGE_SIZE]),
            });
            free_frames.push_back(i);
        }
        debug!("buffer pool of {} frames", capacity);
        BufferPool {
            capacity,
            frames: frames.into_boxed_slice(),
            inner: Mutex::new(BufferPoolInner {
                disk_manager,
                page_table: ExtendibleHashTable::new(BUCKET_SIZE),
                replacer: LruReplacer::new(),
                free_frames,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pin the page, reading it from disk if it is not resident. Fails with
    /// [`Error::NoFreeFrames`] when every frame is pinned. Every successful
    /// fetch must be matched by exactly one [`BufferPool::unpin_page`].
    pub fn fetch_page(&self, page_id: PageId) -> Result<&Frame> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(frame_id) = inner.page_table.find(page_id) {
            let frame = &self.frames[frame_id];
            frame.pin_count.fetch_add(1, Ordering::SeqCst);
            // Only unpinned frames sit in the replacer; for a frame that was
            // already pinned this is a no-op.
            inner.replacer.erase(frame_id);
            return Ok(frame);
        }

        let frame_id = self.take_victim(&mut inner)?;
        let frame = &self.frames[frame_id];

        inner.page_table.insert(page_id, frame_id);
        // SAFETY: the frame came off the free list or was evicted at pin
        // count zero, and the pool mutex is held: no other thread can observe
        // or reassign it.
        unsafe { frame.id.get().write(page_id) };
        frame.dirty.store(false, Ordering::SeqCst);
        frame.pin_count.store(1, Ordering::SeqCst);

        let mut data = frame.data.write().unwrap();
        if let Err(err) = inner.disk_manager.read_page(page_id, &mut data) {
            drop(data);
            // A failed read must not leave a phantom mapping or leak the frame.
            inner.page_table.remove(page_id);
            // SAFETY: as above; the frame is still exclusively ours.
            unsafe { frame.id.get().write(INVALID_PAGE_ID) };
            frame.pin_count.store(0, Ordering::SeqCst);
            inner.free_frames.push_back(frame_id);
            return Err(err.into());
        }
        drop(data);
        trace!("read page {:?} into frame {}", page_id, frame_id);

        Ok(frame)
    }

    /// Allocate a fresh page on disk and pin it in a zeroed frame. Fails with
    /// [`Error::NoFreeFrames`] when every frame is pinned.
    pub fn allocate_page(&self) -> Result<&Frame> {
        let mut inner = self.inner.lock().unwrap();

        let frame_id = self.take_victim(&mut inner)?;
        let frame = &self.frames[frame_id];

        let page_id = match inner.disk_manager.allocate_page() {
            Ok(page_id) => page_id,
            Err(err) => {
                // The old resident is already written back and unmapped; hand
                // the frame back to the free list.
                // SAFETY: the frame is exclusively ours, as in fetch_page.
                unsafe { frame.id.get().write(INVALID_PAGE_ID) };
                frame.dirty.store(false, Ordering::SeqCst);
                inner.free_frames.push_back(frame_id);
                return Err(err.into());
            }
        };

        inner.page_table.insert(page_id, frame_id);
        // SAFETY: as in fetch_page.
        unsafe { frame.id.get().write(page_id) };
        frame.dirty.store(false, Ordering::SeqCst);
        frame.pin_count.store(1, Ordering::SeqCst);

        let mut data = frame.data.write().unwrap();
        for byte in data.iter_mut() {
            *byte = 0;
        }
        drop(data);
        trace!("allocated page {:?} in frame {}", page_id, frame_id);

        Ok(frame)
    }

    /// Drop one pin, folding `is_dirty` into the frame's dirty flag
    /// (dirtiness is sticky until eviction). Returns false for an unknown
    /// page or a pin count already at zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock().unwrap();
        let frame_id = match inner.page_table.find(page_id) {
            Some(frame_id) => frame_id,
            None => return false,
        };
        let frame = &self.frames[frame_id];
        if is_dirty {
            frame.dirty.store(true, Ordering::SeqCst);
        }
        let pins = frame.pin_count.load(Ordering::SeqCst);
        if pins == 0 {
            return false;
        }
        frame.pin_count.store(pins - 1, Ordering::SeqCst);
        if pins == 1 {
            inner.replacer.insert(frame_id);
        }
        true
    }

    /// Write the resident copy of the page to disk. Returns `Ok(false)` for
    /// the sentinel id or a page that is not resident. The dirty flag is not
    /// cleared: another holder may have re-dirtied the page since the caller
    /// last touched it, and eviction will write again. Callers must not hold
    /// the frame's data latch across this call.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Ok(false);
        }
        let mut inner = self.inner.lock().unwrap();
        let frame_id = match inner.page_table.find(page_id) {
            Some(frame_id) => frame_id,
            None => return Ok(false),
        };
        let frame = &self.frames[frame_id];
        let data = frame.data.read().unwrap();
        inner.disk_manager.write_page(page_id, &data)?;
        trace!("flushed page {:?} from frame {}", page_id, frame_id);
        Ok(true)
    }

    /// Evict the page if it is resident and unpinned, then deallocate it on
    /// disk. Returns `Ok(false)` - and deallocates nothing - while the page
    /// is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(frame_id) = inner.page_table.find(page_id) {
            let frame = &self.frames[frame_id];
            if frame.pin_count() > 0 {
                return Ok(false);
            }
            inner.page_table.remove(page_id);
            inner.replacer.erase(frame_id);
            frame.dirty.store(false, Ordering::SeqCst);
            // SAFETY: pin count is zero and the pool mutex is held.
            unsafe { frame.id.get().write(INVALID_PAGE_ID) };
            let mut data = frame.data.write().unwrap();
            for byte in data.iter_mut() {
                *byte = 0;
            }
            drop(data);
            inner.free_frames.push_back(frame_id);
            debug!("deleted resident page {:?} from frame {}", page_id, frame_id);
        }
        inner.disk_manager.deallocate_page(page_id)?;
        Ok(true)
    }

    pub fn is_page_in_memory(&self, page_id: PageId) -> bool {
        self.inner.lock().unwrap().page_table.find(page_id).is_some()
    }

    /// Pop a free frame, or evict the least recently unpinned page. A dirty
    /// victim is written back before its mapping is dropped.
    fn take_victim(&self, inner: &mut BufferPoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_frames.pop_front() {
            return Ok(frame_id);
        }
        let frame_id = match inner.replacer.victim() {
            Some(frame_id) => frame_id,
            None => return Err(Error::NoFreeFrames),
        };
        let frame = &self.frames[frame_id];
        // SAFETY: victims have pin count zero and the pool mutex is held, so
        // the frame cannot be re-pinned or reassigned under us.
        let old_id = unsafe { *frame.id.get() };
        if frame.is_dirty() {
            debug!("writing back dirty page {:?} from frame {}", old_id, frame_id);
            let data = frame.data.read().unwrap();
            if let Err(err) = inner.disk_manager.write_page(old_id, &data) {
                drop(data);
                // The page stays resident and eligible for eviction.
                inner.replacer.insert(frame_id);
                return Err(err.into());
            }
        }
        inner.page_table.remove(old_id);
        Ok(frame_id)
    }
}
