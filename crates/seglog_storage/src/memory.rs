//! In-memory segment device for testing.

use crate::device::{
    Paddr, Segment, SegmentGeometry, SegmentId, SegmentManager, SegmentRef, SlotState,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// An in-memory segment device.
///
/// All segments live in memory and are zero filled on creation. This device
/// is suitable for:
/// - Unit and integration tests
/// - Crash simulations (drop the journal, keep the device, replay)
///
/// Besides the [`SegmentManager`] contract it exposes hooks that let tests
/// control I/O: writes can be held and released one by one (to complete
/// them in any order), failures can be injected, and byte ranges can be
/// zeroed or corrupted to simulate torn writes.
///
/// # Example
///
/// ```rust
/// use seglog_storage::{InMemorySegmentManager, SegmentGeometry, SegmentManager, SegmentId, Paddr};
/// use bytes::Bytes;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let device = InMemorySegmentManager::new(SegmentGeometry::new(4096, 512, 2)).unwrap();
/// let segment = device.open(SegmentId::new(0)).await.unwrap();
/// segment.write(0, Bytes::from(vec![7u8; 512])).await.unwrap();
/// let data = device.read(Paddr::new(SegmentId::new(0), 0), 4).await.unwrap();
/// assert_eq!(&data[..], &[7, 7, 7, 7]);
/// # }
/// ```
#[derive(Debug)]
pub struct InMemorySegmentManager {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    geometry: SegmentGeometry,
    slots: RwLock<Vec<Slot>>,
    hooks: Mutex<Hooks>,
    held_changed: Notify,
    writes_issued: AtomicU64,
}

#[derive(Debug)]
struct Slot {
    data: Vec<u8>,
    state: SlotState,
    write_ptr: u32,
}

#[derive(Debug, Default)]
struct Hooks {
    hold: bool,
    held: Vec<HeldWrite>,
    fail_writes: usize,
    fail_reads: bool,
}

#[derive(Debug)]
struct HeldWrite {
    addr: Paddr,
    len: usize,
    release: oneshot::Sender<()>,
}

impl InMemorySegmentManager {
    /// Creates a zero-filled device with the given geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometry is invalid.
    pub fn new(geometry: SegmentGeometry) -> StorageResult<Self> {
        geometry.validate()?;
        let slots = (0..geometry.num_segments)
            .map(|_| Slot {
                data: vec![0u8; geometry.segment_size as usize],
                state: SlotState::Empty,
                write_ptr: 0,
            })
            .collect();
        Ok(Self {
            shared: Arc::new(Shared {
                geometry,
                slots: RwLock::new(slots),
                hooks: Mutex::new(Hooks::default()),
                held_changed: Notify::new(),
                writes_issued: AtomicU64::new(0),
            }),
        })
    }

    /// Holds every subsequent write until it is released.
    ///
    /// Turning holding off does not release writes already held.
    pub fn hold_writes(&self, hold: bool) {
        self.shared.hooks.lock().hold = hold;
    }

    /// Returns the address and length of every held write, by address.
    #[must_use]
    pub fn held_writes(&self) -> Vec<(Paddr, usize)> {
        let hooks = self.shared.hooks.lock();
        let mut held: Vec<_> = hooks.held.iter().map(|w| (w.addr, w.len)).collect();
        held.sort();
        held
    }

    /// Waits until at least `count` writes are held.
    pub async fn wait_for_held(&self, count: usize) {
        loop {
            let notified = self.shared.held_changed.notified();
            if self.shared.hooks.lock().held.len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Releases the held write starting at `addr`.
    ///
    /// Returns `false` if no write is held at that address.
    pub fn release_write(&self, addr: Paddr) -> bool {
        let mut hooks = self.shared.hooks.lock();
        let Some(index) = hooks.held.iter().position(|w| w.addr == addr) else {
            return false;
        };
        let write = hooks.held.remove(index);
        // The writer may have been dropped; nothing to wake then.
        let _ = write.release.send(());
        true
    }

    /// Releases every held write and returns how many were released.
    pub fn release_all(&self) -> usize {
        let mut hooks = self.shared.hooks.lock();
        let held = std::mem::take(&mut hooks.held);
        let count = held.len();
        for write in held {
            let _ = write.release.send(());
        }
        count
    }

    /// Makes the next `count` writes fail with [`StorageError::Injected`].
    ///
    /// The failure is decided when the write is issued.
    pub fn fail_next_writes(&self, count: usize) {
        self.shared.hooks.lock().fail_writes = count;
    }

    /// Makes every read fail with [`StorageError::Injected`] while set.
    pub fn fail_reads(&self, fail: bool) {
        self.shared.hooks.lock().fail_reads = fail;
    }

    /// Returns the number of segment writes issued so far.
    #[must_use]
    pub fn writes_issued(&self) -> u64 {
        self.shared.writes_issued.load(Ordering::SeqCst)
    }

    /// Overwrites `len` bytes at `addr` with zeroes.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the segment.
    pub fn zero_range(&self, addr: Paddr, len: usize) -> StorageResult<()> {
        self.shared.modify(addr, len, |bytes| bytes.fill(0))
    }

    /// Flips every bit of `len` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the segment.
    pub fn corrupt_range(&self, addr: Paddr, len: usize) -> StorageResult<()> {
        self.shared.modify(addr, len, |bytes| {
            for byte in bytes {
                *byte ^= 0xFF;
            }
        })
    }

    /// Returns a copy of the full contents of a segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is invalid.
    pub fn segment_bytes(&self, id: SegmentId) -> StorageResult<Vec<u8>> {
        let slots = self.shared.slots.read();
        let slot = slots
            .get(id.as_u32() as usize)
            .ok_or(StorageError::InvalidSegment(id))?;
        Ok(slot.data.clone())
    }
}

impl Shared {
    fn modify(&self, addr: Paddr, len: usize, f: impl FnOnce(&mut [u8])) -> StorageResult<()> {
        self.geometry.check_read(addr, len)?;
        let mut slots = self.slots.write();
        let slot = &mut slots[addr.segment.as_u32() as usize];
        let start = addr.offset as usize;
        f(&mut slot.data[start..start + len]);
        Ok(())
    }

    fn check_write(&self, id: SegmentId, offset: u32, len: usize) -> StorageResult<()> {
        self.geometry.check_write(id, offset, len)?;
        if self.slots.read()[id.as_u32() as usize].state != SlotState::Open {
            return Err(StorageError::SegmentNotOpen(id));
        }
        Ok(())
    }
}

/// A segment handed out by [`InMemorySegmentManager::open`].
#[derive(Debug)]
struct InMemorySegment {
    shared: Arc<Shared>,
    id: SegmentId,
}

#[async_trait]
impl Segment for InMemorySegment {
    fn id(&self) -> SegmentId {
        self.id
    }

    fn write_ptr(&self) -> u32 {
        self.shared.slots.read()[self.id.as_u32() as usize].write_ptr
    }

    fn write_capacity(&self) -> u32 {
        self.shared.geometry.segment_size
    }

    async fn write(&self, offset: u32, data: Bytes) -> StorageResult<()> {
        self.shared.check_write(self.id, offset, data.len())?;
        self.shared.writes_issued.fetch_add(1, Ordering::SeqCst);

        let (fail, gate) = {
            let mut hooks = self.shared.hooks.lock();
            let fail = hooks.fail_writes > 0;
            if fail {
                hooks.fail_writes -= 1;
            }
            let gate = if hooks.hold {
                let (tx, rx) = oneshot::channel();
                hooks.held.push(HeldWrite {
                    addr: Paddr::new(self.id, offset),
                    len: data.len(),
                    release: tx,
                });
                Some(rx)
            } else {
                None
            };
            (fail, gate)
        };

        if let Some(release) = gate {
            self.shared.held_changed.notify_waiters();
            // A dropped sender means the device itself went away.
            let _ = release.await;
        }

        if fail {
            return Err(StorageError::Injected(format!(
                "write to {} failed",
                Paddr::new(self.id, offset)
            )));
        }

        let mut slots = self.shared.slots.write();
        let slot = &mut slots[self.id.as_u32() as usize];
        let start = offset as usize;
        slot.data[start..start + data.len()].copy_from_slice(&data);
        slot.write_ptr = slot.write_ptr.max(offset + data.len() as u32);
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        let mut slots = self.shared.slots.write();
        let slot = &mut slots[self.id.as_u32() as usize];
        if slot.state != SlotState::Open {
            return Err(StorageError::SegmentNotOpen(self.id));
        }
        slot.state = SlotState::Closed;
        Ok(())
    }
}

#[async_trait]
impl SegmentManager for InMemorySegmentManager {
    async fn open(&self, id: SegmentId) -> StorageResult<SegmentRef> {
        let mut slots = self.shared.slots.write();
        let slot = slots
            .get_mut(id.as_u32() as usize)
            .ok_or(StorageError::InvalidSegment(id))?;
        if slot.state != SlotState::Empty {
            return Err(StorageError::SegmentInUse(id));
        }
        slot.state = SlotState::Open;
        slot.write_ptr = 0;
        Ok(Arc::new(InMemorySegment {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }

    async fn release(&self, id: SegmentId) -> StorageResult<()> {
        let mut slots = self.shared.slots.write();
        let slot = slots
            .get_mut(id.as_u32() as usize)
            .ok_or(StorageError::InvalidSegment(id))?;
        slot.state = SlotState::Empty;
        slot.write_ptr = 0;
        Ok(())
    }

    async fn read(&self, addr: Paddr, len: usize) -> StorageResult<Bytes> {
        self.shared.geometry.check_read(addr, len)?;
        if self.shared.hooks.lock().fail_reads {
            return Err(StorageError::Injected(format!("read at {addr} failed")));
        }
        let slots = self.shared.slots.read();
        let start = addr.offset as usize;
        let data = &slots[addr.segment.as_u32() as usize].data[start..start + len];
        Ok(Bytes::copy_from_slice(data))
    }

    fn geometry(&self) -> SegmentGeometry {
        self.shared.geometry
    }
}
