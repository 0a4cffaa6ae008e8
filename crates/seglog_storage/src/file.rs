//! File-backed segment device for persistent storage.

use crate::device::{
    Paddr, Segment, SegmentGeometry, SegmentId, SegmentManager, SegmentRef, SlotState,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SUPERBLOCK_MAGIC: [u8; 4] = *b"SGLD";
const SUPERBLOCK_VERSION: u16 = 1;
const SUPERBLOCK_LEN: usize = 24;

/// A segment device stored in a single file.
///
/// The first block of the file holds a superblock describing the geometry;
/// segment `n` starts at byte `block_size + n * segment_size`.
///
/// # Durability
///
/// - Writes are pushed to the OS as soon as they are issued
/// - With [`set_sync_on_write`](Self::set_sync_on_write) each write also
///   calls `File::sync_data()` before completing
///
/// # Thread Safety
///
/// File access is serialized by an internal lock and performed on the
/// blocking thread pool, so segments can be written from any task.
///
/// # Example
///
/// ```no_run
/// use seglog_storage::{FileSegmentManager, SegmentGeometry};
/// use std::path::Path;
///
/// let geometry = SegmentGeometry::new(1 << 20, 4096, 16);
/// let device = FileSegmentManager::create(Path::new("journal.dev"), geometry).unwrap();
/// device.set_sync_on_write(true);
/// ```
#[derive(Debug)]
pub struct FileSegmentManager {
    shared: Arc<FileShared>,
}

#[derive(Debug)]
struct FileShared {
    path: PathBuf,
    geometry: SegmentGeometry,
    file: Mutex<File>,
    slots: Mutex<Vec<FileSlot>>,
    sync_on_write: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct FileSlot {
    state: SlotState,
    write_ptr: u32,
}

impl FileSegmentManager {
    /// Creates a new device file, replacing any existing file at `path`.
    ///
    /// Parent directories are created if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometry is invalid or the file cannot be
    /// created.
    pub fn create(path: &Path, geometry: SegmentGeometry) -> StorageResult<Self> {
        geometry.validate()?;
        if (geometry.block_size as usize) < SUPERBLOCK_LEN {
            return Err(StorageError::InvalidGeometry(format!(
                "block size {} cannot hold the superblock",
                geometry.block_size
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(device_len(&geometry))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_superblock(&geometry))?;
        file.sync_all()?;

        tracing::debug!(
            path = %path.display(),
            segment_size = geometry.segment_size,
            block_size = geometry.block_size,
            num_segments = geometry.num_segments,
            "created segment device"
        );
        Ok(Self::from_parts(path, geometry, file))
    }

    /// Mounts an existing device file.
    ///
    /// All segments start out empty; the journal decides which ones hold
    /// live data by reading their headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, the superblock is
    /// invalid, or the file is shorter than its geometry requires.
    pub fn mount(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut raw = [0u8; SUPERBLOCK_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut raw)?;
        let geometry = decode_superblock(&raw)?;

        let len = file.metadata()?.len();
        if len < device_len(&geometry) {
            return Err(StorageError::Corrupted(format!(
                "device file is {len} bytes, geometry needs {}",
                device_len(&geometry)
            )));
        }

        tracing::debug!(path = %path.display(), ?geometry, "opened segment device");
        Ok(Self::from_parts(path, geometry, file))
    }

    fn from_parts(path: &Path, geometry: SegmentGeometry, file: File) -> Self {
        let slots = vec![
            FileSlot {
                state: SlotState::Empty,
                write_ptr: 0,
            };
            geometry.num_segments as usize
        ];
        Self {
            shared: Arc::new(FileShared {
                path: path.to_path_buf(),
                geometry,
                file: Mutex::new(file),
                slots: Mutex::new(slots),
                sync_on_write: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Sets whether each write is synced to disk before it completes.
    pub fn set_sync_on_write(&self, sync: bool) {
        self.shared.sync_on_write.store(sync, Ordering::SeqCst);
    }

    /// Syncs all written data to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> StorageResult<()> {
        self.shared.file.lock().sync_all()?;
        Ok(())
    }
}

impl FileShared {
    fn file_offset(&self, addr: Paddr) -> u64 {
        u64::from(self.geometry.block_size)
            + u64::from(addr.segment.as_u32()) * u64::from(self.geometry.segment_size)
            + u64::from(addr.offset)
    }

    fn slot(&self, id: SegmentId) -> StorageResult<FileSlot> {
        self.slots
            .lock()
            .get(id.as_u32() as usize)
            .copied()
            .ok_or(StorageError::InvalidSegment(id))
    }

    fn write_at(&self, addr: Paddr, data: &[u8]) -> StorageResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.file_offset(addr)))?;
        file.write_all(data)?;
        if self.sync_on_write.load(Ordering::SeqCst) {
            file.sync_data()?;
        }
        Ok(())
    }

    fn read_at(&self, addr: Paddr, len: usize) -> StorageResult<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.file_offset(addr)))?;
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

async fn run_blocking<T, F>(shared: Arc<FileShared>, f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce(&FileShared) -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&shared))
        .await
        .map_err(|e| StorageError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn device_len(geometry: &SegmentGeometry) -> u64 {
    u64::from(geometry.block_size)
        + u64::from(geometry.num_segments) * u64::from(geometry.segment_size)
}

fn encode_superblock(geometry: &SegmentGeometry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(geometry.block_size as usize);
    buf.extend_from_slice(&SUPERBLOCK_MAGIC);
    buf.extend_from_slice(&SUPERBLOCK_VERSION.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&geometry.segment_size.to_le_bytes());
    buf.extend_from_slice(&geometry.block_size.to_le_bytes());
    buf.extend_from_slice(&geometry.num_segments.to_le_bytes());
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.resize(geometry.block_size as usize, 0);
    buf
}

fn decode_superblock(raw: &[u8; SUPERBLOCK_LEN]) -> StorageResult<SegmentGeometry> {
    if raw[0..4] != SUPERBLOCK_MAGIC {
        return Err(StorageError::Corrupted("bad superblock magic".to_string()));
    }
    let read_u32 = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);

    let stored_crc = read_u32(20);
    if crc32fast::hash(&raw[..20]) != stored_crc {
        return Err(StorageError::Corrupted(
            "superblock checksum mismatch".to_string(),
        ));
    }
    let version = u16::from_le_bytes([raw[4], raw[5]]);
    if version != SUPERBLOCK_VERSION {
        return Err(StorageError::Corrupted(format!(
            "unsupported device version {version}"
        )));
    }

    let geometry = SegmentGeometry::new(read_u32(8), read_u32(12), read_u32(16));
    geometry.validate()?;
    Ok(geometry)
}

/// A segment handed out by a [`FileSegmentManager`].
#[derive(Debug)]
struct FileSegment {
    shared: Arc<FileShared>,
    id: SegmentId,
}

#[async_trait]
impl Segment for FileSegment {
    fn id(&self) -> SegmentId {
        self.id
    }

    fn write_ptr(&self) -> u32 {
        self.shared.slot(self.id).map_or(0, |slot| slot.write_ptr)
    }

    fn write_capacity(&self) -> u32 {
        self.shared.geometry.segment_size
    }

    async fn write(&self, offset: u32, data: Bytes) -> StorageResult<()> {
        self.shared.geometry.check_write(self.id, offset, data.len())?;
        if self.shared.slot(self.id)?.state != SlotState::Open {
            return Err(StorageError::SegmentNotOpen(self.id));
        }

        let addr = Paddr::new(self.id, offset);
        let len = data.len() as u32;
        run_blocking(Arc::clone(&self.shared), move |shared| {
            shared.write_at(addr, &data)
        })
        .await?;

        let mut slots = self.shared.slots.lock();
        let slot = &mut slots[self.id.as_u32() as usize];
        slot.write_ptr = slot.write_ptr.max(offset + len);
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        let mut slots = self.shared.slots.lock();
        let slot = &mut slots[self.id.as_u32() as usize];
        if slot.state != SlotState::Open {
            return Err(StorageError::SegmentNotOpen(self.id));
        }
        slot.state = SlotState::Closed;
        Ok(())
    }
}

#[async_trait]
impl SegmentManager for FileSegmentManager {
    async fn open(&self, id: SegmentId) -> StorageResult<SegmentRef> {
        let mut slots = self.shared.slots.lock();
        let slot = slots
            .get_mut(id.as_u32() as usize)
            .ok_or(StorageError::InvalidSegment(id))?;
        if slot.state != SlotState::Empty {
            return Err(StorageError::SegmentInUse(id));
        }
        slot.state = SlotState::Open;
        slot.write_ptr = 0;
        Ok(Arc::new(FileSegment {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }

    async fn release(&self, id: SegmentId) -> StorageResult<()> {
        let mut slots = self.shared.slots.lock();
        let slot = slots
            .get_mut(id.as_u32() as usize)
            .ok_or(StorageError::InvalidSegment(id))?;
        slot.state = SlotState::Empty;
        slot.write_ptr = 0;
        Ok(())
    }

    async fn read(&self, addr: Paddr, len: usize) -> StorageResult<Bytes> {
        self.shared.geometry.check_read(addr, len)?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let data = run_blocking(Arc::clone(&self.shared), move |shared| {
            shared.read_at(addr, len)
        })
        .await?;
        Ok(Bytes::from(data))
    }

    fn geometry(&self) -> SegmentGeometry {
        self.shared.geometry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn geometry() -> SegmentGeometry {
        SegmentGeometry::new(4096, 512, 4)
    }

    #[test]
    fn file_create_sets_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");

        let device = FileSegmentManager::create(&path, geometry()).unwrap();
        assert_eq!(device.path(), path);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            512 + 4 * 4096
        );
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("dev.bin");

        FileSegmentManager::create(&path, geometry()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn file_reopen_reads_geometry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");

        FileSegmentManager::create(&path, geometry()).unwrap();
        let device = FileSegmentManager::mount(&path).unwrap();
        assert_eq!(device.geometry(), geometry());
    }

    #[test]
    fn file_open_rejects_bad_superblock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");
        FileSegmentManager::create(&path, geometry()).unwrap();

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(8)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let result = FileSegmentManager::mount(&path);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn file_open_rejects_truncated_device() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");
        FileSegmentManager::create(&path, geometry()).unwrap();

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(2048).unwrap();
        drop(file);

        let result = FileSegmentManager::mount(&path);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn file_open_missing_fails() {
        let dir = tempdir().unwrap();
        let result = FileSegmentManager::mount(&dir.path().join("absent.bin"));
        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[tokio::test]
    async fn file_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");
        let device = FileSegmentManager::create(&path, geometry()).unwrap();

        let segment = device.open(SegmentId::new(2)).await.unwrap();
        segment
            .write(1024, Bytes::from(vec![0x5A; 512]))
            .await
            .unwrap();
        assert_eq!(segment.write_ptr(), 1536);

        let data = device
            .read(Paddr::new(SegmentId::new(2), 1024), 512)
            .await
            .unwrap();
        assert!(data.iter().all(|b| *b == 0x5A));

        // Neighbouring segments are untouched.
        let data = device
            .read(Paddr::new(SegmentId::new(1), 1024), 512)
            .await
            .unwrap();
        assert!(data.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");

        {
            let device = FileSegmentManager::create(&path, geometry()).unwrap();
            device.set_sync_on_write(true);
            let segment = device.open(SegmentId::new(0)).await.unwrap();
            segment.write(0, Bytes::from(vec![9; 512])).await.unwrap();
            device.sync().unwrap();
        }

        {
            let device = FileSegmentManager::mount(&path).unwrap();
            let data = device
                .read(Paddr::new(SegmentId::new(0), 0), 512)
                .await
                .unwrap();
            assert!(data.iter().all(|b| *b == 9));
        }
    }

    #[tokio::test]
    async fn file_rejects_misaligned_write() {
        let dir = tempdir().unwrap();
        let device = FileSegmentManager::create(&dir.path().join("dev.bin"), geometry()).unwrap();
        let segment = device.open(SegmentId::new(0)).await.unwrap();

        let result = segment.write(10, Bytes::from(vec![0; 512])).await;
        assert!(matches!(result, Err(StorageError::Misaligned { .. })));
    }

    #[tokio::test]
    async fn file_segment_lifecycle() {
        let dir = tempdir().unwrap();
        let device = FileSegmentManager::create(&dir.path().join("dev.bin"), geometry()).unwrap();

        let segment = device.open(SegmentId::new(1)).await.unwrap();
        assert!(matches!(
            device.open(SegmentId::new(1)).await,
            Err(StorageError::SegmentInUse(_))
        ));

        segment.close().await.unwrap();
        assert!(matches!(
            segment.write(0, Bytes::from(vec![0; 512])).await,
            Err(StorageError::SegmentNotOpen(_))
        ));

        device.release(SegmentId::new(1)).await.unwrap();
        assert!(device.open(SegmentId::new(1)).await.is_ok());
    }

    #[tokio::test]
    async fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let device = FileSegmentManager::create(&dir.path().join("dev.bin"), geometry()).unwrap();

        let result = device.read(Paddr::new(SegmentId::new(3), 4000), 512).await;
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }
}
