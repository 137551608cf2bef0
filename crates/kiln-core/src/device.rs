//! Reference device runtime: allocations, bounds-checked slices, and streams.
//!
//! The device is host-memory backed but keeps the shape of an accelerator
//! runtime. Allocations are only reachable through `DeviceSlice` and
//! `DeviceSliceMut` handles that were bounds-checked when created, and all
//! kernel work is enqueued on a `Stream` and runs in submission order when
//! the stream is synchronized.

use crate::{Error, Result};
use bytemuck::Pod;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Capability queries answered by the device context.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// Human readable device name.
    pub name: String,
    /// Whether the operation-graph backend API is available.
    pub graph_api: bool,
    /// Whether the implicit precomputed GEMM convolution algorithm is available.
    pub implicit_precomp_gemm: bool,
    /// Whether half-precision kernels are available.
    pub f16: bool,
    /// Total device memory in bytes.
    pub memory_bytes: usize,
    pub max_threads_per_block: usize,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            name: "reference".to_string(),
            graph_api: false,
            implicit_precomp_gemm: true,
            f16: false,
            memory_bytes: 1 << 30,
            max_threads_per_block: 1024,
        }
    }
}

/// Device context handed to candidate builders and used for allocations.
pub struct Device {
    capabilities: DeviceCapabilities,
    allocated: Arc<AtomicUsize>,
    next_allocation: AtomicU64,
    next_stream: AtomicUsize,
}

impl Device {
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            allocated: Arc::new(AtomicUsize::new(0)),
            next_allocation: AtomicU64::new(0),
            next_stream: AtomicUsize::new(0),
        }
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Bytes currently held by live allocations.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Allocate `size` bytes of zero-initialized device memory.
    pub fn allocate(&self, size: usize, label: &str) -> Result<Arc<DeviceAllocation>> {
        let capacity = self.capabilities.memory_bytes;
        // An overflowing total is out of memory too
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                in_use.checked_add(size).filter(|&total| total <= capacity)
            })
            .map_err(|in_use| {
                Error::Device(format!(
                    "out of device memory allocating {size} bytes for '{label}' \
                     ({in_use} of {capacity} bytes in use)"
                ))
            })?;

        let id = self.next_allocation.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, size, label, "device allocation");

        Ok(Arc::new(DeviceAllocation {
            id,
            label: label.to_string(),
            size,
            bytes: RwLock::new(vec![0u8; size]),
            frozen: AtomicBool::new(false),
            usage: Arc::clone(&self.allocated),
        }))
    }

    /// Create a new in-order command stream.
    pub fn create_stream(&self) -> Stream {
        Stream::new(self.next_stream.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new(DeviceCapabilities::default())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("capabilities", &self.capabilities)
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}

/// One raw device allocation.
///
/// A frozen allocation rejects every write, including writes through
/// previously created mutable slices.
pub struct DeviceAllocation {
    id: u64,
    label: String,
    size: usize,
    bytes: RwLock<Vec<u8>>,
    frozen: AtomicBool,
    usage: Arc<AtomicUsize>,
}

impl DeviceAllocation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Make the allocation read-only for the rest of its lifetime.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Read-only view of `len` bytes at `offset`.
    pub fn slice(self: &Arc<Self>, offset: usize, len: usize) -> Result<DeviceSlice> {
        self.check_range(offset, len)?;
        Ok(DeviceSlice {
            allocation: Arc::clone(self),
            offset,
            len,
        })
    }

    /// Writable view of `len` bytes at `offset`. Fails on frozen allocations.
    pub fn slice_mut(self: &Arc<Self>, offset: usize, len: usize) -> Result<DeviceSliceMut> {
        if self.is_frozen() {
            return Err(Error::Device(format!(
                "allocation '{}' is read-only",
                self.label
            )));
        }
        self.check_range(offset, len)?;
        Ok(DeviceSliceMut {
            allocation: Arc::clone(self),
            offset,
            len,
        })
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::Device(format!(
                "range {offset}+{len} is outside allocation '{}' of {} bytes",
                self.label, self.size
            ))),
        }
    }

    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let bytes = self
            .bytes
            .read()
            .map_err(|_| Error::Device(format!("allocation '{}' is poisoned", self.label)))?;
        Ok(bytes[offset..offset + len].to_vec())
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if self.is_frozen() {
            return Err(Error::Device(format!(
                "write to read-only allocation '{}'",
                self.label
            )));
        }
        let mut bytes = self
            .bytes
            .write()
            .map_err(|_| Error::Device(format!("allocation '{}' is poisoned", self.label)))?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.usage.fetch_sub(self.size, Ordering::AcqRel);
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("size", &self.size)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

fn read_pod<T: Pod>(bytes: Vec<u8>) -> Result<Vec<T>> {
    let elem = std::mem::size_of::<T>();
    if bytes.len() % elem != 0 {
        return Err(Error::Device(format!(
            "slice of {} bytes is not a whole number of {elem}-byte elements",
            bytes.len()
        )));
    }
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}

/// Read-only, bounds-checked view into a device allocation.
#[derive(Debug, Clone)]
pub struct DeviceSlice {
    allocation: Arc<DeviceAllocation>,
    offset: usize,
    len: usize,
}

impl DeviceSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte offset of this view within its allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn allocation(&self) -> &Arc<DeviceAllocation> {
        &self.allocation
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.allocation.read(self.offset, self.len)
    }

    /// Read the whole view as elements of `T`.
    pub fn read<T: Pod>(&self) -> Result<Vec<T>> {
        read_pod(self.read_bytes()?)
    }

    /// Narrow the view to `len` bytes at relative `offset`.
    pub fn sub_slice(&self, offset: usize, len: usize) -> Result<DeviceSlice> {
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(Error::Device(format!(
                "sub-slice {offset}+{len} exceeds view of {} bytes",
                self.len
            )));
        }
        self.allocation.slice(self.offset + offset, len)
    }
}

/// Writable, bounds-checked view into a device allocation.
#[derive(Debug, Clone)]
pub struct DeviceSliceMut {
    allocation: Arc<DeviceAllocation>,
    offset: usize,
    len: usize,
}

impl DeviceSliceMut {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn allocation(&self) -> &Arc<DeviceAllocation> {
        &self.allocation
    }

    /// Read-only alias of the same range.
    pub fn as_slice(&self) -> DeviceSlice {
        DeviceSlice {
            allocation: Arc::clone(&self.allocation),
            offset: self.offset,
            len: self.len,
        }
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.allocation.read(self.offset, self.len)
    }

    pub fn read<T: Pod>(&self) -> Result<Vec<T>> {
        read_pod(self.read_bytes()?)
    }

    /// Write `data` at the start of the view. `data` may be shorter than the view.
    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.len {
            return Err(Error::Device(format!(
                "write of {} bytes exceeds view of {} bytes",
                data.len(),
                self.len
            )));
        }
        self.allocation.write(self.offset, data)
    }

    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(bytemuck::cast_slice(data))
    }

    /// Narrow the view to `len` bytes at relative `offset`.
    pub fn sub_slice(&self, offset: usize, len: usize) -> Result<DeviceSliceMut> {
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(Error::Device(format!(
                "sub-slice {offset}+{len} exceeds view of {} bytes",
                self.len
            )));
        }
        self.allocation.slice_mut(self.offset + offset, len)
    }
}

type Command = Box<dyn FnOnce() -> Result<()> + Send>;

/// Counters describing the work a stream has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Commands enqueued (kernels and uploads).
    pub submitted: u64,
    /// Commands that ran to completion.
    pub completed: u64,
    /// Commands that failed or were discarded after a failure.
    pub aborted: u64,
    /// Host-to-device uploads enqueued.
    pub uploads: u64,
    /// Bytes carried by those uploads.
    pub bytes_uploaded: u64,
}

#[derive(Default)]
struct StreamCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    uploads: AtomicU64,
    bytes_uploaded: AtomicU64,
}

/// An in-order asynchronous command stream.
///
/// `enqueue` only records work; commands run in submission order when
/// `synchronize` is called. The first failing command aborts every command
/// queued behind it.
pub struct Stream {
    id: usize,
    queue: Mutex<VecDeque<(String, Command)>>,
    counters: StreamCounters,
}

impl Stream {
    fn new(id: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            counters: StreamCounters::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Submit a kernel. Returns without running it.
    pub fn enqueue<F>(&self, label: impl Into<String>, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| Error::Device(format!("stream {} is poisoned", self.id)))?;
        queue.push_back((label.into(), Box::new(work)));
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Submit an asynchronous host-to-device copy into `dst`.
    pub fn upload(&self, dst: &DeviceSliceMut, data: Vec<u8>) -> Result<()> {
        if data.len() > dst.len() {
            return Err(Error::Device(format!(
                "upload of {} bytes exceeds destination of {} bytes",
                data.len(),
                dst.len()
            )));
        }
        let bytes = data.len() as u64;
        let dst = dst.clone();
        self.enqueue("upload", move || dst.write_bytes(&data))?;
        self.counters.uploads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_uploaded
            .fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Number of commands waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Drop every queued command without running it. Returns how many were dropped.
    pub fn discard(&self) -> usize {
        let dropped = match self.queue.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue).len(),
            Err(_) => 0,
        };
        self.counters
            .aborted
            .fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    /// Run every queued command in order and wait for completion.
    pub fn synchronize(&self) -> Result<()> {
        let commands = {
            let mut queue = self
                .queue
                .lock()
                .map_err(|_| Error::Device(format!("stream {} is poisoned", self.id)))?;
            std::mem::take(&mut *queue)
        };

        let total = commands.len() as u64;
        for (index, (label, command)) in commands.into_iter().enumerate() {
            if let Err(e) = command() {
                let aborted = total - index as u64;
                self.counters.aborted.fetch_add(aborted, Ordering::Relaxed);
                return Err(Error::Device(format!(
                    "stream {} command '{label}' failed: {e}",
                    self.id
                )));
            }
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            uploads: self.counters.uploads.load(Ordering::Relaxed),
            bytes_uploaded: self.counters.bytes_uploaded.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_allocation_accounting() {
        let device = Device::default();
        let a = device.allocate(1024, "a").unwrap();
        assert_eq!(device.allocated_bytes(), 1024);
        drop(a);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_out_of_memory() {
        let device = Device::new(DeviceCapabilities {
            memory_bytes: 100,
            ..Default::default()
        });
        let _a = device.allocate(64, "a").unwrap();
        let err = device.allocate(64, "b").unwrap_err();
        assert!(err.to_string().contains("out of device memory"));
        assert_eq!(device.allocated_bytes(), 64);
    }

    #[test]
    fn test_huge_allocation_is_out_of_memory() {
        let device = Device::new(DeviceCapabilities {
            memory_bytes: usize::MAX,
            ..Default::default()
        });
        let _a = device.allocate(16, "a").unwrap();
        let err = device.allocate(usize::MAX, "huge").unwrap_err();
        assert!(matches!(err, Error::Device(_)));
        assert!(err.to_string().contains("out of device memory"));
        assert_eq!(device.allocated_bytes(), 16);

        // Accounting is intact after the rejected request
        let _b = device.allocate(32, "b").unwrap();
        assert_eq!(device.allocated_bytes(), 48);
    }

    #[test]
    fn test_slice_bounds_checked() {
        let device = Device::default();
        let alloc = device.allocate(16, "buf").unwrap();
        assert!(alloc.slice(8, 8).is_ok());
        assert!(alloc.slice(8, 9).is_err());
        assert!(alloc.slice(usize::MAX, 2).is_err());

        let view = alloc.slice(4, 8).unwrap();
        assert!(view.sub_slice(4, 4).is_ok());
        assert!(view.sub_slice(4, 5).is_err());
    }

    #[test]
    fn test_write_and_read_f32() {
        let device = Device::default();
        let alloc = device.allocate(16, "buf").unwrap();
        let dst = alloc.slice_mut(4, 12).unwrap();
        dst.write(&[1.0f32, 2.0, 3.0]).unwrap();
        assert_eq!(alloc.slice(4, 12).unwrap().read::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
        assert!(dst.write(&[0.0f32; 4]).is_err());
    }

    #[test]
    fn test_frozen_allocation_rejects_writes() {
        let device = Device::default();
        let alloc = device.allocate(8, "weights").unwrap();
        let early = alloc.slice_mut(0, 8).unwrap();
        alloc.freeze();

        assert!(alloc.slice_mut(0, 8).is_err());
        assert!(early.write_bytes(&[1, 2, 3]).is_err());
        assert_eq!(alloc.slice(0, 8).unwrap().read_bytes().unwrap(), vec![0u8; 8]);
    }

    #[test]
    fn test_stream_runs_in_submission_order() {
        let device = Device::default();
        let stream = device.create_stream();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&log);
            stream
                .enqueue(format!("k{i}"), move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }

        // Nothing runs before synchronization
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(stream.pending(), 3);

        stream.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(stream.stats().completed, 3);
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_stream_failure_aborts_rest() {
        let device = Device::default();
        let stream = device.create_stream();
        let ran = Arc::new(AtomicBool::new(false));

        stream.enqueue("ok", || Ok(())).unwrap();
        stream
            .enqueue("bad", || Err(Error::Device("kernel fault".to_string())))
            .unwrap();
        let flag = Arc::clone(&ran);
        stream
            .enqueue("after", move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let err = stream.synchronize().unwrap_err();
        assert!(err.to_string().contains("'bad'"));
        assert!(!ran.load(Ordering::SeqCst));

        let stats = stream.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.aborted, 2);

        // The stream is usable again after a failed pass
        stream.enqueue("again", || Ok(())).unwrap();
        stream.synchronize().unwrap();
    }

    #[test]
    fn test_discard_drops_pending() {
        let device = Device::default();
        let stream = device.create_stream();
        stream
            .enqueue("never", || Err(Error::Device("should not run".to_string())))
            .unwrap();
        assert_eq!(stream.discard(), 1);
        stream.synchronize().unwrap();
        assert_eq!(stream.stats().aborted, 1);
    }

    #[test]
    fn test_upload_counts_bytes() {
        let device = Device::default();
        let alloc = device.allocate(8, "ws").unwrap();
        let stream = device.create_stream();
        let dst = alloc.slice_mut(0, 8).unwrap();

        stream.upload(&dst, vec![7u8; 6]).unwrap();
        assert_eq!(stream.stats().uploads, 1);
        assert_eq!(stream.stats().bytes_uploaded, 6);
        assert!(stream.upload(&dst, vec![0u8; 9]).is_err());

        stream.synchronize().unwrap();
        assert_eq!(&dst.read_bytes().unwrap()[..6], &[7u8; 6]);
    }
}
