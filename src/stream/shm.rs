//! Event stream over a shared-memory ring buffer.
//!
//! The host creates one region per session and writes fixed-size slots;
//! the client maps the same file and polls for new slots. Single producer,
//! single consumer.
//!
//! # Layout
//!
//! ```text
//! Header (64 bytes)
//!   @0   magic: u32        "BTRS"
//!   @4   version: u32
//!   @8   write_seq: u64    producer position (atomic)
//!   @16  read_seq: u64     consumer position (atomic)
//!   @24  flags: u32        CONNECTED | SHUTDOWN | OVERFLOW (atomic)
//!   @28  slot_size: u32
//!   @32  slot_count: u32   power of two
//! Slots (slot_count × slot_size)
//!   @0   len: u32
//!   @4   record_type: u8
//!   @5   flags: u8         VALID | TRUNCATED
//!   @6   reserved: u16
//!   @8   sequence: i64
//!   @16  session_id: [u8; 36]
//!   @56  payload
//! ```
//!
//! All integers are little-endian. The producer fills a slot before it
//! publishes `write_seq` with release ordering; the consumer loads
//! `write_seq` with acquire ordering before reading slots.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use memmap2::MmapMut;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    agent_record_type, DaemonEvent, DaemonEventType, EventStream, EventSubscription,
    SequenceGuard, StreamError,
};
use crate::constants::{
    EVENT_CHANNEL_CAPACITY, SHM_OPEN_MAX_ATTEMPTS, SHM_OPEN_RETRY_INTERVAL, SHM_POLL_INTERVAL,
};

// =============================================================================
// Layout
// =============================================================================

/// "BTRS"
pub const REGION_MAGIC: u32 = 0x4254_5253;

/// Bumped on incompatible layout changes.
pub const REGION_VERSION: u32 = 1;

/// Region header size.
pub const REGION_HEADER_SIZE: usize = 64;

/// Per-slot header size.
pub const SLOT_HEADER_SIZE: usize = 56;

/// Default bytes per slot.
pub const DEFAULT_SLOT_SIZE: u32 = 4096;

/// Default number of slots.
pub const DEFAULT_SLOT_COUNT: u32 = 256;

const SESSION_ID_LEN: usize = 36;
const MIN_SLOT_PAYLOAD: usize = 64;

mod offset {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const WRITE_SEQ: usize = 8;
    pub const READ_SEQ: usize = 16;
    pub const FLAGS: usize = 24;
    pub const SLOT_SIZE: usize = 28;
    pub const SLOT_COUNT: usize = 32;

    pub const SLOT_LEN: usize = 0;
    pub const SLOT_TYPE: usize = 4;
    pub const SLOT_FLAGS: usize = 5;
    pub const SLOT_SEQUENCE: usize = 8;
    pub const SLOT_SESSION_ID: usize = 16;
}

/// Region header flags.
pub mod region_flags {
    /// Producer attached.
    pub const CONNECTED: u32 = 1 << 0;
    /// Producer finished; consumers should drain and stop.
    pub const SHUTDOWN: u32 = 1 << 1;
    /// At least one record was dropped because the ring was full.
    pub const OVERFLOW: u32 = 1 << 2;
}

/// Slot flags.
pub mod slot_flags {
    /// Slot holds a record.
    pub const VALID: u8 = 1 << 0;
    /// Payload was cut to fit the slot.
    pub const TRUNCATED: u8 = 1 << 1;
}

/// Kind of record stored in a slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Raw agent NDJSON record.
    AgentRecord = 1,
    /// Terminal output chunk.
    TerminalOutput = 2,
    /// Terminal exit code.
    TerminalFinished = 3,
    /// Partial assistant output.
    StreamingChunk = 4,
    /// Keepalive.
    Ping = 5,
}

impl RecordType {
    /// Decode a slot's type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::AgentRecord),
            2 => Some(Self::TerminalOutput),
            3 => Some(Self::TerminalFinished),
            4 => Some(Self::StreamingChunk),
            5 => Some(Self::Ping),
            _ => None,
        }
    }
}

/// Path of the region for `session_id` under `dir`.
pub fn region_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("botster_stream_{session_id}"))
}

/// `/dev/shm` where it exists, the system temp directory otherwise.
pub fn default_region_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn region_size(slot_size: u32, slot_count: u32) -> usize {
    REGION_HEADER_SIZE + slot_size as usize * slot_count as usize
}

// =============================================================================
// Mapped region
// =============================================================================

/// A mapped region. All access goes through `base`, which stays valid for
/// as long as `_map` is alive.
struct Region {
    _map: MmapMut,
    base: *mut u8,
    len: usize,
    slot_size: u32,
    slot_count: u32,
}

// SAFETY: `base` points into `_map`, which is owned by this struct and moves
// with it. Cross-process synchronization goes through the header atomics.
unsafe impl Send for Region {}

impl Region {
    fn new(mut map: MmapMut) -> Self {
        let base = map.as_mut_ptr();
        let len = map.len();
        Self {
            _map: map,
            base,
            len,
            slot_size: 0,
            slot_count: 0,
        }
    }

    fn atomic_u32(&self, at: usize) -> &AtomicU32 {
        debug_assert!(at + 4 <= REGION_HEADER_SIZE);
        // SAFETY: the map is page-aligned and at least REGION_HEADER_SIZE
        // long; every header u32 offset is 4-aligned.
        unsafe { &*self.base.add(at).cast::<AtomicU32>() }
    }

    fn atomic_u64(&self, at: usize) -> &AtomicU64 {
        debug_assert!(at + 8 <= REGION_HEADER_SIZE);
        // SAFETY: as above, with 8-aligned offsets.
        unsafe { &*self.base.add(at).cast::<AtomicU64>() }
    }

    fn magic(&self) -> &AtomicU32 {
        self.atomic_u32(offset::MAGIC)
    }

    fn write_seq(&self) -> &AtomicU64 {
        self.atomic_u64(offset::WRITE_SEQ)
    }

    fn read_seq(&self) -> &AtomicU64 {
        self.atomic_u64(offset::READ_SEQ)
    }

    fn flags(&self) -> &AtomicU32 {
        self.atomic_u32(offset::FLAGS)
    }

    fn has_flag(&self, flag: u32) -> bool {
        self.flags().load(Ordering::Acquire) & flag != 0
    }

    fn put(&self, at: usize, bytes: &[u8]) {
        assert!(at + bytes.len() <= self.len, "write past end of region");
        // SAFETY: bounds checked above; the single producer owns the slot
        // until write_seq is published.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(at), bytes.len()) }
    }

    fn get(&self, at: usize, len: usize) -> Vec<u8> {
        assert!(at + len <= self.len, "read past end of region");
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked above; the slot was published before
        // write_seq advanced past it.
        unsafe { ptr::copy_nonoverlapping(self.base.add(at), out.as_mut_ptr(), len) }
        out
    }

    fn get_array<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.get(at, N));
        out
    }

    fn get_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.get_array(at))
    }

    fn slot_offset(&self, seq: u64) -> usize {
        let index = (seq & u64::from(self.slot_count - 1)) as usize;
        REGION_HEADER_SIZE + index * self.slot_size as usize
    }

    fn max_payload(&self) -> usize {
        self.slot_size as usize - SLOT_HEADER_SIZE
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Producer side of a session's region.
///
/// Creating a writer truncates any stale region at the same path. Dropping
/// it marks the region shut down but leaves the file for late readers;
/// call [`remove`](Self::remove) to delete it.
pub struct RegionWriter {
    region: Region,
    path: PathBuf,
    session_id: String,
}

impl std::fmt::Debug for RegionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionWriter")
            .field("path", &self.path)
            .field("session_id", &self.session_id)
            .field("slot_size", &self.region.slot_size)
            .field("slot_count", &self.region.slot_count)
            .finish()
    }
}

impl RegionWriter {
    /// Create the region for `session_id` under `dir` with the default layout.
    pub fn create(dir: &Path, session_id: &str) -> Result<Self, StreamError> {
        Self::with_layout(dir, session_id, DEFAULT_SLOT_SIZE, DEFAULT_SLOT_COUNT)
    }

    /// Create the region with an explicit layout.
    pub fn with_layout(
        dir: &Path,
        session_id: &str,
        slot_size: u32,
        slot_count: u32,
    ) -> Result<Self, StreamError> {
        if session_id.is_empty()
            || session_id.len() > SESSION_ID_LEN
            || session_id.contains(['/', '\\'])
        {
            return Err(StreamError::InvalidRegion(format!(
                "unusable session id: {session_id:?}"
            )));
        }
        if !slot_count.is_power_of_two() {
            return Err(StreamError::InvalidRegion(format!(
                "slot count {slot_count} is not a power of two"
            )));
        }
        if (slot_size as usize) < SLOT_HEADER_SIZE + MIN_SLOT_PAYLOAD {
            return Err(StreamError::InvalidRegion(format!(
                "slot size {slot_size} is too small"
            )));
        }

        fs::create_dir_all(dir)?;
        let path = region_path(dir, session_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(region_size(slot_size, slot_count) as u64)?;

        // SAFETY: the file was just sized; concurrent access by the consumer
        // is limited to the atomics and published slots.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut region = Region::new(map);
        region.put(offset::VERSION, &REGION_VERSION.to_le_bytes());
        region.put(offset::SLOT_SIZE, &slot_size.to_le_bytes());
        region.put(offset::SLOT_COUNT, &slot_count.to_le_bytes());
        region.write_seq().store(0, Ordering::Relaxed);
        region.read_seq().store(0, Ordering::Relaxed);
        region
            .flags()
            .store(region_flags::CONNECTED, Ordering::Relaxed);
        // Magic last: readers treat a zero magic as "not ready yet".
        region.magic().store(REGION_MAGIC, Ordering::Release);
        region.slot_size = slot_size;
        region.slot_count = slot_count;

        log::info!(
            "[Region] Created {} ({slot_count} x {slot_size} bytes)",
            path.display()
        );
        Ok(Self {
            region,
            path,
            session_id: session_id.to_string(),
        })
    }

    /// Region file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Session this region belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Records written but not yet consumed.
    pub fn pending(&self) -> u64 {
        let write = self.region.write_seq().load(Ordering::Relaxed);
        let read = self.region.read_seq().load(Ordering::Acquire);
        write.saturating_sub(read)
    }

    /// Whether any record has been dropped for lack of space.
    pub fn has_overflowed(&self) -> bool {
        self.region.has_flag(region_flags::OVERFLOW)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.region.has_flag(region_flags::SHUTDOWN)
    }

    /// Append one record.
    ///
    /// Returns `Ok(false)` and raises the overflow flag if the ring is full.
    /// Payloads larger than a slot are truncated and flagged.
    pub fn write(
        &mut self,
        record_type: RecordType,
        sequence: i64,
        payload: &[u8],
    ) -> Result<bool, StreamError> {
        if self.is_shutdown() {
            return Err(StreamError::Disconnected);
        }

        let region = &self.region;
        let write = region.write_seq().load(Ordering::Relaxed);
        let read = region.read_seq().load(Ordering::Acquire);
        if write.saturating_sub(read) >= u64::from(region.slot_count) {
            region
                .flags()
                .fetch_or(region_flags::OVERFLOW, Ordering::Release);
            log::warn!(
                "[Region] {}: ring full, dropping sequence {sequence}",
                self.session_id
            );
            return Ok(false);
        }

        let max = region.max_payload();
        let (body, mut flags) = if payload.len() > max {
            (&payload[..max], slot_flags::VALID | slot_flags::TRUNCATED)
        } else {
            (payload, slot_flags::VALID)
        };
        if flags & slot_flags::TRUNCATED != 0 {
            log::debug!(
                "[Region] {}: truncated {} byte payload to {max}",
                self.session_id,
                payload.len()
            );
        }

        let mut session = [0u8; SESSION_ID_LEN];
        session[..self.session_id.len()].copy_from_slice(self.session_id.as_bytes());

        let slot = region.slot_offset(write);
        // Flags go in last so a torn slot is never VALID.
        region.put(slot + offset::SLOT_FLAGS, &[0]);
        region.put(slot + offset::SLOT_LEN, &(body.len() as u32).to_le_bytes());
        region.put(slot + offset::SLOT_TYPE, &[record_type as u8]);
        region.put(slot + offset::SLOT_SEQUENCE, &sequence.to_le_bytes());
        region.put(slot + offset::SLOT_SESSION_ID, &session);
        region.put(slot + SLOT_HEADER_SIZE, body);
        region.put(slot + offset::SLOT_FLAGS, std::slice::from_mut(&mut flags));

        region.write_seq().fetch_add(1, Ordering::Release);
        Ok(true)
    }

    /// Append an agent NDJSON record.
    pub fn write_json_event(&mut self, sequence: i64, json: &str) -> Result<bool, StreamError> {
        self.write(RecordType::AgentRecord, sequence, json.as_bytes())
    }

    /// Append a terminal output chunk.
    pub fn write_terminal_output(
        &mut self,
        sequence: i64,
        output: &[u8],
    ) -> Result<bool, StreamError> {
        self.write(RecordType::TerminalOutput, sequence, output)
    }

    /// Append a terminal exit code.
    pub fn write_terminal_finished(
        &mut self,
        sequence: i64,
        exit_code: i32,
    ) -> Result<bool, StreamError> {
        self.write(RecordType::TerminalFinished, sequence, &exit_code.to_le_bytes())
    }

    /// Append a streaming chunk.
    pub fn write_streaming_chunk(
        &mut self,
        sequence: i64,
        content: &str,
    ) -> Result<bool, StreamError> {
        self.write(RecordType::StreamingChunk, sequence, content.as_bytes())
    }

    /// Append a keepalive.
    pub fn write_ping(&mut self, sequence: i64) -> Result<bool, StreamError> {
        self.write(RecordType::Ping, sequence, &[])
    }

    /// Tell consumers to drain and stop. Idempotent.
    pub fn shutdown(&self) {
        let flags = self.region.flags();
        if flags.fetch_or(region_flags::SHUTDOWN, Ordering::Release) & region_flags::SHUTDOWN == 0
        {
            flags.fetch_and(!region_flags::CONNECTED, Ordering::Release);
            log::info!("[Region] {} shut down", self.session_id);
        }
    }

    /// Shut down and delete the region file.
    pub fn remove(self) -> std::io::Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(path)
    }
}

impl Drop for RegionWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Reader
// =============================================================================

/// One slot as read from the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawRecord {
    record_type: u8,
    truncated: bool,
    sequence: i64,
    session_id: String,
    payload: Vec<u8>,
}

struct RegionReader {
    region: Region,
    next: u64,
}

impl RegionReader {
    /// Map the region at `path`. `Ok(None)` while it does not exist or the
    /// producer has not finished initializing it.
    fn try_open(path: &Path) -> Result<Option<Self>, StreamError> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len() as usize;
        if file_len < REGION_HEADER_SIZE {
            return Ok(None);
        }

        // SAFETY: the producer never shrinks the file while mapped.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut region = Region::new(map);
        match region.magic().load(Ordering::Acquire) {
            0 => return Ok(None),
            REGION_MAGIC => {}
            other => {
                return Err(StreamError::InvalidRegion(format!(
                    "bad magic {other:#010x}"
                )))
            }
        }
        let version = region.get_u32(offset::VERSION);
        if version != REGION_VERSION {
            return Err(StreamError::InvalidRegion(format!(
                "unsupported version {version}"
            )));
        }
        let slot_size = region.get_u32(offset::SLOT_SIZE);
        let slot_count = region.get_u32(offset::SLOT_COUNT);
        if !slot_count.is_power_of_two()
            || (slot_size as usize) < SLOT_HEADER_SIZE
            || region_size(slot_size, slot_count) > file_len
        {
            return Err(StreamError::InvalidRegion(format!(
                "inconsistent layout: {slot_count} x {slot_size} in {file_len} bytes"
            )));
        }
        region.slot_size = slot_size;
        region.slot_count = slot_count;

        let next = region.read_seq().load(Ordering::Acquire);
        Ok(Some(Self { region, next }))
    }

    fn is_shutdown(&self) -> bool {
        self.region.has_flag(region_flags::SHUTDOWN)
    }

    /// Move every published slot into `out` and release them to the
    /// producer.
    fn drain(&mut self, out: &mut Vec<RawRecord>) {
        let write = self.region.write_seq().load(Ordering::Acquire);
        if self.next >= write {
            return;
        }
        while self.next < write {
            if let Some(record) = self.read_slot(self.next) {
                out.push(record);
            }
            self.next += 1;
        }
        self.region.read_seq().store(self.next, Ordering::Release);
    }

    fn read_slot(&self, seq: u64) -> Option<RawRecord> {
        let region = &self.region;
        let slot = region.slot_offset(seq);
        let [flags] = region.get_array::<1>(slot + offset::SLOT_FLAGS);
        if flags & slot_flags::VALID == 0 {
            return None;
        }
        let len = (region.get_u32(slot + offset::SLOT_LEN) as usize).min(region.max_payload());
        let [record_type] = region.get_array::<1>(slot + offset::SLOT_TYPE);
        let sequence = i64::from_le_bytes(region.get_array(slot + offset::SLOT_SEQUENCE));
        let raw_session: [u8; SESSION_ID_LEN] = region.get_array(slot + offset::SLOT_SESSION_ID);
        let session_end = raw_session
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SESSION_ID_LEN);

        Some(RawRecord {
            record_type,
            truncated: flags & slot_flags::TRUNCATED != 0,
            sequence,
            session_id: String::from_utf8_lossy(&raw_session[..session_end]).into_owned(),
            payload: region.get(slot + SLOT_HEADER_SIZE, len),
        })
    }
}

/// Convert a slot into a [`DaemonEvent`]. Pings, unknown record types, and
/// agent records of unknown type yield `None`.
fn record_to_event(record: RawRecord, session_id: &str) -> Option<DaemonEvent> {
    let text = || String::from_utf8_lossy(&record.payload).into_owned();
    let mut data = serde_json::Map::new();

    let event_type = match RecordType::from_u8(record.record_type)? {
        RecordType::AgentRecord => {
            let raw = text();
            let event_type = agent_record_type(&raw)?;
            data.insert("raw_json".into(), raw.into());
            event_type
        }
        RecordType::TerminalOutput => {
            data.insert("output".into(), text().into());
            DaemonEventType::TerminalOutput
        }
        RecordType::TerminalFinished => {
            data.insert("exit_code".into(), exit_code(&record.payload).into());
            DaemonEventType::TerminalFinished
        }
        RecordType::StreamingChunk => {
            data.insert("content".into(), text().into());
            DaemonEventType::StreamingChunk
        }
        RecordType::Ping => return None,
    };
    if record.truncated {
        data.insert("truncated".into(), true.into());
    }

    let session_id = if record.session_id.is_empty() {
        session_id.to_string()
    } else {
        record.session_id
    };
    Some(DaemonEvent {
        event_type,
        session_id,
        data,
        sequence: record.sequence,
    })
}

/// Exit code from a finished record: JSON (`3` or `{"exit_code":3}`),
/// else a 4-byte LE integer. `None` if neither.
fn exit_code(payload: &[u8]) -> Option<i64> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
        if let Some(code) = value
            .as_i64()
            .or_else(|| value.get("exit_code").and_then(serde_json::Value::as_i64))
        {
            return Some(code);
        }
    }
    let bytes = <[u8; 4]>::try_from(payload).ok()?;
    Some(i64::from(i32::from_le_bytes(bytes)))
}

// =============================================================================
// Stream
// =============================================================================

/// [`EventStream`] over a session's shared-memory region.
pub struct SharedMemoryEventStream {
    region_dir: PathBuf,
    session_id: String,
    poll_interval: Duration,
    open_retry_interval: Duration,
    open_max_attempts: u32,
    shutdown: CancellationToken,
    subscribed: AtomicBool,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SharedMemoryEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryEventStream")
            .field("region_dir", &self.region_dir)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SharedMemoryEventStream {
    /// Stream for `session_id` from regions under `region_dir`.
    pub fn new(region_dir: PathBuf, session_id: &str) -> Self {
        Self {
            region_dir,
            session_id: session_id.to_string(),
            poll_interval: SHM_POLL_INTERVAL,
            open_retry_interval: SHM_OPEN_RETRY_INTERVAL,
            open_max_attempts: SHM_OPEN_MAX_ATTEMPTS,
            shutdown: CancellationToken::new(),
            subscribed: AtomicBool::new(false),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// How often to check for new slots.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long and how often to wait for the host to create the region.
    pub fn with_open_retry(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.open_retry_interval = interval;
        self.open_max_attempts = max_attempts.max(1);
        self
    }

    async fn open_region(&self, cancel: &CancellationToken) -> Result<RegionReader, StreamError> {
        let path = region_path(&self.region_dir, &self.session_id);
        for attempt in 1..=self.open_max_attempts {
            if let Some(reader) = RegionReader::try_open(&path)? {
                log::info!(
                    "[EventStream] Opened {} after {attempt} attempt(s)",
                    path.display()
                );
                return Ok(reader);
            }
            if attempt == self.open_max_attempts {
                break;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(StreamError::Cancelled),
                () = self.shutdown.cancelled() => return Err(StreamError::Disconnected),
                () = tokio::time::sleep(self.open_retry_interval) => {}
            }
        }
        Err(StreamError::NotFound(path.display().to_string()))
    }
}

#[async_trait]
impl EventStream for SharedMemoryEventStream {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn subscribe(
        &self,
        cancel: &CancellationToken,
    ) -> Result<EventSubscription, StreamError> {
        if self.shutdown.is_cancelled() {
            return Err(StreamError::Disconnected);
        }
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadySubscribed);
        }

        let reader = self.open_region(cancel).await?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(poll_loop(
            reader,
            tx,
            self.shutdown.clone(),
            self.poll_interval,
            self.session_id.clone(),
        ));
        *self.task.lock().await = Some(task);
        Ok(EventSubscription::new(rx))
    }

    async fn disconnect(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
            log::info!("[EventStream] Detached from region for {}", self.session_id);
        }
    }
}

async fn poll_loop(
    mut reader: RegionReader,
    tx: mpsc::Sender<DaemonEvent>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    session_id: String,
) {
    let mut guard = SequenceGuard::default();
    let mut batch = Vec::new();

    loop {
        // Read the flag before draining so nothing written before shutdown
        // is missed.
        let host_done = reader.is_shutdown();
        reader.drain(&mut batch);

        for record in batch.drain(..) {
            let Some(event) = record_to_event(record, &session_id) else {
                continue;
            };
            if !guard.admit(&event) {
                continue;
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return,
                res = tx.send(event) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }

        if host_done {
            log::info!("[EventStream] Host shut down region for {session_id}");
            return;
        }

        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}
