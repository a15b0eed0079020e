//! Hotplug-aware access to the physical cartridge.
//!
//! A [`CardTransport`] implementation provides raw per-area reads; the
//! [`GameCard`] facade routes global offsets across the normal and secure
//! areas, caches header/certificate/key-area data across insertion edges,
//! and runs a background watcher that publishes status changes.

pub mod header;

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub use header::{
    CARD_CERTIFICATE_OFFSET, CARD_CERTIFICATE_SIZE, CARD_MEDIA_UNIT_SIZE, CardEncryptedArea,
    CardHeader, CardInitialData, CardKeyArea, media_offset,
};

use crate::error::{Error, StorageError};
use crate::formats::hfs::HashFs;
use crate::version::VersionType1;

/// The two raw storage areas a cartridge presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardArea {
    Normal,
    Secure,
}

/// Raw access to the inserted medium. Implemented by the embedder.
pub trait CardTransport: Send + Sync {
    fn is_inserted(&self) -> bool;
    /// Reads from an area at an area-local offset. Reads may be
    /// unaligned; implementations may fail them, the facade always
    /// issues 0x200-aligned accesses.
    fn read_area(&self, area: CardArea, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;
    /// Fetches the initial-data blob from the card key area. This region
    /// is not reachable through [`CardTransport::read_area`].
    fn read_initial_data(&self, buf: &mut [u8; 0x200]) -> Result<(), StorageError>;
    fn area_size(&self, area: CardArea) -> Result<u64, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardStatus {
    NotInserted,
    /// Inserted, but header/key-area caching failed.
    InsertedInfoNotLoaded,
    Inserted,
}

/// Named hash-FS partitions of the root container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardPartition {
    Update,
    Logo,
    Normal,
    Secure,
    Boot,
}

impl CardPartition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Logo => "logo",
            Self::Normal => "normal",
            Self::Secure => "secure",
            Self::Boot => "boot",
        }
    }
}

/// Edge-triggered status event with condvar-backed waiting.
pub struct StatusEvent {
    state: Mutex<(u64, CardStatus)>,
    condvar: Condvar,
}

impl StatusEvent {
    fn new(status: CardStatus) -> Self {
        Self {
            state: Mutex::new((0, status)),
            condvar: Condvar::new(),
        }
    }

    fn fire(&self, status: CardStatus) {
        let mut state = self.state.lock().unwrap();
        state.0 += 1;
        state.1 = status;
        self.condvar.notify_all();
    }
}

/// Listener over a [`StatusEvent`]. Each listener observes every edge at
/// most once.
pub struct StatusListener {
    event: Arc<StatusEvent>,
    seen: u64,
}

impl StatusListener {
    /// Waits for the next status edge, up to `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<CardStatus> {
        let guard = self.event.state.lock().unwrap();
        let (guard, result) = self
            .event
            .condvar
            .wait_timeout_while(guard, timeout, |state| state.0 == self.seen)
            .unwrap();
        if result.timed_out() {
            return None;
        }
        self.seen = guard.0;
        Some(guard.1)
    }

    /// Non-blocking probe for a pending edge.
    pub fn poll(&mut self) -> Option<CardStatus> {
        let state = self.event.state.lock().unwrap();
        if state.0 != self.seen {
            self.seen = state.0;
            Some(state.1)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct CardInfo {
    header: Option<CardHeader>,
    certificate: Option<[u8; CARD_CERTIFICATE_SIZE]>,
    key_area: CardKeyArea,
    total_size: u64,
    trimmed_size: u64,
    secure_area_start: u64,
}

struct CardShared {
    transport: Arc<dyn CardTransport>,
    state: Mutex<(CardStatus, CardInfo)>,
    status_event: Arc<StatusEvent>,
    listeners: Mutex<HashMap<u64, Box<dyn Fn(CardStatus) + Send>>>,
    next_token: AtomicU64,
}

impl CardShared {
    fn load_card_info(&self) -> Result<CardInfo, Error> {
        let normal_size = self.transport.area_size(CardArea::Normal)?;
        let secure_size = self.transport.area_size(CardArea::Secure)?;
        let total_size = normal_size + secure_size;

        let mut header_block = vec![0u8; CARD_MEDIA_UNIT_SIZE as usize];
        self.transport
            .read_area(CardArea::Normal, 0, &mut header_block)?;
        let header = CardHeader::from_bytes(&header_block)?;
        header.validate_areas(total_size / CARD_MEDIA_UNIT_SIZE)?;

        let mut certificate = [0u8; CARD_CERTIFICATE_SIZE];
        self.transport
            .read_area(CardArea::Normal, CARD_CERTIFICATE_OFFSET, &mut certificate)?;

        // Only the initial data is retrievable; the rest of the key area
        // is presumed zero.
        let mut initial = [0u8; 0x200];
        self.transport.read_initial_data(&mut initial)?;
        let initial_data = CardInitialData::from_bytes(&initial)?;

        let trimmed_size = media_offset(header.valid_data_end) + CARD_MEDIA_UNIT_SIZE;
        let secure_area_start = media_offset(header.secure_area_start);

        tracing::trace!(
            total_size = format_args!("{total_size:#x}"),
            trimmed_size = format_args!("{trimmed_size:#x}"),
            secure_area_start = format_args!("{secure_area_start:#x}"),
            "Gamecard info cached"
        );

        Ok(CardInfo {
            header: Some(header),
            certificate: Some(certificate),
            key_area: CardKeyArea {
                initial_data: Some(initial_data),
            },
            total_size,
            trimmed_size,
            secure_area_start,
        })
    }

    /// Re-probes the insertion state and fires listeners on an edge.
    fn refresh(&self) {
        let inserted = self.transport.is_inserted();
        let mut state = self.state.lock().unwrap();
        let new_status = match (inserted, state.0) {
            (false, CardStatus::NotInserted) => return,
            (true, CardStatus::Inserted) | (true, CardStatus::InsertedInfoNotLoaded) => return,
            (false, _) => {
                state.1 = CardInfo::default();
                CardStatus::NotInserted
            }
            (true, _) => match self.load_card_info() {
                Ok(info) => {
                    state.1 = info;
                    CardStatus::Inserted
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Inserted gamecard could not be loaded");
                    CardStatus::InsertedInfoNotLoaded
                }
            },
        };
        state.0 = new_status;
        drop(state);

        self.status_event.fire(new_status);
        for listener in self.listeners.lock().unwrap().values() {
            listener(new_status);
        }
    }

    /// Serialized, bounds-checked, area-routed read at a global offset.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.0 != CardStatus::Inserted {
            return Err(StorageError::NotInserted.into());
        }

        let len = buf.len() as u64;
        if offset + len > state.1.trimmed_size {
            return Err(StorageError::OutOfRange {
                offset,
                len,
                trimmed: state.1.trimmed_size,
            }
            .into());
        }

        let secure_start = state.1.secure_area_start;
        let result = (|| -> Result<(), StorageError> {
            let mut cursor = 0u64;
            while cursor < len {
                let global = offset + cursor;
                let (area, area_offset, area_remaining) = if global < secure_start {
                    (CardArea::Normal, global, secure_start - global)
                } else {
                    (CardArea::Secure, global - secure_start, u64::MAX)
                };
                let take = (len - cursor).min(area_remaining);
                self.read_area_unaligned(
                    area,
                    area_offset,
                    &mut buf[cursor as usize..(cursor + take) as usize],
                )?;
                cursor += take;
            }
            Ok(())
        })();

        if let Err(e) = result {
            // A removal mid-read transitions the status; the watcher
            // fires the edge on its next tick.
            if !self.transport.is_inserted() {
                state.0 = CardStatus::NotInserted;
                state.1 = CardInfo::default();
                return Err(StorageError::Ejected.into());
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Satisfies unaligned reads through a 0x200-byte scratch window.
    fn read_area_unaligned(
        &self,
        area: CardArea,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let unit = CARD_MEDIA_UNIT_SIZE;
        let mut scratch = [0u8; CARD_MEDIA_UNIT_SIZE as usize];
        let len = buf.len() as u64;
        let mut cursor = 0u64;

        // Leading partial unit.
        let head = offset % unit;
        if head != 0 {
            let aligned = offset - head;
            self.transport.read_area(area, aligned, &mut scratch)?;
            let take = (unit - head).min(len);
            buf[..take as usize]
                .copy_from_slice(&scratch[head as usize..(head + take) as usize]);
            cursor += take;
        }

        // Aligned middle.
        let middle = (len - cursor) / unit * unit;
        if middle > 0 {
            self.transport.read_area(
                area,
                offset + cursor,
                &mut buf[cursor as usize..(cursor + middle) as usize],
            )?;
            cursor += middle;
        }

        // Trailing partial unit.
        if cursor < len {
            self.transport.read_area(area, offset + cursor, &mut scratch)?;
            let take = len - cursor;
            buf[cursor as usize..].copy_from_slice(&scratch[..take as usize]);
        }
        Ok(())
    }
}

/// Hotplug-aware cartridge storage facade.
pub struct GameCard {
    shared: Arc<CardShared>,
    xci_header_key: Option<[u8; 0x10]>,
    stop: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl GameCard {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

    /// Initializes the facade, probes the current insertion state and
    /// spawns the background watcher. The XCI header key, when
    /// available, unlocks the header's encrypted area.
    pub fn new(
        transport: Arc<dyn CardTransport>,
        poll_interval: Duration,
        xci_header_key: Option<[u8; 0x10]>,
    ) -> Self {
        let shared = Arc::new(CardShared {
            transport,
            state: Mutex::new((CardStatus::NotInserted, CardInfo::default())),
            status_event: Arc::new(StatusEvent::new(CardStatus::NotInserted)),
            listeners: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        });

        // Synchronous first probe so callers see a settled status.
        shared.refresh();

        let stop = Arc::new(AtomicBool::new(false));
        let watcher = {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("gamecard-watcher".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(poll_interval);
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        shared.refresh();
                    }
                })
                .expect("spawn gamecard watcher")
        };

        Self {
            shared,
            xci_header_key,
            stop,
            watcher: Some(watcher),
        }
    }

    pub fn status(&self) -> CardStatus {
        self.shared.state.lock().unwrap().0
    }

    /// A listener over status-change edges.
    pub fn status_event(&self) -> StatusListener {
        let event = Arc::clone(&self.shared.status_event);
        let seen = event.state.lock().unwrap().0;
        StatusListener { event, seen }
    }

    /// Registers a closure fired on every status edge. Returns a token
    /// for [`GameCard::unsubscribe`].
    pub fn subscribe(&self, callback: impl Fn(CardStatus) + Send + 'static) -> u64 {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .lock()
            .unwrap()
            .insert(token, Box::new(callback));
        token
    }

    pub fn unsubscribe(&self, token: u64) {
        self.shared.listeners.lock().unwrap().remove(&token);
    }

    /// Raw read at a global card offset. Area routing, alignment and
    /// serialization are handled internally.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        self.shared.read_at(offset, buf)
    }

    pub fn header(&self) -> Result<CardHeader, Error> {
        self.shared
            .state
            .lock()
            .unwrap()
            .1
            .header
            .clone()
            .ok_or_else(|| StorageError::NotInserted.into())
    }

    pub fn certificate(&self) -> Result<[u8; CARD_CERTIFICATE_SIZE], Error> {
        self.shared
            .state
            .lock()
            .unwrap()
            .1
            .certificate
            .ok_or_else(|| StorageError::NotInserted.into())
    }

    pub fn key_area(&self) -> Result<CardKeyArea, Error> {
        let state = self.shared.state.lock().unwrap();
        if state.0 != CardStatus::Inserted {
            return Err(StorageError::NotInserted.into());
        }
        Ok(state.1.key_area.clone())
    }

    pub fn total_size(&self) -> Result<u64, Error> {
        let state = self.shared.state.lock().unwrap();
        if state.0 != CardStatus::Inserted {
            return Err(StorageError::NotInserted.into());
        }
        Ok(state.1.total_size)
    }

    pub fn trimmed_size(&self) -> Result<u64, Error> {
        let state = self.shared.state.lock().unwrap();
        if state.0 != CardStatus::Inserted {
            return Err(StorageError::NotInserted.into());
        }
        Ok(state.1.trimmed_size)
    }

    pub fn rom_capacity(&self) -> Result<u64, Error> {
        let header = self.header()?;
        header
            .rom_capacity()
            .ok_or_else(|| Error::Parse(format!("unknown rom size byte {:#x}", header.rom_size)))
    }

    /// Bundled firmware update version from the header's encrypted area.
    pub fn bundled_fw_version(&self) -> Result<VersionType1, Error> {
        let key = self.xci_header_key.ok_or_else(|| {
            crate::error::KeyVaultError::MissingKey("xci_header_key".to_string())
        })?;
        let area = self.header()?.decrypt_encrypted_area(&key)?;
        Ok(area.cup_version)
    }

    /// A cloneable reader over the routed storage.
    pub fn reader(&self) -> GameCardReader {
        GameCardReader {
            shared: Arc::clone(&self.shared),
            position: 0,
        }
    }

    /// Parses the root hash-FS and descends into the named partition.
    pub fn partition_context(&self, kind: CardPartition) -> Result<HashFs<GameCardReader>, Error> {
        let header = self.header()?;
        let mut root = HashFs::from_reader(self.reader(), header.partition_fs_header_address)?;

        let index = root
            .entries()
            .position(|e| e.name == kind.name())
            .ok_or_else(|| Error::Parse(format!("no {} partition on card", kind.name())))?;
        root.verify_entry(index)?;
        let offset = root
            .entries()
            .nth(index)
            .map(|e| e.offset)
            .expect("entry index just resolved");

        HashFs::from_reader(self.reader(), offset)
    }

    /// One-shot lookup of an entry inside a named partition. The
    /// returned offset is absolute within the card image.
    pub fn entry_by_name(&self, kind: CardPartition, name: &str) -> Result<(u64, u64), Error> {
        let partition = self.partition_context(kind)?;
        let entry = partition
            .entry_by_name(name)
            .ok_or_else(|| Error::Parse(format!("no entry {name} in {} partition", kind.name())))?;
        Ok((entry.offset, entry.size))
    }
}

impl Drop for GameCard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}

/// Cloneable `Read + Seek` view over the routed card storage.
#[derive(Clone)]
pub struct GameCardReader {
    shared: Arc<CardShared>,
    position: u64,
}

impl Read for GameCardReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let trimmed = {
            let state = self.shared.state.lock().unwrap();
            state.1.trimmed_size
        };
        if self.position >= trimmed {
            return Ok(0);
        }
        let take = buf.len().min((trimmed - self.position) as usize);
        self.shared
            .read_at(self.position, &mut buf[..take])
            .map_err(|e| match e {
                // Surfaced as Interrupted so the extraction driver can
                // retry transient faults and only those.
                Error::Storage(StorageError::TransientIo(msg)) => {
                    io::Error::new(io::ErrorKind::Interrupted, msg)
                }
                other => io::Error::other(other.to_string()),
            })?;
        self.position += take as u64;
        Ok(take)
    }
}

impl Seek for GameCardReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => {
                let trimmed = self.shared.state.lock().unwrap().1.trimmed_size;
                trimmed as i64 + offset
            }
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot seek before start of card storage",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::header::test_card_header;
    use super::*;
    use binrw::BinWrite;
    use std::sync::atomic::AtomicUsize;

    /// In-memory transport: a normal area, a secure area, an insertion
    /// flag and an optional fail-after-N-reads fuse.
    struct MockTransport {
        normal: Mutex<Vec<u8>>,
        secure: Vec<u8>,
        inserted: AtomicBool,
        reads_until_eject: AtomicUsize,
    }

    impl MockTransport {
        fn new(normal: Vec<u8>, secure: Vec<u8>) -> Self {
            Self {
                normal: Mutex::new(normal),
                secure,
                inserted: AtomicBool::new(true),
                reads_until_eject: AtomicUsize::new(usize::MAX),
            }
        }
    }

    impl CardTransport for MockTransport {
        fn is_inserted(&self) -> bool {
            self.inserted.load(Ordering::SeqCst)
        }

        fn read_area(
            &self,
            area: CardArea,
            offset: u64,
            buf: &mut [u8],
        ) -> Result<(), StorageError> {
            if !self.is_inserted() {
                return Err(StorageError::Ejected);
            }
            let remaining = self.reads_until_eject.load(Ordering::SeqCst);
            if remaining == 0 {
                self.inserted.store(false, Ordering::SeqCst);
                return Err(StorageError::TransientIo("link lost".to_string()));
            }
            if remaining != usize::MAX {
                self.reads_until_eject.store(remaining - 1, Ordering::SeqCst);
            }

            let normal = self.normal.lock().unwrap();
            let source: &[u8] = match area {
                CardArea::Normal => &normal,
                CardArea::Secure => &self.secure,
            };
            let start = offset as usize;
            let end = start + buf.len();
            if end > source.len() {
                return Err(StorageError::TransientIo("read past area".to_string()));
            }
            buf.copy_from_slice(&source[start..end]);
            Ok(())
        }

        fn read_initial_data(&self, buf: &mut [u8; 0x200]) -> Result<(), StorageError> {
            buf.fill(0);
            Ok(())
        }

        fn area_size(&self, area: CardArea) -> Result<u64, StorageError> {
            Ok(match area {
                CardArea::Normal => self.normal.lock().unwrap().len() as u64,
                CardArea::Secure => self.secure.len() as u64,
            })
        }
    }

    /// 1 MiB normal (0x800 units) + 1 MiB secure, fully valid.
    fn test_transport() -> Arc<MockTransport> {
        let mut normal = vec![0xAAu8; 0x100000];
        let secure = vec![0xBBu8; 0x100000];

        let header = test_card_header(0x800, 0xFFF, 0x1000, 0xF000);
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        header.write_le(&mut cursor).unwrap();
        normal[..0x200].copy_from_slice(&cursor.into_inner());

        // Root HFS0 at 0xF000 with a "secure" partition holding an empty
        // nested HFS0.
        let inner = crate::formats::hfs::build_hfs0(&[]);
        let root = crate::formats::hfs::build_hfs0(&[("secure", inner.as_slice())]);
        normal[0xF000..0xF000 + root.len()].copy_from_slice(&root);

        Arc::new(MockTransport::new(normal, secure))
    }

    fn test_card(transport: Arc<MockTransport>) -> GameCard {
        GameCard::new(transport, Duration::from_millis(5), None)
    }

    #[test]
    fn caches_header_on_insertion() {
        let card = test_card(test_transport());
        assert_eq!(card.status(), CardStatus::Inserted);
        assert_eq!(card.header().unwrap().secure_area_start, 0x800);
        assert_eq!(card.total_size().unwrap(), 0x200000);
        assert_eq!(card.trimmed_size().unwrap(), 0x200000);
        assert_eq!(card.rom_capacity().unwrap(), 2 * 0x4000_0000);
        assert_eq!(card.certificate().unwrap(), [0xAAu8; 0x200]);
    }

    #[test]
    fn read_crosses_area_boundary() {
        let card = test_card(test_transport());

        // 0x100 bytes before the secure boundary plus 0x100 after it.
        let mut buf = [0u8; 0x200];
        card.read(&mut buf, 0xFFF00).unwrap();
        assert!(buf[..0x100].iter().all(|&b| b == 0xAA));
        assert!(buf[0x100..].iter().all(|&b| b == 0xBB));

        // Matches two standalone reads of the halves.
        let mut normal_half = [0u8; 0x100];
        card.read(&mut normal_half, 0xFFF00).unwrap();
        let mut secure_half = [0u8; 0x100];
        card.read(&mut secure_half, 0x100000).unwrap();
        assert_eq!(&buf[..0x100], &normal_half);
        assert_eq!(&buf[0x100..], &secure_half);
    }

    #[test]
    fn unaligned_read_within_normal_area() {
        let card = test_card(test_transport());
        let mut buf = [0u8; 0x37];
        card.read(&mut buf, 0x1234 * 0x10 + 3).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn read_past_trimmed_size_is_out_of_range() {
        let card = test_card(test_transport());
        let mut buf = [0u8; 0x400];
        assert!(matches!(
            card.read(&mut buf, 0x200000 - 0x200),
            Err(Error::Storage(StorageError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn ejection_mid_read() {
        let transport = test_transport();
        let card = test_card(Arc::clone(&transport));

        transport.reads_until_eject.store(0, Ordering::SeqCst);
        let mut buf = [0u8; 0x200];
        assert!(matches!(
            card.read(&mut buf, 0x1000),
            Err(Error::Storage(StorageError::Ejected))
        ));
        assert_eq!(card.status(), CardStatus::NotInserted);
    }

    #[test]
    fn watcher_fires_edges() {
        let transport = test_transport();
        transport.inserted.store(false, Ordering::SeqCst);
        let card = test_card(Arc::clone(&transport));
        assert_eq!(card.status(), CardStatus::NotInserted);

        let mut listener = card.status_event();
        transport.inserted.store(true, Ordering::SeqCst);
        let status = listener.wait_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, CardStatus::Inserted);

        transport.inserted.store(false, Ordering::SeqCst);
        let status = listener.wait_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, CardStatus::NotInserted);
    }

    #[test]
    fn subscriber_callbacks_fire() {
        let transport = test_transport();
        transport.inserted.store(false, Ordering::SeqCst);
        let card = test_card(Arc::clone(&transport));

        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        card.subscribe(move |status| sink.lock().unwrap().push(status));

        transport.inserted.store(true, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fired.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fired.lock().unwrap().first(), Some(&CardStatus::Inserted));
    }

    #[test]
    fn partition_context_and_entry_lookup() {
        let card = test_card(test_transport());
        let secure = card.partition_context(CardPartition::Secure).unwrap();
        assert_eq!(secure.entry_count(), 0);

        // Root-level entry resolution through the one-shot helper fails
        // for names that do not exist.
        assert!(card.entry_by_name(CardPartition::Secure, "missing").is_err());
    }

    #[test]
    fn not_inserted_errors() {
        let transport = test_transport();
        transport.inserted.store(false, Ordering::SeqCst);
        let card = test_card(transport);

        let mut buf = [0u8; 4];
        assert!(matches!(
            card.read(&mut buf, 0),
            Err(Error::Storage(StorageError::NotInserted))
        ));
        assert!(card.header().is_err());
        assert!(card.total_size().is_err());
    }
}
