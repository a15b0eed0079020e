//! Extraction driver: turns an installed or cartridge title into an
//! installable content package (PFS0/NSP).
//!
//! The driver enforces the extraction order by construction: key vault →
//! source container → metadata archive → content archives → optional
//! ticket → section emission. A cancel token is checked at the top of
//! every emission loop iteration; transient storage faults are retried
//! with a bounded back-off, everything else aborts the title and the
//! sink discards its partial output.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::{Duration, Instant};

use crate::crypto::Crc32;
use crate::crypto::sha256;
use crate::error::{Error, StorageError};
use crate::formats::cnmt::{Cnmt, ContentType};
use crate::formats::hfs::HashFs;
use crate::formats::nca::program::PatchedNcaReader;
use crate::formats::nca::{Nca, NcaContentType};
use crate::formats::pfs::Pfs0Builder;
use crate::formats::ticket::{ResolvedTitleKey, TicketEnumerator, resolve_title_key};
use crate::io::ReadSeek;
use crate::keys::KeyVault;
use sha2::{Digest, Sha256};

/// Fixed string-table slot widths of the output package, terminator
/// included.
pub const NCA_FILENAME_SLOT: usize = 0x25;
pub const CNMT_NCA_FILENAME_SLOT: usize = 0x2A;
pub const TIK_FILENAME_SLOT: usize = 0x25;
pub const CERT_FILENAME_SLOT: usize = 0x26;
pub const PROGRAMINFO_XML_FILENAME_SLOT: usize = 0x31;
pub const NACP_XML_FILENAME_SLOT: usize = 0x2A;
pub const LEGALINFO_XML_FILENAME_SLOT: usize = 0x2F;

const TRANSIENT_RETRY_LIMIT: u32 = 3;
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(50);
const COPY_CHUNK: usize = 0x80000;

/// Host callback surface for one extraction.
pub trait DumpObserver {
    fn progress(&self, _current: u64, _total: u64, _bytes_per_sec: u64) {}
    fn should_cancel(&self) -> bool {
        false
    }
}

/// Observer that never cancels and swallows progress.
pub struct SilentObserver;
impl DumpObserver for SilentObserver {}

/// A single output artifact. Partial output must disappear on discard.
pub trait OutputSink: Write {
    fn finalize(self: Box<Self>) -> Result<(), Error>;
    fn discard(self: Box<Self>) -> Result<(), Error>;
}

/// Creates output artifacts by name.
pub trait OutputTarget {
    fn open_output(&self, name: &str) -> Result<Box<dyn OutputSink + '_>, Error>;
}

/// Outcome of a finished package dump.
#[derive(Debug)]
pub struct DumpReport {
    pub output_name: String,
    pub bytes_written: u64,
    pub crc32: u32,
    /// Content ids (hex) in emission order.
    pub contents: Vec<String>,
}

enum PackagePayload {
    /// Streamed out of the source container.
    Reader { reader: Box<dyn ReadSeek>, size: u64 },
    Bytes(Vec<u8>),
}

impl PackagePayload {
    fn size(&self) -> u64 {
        match self {
            PackagePayload::Reader { size, .. } => *size,
            PackagePayload::Bytes(bytes) => bytes.len() as u64,
        }
    }
}

struct PackageEntry {
    name: String,
    slot: usize,
    payload: PackagePayload,
}

/// Extraction driver over an already-located hash-FS partition (the
/// cartridge `secure` partition, or any container exposing `*.nca`
/// entries by name).
pub struct ExtractionDriver<'a> {
    vault: &'a KeyVault,
    tickets: Option<&'a dyn TicketEnumerator>,
    observer: &'a dyn DumpObserver,
    with_xml: bool,
}

impl<'a> ExtractionDriver<'a> {
    pub fn new(vault: &'a KeyVault, observer: &'a dyn DumpObserver) -> Self {
        Self {
            vault,
            tickets: None,
            observer,
            with_xml: false,
        }
    }

    /// Enables personalized/common ticket resolution.
    pub fn with_tickets(mut self, tickets: &'a dyn TicketEnumerator) -> Self {
        self.tickets = Some(tickets);
        self
    }

    /// Emits the thin XML companion descriptors.
    pub fn with_xml(mut self) -> Self {
        self.with_xml = true;
        self
    }

    /// Opens an archive, resolving its titlekey through the installed
    /// tickets when it is rights-id bound.
    fn open_nca<R: Read + Seek + Clone>(
        &self,
        reader: R,
    ) -> Result<(Nca<R>, Option<ResolvedTitleKey>), Error> {
        let probe = Nca::from_reader(reader.clone(), self.vault, None)?;
        if !probe.header.has_rights_id() {
            return Ok((probe, None));
        }

        let tickets = self.tickets.ok_or_else(|| {
            crate::error::TicketError::NotInstalled(hex::encode(probe.header.rights_id))
        })?;
        let resolved = resolve_title_key(
            &probe.header.rights_id,
            probe.header.key_generation(),
            tickets,
            self.vault,
        )?;
        let key = resolved.dec_title_key;
        let nca = Nca::from_reader(reader, self.vault, Some(key))?;
        Ok((nca, Some(resolved)))
    }

    /// Dumps the title described by the named metadata archive into an
    /// installable package.
    pub fn dump_title<R: Read + Seek + Clone + 'static>(
        &self,
        partition: &HashFs<R>,
        meta_entry_name: &str,
        target: &dyn OutputTarget,
        output_name: &str,
    ) -> Result<DumpReport, Error> {
        // Metadata archive first; it drives iteration over the rest.
        let meta_reader = partition.open(meta_entry_name)?;
        let (mut meta_nca, meta_rights) = self.open_nca(meta_reader)?;
        let mut cnmt = meta_nca.extract_cnmt()?;

        tracing::info!(
            title_id = %cnmt.title_id_hex(),
            version = cnmt.header.version,
            contents = cnmt.content_records.len(),
            "Dumping title"
        );

        let mut entries: Vec<PackageEntry> = Vec::new();
        let mut contents_hex = Vec::new();
        let mut rights: Option<ResolvedTitleKey> = meta_rights;

        // Content records ordered by type, then id offset.
        let mut records = cnmt.content_records.clone();
        records.sort_by_key(|r| (r.content_type, r.id_offset));

        for record in &records {
            if self.observer.should_cancel() {
                return Err(Error::Cancelled);
            }
            if record.content_type == ContentType::Meta {
                continue;
            }

            let source_name = format!("{}.nca", record.nca_id_hex());
            let reader = partition.open(&source_name)?;
            let (mut nca, nca_rights) = self.open_nca(reader)?;
            if rights.is_none() {
                rights = nca_rights;
            }

            let (payload, final_hash) = if nca.header.content_type()? == NcaContentType::Program {
                // Re-sign the program archive and stream the patched
                // image; its content id changes with its hash.
                let mods = nca.rewrite_program(self.vault)?;
                let size = nca.header.nca_size;
                drop(nca);

                let base = partition.open(&source_name)?;
                let mut patched = PatchedNcaReader::new(base, mods.patches.clone(), size);
                let digest = self.hash_reader(&mut patched, size)?;
                patched.seek(SeekFrom::Start(0))?;

                (
                    PackagePayload::Reader {
                        reader: Box::new(patched),
                        size,
                    },
                    digest,
                )
            } else {
                let size = nca.header.nca_size;
                drop(nca);
                let mut reader = partition.open(&source_name)?;
                let digest = self.hash_reader(&mut reader, size)?;
                reader.seek(SeekFrom::Start(0))?;
                (
                    PackagePayload::Reader {
                        reader: Box::new(reader),
                        size,
                    },
                    digest,
                )
            };

            cnmt.update_content_record(
                record.content_type,
                record.id_offset,
                &final_hash,
                payload.size(),
            )?;
            let id_hex = hex::encode(&final_hash[..0x10]);
            contents_hex.push(id_hex.clone());

            entries.push(PackageEntry {
                name: format!("{id_hex}.nca"),
                slot: NCA_FILENAME_SLOT,
                payload,
            });

            if self.with_xml {
                entries.extend(self.xml_companions(&id_hex, record.content_type, &cnmt));
            }
        }

        // The metadata archive is rebuilt around the updated records and
        // renamed after its fresh hash.
        let cnmt_image = meta_nca.rebuild_cnmt_nca(self.vault, &cnmt)?;
        let cnmt_id_hex = hex::encode(&sha256(&cnmt_image)[..0x10]);
        contents_hex.push(cnmt_id_hex.clone());
        entries.push(PackageEntry {
            name: format!("{cnmt_id_hex}.cnmt.nca"),
            slot: CNMT_NCA_FILENAME_SLOT,
            payload: PackagePayload::Bytes(cnmt_image),
        });

        // Ticket + certificate chain ride along when the title is
        // rights-id bound.
        if let (Some(resolved), Some(tickets)) = (&rights, self.tickets) {
            let rights_hex = resolved.ticket.rights_id_hex();
            entries.push(PackageEntry {
                name: format!("{rights_hex}.tik"),
                slot: TIK_FILENAME_SLOT,
                payload: PackagePayload::Bytes(resolved.ticket.to_tik_bytes()?),
            });
            entries.push(PackageEntry {
                name: format!("{rights_hex}.cert"),
                slot: CERT_FILENAME_SLOT,
                payload: PackagePayload::Bytes(tickets.certificate_chain(resolved.kind)?),
            });
        }

        self.emit_package(entries, target, output_name, contents_hex)
    }

    /// Streams the package: PFS0 header, then payloads in declaration
    /// order, with cancel checks, transient retry and a rolling CRC.
    fn emit_package(
        &self,
        mut entries: Vec<PackageEntry>,
        target: &dyn OutputTarget,
        output_name: &str,
        contents: Vec<String>,
    ) -> Result<DumpReport, Error> {
        let mut builder = Pfs0Builder::new();
        for entry in &entries {
            builder.add_entry(&entry.name, entry.payload.size(), Some(entry.slot))?;
        }
        let total = builder.image_size();

        let mut sink = target.open_output(output_name)?;
        let result = (|| -> Result<(u64, u32), Error> {
            let mut crc = Crc32::new();
            let mut written = 0u64;
            let started = Instant::now();

            let mut header = Vec::new();
            builder.write_header(&mut header)?;
            sink.write_all(&header)?;
            crc.update(&header);
            written += header.len() as u64;

            for entry in &mut entries {
                tracing::debug!(name = %entry.name, size = entry.payload.size(), "Emitting entry");
                match &mut entry.payload {
                    PackagePayload::Bytes(bytes) => {
                        if self.observer.should_cancel() {
                            return Err(Error::Cancelled);
                        }
                        sink.write_all(bytes)?;
                        crc.update(bytes);
                        written += bytes.len() as u64;
                    }
                    PackagePayload::Reader { reader, size } => {
                        written += self.copy_stream(
                            reader.as_mut(),
                            *size,
                            sink.as_mut(),
                            &mut crc,
                            written,
                            total,
                            started,
                        )?;
                    }
                }
                self.report_progress(written, total, started);
            }

            Ok((written, crc.finalize()))
        })();

        match result {
            Ok((bytes_written, crc32)) => {
                sink.finalize()?;
                Ok(DumpReport {
                    output_name: output_name.to_string(),
                    bytes_written,
                    crc32,
                    contents,
                })
            }
            Err(e) => {
                let _ = sink.discard();
                Err(e)
            }
        }
    }

    /// Copies a payload stream chunk-wise. Interrupted reads are the
    /// transport's transient-fault signal and are retried with back-off;
    /// anything else aborts.
    #[allow(clippy::too_many_arguments)]
    fn copy_stream<Rd: Read + ?Sized, W: Write + ?Sized>(
        &self,
        reader: &mut Rd,
        size: u64,
        sink: &mut W,
        crc: &mut Crc32,
        base_written: u64,
        total: u64,
        started: Instant,
    ) -> Result<u64, Error> {
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;

        while copied < size {
            if self.observer.should_cancel() {
                return Err(Error::Cancelled);
            }

            let want = buf.len().min((size - copied) as usize);
            let mut attempt = 0;
            let got = loop {
                match reader.read(&mut buf[..want]) {
                    Ok(0) => {
                        return Err(Error::Parse(format!(
                            "source ended early: {copied:#x} of {size:#x} bytes"
                        )));
                    }
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        attempt += 1;
                        if attempt > TRANSIENT_RETRY_LIMIT {
                            return Err(StorageError::TransientIo(e.to_string()).into());
                        }
                        tracing::warn!(attempt, error = %e, "Transient read fault, retrying");
                        std::thread::sleep(TRANSIENT_BACKOFF * attempt);
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            sink.write_all(&buf[..got])?;
            crc.update(&buf[..got]);
            copied += got as u64;
            self.report_progress(base_written + copied, total, started);
        }

        Ok(copied)
    }

    fn report_progress(&self, current: u64, total: u64, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            (current as f64 / elapsed) as u64
        } else {
            0
        };
        self.observer.progress(current, total, speed);
    }

    /// SHA-256 over a whole stream, with the same retry policy as the
    /// emitter.
    fn hash_reader(&self, reader: &mut dyn Read, size: u64) -> Result<[u8; 0x20], Error> {
        struct HashSink<'a>(&'a mut Sha256);
        impl Write for HashSink<'_> {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.update(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut hasher = Sha256::new();
        let mut crc = Crc32::new();
        self.copy_stream(
            reader,
            size,
            &mut HashSink(&mut hasher),
            &mut crc,
            0,
            size,
            Instant::now(),
        )?;
        Ok(hasher.finalize().into())
    }

    /// Thin textual descriptors accompanying a content entry.
    fn xml_companions(
        &self,
        id_hex: &str,
        content_type: ContentType,
        cnmt: &Cnmt,
    ) -> Vec<PackageEntry> {
        let descriptor = |kind: &str| {
            format!(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
                 <{kind}>\n  <TitleId>0x{}</TitleId>\n  <Version>{}</Version>\n</{kind}>\n",
                cnmt.title_id_hex().to_lowercase(),
                cnmt.header.version,
            )
        };

        match content_type {
            ContentType::Program => vec![PackageEntry {
                name: format!("{id_hex}.programinfo.xml"),
                slot: PROGRAMINFO_XML_FILENAME_SLOT,
                payload: PackagePayload::Bytes(descriptor("ProgramInfo").into_bytes()),
            }],
            ContentType::Control => vec![PackageEntry {
                name: format!("{id_hex}.nacp.xml"),
                slot: NACP_XML_FILENAME_SLOT,
                payload: PackagePayload::Bytes(descriptor("Application").into_bytes()),
            }],
            ContentType::LegalInformation => vec![PackageEntry {
                name: format!("{id_hex}.legalinfo.xml"),
                slot: LEGALINFO_XML_FILENAME_SLOT,
                payload: PackagePayload::Bytes(descriptor("LegalInformation").into_bytes()),
            }],
            _ => Vec::new(),
        }
    }
}

/// In-memory output target. Useful for tests and for callers that
/// post-process the package themselves.
pub struct VecOutputTarget {
    outputs: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl VecOutputTarget {
    pub fn new() -> Self {
        Self {
            outputs: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn take(&self, name: &str) -> Option<Vec<u8>> {
        self.outputs.lock().unwrap().remove(name)
    }
}

impl Default for VecOutputTarget {
    fn default() -> Self {
        Self::new()
    }
}

struct VecSink<'a> {
    target: &'a VecOutputTarget,
    name: String,
    buffer: Vec<u8>,
}

impl Write for VecSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl OutputSink for VecSink<'_> {
    fn finalize(self: Box<Self>) -> Result<(), Error> {
        self.target
            .outputs
            .lock()
            .unwrap()
            .insert(self.name.clone(), self.buffer);
        Ok(())
    }

    fn discard(self: Box<Self>) -> Result<(), Error> {
        // Nothing was published yet; dropping the buffer is the whole
        // cleanup.
        Ok(())
    }
}

impl OutputTarget for VecOutputTarget {
    fn open_output(&self, name: &str) -> Result<Box<dyn OutputSink + '_>, Error> {
        Ok(Box::new(VecSink {
            target: self,
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }
}
