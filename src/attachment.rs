//! Attachment content store: streams bytes into a blob while hashing and enforcing a size ceiling
use crate::error::{NotaryError, NotaryResult};
use crate::store::Store;
use crate::types::{ProcessId, TimeStamp};
use crate::utils::{self, sanitize_filename};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Bytes peeked for content sniffing.
pub const SNIFF_LEN: usize = 512;
const CHUNK_LEN: usize = 8 * 1024;
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
pub struct Attachment {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub process_id: ProcessId,
    #[n(2)]
    pub substep_id: String,
    #[n(3)]
    pub filename: String,
    #[n(4)]
    pub content_type: String,
    #[n(5)]
    pub size: u64,
    #[n(6)]
    pub sha256: String,
    #[n(7)]
    pub uploaded_at: TimeStamp<Utc>,
}

/// The object that stands in for a file inside a substep payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub attachment_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub sha256: String,
}

/// One uploaded file part.
pub struct Upload<R> {
    pub filename: String,
    pub content_type: Option<String>,
    pub reader: R,
}

pub trait BlobSink: Write + Send {
    fn commit(self: Box<Self>) -> NotaryResult<()>;
    fn discard(self: Box<Self>) -> NotaryResult<()>;
}

/// Raw bytes of attachments, addressed by attachment id.
pub trait BlobStore: Send + Sync {
    fn create(&self, id: &str) -> NotaryResult<Box<dyn BlobSink>>;
    fn open(&self, id: &str) -> NotaryResult<Box<dyn Read + Send>>;
    fn delete(&self, id: &str) -> NotaryResult<()>;
    fn exists(&self, id: &str) -> bool;
}

impl Attachment {
    pub fn to_ref(&self) -> AttachmentRef {
        AttachmentRef {
            attachment_id: self.id.clone(),
            filename: sanitize_filename(&self.filename),
            content_type: self.content_type.clone(),
            size: self.size,
            sha256: self.sha256.clone(),
        }
    }

    /// Copy with the filename sanitized again for display/export.
    pub fn for_display(&self) -> Attachment {
        Attachment {
            filename: sanitize_filename(&self.filename),
            ..self.clone()
        }
    }
}

impl AttachmentRef {
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("attachment_id".into(), Value::String(self.attachment_id.clone()));
        map.insert("filename".into(), Value::String(self.filename.clone()));
        map.insert("content_type".into(), Value::String(self.content_type.clone()));
        map.insert("size".into(), Value::from(self.size));
        map.insert("sha256".into(), Value::String(self.sha256.clone()));
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            attachment_id: obj.get("attachment_id")?.as_str()?.to_string(),
            filename: obj.get("filename")?.as_str()?.to_string(),
            content_type: obj.get("content_type")?.as_str()?.to_string(),
            size: obj.get("size")?.as_u64()?,
            sha256: obj.get("sha256")?.as_str()?.to_string(),
        })
    }
}

/// Every attachment reference inside a value, depth first.
pub fn collect_refs(value: &Value) -> Vec<AttachmentRef> {
    let mut out = Vec::new();
    visit_refs(value, &mut out);
    out
}

fn visit_refs(value: &Value, out: &mut Vec<AttachmentRef>) {
    if let Some(r) = AttachmentRef::from_value(value) {
        out.push(r);
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|v| visit_refs(v, out)),
        Value::Object(map) => map.values().for_each(|v| visit_refs(v, out)),
        _ => {}
    }
}

/// Copies `reader` into `writer`, hashing every byte. Fails before writing the chunk that
/// would take the total past `max_bytes`.
pub fn copy_with_limit<R, W>(reader: &mut R, writer: &mut W, max_bytes: u64) -> NotaryResult<(u64, String)>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    let mut buf = [0u8; CHUNK_LEN];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(NotaryError::store(e)),
        };
        if total + n as u64 > max_bytes {
            return Err(NotaryError::AttachmentTooLarge { max_bytes });
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).map_err(NotaryError::store)?;
        total += n as u64;
    }
    writer.flush().map_err(NotaryError::store)?;

    Ok((total, hex::encode(hasher.finalize())))
}

/// Magic-number content detection over the first bytes of a stream.
pub fn sniff_content_type(head: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b\x08", "application/x-gzip"),
        (b"<?xml", "text/xml; charset=utf-8"),
    ];

    if head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        return "image/webp";
    }
    if let Some(&(_, ct)) = SIGNATURES.iter().find(|(magic, _)| head.starts_with(magic)) {
        return ct;
    }

    let text = head.trim_ascii_start();
    if text.is_empty() {
        return "text/plain; charset=utf-8";
    }
    if text.starts_with(b"{") || text.starts_with(b"[") {
        if std::str::from_utf8(head).is_ok() {
            return "application/json";
        }
    }
    let binary = head
        .iter()
        .any(|&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b));
    // a multi-byte char cut at the peek boundary is still text
    let utf8 = match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    };
    if !binary && utf8 {
        return "text/plain; charset=utf-8";
    }
    OCTET_STREAM
}

/// Best-guess file extension for a media type, `.bin` when unknown.
pub fn extension_for(media_type: &str) -> &'static str {
    let essence = media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/png" => ".png",
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        "application/pdf" => ".pdf",
        "text/plain" => ".txt",
        "text/csv" => ".csv",
        "application/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "application/zip" => ".zip",
        _ => ".bin",
    }
}

fn read_head<R: Read + ?Sized>(reader: &mut R) -> NotaryResult<Vec<u8>> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    reader
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .map_err(NotaryError::store)?;
    Ok(head)
}

/// Stores attachments for one substep completion. Every saved id is remembered so a
/// failed completion can take its attachments back out with `rollback`.
pub struct AttachmentWriter<'a> {
    store: &'a dyn Store,
    blobs: &'a dyn BlobStore,
    process_id: ProcessId,
    substep_id: &'a str,
    max_bytes: u64,
    saved: RefCell<Vec<String>>,
}

impl<'a> AttachmentWriter<'a> {
    pub fn new(
        store: &'a dyn Store,
        blobs: &'a dyn BlobStore,
        process_id: ProcessId,
        substep_id: &'a str,
        max_bytes: u64,
    ) -> Self {
        Self {
            store,
            blobs,
            process_id,
            substep_id,
            max_bytes,
            saved: RefCell::new(Vec::new()),
        }
    }

    /// Ids of the attachments saved so far, in save order.
    pub fn saved(&self) -> Vec<String> {
        self.saved.borrow().clone()
    }

    /// Deletes blob and metadata of everything saved through this writer.
    pub fn rollback(&self) {
        let ids = std::mem::take(&mut *self.saved.borrow_mut());
        for id in ids {
            if let Err(err) = self.blobs.delete(&id) {
                warn!(attachment_id = %id, error = %err, "failed to delete orphaned blob");
            }
            if let Err(err) = self.store.delete_attachment(&id) {
                warn!(attachment_id = %id, error = %err, "failed to delete orphaned attachment record");
            }
            debug!(process_id = %self.process_id, substep_id = self.substep_id, attachment_id = %id, "attachment rolled back");
        }
    }

    pub fn save(
        &self,
        filename: &str,
        content_type: Option<&str>,
        reader: &mut dyn Read,
    ) -> NotaryResult<Attachment> {
        let filename = sanitize_filename(filename);
        let id = utils::new_uuid_to_bech32("att").map_err(NotaryError::StoreFailure)?;

        let declared = content_type.map(str::trim).filter(|ct| !ct.is_empty());
        let (content_type, head) = match declared {
            Some(ct) => (ct.to_string(), Vec::new()),
            None => {
                let head = read_head(reader)?;
                (sniff_content_type(&head).to_string(), head)
            }
        };
        let mut stream = Cursor::new(head).chain(reader);

        let mut sink = self.blobs.create(&id)?;
        let (size, sha256) = match copy_with_limit(&mut stream, &mut sink, self.max_bytes) {
            Ok(done) => done,
            Err(err) => {
                if let Err(discard_err) = sink.discard() {
                    warn!(attachment_id = %id, error = %discard_err, "failed to discard partial blob");
                }
                if matches!(err, NotaryError::AttachmentTooLarge { .. }) {
                    warn!(
                        process_id = %self.process_id,
                        substep_id = self.substep_id,
                        max_bytes = self.max_bytes,
                        "attachment rejected, too large"
                    );
                }
                return Err(err);
            }
        };
        sink.commit()?;

        let attachment = Attachment {
            id,
            process_id: self.process_id,
            substep_id: self.substep_id.to_string(),
            filename,
            content_type,
            size,
            sha256,
            uploaded_at: TimeStamp::new(),
        };
        if let Err(err) = self.store.save_attachment(&attachment) {
            if let Err(delete_err) = self.blobs.delete(&attachment.id) {
                warn!(attachment_id = %attachment.id, error = %delete_err, "failed to delete blob without metadata");
            }
            return Err(err);
        }
        self.saved.borrow_mut().push(attachment.id.clone());

        info!(
            process_id = %self.process_id,
            substep_id = self.substep_id,
            attachment_id = %attachment.id,
            size = attachment.size,
            "attachment stored"
        );
        Ok(attachment)
    }

    pub fn save_upload<R: Read>(&self, upload: Upload<R>) -> NotaryResult<Attachment> {
        let Upload {
            filename,
            content_type,
            mut reader,
        } = upload;
        self.save(&filename, content_type.as_deref(), &mut reader)
    }
}

/// Blob store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

struct MemorySink {
    id: String,
    buf: Vec<u8>,
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> NotaryError {
    NotaryError::store(anyhow::anyhow!("blob store lock poisoned"))
}

impl Write for MemorySink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl BlobSink for MemorySink {
    fn commit(self: Box<Self>) -> NotaryResult<()> {
        let this = *self;
        this.blobs.lock().map_err(poisoned)?.insert(this.id, this.buf);
        Ok(())
    }
    fn discard(self: Box<Self>) -> NotaryResult<()> {
        Ok(())
    }
}

impl BlobStore for MemoryBlobStore {
    fn create(&self, id: &str) -> NotaryResult<Box<dyn BlobSink>> {
        Ok(Box::new(MemorySink {
            id: id.to_string(),
            buf: Vec::new(),
            blobs: Arc::clone(&self.blobs),
        }))
    }
    fn open(&self, id: &str) -> NotaryResult<Box<dyn Read + Send>> {
        let blobs = self.blobs.lock().map_err(poisoned)?;
        let bytes = blobs
            .get(id)
            .cloned()
            .ok_or_else(|| NotaryError::not_found("attachment blob", id))?;
        Ok(Box::new(Cursor::new(bytes)))
    }
    fn delete(&self, id: &str) -> NotaryResult<()> {
        self.blobs.lock().map_err(poisoned)?.remove(id);
        Ok(())
    }
    fn exists(&self, id: &str) -> bool {
        self.blobs.lock().map(|b| b.contains_key(id)).unwrap_or(false)
    }
}

/// Blob store writing one file per attachment under a directory. Bytes go to a temp file
/// in the same directory and are renamed into place on commit.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

struct FsSink {
    file: tempfile::NamedTempFile,
    target: PathBuf,
}

impl FsBlobStore {
    pub fn open(dir: impl AsRef<Path>) -> NotaryResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(NotaryError::store)?;
        debug!(dir = %dir.display(), "blob directory ready");
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> NotaryResult<PathBuf> {
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(NotaryError::not_found("attachment blob", id));
        }
        Ok(self.dir.join(id))
    }
}

impl Write for FsSink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.file.write(data)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl BlobSink for FsSink {
    fn commit(self: Box<Self>) -> NotaryResult<()> {
        let FsSink { file, target } = *self;
        file.persist(&target)
            .map_err(|e| NotaryError::store(e.error))?;
        Ok(())
    }
    fn discard(self: Box<Self>) -> NotaryResult<()> {
        let FsSink { file, .. } = *self;
        file.close().map_err(NotaryError::store)
    }
}

impl BlobStore for FsBlobStore {
    fn create(&self, id: &str) -> NotaryResult<Box<dyn BlobSink>> {
        let target = self.path_for(id)?;
        let file = tempfile::NamedTempFile::new_in(&self.dir).map_err(NotaryError::store)?;
        Ok(Box::new(FsSink { file, target }))
    }
    fn open(&self, id: &str) -> NotaryResult<Box<dyn Read + Send>> {
        let path = self.path_for(id)?;
        match File::open(&path) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NotaryError::not_found("attachment blob", id))
            }
            Err(e) => Err(NotaryError::store(e)),
        }
    }
    fn delete(&self, id: &str) -> NotaryResult<()> {
        match std::fs::remove_file(self.path_for(id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NotaryError::store(e)),
        }
    }
    fn exists(&self, id: &str) -> bool {
        self.path_for(id).map(|p| p.is_file()).unwrap_or(false)
    }
}
