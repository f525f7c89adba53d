//! Receiving half of the relay protocol.
//!
//! The assembler is a plain state machine: feed it frames, get back the reply
//! to write. It keeps partial transfers by id and remembers which ids it
//! already saved. Completed documents come back as a [`PendingWrite`] so the
//! caller can do the disk I/O without holding whatever guards the assembler.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use tabpilot_core::{Frame, Reply};

use crate::chunk;

/// Longest file stem derived from a URL.
const MAX_STEM: usize = 120;

#[derive(Debug, Clone, PartialEq)]
pub struct AssemblerSettings {
    pub inbox_dir: PathBuf,
    /// Destination for transfers with `docType = "product"`.
    pub product_dir: PathBuf,
    /// Acknowledge every n-th chunk; 0 disables chunk acks.
    pub ack_every: usize,
    /// Partial transfers untouched this long are dropped.
    pub assembly_timeout: Duration,
    /// Store single-frame `parsed` documents instead of skipping them.
    pub accept_parsed: bool,
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        Self {
            inbox_dir: PathBuf::from("data/inbox"),
            product_dir: PathBuf::from("data/product"),
            ack_every: 10,
            assembly_timeout: Duration::from_secs(300),
            accept_parsed: false,
        }
    }
}

#[derive(Debug)]
struct Assembly {
    total: usize,
    chunks: BTreeMap<usize, Vec<u8>>,
    url: String,
    doc_type: Option<String>,
    touched: Instant,
}

impl Assembly {
    fn new(total: usize, url: String, now: Instant) -> Self {
        Self {
            total,
            chunks: BTreeMap::new(),
            url,
            doc_type: None,
            touched: now,
        }
    }

    /// Expected chunk count; falls back to the highest seq seen when `begin`
    /// never announced one.
    fn expected(&self) -> usize {
        if self.total > 0 {
            self.total
        } else {
            self.chunks
                .keys()
                .next_back()
                .map(|s| s.saturating_add(1))
                .unwrap_or(0)
        }
    }

    /// Counted from the stored chunks; `total` is peer-supplied and unbounded.
    fn missing(&self) -> usize {
        let expected = self.expected();
        expected.saturating_sub(self.chunks.range(..expected).count())
    }
}

/// A completed document waiting to be written to disk.
#[derive(Debug)]
pub struct PendingWrite {
    pub id: String,
    pub path: PathBuf,
    pub html: String,
    doc_type: Option<String>,
    /// Chunked transfers join the saved set; single-frame documents do not.
    transfer: bool,
}

impl PendingWrite {
    pub async fn write(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, self.html.as_bytes()).await
    }

    fn write_blocking(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, &self.html)
    }
}

/// What to do about one inbound frame.
#[derive(Debug)]
pub enum Verdict {
    Reply(Reply),
    /// Write the document, then report through [`Assembler::written`].
    Write(PendingWrite),
}

#[derive(Debug)]
pub struct Assembler {
    settings: AssemblerSettings,
    assemblies: HashMap<String, Assembly>,
    saved: HashSet<String>,
}

impl Assembler {
    pub fn new(settings: AssemblerSettings) -> Self {
        Self {
            settings,
            assemblies: HashMap::new(),
            saved: HashSet::new(),
        }
    }

    pub fn settings(&self) -> &AssemblerSettings {
        &self.settings
    }

    /// Transfers currently being assembled.
    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }

    pub fn is_saved(&self, id: &str) -> bool {
        self.saved.contains(id)
    }

    /// Apply one inbound frame and return the reply to send, if any.
    ///
    /// Completed documents are written before returning. Callers holding a
    /// shared lock should use [`Assembler::accept`] instead.
    pub fn handle(&mut self, frame: Frame, now: Instant) -> Option<Reply> {
        match self.accept(frame, now)? {
            Verdict::Reply(reply) => Some(reply),
            Verdict::Write(pending) => {
                let result = pending.write_blocking();
                Some(self.written(pending, result))
            }
        }
    }

    /// Apply one inbound frame without touching the filesystem.
    pub fn accept(&mut self, frame: Frame, now: Instant) -> Option<Verdict> {
        let reply = match frame {
            Frame::Begin {
                id,
                total,
                url,
                meta,
                ..
            } => {
                let chunks = self
                    .assemblies
                    .remove(&id)
                    .map(|prev| prev.chunks)
                    .unwrap_or_default();
                debug!(id = %id, total, url = %url, doc_type = ?meta.doc_type, "assembler: begin");
                self.assemblies.insert(
                    id.clone(),
                    Assembly {
                        total,
                        chunks,
                        url,
                        doc_type: meta.doc_type,
                        touched: now,
                    },
                );
                Reply::BeginAck { id }
            }

            Frame::Chunk {
                id,
                seq,
                total,
                data,
                ..
            } => {
                let bytes = match chunk::decode(&data) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(id = %id, seq, error = %e, "assembler: chunk decode failed");
                        return Some(Verdict::Reply(Reply::Error {
                            id: Some(id),
                            error: "decode".into(),
                            missing: None,
                            seq: Some(seq),
                        }));
                    }
                };
                let assembly = self
                    .assemblies
                    .entry(id.clone())
                    .or_insert_with(|| Assembly::new(total, String::new(), now));
                assembly.chunks.insert(seq, bytes);
                assembly.touched = now;

                let every = self.settings.ack_every;
                if every > 0 && seq % every == 0 {
                    Reply::Ack {
                        id: Some(id),
                        seq: Some(seq),
                    }
                } else {
                    return None;
                }
            }

            Frame::End { id, .. } => return Some(self.finish(id)),

            Frame::Parsed { url, html } => return Some(self.store_parsed(url, html)),

            Frame::Ping { .. } | Frame::CommandResult { .. } => return None,
        };
        Some(Verdict::Reply(reply))
    }

    /// Record the result of writing `pending` and build the reply.
    pub fn written(&mut self, pending: PendingWrite, result: std::io::Result<()>) -> Reply {
        let PendingWrite {
            id,
            path,
            html,
            doc_type,
            transfer,
        } = pending;
        match result {
            Ok(()) => {
                info!(
                    id = %id,
                    path = %path.display(),
                    doc_type = ?doc_type,
                    bytes = html.len(),
                    "assembler: saved"
                );
                if transfer {
                    self.saved.insert(id.clone());
                }
                Reply::Saved {
                    id,
                    saved: path.display().to_string(),
                }
            }
            Err(e) => {
                warn!(id = %id, path = %path.display(), error = %e, "assembler: write failed");
                Reply::Error {
                    id: Some(id),
                    error: "write".into(),
                    missing: None,
                    seq: None,
                }
            }
        }
    }

    fn finish(&mut self, id: String) -> Verdict {
        if self.saved.contains(&id) {
            info!(id = %id, "assembler: already saved, skipping");
            return Verdict::Reply(Reply::Skipped {
                id: Some(id),
                reason: "already_saved".into(),
            });
        }

        let missing = match self.assemblies.get(&id) {
            Some(assembly) => assembly.missing(),
            None => {
                warn!(id = %id, "assembler: end without begin");
                return Verdict::Reply(no_begin(id));
            }
        };
        if missing > 0 {
            warn!(id = %id, missing, "assembler: missing chunks");
            return Verdict::Reply(Reply::Error {
                id: Some(id),
                error: "missing_chunks".into(),
                missing: Some(missing),
                seq: None,
            });
        }

        let Some(assembly) = self.assemblies.remove(&id) else {
            return Verdict::Reply(no_begin(id));
        };
        let expected = assembly.expected();
        let bytes: Vec<u8> = assembly
            .chunks
            .into_iter()
            .take_while(|(seq, _)| *seq < expected)
            .flat_map(|(_, data)| data)
            .collect();
        let html = String::from_utf8_lossy(&bytes).into_owned();
        let path = self.target_path(&assembly.url, &id, assembly.doc_type.as_deref());
        Verdict::Write(PendingWrite {
            id,
            path,
            html,
            doc_type: assembly.doc_type,
            transfer: true,
        })
    }

    fn store_parsed(&mut self, url: String, html: String) -> Verdict {
        if !self.settings.accept_parsed {
            return Verdict::Reply(Reply::Skipped {
                id: None,
                reason: "parsed_ignored".into(),
            });
        }

        let id = chrono::Utc::now().format("%Y%m%d%H%M%S%f").to_string();
        let url = if url.is_empty() { "unknown".to_string() } else { url };
        let path = self.target_path(&url, &id, None);
        Verdict::Write(PendingWrite {
            id,
            path,
            html,
            doc_type: None,
            transfer: false,
        })
    }

    /// Where a completed transfer is written.
    pub fn target_path(&self, url: &str, id: &str, doc_type: Option<&str>) -> PathBuf {
        let stem = safe_file_stem(&canonical_url(url));
        let stem = stem.strip_suffix(".html").unwrap_or(&stem);
        let dir = match doc_type {
            Some(t) if t.eq_ignore_ascii_case("product") => &self.settings.product_dir,
            _ => &self.settings.inbox_dir,
        };
        dir.join(format!("{stem}_{id}.html"))
    }

    /// Drop partial transfers idle for longer than the assembly timeout.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let timeout = self.settings.assembly_timeout;
        let before = self.assemblies.len();
        self.assemblies.retain(|id, a| {
            let keep = now.saturating_duration_since(a.touched) < timeout;
            if !keep {
                debug!(id = %id, received = a.chunks.len(), "assembler: evicting stale transfer");
            }
            keep
        });
        before - self.assemblies.len()
    }
}

fn no_begin(id: String) -> Reply {
    Reply::Error {
        id: Some(id),
        error: "no_begin".into(),
        missing: None,
        seq: None,
    }
}

/// `scheme://host/path` without query or fragment.
pub fn canonical_url(raw: &str) -> String {
    if raw.is_empty() {
        return "page".into();
    }
    match url::Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

/// Filesystem-safe stem: separators become `_`, anything other than
/// alphanumerics and `._-` is dropped.
pub fn safe_file_stem(name: &str) -> String {
    let name = if name.is_empty() { "page" } else { name };
    name.replace("://", "_")
        .replace(['/', '?', '#', '&', '='], "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(MAX_STEM)
        .collect()
}
