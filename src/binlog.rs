// src/binlog.rs
//
// Append-only record log backing the update queue and the webhook registry.
//
// ─ File format ──────────────────────────────────────────────────────────────
//
//   [magic "BGLG"][version u32 LE]                 -- file header
//   [len u32 LE][crc32 u32 LE][payload bytes]...   -- one frame per record
//
//   A frame whose CRC does not match is dropped (with a warning) and replay
//   continues with the next frame.  A frame whose length field runs past the
//   end of the file is treated as a torn tail write: replay stops there and
//   the file is truncated back to the last good frame before appending.
//
// ─ Writer ───────────────────────────────────────────────────────────────────
//
//   Appends go through a dedicated writer thread so log I/O never runs on
//   the async runtime.  Writes are batched; the file is flushed whenever the
//   queue drains and fsynced on close.  Durability is therefore best-effort
//   with a window of one flush interval.
//
// ────────────────────────────────────────────────────────────────────────────

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};

const MAGIC: &[u8; 4] = b"BGLG";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;

/// Frames larger than this are assumed to be corruption, not data.
const MAX_RECORD_LEN: usize = 1 << 20;

const FLUSH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum BinlogError {
    #[error("binlog {path}: unreadable header")]
    BadHeader { path: PathBuf },
    #[error("binlog {path}: unsupported version {version}")]
    BadVersion { path: PathBuf, version: u32 },
    #[error("binlog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("binlog record too large: {0} bytes")]
    RecordTooLarge(usize),
}

enum WriterCmd {
    Append(Vec<u8>),
    Close(mpsc::Sender<()>),
}

/// Handle to an open append-only log.  Cheap to clone; all clones feed the
/// same writer thread.
#[derive(Debug)]
pub struct Binlog {
    path: PathBuf,
    tx: mpsc::Sender<WriterCmd>,
    writer: Option<JoinHandle<()>>,
}

impl Binlog {
    /// Open (or create) the log at `path`, returning the handle together with
    /// every record that survived replay, in append order.
    ///
    /// Individually corrupted records are dropped with a warning; an
    /// unreadable header is a hard error (the caller aborts startup).
    pub fn open(path: &Path) -> Result<(Binlog, Vec<Vec<u8>>), BinlogError> {
        let io_err = |source| BinlogError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(io_err)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(io_err)?;

        let mut records = Vec::new();
        let mut good_end = HEADER_LEN;
        let mut dropped = 0usize;

        if data.is_empty() {
            file.write_all(MAGIC).map_err(io_err)?;
            file.write_all(&VERSION.to_le_bytes()).map_err(io_err)?;
        } else {
            if data.len() < HEADER_LEN as usize || &data[0..4] != MAGIC {
                return Err(BinlogError::BadHeader {
                    path: path.to_path_buf(),
                });
            }
            let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
            if version != VERSION {
                return Err(BinlogError::BadVersion {
                    path: path.to_path_buf(),
                    version,
                });
            }

            let mut pos = HEADER_LEN as usize;
            while pos + 8 <= data.len() {
                let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
                let crc = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap());
                if len > MAX_RECORD_LEN || pos + 8 + len > data.len() {
                    // Torn tail: everything from here on is unusable.
                    break;
                }
                let payload = &data[pos + 8..pos + 8 + len];
                if crc32fast::hash(payload) == crc {
                    records.push(payload.to_vec());
                } else {
                    dropped += 1;
                    warn!(path = %path.display(), offset = pos, "dropping binlog record with bad checksum");
                }
                pos += 8 + len;
                good_end = pos as u64;
            }

            if good_end < data.len() as u64 {
                warn!(
                    path = %path.display(),
                    lost = data.len() as u64 - good_end,
                    "truncating torn binlog tail"
                );
                file.set_len(good_end).map_err(io_err)?;
            }
        }

        if dropped > 0 {
            warn!(path = %path.display(), dropped, "binlog replay dropped corrupted records");
        }
        info!(path = %path.display(), records = records.len(), "binlog replayed");

        file.seek(SeekFrom::End(0)).map_err(io_err)?;

        let (tx, rx) = mpsc::channel::<WriterCmd>();
        let writer_path = path.to_path_buf();
        let writer = std::thread::Builder::new()
            .name("binlog-writer".to_string())
            .spawn(move || writer_loop(writer_path, file, rx))
            .map_err(io_err)?;

        Ok((
            Binlog {
                path: path.to_path_buf(),
                tx,
                writer: Some(writer),
            },
            records,
        ))
    }

    /// Queue one record for appending.  Returns once the record is handed to
    /// the writer thread, not once it is on disk.
    pub fn append(&self, payload: Vec<u8>) -> Result<(), BinlogError> {
        if payload.len() > MAX_RECORD_LEN {
            return Err(BinlogError::RecordTooLarge(payload.len()));
        }
        // A send error means the writer thread died; the I/O error was
        // already logged there.
        let _ = self.tx.send(WriterCmd::Append(payload));
        Ok(())
    }

    /// Drain pending writes, fsync and stop the writer thread.
    pub fn close(mut self) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.tx.send(WriterCmd::Close(done_tx)).is_ok() {
            let _ = done_rx.recv_timeout(Duration::from_secs(10));
        }
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        info!(path = %self.path.display(), "binlog closed");
    }
}

fn writer_loop(path: PathBuf, mut file: File, rx: mpsc::Receiver<WriterCmd>) {
    let mut dirty = false;
    loop {
        match rx.recv_timeout(FLUSH_INTERVAL) {
            Ok(WriterCmd::Append(payload)) => {
                let crc = crc32fast::hash(&payload);
                let mut frame = Vec::with_capacity(8 + payload.len());
                frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                frame.extend_from_slice(&crc.to_le_bytes());
                frame.extend_from_slice(&payload);
                if let Err(e) = file.write_all(&frame) {
                    error!(path = %path.display(), error = %e, "binlog write failed");
                    return;
                }
                dirty = true;
            }
            Ok(WriterCmd::Close(done)) => {
                let _ = file.flush();
                let _ = file.sync_all();
                let _ = done.send(());
                return;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if dirty {
                    if let Err(e) = file.flush() {
                        error!(path = %path.display(), error = %e, "binlog flush failed");
                        return;
                    }
                    dirty = false;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = file.flush();
                let _ = file.sync_all();
                return;
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> (Binlog, Vec<Vec<u8>>) {
        Binlog::open(&dir.path().join("test.binlog")).unwrap()
    }

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        let (log, records) = open(&dir);
        assert!(records.is_empty());
        log.append(b"one".to_vec()).unwrap();
        log.append(b"two".to_vec()).unwrap();
        log.close();

        let (log, records) = open(&dir);
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec()]);
        log.append(b"three".to_vec()).unwrap();
        log.close();

        let (log, records) = open(&dir);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2], b"three");
        log.close();
    }

    #[test]
    fn corrupted_record_is_dropped_rest_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.binlog");

        let (log, _) = Binlog::open(&path).unwrap();
        log.append(b"first".to_vec()).unwrap();
        log.append(b"second".to_vec()).unwrap();
        log.append(b"third".to_vec()).unwrap();
        log.close();

        // Flip a byte inside the payload of the second record.
        let mut data = std::fs::read(&path).unwrap();
        let second_payload_start = 8 + (8 + 5) + 8;
        data[second_payload_start] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        let (log, records) = Binlog::open(&path).unwrap();
        assert_eq!(records, vec![b"first".to_vec(), b"third".to_vec()]);
        log.close();
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.binlog");

        let (log, _) = Binlog::open(&path).unwrap();
        log.append(b"kept".to_vec()).unwrap();
        log.close();

        // Simulate a crash mid-append: a frame header promising more bytes
        // than the file holds.
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&100u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(b"partial");
        std::fs::write(&path, &data).unwrap();

        let (log, records) = Binlog::open(&path).unwrap();
        assert_eq!(records, vec![b"kept".to_vec()]);
        log.append(b"after".to_vec()).unwrap();
        log.close();

        let (log, records) = Binlog::open(&path).unwrap();
        assert_eq!(records, vec![b"kept".to_vec(), b"after".to_vec()]);
        log.close();
    }

    #[test]
    fn bad_header_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.binlog");
        std::fs::write(&path, b"not a binlog at all").unwrap();

        match Binlog::open(&path) {
            Err(BinlogError::BadHeader { .. }) => {}
            other => panic!("expected BadHeader, got {other:?}"),
        }
    }
}
