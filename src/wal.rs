use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::mem;
use std::path::{Path, PathBuf};

use crate::model::Commit;

/// Encode one commit as `[len][bincode][crc32]`. Returns the frame size.
fn encode_frame(writer: &mut impl Write, commit: &Commit) -> io::Result<u64> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "commit frame too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or torn EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next valid frame and its size, or `None` at EOF / the first torn or
/// corrupt frame.
fn decode_frame(reader: &mut impl Read) -> io::Result<Option<(Commit, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf);
    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Commit>(&payload)
        .ok()
        .map(|commit| (commit, 8 + u64::from(len))))
}

/// Valid commits on disk and the length of the prefix they occupy.
fn scan(path: &Path) -> io::Result<(Vec<Commit>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut commits = Vec::new();
    let mut valid_len = 0;
    while let Some((commit, frame_len)) = decode_frame(&mut reader)? {
        commits.push(commit);
        valid_len += frame_len;
    }
    Ok((commits, valid_len))
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Append-only write-ahead log of commits.
///
/// Each frame carries every event of one transaction, so a crash mid-write
/// loses the whole transaction rather than half of it: the length prefix and
/// CRC let replay discard a torn final frame. Appends only ever follow the
/// last valid frame: the file is cut back to it on open and after a failed
/// batch.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Bytes known to be fsynced and valid.
    durable_len: u64,
    /// Bytes accepted into the buffer since the last sync.
    unsynced_len: u64,
    unsynced_appends: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::recover(path).map(|(wal, _)| wal)
    }

    /// Replay the log and open it for appending. Bytes after the last
    /// valid frame are truncated so new frames stay reachable.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Commit>)> {
        let (commits, valid_len) = scan(path)?;
        let file = open_append(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                "truncating {} trailing WAL bytes after the last valid frame",
                on_disk - valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len: valid_len,
            unsynced_len: 0,
            unsynced_appends: 0,
        };
        Ok((wal, commits))
    }

    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Buffer a frame without syncing; pair with `flush_sync` per batch.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        self.unsynced_len += encode_frame(&mut self.writer, commit)?;
        self.unsynced_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.unsynced_len;
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Drop everything since the last successful sync: buffered bytes are
    /// discarded and the file is cut back to its durable length.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        let file = open_append(&self.path)?;
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        let stale = mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop
        let _ = stale.into_parts();
        self.appends_since_compact =
            self.appends_since_compact.saturating_sub(self.unsynced_appends);
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted log beside the live one and fsync it.
    pub fn write_compact_file(path: &Path, commits: &[Commit]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for commit in commits {
            encode_frame(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = open_append(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, commits: &[Commit]) -> io::Result<()> {
        Self::write_compact_file(&self.path, commits)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// All valid commits on disk, in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        scan(path).map(|(commits, _)| commits)
    }
}
