//! Incremental reader for a log file that another process appends to.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;


/// Where we are in one log file. The offset only moves forward.
#[derive(Debug, Clone)]
pub struct LogCursor {
    path: PathBuf,
    mtime: Option<SystemTime>,
    offset: u64,
}


impl LogCursor {
    pub fn new(path: &Path) -> LogCursor {
        LogCursor {
            path: path.to_path_buf(),
            mtime: None,
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Modification time seen on the last poll.
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.mtime
    }

    /// Complete lines appended since the last read. A trailing partial
    /// line stays unread until its newline arrives.
    ///
    /// `Ok(None)` when nothing new is there: missing file, unchanged
    /// file, or a file that shrank below our offset (truncated or
    /// rotated). The cursor does not rewind in that last case.
    pub fn read_new(&mut self) -> std::io::Result<Option<String>> {
        self.read(false)
    }

    /// Everything appended since the last read, partial last line
    /// included. Used once the writer has exited.
    pub fn drain(&mut self) -> std::io::Result<Option<String>> {
        self.read(true)
    }

    fn read(&mut self, include_partial: bool) -> std::io::Result<Option<String>> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let len = meta.len();
        let mtime = meta.modified().ok();

        if len <= self.offset {
            self.mtime = mtime;
            return Ok(None);
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut buf)?;

        if !include_partial {
            match buf.iter().rposition(|&b| b == b'\n') {
                Some(last_newline) => buf.truncate(last_newline + 1),
                None => return Ok(None),
            }
        }
        if buf.is_empty() {
            return Ok(None);
        }

        self.offset += buf.len() as u64;
        self.mtime = mtime;
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_SEQ: AtomicU32 = AtomicU32::new(0);

    fn test_file() -> PathBuf {
        let seq = TEST_SEQ.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("lrf{}-{}.log", std::process::id(), seq))
    }

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn missing_file_is_no_data() {
        let path = test_file();
        let mut cursor = LogCursor::new(&path);
        assert_eq!(cursor.read_new().unwrap(), None);
    }

    #[test]
    fn second_poll_without_writes_is_empty() {
        let path = test_file();
        append(&path, "loss 3\nloss 2\n");
        let mut cursor = LogCursor::new(&path);
        assert_eq!(cursor.read_new().unwrap().as_deref(), Some("loss 3\nloss 2\n"));
        assert_eq!(cursor.read_new().unwrap(), None);

        append(&path, "loss 1\n");
        assert_eq!(cursor.read_new().unwrap().as_deref(), Some("loss 1\n"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let path = test_file();
        append(&path, "epoch 1\nlo");
        let mut cursor = LogCursor::new(&path);
        assert_eq!(cursor.read_new().unwrap().as_deref(), Some("epoch 1\n"));
        assert_eq!(cursor.read_new().unwrap(), None);

        append(&path, "ss 4\n");
        assert_eq!(cursor.read_new().unwrap().as_deref(), Some("loss 4\n"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn drain_returns_trailing_partial_line() {
        let path = test_file();
        append(&path, "done");
        let mut cursor = LogCursor::new(&path);
        assert_eq!(cursor.read_new().unwrap(), None);
        assert_eq!(cursor.drain().unwrap().as_deref(), Some("done"));
        assert_eq!(cursor.drain().unwrap(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncated_file_is_no_data_not_an_error() {
        let path = test_file();
        append(&path, "a long first line\n");
        let mut cursor = LogCursor::new(&path);
        cursor.read_new().unwrap();
        let offset = cursor.offset();

        std::fs::write(&path, "short\n").unwrap();
        assert_eq!(cursor.read_new().unwrap(), None);
        assert_eq!(cursor.offset(), offset, "cursor must not rewind");
        let _ = std::fs::remove_file(&path);
    }
}
