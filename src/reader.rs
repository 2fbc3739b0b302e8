use std::{io, io::SeekFrom, path::Path};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncSeekExt, BufReader},
};

/// What to do with a final line that has no terminating newline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrailingLine {
    /// The file is quiescent; the fragment is a complete record.
    Include,
    /// The writer may still be mid-line; leave the fragment for the next read.
    HoldBack,
}

/// One non-blank line plus the byte offset just past its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub end_offset: u64,
}

/// Lazily reads lines from a session file starting at a byte offset.
pub struct LineReader {
    reader: BufReader<File>,
    offset: u64,
    trailing: TrailingLine,
    buf: Vec<u8>,
}

impl LineReader {
    pub async fn open(path: &Path, offset: u64, trailing: TrailingLine) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Self {
            reader: BufReader::new(file),
            offset,
            trailing,
            buf: Vec::new(),
        })
    }

    /// Offset just past the last consumed line, blank lines included.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub async fn next_line(&mut self) -> io::Result<Option<Line>> {
        loop {
            self.buf.clear();
            let read = self.reader.read_until(b'\n', &mut self.buf).await?;
            if read == 0 {
                return Ok(None);
            }
            let terminated = self.buf.last() == Some(&b'\n');
            if !terminated && self.trailing == TrailingLine::HoldBack {
                return Ok(None);
            }
            self.offset += read as u64;

            let text = String::from_utf8_lossy(&self.buf);
            let text = text.trim_end_matches(['\n', '\r']);
            if text.trim().is_empty() {
                continue;
            }
            return Ok(Some(Line {
                text: text.to_string(),
                end_offset: self.offset,
            }));
        }
    }
}
