use std::fs::File;
use std::io::{self, Read};

/// Block size used by the line readers to peek ahead.
const LINE_BLOCK: usize = 4096;

/// Grow-only buffer backing a pipeline's read/peek operations.
///
/// The last `peek_offset` bytes of `data` have been read from the OS but
/// not yet consumed by the caller.  Reads are served from that tail
/// region first; only when it runs short does the buffer grow and issue a
/// single `read(2)` for the remainder.
#[derive(Default)]
pub(crate) struct PeekBuffer {
    data: Vec<u8>,
    peek_offset: usize,
    line_cache: Option<Vec<u8>>,
}

impl PeekBuffer {
    /// Returns up to `len` bytes from the stream.  With `peek`, the bytes
    /// stay in the peek region and the next read returns them again;
    /// without it, they are consumed.  A shorter-than-requested slice
    /// means the single underlying read came up short; an empty slice
    /// means end of stream.
    pub(crate) fn get_block(&mut self, source: &File, len: usize, peek: bool) -> io::Result<&[u8]> {
        let mut toread = len;
        let mut readstart = 0;
        let mut retstart = 0;

        if self.peek_offset > 0 {
            if self.peek_offset >= toread {
                // The whole request is already in the peek region.
                let start = self.data.len() - self.peek_offset;
                if !peek {
                    self.peek_offset -= toread;
                }
                return Ok(&self.data[start..start + toread]);
            }
            readstart = self.data.len();
            retstart = self.data.len() - self.peek_offset;
            toread -= self.peek_offset;
        }

        if !peek {
            self.peek_offset = 0;
        }

        self.data.resize(readstart + toread, 0);
        let n = loop {
            match (&*source).read(&mut self.data[readstart..readstart + toread]) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.data.truncate(readstart);
                    return Err(e);
                }
            }
        };
        self.data.truncate(readstart + n);
        if peek {
            self.peek_offset += n;
        }
        Ok(&self.data[retstart..])
    }

    /// Number of bytes that can be read without touching the OS.
    pub(crate) fn peek_size(&self) -> usize {
        self.peek_offset
    }

    /// The peeked-but-unconsumed bytes.
    pub(crate) fn peek_region(&self) -> &[u8] {
        &self.data[self.data.len() - self.peek_offset..]
    }

    /// Discards `len` bytes from the front of the peek region.
    pub(crate) fn peek_skip(&mut self, len: usize) {
        if len > 0 {
            assert!(
                len <= self.peek_offset,
                "peek skip of {} bytes exceeds peeked {}",
                len,
                self.peek_offset
            );
            self.peek_offset -= len;
        }
    }

    /// Reads or peeks one line, including its newline.  End of stream
    /// with no newline yields whatever remains as one last line; end of
    /// stream with nothing pending yields `None`.
    ///
    /// The newline search is length-bounded, so lines may legitimately
    /// contain NUL bytes.
    pub(crate) fn get_line(&mut self, source: &File, consume: bool) -> io::Result<Option<&[u8]>> {
        self.line_cache = None;

        let mut i = 0;
        let line = loop {
            let plen = LINE_BLOCK * (i + 1);
            let block = self.get_block(source, plen, true)?;
            if block.is_empty() {
                return Ok(None);
            }
            // Only the newly peeked suffix needs searching.
            let searched = LINE_BLOCK * i;
            let mut end = if searched < block.len() {
                block[searched..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map(|at| searched + at)
            } else {
                None
            };
            if end.is_none() && block.len() < plen {
                // end of file, no newline found
                end = Some(block.len() - 1);
            }
            if let Some(end) = end {
                break block[..end + 1].to_vec();
            }
            i += 1;
        };

        if consume {
            self.peek_offset -= line.len();
        }
        self.line_cache = Some(line);
        Ok(self.line_cache.as_deref())
    }
}
