//! Compressed-storage container for pickled pipelines.
//!
//! Fixtures may be written raw or through a zlib/gzip compressor (the joblib
//! convention). The container is detected from the leading bytes.

use flate2::bufread::{GzDecoder, ZlibDecoder};
use std::io::{self, BufReader, Read};

/// Bytes needed to recognize a container header.
const SNIFF_LEN: usize = 2;

/// Container detected at the head of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zlib,
}

/// A readable view over a possibly compressed fixture stream.
pub struct Storage {
    compression: Compression,
    reader: Box<dyn Read + Send>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Wrap a raw stream, sniffing its container.
    ///
    /// On failure the raw stream is dropped (closed) before the error is returned.
    pub fn open(mut raw: Box<dyn Read + Send>) -> io::Result<Self> {
        let mut head = [0u8; SNIFF_LEN];
        let filled = match fill_head(&mut raw, &mut head) {
            Ok(filled) => filled,
            Err(e) => {
                drop(raw);
                return Err(e);
            }
        };
        let compression = detect(&head[..filled]);
        let buffered = BufReader::new(io::Cursor::new(head[..filled].to_vec()).chain(raw));
        let reader: Box<dyn Read + Send> = match compression {
            Compression::None => Box::new(buffered),
            Compression::Gzip => Box::new(GzDecoder::new(buffered)),
            Compression::Zlib => Box::new(ZlibDecoder::new(buffered)),
        };
        tracing::debug!(?compression, "Opened fixture storage");
        Ok(Self {
            compression,
            reader,
        })
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Read the decompressed stream to the end.
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.reader.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl Read for Storage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Read until `head` is full or the stream ends; short reads are retried.
fn fill_head(reader: &mut dyn Read, head: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < head.len() {
        match reader.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn detect(head: &[u8]) -> Compression {
    match head {
        [0x1f, 0x8b, ..] => Compression::Gzip,
        [cmf, flg, ..] if cmf & 0x0f == 8 && ((u16::from(*cmf) << 8) | u16::from(*flg)) % 31 == 0 => {
            Compression::Zlib
        }
        _ => Compression::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression as Level;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use std::io::Write;

    const PAYLOAD: &[u8] = b"PKGR\x01\x00payload";

    fn open(bytes: Vec<u8>) -> Storage {
        Storage::open(Box::new(io::Cursor::new(bytes))).unwrap()
    }

    #[test]
    fn test_raw_passthrough() {
        let storage = open(PAYLOAD.to_vec());
        assert_eq!(storage.compression(), Compression::None);
        assert_eq!(storage.into_bytes().unwrap(), PAYLOAD);
    }

    #[test]
    fn test_gzip_detected() {
        let mut enc = GzEncoder::new(Vec::new(), Level::default());
        enc.write_all(PAYLOAD).unwrap();
        let storage = open(enc.finish().unwrap());
        assert_eq!(storage.compression(), Compression::Gzip);
        assert_eq!(storage.into_bytes().unwrap(), PAYLOAD);
    }

    #[test]
    fn test_zlib_detected() {
        let mut enc = ZlibEncoder::new(Vec::new(), Level::best());
        enc.write_all(PAYLOAD).unwrap();
        let storage = open(enc.finish().unwrap());
        assert_eq!(storage.compression(), Compression::Zlib);
        assert_eq!(storage.into_bytes().unwrap(), PAYLOAD);
    }

    #[test]
    fn test_empty_stream_is_raw() {
        let storage = open(Vec::new());
        assert_eq!(storage.compression(), Compression::None);
        assert!(storage.into_bytes().unwrap().is_empty());
    }

    /// Hands out one byte per read call.
    struct Trickle(io::Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(1);
            self.0.read(&mut buf[..n])
        }
    }

    #[test]
    fn test_detects_container_from_short_reads() {
        let mut enc = GzEncoder::new(Vec::new(), Level::default());
        enc.write_all(PAYLOAD).unwrap();
        let storage = Storage::open(Box::new(Trickle(io::Cursor::new(enc.finish().unwrap())))).unwrap();
        assert_eq!(storage.compression(), Compression::Gzip);
        assert_eq!(storage.into_bytes().unwrap(), PAYLOAD);

        let mut enc = ZlibEncoder::new(Vec::new(), Level::best());
        enc.write_all(PAYLOAD).unwrap();
        let storage = Storage::open(Box::new(Trickle(io::Cursor::new(enc.finish().unwrap())))).unwrap();
        assert_eq!(storage.compression(), Compression::Zlib);
        assert_eq!(storage.into_bytes().unwrap(), PAYLOAD);
    }

    #[test]
    fn test_one_byte_stream_is_raw() {
        let storage = open(vec![0x1f]);
        assert_eq!(storage.compression(), Compression::None);
        assert_eq!(storage.into_bytes().unwrap(), vec![0x1f]);
    }

    struct FailingReader {
        dropped: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("device gone"))
        }
    }

    impl Drop for FailingReader {
        fn drop(&mut self) {
            self.dropped.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_raw_stream_closed_when_wrapping_fails() {
        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let raw = FailingReader {
            dropped: dropped.clone(),
        };
        let err = Storage::open(Box::new(raw)).unwrap_err();
        assert_eq!(err.to_string(), "device gone");
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
