use std::{
    fmt,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;

use crate::sync::Mutex;

/// A request body.
///
/// Bodies made from bytes or a file can be replayed, which is what a
/// method-preserving redirect or an authentication retry needs. A body made
/// from a reader is handed out once; after that the task's delegate is asked
/// for a fresh stream.
#[derive(Clone)]
pub struct Body {
    inner: Inner,
}

#[derive(Clone)]
enum Inner {
    Bytes(Bytes),
    File(PathBuf),
    Reader(Arc<Mutex<Option<Box<dyn Read + Send>>>>),
}

// ===== impl Body =====

impl Body {
    /// Creates an empty body.
    #[inline]
    pub fn empty() -> Body {
        Body::from(Bytes::new())
    }

    /// Creates a body that streams the contents of the file at `path`.
    ///
    /// The file is opened when the transfer starts, so a missing file is
    /// reported by the task rather than here.
    pub fn file<P: AsRef<Path>>(path: P) -> Body {
        Body {
            inner: Inner::File(path.as_ref().to_path_buf()),
        }
    }

    /// Creates a body that streams from `reader`.
    ///
    /// The length is unknown, so the request is sent with chunked framing.
    pub fn reader<R: Read + Send + 'static>(reader: R) -> Body {
        Body {
            inner: Inner::Reader(Arc::new(Mutex::new(Some(Box::new(reader))))),
        }
    }

    /// Returns a reference to the internal data of the `Body`.
    ///
    /// `None` is returned, if the underlying data is a file or a stream.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            Inner::Bytes(bytes) => Some(bytes.as_ref()),
            Inner::File(_) | Inner::Reader(_) => None,
        }
    }

    /// Returns true for a stream body.
    pub fn is_stream(&self) -> bool {
        matches!(self.inner, Inner::Reader(_))
    }

    /// The number of bytes the body will produce, when that is known up front.
    pub(crate) fn content_length(&self) -> io::Result<Option<u64>> {
        match &self.inner {
            Inner::Bytes(bytes) => Ok(Some(bytes.len() as u64)),
            Inner::File(path) => std::fs::metadata(path).map(|m| Some(m.len())),
            Inner::Reader(_) => Ok(None),
        }
    }

    /// Creates a fresh source of outbound bytes.
    ///
    /// Returns `Ok(None)` when the body is a stream that was already handed
    /// out to an earlier attempt.
    pub(crate) fn source(&self) -> io::Result<Option<Box<dyn BodySource>>> {
        match &self.inner {
            Inner::Bytes(bytes) => Ok(Some(Box::new(DataSource::new(bytes.clone())))),
            Inner::File(path) => {
                let file = File::open(path)?;
                Ok(Some(Box::new(FileSource { file })))
            }
            Inner::Reader(reader) => Ok(reader
                .lock()
                .take()
                .map(|reader| Box::new(StreamSource::new(reader)) as Box<dyn BodySource>)),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.inner {
            Inner::Bytes(bytes) => f.debug_tuple("Body").field(&bytes.len()).finish(),
            Inner::File(path) => f.debug_tuple("Body").field(path).finish(),
            Inner::Reader(_) => f.pad("Body(Reader)"),
        }
    }
}

impl From<Bytes> for Body {
    #[inline]
    fn from(bytes: Bytes) -> Body {
        Body {
            inner: Inner::Bytes(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    #[inline]
    fn from(vec: Vec<u8>) -> Body {
        Body::from(Bytes::from(vec))
    }
}

impl From<&'static [u8]> for Body {
    #[inline]
    fn from(s: &'static [u8]) -> Body {
        Body::from(Bytes::from_static(s))
    }
}

impl From<String> for Body {
    #[inline]
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    #[inline]
    fn from(s: &'static str) -> Body {
        Body::from(s.as_bytes())
    }
}

impl From<File> for Body {
    #[inline]
    fn from(file: File) -> Body {
        Body::reader(file)
    }
}

/// One step of an outbound body.
#[derive(Debug)]
pub(crate) enum Chunk {
    Data(Bytes),
    Done,
    RetryLater,
    Error(io::Error),
}

/// A producer of outbound body bytes.
pub(crate) trait BodySource: Send {
    /// Produces at most `len` bytes.
    fn next_chunk(&mut self, len: usize) -> Chunk;

    /// Restarts the body at an absolute `offset`.
    ///
    /// Returns false when the source can not move backwards.
    fn seek(&mut self, offset: u64) -> io::Result<bool>;
}

struct DataSource {
    data: Bytes,
    position: usize,
}

impl DataSource {
    fn new(data: Bytes) -> DataSource {
        DataSource { data, position: 0 }
    }
}

impl BodySource for DataSource {
    fn next_chunk(&mut self, len: usize) -> Chunk {
        let remaining = self.data.len() - self.position;
        if remaining == 0 {
            return Chunk::Done;
        }
        let end = self.position + remaining.min(len);
        let chunk = self.data.slice(self.position..end);
        self.position = end;
        Chunk::Data(chunk)
    }

    fn seek(&mut self, offset: u64) -> io::Result<bool> {
        match usize::try_from(offset) {
            Ok(offset) if offset <= self.data.len() => {
                self.position = offset;
                Ok(true)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek past the end of the body",
            )),
        }
    }
}

struct FileSource {
    file: File,
}

impl BodySource for FileSource {
    fn next_chunk(&mut self, len: usize) -> Chunk {
        read_chunk(&mut self.file, len)
    }

    fn seek(&mut self, offset: u64) -> io::Result<bool> {
        self.file.seek(SeekFrom::Start(offset)).map(|_| true)
    }
}

struct StreamSource {
    reader: Box<dyn Read + Send>,
}

impl StreamSource {
    fn new(reader: Box<dyn Read + Send>) -> StreamSource {
        StreamSource { reader }
    }
}

impl BodySource for StreamSource {
    fn next_chunk(&mut self, len: usize) -> Chunk {
        read_chunk(&mut self.reader, len)
    }

    fn seek(&mut self, _offset: u64) -> io::Result<bool> {
        Ok(false)
    }
}

/// Wraps a replacement stream handed over by a task delegate.
pub(crate) fn stream_source(reader: Box<dyn Read + Send>) -> Box<dyn BodySource> {
    Box::new(StreamSource::new(reader))
}

fn read_chunk<R: Read + ?Sized>(reader: &mut R, len: usize) -> Chunk {
    let mut buf = vec![0; len];
    loop {
        return match reader.read(&mut buf) {
            Ok(0) => Chunk::Done,
            Ok(n) => {
                buf.truncate(n);
                Chunk::Data(Bytes::from(buf))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Chunk::RetryLater,
            Err(e) => Chunk::Error(e),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn collect(source: &mut dyn BodySource, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match source.next_chunk(len) {
                Chunk::Data(data) => out.extend_from_slice(&data),
                Chunk::Done => return out,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn data_source_honours_chunk_length() {
        let body = Body::from("hello world");
        let mut source = body.source().unwrap().unwrap();
        match source.next_chunk(5) {
            Chunk::Data(data) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(collect(&mut *source, 3), b" world");
    }

    #[test]
    fn data_source_rewinds() {
        let body = Body::from("abc");
        let mut source = body.source().unwrap().unwrap();
        assert_eq!(collect(&mut *source, 16), b"abc");
        assert!(source.seek(1).unwrap());
        assert_eq!(collect(&mut *source, 16), b"bc");
        assert!(source.seek(10).is_err());
    }

    #[test]
    fn reader_body_is_handed_out_once() {
        let body = Body::reader(Cursor::new(b"stream".to_vec()));
        let copy = body.clone();
        assert_eq!(body.content_length().unwrap(), None);

        let mut source = body.source().unwrap().unwrap();
        assert_eq!(collect(&mut *source, 4), b"stream");
        assert!(!source.seek(0).unwrap());
        assert!(copy.source().unwrap().is_none());
    }

    #[test]
    fn file_body_length_and_contents() {
        let path = std::env::temp_dir().join(format!("rquest-transfer-body-{}", std::process::id()));
        File::create(&path).unwrap().write_all(b"file contents").unwrap();

        let body = Body::file(&path);
        assert_eq!(body.content_length().unwrap(), Some(13));
        let mut source = body.source().unwrap().unwrap();
        assert_eq!(collect(&mut *source, 4), b"file contents");
        assert!(source.seek(5).unwrap());
        assert_eq!(collect(&mut *source, 64), b"contents");

        std::fs::remove_file(&path).unwrap();
        let err = Body::file(&path).content_length().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
