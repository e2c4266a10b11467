use std::{io, mem};

#[cfg(any(feature = "gzip", feature = "deflate"))]
use std::io::Write;

/// The `Accept-Encoding` value for the decoders compiled in.
pub(super) fn accept_encoding() -> Option<&'static str> {
    match (cfg!(feature = "gzip"), cfg!(feature = "deflate")) {
        (true, true) => Some("gzip, deflate"),
        (true, false) => Some("gzip"),
        (false, true) => Some("deflate"),
        (false, false) => None,
    }
}

/// Decodes a response body as it arrives.
pub(super) enum Decoder {
    Identity,
    #[cfg(feature = "gzip")]
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    #[cfg(feature = "deflate")]
    Deflate(flate2::write::ZlibDecoder<Vec<u8>>),
}

// ===== impl Decoder =====

impl Decoder {
    /// Picks a decoder for a `Content-Encoding` value. Unknown encodings are
    /// passed through untouched.
    pub(super) fn for_encoding(encoding: Option<&str>) -> Decoder {
        let Some(encoding) = encoding.map(str::trim) else {
            return Decoder::Identity;
        };
        #[cfg(feature = "gzip")]
        if encoding.eq_ignore_ascii_case("gzip") || encoding.eq_ignore_ascii_case("x-gzip") {
            return Decoder::Gzip(flate2::write::GzDecoder::new(Vec::new()));
        }
        #[cfg(feature = "deflate")]
        if encoding.eq_ignore_ascii_case("deflate") {
            return Decoder::Deflate(flate2::write::ZlibDecoder::new(Vec::new()));
        }
        log::trace!("passing through content encoding {encoding:?}");
        Decoder::Identity
    }

    #[inline]
    pub(super) fn is_identity(&self) -> bool {
        matches!(self, Decoder::Identity)
    }

    /// Feeds encoded bytes, returning whatever decoded output is ready.
    pub(super) fn decode(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Decoder::Identity => Ok(data.to_vec()),
            #[cfg(feature = "gzip")]
            Decoder::Gzip(decoder) => {
                decoder.write_all(data)?;
                Ok(mem::take(decoder.get_mut()))
            }
            #[cfg(feature = "deflate")]
            Decoder::Deflate(decoder) => {
                decoder.write_all(data)?;
                Ok(mem::take(decoder.get_mut()))
            }
        }
    }

    /// Flushes the decoder at the end of the body. Calling it again yields
    /// nothing.
    pub(super) fn finish(&mut self) -> io::Result<Vec<u8>> {
        match mem::replace(self, Decoder::Identity) {
            Decoder::Identity => Ok(Vec::new()),
            #[cfg(feature = "gzip")]
            Decoder::Gzip(decoder) => decoder.finish(),
            #[cfg(feature = "deflate")]
            Decoder::Deflate(decoder) => decoder.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_passes_through() {
        let mut decoder = Decoder::for_encoding(None);
        assert!(decoder.is_identity());
        assert_eq!(decoder.decode(b"abc").unwrap(), b"abc");
        assert!(decoder.finish().unwrap().is_empty());

        assert!(Decoder::for_encoding(Some("br")).is_identity());
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_in_pieces() {
        use flate2::{write::GzEncoder, Compression};

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello hello hello").unwrap();
        let encoded = encoder.finish().unwrap();

        let mut decoder = Decoder::for_encoding(Some("GZIP"));
        let mut out = Vec::new();
        for piece in encoded.chunks(3) {
            out.extend(decoder.decode(piece).unwrap());
        }
        out.extend(decoder.finish().unwrap());
        assert_eq!(out, b"hello hello hello");
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn deflate_rejects_garbage() {
        let mut decoder = Decoder::for_encoding(Some("deflate"));
        let result = decoder
            .decode(b"definitely not zlib")
            .and_then(|_| decoder.finish());
        assert!(result.is_err());
    }
}
