//! Stream decompression operators.

use super::{Availability, ByteStream, Resource, ResourceKind, Streamable};
use anyhow::{Context, Result};
use std::fmt;

macro_rules! decoder_operator {
    ($(#[$doc:meta])* $name:ident, $label:literal, |$stream:ident| $open:expr) => {
        $(#[$doc])*
        pub struct $name<S> {
            input: S,
        }

        impl<S: Streamable> $name<S> {
            pub fn new(input: S) -> Self {
                Self { input }
            }
        }

        impl<S: Streamable> fmt::Display for $name<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}()", self.input, $label)
            }
        }

        impl<S: Streamable> Resource for $name<S> {
            fn kind(&self) -> ResourceKind {
                ResourceKind::Stream
            }

            fn availability(&self) -> Availability {
                self.input.availability().chained()
            }
        }

        impl<S: Streamable> Streamable for $name<S> {
            fn open(&self) -> Result<ByteStream> {
                let $stream = self.input.open()?;
                let decoded: ByteStream = $open;
                Ok(decoded)
            }
        }
    };
}

decoder_operator!(
    /// Multi-member gzip decoding.
    Gunzip,
    "decompress_gzip",
    |stream| Box::new(flate2::read::MultiGzDecoder::new(stream))
);

decoder_operator!(
    /// Multi-stream bzip2 decoding.
    Bunzip2,
    "decompress_bz2",
    |stream| Box::new(bzip2::read::MultiBzDecoder::new(stream))
);

decoder_operator!(
    /// LZ4 frame decoding.
    Lz4Decode,
    "decompress_lz4",
    |stream| Box::new(lz4::Decoder::new(stream).context("Failed to start lz4 frame decoder")?)
);

decoder_operator!(
    /// Zstandard decoding (concatenated and skippable frames included).
    ZstdDecode,
    "decompress_zstd",
    |stream| Box::new(zstd::stream::read::Decoder::new(stream).context("Failed to start zstd decoder")?)
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fio::{Bytes, File, StreamExt};
    use std::io::{Read, Write};

    fn read_all(handle: &dyn Streamable) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        handle.open()?.read_to_end(&mut out)?;
        Ok(out)
    }

    fn gzip(data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    #[test]
    fn test_gunzip_multi_member() -> Result<()> {
        let mut data = gzip(b"first ")?;
        data.extend(gzip(b"second")?);
        let handle = Bytes::new(data).decompress_gzip();
        assert_eq!(read_all(&handle)?, b"first second");
        Ok(())
    }

    #[test]
    fn test_bunzip2() -> Result<()> {
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(b"bz2 payload")?;
        let handle = Bytes::new(encoder.finish()?).decompress_bz2();
        assert_eq!(read_all(&handle)?, b"bz2 payload");
        Ok(())
    }

    #[test]
    fn test_lz4_frame() -> Result<()> {
        let mut encoder = lz4::EncoderBuilder::new().build(Vec::new())?;
        encoder.write_all(b"lz4 payload")?;
        let (data, result) = encoder.finish();
        result?;
        let handle = Bytes::new(data).decompress_lz4();
        assert_eq!(read_all(&handle)?, b"lz4 payload");
        Ok(())
    }

    #[test]
    fn test_zstd() -> Result<()> {
        let data = zstd::encode_all(&b"zstd payload"[..], 3)?;
        let handle = Bytes::new(data).decompress_zstd();
        assert_eq!(read_all(&handle)?, b"zstd payload");
        Ok(())
    }

    #[test]
    fn test_availability_chains() {
        let missing = File::new("/nonexistent/corpusio/data.gz").decompress_gzip();
        assert_eq!(missing.availability(), Availability::Unavailable);
        let present = Bytes::from("x").decompress_gzip();
        assert_eq!(present.availability(), Availability::Procurable);
    }
}
