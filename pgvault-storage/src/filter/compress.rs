//! Streaming compression codecs.
//!
//! Encoders and decoders from the codec crates are write-based; each filter
//! points its codec at a shared buffer and drains that buffer into the
//! filter output after every block. The lz4 crate only decodes from a
//! reader, so lz4 decompression collects its input and decodes on finish.

use std::io::Write;
use std::sync::{Arc, Mutex};

use pgvault_api_types::{CompressType, Error, ErrorKind, Result};
use pgvault_protocol::Value;

use super::Filter;

pub const COMPRESS_FILTER: &str = "compress";
pub const DECOMPRESS_FILTER: &str = "decompress";

/// Default level per codec, tuned for backup throughput over ratio.
pub fn default_level(compress_type: CompressType) -> i32 {
    match compress_type {
        CompressType::None => 0,
        CompressType::Gz => 6,
        CompressType::Bz2 => 9,
        CompressType::Lz4 => 1,
        CompressType::Zst => 3,
    }
}

/// Shared sink the codec writes into; the filter drains it after each block.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn drain(&self, out: &mut Vec<u8>) {
        let mut buf = self.0.lock().unwrap();
        out.append(&mut buf);
    }
}

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum Encoder {
    Gz(flate2::write::GzEncoder<SharedBuf>),
    Bz2(bzip2::write::BzEncoder<SharedBuf>),
    Lz4(Box<lz4::Encoder<SharedBuf>>),
    Zst(zstd::stream::write::Encoder<'static, SharedBuf>),
}

pub struct CompressFilter {
    encoder: Option<Encoder>,
    buf: SharedBuf,
}

fn codec_err(what: &str, err: std::io::Error) -> Error {
    Error::new(ErrorKind::Format, format!("{what}: {err}"))
}

impl CompressFilter {
    pub fn new(compress_type: CompressType, level: Option<i32>) -> Result<Self> {
        let level = level.unwrap_or_else(|| default_level(compress_type));
        let buf = SharedBuf::default();

        let encoder = match compress_type {
            CompressType::None => {
                return Err(Error::assert("compress filter requires a compression type"))
            }
            CompressType::Gz => Encoder::Gz(flate2::write::GzEncoder::new(
                buf.clone(),
                flate2::Compression::new(level.clamp(0, 9) as u32),
            )),
            CompressType::Bz2 => Encoder::Bz2(bzip2::write::BzEncoder::new(
                buf.clone(),
                bzip2::Compression::new(level.clamp(1, 9) as u32),
            )),
            CompressType::Lz4 => Encoder::Lz4(Box::new(
                lz4::EncoderBuilder::new()
                    .level(level.clamp(0, 16) as u32)
                    .build(buf.clone())
                    .map_err(|err| codec_err("lz4 encoder", err))?,
            )),
            CompressType::Zst => Encoder::Zst(
                zstd::stream::write::Encoder::new(buf.clone(), level)
                    .map_err(|err| codec_err("zst encoder", err))?,
            ),
        };

        Ok(Self {
            encoder: Some(encoder),
            buf,
        })
    }
}

impl Filter for CompressFilter {
    fn name(&self) -> &'static str {
        COMPRESS_FILTER
    }

    fn process(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| Error::assert("compress filter already finished"))?;

        let result = match encoder {
            Encoder::Gz(encoder) => encoder.write_all(input),
            Encoder::Bz2(encoder) => encoder.write_all(input),
            Encoder::Lz4(encoder) => encoder.write_all(input),
            Encoder::Zst(encoder) => encoder.write_all(input),
        };

        result.map_err(|err| codec_err("compress", err))?;
        self.buf.drain(out);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<Value> {
        match self
            .encoder
            .take()
            .ok_or_else(|| Error::assert("compress filter already finished"))?
        {
            Encoder::Gz(encoder) => {
                encoder.finish().map_err(|err| codec_err("compress", err))?;
            }
            Encoder::Bz2(encoder) => {
                encoder.finish().map_err(|err| codec_err("compress", err))?;
            }
            Encoder::Lz4(encoder) => {
                let (_, result) = encoder.finish();
                result.map_err(|err| codec_err("compress", err))?;
            }
            Encoder::Zst(encoder) => {
                encoder.finish().map_err(|err| codec_err("compress", err))?;
            }
        }

        self.buf.drain(out);
        Ok(Value::Null)
    }
}

enum Decoder {
    Gz(flate2::write::GzDecoder<SharedBuf>),
    Bz2(bzip2::write::BzDecoder<SharedBuf>),
    /// No write-side lz4 decoder exists; input is collected and decoded on
    /// finish.
    Lz4(Vec<u8>),
    Zst(zstd::stream::write::Decoder<'static, SharedBuf>),
}

pub struct DecompressFilter {
    decoder: Option<Decoder>,
    buf: SharedBuf,
}

impl DecompressFilter {
    pub fn new(compress_type: CompressType) -> Result<Self> {
        let buf = SharedBuf::default();

        let decoder = match compress_type {
            CompressType::None => {
                return Err(Error::assert("decompress filter requires a compression type"))
            }
            CompressType::Gz => Decoder::Gz(flate2::write::GzDecoder::new(buf.clone())),
            CompressType::Bz2 => Decoder::Bz2(bzip2::write::BzDecoder::new(buf.clone())),
            CompressType::Lz4 => Decoder::Lz4(Vec::new()),
            CompressType::Zst => Decoder::Zst(
                zstd::stream::write::Decoder::new(buf.clone())
                    .map_err(|err| codec_err("zst decoder", err))?,
            ),
        };

        Ok(Self {
            decoder: Some(decoder),
            buf,
        })
    }
}

impl Filter for DecompressFilter {
    fn name(&self) -> &'static str {
        DECOMPRESS_FILTER
    }

    fn process(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| Error::assert("decompress filter already finished"))?;

        match decoder {
            Decoder::Gz(decoder) => decoder
                .write_all(input)
                .map_err(|err| codec_err("decompress", err))?,
            Decoder::Bz2(decoder) => decoder
                .write_all(input)
                .map_err(|err| codec_err("decompress", err))?,
            Decoder::Lz4(pending) => pending.extend_from_slice(input),
            Decoder::Zst(decoder) => decoder
                .write_all(input)
                .map_err(|err| codec_err("decompress", err))?,
        }

        self.buf.drain(out);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<Value> {
        match self
            .decoder
            .take()
            .ok_or_else(|| Error::assert("decompress filter already finished"))?
        {
            Decoder::Gz(decoder) => {
                decoder.finish().map_err(|err| codec_err("decompress", err))?;
            }
            Decoder::Bz2(mut decoder) => {
                decoder.finish().map_err(|err| codec_err("decompress", err))?;
            }
            Decoder::Lz4(pending) => {
                let mut decoder = lz4::Decoder::new(&pending[..])
                    .map_err(|err| codec_err("decompress", err))?;
                std::io::copy(&mut decoder, &mut self.buf)
                    .map_err(|err| codec_err("decompress", err))?;
            }
            Decoder::Zst(mut decoder) => {
                decoder.flush().map_err(|err| codec_err("decompress", err))?;
            }
        }

        self.buf.drain(out);
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(compress_type: CompressType) {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut compress = CompressFilter::new(compress_type, None).unwrap();
        let mut compressed = Vec::new();

        for chunk in data.chunks(8192) {
            compress.process(chunk, &mut compressed).unwrap();
        }
        compress.finish(&mut compressed).unwrap();

        assert!(compressed.len() < data.len());

        let mut decompress = DecompressFilter::new(compress_type).unwrap();
        let mut output = Vec::new();

        // Feed with block boundaries unrelated to the compressor's.
        for chunk in compressed.chunks(1000) {
            decompress.process(chunk, &mut output).unwrap();
        }
        decompress.finish(&mut output).unwrap();

        assert_eq!(output, data);
    }

    #[test]
    fn gz_round_trip() {
        round_trip(CompressType::Gz);
    }

    #[test]
    fn bz2_round_trip() {
        round_trip(CompressType::Bz2);
    }

    #[test]
    fn lz4_round_trip() {
        round_trip(CompressType::Lz4);
    }

    #[test]
    fn zst_round_trip() {
        round_trip(CompressType::Zst);
    }

    #[test]
    fn corrupt_gz_input_fails() {
        let mut decompress = DecompressFilter::new(CompressType::Gz).unwrap();
        let mut output = Vec::new();

        let mut failed = decompress.process(b"this is not gzip data", &mut output).is_err();
        failed = failed || decompress.finish(&mut output).is_err();
        assert!(failed);
    }
}
