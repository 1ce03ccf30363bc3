//! Gzip encoding for cached response bodies

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

/// Content-Encoding value of every cached body.
pub const ENCODING: &str = "gzip";

#[derive(Debug, Clone, Copy)]
pub struct Gzip {
    level: u32,
}

impl Gzip {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn compress(&self, data: &[u8]) -> std::io::Result<Bytes> {
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(data.len() / 2 + 64),
            Compression::new(self.level),
        );
        encoder.write_all(data)?;
        Ok(Bytes::from(encoder.finish()?))
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self::new(6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_compress_is_valid_gzip() {
        let data = b"body { color: red; } body { color: red; } body { color: red; }";
        let compressed = Gzip::default().compress(data).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

        let mut decoded = Vec::new();
        GzDecoder::new(&compressed[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_level_is_clamped() {
        assert_eq!(Gzip::new(42).level(), 9);
    }
}
