use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use flate2::bufread::GzDecoder;

pub fn is_gzipped(header: &[u8]) -> bool {
    header.starts_with(b"\x1f\x8b")
}

/// Open `path` for buffered reading, decompressing it on the fly if it
/// starts with the gzip magic bytes.
pub fn open_maybe_gzipped<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn BufRead + Send>> {
    let mut handle = BufReader::new(fs::File::open(path)?);
    let header = handle.fill_buf()?;
    if is_gzipped(header) {
        Ok(Box::new(BufReader::new(GzDecoder::new(handle))))
    } else {
        Ok(Box::new(handle))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Read, Write};

    #[test]
    fn reads_plain_and_gzipped() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.txt");
        fs::write(&plain, b"hello").unwrap();

        let packed = dir.path().join("packed.txt.gz");
        let mut encoder = GzEncoder::new(fs::File::create(&packed).unwrap(), Compression::default());
        encoder.write_all(b"hello").unwrap();
        encoder.finish().unwrap();

        for path in [plain, packed] {
            let mut text = String::new();
            open_maybe_gzipped(&path).unwrap().read_to_string(&mut text).unwrap();
            assert_eq!(text, "hello");
        }
        assert!(!is_gzipped(b"<?xml"));
    }
}
