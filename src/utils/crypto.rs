use anyhow::Result;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Checksums `path` with the algorithm implied by the expected digest length:
/// 40 hex chars is SHA-1, 64 is SHA-256, 128 is SHA-512.
pub fn calculate_file_checksum(path: &Path, expected_len: usize) -> Result<String> {
    let mut file = File::open(path)?;
    match expected_len {
        40 => digest_reader::<Sha1>(&mut file),
        64 => digest_reader::<Sha256>(&mut file),
        128 => digest_reader::<Sha512>(&mut file),
        _ => Err(anyhow::anyhow!(
            "Unsupported checksum length: {}. Expected 40 (SHA-1), 64 (SHA-256), or 128 (SHA-512).",
            expected_len
        )),
    }
}

fn digest_reader<D: Digest>(reader: &mut impl Read) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = [0; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_file_checksum_by_length() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        let sha1 = calculate_file_checksum(f.path(), 40).unwrap();
        assert_eq!(sha1, "a9993e364706816aba3e25717850c26c9cd0d89d");
        let sha256 = calculate_file_checksum(f.path(), 64).unwrap();
        assert_eq!(sha256, sha256_hex(b"abc"));
        assert!(calculate_file_checksum(f.path(), 10).is_err());
    }
}
