//! SHA-256 checksums of finished artifacts.

use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub fn sha256_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_str(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

/// Fails closed with a format error when the artifact no longer matches.
pub fn verify_file<P: AsRef<Path>>(path: P, expected: &str) -> Result<()> {
    let actual = sha256_file(path.as_ref())?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(Error::format(format!(
            "checksum mismatch for {:?}: expected {}, got {}",
            path.as_ref(),
            expected,
            actual
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::result_error::error::ErrorKind;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sha256_of_known_content() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "abc").unwrap();
        assert_eq!(
            sha256_file(file.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_str("abc"), sha256_file(file.path()).unwrap());
    }

    #[test]
    fn test_verify_detects_altered_bytes() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "original").unwrap();
        let checksum = sha256_file(file.path()).unwrap();
        assert!(verify_file(file.path(), &checksum).is_ok());

        std::fs::write(file.path(), "tampered").unwrap();
        let err = verify_file(file.path(), &checksum).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}
