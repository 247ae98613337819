//! Canonical encodings for certificates.
//!
//! Two encodings are used:
//! - **Canonical CBOR**: the byte form hashed into a publication payload.
//!   Struct fields are emitted in declaration order, so a certificate always
//!   encodes to the same bytes.
//! - **Pretty JSON**: the on-disk birth certificate, readable by operators and
//!   third-party verifiers.
//!
//! ## Canonicalization rules checked on every encode (RFC 8949 Section 4.2)
//! 1. No indefinite-length items
//! 2. Integers and lengths in their shortest form
//! 3. Exactly one top-level item, no trailing bytes

use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("CBOR encoding error: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("CBOR decoding error: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("non-canonical CBOR: {0}")]
    NonCanonical(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SerializationError>;

/// Serialize a value to canonical CBOR bytes.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    verify_canonical(&buf)?;
    Ok(buf)
}

/// Deserialize a value from canonical CBOR bytes.
pub fn from_canonical_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    verify_canonical(bytes)?;
    let value = ciborium::from_reader(bytes)?;
    Ok(value)
}

/// Serialize to indented JSON (certificate file format).
pub fn to_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    Ok(serde_json::from_str(json)?)
}

/// Write `bytes` to `path` so readers see either the old file or the complete
/// new one: write a sibling temp file, fsync, then rename over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    Ok(replace_file(path, bytes, None)?)
}

/// [`write_atomic`] with explicit Unix permission bits for the new file
/// (ignored on other platforms). Used for key material.
pub fn write_atomic_with_mode(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    replace_file(path, bytes, Some(mode))
}

fn replace_file(path: &Path, bytes: &[u8], mode: Option<u32>) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(format!(".tmp.{}", std::process::id()));
    let tmp_path = path.with_file_name(tmp_name);

    // A stale temp file would keep its old permissions.
    let _ = fs::remove_file(&tmp_path);

    let result = (|| -> io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            if let Some(mode) = mode {
                options.mode(mode);
            }
        }
        #[cfg(not(unix))]
        let _ = mode;
        let mut tmp = options.open(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Verify that CBOR bytes are in canonical form.
fn verify_canonical(bytes: &[u8]) -> Result<()> {
    let mut cursor = io::Cursor::new(bytes);
    verify_canonical_item(&mut cursor)?;
    if cursor.position() as usize != bytes.len() {
        return Err(SerializationError::NonCanonical("trailing bytes after top-level item"));
    }
    Ok(())
}

fn read_be<R: Read, const N: usize>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn verify_canonical_item<R: Read>(reader: &mut R) -> Result<()> {
    let mut head = [0u8; 1];
    reader.read_exact(&mut head)?;

    let major_type = head[0] >> 5;
    let additional_info = head[0] & 0x1F;

    if additional_info == 31 {
        return Err(SerializationError::NonCanonical("indefinite-length encoding"));
    }

    // Major type 7 carries floats and simple values in its argument bytes;
    // they are not lengths and have no shortest-form rule here.
    if major_type == 7 {
        let skip = match additional_info {
            24 => 1,
            25 => 2,
            26 => 4,
            27 => 8,
            _ => 0,
        };
        let mut buf = vec![0u8; skip];
        reader.read_exact(&mut buf)?;
        return Ok(());
    }

    let (argument, minimum) = match additional_info {
        0..=23 => (u64::from(additional_info), 0),
        24 => (read_be::<_, 1>(reader)?, 24),
        25 => (read_be::<_, 2>(reader)?, 0x100),
        26 => (read_be::<_, 4>(reader)?, 0x1_0000),
        27 => (read_be::<_, 8>(reader)?, 0x1_0000_0000),
        _ => return Err(SerializationError::NonCanonical("reserved additional info")),
    };
    if argument < minimum {
        return Err(SerializationError::NonCanonical("non-minimal integer or length"));
    }

    match major_type {
        0 | 1 => {}
        2 | 3 => {
            let copied = io::copy(&mut reader.by_ref().take(argument), &mut io::sink())?;
            if copied != argument {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated string").into());
            }
        }
        4 => {
            for _ in 0..argument {
                verify_canonical_item(reader)?;
            }
        }
        5 => {
            for _ in 0..argument {
                verify_canonical_item(reader)?; // Key
                verify_canonical_item(reader)?; // Value
            }
        }
        6 => verify_canonical_item(reader)?,
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestStruct {
        a: u64,
        b: String,
        c: Vec<String>,
    }

    fn sample() -> TestStruct {
        TestStruct {
            a: 12345,
            b: "test".to_string(),
            c: vec!["/proc".to_string(), "*.log".to_string()],
        }
    }

    #[test]
    fn test_canonical_serialization_deterministic() {
        let bytes1 = to_canonical_cbor(&sample()).unwrap();
        let bytes2 = to_canonical_cbor(&sample()).unwrap();
        assert_eq!(bytes1, bytes2, "Serialization must be deterministic");
    }

    #[test]
    fn test_canonical_deserialization() {
        let bytes = to_canonical_cbor(&sample()).unwrap();
        let decoded: TestStruct = from_canonical_cbor(&bytes).unwrap();
        assert_eq!(sample(), decoded);
    }

    #[test]
    fn test_rejects_indefinite_length() {
        // Indefinite-length array containing 1, then break.
        let bytes = [0x9f, 0x01, 0xff];
        assert!(matches!(
            verify_canonical(&bytes),
            Err(SerializationError::NonCanonical(_))
        ));
    }

    #[test]
    fn test_rejects_non_minimal_integer() {
        // 5 encoded with a one-byte argument instead of inline.
        let bytes = [0x18, 0x05];
        assert!(matches!(
            verify_canonical(&bytes),
            Err(SerializationError::NonCanonical(_))
        ));
        assert!(verify_canonical(&[0x05]).is_ok());
        assert!(verify_canonical(&[0x18, 0x18]).is_ok());
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        assert!(matches!(
            verify_canonical(&[0x01, 0x02]),
            Err(SerializationError::NonCanonical(_))
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let json = to_json_pretty(&sample()).unwrap();
        assert!(json.contains('\n'));
        let decoded: TestStruct = from_json(&json).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cert.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1, "temp file must not be left behind");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_with_mode_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.bin");
        write_atomic(&path, b"old").unwrap();
        write_atomic_with_mode(&path, b"new", 0o600).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_atomic_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("cert.json");
        assert!(matches!(write_atomic(&path, b"x"), Err(SerializationError::Io(_))));
    }
}
