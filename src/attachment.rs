//! File Attachments
//!
//! Files travel as ordinary encrypted messages whose plaintext is
//! `FILE:<name>:<base64data>`. The relay cannot tell them apart from text.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const FILE_PREFIX: &str = "FILE:";

/// Largest file accepted for sending
pub const MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum AttachmentError {
    #[error("File is {size} bytes, limit is {limit} MB", limit = MAX_FILE_BYTES / (1024 * 1024))]
    TooLarge { size: u64 },
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Decrypted message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plaintext {
    Text(String),
    File { name: String, data: Vec<u8> },
    /// Started with the file prefix but could not be decoded
    MalformedFile { reason: String },
}

impl Plaintext {
    pub fn parse(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let Some(rest) = text.strip_prefix(FILE_PREFIX) else {
            return Plaintext::Text(text.into_owned());
        };
        let Some((name, encoded)) = rest.split_once(':') else {
            return Plaintext::MalformedFile {
                reason: "missing file name separator".to_string(),
            };
        };
        match BASE64.decode(encoded.trim()) {
            Ok(data) => Plaintext::File {
                name: name.to_string(),
                data,
            },
            Err(e) => Plaintext::MalformedFile {
                reason: format!("invalid base64: {}", e),
            },
        }
    }
}

/// Build the plaintext for a file message
pub fn encode_file(name: &str, data: &[u8]) -> Result<Vec<u8>, AttachmentError> {
    let size = data.len() as u64;
    if size > MAX_FILE_BYTES {
        return Err(AttachmentError::TooLarge { size });
    }
    Ok(format!("{}{}:{}", FILE_PREFIX, sanitize_filename(name), BASE64.encode(data)).into_bytes())
}

/// Read a file for sending, checking the size limit before reading it
pub fn load_file(path: &Path) -> Result<(String, Vec<u8>), AttachmentError> {
    let io_err = |source| AttachmentError::Io {
        path: path.to_path_buf(),
        source,
    };
    let size = std::fs::metadata(path).map_err(io_err)?.len();
    if size > MAX_FILE_BYTES {
        return Err(AttachmentError::TooLarge { size });
    }
    let data = std::fs::read(path).map_err(io_err)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    Ok((name, data))
}

/// Replace characters that are unsafe in file names
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "attachment".to_string(),
        _ => cleaned,
    }
}

/// Write a received file into `dir`, or a fresh temp directory when unset.
/// Returns the written path.
pub fn save_attachment(
    dir: Option<&Path>,
    name: &str,
    data: &[u8],
) -> Result<PathBuf, AttachmentError> {
    let dir = match dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::temp_dir().join(format!("ghostcat-{}", Uuid::new_v4())),
    };
    std::fs::create_dir_all(&dir).map_err(|source| AttachmentError::Io {
        path: dir.clone(),
        source,
    })?;

    let path = dir.join(sanitize_filename(name));
    std::fs::write(&path, data).map_err(|source| AttachmentError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_passthrough() {
        assert_eq!(
            Plaintext::parse(b"hello there"),
            Plaintext::Text("hello there".to_string())
        );
    }

    #[test]
    fn test_file_payload() {
        let encoded = encode_file("cat.png", &[0x89, 0x50, 0x4e, 0x47]).unwrap();
        assert!(encoded.starts_with(b"FILE:cat.png:"));
        assert_eq!(
            Plaintext::parse(&encoded),
            Plaintext::File {
                name: "cat.png".to_string(),
                data: vec![0x89, 0x50, 0x4e, 0x47]
            }
        );
    }

    #[test]
    fn test_malformed_file_payload() {
        assert!(matches!(
            Plaintext::parse(b"FILE:no-separator"),
            Plaintext::MalformedFile { .. }
        ));
        assert!(matches!(
            Plaintext::parse(b"FILE:x.bin:***"),
            Plaintext::MalformedFile { .. }
        ));
    }

    #[test]
    fn test_file_name_with_colon_is_sanitized() {
        let encoded = encode_file("a:b.txt", b"x").unwrap();
        assert!(matches!(
            Plaintext::parse(&encoded),
            Plaintext::File { name, .. } if name == "a_b.txt"
        ));
    }

    #[test]
    fn test_size_limit() {
        let big = vec![0u8; MAX_FILE_BYTES as usize + 1];
        assert!(matches!(
            encode_file("big.bin", &big),
            Err(AttachmentError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename(r#"a\b/c:d*e?f"g<h>i|j"#), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_filename(".."), "attachment");
        assert_eq!(sanitize_filename(""), "attachment");
        assert_eq!(sanitize_filename("photo.jpg"), "photo.jpg");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_attachment(Some(dir.path()), "../note.txt", b"contents").unwrap();
        assert_eq!(path, dir.path().join(".._note.txt"));

        let (name, data) = load_file(&path).unwrap();
        assert_eq!(name, ".._note.txt");
        assert_eq!(data, b"contents");
    }

    #[test]
    fn test_save_to_fresh_temp_dir() {
        let path = save_attachment(None, "hello.txt", b"hi").unwrap();
        assert!(path.ends_with("hello.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hi");
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
