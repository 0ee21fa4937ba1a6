use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};

/// Size of the buffer used when streaming files to disk or through a hasher.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Digest families the manifest may declare, told apart by hex length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Md5,
    Sha256,
}

impl DigestKind {
    pub fn detect(hash: &str) -> Option<Self> {
        if !hash.chars().all(|x| x.is_ascii_hexdigit()) {
            return None;
        }
        match hash.len() {
            32 => Some(Self::Md5),
            64 => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// SHA-256 of the whole file as lowercase hex.
pub fn sha256_file_blocking(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// [`sha256_file_blocking`] on a blocking worker.
pub async fn sha256_file(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file_blocking(&path))
        .await
        .map_err(io::Error::other)?
}

fn md5_file_blocking(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.finalize()))
}

/// Whether the file matches a manifest-declared digest. Digests of an
/// unrecognised shape never match.
pub async fn matches_declared_hash(path: &Path, declared: &str) -> io::Result<bool> {
    let Some(kind) = DigestKind::detect(declared) else {
        return Ok(false);
    };
    let path: PathBuf = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || match kind {
        DigestKind::Md5 => md5_file_blocking(&path),
        DigestKind::Sha256 => sha256_file_blocking(&path),
    })
    .await
    .map_err(io::Error::other)??;
    Ok(actual.eq_ignore_ascii_case(declared))
}
