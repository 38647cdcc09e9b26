use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// SHA-256 of a transformed artifact, hex encoded.
///
/// Load checkpoints are keyed by this digest: a resumed load only skips
/// batches that were confirmed for byte-identical input.
pub fn artifact_digest<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Checkpoint key for one table load: `table|digest`.
pub fn checkpoint_key(table: &str, digest: &str) -> String {
    let mut s = String::with_capacity(table.len() + digest.len() + 1);
    s.push_str(table);
    s.push('|');
    s.push_str(digest);
    s
}
