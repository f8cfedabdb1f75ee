use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

pub fn sha256_file_hex(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    sha256_reader_hex(&mut file).with_context(|| format!("Failed to hash {}", path.display()))
}

pub fn sha256_reader_hex<R: Read>(reader: &mut R) -> Result<String> {
    let mut h = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader.read(&mut buf).context("Failed to read while hashing")?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(hex::encode(h.finalize()))
}

/// Write `<hex>  <name>` lines, the format `sha256sum -c` understands.
pub fn write_checksums_file(hashes: &[(String, String)], output_path: impl AsRef<Path>) -> Result<()> {
    let output_path = output_path.as_ref();
    let mut out = File::create(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;

    for (hash_hex, name) in hashes {
        writeln!(out, "{}  {}", hash_hex, name)?;
    }
    out.flush()?;

    Ok(())
}

pub fn read_checksums_file(path: impl AsRef<Path>) -> Result<Vec<(String, String)>> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut out = Vec::new();

    for line in BufReader::new(f).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (hash, name) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| anyhow!("Invalid checksum line: {}", line))?;
        out.push((hash.to_string(), name.trim_start().to_string()));
    }

    Ok(out)
}

/// Re-hash every archive listed in `checksums_file`; names resolve against
/// the checksum file's directory. Returns the number of archives verified.
pub fn verify_checksums(checksums_file: impl AsRef<Path>) -> Result<usize> {
    let checksums_file = checksums_file.as_ref();
    let root = checksums_file.parent().unwrap_or_else(|| Path::new("."));

    let entries = read_checksums_file(checksums_file)?;
    for (expected, name) in &entries {
        let path = root.join(name);
        let actual = sha256_file_hex(&path)?;
        if &actual != expected {
            return Err(anyhow!(
                "Hash mismatch for {} (expected {}, got {})",
                path.display(),
                expected,
                actual
            ));
        }
    }

    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn known_digest() -> Result<()> {
        let mut data: &[u8] = b"abc";
        assert_eq!(
            sha256_reader_hex(&mut data)?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }

    #[test]
    fn checksum_file_verifies_and_detects_tampering() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let archive = dir.path().join("pkg_001.zip");
        fs::write(&archive, b"archive bytes")?;

        let sums = dir.path().join("pkg.sha256");
        write_checksums_file(&[(sha256_file_hex(&archive)?, "pkg_001.zip".to_string())], &sums)?;
        assert_eq!(verify_checksums(&sums)?, 1);

        fs::write(&archive, b"tampered")?;
        assert!(verify_checksums(&sums).is_err());
        Ok(())
    }
}
