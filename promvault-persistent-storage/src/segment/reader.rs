use flate2::read::MultiGzDecoder;
use promvault_core::storage::PersistentStorageError;
use promvault_core::Sample;
use std::io::Read;
use std::path::Path;
use tracing::warn;

use super::record::decode_line;

/// Read every record of a segment, in append order.
///
/// Accepts plain (`.jsonl`) and gzip-compressed (`.gz`) segments. An
/// unterminated last line is a record torn by a crash and is skipped; any
/// other undecodable line is reported as `CorruptRecord`.
pub async fn read_segment(path: &Path) -> Result<Vec<Sample>, PersistentStorageError> {
    let raw = tokio::fs::read(path).await.map_err(|e| {
        PersistentStorageError::Io(format!("read segment {} failed: {}", path.display(), e))
    })?;

    let text = if path.extension().is_some_and(|ext| ext == "gz") {
        let inflated = tokio::task::spawn_blocking(move || {
            let mut out = String::new();
            MultiGzDecoder::new(raw.as_slice())
                .read_to_string(&mut out)
                .map(|_| out)
        })
        .await
        .map_err(|e| PersistentStorageError::Other(format!("decompress task failed: {}", e)))?;
        inflated.map_err(|e| {
            PersistentStorageError::Io(format!("decompress segment {} failed: {}", path.display(), e))
        })?
    } else {
        String::from_utf8(raw).map_err(|e| PersistentStorageError::CorruptRecord {
            path: path.display().to_string(),
            line: 0,
            reason: format!("segment is not utf-8: {}", e),
        })?
    };

    parse_records(path, &text)
}

fn parse_records(path: &Path, text: &str) -> Result<Vec<Sample>, PersistentStorageError> {
    let terminated = text.is_empty() || text.ends_with('\n');
    let lines: Vec<&str> = text.lines().collect();
    let mut samples = Vec::with_capacity(lines.len());

    for (idx, line) in lines.iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        match decode_line(line) {
            Ok(sample) => samples.push(sample),
            Err(e) if !terminated && idx + 1 == lines.len() => {
                warn!(
                    target = "segment",
                    file = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping torn record at end of segment"
                );
            }
            Err(e) => {
                return Err(PersistentStorageError::CorruptRecord {
                    path: path.display().to_string(),
                    line: idx + 1,
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(samples)
}
