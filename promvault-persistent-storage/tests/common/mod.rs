use flate2::read::MultiGzDecoder;
use promvault_core::{Labels, Sample};
use promvault_persistent_storage::{BackendConfig, CloudStore, LocalBackend};
use std::io::Read;
use std::path::Path;

/// Sample with a metric name and extra label pairs.
pub fn make_sample(ts_ms: i64, value: f64, name: &str, pairs: &[(&str, &str)]) -> Sample {
    let mut labels: Labels = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    labels.insert("__name__".to_string(), name.to_string());
    Sample::from_millis(ts_ms, value, labels).expect("valid timestamp")
}

/// Object store rooted at a local directory (opendal `fs`).
pub fn fs_store(root: &Path) -> CloudStore {
    CloudStore::new(BackendConfig::Local {
        backend: LocalBackend::Fs,
        root: root.display().to_string(),
    })
    .expect("fs cloud store")
}

/// Inflate a gzip object and return its JSON lines.
pub fn gunzip_lines(bytes: &[u8]) -> Vec<String> {
    let mut out = String::new();
    MultiGzDecoder::new(bytes)
        .read_to_string(&mut out)
        .expect("valid gzip");
    out.lines().map(str::to_string).collect()
}

/// Names of the entries in `dir`, sorted.
pub async fn list_dir(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(mut rd) = tokio::fs::read_dir(dir).await else {
        return names;
    };
    while let Some(entry) = rd.next_entry().await.expect("read dir entry") {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    names
}
