use crate::batch::{BatchRow, RowStatus};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub out_path: String,
    pub entries: Vec<String>,
    pub missing: usize,
    pub file_bytes: u64,
}

/// Zips the file of every downloaded row that still exists on disk.
///
/// Entry names are the file basenames; a repeated name gets `_1`, `_2`, ...
/// before its extension.
pub fn write_downloads_archive(rows: &[BatchRow], out_path: &Path) -> Result<ArchiveSummary> {
    let files: Vec<&PathBuf> = rows
        .iter()
        .filter(|row| row.status == RowStatus::Downloaded)
        .filter_map(|row| row.output_path.as_ref())
        .collect();

    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = std::fs::File::create(out_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut used = BTreeSet::new();
    let mut entries = Vec::new();
    let mut missing = 0_usize;
    for path in files {
        if !path.is_file() {
            tracing::warn!(path = %path.to_string_lossy(), "downloaded file is gone; leaving it out of the archive");
            missing += 1;
            continue;
        }
        let name = unique_entry_name(path, &mut used);
        zip.start_file(name.as_str(), options).map_err(zip_err_to_io)?;
        let mut src = std::fs::File::open(path)?;
        std::io::copy(&mut src, &mut zip)?;
        entries.push(name);
    }

    let mut file = zip.finish().map_err(zip_err_to_io)?;
    file.flush()?;

    let file_bytes = std::fs::metadata(out_path).map(|m| m.len()).unwrap_or(0);
    tracing::info!(entries = entries.len(), missing, "wrote archive {}", out_path.to_string_lossy());
    Ok(ArchiveSummary {
        out_path: out_path.to_string_lossy().to_string(),
        entries,
        missing,
        file_bytes,
    })
}

fn unique_entry_name(path: &Path, used: &mut BTreeSet<String>) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut candidate = format!("{stem}{ext}");
    let mut n = 1;
    while used.contains(&candidate) {
        candidate = format!("{stem}_{n}{ext}");
        n += 1;
    }
    used.insert(candidate.clone());
    candidate
}

fn zip_err_to_io(err: zip::result::ZipError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn row(index: usize, status: RowStatus, path: Option<PathBuf>) -> BatchRow {
        BatchRow {
            index,
            values: Vec::new(),
            status,
            detail: String::new(),
            output_path: path,
            processed_at: None,
        }
    }

    #[test]
    fn archive_holds_downloaded_files_with_unique_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).expect("mkdir");
        std::fs::create_dir_all(&b).expect("mkdir");
        std::fs::write(a.join("clip.mp4"), b"first").expect("write");
        std::fs::write(b.join("clip.mp4"), b"second").expect("write");
        std::fs::write(a.join("failed.mp4"), b"nope").expect("write");

        let rows = vec![
            row(1, RowStatus::Downloaded, Some(a.join("clip.mp4"))),
            row(2, RowStatus::Downloaded, Some(b.join("clip.mp4"))),
            row(3, RowStatus::Failed, Some(a.join("failed.mp4"))),
            row(4, RowStatus::Downloaded, Some(dir.path().join("gone.mp4"))),
            row(5, RowStatus::Skipped, None),
        ];
        let out = dir.path().join("out").join("downloads.zip");
        let summary = write_downloads_archive(&rows, &out).expect("archive");

        assert_eq!(summary.entries, vec!["clip.mp4", "clip_1.mp4"]);
        assert_eq!(summary.missing, 1);
        assert!(summary.file_bytes > 0);

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&out).expect("open")).expect("zip");
        assert_eq!(archive.len(), 2);
        let mut text = String::new();
        archive
            .by_name("clip_1.mp4")
            .expect("entry")
            .read_to_string(&mut text)
            .expect("read");
        assert_eq!(text, "second");
    }

    #[test]
    fn suffixes_skip_names_already_taken() {
        let mut used = BTreeSet::new();
        assert_eq!(unique_entry_name(Path::new("x/v.mp3"), &mut used), "v.mp3");
        assert_eq!(unique_entry_name(Path::new("y/v.mp3"), &mut used), "v_1.mp3");
        assert_eq!(unique_entry_name(Path::new("z/v.mp3"), &mut used), "v_2.mp3");
        assert_eq!(unique_entry_name(Path::new("z/noext"), &mut used), "noext");
    }
}
