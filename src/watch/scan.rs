use std::path::PathBuf;

use jwalk::WalkDir;

use super::debouncer::is_temp_file;
use crate::utils::path::{has_extension, normalize_path};

/// Every watched file under `roots`, normalized, sorted and deduplicated.
///
/// Missing roots are skipped.
pub fn scan_files(roots: &[PathBuf], extensions: &[String]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = roots
        .iter()
        .filter(|root| root.is_dir())
        .flat_map(|root| {
            WalkDir::new(root)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .map(|e| e.path())
                .filter(|p| !is_temp_file(p) && has_extension(p, extensions))
                .map(|p| normalize_path(&p))
                .collect::<Vec<_>>()
        })
        .collect();
    files.sort();
    files.dedup();
    files
}
