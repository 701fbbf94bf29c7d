// Result aggregation: bundle all finished cutouts into one downloadable
// ZIP archive.

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;

use crate::core::errors::ExportError;

const ENTRY_SUFFIX: &str = "-processed";

/// Archive entry name derived from the original upload name: the original
/// stem plus a fixed suffix, always `.png` since cutouts are PNG-encoded.
/// Collisions are not de-duplicated; the last write wins.
pub fn entry_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image");
    format!("{}{}.png", stem, ENTRY_SUFFIX)
}

/// Pack finished cutouts into a ZIP archive.
///
/// `done` holds (original file name, cutout PNG bytes) for every Done item.
/// Rejected with `NothingToExport` when the list is empty; an empty archive
/// is never produced.
pub fn bundle(done: &[(String, Arc<Vec<u8>>)]) -> Result<Vec<u8>, ExportError> {
    if done.is_empty() {
        return Err(ExportError::NothingToExport);
    }

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for (file_name, png_bytes) in done {
        zip.start_file(entry_name(file_name), options)?;
        zip.write_all(png_bytes)?;
    }

    let cursor = zip.finish()?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_entries(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        let mut entries = Vec::new();
        for i in 0..zip.len() {
            let mut file = zip.by_index(i).unwrap();
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).unwrap();
            entries.push((file.name().to_string(), bytes));
        }
        entries
    }

    #[test]
    fn test_entry_name_replaces_extension() {
        assert_eq!(entry_name("portrait.jpg"), "portrait-processed.png");
        assert_eq!(entry_name("photo.final.webp"), "photo.final-processed.png");
        assert_eq!(entry_name("noext"), "noext-processed.png");
    }

    #[test]
    fn test_single_done_item_single_entry() {
        let done = vec![("cat.jpg".to_string(), Arc::new(vec![1u8, 2, 3]))];
        let archive = bundle(&done).unwrap();

        let entries = read_entries(&archive);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "cat-processed.png");
        assert_eq!(entries[0].1, vec![1u8, 2, 3]);
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let err = bundle(&[]).unwrap_err();
        assert!(matches!(err, ExportError::NothingToExport));
    }

    #[test]
    fn test_multiple_entries_preserved() {
        let done = vec![
            ("a.png".to_string(), Arc::new(vec![1u8])),
            ("b.png".to_string(), Arc::new(vec![2u8])),
        ];
        let archive = bundle(&done).unwrap();
        let entries = read_entries(&archive);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "a-processed.png");
        assert_eq!(entries[1].0, "b-processed.png");
    }
}
