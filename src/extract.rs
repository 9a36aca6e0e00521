//! Unpacks a downloaded snapshot archive into a directory.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tar::Archive;

use crate::error::SnapshotError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Extracts a snapshot archive (plain tar or gzip-compressed) into `target_dir`.
///
/// The encoding is detected from the file's leading bytes. Entries that would
/// land outside `target_dir` are rejected. Returns the number of entries written.
///
/// Blocking; call from `spawn_blocking` inside async code.
pub fn extract_archive(
    archive_path: &Path,
    target_dir: &Path,
    extract_pb: &indicatif::ProgressBar,
) -> Result<u64, SnapshotError> {
    let mut file = File::open(archive_path)?;
    let mut magic = [0u8; 2];
    let gzipped = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e.into()),
    };
    file.seek(SeekFrom::Start(0))?;

    std::fs::create_dir_all(target_dir)?;
    let reader = BufReader::new(file);
    if gzipped {
        unpack(Archive::new(GzDecoder::new(reader)), target_dir, extract_pb)
    } else {
        unpack(Archive::new(reader), target_dir, extract_pb)
    }
}

fn unpack<R: Read>(
    mut archive: Archive<R>,
    target_dir: &Path,
    extract_pb: &indicatif::ProgressBar,
) -> Result<u64, SnapshotError> {
    let mut file_count = 0u64;

    for (index, entry) in archive.entries()?.enumerate() {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        file_count = (index + 1) as u64;
        if index < 10 || index % 100 == 0 {
            extract_pb.set_message(format!(
                "📂 Extracting: {} files | {}",
                file_count,
                path.display()
            ));
        }
        extract_pb.inc(entry.size());

        if !entry.unpack_in(target_dir)? {
            return Err(SnapshotError::IntegrityViolation(format!(
                "archive entry {} escapes the target directory",
                path.display()
            )));
        }
    }

    extract_pb.finish_with_message(format!(
        "✅ Extracted {} files to {}",
        file_count,
        target_dir.display()
    ));
    Ok(file_count)
}
