use anyhow::{Context, Result, bail};
use std::{
    collections::HashSet,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

pub fn is_zip(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Hand a reader over the file's CSV content to `f`.
///
/// Plain files are read as-is; `.zip` archives yield their first `.csv` member.
pub fn with_csv_reader<T>(path: &Path, f: impl FnOnce(&mut dyn Read) -> Result<T>) -> Result<T> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    if !is_zip(path) {
        return f(&mut file);
    }

    let mut archive =
        ZipArchive::new(file).with_context(|| format!("read zip {}", path.display()))?;
    let mut member = None;
    for i in 0..archive.len() {
        if archive.by_index(i)?.name().to_ascii_lowercase().ends_with(".csv") {
            member = Some(i);
            break;
        }
    }
    let Some(idx) = member else {
        bail!("no csv member in {}", path.display());
    };
    let mut entry = archive.by_index(idx)?;
    f(&mut entry)
}

/// Write a single-member deflated zip atomically (temp file in the same dir, then rename).
pub fn write_single_member_zip(path: &Path, member_name: &str, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut zw = ZipWriter::new(tmp.as_file_mut());
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        zw.start_file(member_name, options)?;
        zw.write_all(content)?;
        zw.finish()?;
    }
    tmp.persist(path)
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

/// Unpack every member of `path` into `dir`.
pub fn extract_all(path: &Path, dir: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut archive = ZipArchive::new(file)?;
    archive
        .extract(dir)
        .with_context(|| format!("extract {}", path.display()))?;
    Ok(())
}

/// Drop archives whose extracted `.csv` sits next to them, so a day is read once.
pub fn prefer_extracted(files: Vec<PathBuf>) -> Vec<PathBuf> {
    let extracted: HashSet<PathBuf> = files
        .iter()
        .filter(|p| !is_zip(p))
        .map(|p| p.with_extension(""))
        .collect();
    files
        .into_iter()
        .filter(|p| !is_zip(p) || !extracted.contains(&p.with_extension("")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_round_trip_reads_csv_member() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day.zip");
        write_single_member_zip(&path, "day.csv", b"a,b\n1,2\n").unwrap();

        let text = with_csv_reader(&path, |r| {
            let mut s = String::new();
            r.read_to_string(&mut s)?;
            Ok(s)
        })
        .unwrap();
        assert_eq!(text, "a,b\n1,2\n");
    }

    #[test]
    fn plain_file_is_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day.csv");
        fs::write(&path, "x\n").unwrap();
        let len = with_csv_reader(&path, |r| Ok(r.bytes().count())).unwrap();
        assert_eq!(len, 2);
    }

    #[test]
    fn zip_without_csv_member_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.zip");
        write_single_member_zip(&path, "readme.txt", b"hi").unwrap();
        assert!(with_csv_reader(&path, |_| Ok(())).is_err());
    }

    #[test]
    fn extracted_csv_shadows_its_archive() {
        let files = vec![
            PathBuf::from("d/X-trades-2024-01-01.csv"),
            PathBuf::from("d/X-trades-2024-01-01.zip"),
            PathBuf::from("d/X-trades-2024-01-02.zip"),
        ];
        assert_eq!(
            prefer_extracted(files),
            vec![
                PathBuf::from("d/X-trades-2024-01-01.csv"),
                PathBuf::from("d/X-trades-2024-01-02.zip"),
            ]
        );
    }
}
