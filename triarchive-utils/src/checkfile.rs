//! Checkfile and scratch path-list I/O: the `<hash>  <path>` format fed to
//! the storage tool's `check` subcommand, and the plain path-list files
//! passed via `--files-from` to `copy`/`move`/`delete`.

use std::io::Write;
use std::path::Path;

use triarchive_core::TriarchiveResult;

/// Writes one `"<hash>  <path>\n"` line per row that has a hash, matching
/// `examples/original_source/util.py::write_checkfile`'s two-space
/// separator.
pub fn write_checkfile(path: impl AsRef<Path>, rows: &[(String, String)]) -> TriarchiveResult<()> {
    let mut f = std::fs::File::create(path)?;
    for (hash, row_path) in rows {
        writeln!(f, "{hash}  {row_path}")?;
    }
    Ok(())
}

/// Writes a plain newline-separated path list for `--files-from`.
pub fn write_path_list<I, S>(path: impl AsRef<Path>, paths: I) -> TriarchiveResult<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut f = std::fs::File::create(path)?;
    for p in paths {
        writeln!(f, "{}", p.as_ref())?;
    }
    Ok(())
}

/// Reads a scratch path-list file (one path per line, blank lines
/// skipped) such as the storage tool's `--differ`/`--missing-on-dst`/
/// `--missing-on-src` outputs.
pub fn read_path_list(path: impl AsRef<Path>) -> TriarchiveResult<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// A single line of the storage tool's `lsl` output: `size date time path`.
#[derive(Debug, Clone, PartialEq)]
pub struct LslEntry {
    pub size: i64,
    pub timestamp: String,
    pub path: String,
}

/// Parses `lsl`'s `<size> <date> <time> <path>` lines.
pub fn parse_lsl_output(text: &str) -> Vec<LslEntry> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let mut parts = line.splitn(4, char::is_whitespace);
            let size = parts.next()?.trim().parse().ok()?;
            let date = parts.next()?.trim();
            let time = parts.next()?.trim();
            let path = parts.next()?.trim().to_string();
            Some(LslEntry {
                size,
                timestamp: format!("{date}T{time}"),
                path,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_path_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("list.txt");
        write_path_list(&file, vec!["a/b.txt", "c/d.txt"]).unwrap();
        assert_eq!(read_path_list(&file).unwrap(), vec!["a/b.txt", "c/d.txt"]);
    }

    #[test]
    fn write_checkfile_uses_two_space_separator() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("checkfile.txt");
        write_checkfile(&file, &[("deadbeef".to_string(), "a/b.txt".to_string())]).unwrap();
        let text = std::fs::read_to_string(&file).unwrap();
        assert_eq!(text, "deadbeef  a/b.txt\n");
    }

    #[test]
    fn parse_lsl_output_splits_fixed_columns() {
        let entries = parse_lsl_output("100 2022-06-01 10:00:00 a/b.txt\n");
        assert_eq!(
            entries,
            vec![LslEntry {
                size: 100,
                timestamp: "2022-06-01T10:00:00".to_string(),
                path: "a/b.txt".to_string(),
            }]
        );
    }
}
