//! Out-of-place log rewriting.
//!
//! The only path that ever mutates access logs. Lines are streamed
//! through a filter into a sibling temp file which is renamed over the
//! original; `.gz` rotations are decompressed and recompressed on the
//! way through. When every line of a file matches the filter, the file
//! is deleted outright.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lancache_logs::parser::{LogParser, ParseOutcome};
use lancache_ops::registry::OperationType;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::jobs::JobContext;

/// One discovered log file.
#[derive(Debug, Clone)]
pub struct LogFile {
    pub path: PathBuf,
    pub compressed: bool,
}

/// `access.log` plus its rotations (`access.log.1`, `access.log.2.gz`, ...).
pub fn discover_log_files(log_dir: &Path, base_name: &str) -> Result<Vec<LogFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == base_name || name.starts_with(&format!("{base_name}.")) {
            files.push(LogFile {
                path: entry.path(),
                compressed: name.ends_with(".gz"),
            });
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RewriteSummary {
    pub files_rewritten: usize,
    pub files_deleted: usize,
    pub lines_kept: u64,
    pub lines_removed: u64,
}

/// Rewrite one log file, keeping lines for which `keep` returns true.
pub fn rewrite_filtered(
    file: &LogFile,
    keep: impl Fn(&str) -> bool,
) -> Result<RewriteSummary> {
    let dir = file
        .path
        .parent()
        .map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf);
    let temp = NamedTempFile::new_in(&dir)?;

    let mut lines_kept = 0u64;
    let mut lines_removed = 0u64;

    {
        let source = File::open(&file.path)?;
        let mut reader: Box<dyn BufRead> = if file.compressed {
            Box::new(BufReader::new(GzDecoder::new(source)))
        } else {
            Box::new(BufReader::new(source))
        };

        let sink = temp.as_file().try_clone()?;
        let mut writer: Box<dyn Write> = if file.compressed {
            Box::new(BufWriter::with_capacity(
                1 << 20,
                GzEncoder::new(sink, Compression::default()),
            ))
        } else {
            Box::new(BufWriter::with_capacity(1 << 20, sink))
        };

        let mut line = String::new();
        loop {
            line.clear();
            if read_line_lossy(&mut reader, &mut line)? == 0 {
                break;
            }
            if keep(line.trim_end_matches(['\n', '\r'])) {
                writer.write_all(line.as_bytes())?;
                lines_kept += 1;
            } else {
                lines_removed += 1;
            }
        }
        writer.flush()?;
    }

    let mut summary = RewriteSummary {
        lines_kept,
        lines_removed,
        ..RewriteSummary::default()
    };

    let total = lines_kept + lines_removed;
    if total > 0 && lines_kept == 0 {
        // Nothing survives: drop the file instead of leaving an empty
        // shell behind.
        std::fs::remove_file(&file.path)?;
        summary.files_deleted = 1;
        debug!("removed fully-filtered log {}", file.path.display());
        return Ok(summary);
    }
    if lines_removed == 0 {
        // Untouched; leave the original alone.
        return Ok(summary);
    }

    let temp_path = temp.into_temp_path();
    if let Err(persist_err) = temp_path.persist(&file.path) {
        // Rename fails when a watcher holds the target open; fall back
        // to copy + delete.
        warn!(
            "persist over {} failed ({}), copying instead",
            file.path.display(),
            persist_err.error
        );
        std::fs::copy(&persist_err.path, &file.path)?;
        let _ = std::fs::remove_file(&persist_err.path);
    }
    summary.files_rewritten = 1;
    Ok(summary)
}

/// `read_line` over possibly non-UTF-8 log bytes.
fn read_line_lossy(reader: &mut dyn BufRead, line: &mut String) -> std::io::Result<usize> {
    let mut bytes = Vec::new();
    let mut total = 0;
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(newline) => {
                bytes.extend_from_slice(&available[..=newline]);
                let consumed = newline + 1;
                reader.consume(consumed);
                total += consumed;
                break;
            }
            None => {
                bytes.extend_from_slice(available);
                let consumed = available.len();
                reader.consume(consumed);
                total += consumed;
            }
        }
    }
    line.push_str(&String::from_utf8_lossy(&bytes));
    Ok(total)
}

/// Remove every line of a service from every log file in a directory,
/// as a registered, cancellable operation.
pub fn run_log_service_remove(
    ctx: &JobContext,
    log_dir: &Path,
    service: &str,
) -> Result<RewriteSummary> {
    let job = ctx.begin(
        OperationType::LogServiceRemove,
        format!("remove '{service}' from logs"),
    );
    let parser = LogParser::default();
    let target = service.to_ascii_lowercase();

    let result = (|| -> Result<RewriteSummary> {
        let files = discover_log_files(log_dir, "access.log")?;
        let mut summary = RewriteSummary::default();

        for (index, file) in files.iter().enumerate() {
            if job.is_cancelled() {
                break;
            }
            let percent = (index as f64 / files.len().max(1) as f64) * 100.0;
            job.progress(percent, &format!("rewriting {}", file.path.display()));

            let file_summary = rewrite_filtered(file, |line| {
                match parser.parse(line) {
                    ParseOutcome::Record(record) => record.service != target,
                    // Unparsed lines are preserved; the rewrite only
                    // removes what it can positively attribute.
                    ParseOutcome::Unparsed => true,
                }
            })?;
            summary.files_rewritten += file_summary.files_rewritten;
            summary.files_deleted += file_summary.files_deleted;
            summary.lines_kept += file_summary.lines_kept;
            summary.lines_removed += file_summary.lines_removed;
        }
        Ok(summary)
    })();

    match &result {
        Ok(summary) => {
            info!(
                removed = summary.lines_removed,
                kept = summary.lines_kept,
                "log service removal finished"
            );
            job.finish(!job.is_cancelled(), None)?;
        }
        Err(e) => job.finish(false, Some(e.to_string()))?,
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use lancache_ops::events::EventBus;
    use lancache_ops::registry::OperationRegistry;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn line(service: &str, time: &str) -> String {
        format!(
            "[{service}] 10.0.0.1 / - - - [{time}] \"GET /depot/1/chunk/a HTTP/1.1\" 200 100 \"-\" \"ua\" \"HIT\" \"up\" \"-\"\n"
        )
    }

    fn context(dir: &tempfile::TempDir) -> JobContext {
        JobContext::new(
            OperationRegistry::new(EventBus::default()),
            dir.path().join("operations"),
        )
    }

    #[test]
    fn discovers_base_and_rotations() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("access.log"), "").unwrap();
        fs::write(dir.path().join("access.log.1"), "").unwrap();
        fs::write(dir.path().join("access.log.2.gz"), "").unwrap();
        fs::write(dir.path().join("error.log"), "").unwrap();

        let files = discover_log_files(dir.path(), "access.log").unwrap();
        assert_eq!(files.len(), 3);
        assert!(files.iter().any(|f| f.compressed));
    }

    #[test]
    fn removes_only_the_target_service() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("access.log");
        let content = format!(
            "{}{}{}garbage line that does not parse\n",
            line("steam", "01/Jan/2025:10:00:00 +0000"),
            line("epic", "01/Jan/2025:10:00:01 +0000"),
            line("steam", "01/Jan/2025:10:00:02 +0000"),
        );
        fs::write(&log, &content).unwrap();

        let ctx = context(&dir);
        let summary = run_log_service_remove(&ctx, dir.path(), "steam").unwrap();
        assert_eq!(summary.lines_removed, 2);
        assert_eq!(summary.lines_kept, 2);

        let rewritten = fs::read_to_string(&log).unwrap();
        assert!(!rewritten.contains("[steam]"));
        assert!(rewritten.contains("[epic]"));
        assert!(rewritten.contains("garbage line"));
    }

    #[test]
    fn fully_filtered_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("access.log");
        fs::write(&log, line("steam", "01/Jan/2025:10:00:00 +0000")).unwrap();

        let ctx = context(&dir);
        let summary = run_log_service_remove(&ctx, dir.path(), "steam").unwrap();
        assert_eq!(summary.files_deleted, 1);
        assert!(!log.exists());
    }

    #[test]
    fn gz_rotation_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("access.log.1.gz");
        let content = format!(
            "{}{}",
            line("steam", "01/Jan/2025:10:00:00 +0000"),
            line("epic", "01/Jan/2025:10:00:01 +0000"),
        );
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        fs::write(&gz_path, encoder.finish().unwrap()).unwrap();

        let ctx = context(&dir);
        let summary = run_log_service_remove(&ctx, dir.path(), "steam").unwrap();
        assert_eq!(summary.lines_removed, 1);

        // The rewritten rotation is still gzip-compressed.
        let mut decoder = GzDecoder::new(File::open(&gz_path).unwrap());
        let mut rewritten = String::new();
        decoder.read_to_string(&mut rewritten).unwrap();
        assert!(rewritten.contains("[epic]"));
        assert!(!rewritten.contains("[steam]"));
    }

    #[test]
    fn untouched_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("access.log");
        fs::write(&log, line("epic", "01/Jan/2025:10:00:00 +0000")).unwrap();
        let before = fs::metadata(&log).unwrap().modified().unwrap();

        let file = LogFile {
            path: log.clone(),
            compressed: false,
        };
        let summary = rewrite_filtered(&file, |_| true).unwrap();
        assert_eq!(summary.files_rewritten, 0);
        assert_eq!(fs::metadata(&log).unwrap().modified().unwrap(), before);
    }
}
