use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, BufReader};

pub const DEFAULT_TAIL_LINES: usize = 100;

pub fn log_path(log_dir: &Path, room_id: &str) -> PathBuf {
    log_dir.join(format!("{room_id}.log"))
}

/// Opens the room's append-only log for a child's stdout/stderr.
pub fn open_sink(log_dir: &Path, room_id: &str) -> std::io::Result<File> {
    std::fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(log_dir, room_id))
}

/// Last `lines` lines of the room's log, oldest first.
pub async fn tail(log_dir: &Path, room_id: &str, lines: usize) -> std::io::Result<Vec<String>> {
    let file = match tokio::fs::File::open(log_path(log_dir, room_id)).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut reader = BufReader::new(file).lines();
    let mut buf = VecDeque::with_capacity(lines.min(1024));
    while let Some(line) = reader.next_line().await? {
        if lines == 0 {
            continue;
        }
        buf.push_back(line);
        if buf.len() > lines {
            buf.pop_front();
        }
    }
    Ok(buf.into())
}

pub async fn clear(log_dir: &Path, room_id: &str) -> std::io::Result<()> {
    match tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(log_path(log_dir, room_id))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open_sink(dir.path(), "room1").unwrap();
        for i in 0..10 {
            writeln!(sink, "line {i}").unwrap();
        }

        let lines = tail(dir.path(), "room1", 3).await.unwrap();
        assert_eq!(lines, vec!["line 7", "line 8", "line 9"]);
    }

    #[tokio::test]
    async fn sink_appends_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        writeln!(open_sink(dir.path(), "room1").unwrap(), "first").unwrap();
        writeln!(open_sink(dir.path(), "room1").unwrap(), "second").unwrap();

        let lines = tail(dir.path(), "room1", DEFAULT_TAIL_LINES).await.unwrap();
        assert_eq!(lines, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn clear_truncates_and_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tail(dir.path(), "ghost", 10).await.unwrap().is_empty());
        clear(dir.path(), "ghost").await.unwrap();

        writeln!(open_sink(dir.path(), "room1").unwrap(), "noise").unwrap();
        clear(dir.path(), "room1").await.unwrap();
        assert!(tail(dir.path(), "room1", 10).await.unwrap().is_empty());
    }
}
