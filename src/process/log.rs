//! Service log files.

use crate::error::Result;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Rough bytes-per-line estimate used to decide how far back to seek.
const BYTES_PER_LINE: u64 = 200;

pub fn log_path(logs_dir: &Path, service: &str) -> PathBuf {
    logs_dir.join(format!("{}.log", service))
}

/// Move the previous run's log to `<service>.log.1` so each run starts with
/// a fresh file. Any older `.1` file is replaced.
pub fn rotate(path: &Path) -> Result<()> {
    if path.exists() {
        let mut previous = path.as_os_str().to_owned();
        previous.push(".1");
        std::fs::rename(path, PathBuf::from(previous))?;
    }
    Ok(())
}

/// Last `lines` lines of `path`. A missing file yields an empty tail.
pub async fn tail(path: &Path, lines: usize) -> Result<Vec<String>> {
    if lines == 0 || !path.exists() {
        return Ok(Vec::new());
    }
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || tail_blocking(&path, lines))
        .await
        .map_err(|e| crate::error::Error::Process(format!("log tail task failed: {}", e)))?;
    Ok(result?)
}

fn tail_blocking(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();

    // Widen the window until it holds enough lines or covers the whole file
    let mut window = (lines as u64).saturating_mul(BYTES_PER_LINE);
    loop {
        let start = size.saturating_sub(window);
        let mut reader = BufReader::new(&file);
        reader.seek(SeekFrom::Start(start))?;

        let mut buf = Vec::new();
        if start > 0 {
            // Skip the partial first line
            reader.read_until(b'\n', &mut buf)?;
            buf.clear();
        }

        let mut collected: Vec<String> = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            collected.push(line.trim_end_matches(['\n', '\r']).to_string());
        }

        if collected.len() >= lines || start == 0 {
            let skip = collected.len().saturating_sub(lines);
            return Ok(collected.split_off(skip));
        }
        window = window.saturating_mul(2);
    }
}
