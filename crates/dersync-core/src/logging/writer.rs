//! Append-only JSONL file per device per day.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::LogEntry;

pub struct DeviceLogWriter {
    device: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl DeviceLogWriter {
    /// Open (or continue) `<logs_dir>/<date>_<device>.jsonl`.
    pub fn new(logs_dir: impl AsRef<Path>, device: impl Into<String>) -> std::io::Result<Self> {
        let device = device.into();
        let logs_dir = logs_dir.as_ref();
        fs::create_dir_all(logs_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = logs_dir.join(format!("{}_{}.jsonl", date, device));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            device,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush, so a crash loses at most the current line.
    pub fn write(&self, entry: &LogEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)?;
        writer.flush()
    }
}

impl Drop for DeviceLogWriter {
    fn drop(&mut self) {
        let _ = self.writer.lock().flush();
    }
}

/// Every entry from every device file in `logs_dir`, sorted by timestamp.
///
/// Lines that do not parse are skipped.
pub fn read_entries(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<LogEntry>> {
    let logs_dir = logs_dir.as_ref();
    if !logs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dir_entry in fs::read_dir(logs_dir)? {
        let path = dir_entry?.path();
        if path.extension().map(|e| e != "jsonl").unwrap_or(true) {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        entries.extend(
            content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .filter_map(|line| serde_json::from_str::<LogEntry>(line).ok()),
        );
    }
    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_per_device() {
        let temp = TempDir::new().unwrap();
        let writer = DeviceLogWriter::new(temp.path().join("logs"), "dev_aaaaaaaa").unwrap();

        assert!(writer.path().exists());
        let name = writer.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_dev_aaaaaaaa.jsonl"));
    }

    #[test]
    fn test_merge_devices() {
        let temp = TempDir::new().unwrap();
        let logs = temp.path().join("logs");

        let laptop = DeviceLogWriter::new(&logs, "dev_laptop00").unwrap();
        let phone = DeviceLogWriter::new(&logs, "dev_phone000").unwrap();
        laptop
            .write(&LogEntry::new("info", "dev_laptop00", "engine", "Push accepted"))
            .unwrap();
        phone
            .write(&LogEntry::new("info", "dev_phone000", "engine", "Pulled new record"))
            .unwrap();
        drop(laptop);
        drop(phone);

        // Junk next to the logs is ignored
        fs::write(logs.join("notes.txt"), "not a log").unwrap();
        fs::write(logs.join("broken.jsonl"), "{not json\n").unwrap();

        let entries = read_entries(&logs).unwrap();
        assert_eq!(entries.len(), 2);
        let devices: Vec<_> = entries.iter().map(|e| e.device.as_str()).collect();
        assert!(devices.contains(&"dev_laptop00"));
        assert!(devices.contains(&"dev_phone000"));
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_entries(temp.path().join("nope")).unwrap().is_empty());
    }
}
