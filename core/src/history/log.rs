// Session history files
//
// One JSON envelope per line. Files are named after the session start time
// plus a counter that grows on rotation and on name collisions.

use super::{is_replayable, HistoryError};
use crate::command::Envelope;
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File extension of history logs
pub const HISTORY_EXTENSION: &str = "cdtch";

/// Upper bound on the counter search for a free file name
const MAX_NAME_ATTEMPTS: u32 = 1000;

struct ActiveFile {
    path: PathBuf,
    file: File,
    size: u64,
}

pub struct HistoryLog {
    dir: PathBuf,
    max_file_bytes: Option<u64>,
    session_start: DateTime<Local>,
    counter: u32,
    active: ActiveFile,
}

impl HistoryLog {
    /// Start a new session in `dir`, creating its first file immediately.
    pub fn open(dir: PathBuf, max_file_bytes: Option<u64>) -> Result<Self, HistoryError> {
        Self::open_at(dir, max_file_bytes, Local::now())
    }

    /// Start a session with an explicit start time (used for naming).
    pub fn open_at(
        dir: PathBuf,
        max_file_bytes: Option<u64>,
        session_start: DateTime<Local>,
    ) -> Result<Self, HistoryError> {
        std::fs::create_dir_all(&dir)?;

        let mut counter = 0;
        let active = create_file(&dir, &session_start, &mut counter)?;
        info!("History session started: {}", active.path.display());

        Ok(Self {
            dir,
            max_file_bytes,
            session_start,
            counter,
            active,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn active_path(&self) -> &Path {
        &self.active.path
    }

    /// Append one envelope.
    ///
    /// Returns `false` when the envelope kind is never recorded (config pushes).
    pub fn write(&mut self, envelope: &Envelope) -> Result<bool, HistoryError> {
        if envelope.message.is_config_update() {
            return Ok(false);
        }

        if let Some(max) = self.max_file_bytes {
            if self.active.size > max {
                self.rotate()?;
            }
        }

        let mut line = serde_json::to_string(envelope)?;
        line.push('\n');

        self.active.file.write_all(line.as_bytes())?;
        self.active.size += line.len() as u64;

        Ok(true)
    }

    /// Switch to the next file of this session.
    fn rotate(&mut self) -> Result<(), HistoryError> {
        self.counter += 1;
        let next = create_file(&self.dir, &self.session_start, &mut self.counter)?;
        info!(
            "History rotated: {} ({} bytes) -> {}",
            self.active.path.display(),
            self.active.size,
            next.path.display()
        );

        let previous = std::mem::replace(&mut self.active, next);
        if let Err(e) = previous.file.sync_data() {
            warn!("Failed to sync {}: {}", previous.path.display(), e);
        }
        Ok(())
    }

    /// Flush the active file to disk.
    pub fn flush(&mut self) -> Result<(), HistoryError> {
        self.active.file.flush()?;
        self.active.file.sync_data()?;
        Ok(())
    }

    /// Read every envelope of `path`, skipping lines that do not parse.
    pub fn read(path: &Path) -> Result<Vec<Envelope>, HistoryError> {
        let contents = std::fs::read_to_string(path)?;
        let mut envelopes = Vec::new();

        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Envelope>(line) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => debug!("Skipping {}:{}: {}", path.display(), index + 1, e),
            }
        }

        Ok(envelopes)
    }

    /// Like `read`, keeping only kinds a viewer can render.
    pub fn read_filtered(path: &Path) -> Result<Vec<Envelope>, HistoryError> {
        let mut envelopes = Self::read(path)?;
        envelopes.retain(is_replayable);
        Ok(envelopes)
    }

    /// Envelopes of the active file.
    pub fn read_active(&self) -> Result<Vec<Envelope>, HistoryError> {
        Self::read(&self.active.path)
    }

    /// History files in `dir`, newest first.
    pub fn list(dir: &Path) -> Result<Vec<PathBuf>, HistoryError> {
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(HISTORY_EXTENSION) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            files.push((modified, path));
        }

        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    /// Delete a history file other than the active one.
    pub fn delete(&self, path: &Path) -> Result<(), HistoryError> {
        if path == self.active.path {
            return Err(HistoryError::ActiveFile(path.display().to_string()));
        }
        delete_file(path)
    }

    /// Delete a stored file from outside the recording process.
    ///
    /// The newest file in `dir` may be a running session's active file, so it
    /// is only removed with `force`.
    pub fn delete_stored(dir: &Path, path: &Path, force: bool) -> Result<(), HistoryError> {
        if !force {
            let newest = Self::list(dir)?.into_iter().next();
            if let Some(newest) = newest {
                if same_file(&newest, path) {
                    return Err(HistoryError::ActiveFile(path.display().to_string()));
                }
            }
        }
        delete_file(path)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Move `path` to the trash, falling back to permanent deletion.
fn delete_file(path: &Path) -> Result<(), HistoryError> {
    match trash::delete(path) {
        Ok(()) => {
            info!("Moved {} to trash", path.display());
            Ok(())
        }
        Err(e) => {
            warn!(
                "Trash unavailable for {} ({}), deleting permanently",
                path.display(),
                e
            );
            std::fs::remove_file(path)?;
            Ok(())
        }
    }
}

/// `<year>-<month>-<date>-<hour>-<minute>-<second>-<counter>.cdtch`
pub fn file_name(session_start: &DateTime<Local>, counter: u32) -> String {
    format!(
        "{}-{}.{}",
        session_start.format("%Y-%m-%d-%H-%M-%S"),
        counter,
        HISTORY_EXTENSION
    )
}

fn create_file(
    dir: &Path,
    session_start: &DateTime<Local>,
    counter: &mut u32,
) -> Result<ActiveFile, HistoryError> {
    for _ in 0..MAX_NAME_ATTEMPTS {
        let path = dir.join(file_name(session_start, *counter));
        match OpenOptions::new().append(true).create_new(true).open(&path) {
            Ok(file) => return Ok(ActiveFile { path, file, size: 0 }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("History name taken: {}", path.display());
                *counter += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(HistoryError::FileNameCollision {
        attempts: MAX_NAME_ATTEMPTS,
    })
}
