use super::TransportError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const RECEIVE_POLL: Duration = Duration::from_millis(25);

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);
static REQUEUE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct DirTransport {
    root: PathBuf,
}

impl DirTransport {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn publish(&self, queue: &str, body: &str) -> Result<(), TransportError> {
        let incoming = self.incoming_dir(queue);
        fs::create_dir_all(&incoming).map_err(|e| io_err(&incoming, e))?;
        let path = incoming.join(next_message_name());
        atomic_write_file(&path, body.as_bytes()).map_err(|e| io_err(&path, e))
    }

    pub fn receive(&self, queue: &str, wait: Duration) -> Result<Option<String>, TransportError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(body) = self.claim_oldest(queue)? {
                return Ok(Some(body));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(RECEIVE_POLL.min(deadline - now));
        }
    }

    // Puts messages claimed by a crashed consumer back in line.
    pub fn recover(&self) -> Result<(), TransportError> {
        if !self.root.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.root).map_err(|e| io_err(&self.root, e))? {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            let processing = entry.path().join("processing");
            if !processing.is_dir() {
                continue;
            }
            let incoming = entry.path().join("incoming");
            fs::create_dir_all(&incoming).map_err(|e| io_err(&incoming, e))?;
            for claimed in sorted_message_paths(&processing)? {
                let Some(name) = claimed.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let target = incoming.join(unique_requeue_name(name));
                fs::rename(&claimed, &target).map_err(|e| io_err(&claimed, e))?;
            }
        }
        Ok(())
    }

    fn claim_oldest(&self, queue: &str) -> Result<Option<String>, TransportError> {
        let incoming = self.incoming_dir(queue);
        if !incoming.is_dir() {
            return Ok(None);
        }
        let processing = self.processing_dir(queue);
        fs::create_dir_all(&processing).map_err(|e| io_err(&processing, e))?;

        for path in sorted_message_paths(&incoming)? {
            let Some(file_name) = path.file_name() else {
                continue;
            };
            let claimed = processing.join(file_name);
            match fs::rename(&path, &claimed) {
                Ok(()) => {
                    let body = fs::read_to_string(&claimed).map_err(|e| io_err(&claimed, e))?;
                    fs::remove_file(&claimed).map_err(|e| io_err(&claimed, e))?;
                    return Ok(Some(body));
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(&path, err)),
            }
        }
        Ok(None)
    }

    fn incoming_dir(&self, queue: &str) -> PathBuf {
        self.root.join(queue).join("incoming")
    }

    fn processing_dir(&self, queue: &str) -> PathBuf {
        self.root.join(queue).join("processing")
    }
}

fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("msg"),
        std::process::id(),
    );
    let tmp_path = parent.join(tmp_name);

    {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)
}

fn next_message_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = MESSAGE_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    format!("{nanos:024}-{seq:06}.json")
}

fn unique_requeue_name(original_name: &str) -> String {
    let path = Path::new(original_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("message");
    let counter = REQUEUE_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    format!("{stem}_requeue_{counter}.json")
}

fn sorted_message_paths(dir: &Path) -> Result<Vec<PathBuf>, TransportError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        let metadata = entry.metadata().map_err(|e| io_err(&path, e))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((modified, path));
    }

    entries.sort_by(|(a_time, a_path), (b_time, b_path)| {
        a_time
            .cmp(b_time)
            .then_with(|| a_path.file_name().cmp(&b_path.file_name()))
    });

    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

fn io_err(path: &Path, source: std::io::Error) -> TransportError {
    TransportError::Io {
        path: path.display().to_string(),
        source,
    }
}
