use std::fs;
use std::path::{Path, PathBuf};

pub fn stop_signal_path(state_root: &Path) -> PathBuf {
    state_root.join("stop")
}

pub fn signal_stop(state_root: &Path) -> std::io::Result<()> {
    let path = stop_signal_path(state_root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, b"stop")
}

pub fn stop_requested(state_root: &Path) -> bool {
    stop_signal_path(state_root).exists()
}

pub fn clear_stop_signal(state_root: &Path) {
    let _ = fs::remove_file(stop_signal_path(state_root));
}
