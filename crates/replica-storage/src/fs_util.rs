use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// atomic write: write to temp file then rename over the target
pub(crate) fn atomic_write(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    sync_dir(dir)
}

/// make a rename durable
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
