use std::fs;
use std::io;
use std::path::PathBuf;

use directories::ProjectDirs;

pub const LOAD_TIMES_FILE: &str = "load_times.json";
pub const LOG_FILE: &str = "log.txt";

/// Per-user data directory, created on first use. `None` when the platform
/// has no notion of a home directory.
pub fn data_dir(override_dir: Option<PathBuf>) -> io::Result<Option<PathBuf>> {
    let dir = match override_dir {
        Some(dir) => dir,
        None => match ProjectDirs::from("dev", "vale", "vale") {
            Some(dirs) => dirs.data_dir().to_path_buf(),
            None => return Ok(None),
        },
    };
    fs::create_dir_all(&dir)?;
    Ok(Some(dir))
}
