use std::path::{Path, PathBuf};

const APP_DIR: &str = "screenclip";

/// Get the base storage directory following XDG Base Directory Specification.
/// Returns `$XDG_DATA_HOME/screenclip`, the platform data dir, or `./screenclip`.
pub fn get_storage_dir() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        if !xdg_data.is_empty() {
            return PathBuf::from(xdg_data).join(APP_DIR);
        }
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Get the logs directory path.
/// Returns `{storage_dir}/logs`.
pub fn get_log_dir() -> PathBuf {
    get_storage_dir().join("logs")
}

/// Read-only settings file consulted at startup.
pub fn get_settings_path() -> PathBuf {
    get_storage_dir().join("settings.json")
}

/// Default destination for finished clips: `~/Videos/screenclip.mp4` when the
/// platform has a videos directory, the home directory otherwise.
pub fn default_output_file() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("screenclip.mp4")
}

/// Ensure a directory exists, creating it if necessary.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
