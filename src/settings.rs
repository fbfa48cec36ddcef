use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::filters::DEFAULT_TILE_ROWS;
use crate::history::{DEFAULT_MAX_HISTORY, DEFAULT_MAX_HISTORY_BYTES};
use crate::pipeline::DEFAULT_PREVIEW_MAX_EDGE;

/// Engine tunables, persisted as `key=value` lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub max_undo_steps: usize,
    /// Byte cap for history in megabytes; 0 disables it.
    pub max_history_mb: usize,
    pub preview_max_edge: u32,
    pub tile_rows: usize,
    /// 0 lets rayon pick one thread per core.
    pub worker_threads: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_undo_steps: DEFAULT_MAX_HISTORY,
            max_history_mb: DEFAULT_MAX_HISTORY_BYTES / (1024 * 1024),
            preview_max_edge: DEFAULT_PREVIEW_MAX_EDGE,
            tile_rows: DEFAULT_TILE_ROWS,
            worker_threads: 0,
        }
    }
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/paintcore/paintcore_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\paintcore\paintcore_settings.cfg
    /// On macOS:   ~/Library/Application Support/paintcore/paintcore_settings.cfg
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join("paintcore").join("paintcore_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("paintcore")
                    .join("paintcore_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = match std::env::var("XDG_CONFIG_HOME") {
                Ok(xdg) => PathBuf::from(xdg),
                Err(_) => PathBuf::from(std::env::var("HOME").ok()?).join(".config"),
            };
            Some(config_dir.join("paintcore").join("paintcore_settings.cfg"))
        }
    }

    /// Parse settings text.  Unknown keys and bad values are skipped and the
    /// default stays in place.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "max_undo_steps" => {
                    if let Ok(v) = val.parse::<usize>() {
                        if v > 0 {
                            s.max_undo_steps = v;
                        }
                    }
                }
                "max_history_mb" => {
                    if let Ok(v) = val.parse() {
                        s.max_history_mb = v;
                    }
                }
                "preview_max_edge" => {
                    if let Ok(v) = val.parse::<u32>() {
                        if v > 0 {
                            s.preview_max_edge = v;
                        }
                    }
                }
                "tile_rows" => {
                    if let Ok(v) = val.parse::<usize>() {
                        if v > 0 {
                            s.tile_rows = v;
                        }
                    }
                }
                "worker_threads" => {
                    if let Ok(v) = val.parse() {
                        s.worker_threads = v;
                    }
                }
                _ => {}
            }
        }
        s
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "max_undo_steps={}\n\
             max_history_mb={}\n\
             preview_max_edge={}\n\
             tile_rows={}\n\
             worker_threads={}\n",
            self.max_undo_steps, self.max_history_mb, self.preview_max_edge, self.tile_rows, self.worker_threads,
        )
    }

    /// Load from `path`; a missing or unreadable file gives the defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    /// Load from the platform settings path.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_config_string())?;
        Ok(())
    }

    /// History byte cap, or `None` when disabled.
    pub fn history_byte_limit(&self) -> Option<usize> {
        (self.max_history_mb > 0).then(|| self.max_history_mb.saturating_mul(1024 * 1024))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let s = EngineSettings::default();
        assert_eq!(s.max_undo_steps, 20);
        assert_eq!(s.max_history_mb, 100);
        assert_eq!(s.preview_max_edge, 1024);
        assert_eq!(s.tile_rows, 64);
        assert_eq!(s.worker_threads, 0);
    }

    #[test]
    fn parse_skips_bad_values_and_unknown_keys() {
        let s = EngineSettings::parse(
            "# comment\nmax_undo_steps=35\ntile_rows=zero\npreview_max_edge=0\ncolour=blue\nworker_threads = 3\n",
        );
        assert_eq!(s.max_undo_steps, 35);
        assert_eq!(s.tile_rows, 64);
        assert_eq!(s.preview_max_edge, 1024);
        assert_eq!(s.worker_threads, 3);
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("paintcore-settings-{}", std::process::id()));
        let path = dir.join("paintcore_settings.cfg");
        let s = EngineSettings {
            max_undo_steps: 7,
            max_history_mb: 0,
            preview_max_edge: 256,
            tile_rows: 8,
            worker_threads: 2,
        };
        s.save_to(&path).unwrap();
        let back = EngineSettings::load_from(&path);
        assert_eq!(back, s);
        assert_eq!(back.history_byte_limit(), None);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let s = EngineSettings::load_from(Path::new("/nonexistent/paintcore/settings.cfg"));
        assert_eq!(s, EngineSettings::default());
    }
}
