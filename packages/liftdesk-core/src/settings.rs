//! Persisted operator settings (`~/.liftdesk/settings.json`)

use crate::telemetry::{clamp_view_window, DEFAULT_VIEW_WINDOW};
use crate::RegulatorTerms;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to write settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize settings: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub regulator: RegulatorTerms,
    pub view_window: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            regulator: RegulatorTerms::default(),
            view_window: DEFAULT_VIEW_WINDOW,
        }
    }
}

/// Default settings location under the home directory.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".liftdesk")
        .join("settings.json")
}

impl Settings {
    /// Read settings, falling back to defaults when the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                log::warn!("[settings] could not read {}: {}", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => settings.normalized(),
            Err(e) => {
                log::warn!(
                    "[settings] ignoring corrupt settings file {}: {}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(io_err)?;
        log::debug!("[settings] saved {}", path.display());
        Ok(())
    }

    pub fn set_view_window(&mut self, size: u32) {
        self.view_window = clamp_view_window(size);
    }

    fn normalized(mut self) -> Self {
        self.regulator = self.regulator.clamped();
        self.view_window = clamp_view_window(self.view_window);
        self
    }
}
