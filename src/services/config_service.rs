use crate::models::{ConnectionProfile, TunnelPreset};
use crate::utils::error::{DgxError, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted settings: the connection profile and saved tunnel presets
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ConnectionProfile>,

    #[serde(default)]
    pub presets: Vec<TunnelPreset>,
}

/// Service for managing configuration persistence
pub struct ConfigService {
    config_dir: PathBuf,
}

impl ConfigService {
    /// Create a new config service with default directory
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
            tracing::info!("Created config directory: {:?}", config_dir);

            // Set permissions to 0700 on Unix
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(&config_dir)?.permissions();
                perms.set_mode(0o700);
                fs::set_permissions(&config_dir, perms)?;
            }
        }

        Ok(Self { config_dir })
    }

    /// Create a config service with custom directory
    pub fn with_dir(config_dir: PathBuf) -> Result<Self> {
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
        }
        Ok(Self { config_dir })
    }

    fn get_config_dir() -> Result<PathBuf> {
        ProjectDirs::from("com", "dgx", "dgx-manager")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| DgxError::Config("Failed to get config directory".to_string()))
    }

    fn settings_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Load settings; a missing file yields defaults
    pub fn load(&self) -> Result<Settings> {
        let path = self.settings_file();

        if !path.exists() {
            tracing::debug!("No config file at {:?}, using defaults", path);
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&path)?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| DgxError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

        tracing::debug!("Loaded {} presets", settings.presets.len());
        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        let content = toml::to_string_pretty(settings)
            .map_err(|e| DgxError::Config(format!("Failed to serialize settings: {}", e)))?;

        let path = self.settings_file();
        fs::write(&path, content)?;

        tracing::info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// The configured profile, or an error pointing at `dgx config set`
    pub fn profile(&self) -> Result<ConnectionProfile> {
        self.load()?.profile.ok_or_else(|| {
            DgxError::Config("No connection configured. Run `dgx config set` first.".to_string())
        })
    }

    pub fn set_profile(&self, profile: ConnectionProfile) -> Result<()> {
        profile.validate()?;
        let mut settings = self.load()?;
        settings.profile = Some(profile);
        self.save(&settings)
    }

    /// Add a preset, replacing any with the same name
    pub fn add_preset(&self, preset: TunnelPreset) -> Result<()> {
        let mut settings = self.load()?;

        if let Some(pos) = settings.presets.iter().position(|p| p.name == preset.name) {
            tracing::info!("Updated preset: {}", preset.name);
            settings.presets[pos] = preset;
        } else {
            tracing::info!("Added preset: {}", preset.name);
            settings.presets.push(preset);
        }

        self.save(&settings)
    }

    /// Returns whether a preset was removed
    pub fn remove_preset(&self, name: &str) -> Result<bool> {
        let mut settings = self.load()?;
        let original_len = settings.presets.len();

        settings.presets.retain(|p| p.name != name);

        if settings.presets.len() < original_len {
            self.save(&settings)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn preset(&self, name: &str) -> Result<Option<TunnelPreset>> {
        Ok(self.load()?.presets.into_iter().find(|p| p.name == name))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}
