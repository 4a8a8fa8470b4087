use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use gencase_llm::{DEFAULT_OPENAI_MODEL, Model, ModelCatalog, ProviderConfig};
use gencase_session::{DEFAULT_FLUSH_MIN_CHARS, FlushPolicy};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "gencase";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "gencase.db";
/// `GENCASE_PROVIDER__API_KEY` overrides `provider.api_key`.
pub const ENV_PREFIX: &str = "GENCASE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            max_tokens: None,
        }
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        let config = ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint);
        match self.max_tokens {
            Some(max_tokens) => config.with_max_tokens(max_tokens),
            None => config,
        }
    }

    fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub model_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl ModelSettings {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            display_name: None,
            region: None,
        }
    }

    fn normalized(mut self) -> Option<Self> {
        self.model_id = self.model_id.trim().to_string();
        if self.model_id.is_empty() {
            return None;
        }

        self.display_name = self
            .display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        self.region = self
            .region
            .map(|region| region.trim().to_string())
            .filter(|region| !region.is_empty());
        Some(self)
    }

    pub fn as_catalog_model(&self) -> Model {
        let name = self
            .display_name
            .clone()
            .unwrap_or_else(|| self.model_id.clone());
        let model = Model::new(self.model_id.clone(), name);
        match &self.region {
            Some(region) => model.with_region(region.clone()),
            None => model,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_flush_min_chars")]
    pub min_chars: usize,
    /// Optional time-based flush in milliseconds.
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            min_chars: DEFAULT_FLUSH_MIN_CHARS,
            interval_ms: None,
        }
    }
}

impl StreamSettings {
    pub fn flush_policy(&self) -> FlushPolicy {
        let policy = FlushPolicy {
            min_chars: self.min_chars.max(1),
            max_interval: None,
        };
        match self.interval_ms {
            Some(interval_ms) => policy.with_max_interval(Duration::from_millis(interval_ms)),
            None => policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default = "default_models")]
    pub models: Vec<ModelSettings>,
    /// Falls back to the first configured model.
    #[serde(default)]
    pub default_model: String,
    /// Blank means `<config dir>/gencase.db`.
    #[serde(default)]
    pub database_location: String,
    #[serde(default)]
    pub stream: StreamSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::default(),
            models: default_models(),
            default_model: String::new(),
            database_location: String::new(),
            stream: StreamSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.provider = self.provider.normalized();

        // Drop blank and duplicate rows so the catalog stays keyed by id.
        let mut models: Vec<ModelSettings> = Vec::with_capacity(self.models.len());
        for model in self.models.into_iter().filter_map(ModelSettings::normalized) {
            if !models.iter().any(|known| known.model_id == model.model_id) {
                models.push(model);
            }
        }
        if models.is_empty() {
            models = default_models();
        }
        self.models = models;

        self.default_model = self.default_model.trim().to_string();
        if !self
            .models
            .iter()
            .any(|model| model.model_id == self.default_model)
        {
            self.default_model = self.models[0].model_id.clone();
        }

        self.database_location = self.database_location.trim().to_string();
        self
    }

    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog::new(self.models.iter().map(ModelSettings::as_catalog_model).collect())
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        self.stream.flush_policy()
    }

    pub fn database_location(&self) -> String {
        if self.database_location.is_empty() {
            SettingsStore::default_config_dir()
                .join(DATABASE_FILE_NAME)
                .display()
                .to_string()
        } else {
            self.database_location.clone()
        }
    }
}

/// Settings loaded once from disk and environment, swapped atomically on update.
pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".gencase"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_sources(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_sources(path: &Path) -> AppSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                AppSettings::default().normalized()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_models() -> Vec<ModelSettings> {
    vec![ModelSettings::new(DEFAULT_OPENAI_MODEL)]
}

fn default_flush_min_chars() -> usize {
    DEFAULT_FLUSH_MIN_CHARS
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}
