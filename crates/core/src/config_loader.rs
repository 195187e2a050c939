use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config/Config.toml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads application configuration from the default TOML path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed, or
    /// the merged configuration is invalid.
    pub fn load() -> Result<AppConfig> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads application configuration by merging built-in defaults, the
    /// TOML file at `path`, `APP_`-prefixed environment variables (nested
    /// keys separated by `__`), and `config/Config.json`.
    ///
    /// Missing files are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the
    /// merged configuration is invalid.
    pub fn load_from(path: impl AsRef<Path>) -> Result<AppConfig> {
        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("APP_").split("__"))
            .join(Json::file("config/Config.json"));

        Self::extract(&figment)
    }

    /// Loads configuration from a TOML document layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or is invalid.
    pub fn from_toml_str(toml: &str) -> Result<AppConfig> {
        let figment =
            Figment::from(Serialized::defaults(AppConfig::default())).merge(Toml::string(toml));

        Self::extract(&figment)
    }

    fn extract(figment: &Figment) -> Result<AppConfig> {
        let config: AppConfig = figment
            .extract()
            .context("Failed to parse pipeline configuration")?;
        config.validate()?;

        Ok(config)
    }
}
