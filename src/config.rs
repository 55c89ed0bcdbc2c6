use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment, File};
use home::home_dir;
use serde::Deserialize;

const DEFAULT_TTL_SECS: u64 = 3600;
const DEFAULT_REF: &str = "master";

/// Everything the fetcher needs to know about its environment. Nothing is
/// read from process-global state after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    pub cache_dir: PathBuf,
    pub store_dir: PathBuf,
    /// How long a fetched mutable reference is considered fresh.
    pub ttl: Duration,
    /// Whether uncommitted working trees may be fetched.
    pub allow_dirty: bool,
    pub warn_dirty: bool,
    /// Treat `file://` repositories like remote ones (mirror, fetch, export).
    pub force_remote: bool,
    /// Reference fetched from remote repositories when none is given.
    pub default_ref: String,
    pub git_program: String,
}

impl FetchSettings {
    /// Defaults for a given cache directory; the store lives below it.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        Self {
            store_dir: cache_dir.join("store"),
            cache_dir,
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            allow_dirty: true,
            warn_dirty: true,
            force_remote: false,
            default_ref: DEFAULT_REF.to_owned(),
            git_program: "git".to_owned(),
        }
    }

    /// Loads the optional configuration file and `SRCFETCH_*` environment
    /// variables, the latter taking precedence.
    pub fn load() -> Result<Self, ConfigError> {
        let raw_config = RawConfig::load(default_config_file().as_deref(), None)?;
        let cache_dir = match raw_config.cache.dir.clone() {
            Some(dir) => dir,
            None => default_cache_directory().ok_or_else(|| {
                ConfigError::Message(
                    "Could not find the home directory, please set $HOME or SRCFETCH_CACHE__DIR"
                        .to_owned(),
                )
            })?,
        };
        Ok(Self::from_raw(cache_dir, raw_config))
    }

    fn from_raw(cache_dir: PathBuf, raw_config: RawConfig) -> Self {
        let defaults = Self::new(cache_dir);
        let RawConfig {
            cache: _,
            store,
            fetch,
            git,
        } = raw_config;
        Self {
            store_dir: store.dir.unwrap_or(defaults.store_dir),
            ttl: fetch.ttl.map(Duration::from_secs).unwrap_or(defaults.ttl),
            allow_dirty: fetch.allow_dirty.unwrap_or(defaults.allow_dirty),
            warn_dirty: fetch.warn_dirty.unwrap_or(defaults.warn_dirty),
            force_remote: git.force_remote.unwrap_or(defaults.force_remote),
            default_ref: git.default_ref.unwrap_or(defaults.default_ref),
            git_program: git.program.unwrap_or(defaults.git_program),
            cache_dir: defaults.cache_dir,
        }
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    fetch: FetchConfig,
    #[serde(default)]
    git: GitConfig,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct CacheConfig {
    dir: Option<PathBuf>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct StoreConfig {
    dir: Option<PathBuf>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct FetchConfig {
    ttl: Option<u64>,
    allow_dirty: Option<bool>,
    warn_dirty: Option<bool>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct GitConfig {
    force_remote: Option<bool>,
    default_ref: Option<String>,
    program: Option<String>,
}

impl RawConfig {
    fn load(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(false));
        }
        builder
            .add_source(
                Environment::with_prefix("SRCFETCH")
                    .prefix_separator("_")
                    .separator("__")
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }
}

fn xdg_dir(variable: &str, fallback: &str) -> Option<PathBuf> {
    env::var_os(variable)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| home_dir().map(|home| home.join(fallback)))
}

fn default_config_file() -> Option<PathBuf> {
    xdg_dir("XDG_CONFIG_HOME", ".config").map(|dir| dir.join("srcfetch/config.toml"))
}

pub fn default_cache_directory() -> Option<PathBuf> {
    xdg_dir("XDG_CACHE_HOME", ".cache").map(|dir| dir.join("srcfetch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn load_empty() {
        let env = HashMap::from([]);
        let config = RawConfig::load(None, Some(env)).unwrap();
        assert_eq!(config, RawConfig::default());

        let settings = FetchSettings::from_raw("/cache".into(), config);
        assert_eq!(settings, FetchSettings::new("/cache"));
        assert_eq!(settings.store_dir, PathBuf::from("/cache/store"));
        assert_eq!(settings.ttl, Duration::from_secs(3600));
        assert_eq!(settings.default_ref, "master");
    }

    #[test]
    fn load_environment() {
        let env = HashMap::from([
            ("SRCFETCH_CACHE__DIR".to_owned(), "/cache".to_owned()),
            ("SRCFETCH_FETCH__TTL".to_owned(), "60".to_owned()),
            ("SRCFETCH_FETCH__ALLOW_DIRTY".to_owned(), "false".to_owned()),
            ("SRCFETCH_GIT__FORCE_REMOTE".to_owned(), "true".to_owned()),
            ("SRCFETCH_GIT__DEFAULT_REF".to_owned(), "main".to_owned()),
        ]);
        let config = RawConfig::load(None, Some(env)).unwrap();
        assert_eq!(
            config,
            RawConfig {
                cache: CacheConfig {
                    dir: Some("/cache".into())
                },
                store: StoreConfig { dir: None },
                fetch: FetchConfig {
                    ttl: Some(60),
                    allow_dirty: Some(false),
                    warn_dirty: None,
                },
                git: GitConfig {
                    force_remote: Some(true),
                    default_ref: Some("main".to_owned()),
                    program: None,
                }
            }
        );

        let settings = FetchSettings::from_raw("/cache".into(), config);
        assert_eq!(settings.ttl, Duration::from_secs(60));
        assert!(!settings.allow_dirty);
        assert!(settings.warn_dirty);
        assert!(settings.force_remote);
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(
            &file,
            "[store]\ndir = \"/file-store\"\n\n[git]\ndefault_ref = \"trunk\"\nprogram = \"/usr/bin/git\"\n",
        )
        .unwrap();
        let env = HashMap::from([("SRCFETCH_GIT__DEFAULT_REF".to_owned(), "main".to_owned())]);

        let config = RawConfig::load(Some(&file), Some(env)).unwrap();
        assert_eq!(config.store.dir, Some(PathBuf::from("/file-store")));
        assert_eq!(config.git.default_ref.as_deref(), Some("main"));
        assert_eq!(config.git.program.as_deref(), Some("/usr/bin/git"));

        let missing = RawConfig::load(Some(&dir.path().join("absent.toml")), Some(HashMap::new()));
        assert_eq!(missing.unwrap(), RawConfig::default());
    }
}
