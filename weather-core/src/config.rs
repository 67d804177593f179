use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::{HashMap, HashSet}, fmt, fs, path::{Path, PathBuf}, str::FromStr, time::Duration};

use crate::warehouse::{TableRef, city_slug, is_identifier, is_project_id};

/// The provider never serves more history than this through the pipeline.
pub const MAX_LOOKBACK_DAYS: u32 = 30;

pub const DEFAULT_API_BASE_URL: &str = "https://api.openweathermap.org";

/// A city to ingest, identified by name and coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityConfig {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl CityConfig {
    pub fn new(name: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self { name: name.into(), lat, lon }
    }
}

/// Unit system passed through to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    Standard,
    Metric,
    #[default]
    Imperial,
}

impl Units {
    pub fn as_str(&self) -> &'static str {
        match self {
            Units::Standard => "standard",
            Units::Metric => "metric",
            Units::Imperial => "imperial",
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Units {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(Units::Standard),
            "metric" => Ok(Units::Metric),
            "imperial" => Ok(Units::Imperial),
            _ => Err(anyhow!("Unknown units '{s}'. Supported: standard, metric, imperial.")),
        }
    }
}

/// What the pipeline does when one city's staging or merge fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Record the failure and carry on with the next city.
    #[default]
    Continue,
    /// Stop the run at the first failing city.
    Abort,
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(FailurePolicy::Continue),
            "abort" => Ok(FailurePolicy::Abort),
            _ => Err(anyhow!("Unknown failure policy '{s}'. Supported: continue, abort.")),
        }
    }
}

/// Top-level configuration.
///
/// Layered as: compiled-in defaults, then the TOML file, then environment
/// variables (a `.env` file in the working directory is honoured).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OpenWeather API key. Usually supplied through `WEATHER_API_KEY`.
    pub api_key: String,
    pub project_id: String,
    pub dataset: String,
    pub table_name: String,

    /// Example TOML:
    /// [[cities]]
    /// name = "Seattle"
    /// lat = 47.6062
    /// lon = -122.3321
    pub cities: Vec<CityConfig>,

    /// Days before today to fetch; offsets `0..=lookback_days` are requested.
    pub lookback_days: u32,
    pub rate_limit_delay_ms: u64,
    pub units: Units,
    pub api_base_url: String,

    /// Root directory of the SQLite warehouse. Defaults to the platform data dir.
    pub warehouse_dir: Option<PathBuf>,
    pub failure_policy: FailurePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            project_id: "seattle-weather-analytics".to_string(),
            dataset: "weather_raw".to_string(),
            table_name: "seattle_weather_history".to_string(),
            cities: default_cities(),
            lookback_days: MAX_LOOKBACK_DAYS,
            rate_limit_delay_ms: 100,
            units: Units::default(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            warehouse_dir: None,
            failure_policy: FailurePolicy::default(),
        }
    }
}

pub fn default_cities() -> Vec<CityConfig> {
    vec![
        CityConfig::new("Seattle", 47.6062, -122.3321),
        CityConfig::new("Portland", 45.5152, -122.6784),
        CityConfig::new("San Francisco", 37.7749, -122.4194),
        CityConfig::new("Vancouver", 49.2827, -123.1207),
    ]
}

impl Config {
    /// Load the layered configuration and validate it.
    ///
    /// An explicit `path` must exist; the default config file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = Self::load_unvalidated(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// File and environment layers, without validation. Commands that never
    /// call the provider use this so they work without an API key.
    pub fn load_unvalidated(path: Option<&Path>) -> Result<Self> {
        let mut cfg = Self::load_file_layer(path)?;

        load_dotenv(dotenvy::dotenv())?;
        cfg.apply_env(|key| std::env::var(key).ok())?;

        Ok(cfg)
    }

    /// Load the file layer only, without environment overrides or validation.
    pub fn load_file_layer(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Self::config_file_path()?;
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    // First run: no config file, use defaults.
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `WEATHER_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("WEATHER_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = get("WEATHER_PROJECT_ID") {
            self.project_id = v;
        }
        if let Some(v) = get("WEATHER_DATASET") {
            self.dataset = v;
        }
        if let Some(v) = get("WEATHER_TABLE") {
            self.table_name = v;
        }
        if let Some(v) = get("WEATHER_LOOKBACK_DAYS") {
            self.lookback_days = v
                .trim()
                .parse()
                .with_context(|| format!("WEATHER_LOOKBACK_DAYS is not a number: {v}"))?;
        }
        if let Some(v) = get("WEATHER_RATE_LIMIT_DELAY_MS") {
            self.rate_limit_delay_ms = v
                .trim()
                .parse()
                .with_context(|| format!("WEATHER_RATE_LIMIT_DELAY_MS is not a number: {v}"))?;
        }
        if let Some(v) = get("WEATHER_UNITS") {
            self.units = v.parse()?;
        }
        if let Some(v) = get("WEATHER_API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = get("WEATHER_WAREHOUSE_DIR") {
            self.warehouse_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("WEATHER_FAILURE_POLICY") {
            self.failure_policy = v.parse()?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            bail!(
                "No API key configured.\n\
                 Hint: set WEATHER_API_KEY or run `weather-ingest configure`."
            );
        }
        if self.lookback_days > MAX_LOOKBACK_DAYS {
            bail!(
                "lookback_days = {} exceeds the supported maximum of {MAX_LOOKBACK_DAYS}",
                self.lookback_days
            );
        }
        if !is_project_id(&self.project_id) {
            bail!("Invalid project id '{}': use letters, digits, '-' or '_'", self.project_id);
        }
        for (what, name) in [("dataset", &self.dataset), ("table", &self.table_name)] {
            if !is_identifier(name) {
                bail!("Invalid {what} name '{name}': use letters, digits or '_' and start with a letter");
            }
        }
        if self.cities.is_empty() {
            bail!("No cities configured");
        }

        let mut seen = HashSet::new();
        let mut slugs: HashMap<String, &str> = HashMap::new();
        for city in &self.cities {
            if city.name.trim().is_empty() {
                bail!("City names must not be empty");
            }
            if !seen.insert(city.name.as_str()) {
                bail!("City '{}' is configured more than once", city.name);
            }

            // Each city stages into a table named after its slug.
            let slug = city_slug(&city.name);
            if slug.is_empty() {
                bail!(
                    "City name '{}' needs at least one ASCII letter or digit to name its staging table",
                    city.name
                );
            }
            if let Some(other) = slugs.insert(slug, city.name.as_str()) {
                bail!("Cities '{other}' and '{}' would share a staging table; rename one", city.name);
            }
            if !(-90.0..=90.0).contains(&city.lat) || !(-180.0..=180.0).contains(&city.lon) {
                bail!(
                    "City '{}' has out-of-range coordinates ({}, {})",
                    city.name,
                    city.lat,
                    city.lon
                );
            }
        }

        Ok(())
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    /// The permanent table all cities merge into.
    pub fn target_table(&self) -> Result<TableRef> {
        Ok(TableRef::new(&self.project_id, &self.dataset, &self.table_name)?)
    }

    /// Keep only the named cities, in configuration order.
    pub fn retain_cities(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }

        if let Some(unknown) = names.iter().find(|n| !self.cities.iter().any(|c| &c.name == *n)) {
            let known: Vec<&str> = self.cities.iter().map(|c| c.name.as_str()).collect();
            bail!("Unknown city '{unknown}'. Configured cities: {}.", known.join(", "));
        }

        self.cities.retain(|c| names.contains(&c.name));
        Ok(())
    }

    /// Warehouse root, falling back to the platform data directory.
    pub fn warehouse_root(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.warehouse_dir {
            return Ok(dir.clone());
        }

        let dirs = project_dirs()?;
        Ok(dirs.data_dir().join("warehouse"))
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(&path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(path)
    }

    /// Path to the default config file.
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }
}

/// A missing `.env` is the normal case; anything else, including a line
/// dotenvy cannot parse, is an error.
fn load_dotenv(loaded: dotenvy::Result<PathBuf>) -> Result<()> {
    match loaded {
        Ok(_) => Ok(()),
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context("Failed to load .env"),
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "weather-ingest", "weather-ingest")
        .ok_or_else(|| anyhow!("Could not determine platform config directory"))
}
