use anyhow::{Context, Result};
use facesig_core::{DetectionConfig, ScoringConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: an optional TOML file, then `FACESIG_*` environment
/// overrides. Command-line flags are applied last by the caller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the OpenCV `haarcascade_*.xml` files.
    pub cascade_dir: PathBuf,
    pub detection: DetectionConfig,
    pub scoring: ScoringConfig,
    /// Attach a base64 PNG of the face crop to `encode` output.
    pub thumbnails: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cascade_dir: PathBuf::from(facesig_core::DEFAULT_CASCADE_DIR),
            detection: DetectionConfig::default(),
            scoring: ScoringConfig::default(),
            thumbnails: true,
        }
    }
}

impl Config {
    /// Read `path` (if any), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `FACESIG_*` overrides looked up through `var`. Unparseable
    /// values are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("FACESIG_CASCADE_DIR") {
            self.cascade_dir = PathBuf::from(dir);
        }
        self.scoring.threshold = parse_or(&var, "FACESIG_SIMILARITY_THRESHOLD", self.scoring.threshold);
        self.detection.parallel = var("FACESIG_PARALLEL")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(self.detection.parallel);
        self.thumbnails = var("FACESIG_THUMBNAILS")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(self.thumbnails);
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
