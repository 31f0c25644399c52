//! Environment settings and the immutable engine configuration loaded from `companies.yaml`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use pipewatch_core::{Company, NormalizationRules, Normalizer};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub evidence_dir: PathBuf,
    pub companies_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub lock_ttl_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/pipewatch.db".to_string()),
            evidence_dir: std::env::var("EVIDENCE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/evidence")),
            companies_path: std::env::var("PIPEWATCH_COMPANIES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./config/companies.yaml")),
            user_agent: std::env::var("PIPEWATCH_USER_AGENT")
                .unwrap_or_else(|_| "pipewatch/0.1 (+pipeline research)".to_string()),
            http_timeout_secs: std::env::var("PIPEWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(45),
            lock_ttl_secs: std::env::var("PIPEWATCH_LOCK_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6 * 60 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("company {0:?} is configured more than once")]
    DuplicateCompany(String),
    #[error("company ids must be non-empty")]
    EmptyCompanyId,
    #[error("review_threshold must be within 0..=1, got {0}")]
    InvalidThreshold(f64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompanyConfig {
    #[serde(alias = "company_id")]
    pub id: String,
    pub name: String,
    /// Names matched against lead sponsor and collaborators of studies.
    #[serde(default)]
    pub sponsor_aliases: Vec<String>,
    #[serde(default)]
    pub curated_assets_file: Option<PathBuf>,
    #[serde(default)]
    pub pipeline_bundle: Option<PathBuf>,
    /// `canonical name -> aliases`, merged with seeds carried by snapshots.
    #[serde(default)]
    pub alias_seeds: BTreeMap<String, Vec<String>>,
}

impl CompanyConfig {
    pub fn company(&self) -> Company {
        Company {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LinkingConfig {
    /// Jaro-Winkler score above which an unmatched intervention is reported for review.
    pub review_threshold: f64,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.88,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompaniesFile {
    companies: Vec<CompanyConfig>,
    #[serde(default)]
    normalization: NormalizationRules,
    #[serde(default)]
    linking: LinkingConfig,
}

/// Loaded once per process and shared read-only by every run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    companies: Vec<CompanyConfig>,
    normalizer: Normalizer,
    linking: LinkingConfig,
    lock_ttl: Duration,
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>, lock_ttl: Duration) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml_str(&text, base_dir, lock_ttl).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    /// Relative file paths in the document resolve against `base_dir`.
    pub fn from_yaml_str(
        text: &str,
        base_dir: &Path,
        lock_ttl: Duration,
    ) -> Result<Self, ConfigError> {
        let file: CompaniesFile =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
                path: "<inline>".to_string(),
                source,
            })?;

        if !(0.0..=1.0).contains(&file.linking.review_threshold) {
            return Err(ConfigError::InvalidThreshold(file.linking.review_threshold));
        }

        let mut seen = HashSet::new();
        let mut companies = Vec::with_capacity(file.companies.len());
        for mut company in file.companies {
            company.id = company.id.trim().to_string();
            if company.id.is_empty() {
                return Err(ConfigError::EmptyCompanyId);
            }
            if !seen.insert(company.id.clone()) {
                return Err(ConfigError::DuplicateCompany(company.id));
            }
            company.curated_assets_file = company.curated_assets_file.map(|p| resolve(base_dir, p));
            company.pipeline_bundle = company.pipeline_bundle.map(|p| resolve(base_dir, p));
            companies.push(company);
        }

        Ok(Self {
            companies,
            normalizer: Normalizer::new(file.normalization),
            linking: file.linking,
            lock_ttl,
        })
    }

    pub fn companies(&self) -> &[CompanyConfig] {
        &self.companies
    }

    pub fn company(&self, company_id: &str) -> Option<&CompanyConfig> {
        self.companies.iter().find(|c| c.id == company_id)
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn linking(&self) -> LinkingConfig {
        self.linking
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }
}

fn resolve(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
companies:
  - company_id: jnj
    name: Johnson & Johnson
    sponsor_aliases: [Janssen, Johnson & Johnson]
    curated_assets_file: curated/jnj.yaml
    alias_seeds:
      RYBREVANT: [amivantamab]
  - id: immatics
    name: Immatics
normalization:
  max_words: 5
linking:
  review_threshold: 0.9
"#;

    #[test]
    fn parses_companies_and_resolves_paths() {
        let config =
            EngineConfig::from_yaml_str(YAML, Path::new("/etc/pipewatch"), Duration::from_secs(60))
                .expect("config");
        assert_eq!(config.companies().len(), 2);

        let jnj = config.company("jnj").expect("jnj");
        assert_eq!(
            jnj.curated_assets_file.as_deref(),
            Some(Path::new("/etc/pipewatch/curated/jnj.yaml"))
        );
        assert_eq!(jnj.alias_seeds["RYBREVANT"], vec!["amivantamab".to_string()]);
        assert!(config.company("immatics").unwrap().sponsor_aliases.is_empty());
        assert!(config.company("pfizer").is_none());

        assert_eq!(config.normalizer().rules().max_words, 5);
        assert_eq!(config.normalizer().rules().max_label_len, 70);
        assert_eq!(config.linking().review_threshold, 0.9);
    }

    #[test]
    fn rejects_duplicate_company_ids() {
        let yaml = "companies:\n  - {id: jnj, name: A}\n  - {id: jnj, name: B}\n";
        let err = EngineConfig::from_yaml_str(yaml, Path::new("."), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCompany(id) if id == "jnj"));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let yaml = "companies: []\nlinking:\n  review_threshold: 1.5\n";
        assert!(matches!(
            EngineConfig::from_yaml_str(yaml, Path::new("."), Duration::from_secs(1)),
            Err(ConfigError::InvalidThreshold(_))
        ));
    }
}
