//! Configuration for the executor.
//!
//! Loaded from a JSON file given on the command line, or from JSON in the
//! `SANDBOX_EXECUTOR_CONFIG` environment variable. Every field has a
//! default, so an empty object (or no configuration at all) is valid.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::judge::language::{builtin_languages, LanguageSpec};

/// Environment variable holding the JSON configuration.
pub const CONFIG_ENV: &str = "SANDBOX_EXECUTOR_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSection,

    #[serde(default)]
    pub judge: JudgeSection,

    /// Extra or replacement languages, merged over the built-in table.
    #[serde(default)]
    pub languages: HashMap<String, LanguageSpec>,
}

/// Sandbox pool settings (as read from JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    /// Path or name of the isolate executable.
    #[serde(default = "default_isolate_bin")]
    pub isolate_bin: String,

    /// Shell spawned once per slot.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// isolate's box root; slot `N` lives in `<sandbox_root>/N/box`.
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: PathBuf,

    /// Number of sandboxes, i.e. the maximum number of concurrent runs.
    #[serde(default = "default_box_count")]
    pub box_count: usize,

    /// Where the per-slot metadata reports are written.
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,

    /// Fixed slack added to every supervisory timeout.
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,

    /// Timeout for init and cleanup commands.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_wall_time_multiplier")]
    pub wall_time_multiplier: f64,

    #[serde(default = "default_wall_time_offset_ms")]
    pub wall_time_offset_ms: u64,

    #[serde(default)]
    pub use_cgroups: bool,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            isolate_bin: default_isolate_bin(),
            shell: default_shell(),
            sandbox_root: default_sandbox_root(),
            box_count: default_box_count(),
            metadata_dir: default_metadata_dir(),
            base_timeout_ms: default_base_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            wall_time_multiplier: default_wall_time_multiplier(),
            wall_time_offset_ms: default_wall_time_offset_ms(),
            use_cgroups: false,
        }
    }
}

/// Compile-and-run settings (as read from JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct JudgeSection {
    /// Requests with more inputs than this are rejected.
    #[serde(default = "default_max_inputs")]
    pub max_inputs: usize,

    /// Parent of per-request scratch directories. System temp if unset.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    #[serde(default = "default_compile_priority")]
    pub compile_priority: i32,

    #[serde(default)]
    pub run_priority: i32,

    /// Process limit for compilers. Unlimited if unset.
    #[serde(default)]
    pub compile_processes: Option<u32>,
}

impl Default for JudgeSection {
    fn default() -> Self {
        Self {
            max_inputs: default_max_inputs(),
            scratch_dir: None,
            compile_priority: default_compile_priority(),
            run_priority: 0,
            compile_processes: None,
        }
    }
}

fn default_isolate_bin() -> String {
    "isolate".into()
}

fn default_shell() -> String {
    "/bin/sh".into()
}

fn default_sandbox_root() -> PathBuf {
    "/var/local/lib/isolate".into()
}

fn default_metadata_dir() -> PathBuf {
    "/tmp/sandbox-executor/meta".into()
}

const fn default_box_count() -> usize {
    4
}

const fn default_base_timeout_ms() -> u64 {
    2000
}

const fn default_command_timeout_ms() -> u64 {
    10_000
}

const fn default_wall_time_multiplier() -> f64 {
    2.0
}

const fn default_wall_time_offset_ms() -> u64 {
    1000
}

const fn default_max_inputs() -> usize {
    32
}

const fn default_compile_priority() -> i32 {
    1
}

impl Config {
    /// Load from `path` if given, else from the environment, else defaults.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env()?.unwrap_or_default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Read JSON from `SANDBOX_EXECUTOR_CONFIG`, if set.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(json) = std::env::var(CONFIG_ENV) else {
            debug!("{CONFIG_ENV} not set, using defaults");
            return Ok(None);
        };
        let config: Self =
            serde_json::from_str(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}"))?;
        Ok(Some(config))
    }

    /// Apply `SANDBOX_BOX_COUNT`, `SANDBOX_ROOT` and `SANDBOX_ISOLATE_BIN`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(count) = lookup("SANDBOX_BOX_COUNT") {
            let count: usize = count
                .trim()
                .parse()
                .ok()
                .filter(|&n| n > 0)
                .with_context(|| format!("SANDBOX_BOX_COUNT must be a positive integer, got `{count}`"))?;
            info!(box_count = count, "Box count overridden from environment");
            self.pool.box_count = count;
        }
        if let Some(root) = lookup("SANDBOX_ROOT") {
            info!(root = %root, "Sandbox root overridden from environment");
            self.pool.sandbox_root = PathBuf::from(root);
        }
        if let Some(bin) = lookup("SANDBOX_ISOLATE_BIN") {
            info!(isolate = %bin, "Isolate binary overridden from environment");
            self.pool.isolate_bin = bin;
        }
        Ok(())
    }

    /// Built-in languages with configured ones merged over them.
    ///
    /// Configured languages override built-ins on name collision (with info log).
    pub fn resolved_languages(&self) -> HashMap<String, LanguageSpec> {
        let mut languages = builtin_languages();
        for (name, spec) in &self.languages {
            if languages.contains_key(name) {
                info!(name = %name, "Configured language overrides built-in");
            }
            languages.insert(name.clone(), spec.clone());
        }
        languages
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_string())
        }
    }

    #[test]
    fn empty_object_uses_defaults() {
        let config = Config::from_json("{}").unwrap();

        assert_eq!(config.pool.isolate_bin, "isolate");
        assert_eq!(config.pool.shell, "/bin/sh");
        assert_eq!(config.pool.sandbox_root, PathBuf::from("/var/local/lib/isolate"));
        assert_eq!(config.pool.box_count, 4);
        assert_eq!(config.pool.base_timeout_ms, 2000);
        assert_eq!(config.pool.command_timeout_ms, 10_000);
        assert!((config.pool.wall_time_multiplier - 2.0).abs() < f64::EPSILON);
        assert!(!config.pool.use_cgroups);

        assert_eq!(config.judge.max_inputs, 32);
        assert_eq!(config.judge.compile_priority, 1);
        assert_eq!(config.judge.run_priority, 0);
        assert!(config.judge.compile_processes.is_none());
        assert!(config.judge.scratch_dir.is_none());
        assert!(config.languages.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "pool": {
                "isolate_bin": "/usr/local/bin/isolate",
                "box_count": 8,
                "use_cgroups": true,
                "wall_time_offset_ms": 500
            },
            "judge": {
                "max_inputs": 4,
                "scratch_dir": "/srv/scratch",
                "compile_processes": 16
            },
            "languages": {
                "shell": {
                    "source_file": "main.sh",
                    "executable": "main",
                    "compile": ["/bin/sh", "-n", "{source}"],
                    "run": ["/bin/sh", "{executable}"]
                }
            }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.pool.isolate_bin, "/usr/local/bin/isolate");
        assert_eq!(config.pool.box_count, 8);
        assert!(config.pool.use_cgroups);
        assert_eq!(config.pool.wall_time_offset_ms, 500);
        // Unset fields keep their defaults
        assert_eq!(config.pool.shell, "/bin/sh");

        assert_eq!(config.judge.max_inputs, 4);
        assert_eq!(config.judge.scratch_dir, Some(PathBuf::from("/srv/scratch")));
        assert_eq!(config.judge.compile_processes, Some(16));

        let shell = &config.languages["shell"];
        assert_eq!(shell.source_file, "main.sh");
        assert!(!shell.native);
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"pool": {"box_count": 2}}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.pool.box_count, 2);
    }

    #[test]
    fn from_file_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn from_file_missing() {
        let err = Config::from_file(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("SANDBOX_BOX_COUNT", "6"),
                ("SANDBOX_ROOT", "/tmp/boxes"),
                ("SANDBOX_ISOLATE_BIN", "/opt/isolate"),
            ]))
            .unwrap();

        assert_eq!(config.pool.box_count, 6);
        assert_eq!(config.pool.sandbox_root, PathBuf::from("/tmp/boxes"));
        assert_eq!(config.pool.isolate_bin, "/opt/isolate");
    }

    #[test]
    fn env_overrides_absent() {
        let mut config = Config::default();
        config.apply_overrides(env(&[])).unwrap();
        assert_eq!(config.pool.box_count, 4);
        assert_eq!(config.pool.isolate_bin, "isolate");
    }

    #[test]
    fn invalid_box_count_override() {
        let mut config = Config::default();
        assert!(config.apply_overrides(env(&[("SANDBOX_BOX_COUNT", "many")])).is_err());
        assert!(config.apply_overrides(env(&[("SANDBOX_BOX_COUNT", "0")])).is_err());
        assert_eq!(config.pool.box_count, 4);
    }

    #[test]
    fn configured_languages_override_builtins() {
        let json = r#"{
            "languages": {
                "c": {
                    "source_file": "prog.c",
                    "executable": "prog",
                    "compile": ["clang", "{flags}", "-o", "{executable}", "{source}"],
                    "run": ["./{executable}"],
                    "native": true
                },
                "ruby": {
                    "source_file": "main.rb",
                    "executable": "main.rb",
                    "compile": ["ruby", "-c", "{source}"],
                    "run": ["ruby", "{executable}"]
                }
            }
        }"#;

        let languages = Config::from_json(json).unwrap().resolved_languages();
        assert_eq!(languages["c"].compile[0], "clang");
        assert_eq!(languages["ruby"].run, vec!["ruby", "{executable}"]);
        assert!(languages.contains_key("cpp"));
        assert!(languages.contains_key("python3"));
    }
}
