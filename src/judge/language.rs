//! Language table: file names and compile/run command templates.
//!
//! Command templates are token lists. `{source}` and `{executable}` are
//! substituted inside tokens; a token that is exactly `{flags}` expands to
//! the optimization, warning and diagnostic flags of the request.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How to compile and run one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageSpec {
    /// File name the submitted source is staged under.
    pub source_file: String,
    /// Artifact produced by the compile step and carried to every run.
    pub executable: String,
    pub compile: Vec<String>,
    pub run: Vec<String>,
    /// Whether `{flags}` and the header/function policy apply.
    #[serde(default)]
    pub native: bool,
}

impl LanguageSpec {
    fn expand(&self, template: &[String], flags: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(template.len() + flags.len());
        for token in template {
            if token == "{flags}" {
                argv.extend(flags.iter().cloned());
            } else {
                argv.push(
                    token
                        .replace("{source}", &self.source_file)
                        .replace("{executable}", &self.executable),
                );
            }
        }
        argv
    }

    pub fn compile_argv(&self, optimization: OptimizationLevel, warnings: WarningLevel) -> Vec<String> {
        let flags = if self.native {
            compiler_flags(optimization, warnings)
        } else {
            Vec::new()
        };
        self.expand(&self.compile, &flags)
    }

    pub fn run_argv(&self) -> Vec<String> {
        self.expand(&self.run, &[])
    }
}

fn tokens(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_string()).collect()
}

/// Languages available without any configuration.
pub fn builtin_languages() -> HashMap<String, LanguageSpec> {
    HashMap::from([
        (
            "c".to_string(),
            LanguageSpec {
                source_file: "main.c".into(),
                executable: "main".into(),
                compile: tokens(&["gcc", "-std=c17", "{flags}", "-o", "{executable}", "{source}", "-lm"]),
                run: tokens(&["./{executable}"]),
                native: true,
            },
        ),
        (
            "cpp".to_string(),
            LanguageSpec {
                source_file: "main.cpp".into(),
                executable: "main".into(),
                compile: tokens(&["g++", "-std=c++17", "{flags}", "-o", "{executable}", "{source}"]),
                run: tokens(&["./{executable}"]),
                native: true,
            },
        ),
        (
            "python3".to_string(),
            LanguageSpec {
                source_file: "main.py".into(),
                executable: "main.py".into(),
                compile: tokens(&["python3", "-m", "py_compile", "{source}"]),
                run: tokens(&["python3", "{executable}"]),
                native: false,
            },
        ),
    ])
}

/// `-O` level passed to native compilers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizationLevel {
    O0,
    O1,
    #[default]
    O2,
    O3,
    Os,
}

impl OptimizationLevel {
    pub const fn flag(self) -> &'static str {
        match self {
            Self::O0 => "-O0",
            Self::O1 => "-O1",
            Self::O2 => "-O2",
            Self::O3 => "-O3",
            Self::Os => "-Os",
        }
    }
}

impl FromStr for OptimizationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('-').trim_start_matches(['O', 'o']) {
            "0" => Ok(Self::O0),
            "1" => Ok(Self::O1),
            "2" => Ok(Self::O2),
            "3" => Ok(Self::O3),
            "s" => Ok(Self::Os),
            _ => Err(format!("unknown optimization level `{s}`")),
        }
    }
}

impl fmt::Display for OptimizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

/// Warning flags passed to native compilers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    None,
    #[default]
    Default,
    All,
    Extra,
    Error,
}

impl WarningLevel {
    pub fn flags(self) -> &'static [&'static str] {
        match self {
            Self::None => &["-w"],
            Self::Default => &[],
            Self::All => &["-Wall"],
            Self::Extra => &["-Wall", "-Wextra"],
            Self::Error => &["-Wall", "-Wextra", "-Werror"],
        }
    }
}

impl FromStr for WarningLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "default" | "" => Ok(Self::Default),
            "all" => Ok(Self::All),
            "extra" => Ok(Self::Extra),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown warning level `{s}`")),
        }
    }
}

/// Flags for one native compile.
pub fn compiler_flags(optimization: OptimizationLevel, warnings: WarningLevel) -> Vec<String> {
    let mut flags = vec![optimization.flag().to_string()];
    flags.extend(warnings.flags().iter().map(|f| (*f).to_string()));
    flags.push("-fdiagnostics-color=never".to_string());
    flags
}
