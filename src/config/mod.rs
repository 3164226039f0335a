//! The declarative spec tree (`ConfigSpec`): the validated shape of the
//! TOML configuration file. Parsing never silently drops unknown keys —
//! every `*Spec` struct uses `deny_unknown_fields` — and the deprecated
//! `user` field is rejected simply by not existing as a recognized key.

pub mod expand;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{CommandRunnerError, Result};

fn default_max_output_size() -> u64 {
    1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSpec {
    pub version: String,
    pub global: GlobalSpec,
    #[serde(default)]
    pub command_templates: HashMap<String, CommandTemplate>,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSpec {
    pub timeout: u64,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub env_file: Option<PathBuf>,
    #[serde(default)]
    pub verify_files: Vec<String>,
    /// `None` = inherit (there is nothing to inherit at the global level,
    /// so `None` here behaves as "deny all imports"); `Some(vec![])` =
    /// reject; `Some(names)` = explicit allow-list.
    #[serde(default)]
    pub env_allowed: Option<Vec<String>>,
    #[serde(default)]
    pub env_import: Vec<String>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_max_output_size")]
    pub max_output_size: u64,
    #[serde(default)]
    pub skip_standard_paths: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i64,
    /// Absent (`None`) means "inherit global.workdir"; `Some(String::new())`
    /// means "explicitly pin this group's cwd", which must not be
    /// collapsed with `None` anywhere in the expansion pipeline.
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub temp_dir: bool,
    #[serde(default)]
    pub verify_files: Vec<String>,
    #[serde(default)]
    pub env_allowed: Option<Vec<String>>,
    #[serde(default)]
    pub env_import: Vec<String>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub env_import: Vec<String>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub run_as_user: Option<String>,
    #[serde(default)]
    pub run_as_group: Option<String>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub max_output_size: Option<u64>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandTemplate {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub env_import: Vec<String>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub max_output_size: Option<u64>,
}

impl ConfigSpec {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let spec: Self = toml::from_str(text).map_err(|e| {
            CommandRunnerError::ConfigInvalid(format!("config parse error: {e}"))
        })?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<()> {
        if self.version != "1.0" {
            return Err(CommandRunnerError::ConfigInvalid(format!(
                "unsupported config version: {}",
                self.version
            )));
        }
        if self.global.timeout == 0 {
            return Err(CommandRunnerError::ConfigInvalid(
                "global.timeout must be positive".to_string(),
            ));
        }
        if self.global.max_output_size == 0 {
            return Err(CommandRunnerError::ConfigInvalid(
                "global.max_output_size must be positive".to_string(),
            ));
        }

        let mut group_names = std::collections::HashSet::new();
        for group in &self.groups {
            if group.name.is_empty() {
                return Err(CommandRunnerError::ConfigInvalid(
                    "group name cannot be empty".to_string(),
                ));
            }
            if !group_names.insert(group.name.clone()) {
                return Err(CommandRunnerError::ConfigInvalid(format!(
                    "duplicate group name: {}",
                    group.name
                )));
            }

            let mut command_names = std::collections::HashSet::new();
            for command in &group.commands {
                if !command_names.insert(command.name.clone()) {
                    return Err(CommandRunnerError::ConfigInvalid(format!(
                        "duplicate command name '{}' in group '{}'",
                        command.name, group.name
                    )));
                }
                if let Some(t) = command.timeout
                    && t == 0
                {
                    return Err(CommandRunnerError::ConfigInvalid(format!(
                        "command '{}' has non-positive timeout",
                        command.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Parse an `internal=EXTERNAL` mapping entry from `env_import`.
pub fn parse_env_import_entry(entry: &str) -> Result<(String, String)> {
    let (internal, external) = entry.trim().split_once('=').ok_or_else(|| {
        CommandRunnerError::InvalidVariableFormat(format!(
            "env_import entry '{entry}' is not of the form internal=EXTERNAL"
        ))
    })?;
    if internal.is_empty() || external.is_empty() {
        return Err(CommandRunnerError::InvalidVariableFormat(format!(
            "env_import entry '{entry}' has an empty side"
        )));
    }
    Ok((internal.to_string(), external.to_string()))
}

/// Reject an `output_file` value that could escape the command's workdir:
/// absolute paths and any `..` component are invalid.
pub fn validate_output_relative_path(path: &str) -> Result<()> {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return Err(CommandRunnerError::OutputPathInvalid(format!(
            "output_file must be relative: {path}"
        )));
    }
    if p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(CommandRunnerError::OutputPathInvalid(format!(
            "output_file must not contain '..': {path}"
        )));
    }
    Ok(())
}

/// Parse a `KEY=value` line from an `env_file`.
pub fn parse_env_file(contents: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            CommandRunnerError::ConfigInvalid(format!("malformed env_file line: {line}"))
        })?;
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_top_level_key() {
        let toml = r#"
            version = "1.0"
            bogus = true
            [global]
            timeout = 30
        "#;
        assert!(ConfigSpec::from_toml_str(toml).is_err());
    }

    #[test]
    fn rejects_deprecated_user_field() {
        let toml = r#"
            version = "1.0"
            [global]
            timeout = 30
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "echo"
            user = "root"
        "#;
        assert!(ConfigSpec::from_toml_str(toml).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let toml = r#"
            version = "2.0"
            [global]
            timeout = 30
        "#;
        assert!(ConfigSpec::from_toml_str(toml).is_err());
    }

    #[test]
    fn accepts_minimal_valid_config() {
        let toml = r#"
            version = "1.0"
            [global]
            timeout = 30
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "echo"
            args = ["hi"]
        "#;
        assert!(ConfigSpec::from_toml_str(toml).is_ok());
    }

    #[test]
    fn rejects_duplicate_group_names() {
        let toml = r#"
            version = "1.0"
            [global]
            timeout = 30
            [[groups]]
            name = "g"
            [[groups]]
            name = "g"
        "#;
        assert!(ConfigSpec::from_toml_str(toml).is_err());
    }

    #[test]
    fn env_import_entry_parses() {
        assert_eq!(
            parse_env_import_entry("home=HOME").unwrap(),
            ("home".to_string(), "HOME".to_string())
        );
        assert!(parse_env_import_entry("malformed").is_err());
    }

    #[test]
    fn env_file_parses_key_value_lines() {
        let parsed = parse_env_file("# comment\nFOO=bar\nBAZ=qux\n").unwrap();
        assert_eq!(parsed.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(parsed.get("BAZ"), Some(&"qux".to_string()));
    }
}
