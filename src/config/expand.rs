//! C4: configuration expansion.
//!
//! A single bottom-up pass (global → each group → each command) turns a
//! declarative [`super::ConfigSpec`] into a fully-resolved [`RuntimeConfig`].
//! Every marker (`%{name}`, `${name}`) is replaced; every environment
//! variable placed into a command's environment is either a literal `env`
//! entry or an allow-listed, imported system variable.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;

use crate::error::{CommandRunnerError, Result};

use super::{parse_env_import_entry, CommandSpec, CommandTemplate, ConfigSpec, GlobalSpec, GroupSpec};

/// Which level supplied an effective value, recorded for audit purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSource {
    Command,
    Group,
    Global,
    Default,
}

#[derive(Debug)]
pub struct RuntimeGlobal {
    pub spec: GlobalSpec,
    pub expanded_vars: HashMap<String, String>,
    pub expanded_env: HashMap<String, String>,
    pub system_env_cache: HashMap<String, String>,
    pub expanded_verify_files: Vec<PathBuf>,
    pub effective_env_allowlist: HashSet<String>,
    /// Keys placed into `expanded_env` by a literal `env = { ... }` entry at
    /// this level or an ancestor. Invariant §3(2)(b) permits these into a
    /// descendant's `expanded_env` even past a stricter allow-list below.
    pub literal_env_keys: HashSet<String>,
}

#[derive(Debug)]
pub struct RuntimeGroup {
    pub spec: GroupSpec,
    pub parent: Rc<RuntimeGlobal>,
    pub expanded_vars: HashMap<String, String>,
    pub expanded_env: HashMap<String, String>,
    pub expanded_verify_files: Vec<PathBuf>,
    pub effective_env_allowlist: HashSet<String>,
    pub literal_env_keys: HashSet<String>,
}

#[derive(Debug)]
pub struct RuntimeCommand {
    pub spec: CommandSpec,
    pub parent: Rc<RuntimeGroup>,
    pub expanded_cmd: String,
    pub expanded_args: Vec<String>,
    pub expanded_env: HashMap<String, String>,
    pub expanded_vars: HashMap<String, String>,
    pub effective_workdir: String,
    pub effective_timeout: u64,
    pub effective_max_output_size: u64,
    pub effective_output_file: Option<PathBuf>,
    pub timeout_source: TimeoutSource,
}

pub struct RuntimeConfig {
    pub global: Rc<RuntimeGlobal>,
    /// (group, commands), already sorted by ascending priority, stable for ties.
    pub groups: Vec<(Rc<RuntimeGroup>, Vec<RuntimeCommand>)>,
}

const MAX_EXPANSION_DEPTH: usize = 50;

// ---------------------------------------------------------------------
// Marker expansion
// ---------------------------------------------------------------------

/// Replace every `%{name}` and `${name}` marker in `input`, honoring
/// `\$`/`\%` escapes. `resolve_pct`/`resolve_dollar` each return an
/// already-fully-expanded replacement (no markers remain in their output),
/// so a single linear pass suffices.
fn expand_markers(
    input: &str,
    resolve_pct: &mut dyn FnMut(&str) -> Result<String>,
    resolve_dollar: &mut dyn FnMut(&str) -> Result<String>,
) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some('$') => {
                    chars.next();
                    out.push('$');
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                _ => {
                    return Err(CommandRunnerError::InvalidVariableFormat(format!(
                        "unescaped backslash in '{input}'"
                    )));
                }
            },
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let name = take_brace_contents(&mut chars, input)?;
                out.push_str(&resolve_dollar(&name)?);
            }
            '%' if chars.peek() == Some(&'{') => {
                chars.next();
                let name = take_brace_contents(&mut chars, input)?;
                out.push_str(&resolve_pct(&name)?);
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

fn take_brace_contents(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    original: &str,
) -> Result<String> {
    let mut name = String::new();
    for c in chars.by_ref() {
        if c == '}' {
            return Ok(name);
        }
        name.push(c);
    }
    Err(CommandRunnerError::InvalidVariableFormat(format!(
        "unterminated '{{' in '{original}'"
    )))
}

fn auto_vars() -> HashMap<String, String> {
    let now = jiff::Zoned::now();
    let mut vars = HashMap::new();
    vars.insert("DATE".to_string(), now.strftime("%Y-%m-%d").to_string());
    vars.insert("TIME".to_string(), now.strftime("%H:%M:%S").to_string());
    vars.insert("PID".to_string(), std::process::id().to_string());
    vars.insert(
        "HOSTNAME".to_string(),
        whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string()),
    );
    vars
}

/// Fully resolve one level's raw `vars` map against an already-resolved
/// `base` (the parent level's expanded vars, which are plain strings and
/// therefore cannot reintroduce a cycle) and a `dollar` resolver for any
/// `${...}` references that show up inside a var's own value.
fn resolve_level_vars(
    base: &HashMap<String, String>,
    raw: &HashMap<String, String>,
    resolve_dollar: &mut dyn FnMut(&str) -> Result<String>,
) -> Result<HashMap<String, String>> {
    let mut resolved = base.clone();
    let mut in_progress: Vec<String> = Vec::new();
    let mut cache: HashMap<String, String> = HashMap::new();

    fn resolve_one(
        name: &str,
        raw: &HashMap<String, String>,
        base: &HashMap<String, String>,
        cache: &mut HashMap<String, String>,
        in_progress: &mut Vec<String>,
        resolve_dollar: &mut dyn FnMut(&str) -> Result<String>,
    ) -> Result<String> {
        if let Some(v) = cache.get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = base.get(name) {
            if !raw.contains_key(name) {
                return Ok(v.clone());
            }
        }
        let Some(raw_value) = raw.get(name) else {
            return Err(CommandRunnerError::UnknownVariable(name.to_string()));
        };

        if in_progress.contains(&name.to_string()) {
            return Err(CommandRunnerError::CircularReference(name.to_string()));
        }
        if in_progress.len() >= MAX_EXPANSION_DEPTH {
            return Err(CommandRunnerError::CircularReference(format!(
                "{name} (expansion depth budget of {MAX_EXPANSION_DEPTH} exceeded)"
            )));
        }

        in_progress.push(name.to_string());
        let mut resolve_pct = |inner: &str| -> Result<String> {
            resolve_one(inner, raw, base, cache, in_progress, resolve_dollar)
        };
        let expanded = expand_markers(raw_value, &mut resolve_pct, resolve_dollar)?;
        in_progress.pop();

        cache.insert(name.to_string(), expanded.clone());
        Ok(expanded)
    }

    for name in raw.keys() {
        let value = resolve_one(name, raw, base, &mut cache, &mut in_progress, resolve_dollar)?;
        resolved.insert(name.clone(), value);
    }

    Ok(resolved)
}

// ---------------------------------------------------------------------
// Environment allow-list / import resolution
// ---------------------------------------------------------------------

fn resolve_allowlist(level: &Option<Vec<String>>, parent: &HashSet<String>) -> HashSet<String> {
    match level {
        None => parent.clone(),
        Some(list) if list.is_empty() => HashSet::new(),
        Some(list) => list.iter().cloned().collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImportLevel {
    Global,
    Group,
    Command,
}

impl std::fmt::Display for ImportLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Group => write!(f, "group"),
            Self::Command => write!(f, "command"),
        }
    }
}

struct MergedImport {
    internal: String,
    external: String,
    level: ImportLevel,
}

fn merge_env_imports(
    global: &[String],
    group: &[String],
    command: &[String],
) -> Result<Vec<MergedImport>> {
    let mut by_internal: HashMap<String, (String, ImportLevel)> = HashMap::new();
    let mut merged = Vec::new();

    for (entries, level) in [
        (global, ImportLevel::Global),
        (group, ImportLevel::Group),
        (command, ImportLevel::Command),
    ] {
        for entry in entries {
            let (internal, external) = parse_env_import_entry(entry)?;
            if let Some((existing_external, _)) = by_internal.get(&internal) {
                if *existing_external != external {
                    return Err(CommandRunnerError::AllowlistConflict(internal));
                }
                continue; // identical duplicate, collapse
            }
            by_internal.insert(internal.clone(), (external.clone(), level));
            merged.push(MergedImport {
                internal,
                external,
                level,
            });
        }
    }

    Ok(merged)
}

fn validate_imports(
    imports: &[MergedImport],
    global_allowlist: &HashSet<String>,
    group_allowlist: &HashSet<String>,
) -> Result<()> {
    for import in imports {
        let allowlist = match import.level {
            ImportLevel::Global => global_allowlist,
            ImportLevel::Group | ImportLevel::Command => group_allowlist,
        };
        if !allowlist.contains(&import.external) {
            return Err(CommandRunnerError::NotInAllowlist {
                name: import.external.clone(),
                level: import.level.to_string(),
            });
        }
    }
    Ok(())
}

/// Look up an imported system variable's value: an `env_file` overlay
/// (spec §6, "Trusted environment") always wins over the process's own
/// environment, so an operator can supply a verified, auditable value for a
/// name that is also (perhaps differently) set in the invoking shell.
fn system_env_cache_for(imports: &[MergedImport], overlay: &HashMap<String, String>) -> HashMap<String, String> {
    let mut cache = HashMap::new();
    for import in imports {
        if let Some(value) = overlay.get(&import.external) {
            cache.insert(import.internal.clone(), value.clone());
        } else if let Ok(value) = std::env::var(&import.external) {
            cache.insert(import.internal.clone(), value);
        }
    }
    cache
}

// ---------------------------------------------------------------------
// Top-level expansion
// ---------------------------------------------------------------------

/// Expand `spec` against the process's real environment only (no
/// `env_file` overlay). Used by callers (and the bulk of the test suite)
/// that have no verified `env_file` to load.
pub fn expand(spec: &ConfigSpec) -> Result<RuntimeConfig> {
    expand_with_env_overlay(spec, &HashMap::new())
}

/// Expand `spec`, resolving every imported system variable against
/// `env_overlay` first and the process environment second. `env_overlay`
/// is the parsed, hash-verified contents of `global.env_file`, if one was
/// declared (spec §6).
pub fn expand_with_env_overlay(
    spec: &ConfigSpec,
    env_overlay: &HashMap<String, String>,
) -> Result<RuntimeConfig> {
    let global_rt = expand_global(spec, env_overlay)?;
    let global_rt = Rc::new(global_rt);

    let mut groups: Vec<(Rc<RuntimeGroup>, Vec<RuntimeCommand>)> = Vec::new();
    for group_spec in &spec.groups {
        let group_rt = expand_group(&global_rt, group_spec, env_overlay)?;
        let group_rt = Rc::new(group_rt);

        let mut commands = Vec::new();
        for command_spec in &group_spec.commands {
            commands.push(expand_command(
                &group_rt,
                command_spec,
                &spec.command_templates,
                env_overlay,
            )?);
        }
        groups.push((group_rt, commands));
    }

    groups.sort_by_key(|(g, _)| g.spec.priority);

    Ok(RuntimeConfig {
        global: global_rt,
        groups,
    })
}

fn expand_global(spec: &ConfigSpec, env_overlay: &HashMap<String, String>) -> Result<RuntimeGlobal> {
    let allowlist = resolve_allowlist(&spec.global.env_allowed, &HashSet::new());
    let imports = merge_env_imports(&spec.global.env_import, &[], &[])?;
    validate_imports(&imports, &allowlist, &HashSet::new())?;
    let system_env_cache = system_env_cache_for(&imports, env_overlay);

    let mut resolve_dollar = |name: &str| -> Result<String> {
        system_env_cache
            .get(name)
            .cloned()
            .ok_or_else(|| CommandRunnerError::UnknownVariable(name.to_string()))
    };

    let base_vars = auto_vars();
    let expanded_vars = resolve_level_vars(&base_vars, &spec.global.vars, &mut resolve_dollar)?;

    let mut expanded_env = HashMap::new();
    for import in &imports {
        if let Some(value) = system_env_cache.get(&import.internal) {
            expanded_env.insert(import.external.clone(), value.clone());
        }
    }
    for (key, value) in &spec.global.env {
        let mut resolve_pct = |name: &str| -> Result<String> {
            expanded_vars
                .get(name)
                .cloned()
                .ok_or_else(|| CommandRunnerError::UnknownVariable(name.to_string()))
        };
        let value = expand_markers(value, &mut resolve_pct, &mut resolve_dollar)?;
        expanded_env.insert(key.clone(), value);
    }

    let mut expanded_verify_files = Vec::new();
    for raw in &spec.global.verify_files {
        let mut resolve_pct = |name: &str| -> Result<String> {
            expanded_vars
                .get(name)
                .cloned()
                .ok_or_else(|| CommandRunnerError::UnknownVariable(name.to_string()))
        };
        let expanded = expand_markers(raw, &mut resolve_pct, &mut resolve_dollar)?;
        expanded_verify_files.push(PathBuf::from(expanded));
    }

    let literal_env_keys: HashSet<String> = spec.global.env.keys().cloned().collect();

    Ok(RuntimeGlobal {
        spec: spec.global.clone(),
        expanded_vars,
        expanded_env,
        system_env_cache,
        expanded_verify_files,
        effective_env_allowlist: allowlist,
        literal_env_keys,
    })
}

fn expand_group(
    global: &Rc<RuntimeGlobal>,
    group: &GroupSpec,
    env_overlay: &HashMap<String, String>,
) -> Result<RuntimeGroup> {
    let allowlist = resolve_allowlist(&group.env_allowed, &global.effective_env_allowlist);
    let imports = merge_env_imports(&global.spec.env_import, &group.env_import, &[])?;
    validate_imports(&imports, &global.effective_env_allowlist, &allowlist)?;

    let mut system_env_cache = global.system_env_cache.clone();
    system_env_cache.extend(system_env_cache_for(&imports, env_overlay));

    let mut resolve_dollar = |name: &str| -> Result<String> {
        system_env_cache
            .get(name)
            .cloned()
            .ok_or_else(|| CommandRunnerError::UnknownVariable(name.to_string()))
    };

    let expanded_vars = resolve_level_vars(&global.expanded_vars, &group.vars, &mut resolve_dollar)?;

    let mut expanded_env = global.expanded_env.clone();
    for import in &imports {
        if let Some(value) = system_env_cache.get(&import.internal) {
            expanded_env.insert(import.external.clone(), value.clone());
        }
    }
    for (key, value) in &group.env {
        let mut resolve_pct = |name: &str| -> Result<String> {
            expanded_vars
                .get(name)
                .cloned()
                .ok_or_else(|| CommandRunnerError::UnknownVariable(name.to_string()))
        };
        let value = expand_markers(value, &mut resolve_pct, &mut resolve_dollar)?;
        expanded_env.insert(key.clone(), value);
    }

    let mut literal_env_keys = global.literal_env_keys.clone();
    literal_env_keys.extend(group.env.keys().cloned());

    // A parent's `expanded_env` can carry import-derived keys that this
    // level's stricter allow-list (e.g. `env_allowed = []`) no longer
    // permits. Invariant §3(2) only exempts keys backed by a literal `env`
    // entry somewhere in the chain; everything else must re-clear the
    // current allow-list or it is dropped here.
    expanded_env.retain(|key, _| allowlist.contains(key) || literal_env_keys.contains(key));

    let mut expanded_verify_files = global.expanded_verify_files.clone();
    for raw in &group.verify_files {
        let mut resolve_pct = |name: &str| -> Result<String> {
            expanded_vars
                .get(name)
                .cloned()
                .ok_or_else(|| CommandRunnerError::UnknownVariable(name.to_string()))
        };
        let expanded = expand_markers(raw, &mut resolve_pct, &mut resolve_dollar)?;
        expanded_verify_files.push(PathBuf::from(expanded));
    }

    Ok(RuntimeGroup {
        spec: group.clone(),
        parent: Rc::clone(global),
        expanded_vars,
        expanded_env,
        literal_env_keys,
        expanded_verify_files,
        effective_env_allowlist: allowlist,
    })
}

/// Merge a `CommandTemplate` into a `CommandSpec`: fields set on the
/// command override the template; `vars`/`env` union with the command
/// winning on collision; `env_import` unions.
fn apply_template(command: &CommandSpec, template: &CommandTemplate) -> CommandSpec {
    let mut merged = command.clone();
    if merged.cmd.is_none() {
        merged.cmd = template.cmd.clone();
    }
    if merged.args.is_empty() {
        merged.args = template.args.clone();
    }
    if merged.workdir.is_none() {
        merged.workdir = template.workdir.clone();
    }
    if merged.timeout.is_none() {
        merged.timeout = template.timeout;
    }
    if merged.output_file.is_none() {
        merged.output_file = template.output_file.clone();
    }
    if merged.risk_level.is_none() {
        merged.risk_level = template.risk_level.clone();
    }
    if merged.max_output_size.is_none() {
        merged.max_output_size = template.max_output_size;
    }

    let mut vars = template.vars.clone();
    vars.extend(command.vars.clone());
    merged.vars = vars;

    let mut env = template.env.clone();
    env.extend(command.env.clone());
    merged.env = env;

    let mut env_import = template.env_import.clone();
    env_import.extend(command.env_import.clone());
    env_import.sort();
    env_import.dedup();
    merged.env_import = env_import;

    merged
}

fn expand_command(
    group: &Rc<RuntimeGroup>,
    command: &CommandSpec,
    templates: &HashMap<String, CommandTemplate>,
    env_overlay: &HashMap<String, String>,
) -> Result<RuntimeCommand> {
    let (merged, param_values) = if let Some(template_name) = &command.template {
        let template = templates.get(template_name).ok_or_else(|| {
            CommandRunnerError::TemplateNotFound(template_name.clone())
        })?;
        let merged = apply_template(command, template);

        let mut resolve_dollar_for_params = |name: &str| -> Result<String> {
            group
                .expanded_vars
                .get(name)
                .or_else(|| group.parent.system_env_cache.get(name))
                .cloned()
                .ok_or_else(|| CommandRunnerError::UnknownVariable(name.to_string()))
        };
        let mut param_values = HashMap::new();
        for (key, value) in &command.params {
            let mut resolve_pct = |name: &str| -> Result<String> {
                group
                    .expanded_vars
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CommandRunnerError::UnknownVariable(name.to_string()))
            };
            let expanded = expand_markers(value, &mut resolve_pct, &mut resolve_dollar_for_params)?;
            param_values.insert(key.clone(), expanded);
        }
        (merged, param_values)
    } else {
        (command.clone(), HashMap::new())
    };

    let cmd_template_used = command.template.is_some();

    let allowlist = &group.effective_env_allowlist;
    let imports = merge_env_imports(&group.parent.spec.env_import, &group.spec.env_import, &merged.env_import)?;
    validate_imports(&imports, &group.parent.effective_env_allowlist, allowlist)?;

    let mut system_env_cache = group.parent.system_env_cache.clone();
    system_env_cache.extend(system_env_cache_for(&imports, env_overlay));

    let expanded_vars = resolve_level_vars(&group.expanded_vars, &merged.vars, &mut |name: &str| {
        system_env_cache
            .get(name)
            .cloned()
            .ok_or_else(|| CommandRunnerError::UnknownVariable(name.to_string()))
    })?;

    // `${name}` in a templated command's cmd/args/env first tries the
    // (pre-expanded) template params, then falls back to system env.
    let mut resolve_dollar_general = |name: &str| -> Result<String> {
        if let Some(value) = param_values.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = system_env_cache.get(name) {
            return Ok(value.clone());
        }
        if cmd_template_used {
            return Err(CommandRunnerError::UnresolvedParam(name.to_string()));
        }
        Err(CommandRunnerError::UnknownVariable(name.to_string()))
    };

    let mut resolve_pct = |name: &str| -> Result<String> {
        expanded_vars
            .get(name)
            .cloned()
            .ok_or_else(|| CommandRunnerError::UnknownVariable(name.to_string()))
    };

    let raw_cmd = merged.cmd.clone().unwrap_or_default();
    if raw_cmd.is_empty() {
        return Err(CommandRunnerError::ConfigInvalid(format!(
            "command '{}' has no cmd (directly or via template)",
            merged.name
        )));
    }
    let expanded_cmd = expand_markers(&raw_cmd, &mut resolve_pct, &mut resolve_dollar_general)?;

    let mut expanded_args = Vec::with_capacity(merged.args.len());
    for arg in &merged.args {
        expanded_args.push(expand_markers(arg, &mut resolve_pct, &mut resolve_dollar_general)?);
    }

    let mut expanded_env = group.expanded_env.clone();
    for import in &imports {
        if let Some(value) = system_env_cache.get(&import.internal) {
            expanded_env.insert(import.external.clone(), value.clone());
        }
    }
    for (key, value) in &merged.env {
        let expanded = expand_markers(value, &mut resolve_pct, &mut resolve_dollar_general)?;
        expanded_env.insert(key.clone(), expanded);
    }

    let mut literal_env_keys = group.literal_env_keys.clone();
    literal_env_keys.extend(merged.env.keys().cloned());
    expanded_env.retain(|key, _| allowlist.contains(key) || literal_env_keys.contains(key));

    // First non-`None` across command/group/global wins; an empty string at
    // whichever level wins explicitly pins the process's own cwd rather than
    // falling through to a lower-precedence level.
    let raw_workdir = merged
        .workdir
        .clone()
        .or_else(|| group.spec.workdir.clone())
        .or_else(|| group.parent.spec.workdir.clone());
    let effective_workdir = match raw_workdir {
        Some(w) if w.is_empty() => current_dir_string(),
        Some(w) => expand_markers(&w, &mut resolve_pct, &mut resolve_dollar_general)?,
        None => current_dir_string(),
    };

    let (effective_timeout, timeout_source) = match merged.timeout {
        Some(t) => (t, TimeoutSource::Command),
        None => (group.parent.spec.timeout, TimeoutSource::Global),
    };
    if effective_timeout == 0 {
        return Err(CommandRunnerError::ConfigInvalid(format!(
            "command '{}' resolved to a non-positive timeout",
            merged.name
        )));
    }

    let effective_max_output_size = merged
        .max_output_size
        .unwrap_or(group.parent.spec.max_output_size);
    if effective_max_output_size == 0 {
        return Err(CommandRunnerError::ConfigInvalid(format!(
            "command '{}' resolved to a non-positive max_output_size",
            merged.name
        )));
    }

    let effective_output_file = match &merged.output_file {
        None => None,
        Some(raw) => {
            let expanded = expand_markers(raw, &mut resolve_pct, &mut resolve_dollar_general)?;
            crate::config::validate_output_relative_path(&expanded)?;
            Some(PathBuf::from(&effective_workdir).join(expanded))
        }
    };

    Ok(RuntimeCommand {
        spec: merged,
        parent: Rc::clone(group),
        expanded_cmd,
        expanded_args,
        expanded_env,
        expanded_vars,
        effective_workdir,
        effective_timeout,
        effective_max_output_size,
        effective_output_file,
        timeout_source,
    })
}

fn current_dir_string() -> String {
    std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "/".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSpec;

    fn expand_toml(toml: &str) -> Result<RuntimeConfig> {
        let spec = ConfigSpec::from_toml_str(toml)?;
        expand(&spec)
    }

    #[test]
    fn verified_echo_expands_cleanly() {
        let rt = expand_toml(
            r#"
            version = "1.0"
            [global]
            timeout = 30
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "echo"
            args = ["hello"]
        "#,
        )
        .unwrap();
        let (_, commands) = &rt.groups[0];
        assert_eq!(commands[0].expanded_cmd, "echo");
        assert_eq!(commands[0].expanded_args, vec!["hello".to_string()]);
    }

    #[test]
    fn template_and_param_expansion() {
        let rt = expand_toml(
            r#"
            version = "1.0"
            [global]
            timeout = 30
            [command_templates.say]
            cmd = "echo"
            args = ["${msg}"]
            [[groups]]
            name = "g"
            [groups.vars]
            greeting = "hi"
            [[groups.commands]]
            name = "c"
            template = "say"
            [groups.commands.params]
            msg = "%{greeting}, world"
        "#,
        )
        .unwrap();
        let (_, commands) = &rt.groups[0];
        assert_eq!(commands[0].expanded_cmd, "echo");
        assert_eq!(commands[0].expanded_args, vec!["hi, world".to_string()]);
    }

    #[test]
    fn env_allowlist_denial_is_reported() {
        let err = expand_toml(
            r#"
            version = "1.0"
            [global]
            timeout = 30
            env_allowed = ["LANG"]
            [[groups]]
            name = "g"
            env_import = ["home=HOME"]
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, CommandRunnerError::NotInAllowlist { .. }));
    }

    #[test]
    fn stricter_child_allowlist_drops_an_inherited_import() {
        let spec = ConfigSpec::from_toml_str(
            r#"
            version = "1.0"
            [global]
            timeout = 30
            env_allowed = ["HOME"]
            env_import = ["h=HOME"]
            [[groups]]
            name = "g"
            env_allowed = []
            [[groups.commands]]
            name = "c"
            cmd = "echo"
        "#,
        )
        .unwrap();
        let mut overlay = HashMap::new();
        overlay.insert("HOME".to_string(), "/home/attacker-visible".to_string());
        let rt = expand_with_env_overlay(&spec, &overlay).unwrap();

        let (group, commands) = &rt.groups[0];
        assert!(
            !group.expanded_env.contains_key("HOME"),
            "group's own reject allow-list must drop the inherited import"
        );
        assert!(
            !commands[0].expanded_env.contains_key("HOME"),
            "a command under a rejecting group must not see the inherited import either"
        );
    }

    #[test]
    fn literal_env_survives_a_stricter_child_allowlist() {
        let spec = ConfigSpec::from_toml_str(
            r#"
            version = "1.0"
            [global]
            timeout = 30
            [global.env]
            STATIC_KEY = "pinned"
            [[groups]]
            name = "g"
            env_allowed = []
            [[groups.commands]]
            name = "c"
            cmd = "echo"
        "#,
        )
        .unwrap();
        let rt = expand(&spec).unwrap();
        let (group, commands) = &rt.groups[0];
        assert_eq!(group.expanded_env.get("STATIC_KEY").map(String::as_str), Some("pinned"));
        assert_eq!(
            commands[0].expanded_env.get("STATIC_KEY").map(String::as_str),
            Some("pinned")
        );
    }

    #[test]
    fn cycle_in_vars_is_rejected() {
        let err = expand_toml(
            r#"
            version = "1.0"
            [global]
            timeout = 30
            [global.vars]
            a = "%{b}"
            b = "%{a}"
            [[groups]]
            name = "g"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, CommandRunnerError::CircularReference(_)));
    }

    #[test]
    fn empty_workdir_pins_to_process_cwd() {
        let rt = expand_toml(
            r#"
            version = "1.0"
            [global]
            timeout = 30
            [[groups]]
            name = "g"
            workdir = ""
            [[groups.commands]]
            name = "c"
            cmd = "pwd"
        "#,
        )
        .unwrap();
        let (_, commands) = &rt.groups[0];
        assert_eq!(
            commands[0].effective_workdir,
            current_dir_string()
        );
    }

    #[test]
    fn groups_sort_ascending_by_priority_stable_for_ties() {
        let rt = expand_toml(
            r#"
            version = "1.0"
            [global]
            timeout = 30
            [[groups]]
            name = "b"
            priority = 1
            [[groups]]
            name = "a"
            priority = 0
            [[groups]]
            name = "c"
            priority = 1
        "#,
        )
        .unwrap();
        let names: Vec<_> = rt.groups.iter().map(|(g, _)| g.spec.name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn command_timeout_overrides_global() {
        let rt = expand_toml(
            r#"
            version = "1.0"
            [global]
            timeout = 30
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "sleep"
            timeout = 5
        "#,
        )
        .unwrap();
        let (_, commands) = &rt.groups[0];
        assert_eq!(commands[0].effective_timeout, 5);
        assert_eq!(commands[0].timeout_source, TimeoutSource::Command);
    }

    #[test]
    fn unknown_variable_reference_fails() {
        let err = expand_toml(
            r#"
            version = "1.0"
            [global]
            timeout = 30
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "echo"
            args = ["%{nope}"]
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, CommandRunnerError::UnknownVariable(_)));
    }

    #[test]
    fn re_expanding_runtime_values_is_a_no_op() {
        let rt = expand_toml(
            r#"
            version = "1.0"
            [global]
            timeout = 30
            [global.vars]
            greeting = "hi"
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "echo"
            args = ["%{greeting}"]
        "#,
        )
        .unwrap();
        let (_, commands) = &rt.groups[0];
        for arg in &commands[0].expanded_args {
            assert!(!arg.contains("%{") && !arg.contains("${"));
        }
    }

    proptest::proptest! {
        /// A narrower allow-list at a child level can only ever shrink what
        /// is permitted, never grow it beyond what the parent already
        /// allowed: `resolve_allowlist` restricted to an explicit, non-empty
        /// list is always a subset of "parent ∪ that list" and an explicit
        /// empty list is always the empty set, regardless of the parent.
        #[test]
        fn allowlist_resolution_never_grants_more_than_declared(
            parent_names in proptest::collection::vec("[a-zA-Z_]{1,8}", 0..5),
            child_names in proptest::collection::vec("[a-zA-Z_]{1,8}", 0..5),
            child_is_reject in proptest::bool::ANY,
        ) {
            let parent: HashSet<String> = parent_names.into_iter().collect();
            let child_level = if child_is_reject {
                Some(Vec::new())
            } else {
                Some(child_names.clone())
            };

            let resolved = resolve_allowlist(&child_level, &parent);

            if child_is_reject {
                proptest::prop_assert!(resolved.is_empty());
            } else {
                let declared: HashSet<String> = child_names.into_iter().collect();
                proptest::prop_assert_eq!(&resolved, &declared);
                // An explicit child list is never silently unioned with the
                // parent's allow-list.
                for name in &resolved {
                    proptest::prop_assert!(declared.contains(name));
                }
            }
        }

        /// `None` at a child level inherits exactly the parent's allow-list
        /// — never more, never less.
        #[test]
        fn allowlist_inherit_is_exactly_the_parent(
            parent_names in proptest::collection::vec("[a-zA-Z_]{1,8}", 0..5),
        ) {
            let parent: HashSet<String> = parent_names.into_iter().collect();
            let resolved = resolve_allowlist(&None, &parent);
            proptest::prop_assert_eq!(resolved, parent);
        }
    }
}
