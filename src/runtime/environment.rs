/// Environment definitions: the per-language recipe for building and running a submission
use crate::config::limits::{ResourceLimits, ResourceProfile};
use crate::config::types::{HarnessError, Result, SourceUnit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Root filesystem a sandbox executes in
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IsolationImage {
    /// Host filesystem; the workspace stays at its host path
    #[default]
    Host,
    /// Unpacked image; the sandbox chroots into it with the workspace at `/workspace`
    Rootfs { path: PathBuf },
}

/// How the main unit and the class/module to launch are chosen
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryPointRule {
    /// First unit with the environment's extension
    #[default]
    MainUnit,
    /// Main unit is named after its `public class`, launched by fully qualified name
    JavaPublicClass,
}

/// Immutable per-language recipe, shared read-only by every submission
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentDefinition {
    pub language: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub display_name: String,
    /// Extension (without dot) of the units this environment compiles or runs
    pub source_extension: String,
    #[serde(default)]
    pub entry_point: EntryPointRule,
    /// Build command template; absent for interpreted languages
    #[serde(default)]
    pub build: Option<Vec<String>>,
    /// Run command template
    pub run: Vec<String>,
    #[serde(default)]
    pub image: IsolationImage,
    /// Extra environment variables for both steps
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub defaults: ResourceProfile,
    /// RLIMIT_AS = memory ceiling × factor when no cgroup enforces memory; `None` for
    /// runtimes that reserve large virtual ranges (JVM)
    #[serde(default)]
    pub address_space_factor: Option<u64>,
    /// stderr markers meaning the runtime hit its memory ceiling
    #[serde(default)]
    pub oom_markers: Vec<String>,
    /// Commands that print the toolchain version
    #[serde(default)]
    pub probes: Vec<Vec<String>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl EnvironmentDefinition {
    pub fn display_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.language
        } else {
            &self.display_name
        }
    }

    pub fn has_build(&self) -> bool {
        self.build.is_some()
    }

    /// Workspace path as seen from inside the sandbox.
    pub fn sandbox_workspace(&self, host_path: &Path) -> PathBuf {
        match self.image {
            IsolationImage::Host => host_path.to_path_buf(),
            IsolationImage::Rootfs { .. } => PathBuf::from("/workspace"),
        }
    }

    /// Check templates and limits once, when the registry is built.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(HarnessError::Registry(format!("{}: {}", self.language, msg)));

        if self.language.trim().is_empty() {
            return Err(HarnessError::Registry("environment with empty language id".to_string()));
        }
        if self.source_extension.is_empty() || self.source_extension.contains('.') {
            return fail(format!("invalid source extension '{}'", self.source_extension));
        }
        if self.run.is_empty() {
            return fail("run command is empty".to_string());
        }
        if matches!(&self.build, Some(build) if build.is_empty()) {
            return fail("build command is empty".to_string());
        }
        if let IsolationImage::Rootfs { path } = &self.image {
            if !path.is_absolute() {
                return fail(format!("image root '{}' is not absolute", path.display()));
            }
        }
        if self.address_space_factor == Some(0) {
            return fail("address_space_factor must be at least 1".to_string());
        }
        self.defaults
            .build
            .validate("build")
            .and_then(|_| self.defaults.run.validate("run"))
            .or_else(|e| fail(e))?;

        let probe = TemplateContext::probe();
        for template in self.build.iter().chain(std::iter::once(&self.run)) {
            if let Err(e) = expand_template(template, &probe) {
                return fail(e.to_string());
            }
        }
        Ok(())
    }

    /// Pick the main unit and the launch name, renaming the main unit where the
    /// language ties file names to declarations.
    pub fn resolve_entry(&self, sources: &[SourceUnit]) -> std::result::Result<ResolvedEntry, String> {
        if sources.is_empty() {
            return Err("submission has no source units".to_string());
        }
        let suffix = format!(".{}", self.source_extension);
        let main_index = sources
            .iter()
            .position(|unit| unit.name.ends_with(&suffix))
            .unwrap_or(0);

        let mut units = sources.to_vec();
        let main_class = match self.entry_point {
            EntryPointRule::MainUnit => file_stem(&units[main_index].name),
            EntryPointRule::JavaPublicClass => {
                let main = &units[main_index];
                match detect_public_class(&main.content) {
                    Some(class) => {
                        let renamed = sibling_path(&main.name, &format!("{class}{suffix}"));
                        if renamed != main.name
                            && units.iter().any(|unit| unit.name == renamed)
                        {
                            return Err(format!(
                                "main unit declares public class {class} but {renamed} is already submitted"
                            ));
                        }
                        units[main_index].name = renamed;
                        match detect_package(&units[main_index].content) {
                            Some(package) => format!("{package}.{class}"),
                            None => class,
                        }
                    }
                    None => file_stem(&main.name),
                }
            }
        };

        Ok(ResolvedEntry {
            main_file: units[main_index].name.clone(),
            main_class,
            units,
        })
    }
}

/// Outcome of entry-point resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedEntry {
    /// Workspace-relative name of the main unit after any rename
    pub main_file: String,
    /// Name passed to launchers that take a class or module
    pub main_class: String,
    /// Units to stage, with the main unit renamed
    pub units: Vec<SourceUnit>,
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

fn sibling_path(name: &str, file_name: &str) -> String {
    match Path::new(name).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            parent.join(file_name).to_string_lossy().into_owned()
        }
        _ => file_name.to_string(),
    }
}

fn is_java_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Name of the first top-level `public class` (also `public final class` etc.)
pub fn detect_public_class(source: &str) -> Option<String> {
    for line in source.lines() {
        let tokens: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == '{')
            .filter(|token| !token.is_empty())
            .collect();
        if !tokens.contains(&"public") {
            continue;
        }
        if let Some(pos) = tokens.iter().position(|token| *token == "class") {
            let Some(candidate) = tokens.get(pos + 1) else {
                continue;
            };
            let name = candidate.split('<').next().unwrap_or(candidate);
            if is_java_identifier(name) {
                return Some(name.to_string());
            }
        }
    }
    None
}

fn detect_package(source: &str) -> Option<String> {
    source.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("package ")?;
        let name = rest.trim().trim_end_matches(';').trim();
        let valid = !name.is_empty() && name.split('.').all(is_java_identifier);
        valid.then(|| name.to_string())
    })
}

/// Values substituted into command templates
#[derive(Clone, Debug)]
pub struct TemplateContext {
    pub workspace: String,
    pub main: String,
    pub main_stem: String,
    pub main_class: String,
    pub sources: Vec<String>,
    pub memory_mb: u64,
}

impl TemplateContext {
    pub fn new(
        env: &EnvironmentDefinition,
        sandbox_workspace: &Path,
        entry: &ResolvedEntry,
        limits: &ResourceLimits,
    ) -> Self {
        let suffix = format!(".{}", env.source_extension);
        let sources = entry
            .units
            .iter()
            .filter(|unit| unit.name.ends_with(&suffix))
            .map(|unit| sandbox_workspace.join(&unit.name).to_string_lossy().into_owned())
            .collect();

        TemplateContext {
            workspace: sandbox_workspace.to_string_lossy().into_owned(),
            main: sandbox_workspace
                .join(&entry.main_file)
                .to_string_lossy()
                .into_owned(),
            main_stem: file_stem(&entry.main_file),
            main_class: entry.main_class.clone(),
            sources,
            memory_mb: limits.memory_mb(),
        }
    }

    fn probe() -> Self {
        TemplateContext {
            workspace: "/workspace".to_string(),
            main: "/workspace/main".to_string(),
            main_stem: "main".to_string(),
            main_class: "Main".to_string(),
            sources: vec!["/workspace/main".to_string()],
            memory_mb: 256,
        }
    }

    fn scalar(&self, name: &str) -> Result<String> {
        match name {
            "workspace" => Ok(self.workspace.clone()),
            "main" => Ok(self.main.clone()),
            "main_stem" => Ok(self.main_stem.clone()),
            "main_class" => Ok(self.main_class.clone()),
            "memory_mb" => Ok(self.memory_mb.to_string()),
            "heap_mb" => Ok((self.memory_mb / 2).max(16).to_string()),
            "sources" => Err(HarnessError::Registry(
                "{sources} must be a whole argument".to_string(),
            )),
            other => Err(HarnessError::Registry(format!("unknown placeholder {{{other}}}"))),
        }
    }
}

fn substitute(token: &str, ctx: &TemplateContext) -> Result<String> {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            HarnessError::Registry(format!("unterminated placeholder in '{token}'"))
        })?;
        out.push_str(&ctx.scalar(&after[..end])?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Expand a command template into argv.
pub fn expand_template(template: &[String], ctx: &TemplateContext) -> Result<Vec<String>> {
    let mut argv = Vec::with_capacity(template.len() + ctx.sources.len());
    for token in template {
        if token == "{sources}" {
            argv.extend(ctx.sources.iter().cloned());
        } else {
            argv.push(substitute(token, ctx)?);
        }
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::languages;

    fn units(list: &[(&str, &str)]) -> Vec<SourceUnit> {
        list.iter().map(|(name, content)| SourceUnit::new(*name, *content)).collect()
    }

    #[test]
    fn test_detect_public_class_variants() {
        assert_eq!(
            detect_public_class("public class Calculator {\n}"),
            Some("Calculator".to_string())
        );
        assert_eq!(
            detect_public_class("import java.util.*;\npublic final class Solver{"),
            Some("Solver".to_string())
        );
        assert_eq!(
            detect_public_class("public class Box<T> {}"),
            Some("Box".to_string())
        );
        assert_eq!(detect_public_class("class Hidden {}"), None);
    }

    #[test]
    fn test_java_main_unit_is_renamed_to_its_public_class() {
        let java = languages::java::definition();
        let entry = java
            .resolve_entry(&units(&[("code.java", "public class Calculator {}")]))
            .unwrap();
        assert_eq!(entry.main_file, "Calculator.java");
        assert_eq!(entry.main_class, "Calculator");
        assert_eq!(entry.units[0].name, "Calculator.java");
    }

    #[test]
    fn test_java_package_qualifies_main_class() {
        let java = languages::java::definition();
        let entry = java
            .resolve_entry(&units(&[(
                "app/Main.java",
                "package app;\npublic class Main {}",
            )]))
            .unwrap();
        assert_eq!(entry.main_file, "app/Main.java");
        assert_eq!(entry.main_class, "app.Main");
    }

    #[test]
    fn test_java_rename_collision_is_rejected() {
        let java = languages::java::definition();
        let err = java
            .resolve_entry(&units(&[
                ("Main.java", "public class Util {}"),
                ("Util.java", "class Other {}"),
            ]))
            .unwrap_err();
        assert!(err.contains("Util.java"));
    }

    #[test]
    fn test_main_unit_prefers_matching_extension() {
        let python = languages::python::definition();
        let entry = python
            .resolve_entry(&units(&[("data.txt", "1 2 3"), ("solve.py", "print(1)")]))
            .unwrap();
        assert_eq!(entry.main_file, "solve.py");
        assert_eq!(entry.main_class, "solve");
    }

    #[test]
    fn test_expand_template_substitutes_placeholders() {
        let cpp = languages::cpp::definition();
        let entry = cpp
            .resolve_entry(&units(&[("main.cpp", "int main(){}"), ("util.cpp", "")]))
            .unwrap();
        let ctx = TemplateContext::new(&cpp, Path::new("/ws/job"), &entry, &cpp.defaults.build);
        let argv = expand_template(cpp.build.as_ref().unwrap(), &ctx).unwrap();
        assert!(argv.contains(&"/ws/job/main.cpp".to_string()));
        assert!(argv.contains(&"/ws/job/util.cpp".to_string()));
        assert!(argv.contains(&"/ws/job/main".to_string()));
    }

    #[test]
    fn test_heap_placeholder_is_half_the_ceiling() {
        let java = languages::java::definition();
        let entry = java
            .resolve_entry(&units(&[("Main.java", "public class Main {}")]))
            .unwrap();
        let ctx = TemplateContext::new(&java, Path::new("/ws"), &entry, &java.defaults.run);
        let argv = expand_template(&java.run, &ctx).unwrap();
        let expected = format!("-Xmx{}m", java.defaults.run.memory_mb() / 2);
        assert!(argv.contains(&expected), "{argv:?}");
        assert_eq!(argv.last().map(String::as_str), Some("Main"));
    }

    #[test]
    fn test_unknown_placeholder_fails_validation() {
        let mut env = languages::python::definition();
        env.run = vec!["python3".to_string(), "{entry}".to_string()];
        assert!(matches!(env.validate(), Err(HarnessError::Registry(_))));

        env.run = vec!["python3".to_string(), "--files={sources}".to_string()];
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_rootfs_image_maps_workspace() {
        let mut env = languages::python::definition();
        assert_eq!(env.sandbox_workspace(Path::new("/tmp/ws")), PathBuf::from("/tmp/ws"));
        env.image = IsolationImage::Rootfs {
            path: PathBuf::from("/srv/images/python"),
        };
        assert_eq!(env.sandbox_workspace(Path::new("/tmp/ws")), PathBuf::from("/workspace"));
    }
}
