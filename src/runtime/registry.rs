/// Runtime registry: language identifier → environment definition
///
/// Built once at startup and shared by `Arc`; lookups never mutate.
use crate::config::harness::HarnessConfig;
use crate::config::types::{HarnessError, Result, SubmitError};
use crate::runtime::environment::EnvironmentDefinition;
use crate::runtime::languages;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

pub struct RuntimeRegistry {
    environments: BTreeMap<String, Arc<EnvironmentDefinition>>,
    aliases: HashMap<String, String>,
}

fn normalize(id: &str) -> String {
    id.trim().to_ascii_lowercase()
}

impl RuntimeRegistry {
    /// Registry with the built-in python, c, cpp and java presets
    pub fn builtin() -> Result<Self> {
        Self::from_definitions(languages::builtin())
    }

    /// Load from the configured registry file, or fall back to the built-in presets.
    pub fn load(config: &HarnessConfig) -> Result<Self> {
        match &config.registry_path {
            Some(path) => Self::from_file(path),
            None => Self::builtin(),
        }
    }

    /// Load a JSON array of environment definitions.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Registry(format!("Failed to read registry {}: {}", path.display(), e))
        })?;
        let definitions: Vec<EnvironmentDefinition> = serde_json::from_str(&content)
            .map_err(|e| {
                HarnessError::Registry(format!("Failed to parse registry {}: {}", path.display(), e))
            })?;
        Self::from_definitions(definitions)
    }

    /// Validate and index definitions. Disabled entries are skipped.
    pub fn from_definitions(definitions: Vec<EnvironmentDefinition>) -> Result<Self> {
        let mut environments = BTreeMap::new();
        let mut aliases = HashMap::new();

        for definition in definitions {
            if !definition.enabled {
                log::info!("Skipping disabled environment '{}'", definition.language);
                continue;
            }
            definition.validate()?;

            let id = normalize(&definition.language);
            if environments.contains_key(&id) || aliases.contains_key(&id) {
                return Err(HarnessError::Registry(format!("duplicate language id '{id}'")));
            }
            for alias in &definition.aliases {
                let alias = normalize(alias);
                if alias == id {
                    continue;
                }
                if environments.contains_key(&alias) || aliases.contains_key(&alias) {
                    return Err(HarnessError::Registry(format!(
                        "alias '{alias}' of '{id}' is already registered"
                    )));
                }
                aliases.insert(alias, id.clone());
            }
            environments.insert(id, Arc::new(definition));
        }

        if let Some(clash) = aliases.keys().find(|alias| environments.contains_key(*alias)) {
            return Err(HarnessError::Registry(format!(
                "alias '{clash}' shadows a language id"
            )));
        }
        if environments.is_empty() {
            return Err(HarnessError::Registry("registry has no enabled environments".to_string()));
        }

        log::info!(
            "Runtime registry ready: {}",
            environments.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        Ok(RuntimeRegistry {
            environments,
            aliases,
        })
    }

    pub fn lookup(&self, language: &str) -> std::result::Result<Arc<EnvironmentDefinition>, SubmitError> {
        let id = normalize(language);
        let canonical = self.aliases.get(&id).unwrap_or(&id);
        self.environments
            .get(canonical)
            .cloned()
            .ok_or_else(|| SubmitError::UnsupportedLanguage(language.to_string()))
    }

    pub fn definitions(&self) -> impl Iterator<Item = &EnvironmentDefinition> {
        self.environments.values().map(|env| env.as_ref())
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_resolves_aliases() {
        let registry = RuntimeRegistry::builtin().unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.lookup("py").unwrap().language, "python");
        assert_eq!(registry.lookup("C++").unwrap().language, "cpp");
        assert_eq!(registry.lookup(" java ").unwrap().language, "java");
        assert_eq!(registry.lookup("c").unwrap().language, "c");
    }

    #[test]
    fn test_unknown_language_is_unsupported() {
        let registry = RuntimeRegistry::builtin().unwrap();
        assert_eq!(
            registry.lookup("cobol").unwrap_err(),
            SubmitError::UnsupportedLanguage("cobol".to_string())
        );
    }

    #[test]
    fn test_lookup_shares_one_definition() {
        let registry = RuntimeRegistry::builtin().unwrap();
        let a = registry.lookup("python").unwrap();
        let b = registry.lookup("python3").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_duplicate_alias_is_rejected() {
        let mut cpp = languages::cpp::definition();
        cpp.aliases.push("py".to_string());
        let result = RuntimeRegistry::from_definitions(vec![languages::python::definition(), cpp]);
        assert!(matches!(result, Err(HarnessError::Registry(_))));
    }

    #[test]
    fn test_disabled_environment_is_skipped() {
        let mut java = languages::java::definition();
        java.enabled = false;
        let registry =
            RuntimeRegistry::from_definitions(vec![languages::python::definition(), java]).unwrap();
        assert!(registry.lookup("java").is_err());
        assert!(registry.lookup("python").is_ok());
    }

    #[test]
    fn test_registry_round_trips_through_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let json = serde_json::to_string_pretty(&languages::builtin()).unwrap();
        std::fs::write(&path, json).unwrap();

        let registry = RuntimeRegistry::from_file(&path).unwrap();
        assert_eq!(registry.len(), 4);
        let java = registry.lookup("java").unwrap();
        assert_eq!(java.defaults.run.max_processes, 256);
        assert!(java.address_space_factor.is_none());
    }
}
