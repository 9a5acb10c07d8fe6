use super::{limits, strings};
use crate::config::limits::ResourceProfile;
use crate::runtime::environment::{EntryPointRule, EnvironmentDefinition, IsolationImage};
use std::collections::BTreeMap;

pub fn definition() -> EnvironmentDefinition {
    // No build step; the build segment is kept equal to run so overrides stay uniform.
    let run = limits(256, 1, 10_000, 15_000);
    EnvironmentDefinition {
        language: "python".to_string(),
        aliases: strings(&["py", "python3"]),
        display_name: "Python 3".to_string(),
        source_extension: "py".to_string(),
        entry_point: EntryPointRule::MainUnit,
        build: None,
        run: strings(&["python3", "-B", "-S", "{main}"]),
        image: IsolationImage::Host,
        environment: BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]),
        defaults: ResourceProfile { build: run, run },
        address_space_factor: Some(4),
        oom_markers: vec!["MemoryError".to_string()],
        probes: vec![strings(&["python3", "--version"])],
        enabled: true,
    }
}
