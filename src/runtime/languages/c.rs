use super::{limits, strings};
use crate::config::limits::ResourceProfile;
use crate::runtime::environment::{EntryPointRule, EnvironmentDefinition, IsolationImage};
use std::collections::BTreeMap;

/// C11; every `.c` unit is compiled into one binary.
pub fn definition() -> EnvironmentDefinition {
    EnvironmentDefinition {
        language: "c".to_string(),
        aliases: strings(&["gcc", "c11"]),
        display_name: "C (gcc, C11)".to_string(),
        source_extension: "c".to_string(),
        entry_point: EntryPointRule::MainUnit,
        build: Some(strings(&[
            "gcc",
            "-std=c11",
            "-O2",
            "-pipe",
            "-o",
            "{workspace}/main",
            "{sources}",
            "-lm",
        ])),
        run: strings(&["{workspace}/main"]),
        image: IsolationImage::Host,
        environment: BTreeMap::new(),
        defaults: ResourceProfile {
            build: limits(768, 160, 30_000, 45_000),
            run: limits(256, 1, 10_000, 15_000),
        },
        address_space_factor: Some(4),
        oom_markers: strings(&["Cannot allocate memory"]),
        probes: vec![strings(&["gcc", "--version"])],
        enabled: true,
    }
}
