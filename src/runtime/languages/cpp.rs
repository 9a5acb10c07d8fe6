use super::{limits, strings};
use crate::config::limits::ResourceProfile;
use crate::runtime::environment::{EntryPointRule, EnvironmentDefinition, IsolationImage};
use std::collections::BTreeMap;

pub fn definition() -> EnvironmentDefinition {
    EnvironmentDefinition {
        language: "cpp".to_string(),
        aliases: strings(&["c++", "cxx", "cc", "g++"]),
        display_name: "C++17 (g++)".to_string(),
        source_extension: "cpp".to_string(),
        entry_point: EntryPointRule::MainUnit,
        build: Some(strings(&[
            "g++",
            "-std=c++17",
            "-O2",
            "-pipe",
            "-o",
            "{workspace}/main",
            "{sources}",
        ])),
        run: strings(&["{workspace}/main"]),
        image: IsolationImage::Host,
        environment: BTreeMap::new(),
        defaults: ResourceProfile {
            // Compile needs more processes than the runtime envelope.
            build: limits(768, 160, 30_000, 45_000),
            run: limits(256, 1, 10_000, 15_000),
        },
        address_space_factor: Some(4),
        oom_markers: vec!["std::bad_alloc".to_string()],
        probes: vec![strings(&["g++", "--version"])],
        enabled: true,
    }
}
