use super::{limits, strings};
use crate::config::limits::ResourceProfile;
use crate::runtime::environment::{EntryPointRule, EnvironmentDefinition, IsolationImage};
use std::collections::BTreeMap;

/// Java 17. The JVM reserves far more address space than it touches, so there
/// is no RLIMIT_AS backstop; the heap is capped from the ceiling instead.
pub fn definition() -> EnvironmentDefinition {
    EnvironmentDefinition {
        language: "java".to_string(),
        aliases: strings(&["java17", "jdk"]),
        display_name: "Java 17".to_string(),
        source_extension: "java".to_string(),
        entry_point: EntryPointRule::JavaPublicClass,
        build: Some(strings(&[
            "javac",
            "-J-Xmx{heap_mb}m",
            "-J-XX:+UseSerialGC",
            "-encoding",
            "UTF-8",
            "-d",
            "{workspace}",
            "{sources}",
        ])),
        run: strings(&[
            "java",
            "-Xmx{heap_mb}m",
            "-Xss1m",
            "-XX:+UseSerialGC",
            "-XX:TieredStopAtLevel=1",
            "-cp",
            "{workspace}",
            "{main_class}",
        ]),
        image: IsolationImage::Host,
        environment: BTreeMap::from([(
            "JAVA_TOOL_OPTIONS".to_string(),
            "-Dfile.encoding=UTF-8".to_string(),
        )]),
        defaults: ResourceProfile {
            build: limits(768, 320, 30_000, 45_000),
            run: limits(512, 256, 10_000, 20_000),
        },
        address_space_factor: None,
        oom_markers: vec!["java.lang.OutOfMemoryError".to_string()],
        probes: vec![strings(&["javac", "-version"]), strings(&["java", "-version"])],
        enabled: true,
    }
}
