#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests for wamschat-client.
//!
//! These tests parse `Cargo.toml` and check that the lint, feature and
//! packaging settings still match project policy. If any test fails, the
//! manifest has drifted from the agreed-upon standards.
//!
//! All checks are synchronous filesystem reads.

use std::path::PathBuf;

/// Returns the project root directory (where Cargo.toml lives).
fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Reads and parses `Cargo.toml`.
fn manifest() -> toml::Table {
    let path = project_root().join("Cargo.toml");
    let contents = std::fs::read_to_string(&path).unwrap_or_else(|e| {
        panic!("Failed to read '{}': {}", path.display(), e);
    });
    contents
        .parse::<toml::Table>()
        .unwrap_or_else(|e| panic!("Cargo.toml does not parse: {e}"))
}

fn table<'a>(parent: &'a toml::Table, key: &str) -> &'a toml::Table {
    parent
        .get(key)
        .and_then(toml::Value::as_table)
        .unwrap_or_else(|| panic!("Cargo.toml is missing the [{key}] table"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: panic_policy
// ─────────────────────────────────────────────────────────────────────────────

mod panic_policy {
    use super::*;

    const REQUIRED_DENY_LINTS: &[&str] = &[
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ];

    #[test]
    fn cargo_toml_has_all_panic_free_lints() {
        let manifest = manifest();
        let clippy = table(table(&manifest, "lints"), "clippy");

        for lint in REQUIRED_DENY_LINTS {
            let level = clippy.get(*lint).and_then(toml::Value::as_str);
            assert_eq!(
                level,
                Some("deny"),
                "[lints.clippy] must set `{lint} = \"deny\"`. All panic-prone \
                 lints must be denied to keep library code panic-free."
            );
        }
    }

    #[test]
    fn library_sources_do_not_call_unwrap_outside_tests() {
        let src = project_root().join("src");
        let mut pending = vec![src];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let contents = std::fs::read_to_string(&path).unwrap();
                // Unit tests live in a trailing `mod tests`.
                let library = contents
                    .split("mod tests {")
                    .next()
                    .unwrap_or_default();
                assert!(
                    !library.contains(".unwrap()") && !library.contains(".expect("),
                    "{} calls unwrap/expect in library code",
                    path.display()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: package_policy
// ─────────────────────────────────────────────────────────────────────────────

mod package_policy {
    use super::*;

    #[test]
    fn msrv_is_declared() {
        let manifest = manifest();
        let version = table(&manifest, "package")
            .get("rust-version")
            .and_then(toml::Value::as_str)
            .expect("Cargo.toml must declare a rust-version");
        assert!(
            version.split('.').count() == 3,
            "rust-version '{version}' should be a full major.minor.patch version"
        );
    }

    #[test]
    fn memory_broker_is_opt_in() {
        let manifest = manifest();
        let features = table(&manifest, "features");
        assert!(features.contains_key("memory-broker"));
        let default = features
            .get("default")
            .and_then(toml::Value::as_array)
            .expect("[features] must declare a default set");
        assert!(
            !default
                .iter()
                .any(|f| f.as_str() == Some("memory-broker")),
            "the loopback broker is a test double and must not ship in default builds"
        );
    }

    #[test]
    fn tests_enable_memory_broker() {
        let manifest = manifest();
        let name = table(&manifest, "package")
            .get("name")
            .and_then(toml::Value::as_str)
            .unwrap();
        let itself = table(table(&manifest, "dev-dependencies"), name);
        assert_eq!(itself.get("path").and_then(toml::Value::as_str), Some("."));
        let features = itself
            .get("features")
            .and_then(toml::Value::as_array)
            .expect("the self dev-dependency must enable features");
        assert!(features.iter().any(|f| f.as_str() == Some("memory-broker")));
    }

    #[test]
    fn demo_requires_memory_broker() {
        let manifest = manifest();
        let examples = manifest
            .get("example")
            .and_then(toml::Value::as_array)
            .expect("Cargo.toml must declare the demo as an [[example]]");
        for example in examples {
            let name = example.get("name").and_then(toml::Value::as_str).unwrap();
            let path = example.get("path").and_then(toml::Value::as_str).unwrap();
            assert!(
                project_root().join(path).is_file(),
                "example '{name}' points at missing file '{path}'"
            );
            let required = example
                .get("required-features")
                .and_then(toml::Value::as_array)
                .unwrap_or_else(|| panic!("example '{name}' must list required-features"));
            assert!(required.iter().any(|f| f.as_str() == Some("memory-broker")));
        }
    }

    #[test]
    fn tokio_runtime_is_not_forced_on_library_users() {
        let manifest = manifest();
        let tokio = table(table(&manifest, "dependencies"), "tokio");
        let features: Vec<&str> = tokio
            .get("features")
            .and_then(toml::Value::as_array)
            .expect("tokio must list its features explicitly")
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert!(
            !features.contains(&"full") && !features.contains(&"rt-multi-thread"),
            "the library must not pull in the multi-threaded runtime; \
             leave that choice to the application"
        );
    }
}
