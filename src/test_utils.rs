//! Test utilities and global setup
//!
//! Provides centralized test logging configuration and filesystem fixtures
//! for Kotlin projects and language-server installations.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, defaulting to debug for this crate and info for
    /// tokio. Output goes through the test writer so it is captured per test.
    ///
    /// ```bash
    /// RUST_LOG=kotlin_lsp_bridge::lsp=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info,notify=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Global test logging setup
///
/// Add this to any test module where you want automatic logging initialization.
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Kotlin language server installation for integration tests
///
/// Reads `KLS_HOME` (the directory containing `lib/*.jar`).
#[cfg(all(test, feature = "kls-integration-tests"))]
pub fn get_test_kls_home() -> Option<std::path::PathBuf> {
    std::env::var_os("KLS_HOME").map(std::path::PathBuf::from)
}

/// Filesystem fixtures
#[cfg(test)]
pub mod fixtures {
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Gradle-shaped Kotlin project in a temporary directory
    pub struct TestKotlinProject {
        _temp_dir: TempDir,
        pub root: PathBuf,
    }

    impl TestKotlinProject {
        /// Project with a single `app` module
        pub fn new() -> Result<Self, std::io::Error> {
            let temp_dir = TempDir::new()?;
            let root = temp_dir.path().canonicalize()?;

            fs::write(
                root.join("settings.gradle.kts"),
                "rootProject.name = \"demo\"\ninclude(\":app\")\n",
            )?;
            fs::create_dir_all(root.join("app/src/main/kotlin/com/example/app"))?;

            Ok(Self {
                _temp_dir: temp_dir,
                root,
            })
        }

        pub fn module_root(&self) -> PathBuf {
            self.root.join("app")
        }

        /// Write a file relative to the project root, creating parents
        pub fn write(&self, relative: &str, content: &str) -> Result<PathBuf, std::io::Error> {
            let path = self.root.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content)?;
            Ok(path)
        }

        /// Create a directory relative to the project root
        pub fn mkdir(&self, relative: &str) -> Result<PathBuf, std::io::Error> {
            let path = self.root.join(relative);
            fs::create_dir_all(&path)?;
            Ok(path)
        }
    }

    /// Fake server installation: `lib/*.jar` plus a `java` launcher script
    ///
    /// The script records its arguments and environment, prints a line on
    /// stderr, then idles with stdout open until it is signalled.
    pub struct FakeServerHome {
        _temp_dir: TempDir,
        pub server_home: PathBuf,
        pub java_home: PathBuf,
        pub record_dir: PathBuf,
    }

    impl FakeServerHome {
        pub fn new() -> Result<Self, std::io::Error> {
            let temp_dir = TempDir::new()?;
            let base = temp_dir.path().canonicalize()?;

            let server_home = base.join("server");
            fs::create_dir_all(server_home.join("lib"))?;
            fs::write(server_home.join("lib/server.jar"), b"")?;
            fs::write(server_home.join("lib/kotlin-stdlib.jar"), b"")?;
            fs::write(server_home.join("lib/README.txt"), b"not a jar")?;

            let record_dir = base.join("record");
            fs::create_dir_all(&record_dir)?;

            let java_home = base.join("jdk");
            fs::create_dir_all(java_home.join("bin"))?;
            let script = format!(
                "#!/bin/sh\necho launched >> \"{dir}/launches.txt\"\nprintf '%s\\n' \"$@\" > \"{dir}/args.txt\"\nenv > \"{dir}/env.txt\"\necho \"fake server ready\" >&2\nexec sleep 600\n",
                dir = record_dir.display()
            );
            write_executable(&java_home.join("bin/java"), &script)?;

            Ok(Self {
                _temp_dir: temp_dir,
                server_home,
                java_home,
                record_dir,
            })
        }

        /// Lines the fake launcher recorded into `name`, once it exists
        pub async fn recorded(&self, name: &str) -> Vec<String> {
            let path = self.record_dir.join(name);
            for _ in 0..200 {
                if let Ok(text) = fs::read_to_string(&path)
                    && !text.is_empty()
                {
                    return text.lines().map(str::to_string).collect();
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            Vec::new()
        }
    }

    fn write_executable(path: &Path, content: &str) -> Result<(), std::io::Error> {
        use std::os::unix::fs::PermissionsExt;

        fs::write(path, content)?;
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(path, permissions)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_kotlin_project_layout() {
            let project = TestKotlinProject::new().unwrap();
            assert!(project.root.join("settings.gradle.kts").exists());
            assert!(project.module_root().join("src/main/kotlin").is_dir());

            let file = project
                .write("app/src/main/kotlin/com/example/app/Main.kt", "package com.example.app\n")
                .unwrap();
            assert!(file.is_file());
        }

        #[test]
        fn test_fake_server_home_layout() {
            let home = FakeServerHome::new().unwrap();
            assert!(home.server_home.join("lib/server.jar").is_file());
            assert!(home.java_home.join("bin/java").is_file());
        }
    }
}
