//! Classpath assembly
//!
//! The server is launched with a precomputed classpath instead of resolving
//! Gradle dependencies itself. Entries come from the project model, from
//! generated-source and compiled-class directories under each Android
//! module's `build/`, and from the Kotlin scripting jars in the Gradle cache.
//! Only existing paths are kept, in first-seen order.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use regex::Regex;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Generated source roots under a module's `build/`
pub const GENERATED_SOURCE_DIRS: &[&str] = &[
    "generated/source/r/debug",
    "generated/not_namespaced_r_class_sources/debug/r",
    "generated/not_namespaced_r_class_sources/debug/processDebugResources/r",
    "generated/source/buildConfig/debug",
    "generated/data_binding_base_class_source_out/debug/out",
    "generated/source/dataBinding/debug",
    "generated/source/viewBinding/debug",
    "generated/ap_generated_sources/debug/out",
    "generated/aidl_source_output_dir/debug/out",
    "generated/source/kapt/debug",
    "generated/source/kaptKotlin/debug",
    "generated/ksp/debug/kotlin",
    "generated/ksp/debug/java",
    "tmp/kapt3/classes/debug",
    "generated/source/navigation-args/debug",
    "generated/res/resValues/debug",
];

/// Compiled class outputs under a module's `build/intermediates/`
pub const COMPILED_CLASS_DIRS: &[&str] = &[
    "javac/debug/classes",
    "compile_library_classes_jar/debug/classes.jar",
    "compile_app_classes_jar/debug/classes.jar",
    "kotlin-classes/debug",
];

/// Artifacts needed for `.kts` support, looked up in the Gradle cache
pub const SCRIPTING_ARTIFACTS: &[&str] = &[
    "kotlin-script-runtime",
    "kotlin-scripting-common",
    "kotlin-scripting-jvm",
    "kotlin-scripting-compiler-embeddable",
];

/// Depth of the source directory scan below `build/generated`
pub const SOURCE_SCAN_DEPTH: usize = 4;

const KOTLIN_GROUP_CACHE: &str = "caches/modules-2/files-2.1/org.jetbrains.kotlin";

/// One Gradle module as seen by the project model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub root: PathBuf,
    pub compile_classpaths: Vec<PathBuf>,
    pub module_classpaths: Vec<PathBuf>,
    pub boot_classpaths: Vec<PathBuf>,
    pub generated_jar: Option<PathBuf>,
    pub variant_class_jars: Vec<PathBuf>,
    pub is_android: bool,
}

impl ModuleInfo {
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }
}

/// Project metadata supplied by the host
pub trait ProjectModelProvider: Send + Sync {
    fn project_root(&self) -> PathBuf;

    fn modules(&self) -> Vec<ModuleInfo>;

    /// Classpath reported by an external compiler service, if any
    fn compiler_classpaths(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn android_sdk(&self) -> Option<PathBuf> {
        None
    }

    fn gradle_user_home(&self) -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".gradle"))
    }
}

/// Fixed project model, used by the CLI and tests
#[derive(Debug, Clone, Default)]
pub struct StaticProjectModel {
    pub root: PathBuf,
    pub modules: Vec<ModuleInfo>,
    pub compiler_classpaths: Vec<PathBuf>,
    pub android_sdk: Option<PathBuf>,
    pub gradle_user_home: Option<PathBuf>,
}

impl StaticProjectModel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Find Gradle modules (directories with a build script) below `root`
    ///
    /// A module whose build script applies an Android plugin is marked as
    /// Android.
    pub fn discover(root: &Path, depth: usize) -> Self {
        let mut modules = Vec::new();
        let walker = WalkDir::new(root)
            .max_depth(depth + 1)
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !(entry.depth() > 0 && (name.starts_with('.') || name == "build"))
            });

        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            let Some(script) = ["build.gradle.kts", "build.gradle"]
                .iter()
                .map(|name| dir.join(name))
                .find(|path| path.is_file())
            else {
                continue;
            };

            let is_android = fs::read_to_string(&script)
                .map(|text| text.contains("com.android"))
                .unwrap_or(false);
            trace!("Discovered module {} (android: {})", dir.display(), is_android);
            modules.push(ModuleInfo {
                root: dir.to_path_buf(),
                is_android,
                ..ModuleInfo::default()
            });
        }

        info!("Discovered {} Gradle module(s) under {}", modules.len(), root.display());
        Self {
            root: root.to_path_buf(),
            modules,
            ..Self::default()
        }
    }

    pub fn with_android_sdk(mut self, sdk: Option<PathBuf>) -> Self {
        self.android_sdk = sdk;
        self
    }
}

impl ProjectModelProvider for StaticProjectModel {
    fn project_root(&self) -> PathBuf {
        self.root.clone()
    }

    fn modules(&self) -> Vec<ModuleInfo> {
        self.modules.clone()
    }

    fn compiler_classpaths(&self) -> Vec<PathBuf> {
        self.compiler_classpaths.clone()
    }

    fn android_sdk(&self) -> Option<PathBuf> {
        self.android_sdk.clone()
    }

    fn gradle_user_home(&self) -> Option<PathBuf> {
        self.gradle_user_home
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".gradle")))
    }
}

/// Ordered, deduplicated set of classpath entries
#[derive(Debug, Default)]
struct ClasspathSet {
    entries: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
}

impl ClasspathSet {
    fn add(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if self.seen.insert(path.clone()) {
            self.entries.push(path);
        }
    }

    fn extend<I: IntoIterator<Item = PathBuf>>(&mut self, paths: I) {
        for path in paths {
            self.add(path);
        }
    }

    /// Entries that exist on disk
    fn into_existing(self) -> Vec<PathBuf> {
        let total = self.entries.len();
        let existing: Vec<PathBuf> = self
            .entries
            .into_iter()
            .filter(|path| path.exists())
            .collect();
        info!("Classpath entries: {}, existing: {}", total, existing.len());
        existing
    }
}

pub struct ClasspathAssembler {
    provider: Arc<dyn ProjectModelProvider>,
    cached: Mutex<Option<Vec<PathBuf>>>,
}

impl ClasspathAssembler {
    pub fn new(provider: Arc<dyn ProjectModelProvider>) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &Arc<dyn ProjectModelProvider> {
        &self.provider
    }

    /// The classpath, assembled on first use and cached until [`invalidate`]
    ///
    /// [`invalidate`]: Self::invalidate
    pub fn assemble(&self) -> Vec<PathBuf> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(classpath) = cached.as_ref() {
            return classpath.clone();
        }
        let classpath = self.collect();
        *cached = Some(classpath.clone());
        classpath
    }

    pub fn classpath_string(&self) -> String {
        self.assemble()
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
        info!("Classpath cache invalidated");
    }

    /// Android SDK root, from the provider or derived from `android.jar`
    ///
    /// `android.jar` lives at `<sdk>/platforms/<platform>/android.jar`.
    pub fn android_sdk_path(&self) -> Option<PathBuf> {
        if let Some(sdk) = self.provider.android_sdk() {
            return Some(sdk);
        }
        self.provider
            .modules()
            .iter()
            .flat_map(|module| module.boot_classpaths.iter())
            .find(|path| path.file_name().is_some_and(|name| name == "android.jar"))
            .and_then(|jar| jar.parent()?.parent()?.parent())
            .map(Path::to_path_buf)
    }

    /// Existing `build/generated` directories, watched for rebuilds
    pub fn generated_roots(&self) -> Vec<PathBuf> {
        self.provider
            .modules()
            .iter()
            .map(|module| module.build_dir().join("generated"))
            .filter(|dir| dir.is_dir())
            .collect()
    }

    fn collect(&self) -> Vec<PathBuf> {
        let mut set = ClasspathSet::default();

        set.extend(self.provider.compiler_classpaths());

        for module in self.provider.modules() {
            set.extend(module.compile_classpaths.iter().cloned());
            set.extend(module.module_classpaths.iter().cloned());
            if !module.is_android {
                continue;
            }
            set.extend(module.boot_classpaths.iter().cloned());
            if let Some(jar) = &module.generated_jar {
                set.add(jar.clone());
            }
            set.extend(module.variant_class_jars.iter().cloned());
            add_generated_sources(&module, &mut set);
        }

        match self.provider.gradle_user_home() {
            Some(gradle_home) => {
                let version = detect_kotlin_version(&self.provider.project_root());
                let jars = scripting_jars(&gradle_home, version.as_deref());
                if jars.is_empty() {
                    warn!(
                        "No Kotlin scripting jars in {}; .kts support may be limited",
                        gradle_home.display()
                    );
                }
                set.extend(jars);
            }
            None => debug!("No Gradle user home, skipping scripting jars"),
        }

        set.into_existing()
    }
}

fn add_generated_sources(module: &ModuleInfo, set: &mut ClasspathSet) {
    let build_dir = module.build_dir();
    if !build_dir.is_dir() {
        debug!("No build directory for module {}", module.root.display());
        return;
    }

    for relative in GENERATED_SOURCE_DIRS {
        let dir = build_dir.join(relative);
        if dir.is_dir() {
            trace!("Generated source: {}", dir.display());
            set.add(dir);
        }
    }

    for relative in COMPILED_CLASS_DIRS {
        let path = build_dir.join("intermediates").join(relative);
        if path.exists() {
            set.add(path);
        }
    }

    let generated = build_dir.join("generated");
    if generated.is_dir() {
        set.extend(source_directories(&generated, SOURCE_SCAN_DEPTH));
    }
}

/// Directories below `root` that directly contain `.kt` or `.java` files
fn source_directories(root: &Path, depth: usize) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root)
        .max_depth(depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir())
    {
        let has_sources = fs::read_dir(entry.path())
            .map(|children| {
                children.filter_map(Result::ok).any(|child| {
                    child
                        .path()
                        .extension()
                        .is_some_and(|ext| ext == "kt" || ext == "java")
                })
            })
            .unwrap_or(false);
        if has_sources {
            found.push(entry.path().to_path_buf());
        }
    }
    found
}

/// Scripting jars from `<gradle_home>/caches/modules-2/files-2.1/org.jetbrains.kotlin`
///
/// Prefers the project's Kotlin version, else the highest version present.
pub fn scripting_jars(gradle_home: &Path, kotlin_version: Option<&str>) -> Vec<PathBuf> {
    let cache = gradle_home.join(KOTLIN_GROUP_CACHE);
    if !cache.is_dir() {
        debug!("Gradle cache not found at {}", cache.display());
        return Vec::new();
    }

    let mut jars = Vec::new();
    for artifact in SCRIPTING_ARTIFACTS {
        let Ok(entries) = fs::read_dir(cache.join(artifact)) else {
            continue;
        };
        let versions: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();

        let preferred = kotlin_version.and_then(|wanted| {
            versions
                .iter()
                .find(|path| path.file_name().is_some_and(|name| name == wanted))
        });
        let Some(version_dir) =
            preferred.or_else(|| versions.iter().max_by_key(|path| version_key(path)))
        else {
            continue;
        };

        // version/<hash>/<artifact>-<version>.jar
        for entry in WalkDir::new(version_dir)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
        {
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_file()
                && name.ends_with(".jar")
                && !name.contains("sources")
                && !name.contains("javadoc")
            {
                trace!("Kotlin scripting jar: {}", entry.path().display());
                jars.push(entry.path().to_path_buf());
            }
        }
    }
    jars
}

/// Numeric components of a version directory name, so `1.10.0` sorts after `1.9.0`
fn version_key(path: &Path) -> Vec<u64> {
    path.file_name()
        .map(|name| {
            name.to_string_lossy()
                .split(['.', '-'])
                .map(|part| part.parse().unwrap_or(0))
                .collect()
        })
        .unwrap_or_default()
}

/// Kotlin version declared by the root build script or `gradle.properties`
pub fn detect_kotlin_version(project_root: &Path) -> Option<String> {
    if let Ok(script) = fs::read_to_string(project_root.join("build.gradle.kts")) {
        let patterns = [
            r#"kotlin\("[^"]+"\)\s+version\s+"([^"]+)""#,
            r#"id\("org\.jetbrains\.kotlin\.[^"]+"\)\s+version\s+"([^"]+)""#,
        ];
        for pattern in patterns {
            if let Ok(regex) = Regex::new(pattern)
                && let Some(caps) = regex.captures(&script)
            {
                return Some(caps[1].to_string());
            }
        }
    }

    let properties = fs::read_to_string(project_root.join("gradle.properties")).ok()?;
    properties.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        matches!(key.trim(), "kotlin.version" | "kotlinVersion").then(|| value.trim().to_string())
    })
}
