//! Template lookup.
//!
//! A [`TemplateProvider`] resolves templates by name: the root template of a
//! conversion, auxiliary data such as the code-system mapping table or JSON
//! schemas, and everything the renderer pulls in through `{% include %}`.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

/// A named template source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    name: String,
    source: Arc<str>,
}

impl Template {
    pub fn new(name: impl Into<String>, source: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

type LookupFn = dyn Fn(&str) -> Option<Template> + Send + Sync;

/// Cloneable lookup handle the renderer uses to resolve includes.
#[derive(Clone)]
pub struct TemplateFileSystem {
    lookup: Arc<LookupFn>,
}

impl TemplateFileSystem {
    pub fn new<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<Template> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    pub fn read(&self, name: &str) -> Option<Template> {
        (self.lookup)(name)
    }
}

impl fmt::Debug for TemplateFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TemplateFileSystem")
    }
}

/// Source of templates for conversions.
pub trait TemplateProvider: Send + Sync {
    /// Look up a template by name. `None` is a normal outcome for optional
    /// templates such as the code-system mapping.
    fn get_template(&self, name: &str) -> Option<Template>;

    /// Handle used by the renderer to resolve includes by name.
    fn template_file_system(&self) -> TemplateFileSystem;
}

/// Templates held in memory.
///
/// # Example
///
/// ```
/// use fhir_converter::{MemoryTemplateProvider, TemplateProvider};
///
/// let provider = MemoryTemplateProvider::new()
///     .with_template("ADT_A01", "{{ hl7v2Data.PID[5] }}");
/// assert!(provider.get_template("ADT_A01").is_some());
/// assert!(provider.get_template("ORU_R01").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryTemplateProvider {
    templates: Arc<HashMap<String, Template>>,
}

impl MemoryTemplateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, name: impl Into<String>, source: impl Into<Arc<str>>) -> Self {
        self.insert(name, source);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<Arc<str>>) {
        let name = name.into();
        let template = Template::new(name.clone(), source);
        Arc::make_mut(&mut self.templates).insert(name, template);
    }

    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }
}

impl TemplateProvider for MemoryTemplateProvider {
    fn get_template(&self, name: &str) -> Option<Template> {
        self.templates.get(name).cloned()
    }

    fn template_file_system(&self) -> TemplateFileSystem {
        let templates = self.templates.clone();
        TemplateFileSystem::new(move |name| templates.get(name).cloned())
    }
}

/// Extensions tried, in order, when a name has no exact file match.
pub const TEMPLATE_EXTENSIONS: &[&str] = &["j2", "jinja", "json"];

/// Templates stored under a directory, addressed by relative path.
///
/// `Resource/Patient` resolves to `<root>/Resource/Patient`, then
/// `<root>/Resource/Patient.j2`, `.jinja` and `.json`. Names that are absolute
/// or climb out of the root never resolve.
#[derive(Debug, Clone)]
pub struct DirectoryTemplateProvider {
    root: Arc<PathBuf>,
}

impl DirectoryTemplateProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of all templates under the root, sorted.
    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = WalkDir::new(self.root.as_path())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(self.root.as_path()).ok()?;
                Some(template_name_for(relative))
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl TemplateProvider for DirectoryTemplateProvider {
    fn get_template(&self, name: &str) -> Option<Template> {
        load_from_dir(&self.root, name)
    }

    fn template_file_system(&self) -> TemplateFileSystem {
        let root = self.root.clone();
        TemplateFileSystem::new(move |name| load_from_dir(&root, name))
    }
}

fn template_name_for(relative: &Path) -> String {
    let mut name = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    for ext in TEMPLATE_EXTENSIONS {
        if let Some(stripped) = name.strip_suffix(&format!(".{ext}")) {
            name = stripped.to_string();
            break;
        }
    }
    name
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn load_from_dir(root: &Path, name: &str) -> Option<Template> {
    if !is_safe_name(name) {
        tracing::warn!(template = name, "rejecting template name outside the template root");
        return None;
    }
    let base = root.join(name);
    let candidates = std::iter::once(base.clone())
        .chain(TEMPLATE_EXTENSIONS.iter().map(|ext| append_extension(&base, ext)));

    for path in candidates {
        match fs::read_to_string(&path) {
            Ok(source) => return Some(Template::new(name, source)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            // Directories with the template's name land here on most platforms.
            Err(e) if path.is_dir() => {
                tracing::trace!(path = %path.display(), error = %e, "skipping directory");
                continue;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read template");
                return None;
            }
        }
    }
    None
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}
