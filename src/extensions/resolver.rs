//! Turns callback specifiers from the config descriptor into at most one
//! extension.
//!
//! A specifier is `<module>` or `<module>.<attribute>`.  The module is a file
//! `<project_root>/<module>.yaml` (or `.yml`, `.json`) whose top-level keys
//! name extension definitions.  The first specifier that resolves wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use super::http::{HookKind, HttpExtension, HttpExtensionDefinition};
use super::inject::{InjectDefinition, InjectExtension};
use super::{Extension, ExtensionHandle, NoopExtension};
use crate::config::ConfigDescriptor;
use crate::error::ExtensionError;

/// Names tried first when a specifier names only a module.
const PRIORITY_NAMES: [&str; 2] = ["skills_middleware", "middleware"];

const MODULE_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Registry of extension kinds this build knows how to instantiate.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtensionDefinition {
    Http(HttpExtensionDefinition),
    Inject(InjectDefinition),
    Noop,
}

impl ExtensionDefinition {
    /// Whether the definition provides a pre-call hook; only such
    /// definitions are picked when a specifier names just a module.
    pub fn exposes_pre_call(&self) -> bool {
        match self {
            ExtensionDefinition::Http(def) => def.exposes(HookKind::PreCall),
            ExtensionDefinition::Inject(_) | ExtensionDefinition::Noop => true,
        }
    }

    pub fn instantiate(&self, name: &str) -> Result<Arc<dyn Extension>, ExtensionError> {
        Ok(match self {
            ExtensionDefinition::Http(def) => Arc::new(HttpExtension::new(name, def.clone())?),
            ExtensionDefinition::Inject(def) => Arc::new(InjectExtension::new(name, def.clone())),
            ExtensionDefinition::Noop => Arc::new(NoopExtension),
        })
    }
}

/// Resolve the descriptor's callbacks against `project_root`.  Returns
/// `None` when nothing resolves; the proxy then runs as a plain passthrough.
pub fn resolve_extension(descriptor: &ConfigDescriptor, project_root: &Path) -> ExtensionHandle {
    for spec in descriptor.callbacks() {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        match resolve_callback(spec, project_root) {
            Some(ext) => {
                tracing::info!(callback = %spec, extension = %ext.name(), "extension resolved");
                return Some(ext);
            }
            None => {
                tracing::debug!(callback = %spec, root = %project_root.display(), "callback did not resolve");
            }
        }
    }
    None
}

fn resolve_callback(spec: &str, project_root: &Path) -> Option<Arc<dyn Extension>> {
    let (module, attr) = match spec.split_once('.') {
        Some((module, attr)) => (module, Some(attr)),
        None => (spec, None),
    };
    if module.is_empty() {
        return None;
    }
    let entries = load_module(project_root, module)?;
    let (name, def) = match attr {
        Some(attr) => (attr.to_string(), parse_definition(attr, entries.get(attr)?)?),
        None => pick_default(module, &entries)?,
    };
    match def.instantiate(&name) {
        Ok(ext) => Some(ext),
        Err(err) => {
            tracing::warn!(callback = %spec, error = %err, "failed to instantiate extension");
            None
        }
    }
}

fn module_path(project_root: &Path, module: &str) -> Option<PathBuf> {
    MODULE_EXTENSIONS
        .iter()
        .map(|ext| project_root.join(format!("{}.{}", module, ext)))
        .find(|p| p.is_file())
}

fn load_module(project_root: &Path, module: &str) -> Option<BTreeMap<String, serde_yaml::Value>> {
    let path = module_path(project_root, module)?;
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "extension module unreadable");
            return None;
        }
    };
    match serde_yaml::from_str(&content) {
        Ok(entries) => Some(entries),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "extension module is not a mapping");
            None
        }
    }
}

fn parse_definition(name: &str, raw: &serde_yaml::Value) -> Option<ExtensionDefinition> {
    match serde_yaml::from_value(raw.clone()) {
        Ok(def) => Some(def),
        Err(err) => {
            tracing::debug!(attribute = %name, error = %err, "not an extension definition");
            None
        }
    }
}

fn qualifying(name: &str, raw: &serde_yaml::Value) -> Option<ExtensionDefinition> {
    parse_definition(name, raw).filter(ExtensionDefinition::exposes_pre_call)
}

fn pick_default(
    module: &str,
    entries: &BTreeMap<String, serde_yaml::Value>,
) -> Option<(String, ExtensionDefinition)> {
    let mut preferred: Vec<&str> = PRIORITY_NAMES.to_vec();
    preferred.push(module);
    for name in preferred {
        if let Some(def) = entries.get(name).and_then(|raw| qualifying(name, raw)) {
            return Some((name.to_string(), def));
        }
    }
    entries
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .find_map(|(name, raw)| qualifying(name, raw).map(|def| (name.clone(), def)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn descriptor(callbacks: &[&str]) -> ConfigDescriptor {
        let yaml = format!(
            "proxy_settings:\n  callbacks: [{}]\n",
            callbacks
                .iter()
                .map(|c| format!("\"{}\"", c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn exact_attribute_lookup() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("hooks.yaml"),
            "alpha:\n  kind: noop\nbeta:\n  kind: inject\n  correlate: true\n",
        )
        .unwrap();
        let ext = resolve_extension(&descriptor(&["hooks.beta"]), dir.path()).unwrap();
        assert_eq!(ext.name(), "beta");
    }

    #[test]
    fn module_lookup_prefers_conventional_names() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("hooks.yaml"),
            "aaa:\n  kind: noop\nmiddleware:\n  kind: inject\nskills_middleware:\n  kind: inject\n  correlate: true\n",
        )
        .unwrap();
        let ext = resolve_extension(&descriptor(&["hooks"]), dir.path()).unwrap();
        assert_eq!(ext.name(), "skills_middleware");
    }

    #[test]
    fn module_named_attribute_beats_fallback_scan() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("hooks.yaml"),
            "aaa:\n  kind: noop\nhooks:\n  kind: inject\n",
        )
        .unwrap();
        let ext = resolve_extension(&descriptor(&["hooks"]), dir.path()).unwrap();
        assert_eq!(ext.name(), "hooks");
    }

    #[test]
    fn fallback_skips_private_and_non_qualifying_entries() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("hooks.yaml"),
            concat!(
                "_hidden:\n  kind: noop\n",
                "a_setting: 3\n",
                "b_logger:\n  kind: http\n  url: http://127.0.0.1:1\n  hooks: [log_success]\n",
                "c_real:\n  kind: http\n  url: http://127.0.0.1:1\n",
            ),
        )
        .unwrap();
        let ext = resolve_extension(&descriptor(&["hooks"]), dir.path()).unwrap();
        assert_eq!(ext.name(), "c_real");
    }

    #[test]
    fn missing_module_falls_through_to_next_specifier() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("second.json"), r#"{"middleware": {"kind": "noop"}}"#).unwrap();
        let ext = resolve_extension(&descriptor(&["first", "second"]), dir.path()).unwrap();
        assert_eq!(ext.name(), "noop");
    }

    #[test]
    fn nothing_resolves() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("broken.yaml"), "- not\n- a mapping\n").unwrap();
        fs::write(dir.path().join("empty.yaml"), "unrelated: 1\n").unwrap();
        assert!(resolve_extension(&descriptor(&["broken", "empty", "absent.x"]), dir.path()).is_none());
        assert!(resolve_extension(&ConfigDescriptor::default(), dir.path()).is_none());
    }
}
