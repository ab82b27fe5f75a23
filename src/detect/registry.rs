use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::{DetectionScript, MotionBackend, ScriptedBackend, StubBackend};

/// Options a backend factory may consume.
#[derive(Clone, Debug, Default)]
pub struct BackendOptions {
    /// Track script for the `scripted` backend.
    pub script: Option<PathBuf>,
}

type BackendFactory = fn(&BackendOptions) -> Result<Box<dyn DetectorBackend>>;

/// Registry of detector backend factories, keyed by name.
///
/// Both `vigild` (in-process inference) and `vigil_infer_worker` construct
/// their detector through the registry so the configured name means the same
/// thing in either mode.
pub struct BackendRegistry {
    factories: BTreeMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every built-in backend.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("stub", |_| Ok(Box::new(StubBackend::new())));
        registry.register("motion", |_| Ok(Box::new(MotionBackend::new())));
        registry.register("scripted", |opts| {
            let path = opts
                .script
                .as_ref()
                .ok_or_else(|| anyhow!("scripted backend requires a script path"))?;
            Ok(Box::new(ScriptedBackend::new(DetectionScript::load(path)?)))
        });
        registry
    }

    /// Register a factory. A later registration under the same name replaces it.
    pub fn register(&mut self, name: &'static str, factory: BackendFactory) {
        self.factories.insert(name, factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Build and warm up a backend.
    pub fn create(&self, name: &str, opts: &BackendOptions) -> Result<Box<dyn DetectorBackend>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "backend '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            )
        })?;
        let mut backend = factory(opts)?;
        backend.warm_up()?;
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_backends_are_registered() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.list(), vec!["motion", "scripted", "stub"]);
        let backend = registry.create("stub", &BackendOptions::default()).unwrap();
        assert_eq!(backend.name(), "stub");
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let registry = BackendRegistry::with_builtin();
        let err = registry
            .create("yolo", &BackendOptions::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    fn scripted_backend_requires_script() {
        let registry = BackendRegistry::with_builtin();
        assert!(registry.create("scripted", &BackendOptions::default()).is_err());
    }
}
