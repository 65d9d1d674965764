//! [`OnBuildSource`] bridging `kiln-dockerfile`'s analyzer to a real
//! runtime and registry: local runtime first, registry on miss,
//! pull-then-reinspect as a last resort.

use kiln_dockerfile::OnBuildSource;
use kiln_registry::Registry;
use kiln_runtime::RuntimeDriver;
use kiln_types::KilnError;

pub struct RuntimeOnBuildSource<'a, R> {
    runtime: &'a dyn RuntimeDriver,
    registry: Option<&'a R>,
}

impl<'a, R: Registry> RuntimeOnBuildSource<'a, R> {
    pub fn new(runtime: &'a dyn RuntimeDriver, registry: Option<&'a R>) -> Self {
        Self { runtime, registry }
    }
}

impl<'a, R: Registry> OnBuildSource for RuntimeOnBuildSource<'a, R> {
    fn onbuild_from_runtime(&self, image: &str) -> Result<Option<Vec<String>>, KilnError> {
        Ok(self.runtime.inspect(image)?.map(|manifest| manifest.on_build))
    }

    fn onbuild_from_registry(&self, image: &str) -> Result<Option<Vec<String>>, KilnError> {
        let Some(registry) = self.registry else {
            return Ok(None);
        };
        match registry.get_config_file(image) {
            Ok(config) => Ok(Some(config.on_build)),
            Err(_) => Ok(None),
        }
    }

    fn pull_and_inspect(&self, image: &str) -> Result<Vec<String>, KilnError> {
        self.runtime.pull(image)?;
        Ok(self.runtime.inspect(image)?.map(|manifest| manifest.on_build).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_registry::ConfigFile;
    use kiln_runtime::{ContainerConfig, DockerfileBuildArgs, Manifest};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRuntime {
        manifest: Option<Manifest>,
        pulls: AtomicUsize,
    }

    impl RuntimeDriver for FakeRuntime {
        fn inspect(&self, _name: &str) -> Result<Option<Manifest>, KilnError> {
            Ok(self.manifest.clone())
        }
        fn pull(&self, _name: &str) -> Result<(), KilnError> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn push(&self, _name: &str) -> Result<(), KilnError> {
            Ok(())
        }
        fn build(&self, _args: &DockerfileBuildArgs) -> Result<String, KilnError> {
            Ok(String::new())
        }
        fn commit(&self, _config: &ContainerConfig) -> Result<String, KilnError> {
            Ok(String::new())
        }
        fn tag(&self, _local_id: &str, _name: &str) -> Result<(), KilnError> {
            Ok(())
        }
        fn untag(&self, _name: &str) -> Result<(), KilnError> {
            Ok(())
        }
        fn exists(&self, _name: &str) -> Result<bool, KilnError> {
            Ok(false)
        }
    }

    struct FakeRegistry {
        config: Option<ConfigFile>,
    }

    impl Registry for FakeRegistry {
        fn tags(&self, _repo: &str) -> Result<Vec<String>, KilnError> {
            Ok(vec![])
        }
        fn get_config_file(&self, _reference: &str) -> Result<ConfigFile, KilnError> {
            self.config.clone().ok_or_else(|| KilnError::new(kiln_types::KilnErrorKind::RuntimeError, "not found"))
        }
        fn push_image(&self, _reference: &str, _labels: &BTreeMap<String, String>) -> Result<(), KilnError> {
            Ok(())
        }
        fn delete_image(&self, _reference: &str) -> Result<(), KilnError> {
            Ok(())
        }
        fn exists(&self, _reference: &str) -> Result<bool, KilnError> {
            Ok(false)
        }
        fn create_repo(&self, _repo: &str) -> Result<(), KilnError> {
            Ok(())
        }
        fn delete_repo(&self, _repo: &str) -> Result<(), KilnError> {
            Ok(())
        }
    }

    #[test]
    fn runtime_hit_short_circuits_registry() {
        let runtime = FakeRuntime { manifest: Some(Manifest { labels: BTreeMap::new(), on_build: vec!["RUN a".to_string()], parent: None }), pulls: AtomicUsize::new(0) };
        let source = RuntimeOnBuildSource::<FakeRegistry>::new(&runtime, None);
        let lines = source.onbuild_from_runtime("alpine:3.19").unwrap();
        assert_eq!(lines, Some(vec!["RUN a".to_string()]));
    }

    #[test]
    fn registry_miss_falls_back_to_pull_and_inspect() {
        let runtime = FakeRuntime { manifest: None, pulls: AtomicUsize::new(0) };
        let registry = FakeRegistry { config: None };
        let source = RuntimeOnBuildSource::new(&runtime, Some(&registry));
        assert_eq!(source.onbuild_from_runtime("alpine:3.19").unwrap(), None);
        assert!(source.onbuild_from_registry("alpine:3.19").unwrap().is_none());
        let lines = source.pull_and_inspect("alpine:3.19").unwrap();
        assert!(lines.is_empty());
        assert_eq!(runtime.pulls.load(Ordering::SeqCst), 1);
    }
}
