//! Engine name to implementation lookup.
//!
//! Registration happens once at start of day through a [`Registrar`],
//! which guards the table with a mutex. [`Registrar::finish`] freezes it
//! into an [`EngineRegistry`] that is only ever read.

use std::collections::HashMap;
use std::sync::Mutex;

use stagehand_common::config::{CommonConfig, probe_engine_name};
use stagehand_common::error::{Result, StagehandError};

use super::{Engine, Operations, native};

/// Builds an uninitialized engine implementation.
pub type EngineConstructor = fn() -> Box<dyn Operations>;

/// Mutable registration phase of the engine table.
#[derive(Debug, Default)]
pub struct Registrar {
    engines: Mutex<HashMap<String, EngineConstructor>>,
}

impl Registrar {
    /// Creates an empty registrar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `constructor` under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or already registered.
    pub fn register(&self, name: &str, constructor: EngineConstructor) -> Result<()> {
        if name.is_empty() {
            return Err(StagehandError::Config {
                message: "engine name must not be empty".into(),
            });
        }
        let mut engines = self.engines.lock().map_err(|_| StagehandError::Config {
            message: "engine registry lock poisoned".into(),
        })?;
        if engines.contains_key(name) {
            return Err(StagehandError::Config {
                message: format!("engine {name:?} registered twice"),
            });
        }
        let _ = engines.insert(name.to_owned(), constructor);
        tracing::debug!(engine = name, "engine registered");
        Ok(())
    }

    /// Ends registration.
    ///
    /// # Errors
    ///
    /// Returns an error if a registering thread panicked.
    pub fn finish(self) -> Result<EngineRegistry> {
        let engines = self.engines.into_inner().map_err(|_| StagehandError::Config {
            message: "engine registry lock poisoned".into(),
        })?;
        Ok(EngineRegistry { engines })
    }
}

/// Frozen engine table.
#[derive(Debug)]
pub struct EngineRegistry {
    engines: HashMap<String, EngineConstructor>,
}

impl EngineRegistry {
    /// Registry holding the engines shipped with this crate.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub fn builtin() -> Result<Self> {
        let registrar = Registrar::new();
        registrar.register(native::ENGINE_NAME, native::NativeEngine::boxed)?;
        registrar.finish()
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.engines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds the engine named by a JSON payload.
    ///
    /// Only `engineName` is read first. The common wrapper is decoded once
    /// the implementation is known, and the engine decodes its own part.
    ///
    /// # Errors
    ///
    /// Returns [`StagehandError::UnknownEngine`] for an unregistered name,
    /// or a decoding error from the wrapper or the engine.
    pub fn new_engine(&self, payload: &[u8]) -> Result<Engine> {
        let name = probe_engine_name(payload)?;
        let constructor = self
            .engines
            .get(&name)
            .ok_or_else(|| StagehandError::UnknownEngine { name: name.clone() })?;
        let mut ops = constructor();
        let common: CommonConfig = serde_json::from_slice(payload)?;
        ops.init_config(common.engine_config.clone())?;
        tracing::debug!(engine = %name, container = %common.container_id, "engine initialized");
        Ok(Engine::new(common, ops))
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::os::unix::net::UnixStream;

    use nix::unistd::Pid;
    use stagehand_common::types::WaitStatus;
    use stagehand_core::shared::Config;

    use super::*;
    use crate::rpc::client::RpcClient;

    #[derive(Default)]
    struct Marker {
        value: serde_json::Value,
    }

    impl Operations for Marker {
        fn init_config(&mut self, config: serde_json::Value) -> Result<()> {
            if config.get("reject").is_some() {
                return Err(StagehandError::Config {
                    message: "rejected".into(),
                });
            }
            self.value = config;
            Ok(())
        }
        fn config(&self) -> Result<serde_json::Value> {
            Ok(self.value.clone())
        }
        fn prepare_config(&mut self, _: &mut Config) -> Result<()> {
            Ok(())
        }
        fn create_container(&self, _: Pid, _: &mut RpcClient) -> Result<()> {
            Ok(())
        }
        fn start_process(&self, _: &mut UnixStream) -> Result<Infallible> {
            Err(StagehandError::Config {
                message: "marker".into(),
            })
        }
        fn post_start_process(&self, _: Pid) -> Result<()> {
            Ok(())
        }
        fn cleanup_container(&self, _: Option<&StagehandError>, _: Option<WaitStatus>) -> Result<()> {
            Ok(())
        }
    }

    fn marker() -> Box<dyn Operations> {
        Box::new(Marker::default())
    }

    fn registry() -> EngineRegistry {
        let registrar = Registrar::new();
        registrar.register("marker", marker).unwrap();
        registrar.register(native::ENGINE_NAME, native::NativeEngine::boxed).unwrap();
        registrar.finish().unwrap()
    }

    #[test]
    fn every_registered_name_resolves() {
        let registry = registry();
        for name in registry.names() {
            let payload = format!(r#"{{"engineName":"{name}","engineConfig":{{}}}}"#);
            let engine = registry.new_engine(payload.as_bytes()).unwrap();
            assert_eq!(engine.name(), name);
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = registry()
            .new_engine(br#"{"engineName":"singularity"}"#)
            .unwrap_err();
        assert!(matches!(err, StagehandError::UnknownEngine { name } if name == "singularity"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registrar = Registrar::new();
        registrar.register("marker", marker).unwrap();
        assert!(registrar.register("marker", marker).is_err());
    }

    #[test]
    fn engine_config_reaches_implementation() {
        let engine = registry()
            .new_engine(br#"{"engineName":"marker","containerID":"c1","engineConfig":{"k":1}}"#)
            .unwrap();
        assert_eq!(engine.container_id().as_str(), "c1");
        let json: serde_json::Value = serde_json::from_slice(&engine.to_json().unwrap()).unwrap();
        assert_eq!(json["engineConfig"]["k"], 1);
        assert_eq!(json["containerID"], "c1");
    }

    #[test]
    fn init_failure_returns_no_engine() {
        let result = registry().new_engine(br#"{"engineName":"marker","engineConfig":{"reject":true}}"#);
        assert!(matches!(result, Err(StagehandError::Config { .. })));
    }

    #[test]
    fn builtin_has_native() {
        assert_eq!(EngineRegistry::builtin().unwrap().names(), vec!["native"]);
    }
}
