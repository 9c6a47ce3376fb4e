//! Shared handle to the current system
//!
//! Everything that needs the running system goes through a `SystemHandle`.
//! A restart swaps the system behind the handle.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{CastleAcDc, SystemResult};
use crate::config::load_config;

#[derive(Clone)]
pub struct SystemHandle {
    current: Arc<RwLock<Arc<CastleAcDc>>>,
    /// Configuration file re-read on restart
    config_path: Option<PathBuf>,
    /// Whether engines may auto start at all
    auto_start: bool,
}

impl SystemHandle {
    pub fn new(system: CastleAcDc, config_path: Option<PathBuf>) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(system))),
            config_path,
            auto_start: true,
        }
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub async fn current(&self) -> Arc<CastleAcDc> {
        Arc::clone(&*self.current.read().await)
    }

    /// Start the current system if it is configured to auto start
    pub async fn auto_start(&self) -> SystemResult<bool> {
        let system = self.current().await;
        if !self.auto_start || !system.auto_start() {
            info!(system = %system.name(), "Auto start disabled");
            return Ok(false);
        }
        system.start().await?;
        Ok(true)
    }

    /// Replace the current system with one built from the configuration on disk
    ///
    /// The configuration is read before anything is stopped; when it cannot
    /// be read the current system keeps running.
    pub async fn restart(&self) -> SystemResult<Arc<CastleAcDc>> {
        let mut current = self.current.write().await;
        let document = match &self.config_path {
            Some(path) => load_config(path)?,
            None => current.document().clone(),
        };

        info!(system = %current.name(), "Restarting system");
        if let Err(e) = current.stop().await {
            warn!(error = %e, "System did not stop cleanly");
        }
        current.disconnect().await;

        let system = Arc::new(CastleAcDc::build_with_bus(document, Arc::clone(current.bus())));
        *current = Arc::clone(&system);
        drop(current);

        if self.auto_start && system.auto_start() {
            system.start().await?;
        }
        Ok(system)
    }

    /// Stop and disconnect the current system
    pub async fn shutdown(&self) -> SystemResult<()> {
        let system = self.current().await;
        let stopped = system.stop().await;
        system.disconnect().await;
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn config(name: &str) -> String {
        json!({
            "system": { "name": name },
            "devices": { "clock": { "type": "sim-seconds" } },
            "engines": {
                "poll": { "collector": { "lapDuration": -1, "sources": [{ "deviceId": "clock" }] } }
            }
        })
        .to_string()
    }

    #[test]
    fn test_restart_rereads_configuration() {
        Jail::expect_with(|jail| {
            jail.create_file("castle.json", &config("first"))?;
            let path = jail.directory().join("castle.json");

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| e.to_string())?;
            runtime.block_on(async {
                let handle = SystemHandle::new(CastleAcDc::from_file(&path).unwrap(), Some(path));
                assert!(handle.auto_start().await.unwrap());
                let first = handle.current().await;
                assert_eq!(first.name(), "first");

                std::fs::write(jail.directory().join("castle.json"), config("second")).unwrap();
                let second = assert_ok!(handle.restart().await);
                assert_eq!(second.name(), "second");
                assert_eq!(handle.current().await.name(), "second");
                assert!(!first.engine("poll").unwrap().status().should_run);
                assert!(second.engine("poll").unwrap().status().should_run);

                assert_ok!(handle.shutdown().await);
            });
            Ok(())
        });
    }

    #[tokio::test]
    async fn test_restart_keeps_message_bus() {
        let document = serde_json::from_str(&config("bus")).unwrap();
        let bus = Arc::new(crate::devices::MessageBus::default());
        bus.attach_feeder();
        let handle = SystemHandle::new(CastleAcDc::build_with_bus(document, Arc::clone(&bus)), None)
            .with_auto_start(false);

        let system = handle.restart().await.unwrap();
        assert!(Arc::ptr_eq(system.bus(), &bus));
        assert!(system.bus().has_feeder());
    }

    #[tokio::test]
    async fn test_restart_without_file_keeps_document() {
        let document = serde_json::from_str(&config("inline")).unwrap();
        let handle = SystemHandle::new(CastleAcDc::build(document), None).with_auto_start(false);
        assert!(!handle.auto_start().await.unwrap());

        let system = handle.restart().await.unwrap();
        assert_eq!(system.name(), "inline");
        assert!(!system.engine("poll").unwrap().status().should_run);
    }

    #[tokio::test]
    async fn test_restart_keeps_system_when_file_is_gone() {
        let document = serde_json::from_str(&config("kept")).unwrap();
        let handle = SystemHandle::new(
            CastleAcDc::build(document),
            Some(PathBuf::from("/nonexistent/castle.json")),
        );
        handle.auto_start().await.unwrap();

        assert!(handle.restart().await.is_err());
        let system = handle.current().await;
        assert_eq!(system.name(), "kept");
        assert!(system.engine("poll").unwrap().status().should_run);
        handle.shutdown().await.unwrap();
    }
}
