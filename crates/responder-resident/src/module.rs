//! Resident module contract.
//!
//! A module is described by a [`ModuleDescriptor`]: the contract version it
//! was built against, an `init` entry point taking the option string and a
//! `notify_event` entry point returning a result code. The host looks modules
//! up by path in a [`ModuleRegistry`].

use crate::protocol::{ModuleLoadCode, NotifyEvent};
use std::collections::HashMap;
use tracing::{info, warn};

/// Contract version a module must report. Any mismatch is fatal.
pub const RESIDENT_MODULE_VERSION: u32 = 1;

/// What a module's notify handler receives.
pub type EventArg = NotifyEvent;

pub type InitFn = Box<dyn FnMut(&str) -> Result<(), String> + Send>;
pub type NotifyFn = Box<dyn FnMut(&EventArg) -> u32 + Send>;

pub struct ModuleDescriptor {
    pub version: u32,
    pub init: Option<InitFn>,
    pub notify_event: Option<NotifyFn>,
}

impl ModuleDescriptor {
    /// A current-version descriptor with both entry points.
    pub fn new(
        init: impl FnMut(&str) -> Result<(), String> + Send + 'static,
        notify_event: impl FnMut(&EventArg) -> u32 + Send + 'static,
    ) -> Self {
        Self {
            version: RESIDENT_MODULE_VERSION,
            init: Some(Box::new(init)),
            notify_event: Some(Box::new(notify_event)),
        }
    }
}

/// A module whose `init` succeeded.
pub struct LoadedModule {
    path: String,
    notify_event: NotifyFn,
}

impl LoadedModule {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn notify(&mut self, event: &EventArg) -> u32 {
        (self.notify_event)(event)
    }
}

type Factory = Box<dyn Fn() -> ModuleDescriptor + Send + Sync>;

#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, Factory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        path: impl Into<String>,
        factory: impl Fn() -> ModuleDescriptor + Send + Sync + 'static,
    ) {
        self.factories.insert(path.into(), Box::new(factory));
    }

    pub fn contains(&self, path: &str) -> bool {
        self.factories.contains_key(path)
    }

    /// Resolve, validate and initialize the module at `path`.
    pub fn load(&self, path: &str, options: &str) -> Result<LoadedModule, ModuleLoadCode> {
        let Some(factory) = self.factories.get(path) else {
            warn!("Module {} not found", path);
            return Err(ModuleLoadCode::DlopenFailure);
        };
        let descriptor = factory();

        let Some(mut init) = descriptor.init else {
            warn!("Module {} has no init entry point", path);
            return Err(ModuleLoadCode::MissingSymbol);
        };
        if descriptor.version != RESIDENT_MODULE_VERSION {
            warn!(
                "Module {} version {} does not match {}",
                path, descriptor.version, RESIDENT_MODULE_VERSION
            );
            return Err(ModuleLoadCode::VersionInvalid);
        }
        if let Err(reason) = init(options) {
            warn!("Module {} failed to initialize: {}", path, reason);
            return Err(ModuleLoadCode::InitFailure);
        }
        let Some(notify_event) = descriptor.notify_event else {
            warn!("Module {} has no notify handler", path);
            return Err(ModuleLoadCode::MissingNotifyHandler);
        };

        info!("Loaded module {}", path);
        Ok(LoadedModule {
            path: path.to_string(),
            notify_event,
        })
    }
}
