//! Modules compiled into the resident host.

use crate::module::{EventArg, ModuleDescriptor, ModuleRegistry};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use tracing::warn;

/// Accepts every event and acks it with 0.
pub const NULL_MODULE: &str = "builtin:null";

/// Appends one JSON line per event to the file named by the options.
pub const EVENT_LOG_MODULE: &str = "builtin:event-log";

/// Ack code when an event could not be written.
pub const EVENT_LOG_WRITE_FAILED: u32 = 1;

pub fn register_builtins(registry: &mut ModuleRegistry) {
    registry.register(NULL_MODULE, || ModuleDescriptor::new(|_| Ok(()), |_| 0));
    registry.register(EVENT_LOG_MODULE, event_log_module);
}

pub fn builtin_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    register_builtins(&mut registry);
    registry
}

fn event_log_module() -> ModuleDescriptor {
    let file: Arc<Mutex<Option<File>>> = Arc::new(Mutex::new(None));
    let init_file = Arc::clone(&file);
    ModuleDescriptor::new(
        move |options| {
            let path = options.trim();
            if path.is_empty() {
                return Err("an output file path is required".to_string());
            }
            let opened = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("cannot open {}: {}", path, e))?;
            *init_file.lock() = Some(opened);
            Ok(())
        },
        move |event| {
            let mut guard = file.lock();
            let Some(out) = guard.as_mut() else {
                return EVENT_LOG_WRITE_FAILED;
            };
            match writeln!(out, "{}", event_json(event)) {
                Ok(()) => 0,
                Err(e) => {
                    warn!("Failed to write event {}: {}", event.event_id, e);
                    EVENT_LOG_WRITE_FAILED
                }
            }
        },
    )
}

fn event_json(event: &EventArg) -> serde_json::Value {
    serde_json::json!({
        "action_id": event.action_id.get(),
        "server_id": event.server_id.get(),
        "host_id": event.host_id,
        "time": event.time.to_string(),
        "event_id": event.event_id,
        "event_type": event.event_type,
        "trigger_id": event.trigger_id,
        "trigger_status": event.trigger_status,
        "severity": event.severity,
        "session_id": event.session_id.as_str(),
    })
}
