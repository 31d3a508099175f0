//! Command strings and the argument vector handed to command actions.

use responder_common::{ActionDefinition, EventRecord};

/// Separates user arguments from the event arguments appended by the dispatcher.
pub const ACTION_ARGS_MARKER: &str = "--responder-action-v1";

/// Split a command string into words with POSIX shell quoting rules.
pub fn parse_command_line(line: &str) -> Result<Vec<String>, String> {
    let words = shell_words::split(line).map_err(|e| format!("cannot split '{}': {}", line, e))?;
    if words.is_empty() {
        return Err("empty command".to_string());
    }
    Ok(words)
}

/// `[command, user args.., marker, action id, server id, host id, sec.nsec,
/// event id, event type, trigger id, trigger status, severity]`.
pub fn build_command_argv(action: &ActionDefinition, event: &EventRecord) -> Result<Vec<String>, String> {
    let mut argv = parse_command_line(&action.command)?;
    argv.extend([
        ACTION_ARGS_MARKER.to_string(),
        action.id.to_string(),
        event.server_id.to_string(),
        event.host_id.clone(),
        event.time.to_string(),
        event.event_id.clone(),
        event.event_type.as_u16().to_string(),
        event.trigger_id.clone(),
        event.trigger_status.as_u16().to_string(),
        event.severity.as_u16().to_string(),
    ]);
    Ok(argv)
}

/// Split a resident command into module path and option string.
pub fn split_resident_command(command: &str) -> Result<(String, String), String> {
    let command = command.trim();
    let (path, options) = match command.find(char::is_whitespace) {
        Some(at) => (&command[..at], command[at..].trim()),
        None => (command, ""),
    };
    if path.is_empty() {
        return Err("empty module path".to_string());
    }
    Ok((path.to_string(), options.to_string()))
}

/// Split an incident-sender command `tracker[:option]`.
pub fn parse_incident_command(command: &str) -> Result<(u32, Option<String>), String> {
    let command = command.trim();
    let (tracker, option) = match command.split_once(':') {
        Some((tracker, option)) => (tracker, Some(option.to_string())),
        None => (command, None),
    };
    let tracker_id = tracker
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid incident tracker id '{}'", tracker))?;
    Ok((tracker_id, option.filter(|o| !o.is_empty())))
}
