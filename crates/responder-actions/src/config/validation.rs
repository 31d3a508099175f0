use super::*;
use anyhow::{anyhow, Result};
use responder_common::ActionKind;
use std::collections::HashSet;

/// Validate the complete configuration
pub fn validate_config(config: &ActionManagerConfig) -> Result<()> {
    if config.max_running_command_actions == 0 {
        return Err(anyhow!("max_running_command_actions must be greater than 0"));
    }

    validate_resident_host(&config.resident_host)?;
    validate_actions(&config.actions)?;

    Ok(())
}

fn validate_resident_host(host: &ResidentHostConfig) -> Result<()> {
    if host.executable_path.trim().is_empty() {
        return Err(anyhow!("resident_host.executable_path cannot be empty"));
    }
    Ok(())
}

fn validate_actions(actions: &[ActionDefinition]) -> Result<()> {
    let mut ids = HashSet::new();
    for action in actions {
        if !ids.insert(action.id) {
            return Err(anyhow!("Duplicate action ID: {}", action.id));
        }
        if action.command.trim().is_empty() && action.kind != ActionKind::IncidentSender {
            return Err(anyhow!("Action {} has an empty command", action.id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_ceiling_rejected() {
        let err = ActionManagerConfig::load_from_string("max_running_command_actions: 0").unwrap_err();
        assert!(err.to_string().contains("must be greater than 0"));
    }

    #[test]
    fn test_empty_host_path_rejected() {
        let err = ActionManagerConfig::load_from_string("resident_host:\n  executable_path: \"\"")
            .unwrap_err();
        assert!(err.to_string().contains("executable_path"));
    }

    #[test]
    fn test_duplicate_action_ids_rejected() {
        let yaml = r#"
actions:
  - { id: 4, kind: command, command: "true", owner: 1 }
  - { id: 4, kind: resident, command: "builtin:null", owner: 1 }
"#;
        let err = ActionManagerConfig::load_from_string(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate action ID: 4"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let yaml = "actions:\n  - { id: 1, kind: command, command: \"  \", owner: 1 }";
        assert!(ActionManagerConfig::load_from_string(yaml).is_err());
    }
}
