use std::path::{Path, PathBuf};

/// Directory holding the scenario-independent fallback fixtures.
pub const DEFAULT_STORE_DIR: &str = "defaultMocks";
pub const DEFAULT_INDEX_FILENAME: &str = "default.json";
pub const SCENARIO_INDEX_FILENAME: &str = "_mock_list.json";
pub const ASSETS_DIRNAME: &str = "_files";
pub const POINTER_FILENAME: &str = "mockServer.config.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioNameError {
    reason: String,
}

impl ScenarioNameError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ScenarioNameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for ScenarioNameError {}

pub fn validate_scenario_name(name: &str) -> Result<(), ScenarioNameError> {
    if name.trim().is_empty() {
        return Err(ScenarioNameError::new("scenario name cannot be empty"));
    }
    if name != name.trim() {
        return Err(ScenarioNameError::new(
            "scenario name cannot have leading or trailing whitespace",
        ));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(ScenarioNameError::new(
            "scenario name cannot contain path separators",
        ));
    }
    if name == "." || name == ".." {
        return Err(ScenarioNameError::new("scenario name cannot be `.` or `..`"));
    }
    if name == DEFAULT_STORE_DIR || name == ASSETS_DIRNAME {
        return Err(ScenarioNameError::new(format!(
            "scenario name `{name}` is reserved"
        )));
    }

    Ok(())
}

pub fn resolve_scenario_dir(
    base_path: &Path,
    scenario_name: &str,
) -> Result<PathBuf, ScenarioNameError> {
    validate_scenario_name(scenario_name)?;
    Ok(base_path.join(scenario_name))
}

pub fn resolve_default_dir(base_path: &Path) -> PathBuf {
    base_path.join(DEFAULT_STORE_DIR)
}

pub fn resolve_pointer_path(base_path: &Path) -> PathBuf {
    base_path.join(POINTER_FILENAME)
}
