use std::{
    fs,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    config::Config,
    fixture::{Fixture, IndexEntry},
    normalize, scenario,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    InvalidName(String),
    AlreadyExists(String),
    NotFound(String),
    Io(String),
    Corrupt(String),
    Internal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(reason) => write!(f, "{reason}"),
            Self::AlreadyExists(name) => write!(f, "scenario `{name}` already exists"),
            Self::NotFound(what) => write!(f, "{what} was not found"),
            Self::Io(message) | Self::Corrupt(message) | Self::Internal(message) => {
                write!(f, "{message}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<scenario::ScenarioNameError> for StoreError {
    fn from(value: scenario::ScenarioNameError) -> Self {
        Self::InvalidName(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Scenario,
    Default,
}

/// File-backed fixture store: an ordered index file plus one content file per fixture.
///
/// Nothing is cached; every call reads the current files so edits made by hand while the
/// server runs are picked up by the next request.
#[derive(Debug, Clone)]
pub struct FixtureStore {
    dir: PathBuf,
    kind: StoreKind,
    label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(String),
    Duplicate(String),
}

/// Process-wide scenario pointer persisted as `mockServer.config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioPointer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// A file staged next to its destination, renamed into place on commit.
struct StagedFile {
    temp_path: PathBuf,
    final_path: PathBuf,
}

/// Files moved into place by a batch commit, with backups of whatever they replaced.
#[derive(Default)]
struct PlacedFiles {
    created: Vec<PathBuf>,
    backups: Vec<(PathBuf, PathBuf)>,
}

impl PlacedFiles {
    fn place(&mut self, file: &StagedFile) -> Result<(), StoreError> {
        if file.final_path.exists() {
            let backup_path = sibling_path(&file.final_path, "bak");
            fs::rename(&file.final_path, &backup_path).map_err(|err| {
                StoreError::Io(format!("back up {}: {err}", file.final_path.display()))
            })?;
            self.backups.push((backup_path, file.final_path.clone()));
        } else {
            self.created.push(file.final_path.clone());
        }
        fs::rename(&file.temp_path, &file.final_path).map_err(|err| {
            StoreError::Io(format!(
                "move staged file into {}: {err}",
                file.final_path.display()
            ))
        })
    }

    /// Restores every replaced file and removes every newly created one.
    fn roll_back(self) {
        for path in &self.created {
            if let Err(err) = fs::remove_file(path)
                && err.kind() != ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), "remove partially committed file: {err}");
            }
        }
        for (backup_path, final_path) in self.backups.iter().rev() {
            if let Err(err) = fs::rename(backup_path, final_path) {
                tracing::warn!(
                    path = %final_path.display(),
                    backup = %backup_path.display(),
                    "restore replaced file: {err}"
                );
            }
        }
    }

    fn commit(self) {
        for (backup_path, _) in &self.backups {
            if let Err(err) = fs::remove_file(backup_path) {
                tracing::warn!(path = %backup_path.display(), "remove backup file: {err}");
            }
        }
    }
}

pub fn new_fixture_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl FixtureStore {
    pub fn scenario(base_path: &Path, name: &str) -> Result<Self, StoreError> {
        Ok(Self {
            dir: scenario::resolve_scenario_dir(base_path, name)?,
            kind: StoreKind::Scenario,
            label: name.to_owned(),
        })
    }

    pub fn default_store(base_path: &Path) -> Self {
        Self {
            dir: scenario::resolve_default_dir(base_path),
            kind: StoreKind::Default,
            label: scenario::DEFAULT_STORE_DIR.to_owned(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn index_path(&self) -> PathBuf {
        match self.kind {
            StoreKind::Scenario => self.dir.join(scenario::SCENARIO_INDEX_FILENAME),
            StoreKind::Default => self.dir.join(scenario::DEFAULT_INDEX_FILENAME),
        }
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.dir.join(scenario::ASSETS_DIRNAME)
    }

    pub fn asset_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_file_component(name, "asset")?;
        Ok(self.assets_dir().join(name))
    }

    pub async fn list(&self) -> Result<Vec<IndexEntry>, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_blocking())
            .await
            .map_err(|err| join_error("list fixtures", err))?
    }

    pub async fn get(&self, id: &str) -> Result<Fixture, StoreError> {
        let store = self.clone();
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || store.get_blocking(&id))
            .await
            .map_err(|err| join_error("get fixture", err))?
    }

    pub async fn load_all(&self) -> Result<Vec<Fixture>, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.load_all_blocking())
            .await
            .map_err(|err| join_error("load fixtures", err))?
    }

    pub async fn create(&self, fixture: Fixture) -> Result<CreateOutcome, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.create_blocking(fixture))
            .await
            .map_err(|err| join_error("create fixture", err))?
    }

    pub async fn update(&self, id: &str, fixture: Fixture) -> Result<(), StoreError> {
        let store = self.clone();
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || store.update_blocking(&id, fixture))
            .await
            .map_err(|err| join_error("update fixture", err))?
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let store = self.clone();
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || store.delete_blocking(&id))
            .await
            .map_err(|err| join_error("delete fixture", err))?
    }

    pub async fn mark_served(&self, id: &str, served: bool) -> Result<(), StoreError> {
        let store = self.clone();
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || store.mark_served_blocking(&id, served))
            .await
            .map_err(|err| join_error("mark fixture served", err))?
    }

    pub async fn reset_served(&self) -> Result<usize, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.reset_served_blocking())
            .await
            .map_err(|err| join_error("reset served flags", err))?
    }

    pub async fn read_asset(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.asset_path(name)?;
        tokio::fs::read(&path).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound => {
                StoreError::NotFound(format!("asset `{name}` in `{}`", self.label))
            }
            _ => StoreError::Io(format!("read asset {}: {err}", path.display())),
        })
    }

    pub async fn write_asset(&self, name: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.asset_path(name)?;
        tokio::task::spawn_blocking(move || write_bytes_atomic(&path, &bytes))
            .await
            .map_err(|err| join_error("write asset", err))?
    }

    pub(crate) fn list_blocking(&self) -> Result<Vec<IndexEntry>, StoreError> {
        let index_path = self.index_path();
        Ok(read_json_file::<Vec<IndexEntry>>(&index_path)?.unwrap_or_default())
    }

    pub(crate) fn load_all_blocking(&self) -> Result<Vec<Fixture>, StoreError> {
        self.list_blocking()?
            .iter()
            .map(|entry| self.read_fixture(entry))
            .collect()
    }

    fn get_blocking(&self, id: &str) -> Result<Fixture, StoreError> {
        let index = self.list_blocking()?;
        let entry = index
            .iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| self.fixture_not_found(id))?;
        self.read_fixture(entry)
    }

    fn create_blocking(&self, mut fixture: Fixture) -> Result<CreateOutcome, StoreError> {
        let existing = self.load_all_blocking()?;
        if let Some(duplicate) = existing
            .iter()
            .find(|candidate| normalize::requests_equal(*candidate, &fixture, &candidate.ignore_params))
        {
            tracing::debug!(
                store = %self.label,
                fixture_id = %duplicate.id,
                "fixture already exists; skipping create"
            );
            return Ok(CreateOutcome::Duplicate(duplicate.id.clone()));
        }

        fixture.id = new_fixture_id();
        fixture.served = false;
        let mut index: Vec<IndexEntry> = existing.iter().map(Fixture::summary).collect();
        index.push(fixture.summary());

        self.write_fixture(&fixture)?;
        self.write_index(&index)?;
        Ok(CreateOutcome::Created(fixture.id))
    }

    fn update_blocking(&self, id: &str, mut fixture: Fixture) -> Result<(), StoreError> {
        let mut index = self.list_blocking()?;
        let position = index
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| self.fixture_not_found(id))?;

        fixture.id = id.to_owned();
        let summary = fixture.summary();
        self.write_fixture(&fixture)?;
        if index[position] != summary {
            index[position] = summary;
            self.write_index(&index)?;
        }
        Ok(())
    }

    fn delete_blocking(&self, id: &str) -> Result<(), StoreError> {
        let mut index = self.list_blocking()?;
        let position = index
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| self.fixture_not_found(id))?;
        let removed = index.remove(position);

        // Index first, so a crash never leaves an entry pointing at a deleted file.
        self.write_index(&index)?;
        let content_path = self.content_path(&removed.file_name)?;
        match fs::remove_file(&content_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(format!(
                "remove fixture file {}: {err}",
                content_path.display()
            ))),
        }
    }

    fn mark_served_blocking(&self, id: &str, served: bool) -> Result<(), StoreError> {
        let mut fixture = self.get_blocking(id)?;
        if fixture.served == served {
            return Ok(());
        }
        fixture.served = served;
        self.write_fixture(&fixture)
    }

    fn reset_served_blocking(&self) -> Result<usize, StoreError> {
        let mut reset = 0;
        for mut fixture in self.load_all_blocking()? {
            if fixture.served {
                fixture.served = false;
                self.write_fixture(&fixture)?;
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// Writes a reconciled batch: every content file and asset is staged before any of them is
    /// renamed into place, and the index is written last.
    pub(crate) fn commit_batch_blocking(
        &self,
        fixtures: &[Fixture],
        assets: &[(String, Vec<u8>)],
        index: &[IndexEntry],
    ) -> Result<(), StoreError> {
        let mut staged = Vec::with_capacity(fixtures.len() + assets.len());
        let staging_result = (|| -> Result<(), StoreError> {
            for (name, bytes) in assets {
                let final_path = self.asset_path(name)?;
                staged.push(stage_bytes(&final_path, bytes)?);
            }
            for fixture in fixtures {
                let final_path = self.content_path(&fixture.file_name())?;
                staged.push(stage_bytes(&final_path, &to_pretty_json(fixture)?)?);
            }
            Ok(())
        })();
        if let Err(err) = staging_result {
            discard_staged(&staged);
            return Err(err);
        }

        let mut placed = PlacedFiles::default();
        for (idx, file) in staged.iter().enumerate() {
            if let Err(err) = placed.place(file) {
                discard_staged(&staged[idx..]);
                placed.roll_back();
                return Err(err);
            }
        }

        if let Err(err) = self.write_index(index) {
            placed.roll_back();
            return Err(err);
        }
        placed.commit();
        Ok(())
    }

    fn read_fixture(&self, entry: &IndexEntry) -> Result<Fixture, StoreError> {
        let path = self.content_path(&entry.file_name)?;
        let fixture: Fixture = read_json_file(&path)?.ok_or_else(|| {
            StoreError::NotFound(format!(
                "fixture file `{}` referenced by `{}`",
                entry.file_name, self.label
            ))
        })?;
        if fixture.id != entry.id {
            return Err(StoreError::Corrupt(format!(
                "fixture file {} has id `{}` but the index lists `{}`",
                path.display(),
                fixture.id,
                entry.id
            )));
        }
        Ok(fixture)
    }

    fn write_fixture(&self, fixture: &Fixture) -> Result<(), StoreError> {
        let path = self.content_path(&fixture.file_name())?;
        write_bytes_atomic(&path, &to_pretty_json(fixture)?)
    }

    fn write_index(&self, index: &[IndexEntry]) -> Result<(), StoreError> {
        write_bytes_atomic(&self.index_path(), &to_pretty_json(&index)?)
    }

    fn content_path(&self, file_name: &str) -> Result<PathBuf, StoreError> {
        validate_file_component(file_name, "fixture")?;
        Ok(self.dir.join(file_name))
    }

    fn fixture_not_found(&self, id: &str) -> StoreError {
        StoreError::NotFound(format!("fixture `{id}` in `{}`", self.label))
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioManager {
    base_path: PathBuf,
}

impl ScenarioManager {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let base_path = &config.storage.path;
        fs::create_dir_all(base_path)
            .with_context(|| format!("create fixture root {}", base_path.display()))?;
        Ok(Self::new(base_path.clone()))
    }

    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn scenario_store(&self, name: &str) -> Result<FixtureStore, StoreError> {
        FixtureStore::scenario(&self.base_path, name)
    }

    pub fn default_store(&self) -> FixtureStore {
        FixtureStore::default_store(&self.base_path)
    }

    /// Store for an existing scenario.
    pub async fn open_scenario(&self, name: &str) -> Result<FixtureStore, StoreError> {
        let store = self.scenario_store(name)?;
        let exists = tokio::fs::metadata(store.dir())
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false);
        if !exists {
            return Err(StoreError::NotFound(format!("scenario `{name}`")));
        }
        Ok(store)
    }

    pub async fn list_scenarios(&self) -> Result<Vec<String>, StoreError> {
        let base_path = self.base_path.clone();
        tokio::task::spawn_blocking(move || list_scenarios_blocking(&base_path))
            .await
            .map_err(|err| join_error("list scenarios", err))?
    }

    pub async fn create_scenario(&self, name: &str) -> Result<FixtureStore, StoreError> {
        let store = self.scenario_store(name)?;
        let name = name.to_owned();
        tokio::task::spawn_blocking(move || {
            match fs::create_dir(store.dir()) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    return Err(StoreError::AlreadyExists(name));
                }
                Err(err) => {
                    return Err(StoreError::Io(format!(
                        "create scenario dir {}: {err}",
                        store.dir().display()
                    )));
                }
            }
            store.write_index(&[])?;
            Ok(store)
        })
        .await
        .map_err(|err| join_error("create scenario", err))?
    }

    pub async fn delete_scenario(&self, name: &str) -> Result<(), StoreError> {
        let store = self.open_scenario(name).await?;
        tokio::fs::remove_dir_all(store.dir())
            .await
            .map_err(|err| {
                StoreError::Io(format!(
                    "remove scenario dir {}: {err}",
                    store.dir().display()
                ))
            })
    }

    pub async fn reset_served(&self, name: &str) -> Result<usize, StoreError> {
        self.open_scenario(name).await?.reset_served().await
    }

    pub async fn read_pointer(&self) -> Result<Option<ScenarioPointer>, StoreError> {
        let path = scenario::resolve_pointer_path(&self.base_path);
        tokio::task::spawn_blocking(move || read_json_file::<ScenarioPointer>(&path))
            .await
            .map_err(|err| join_error("read scenario pointer", err))?
    }

    pub async fn write_pointer(&self, pointer: ScenarioPointer) -> Result<(), StoreError> {
        let path = scenario::resolve_pointer_path(&self.base_path);
        tokio::task::spawn_blocking(move || write_bytes_atomic(&path, &to_pretty_json(&pointer)?))
            .await
            .map_err(|err| join_error("write scenario pointer", err))?
    }
}

fn list_scenarios_blocking(base_path: &Path) -> Result<Vec<String>, StoreError> {
    if !base_path.exists() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(base_path).map_err(|err| {
        StoreError::Io(format!("read fixture root {}: {err}", base_path.display()))
    })?;

    let mut scenarios = Vec::new();
    for entry_result in entries {
        let entry = entry_result.map_err(|err| {
            StoreError::Io(format!(
                "iterate fixture root {}: {err}",
                base_path.display()
            ))
        })?;
        let is_dir = entry
            .file_type()
            .map_err(|err| {
                StoreError::Io(format!(
                    "read file type for {}: {err}",
                    entry.path().display()
                ))
            })?
            .is_dir();
        if !is_dir {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if name.starts_with('.') || scenario::validate_scenario_name(&name).is_err() {
            continue;
        }
        scenarios.push(name);
    }

    scenarios.sort();
    Ok(scenarios)
}

fn validate_file_component(name: &str, label: &str) -> Result<(), StoreError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StoreError::InvalidName(format!(
            "{label} file name `{name}` must be a plain file name"
        ))),
    }
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(StoreError::Io(format!("read {}: {err}", path.display())));
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| StoreError::Corrupt(format!("parse {}: {err}", path.display())))
}

fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(value)
        .map_err(|err| StoreError::Internal(format!("serialize JSON: {err}")))
}

fn stage_bytes(final_path: &Path, bytes: &[u8]) -> Result<StagedFile, StoreError> {
    let parent = final_path.parent().ok_or_else(|| {
        StoreError::Internal(format!("{} has no parent dir", final_path.display()))
    })?;
    fs::create_dir_all(parent)
        .map_err(|err| StoreError::Io(format!("create dir {}: {err}", parent.display())))?;

    let temp_path = sibling_path(final_path, "tmp");
    fs::write(&temp_path, bytes)
        .map_err(|err| StoreError::Io(format!("write {}: {err}", temp_path.display())))?;

    Ok(StagedFile {
        temp_path,
        final_path: final_path.to_path_buf(),
    })
}

/// Hidden, uniquely named sibling of `path` with the given suffix.
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{file_name}.{}.{suffix}",
        uuid::Uuid::new_v4().simple()
    ))
}

fn discard_staged(staged: &[StagedFile]) {
    for file in staged {
        if let Err(err) = fs::remove_file(&file.temp_path)
            && err.kind() != ErrorKind::NotFound
        {
            tracing::warn!(path = %file.temp_path.display(), "remove staged file: {err}");
        }
    }
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let staged = stage_bytes(path, bytes)?;
    fs::rename(&staged.temp_path, &staged.final_path).map_err(|err| {
        discard_staged(std::slice::from_ref(&staged));
        StoreError::Io(format!("replace {}: {err}", path.display()))
    })
}

fn join_error(operation: &str, err: tokio::task::JoinError) -> StoreError {
    StoreError::Internal(format!("join {operation} task failed: {err}"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{CreateOutcome, FixtureStore, ScenarioManager, ScenarioPointer, StoreError};
    use crate::fixture::{Fixture, PostData, RequestDescriptor, ResponseDescriptor};

    fn fixture(method: &str, url: &str, body: Option<&str>, content: &str) -> Fixture {
        Fixture {
            id: String::new(),
            url: url.to_owned(),
            method: method.to_owned(),
            request: RequestDescriptor {
                url: format!("http://localhost{url}"),
                method: method.to_owned(),
                post_data: body.map(|text| PostData {
                    mime_type: "application/json".to_owned(),
                    text: text.to_owned(),
                }),
                ..RequestDescriptor::default()
            },
            response: ResponseDescriptor {
                status: 200,
                content: Some(content.to_owned()),
                ..ResponseDescriptor::default()
            },
            ignore_params: Default::default(),
            wait_for_previous: false,
            served: false,
        }
    }

    fn created_id(outcome: CreateOutcome) -> String {
        match outcome {
            CreateOutcome::Created(id) => id,
            other => panic!("expected created fixture, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_list_get_round_trip_in_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = ScenarioManager::new(temp_dir.path().to_path_buf());
        let store = manager.create_scenario("students").await.unwrap();

        let first = created_id(
            store
                .create(fixture("GET", "/api/students", None, "[]"))
                .await
                .unwrap(),
        );
        let second = created_id(
            store
                .create(fixture("POST", "/api/students", Some(r#"{"name":"a"}"#), "{}"))
                .await
                .unwrap(),
        );

        let index = store.list().await.unwrap();
        assert_eq!(
            index.iter().map(|entry| entry.id.as_str()).collect::<Vec<_>>(),
            vec![first.as_str(), second.as_str()]
        );
        assert_eq!(index[0].file_name, format!("mock_{first}.json"));
        assert!(temp_dir
            .path()
            .join("students")
            .join("_mock_list.json")
            .is_file());

        let fetched = store.get(&second).await.unwrap();
        assert_eq!(fetched.id, second);
        assert_eq!(fetched.method, "POST");
    }

    #[tokio::test]
    async fn create_reports_duplicates_without_writing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FixtureStore::default_store(temp_dir.path());

        let id = created_id(
            store
                .create(fixture("GET", "/api/a?x=1&y=2", None, "1"))
                .await
                .unwrap(),
        );
        let outcome = store
            .create(fixture("GET", "/api/a?y=2&x=1", None, "2"))
            .await
            .unwrap();

        assert_eq!(outcome, CreateOutcome::Duplicate(id));
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(temp_dir
            .path()
            .join("defaultMocks")
            .join("default.json")
            .is_file());
    }

    #[tokio::test]
    async fn update_keeps_id_and_position() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FixtureStore::scenario(temp_dir.path(), "s").unwrap();
        let a = created_id(store.create(fixture("GET", "/a", None, "1")).await.unwrap());
        let b = created_id(store.create(fixture("GET", "/b", None, "2")).await.unwrap());

        let mut edited = fixture("GET", "/a?v=2", None, "changed");
        edited.id = "attempted-new-id".to_owned();
        store.update(&a, edited).await.unwrap();

        let index = store.list().await.unwrap();
        assert_eq!(index[0].id, a);
        assert_eq!(index[0].url, "/a?v=2");
        assert_eq!(index[1].id, b);
        let fetched = store.get(&a).await.unwrap();
        assert_eq!(fetched.id, a);
        assert_eq!(fetched.response.content.as_deref(), Some("changed"));
    }

    #[tokio::test]
    async fn delete_removes_index_entry_and_content() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FixtureStore::scenario(temp_dir.path(), "s").unwrap();
        let id = created_id(store.create(fixture("GET", "/a", None, "1")).await.unwrap());

        store.delete(&id).await.unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert!(!store.dir().join(format!("mock_{id}.json")).exists());
        let err = store.delete(&id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)), "error: {err}");
    }

    #[tokio::test]
    async fn mark_served_and_reset_touch_only_the_flag() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = ScenarioManager::new(temp_dir.path().to_path_buf());
        let store = manager.create_scenario("flow").await.unwrap();
        let id = created_id(store.create(fixture("GET", "/a", None, "1")).await.unwrap());
        let index_before = fs::read(store.index_path()).unwrap();

        store.mark_served(&id, true).await.unwrap();
        assert!(store.get(&id).await.unwrap().served);
        assert_eq!(fs::read(store.index_path()).unwrap(), index_before);

        assert_eq!(manager.reset_served("flow").await.unwrap(), 1);
        assert!(!store.get(&id).await.unwrap().served);
    }

    #[tokio::test]
    async fn missing_content_file_is_reported() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FixtureStore::scenario(temp_dir.path(), "s").unwrap();
        let id = created_id(store.create(fixture("GET", "/a", None, "1")).await.unwrap());
        fs::remove_file(store.dir().join(format!("mock_{id}.json"))).unwrap();

        let err = store.load_all().await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)), "error: {err}");
    }

    #[tokio::test]
    async fn failed_batch_staging_leaves_index_untouched() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FixtureStore::scenario(temp_dir.path(), "s").unwrap();
        created_id(store.create(fixture("GET", "/a", None, "1")).await.unwrap());
        let index_before = store.list().await.unwrap();

        let mut new_fixture = fixture("GET", "/b", None, "2");
        new_fixture.id = "new".to_owned();
        let mut index = index_before.clone();
        index.push(new_fixture.summary());
        let err = store
            .commit_batch_blocking(
                &[new_fixture],
                &[("../escape.bin".to_owned(), vec![1, 2, 3])],
                &index,
            )
            .unwrap_err();

        assert!(matches!(err, StoreError::InvalidName(_)), "error: {err}");
        assert_eq!(store.list().await.unwrap(), index_before);
        assert!(!store.dir().join("mock_new.json").exists());
        let leftovers = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn failed_index_write_restores_replaced_fixtures() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FixtureStore::scenario(temp_dir.path(), "s").unwrap();
        let id = created_id(store.create(fixture("GET", "/a", None, "1")).await.unwrap());
        let content_path = store.dir().join(format!("mock_{id}.json"));
        let content_before = fs::read(&content_path).unwrap();
        let index_before = store.list().await.unwrap();

        let mut refreshed = store.get(&id).await.unwrap();
        refreshed.response.content = Some("2".to_owned());
        let mut added = fixture("GET", "/b", None, "3");
        added.id = "added".to_owned();
        let mut index = index_before.clone();
        index.push(added.summary());

        fs::remove_file(store.index_path()).unwrap();
        fs::create_dir(store.index_path()).unwrap();
        fs::write(store.index_path().join("blocker"), "x").unwrap();

        store
            .commit_batch_blocking(
                &[refreshed, added],
                &[("asset.bin".to_owned(), vec![1, 2, 3])],
                &index,
            )
            .unwrap_err();

        assert_eq!(fs::read(&content_path).unwrap(), content_before);
        assert!(!store.dir().join("mock_added.json").exists());
        assert!(!store.assets_dir().join("asset.bin").exists());
        let leftovers = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn scenario_lifecycle_and_pointer() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = ScenarioManager::new(temp_dir.path().to_path_buf());
        manager.default_store().create(fixture("GET", "/d", None, "1")).await.unwrap();

        assert!(manager.list_scenarios().await.unwrap().is_empty());
        manager.create_scenario("b-flow").await.unwrap();
        manager.create_scenario("a-flow").await.unwrap();
        assert_eq!(
            manager.create_scenario("a-flow").await.unwrap_err(),
            StoreError::AlreadyExists("a-flow".to_owned())
        );
        assert_eq!(
            manager.list_scenarios().await.unwrap(),
            vec!["a-flow".to_owned(), "b-flow".to_owned()]
        );

        manager.delete_scenario("a-flow").await.unwrap();
        assert_eq!(manager.list_scenarios().await.unwrap(), vec!["b-flow".to_owned()]);
        assert!(matches!(
            manager.delete_scenario("a-flow").await.unwrap_err(),
            StoreError::NotFound(_)
        ));

        assert_eq!(manager.read_pointer().await.unwrap(), None);
        let pointer = ScenarioPointer {
            test_name: Some("b-flow".to_owned()),
            port: Some(4010),
        };
        manager.write_pointer(pointer.clone()).await.unwrap();
        assert_eq!(manager.read_pointer().await.unwrap(), Some(pointer));
        let raw = fs::read_to_string(temp_dir.path().join("mockServer.config.json")).unwrap();
        assert!(raw.contains("\"testName\""), "pointer file: {raw}");
    }
}
