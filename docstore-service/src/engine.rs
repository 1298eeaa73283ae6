//! The per-database document engine.
//!
//! One engine instance exists per database file and is shared across
//! sessions behind an `Arc`. All public operations serialize on one mutex
//! and mutate copy-on-write: snapshot the image, apply the change, write the
//! result back only on success, so a failed operation leaves nothing behind.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::errors::{DbError, DbResult};
use crate::idgen::IdGenerator;
use crate::query::Predicate;

pub const SCHEMA_VERSION: u64 = 2;

/// In-memory form of one database file: the schema registry plus the record
/// map of every section. The on-disk form is the flat mapping
/// `{version, keys, <section>...}`; conversion happens only at the disk
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    version: u64,
    keys: BTreeMap<String, Vec<String>>,
    sections: BTreeMap<String, Map<String, Value>>,
}

impl Default for Image {
    fn default() -> Self {
        Image {
            version: SCHEMA_VERSION,
            keys: BTreeMap::new(),
            sections: BTreeMap::new(),
        }
    }
}

impl Image {
    fn to_value(&self) -> Value {
        let mut out = Map::new();
        out.insert("version".into(), Value::from(self.version));
        let keys = self
            .keys
            .iter()
            .map(|(section, fields)| {
                let fields = fields.iter().cloned().map(Value::String).collect();
                (section.clone(), Value::Array(fields))
            })
            .collect::<Map<_, _>>();
        out.insert("keys".into(), Value::Object(keys));
        for (section, records) in &self.sections {
            out.insert(section.clone(), Value::Object(records.clone()));
        }
        Value::Object(out)
    }

    fn from_value(value: Value) -> DbResult<Self> {
        let Value::Object(mut top) = value else {
            return Err(DbError::SchemaType(
                "database document must be a JSON object".into(),
            ));
        };
        let version = top
            .remove("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| DbError::SchemaType("database document has no version".into()))?;
        if version != SCHEMA_VERSION {
            return Err(DbError::SchemaType(format!(
                "unsupported database version {version} (expected {SCHEMA_VERSION})"
            )));
        }

        let Some(Value::Object(raw_keys)) = top.remove("keys") else {
            return Err(DbError::SchemaType(
                "the keys entry must be an object of field lists".into(),
            ));
        };
        let mut keys = BTreeMap::new();
        for (section, fields) in raw_keys {
            let Value::Array(fields) = fields else {
                return Err(DbError::SchemaType(format!(
                    "keys of section {section} must be a list"
                )));
            };
            let mut list = Vec::with_capacity(fields.len());
            for field in fields {
                let Value::String(field) = field else {
                    return Err(DbError::SchemaType(format!(
                        "keys of section {section} must be strings"
                    )));
                };
                list.push(field);
            }
            if !is_sorted_unique(&list) {
                return Err(DbError::SchemaType(format!(
                    "keys of section {section} must be sorted and duplicate-free"
                )));
            }
            keys.insert(section, list);
        }

        let mut sections = BTreeMap::new();
        for (section, records) in top {
            let Value::Object(records) = records else {
                return Err(DbError::SchemaType(format!(
                    "section {section} must be an object of records"
                )));
            };
            if !keys.contains_key(&section) {
                return Err(DbError::SchemaType(format!(
                    "section {section} has no keys entry"
                )));
            }
            sections.insert(section, records);
        }
        for section in keys.keys() {
            if !sections.contains_key(section) {
                return Err(DbError::SchemaType(format!(
                    "section {section} is registered in keys but has no record map"
                )));
            }
        }
        Ok(Image {
            version,
            keys,
            sections,
        })
    }
}

#[derive(Default)]
struct EngineState {
    image: Image,
    // whether `image` reflects the file; guards the shutdown flush from
    // overwriting a database this engine never touched
    loaded: bool,
    id_generator: IdGenerator,
}

pub struct Engine {
    path: PathBuf,
    auto_update: bool,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(path: impl Into<PathBuf>, auto_update: bool) -> Self {
        Engine {
            path: path.into(),
            auto_update,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Open the engine; in auto-update mode a missing file is created empty.
    pub async fn open(path: impl Into<PathBuf>, auto_update: bool) -> DbResult<Self> {
        let engine = Self::new(path, auto_update);
        if engine.auto_update && !tokio::fs::try_exists(&engine.path).await? {
            Self::init_file(&engine.path).await?;
        }
        Ok(engine)
    }

    /// Write a fresh, empty database file at `path`.
    pub async fn init_file(path: &Path) -> DbResult<()> {
        write_image(path, &Image::default()).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pull the on-disk image into memory. Only meaningful when auto-update
    /// is off; a no-op otherwise.
    pub async fn force_load(&self) -> DbResult<()> {
        if self.auto_update {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state.image = read_image(&self.path).await?;
        state.loaded = true;
        Ok(())
    }

    /// Flush the in-memory image to disk. Only meaningful when auto-update
    /// is off; engines that never loaded or mutated anything write nothing.
    pub async fn commit(&self) -> DbResult<()> {
        if self.auto_update {
            return Ok(());
        }
        let state = self.state.lock().await;
        if !state.loaded {
            return Ok(());
        }
        write_image(&self.path, &state.image).await
    }

    /// Install the ID generation strategy used by subsequent inserts.
    pub async fn set_id_generator(&self, name: &str) -> DbResult<()> {
        let generator = IdGenerator::from_name(name).ok_or_else(|| {
            DbError::MalformedIdGenerator(format!("generator {name:?} is malformed"))
        })?;
        let mut state = self.state.lock().await;
        state.id_generator = generator;
        Ok(())
    }

    pub async fn has_section(&self, section: &str) -> DbResult<bool> {
        let state = self.state.lock().await;
        let image = self.snapshot(&state).await?;
        Ok(image.sections.contains_key(section))
    }

    pub async fn add(
        &self,
        section: &str,
        record: Map<String, Value>,
        ignore: bool,
    ) -> DbResult<String> {
        let mut state = self.state.lock().await;
        let mut image = self.snapshot(&state).await?;
        {
            let keys = image
                .keys
                .get_mut(section)
                .ok_or_else(|| DbError::section_not_found(section))?;
            if keys.is_empty() {
                *keys = sorted_fields(&record);
            } else if !ignore {
                validate_record_fields(keys, &record)?;
            }
        }
        let id = state.id_generator.next_id();
        let records = image
            .sections
            .get_mut(section)
            .ok_or_else(|| DbError::section_not_found(section))?;
        debug_assert!(!records.contains_key(&id));
        records.insert(id.clone(), Value::Object(record));
        self.store(&mut state, image).await?;
        Ok(id)
    }

    /// Insert a batch; validation runs over the whole batch before anything
    /// is inserted, so the batch lands all-or-none. Returns the allocated
    /// IDs when `json_response`, a bare success marker otherwise; an empty
    /// batch returns nothing.
    pub async fn add_many(
        &self,
        section: &str,
        records: Vec<Map<String, Value>>,
        json_response: bool,
        ignore: bool,
    ) -> DbResult<Value> {
        if records.is_empty() {
            return Ok(Value::Null);
        }
        let mut state = self.state.lock().await;
        let mut image = self.snapshot(&state).await?;
        {
            let keys = image
                .keys
                .get_mut(section)
                .ok_or_else(|| DbError::section_not_found(section))?;
            if keys.is_empty() {
                *keys = sorted_fields(&records[0]);
            }
            if !ignore {
                for record in &records {
                    validate_record_fields(keys, record)?;
                }
            }
        }
        let section_map = image
            .sections
            .get_mut(section)
            .ok_or_else(|| DbError::section_not_found(section))?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id = state.id_generator.next_id();
            section_map.insert(id.clone(), Value::Object(record));
            ids.push(id);
        }
        self.store(&mut state, image).await?;
        if json_response {
            Ok(Value::Array(ids.into_iter().map(Value::String).collect()))
        } else {
            Ok(Value::Bool(true))
        }
    }

    /// All sections with their record maps; the `version`/`keys` metadata is
    /// not part of the result.
    pub async fn get_all(&self) -> DbResult<Map<String, Value>> {
        let state = self.state.lock().await;
        let image = self.snapshot(&state).await?;
        Ok(image
            .sections
            .into_iter()
            .map(|(section, records)| (section, Value::Object(records)))
            .collect())
    }

    pub async fn get_all_by_section(&self, section: &str) -> DbResult<Map<String, Value>> {
        let state = self.state.lock().await;
        let image = self.snapshot(&state).await?;
        image
            .sections
            .get(section)
            .cloned()
            .ok_or_else(|| DbError::section_not_found(section))
    }

    pub async fn get_by_id(&self, section: &str, id: &str) -> DbResult<Value> {
        let state = self.state.lock().await;
        let image = self.snapshot(&state).await?;
        let records = image
            .sections
            .get(section)
            .ok_or_else(|| DbError::section_not_found(section))?;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::IdDoesNotExist(format!("{id:?} does not exist in the database")))
    }

    pub async fn get_by_query(&self, section: &str, query: &str) -> DbResult<Map<String, Value>> {
        let predicate = Predicate::parse(query)?;
        let state = self.state.lock().await;
        let image = self.snapshot(&state).await?;
        let records = image
            .sections
            .get(section)
            .ok_or_else(|| DbError::section_not_found(section))?;
        Ok(records
            .iter()
            .filter(|(_, record)| matches_record(&predicate, record))
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect())
    }

    /// Shallow-merge `patch` into the record; keys absent from the patch are
    /// preserved. Returns the updated record.
    pub async fn update_by_id(
        &self,
        section: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> DbResult<Value> {
        let mut state = self.state.lock().await;
        let mut image = self.snapshot(&state).await?;
        validate_patch_fields(&image, section, &patch)?;
        let records = image
            .sections
            .get_mut(section)
            .ok_or_else(|| DbError::section_not_found(section))?;
        let record = records.get_mut(id).ok_or_else(|| {
            DbError::IdDoesNotExist(format!("the id {id:?} does not exist in the database"))
        })?;
        merge_record(record, &patch)?;
        let updated = record.clone();
        self.store(&mut state, image).await?;
        Ok(updated)
    }

    /// Shallow-merge `patch` into every record the predicate selects; the
    /// IDs of the updated records come back.
    pub async fn update_by_query(
        &self,
        section: &str,
        query: &str,
        patch: Map<String, Value>,
    ) -> DbResult<Vec<String>> {
        let predicate = Predicate::parse(query)?;
        let mut state = self.state.lock().await;
        let mut image = self.snapshot(&state).await?;
        validate_patch_fields(&image, section, &patch)?;
        let records = image
            .sections
            .get_mut(section)
            .ok_or_else(|| DbError::section_not_found(section))?;
        let mut updated = Vec::new();
        for (id, record) in records.iter_mut() {
            if matches_record(&predicate, record) {
                merge_record(record, &patch)?;
                updated.push(id.clone());
            }
        }
        self.store(&mut state, image).await?;
        Ok(updated)
    }

    pub async fn delete_by_id(&self, section: &str, id: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let mut image = self.snapshot(&state).await?;
        let records = image
            .sections
            .get_mut(section)
            .ok_or_else(|| DbError::section_not_found(section))?;
        if records.remove(id).is_none() {
            return Err(DbError::IdDoesNotExist(format!(
                "id {id} does not exist in the database"
            )));
        }
        self.store(&mut state, image).await?;
        Ok(())
    }

    pub async fn delete_by_query(&self, section: &str, query: &str) -> DbResult<Vec<String>> {
        let predicate = Predicate::parse(query)?;
        let mut state = self.state.lock().await;
        let mut image = self.snapshot(&state).await?;
        let records = image
            .sections
            .get_mut(section)
            .ok_or_else(|| DbError::section_not_found(section))?;
        let doomed = records
            .iter()
            .filter(|(_, record)| matches_record(&predicate, record))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in &doomed {
            records.remove(id);
        }
        self.store(&mut state, image).await?;
        Ok(doomed)
    }

    /// Empty the section's record map and clear its key schema.
    pub async fn purge(&self, section: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let mut image = self.snapshot(&state).await?;
        purge_section(&mut image, section)?;
        self.store(&mut state, image).await?;
        Ok(())
    }

    /// [`Engine::purge`] applied to every section of the database.
    pub async fn purge_all(&self) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let mut image = self.snapshot(&state).await?;
        let sections = image.sections.keys().cloned().collect::<Vec<_>>();
        for section in sections {
            purge_section(&mut image, &section)?;
        }
        self.store(&mut state, image).await?;
        Ok(())
    }

    /// Register a new field for the section and backfill `default` into
    /// every existing record. `default` must be a string, integer, boolean,
    /// list, mapping or null.
    pub async fn add_new_key(&self, section: &str, key: &str, default: Value) -> DbResult<()> {
        match &default {
            Value::Null | Value::Bool(_) | Value::String(_) | Value::Array(_)
            | Value::Object(_) => {}
            Value::Number(number) if number.is_i64() || number.is_u64() => {}
            other => {
                return Err(DbError::BadType(format!(
                    "default value must be one of str, int, bool, list, dict or null, not {other}"
                )))
            }
        }
        let mut state = self.state.lock().await;
        let mut image = self.snapshot(&state).await?;
        let keys = image
            .keys
            .get_mut(section)
            .ok_or_else(|| DbError::section_not_found(section))?;
        if !keys.iter().any(|existing| existing == key) {
            keys.push(key.to_string());
            keys.sort();
        }
        let records = image
            .sections
            .get_mut(section)
            .ok_or_else(|| DbError::section_not_found(section))?;
        for record in records.values_mut() {
            let Value::Object(fields) = record else {
                return Err(DbError::SchemaType(
                    "every record in a section must be an object".into(),
                ));
            };
            fields.insert(key.to_string(), default.clone());
        }
        self.store(&mut state, image).await?;
        Ok(())
    }

    pub async fn add_section(&self, section: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let mut image = self.snapshot(&state).await?;
        if image.keys.contains_key(section) {
            return Err(DbError::SectionAlreadyExists(format!(
                "section {section} already exists in the database"
            )));
        }
        image.keys.insert(section.to_string(), Vec::new());
        image.sections.insert(section.to_string(), Map::new());
        self.store(&mut state, image).await?;
        Ok(())
    }

    async fn snapshot(&self, state: &EngineState) -> DbResult<Image> {
        if self.auto_update {
            read_image(&self.path).await
        } else {
            Ok(state.image.clone())
        }
    }

    async fn store(&self, state: &mut EngineState, image: Image) -> DbResult<()> {
        if self.auto_update {
            write_image(&self.path, &image).await
        } else {
            state.image = image;
            state.loaded = true;
            Ok(())
        }
    }
}

async fn read_image(path: &Path) -> DbResult<Image> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            DbError::DatabaseNotFound(format!("database file {} is missing", path.display()))
        } else {
            DbError::Io(err)
        }
    })?;
    let value: Value = serde_json::from_slice(&bytes)?;
    Image::from_value(value)
}

async fn write_image(path: &Path, image: &Image) -> DbResult<()> {
    let bytes = serde_json::to_vec_pretty(&image.to_value())?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn sorted_fields(record: &Map<String, Value>) -> Vec<String> {
    let mut fields = record.keys().cloned().collect::<Vec<_>>();
    fields.sort();
    fields
}

fn is_sorted_unique(fields: &[String]) -> bool {
    fields.windows(2).all(|pair| pair[0] < pair[1])
}

fn validate_record_fields(keys: &[String], record: &Map<String, Value>) -> DbResult<()> {
    let fields = sorted_fields(record);
    if fields != keys {
        let known = keys.iter().collect::<BTreeSet<_>>();
        let given = fields.iter().collect::<BTreeSet<_>>();
        let difference = known
            .symmetric_difference(&given)
            .map(|field| field.as_str())
            .collect::<Vec<_>>();
        return Err(DbError::UnknownKey(format!(
            "unrecognized / missing key(s) {difference:?} (either the key(s) do not exist in the \
             section or are missing in the given record)"
        )));
    }
    Ok(())
}

fn validate_patch_fields(image: &Image, section: &str, patch: &Map<String, Value>) -> DbResult<()> {
    let keys = image
        .keys
        .get(section)
        .ok_or_else(|| DbError::section_not_found(section))?;
    let unknown = patch
        .keys()
        .filter(|field| !keys.contains(field))
        .map(String::as_str)
        .collect::<Vec<_>>();
    if !unknown.is_empty() {
        return Err(DbError::UnknownKey(format!(
            "unrecognized key(s) {unknown:?}"
        )));
    }
    Ok(())
}

fn merge_record(record: &mut Value, patch: &Map<String, Value>) -> DbResult<()> {
    let Value::Object(fields) = record else {
        return Err(DbError::SchemaType(
            "every record in a section must be an object".into(),
        ));
    };
    for (field, value) in patch {
        fields.insert(field.clone(), value.clone());
    }
    Ok(())
}

fn matches_record(predicate: &Predicate, record: &Value) -> bool {
    match record {
        Value::Object(fields) => predicate.matches(fields),
        _ => false,
    }
}

fn purge_section(image: &mut Image, section: &str) -> DbResult<()> {
    let records = image
        .sections
        .get_mut(section)
        .ok_or_else(|| DbError::section_not_found(section))?;
    records.clear();
    let keys = image
        .keys
        .get_mut(section)
        .ok_or_else(|| DbError::section_not_found(section))?;
    keys.clear();
    Ok(())
}
