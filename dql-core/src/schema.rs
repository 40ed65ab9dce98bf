/// Table and index metadata
///
/// Mirrors what a describe-table call reports: the primary key, up to five
/// local and five global secondary indexes, and provisioned throughput.
/// The planner consults this to find key-condition-eligible indexes.

use crate::{Error, Item, Result, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Maximum number of local and of global indexes per table
pub const MAX_INDEXES: usize = 5;

/// Scalar type of a key attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    S,
    N,
    B,
}

impl KeyType {
    /// Check if a value matches this type
    pub fn matches(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (KeyType::S, Value::S(_)) | (KeyType::N, Value::N(_)) | (KeyType::B, Value::B(_))
        )
    }

    pub fn from_keyword(word: &str) -> Option<Self> {
        match word.to_ascii_uppercase().as_str() {
            "STRING" | "S" => Some(KeyType::S),
            "NUMBER" | "N" => Some(KeyType::N),
            "BINARY" | "B" => Some(KeyType::B),
            _ => None,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyType::S => "STRING",
            KeyType::N => "NUMBER",
            KeyType::B => "BINARY",
        })
    }
}

/// A named, typed key attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAttribute {
    pub name: String,
    pub key_type: KeyType,
}

impl KeyAttribute {
    pub fn new(name: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            name: name.into(),
            key_type,
        }
    }

    /// Fails with `SchemaMismatch` when the value does not have the key's type.
    pub fn check(&self, value: &Value) -> Result<()> {
        if self.key_type.matches(value) {
            Ok(())
        } else {
            Err(Error::SchemaMismatch(format!(
                "key attribute '{}' is {} but got {}",
                self.name, self.key_type, value
            )))
        }
    }
}

/// Index projection type - which attributes are copied into the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IndexProjection {
    #[default]
    All,
    KeysOnly,
    Include(Vec<String>),
}

/// Provisioned read/write capacity. Zero on both means on-demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Throughput {
    pub read: u64,
    pub write: u64,
}

impl Throughput {
    pub fn new(read: u64, write: u64) -> Self {
        Self { read, write }
    }

    pub fn is_on_demand(&self) -> bool {
        self.read == 0 && self.write == 0
    }
}

/// Local secondary index: table hash key plus its own range key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIndex {
    pub name: String,
    pub range_key: KeyAttribute,
    #[serde(default)]
    pub projection: IndexProjection,
}

impl LocalIndex {
    pub fn new(name: impl Into<String>, range_key: KeyAttribute) -> Self {
        Self {
            name: name.into(),
            range_key,
            projection: IndexProjection::All,
        }
    }

    pub fn keys_only(mut self) -> Self {
        self.projection = IndexProjection::KeysOnly;
        self
    }

    pub fn include(mut self, attributes: Vec<String>) -> Self {
        self.projection = IndexProjection::Include(attributes);
        self
    }
}

/// Global secondary index with independent keys and throughput
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalIndex {
    pub name: String,
    pub hash_key: KeyAttribute,
    #[serde(default)]
    pub range_key: Option<KeyAttribute>,
    #[serde(default)]
    pub projection: IndexProjection,
    #[serde(default)]
    pub throughput: Throughput,
}

impl GlobalIndex {
    pub fn new(name: impl Into<String>, hash_key: KeyAttribute) -> Self {
        Self {
            name: name.into(),
            hash_key,
            range_key: None,
            projection: IndexProjection::All,
            throughput: Throughput::default(),
        }
    }

    pub fn with_range_key(mut self, range_key: KeyAttribute) -> Self {
        self.range_key = Some(range_key);
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.projection = IndexProjection::KeysOnly;
        self
    }

    pub fn include(mut self, attributes: Vec<String>) -> Self {
        self.projection = IndexProjection::Include(attributes);
        self
    }

    pub fn with_throughput(mut self, throughput: Throughput) -> Self {
        self.throughput = throughput;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Table,
    Local,
    Global,
}

/// One key-condition candidate: the table's primary key or a secondary index
/// viewed through its effective (hash, range) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryIndex {
    /// `None` for the table's own primary key
    pub name: Option<String>,
    pub kind: IndexKind,
    pub hash_key: KeyAttribute,
    pub range_key: Option<KeyAttribute>,
    pub projection: IndexProjection,
}

impl QueryIndex {
    pub fn is_table(&self) -> bool {
        self.kind == IndexKind::Table
    }

    pub fn is_global(&self) -> bool {
        self.kind == IndexKind::Global
    }

    /// Name used in plans and logs: the index name, or `TABLE`.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("TABLE")
    }

    pub fn projects_all(&self) -> bool {
        self.projection == IndexProjection::All
    }

    /// Whether a top-level attribute is available from this index without
    /// fetching the base item. Table and index keys are always projected.
    pub fn projects(&self, attribute: &str, table: &TableMeta) -> bool {
        if self.is_table() || self.projects_all() {
            return true;
        }
        if table.is_key_attribute(attribute)
            || self.hash_key.name == attribute
            || self.range_key.as_ref().map(|k| k.name.as_str()) == Some(attribute)
        {
            return true;
        }
        match &self.projection {
            IndexProjection::Include(attrs) => attrs.iter().any(|a| a == attribute),
            _ => false,
        }
    }
}

/// Metadata for one table, as returned by describe-table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub hash_key: KeyAttribute,
    #[serde(default)]
    pub range_key: Option<KeyAttribute>,
    #[serde(default)]
    pub local_indexes: Vec<LocalIndex>,
    #[serde(default)]
    pub global_indexes: Vec<GlobalIndex>,
    #[serde(default)]
    pub throughput: Throughput,
}

const NAME_PATTERN: &str = r"^[A-Za-z0-9_.\-]{3,255}$";

impl TableMeta {
    pub fn new(name: impl Into<String>, hash_key: KeyAttribute) -> Self {
        Self {
            name: name.into(),
            hash_key,
            range_key: None,
            local_indexes: Vec::new(),
            global_indexes: Vec::new(),
            throughput: Throughput::default(),
        }
    }

    pub fn with_range_key(mut self, range_key: KeyAttribute) -> Self {
        self.range_key = Some(range_key);
        self
    }

    pub fn with_local_index(mut self, index: LocalIndex) -> Self {
        self.local_indexes.push(index);
        self
    }

    pub fn with_global_index(mut self, index: GlobalIndex) -> Self {
        self.global_indexes.push(index);
        self
    }

    pub fn with_throughput(mut self, throughput: Throughput) -> Self {
        self.throughput = throughput;
        self
    }

    /// Checks the structural invariants of a table definition.
    pub fn validate(&self) -> Result<()> {
        let name_pattern = Regex::new(NAME_PATTERN)
            .map_err(|e| Error::Internal(format!("name pattern: {}", e)))?;
        if !name_pattern.is_match(&self.name) {
            return Err(Error::InvalidArgument(format!(
                "invalid table name '{}'",
                self.name
            )));
        }
        if !self.local_indexes.is_empty() && self.range_key.is_none() {
            return Err(Error::InvalidArgument(format!(
                "table '{}' needs a range key to carry local indexes",
                self.name
            )));
        }
        if self.local_indexes.len() > MAX_INDEXES || self.global_indexes.len() > MAX_INDEXES {
            return Err(Error::InvalidArgument(format!(
                "table '{}' exceeds {} local or global indexes",
                self.name, MAX_INDEXES
            )));
        }

        let mut seen = HashSet::new();
        let names = self
            .local_indexes
            .iter()
            .map(|i| &i.name)
            .chain(self.global_indexes.iter().map(|i| &i.name));
        for name in names {
            if !name_pattern.is_match(name) {
                return Err(Error::InvalidArgument(format!("invalid index name '{}'", name)));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate index name '{}' on table '{}'",
                    name, self.name
                )));
            }
        }
        Ok(())
    }

    pub fn is_key_attribute(&self, attribute: &str) -> bool {
        self.hash_key.name == attribute
            || self.range_key.as_ref().map(|k| k.name.as_str()) == Some(attribute)
    }

    /// Names of the primary key attributes, hash key first.
    pub fn primary_key_attributes(&self) -> Vec<&str> {
        let mut attrs = vec![self.hash_key.name.as_str()];
        if let Some(range) = &self.range_key {
            attrs.push(range.name.as_str());
        }
        attrs
    }

    /// Extracts the primary key from an item, checking key types.
    pub fn primary_key(&self, item: &Item) -> Result<Item> {
        let mut key = Item::new();
        let attrs = std::iter::once(&self.hash_key).chain(self.range_key.as_ref());
        for attr in attrs {
            let value = item.get(&attr.name).ok_or_else(|| {
                Error::SchemaMismatch(format!(
                    "item is missing key attribute '{}' of table '{}'",
                    attr.name, self.name
                ))
            })?;
            attr.check(value)?;
            key.insert(attr.name.clone(), value.clone());
        }
        Ok(key)
    }

    /// Key-condition candidates in declaration order: the primary key, then
    /// local indexes, then global indexes.
    pub fn query_indexes(&self) -> Vec<QueryIndex> {
        let mut indexes = vec![QueryIndex {
            name: None,
            kind: IndexKind::Table,
            hash_key: self.hash_key.clone(),
            range_key: self.range_key.clone(),
            projection: IndexProjection::All,
        }];
        indexes.extend(self.local_indexes.iter().map(|lsi| QueryIndex {
            name: Some(lsi.name.clone()),
            kind: IndexKind::Local,
            hash_key: self.hash_key.clone(),
            range_key: Some(lsi.range_key.clone()),
            projection: lsi.projection.clone(),
        }));
        indexes.extend(self.global_indexes.iter().map(|gsi| QueryIndex {
            name: Some(gsi.name.clone()),
            kind: IndexKind::Global,
            hash_key: gsi.hash_key.clone(),
            range_key: gsi.range_key.clone(),
            projection: gsi.projection.clone(),
        }));
        indexes
    }

    /// Looks up a secondary index by name.
    pub fn index(&self, name: &str) -> Option<QueryIndex> {
        self.query_indexes()
            .into_iter()
            .find(|idx| idx.name.as_deref() == Some(name))
    }

    pub fn global_index(&self, name: &str) -> Option<&GlobalIndex> {
        self.global_indexes.iter().find(|idx| idx.name == name)
    }

    /// Provisioned throughput backing a call on the table or one of its
    /// indexes. Local indexes share the table's capacity.
    pub fn throughput_for(&self, index: Option<&str>) -> Throughput {
        index
            .and_then(|name| self.global_index(name))
            .map(|gsi| gsi.throughput)
            .unwrap_or(self.throughput)
    }

    /// Renders a CREATE statement that recreates this table.
    pub fn schema(&self) -> String {
        let mut columns = Vec::new();
        let mut declared = HashSet::new();
        columns.push(format!("{} {} HASH KEY", self.hash_key.name, self.hash_key.key_type));
        declared.insert(self.hash_key.name.as_str());
        if let Some(range) = &self.range_key {
            columns.push(format!("{} {} RANGE KEY", range.name, range.key_type));
            declared.insert(range.name.as_str());
        }

        let index_keys = self
            .local_indexes
            .iter()
            .map(|i| &i.range_key)
            .chain(self.global_indexes.iter().flat_map(|g| {
                std::iter::once(&g.hash_key).chain(g.range_key.as_ref())
            }));
        for attr in index_keys {
            if declared.insert(attr.name.as_str()) {
                columns.push(format!("{} {}", attr.name, attr.key_type));
            }
        }
        if !self.throughput.is_on_demand() {
            columns.push(format!(
                "THROUGHPUT ({}, {})",
                self.throughput.read, self.throughput.write
            ));
        }

        let mut out = format!("CREATE TABLE {} ({})", self.name, columns.join(", "));
        for lsi in &self.local_indexes {
            out.push_str(&format!(
                "\nLOCAL {}INDEX (\"{}\", {}{})",
                projection_keyword(&lsi.projection),
                lsi.name,
                lsi.range_key.name,
                projection_includes(&lsi.projection)
            ));
        }
        for gsi in &self.global_indexes {
            let mut args = format!("\"{}\", {}", gsi.name, gsi.hash_key.name);
            if let Some(range) = &gsi.range_key {
                args.push_str(&format!(", {}", range.name));
            }
            args.push_str(&projection_includes(&gsi.projection));
            if !gsi.throughput.is_on_demand() {
                args.push_str(&format!(
                    ", THROUGHPUT ({}, {})",
                    gsi.throughput.read, gsi.throughput.write
                ));
            }
            out.push_str(&format!(
                "\nGLOBAL {}INDEX ({})",
                projection_keyword(&gsi.projection),
                args
            ));
        }
        out.push(';');
        out
    }
}

fn projection_keyword(projection: &IndexProjection) -> &'static str {
    match projection {
        IndexProjection::All => "",
        IndexProjection::KeysOnly => "KEYS ",
        IndexProjection::Include(_) => "INCLUDE ",
    }
}

fn projection_includes(projection: &IndexProjection) -> String {
    match projection {
        IndexProjection::Include(attrs) => {
            let quoted: Vec<String> = attrs.iter().map(|a| format!("\"{}\"", a)).collect();
            format!(", [{}]", quoted.join(", "))
        }
        _ => String::new(),
    }
}
