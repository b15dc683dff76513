//! Schema definitions and the [`SchemaStore`] registry.
//!
//! Definitions are Avro JSON documents parsed with `apache-avro`. Each
//! registered definition must be a record. It may reference any named type
//! (record, enum or fixed, top-level or nested) defined by a schema
//! registered earlier, which is why a shared header schema is registered
//! first.
//!
//! A schema is registered under a registry name such as
//! `crucibuild/agent-pong#test-command`, which is independent of the Avro
//! full name it declares (e.g. `crucibuild.agent_pong.TestCommand`).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use apache_avro::Schema as AvroSchema;
use apache_avro::rabin::Rabin;
use parking_lot::RwLock;

use crate::error::SchemaError;

/// Rabin fingerprint of a schema's Parsing Canonical Form.
///
/// References to named types defined by other schemas appear in the
/// canonical form by full name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    fn of(schema: &AvroSchema) -> Self {
        let digest = schema.fingerprint::<Rabin>();
        Self(u64::from_le_bytes(
            digest.bytes.as_slice().try_into().unwrap_or_default(),
        ))
    }

    /// The fingerprint as an integer.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A registered, immutable schema.
pub struct Schema {
    name: String,
    raw: String,
    avro: AvroSchema,
    fingerprint: Fingerprint,
    /// Every schema registered before this one, in registration order.
    earlier: Vec<SchemaHandle>,
}

impl Schema {
    /// The registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw definition exactly as registered.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The parsed Avro schema.
    pub fn avro(&self) -> &AvroSchema {
        &self.avro
    }

    /// Full Avro name of the top-level record.
    pub fn avro_name(&self) -> String {
        match &self.avro {
            AvroSchema::Record(record) => record.name.fullname(None),
            _ => String::new(),
        }
    }

    /// Rabin fingerprint of the definition.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// This schema and every schema it may reference, for encoding and
    /// decoding.
    pub(crate) fn schemata(&self) -> Vec<&AvroSchema> {
        self.earlier
            .iter()
            .map(|schema| &schema.avro)
            .chain(std::iter::once(&self.avro))
            .collect()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("avro_name", &self.avro_name())
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Shared handle to a registered schema.
pub type SchemaHandle = Arc<Schema>;

/// Named types reachable from `schemata`, keyed by Avro full name.
pub(crate) fn named_types<'s>(schemata: &[&'s AvroSchema]) -> HashMap<String, &'s AvroSchema> {
    let mut names = HashMap::new();
    for schema in schemata {
        collect_named(schema, &mut names);
    }
    names
}

fn collect_named<'s>(schema: &'s AvroSchema, names: &mut HashMap<String, &'s AvroSchema>) {
    match schema {
        AvroSchema::Record(record) => {
            if names.insert(record.name.fullname(None), schema).is_none() {
                for field in &record.fields {
                    collect_named(&field.schema, names);
                }
            }
        }
        AvroSchema::Enum(e) => {
            names.insert(e.name.fullname(None), schema);
        }
        AvroSchema::Fixed(fixed) => {
            names.insert(fixed.name.fullname(None), schema);
        }
        AvroSchema::Array(array) => collect_named(&array.items, names),
        AvroSchema::Map(map) => collect_named(&map.types, names),
        AvroSchema::Union(union) => {
            for variant in union.variants() {
                collect_named(variant, names);
            }
        }
        _ => {}
    }
}

/// Returns `true` if every value of `schema` encodes to zero bytes.
fn encodes_empty(
    schema: &AvroSchema,
    names: &HashMap<String, &AvroSchema>,
    visiting: &mut Vec<String>,
) -> bool {
    match schema {
        AvroSchema::Null => true,
        AvroSchema::Fixed(fixed) => fixed.size == 0,
        AvroSchema::Record(record) => {
            let name = record.name.fullname(None);
            if visiting.contains(&name) {
                return false;
            }
            visiting.push(name);
            let empty = record
                .fields
                .iter()
                .all(|field| encodes_empty(&field.schema, names, visiting));
            visiting.pop();
            empty
        }
        AvroSchema::Ref { name } => names
            .get(&name.fullname(None))
            .is_some_and(|target| encodes_empty(target, names, visiting)),
        _ => false,
    }
}

/// Reject arrays whose items occupy no bytes on the wire.
///
/// Every decoded array item then consumes input, which bounds the size of
/// a decoded message by the size of its payload.
fn check_arrays(
    schema: &AvroSchema,
    names: &HashMap<String, &AvroSchema>,
    path: &str,
) -> Result<(), String> {
    match schema {
        AvroSchema::Array(array) => {
            if encodes_empty(&array.items, names, &mut Vec::new()) {
                return Err(format!("{path}: array items must not encode to zero bytes"));
            }
            check_arrays(&array.items, names, &format!("{path}[]"))
        }
        AvroSchema::Map(map) => check_arrays(&map.types, names, &format!("{path}{{}}")),
        AvroSchema::Union(union) => union
            .variants()
            .iter()
            .try_for_each(|variant| check_arrays(variant, names, path)),
        AvroSchema::Record(record) => record.fields.iter().try_for_each(|field| {
            check_arrays(&field.schema, names, &format!("{path}.{}", field.name))
        }),
        _ => Ok(()),
    }
}

/// Registry of schema definitions for the lifetime of an agent.
///
/// Registration is append-only: there is no removal, and a name can be
/// registered once. Lookups take a shared lock and may run concurrently
/// with each other.
#[derive(Debug, Default)]
pub struct SchemaStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    by_name: HashMap<String, SchemaHandle>,
    order: Vec<SchemaHandle>,
}

impl SchemaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and register a schema definition.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique registry name (e.g. `"crucibuild/agent-pong#test-command"`).
    /// * `raw` - Avro JSON definition of a record.
    ///
    /// # Returns
    ///
    /// A handle to the stored schema.
    ///
    /// # Errors
    ///
    /// * [`SchemaError::Duplicate`] -- `name` is already registered.
    /// * [`SchemaError::Invalid`] -- `raw` is not valid Avro, is not a
    ///   record, references an unknown type, redefines a named type, or
    ///   contains an array of zero-size items.
    pub fn register(&self, name: &str, raw: &[u8]) -> Result<SchemaHandle, SchemaError> {
        // Hold the write lock across parse + insert so references resolve
        // against a stable view and two racing registrations of the same
        // name cannot both succeed.
        let mut inner = self.inner.write();
        if inner.by_name.contains_key(name) {
            return Err(SchemaError::Duplicate(name.to_owned()));
        }

        let invalid = |reason: String| SchemaError::Invalid {
            name: name.to_owned(),
            reason,
        };
        if name.is_empty() {
            return Err(invalid("registry name is empty".into()));
        }
        let text = std::str::from_utf8(raw).map_err(|e| invalid(e.to_string()))?;

        let mut sources: Vec<&str> = inner.order.iter().map(|s| s.raw.as_str()).collect();
        sources.push(text);
        let mut parsed =
            AvroSchema::parse_list(&sources).map_err(|e| invalid(e.to_string()))?;
        let avro = parsed
            .pop()
            .ok_or_else(|| invalid("definition produced no schema".into()))?;
        if !matches!(avro, AvroSchema::Record(_)) {
            return Err(invalid("top-level schema must be a record".into()));
        }

        let earlier = inner.order.clone();
        let schemata: Vec<&AvroSchema> = earlier
            .iter()
            .map(|s| &s.avro)
            .chain(std::iter::once(&avro))
            .collect();
        check_arrays(&avro, &named_types(&schemata), "$").map_err(invalid)?;

        let schema = Arc::new(Schema {
            name: name.to_owned(),
            raw: text.to_owned(),
            fingerprint: Fingerprint::of(&avro),
            avro,
            earlier,
        });
        inner.by_name.insert(name.to_owned(), Arc::clone(&schema));
        inner.order.push(Arc::clone(&schema));

        tracing::debug!(
            schema = %name,
            avro_name = %schema.avro_name(),
            fingerprint = %schema.fingerprint,
            "schema registered"
        );
        Ok(schema)
    }

    /// Look up a schema by registry name.
    pub fn lookup(&self, name: &str) -> Option<SchemaHandle> {
        self.inner.read().by_name.get(name).cloned()
    }

    /// Look up the fingerprint of a schema by registry name.
    pub fn fingerprint(&self, name: &str) -> Option<Fingerprint> {
        self.inner.read().by_name.get(name).map(|s| s.fingerprint)
    }

    /// Returns `true` if a schema with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().by_name.contains_key(name)
    }

    /// Number of registered schemas.
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    /// Returns `true` if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }

    /// Registered schema names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }
}
