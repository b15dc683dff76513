//! Binding native record types to registered schemas.
//!
//! A native type declares its layout once through [`Message::shape`], an
//! explicit list of field descriptors. Binding checks that layout against
//! the schema field by field, so a type that drifts from its schema fails
//! at startup instead of on the first message.

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use apache_avro::Schema as AvroSchema;
use apache_avro::schema::RecordSchema;
use apache_avro::types::Value as Datum;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{BindError, CodecError};
use crate::schema::{Schema, SchemaHandle, SchemaStore, named_types};

/// Largest payload accepted by [`TypeBinder::decode`].
///
/// Also caps any single length or block count read from a payload.
pub const MAX_PAYLOAD_BYTES: usize = 1 << 20;

/// A native record type that can be bound to a schema.
///
/// The serde representation of the type must match the declared shape:
/// field names as serialized, in schema order.
///
/// # Examples
///
/// ```
/// use schema_agent::{FieldKind, Message, Shape};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct TestedEvent {
///     value: String,
/// }
///
/// impl Message for TestedEvent {
///     fn shape() -> Shape {
///         Shape::new().field("value", FieldKind::String)
///     }
/// }
///
/// assert_eq!(TestedEvent::shape().len(), 1);
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Field descriptors of this type, in schema order.
    fn shape() -> Shape;
}

/// Kind of a single field in a native [`Shape`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// `bool`; matches `boolean`.
    Boolean,
    /// `i32`; matches `int` and the `date` and `time-millis` logical types.
    Int,
    /// `i64`; matches `long` and the time and timestamp logical types built on it.
    Long,
    /// `f32`; matches `float`.
    Float,
    /// `f64`; matches `double`.
    Double,
    /// Byte sequence; matches `bytes`.
    Bytes,
    /// `String`; matches `string`.
    String,
    /// String symbols, matched in order against an enum schema.
    Enum(Vec<&'static str>),
    /// Nested record.
    Record(Shape),
    /// A value that may be absent; matches a union of `null` and the inner kind.
    Optional(Box<FieldKind>),
    /// Matches an array schema.
    List(Box<FieldKind>),
    /// String-keyed map; matches a map schema.
    Map(Box<FieldKind>),
}

impl FieldKind {
    /// Nested record field taking its shape from another message type.
    pub fn record<T: Message>() -> Self {
        Self::Record(T::shape())
    }

    /// Optional wrapper.
    pub fn optional(inner: FieldKind) -> Self {
        Self::Optional(Box::new(inner))
    }

    /// List wrapper.
    pub fn list(inner: FieldKind) -> Self {
        Self::List(Box::new(inner))
    }

    /// Map wrapper.
    pub fn map(inner: FieldKind) -> Self {
        Self::Map(Box::new(inner))
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Bytes => "bytes",
            Self::String => "string",
            Self::Enum(_) => "enum",
            Self::Record(_) => "record",
            Self::Optional(_) => "optional",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }
}

/// A native field descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Field name as serialized; must equal the schema field name.
    pub name: &'static str,
    /// Expected kind of the schema field.
    pub kind: FieldKind,
}

/// Ordered field descriptors of a native record type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shape {
    fields: Vec<Field>,
}

impl Shape {
    /// An empty shape.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field.
    pub fn field(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(Field { name, kind });
        self
    }

    /// The fields in declaration order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the shape has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Checks shapes against Avro schemas, following named references.
struct ShapeCheck<'s> {
    names: HashMap<String, &'s AvroSchema>,
}

impl<'s> ShapeCheck<'s> {
    fn new(schema: &'s Schema) -> Self {
        Self {
            names: named_types(&schema.schemata()),
        }
    }

    fn resolve<'a>(&'a self, schema: &'a AvroSchema) -> &'a AvroSchema {
        match schema {
            AvroSchema::Ref { name } => self
                .names
                .get(&name.fullname(None))
                .copied()
                .unwrap_or(schema),
            other => other,
        }
    }

    /// Returns the first incompatibility found, prefixed with its path.
    fn record(&self, shape: &Shape, record: &RecordSchema, path: &str) -> Result<(), String> {
        if shape.fields.len() != record.fields.len() {
            return Err(format!(
                "{path}: shape has {} field(s), schema '{}' has {}",
                shape.fields.len(),
                record.name.fullname(None),
                record.fields.len()
            ));
        }
        for (native, field) in shape.fields.iter().zip(&record.fields) {
            if native.name != field.name {
                return Err(format!(
                    "{path}: expected field '{}', shape declares '{}'",
                    field.name, native.name
                ));
            }
            self.kind(&native.kind, &field.schema, &format!("{path}.{}", field.name))?;
        }
        Ok(())
    }

    fn kind(&self, kind: &FieldKind, schema: &AvroSchema, path: &str) -> Result<(), String> {
        let schema = self.resolve(schema);
        let ok = match (kind, schema) {
            (FieldKind::Boolean, AvroSchema::Boolean)
            | (FieldKind::Int, AvroSchema::Int | AvroSchema::Date | AvroSchema::TimeMillis)
            | (
                FieldKind::Long,
                AvroSchema::Long
                | AvroSchema::TimeMicros
                | AvroSchema::TimestampMillis
                | AvroSchema::TimestampMicros,
            )
            | (FieldKind::Float, AvroSchema::Float)
            | (FieldKind::Double, AvroSchema::Double)
            | (FieldKind::Bytes, AvroSchema::Bytes)
            | (FieldKind::String, AvroSchema::String) => true,
            (FieldKind::Enum(symbols), AvroSchema::Enum(e)) => {
                if !symbols.iter().copied().eq(e.symbols.iter().map(String::as_str)) {
                    return Err(format!(
                        "{path}: enum symbols differ from '{}'",
                        e.name.fullname(None)
                    ));
                }
                true
            }
            (FieldKind::Record(shape), AvroSchema::Record(record)) => {
                return self.record(shape, record, path);
            }
            (FieldKind::Optional(inner), AvroSchema::Union(union)) => {
                return match union.variants() {
                    [AvroSchema::Null, other] | [other, AvroSchema::Null] => {
                        self.kind(inner, other, path)
                    }
                    _ => Err(format!("{path}: optional field needs a [\"null\", T] union")),
                };
            }
            (FieldKind::List(inner), AvroSchema::Array(array)) => {
                return self.kind(inner, &array.items, &format!("{path}[]"));
            }
            (FieldKind::Map(inner), AvroSchema::Map(map)) => {
                return self.kind(inner, &map.types, &format!("{path}{{}}"));
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "{path}: shape declares {}, schema has {}",
                kind.label(),
                schema_label(schema)
            ))
        }
    }
}

fn schema_label(schema: &AvroSchema) -> String {
    format!("{:?}", apache_avro::schema::SchemaKind::from(schema)).to_lowercase()
}

/// The association between a schema and a native shape.
#[derive(Debug)]
pub struct TypeBinding {
    schema: SchemaHandle,
    shape: Shape,
    native: Option<(TypeId, &'static str)>,
}

impl TypeBinding {
    /// The bound schema.
    pub fn schema(&self) -> &SchemaHandle {
        &self.schema
    }

    /// The native shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Name of the bound Rust type, if bound through [`TypeBinder::bind_type`].
    pub fn type_name(&self) -> Option<&'static str> {
        self.native.map(|(_, name)| name)
    }

    /// Returns `false` only when a Rust type is bound and `T` is not it.
    pub(crate) fn accepts<T: 'static>(&self) -> bool {
        self.native
            .is_none_or(|(id, _)| id == TypeId::of::<T>())
    }

    fn write(&self, datum: Datum) -> Result<Vec<u8>, String> {
        let schemata = self.schema.schemata();
        let resolved = datum
            .resolve_schemata(self.schema.avro(), schemata.clone())
            .map_err(|e| e.to_string())?;
        apache_avro::to_avro_datum_schemata(self.schema.avro(), schemata, resolved)
            .map_err(|e| e.to_string())
    }

    fn read(&self, bytes: &[u8]) -> Result<Datum, String> {
        if bytes.len() > MAX_PAYLOAD_BYTES {
            return Err(format!(
                "payload of {} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit",
                bytes.len()
            ));
        }
        let mut reader = bytes;
        let datum = apache_avro::from_avro_datum_schemata(
            self.schema.avro(),
            self.schema.schemata(),
            &mut reader,
            None,
        )
        .map_err(|e| e.to_string())?;
        if !reader.is_empty() {
            return Err(format!("{} trailing byte(s)", reader.len()));
        }
        Ok(datum)
    }
}

/// Shared handle to a type binding.
pub type TypeHandle = Arc<TypeBinding>;

/// Registry of schema-to-type bindings with encode/decode on top.
///
/// Bindings are written during startup and read on every message, so the
/// table sits behind a read/write lock that lets dispatches decode in
/// parallel.
#[derive(Debug)]
pub struct TypeBinder {
    schemas: Arc<SchemaStore>,
    bindings: RwLock<HashMap<String, TypeHandle>>,
}

impl TypeBinder {
    /// Create a binder over a schema store.
    ///
    /// Caps every length and block count the decoder will allocate for at
    /// [`MAX_PAYLOAD_BYTES`]. The cap is process-wide and set once.
    pub fn new(schemas: Arc<SchemaStore>) -> Self {
        apache_avro::max_allocation_bytes(MAX_PAYLOAD_BYTES);
        Self {
            schemas,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Bind a schema to a native shape with no Rust type attached.
    ///
    /// # Errors
    ///
    /// * [`BindError::UnknownSchema`] -- `name` is not in the schema store.
    /// * [`BindError::ShapeMismatch`] -- `shape` does not fit the schema.
    /// * [`BindError::AlreadyBound`] -- `name` already has a binding.
    pub fn bind(&self, name: &str, shape: Shape) -> Result<TypeHandle, BindError> {
        self.insert(name, shape, None)
    }

    /// Bind a schema to the Rust type `T`.
    ///
    /// Later encodes and decodes for `name` only accept `T`.
    ///
    /// # Errors
    ///
    /// Same as [`bind`](TypeBinder::bind).
    pub fn bind_type<T: Message>(&self, name: &str) -> Result<TypeHandle, BindError> {
        self.insert(name, T::shape(), Some((TypeId::of::<T>(), type_name::<T>())))
    }

    fn insert(
        &self,
        name: &str,
        shape: Shape,
        native: Option<(TypeId, &'static str)>,
    ) -> Result<TypeHandle, BindError> {
        let schema = self
            .schemas
            .lookup(name)
            .ok_or_else(|| BindError::UnknownSchema(name.to_owned()))?;
        let mismatch = |reason: String| BindError::ShapeMismatch {
            name: name.to_owned(),
            reason,
        };
        match schema.avro() {
            AvroSchema::Record(record) => ShapeCheck::new(&schema)
                .record(&shape, record, "$")
                .map_err(mismatch)?,
            other => return Err(mismatch(format!("$: schema is {}", schema_label(other)))),
        }

        let mut bindings = self.bindings.write();
        if bindings.contains_key(name) {
            return Err(BindError::AlreadyBound(name.to_owned()));
        }
        let binding = Arc::new(TypeBinding {
            schema,
            shape,
            native,
        });
        bindings.insert(name.to_owned(), Arc::clone(&binding));

        tracing::debug!(
            schema = %name,
            native_type = binding.type_name().unwrap_or("<shape>"),
            "type bound"
        );
        Ok(binding)
    }

    /// Look up the binding for a schema name.
    pub fn binding(&self, name: &str) -> Option<TypeHandle> {
        self.bindings.read().get(name).cloned()
    }

    /// Returns `true` if `name` has a binding.
    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.read().contains_key(name)
    }

    fn require(&self, name: &str) -> Result<TypeHandle, CodecError> {
        self.binding(name)
            .ok_or_else(|| CodecError::UnknownSchema(name.to_owned()))
    }

    /// Decode bytes into a dynamic datum using the bound schema.
    ///
    /// # Errors
    ///
    /// * [`CodecError::UnknownSchema`] -- `name` has no binding.
    /// * [`CodecError::Decode`] -- the bytes are malformed for the schema,
    ///   have trailing data, or exceed [`MAX_PAYLOAD_BYTES`].
    pub fn decode(&self, name: &str, bytes: &[u8]) -> Result<Datum, CodecError> {
        let binding = self.require(name)?;
        binding.read(bytes).map_err(|reason| CodecError::Decode {
            name: name.to_owned(),
            reason,
        })
    }

    /// Decode bytes into a native value of type `T`.
    ///
    /// # Errors
    ///
    /// * [`CodecError::UnknownSchema`] -- `name` has no binding.
    /// * [`CodecError::Decode`] -- the bytes are malformed, `name` is bound
    ///   to a different Rust type, or the datum does not deserialize into `T`.
    pub fn decode_as<T: DeserializeOwned + 'static>(
        &self,
        name: &str,
        bytes: &[u8],
    ) -> Result<T, CodecError> {
        let binding = self.require(name)?;
        let decode_err = |reason: String| CodecError::Decode {
            name: name.to_owned(),
            reason,
        };
        if !binding.accepts::<T>() {
            return Err(decode_err(format!(
                "bound to {}, not {}",
                binding.type_name().unwrap_or("<shape>"),
                type_name::<T>()
            )));
        }
        let datum = binding.read(bytes).map_err(decode_err)?;
        apache_avro::from_value::<T>(&datum).map_err(|e| decode_err(e.to_string()))
    }

    /// Encode a native value using the bound schema.
    ///
    /// # Errors
    ///
    /// * [`CodecError::UnknownSchema`] -- `name` has no binding.
    /// * [`CodecError::Encode`] -- `name` is bound to a different Rust type,
    ///   or the value's serialized form does not fit the schema.
    pub fn encode<T: Serialize + 'static>(&self, name: &str, value: &T) -> Result<Vec<u8>, CodecError> {
        let binding = self.require(name)?;
        let encode_err = |reason: String| CodecError::Encode {
            name: name.to_owned(),
            reason,
        };
        if !binding.accepts::<T>() {
            return Err(encode_err(format!(
                "bound to {}, not {}",
                binding.type_name().unwrap_or("<shape>"),
                type_name::<T>()
            )));
        }
        let datum = apache_avro::to_value(value).map_err(|e| encode_err(e.to_string()))?;
        binding.write(datum).map_err(encode_err)
    }

    /// Encode a dynamic datum using the bound schema.
    ///
    /// Plain values are resolved against the schema first, so an optional
    /// field may be given as the bare value or as `Null`.
    ///
    /// # Errors
    ///
    /// * [`CodecError::UnknownSchema`] -- `name` has no binding.
    /// * [`CodecError::Encode`] -- the datum does not fit the schema.
    pub fn encode_value(&self, name: &str, datum: Datum) -> Result<Vec<u8>, CodecError> {
        let binding = self.require(name)?;
        binding.write(datum).map_err(|reason| CodecError::Encode {
            name: name.to_owned(),
            reason,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    //! Native pong message types.

    use serde::{Deserialize, Serialize};

    use super::{FieldKind, Message, Shape};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Header {
        pub z: String,
    }

    impl Message for Header {
        fn shape() -> Shape {
            Shape::new().field("z", FieldKind::String)
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct TestCommand {
        pub foo: Header,
        pub value: String,
        pub x: i32,
    }

    impl Message for TestCommand {
        fn shape() -> Shape {
            Shape::new()
                .field("foo", FieldKind::record::<Header>())
                .field("value", FieldKind::String)
                .field("x", FieldKind::Int)
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct TestedEvent {
        pub value: String,
    }

    impl Message for TestedEvent {
        fn shape() -> Shape {
            Shape::new().field("value", FieldKind::String)
        }
    }

    pub(crate) fn ping() -> TestCommand {
        TestCommand {
            foo: Header { z: "h".into() },
            value: "ping".into(),
            x: 1,
        }
    }
}
