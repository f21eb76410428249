//! # Type registry
//!
//! Process-wide mapping from small integer type tags to metadata. The
//! registry is filled once, before any actor system starts, and then
//! installed; lookups after installation never take a lock.
//!
//! Each entry carries the type's name, its padded size, and function
//! pointers for default construction, copying, stringification, and
//! serialization in two codecs: a compact binary form (little-endian,
//! zig-zag varints for signed integers, length-prefixed sequences) and
//! JSON. Rust's `Drop` supplies destruction.
//!
//! Type-id *lists* (the signature of a message) are interned in a global
//! set, so list equality is pointer equality and dispatch reduces to a
//! pointer compare.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::actor::{DemonitorMsg, DownMsg, ExitMsg, LinkMsg, MonitorMsg, ReceiveTimeout, UnlinkMsg};
use crate::error::{Error, ErrorCode, Result};

mod codec;

pub use codec::{BinarySink, BinarySource};

/// Process-wide identifier for a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeTag(pub u32);

impl TypeTag {
    /// Tags below this value are reserved for the runtime.
    pub const FIRST_USER_ID: u32 = 64;
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tags of the builtin types every system registers.
pub mod tags {
    use super::TypeTag;

    pub const UNIT: TypeTag = TypeTag(0);
    pub const BOOL: TypeTag = TypeTag(1);
    pub const I64: TypeTag = TypeTag(2);
    pub const U64: TypeTag = TypeTag(3);
    pub const F64: TypeTag = TypeTag(4);
    pub const STRING: TypeTag = TypeTag(5);
    pub const ERROR: TypeTag = TypeTag(6);
    pub const EXIT: TypeTag = TypeTag(7);
    pub const DOWN: TypeTag = TypeTag(8);
    pub const LINK: TypeTag = TypeTag(9);
    pub const UNLINK: TypeTag = TypeTag(10);
    pub const MONITOR: TypeTag = TypeTag(11);
    pub const DEMONITOR: TypeTag = TypeTag(12);
    pub const RECEIVE_TIMEOUT: TypeTag = TypeTag(13);
}

// ---------------------------------------------------------------------------
// erased values

/// Object-safe view of a message element.
pub trait AnyValue: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any + Send + Sync> AnyValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A boxed, type-erased message element.
pub type ErasedValue = Box<dyn AnyValue>;

// ---------------------------------------------------------------------------
// metadata

/// Everything the runtime knows about one registered type.
pub struct TypeMeta {
    name: &'static str,
    padded_size: usize,
    rust_id: std::any::TypeId,
    default_construct: Option<fn() -> ErasedValue>,
    copy_construct: fn(&dyn AnyValue) -> ErasedValue,
    stringify: fn(&dyn AnyValue) -> String,
    serialize: fn(&dyn AnyValue, &mut BinarySink) -> Result<()>,
    deserialize: fn(&mut BinarySource<'_>) -> Result<ErasedValue>,
    to_json: fn(&dyn AnyValue) -> Result<serde_json::Value>,
    from_json: fn(&serde_json::Value) -> Result<ErasedValue>,
}

impl TypeMeta {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn padded_size(&self) -> usize {
        self.padded_size
    }

    pub fn default_value(&self) -> Option<ErasedValue> {
        self.default_construct.map(|f| f())
    }

    pub fn copy(&self, value: &dyn AnyValue) -> ErasedValue {
        (self.copy_construct)(value)
    }

    pub fn stringify(&self, value: &dyn AnyValue) -> String {
        (self.stringify)(value)
    }

    pub fn serialize(&self, value: &dyn AnyValue, sink: &mut BinarySink) -> Result<()> {
        (self.serialize)(value, sink)
    }

    pub fn deserialize(&self, source: &mut BinarySource<'_>) -> Result<ErasedValue> {
        (self.deserialize)(source)
    }

    pub fn to_json(&self, value: &dyn AnyValue) -> Result<serde_json::Value> {
        (self.to_json)(value)
    }

    pub fn from_json(&self, value: &serde_json::Value) -> Result<ErasedValue> {
        (self.from_json)(value)
    }

    fn describes_same_type(&self, other: &TypeMeta) -> bool {
        self.name == other.name
            && self.padded_size == other.padded_size
            && self.rust_id == other.rust_id
    }
}

impl fmt::Debug for TypeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMeta")
            .field("name", &self.name)
            .field("padded_size", &self.padded_size)
            .finish()
    }
}

/// Marker for fully-inspectable types: value types that every codec of the
/// registry can handle. Implemented automatically.
pub trait Inspectable:
    Any + Send + Sync + Clone + fmt::Debug + Default + Serialize + DeserializeOwned
{
}

impl<T> Inspectable for T where
    T: Any + Send + Sync + Clone + fmt::Debug + Default + Serialize + DeserializeOwned
{
}

fn full_meta<T: Inspectable>(name: &'static str) -> TypeMeta {
    TypeMeta {
        name,
        padded_size: std::mem::size_of::<T>(),
        rust_id: std::any::TypeId::of::<T>(),
        default_construct: Some(|| Box::new(T::default()) as ErasedValue),
        copy_construct: |v| match v.as_any().downcast_ref::<T>() {
            Some(v) => Box::new(v.clone()) as ErasedValue,
            None => unreachable!("registry meta invoked with a foreign value"),
        },
        stringify: |v| match v.as_any().downcast_ref::<T>() {
            Some(v) => format!("{v:?}"),
            None => String::from("<foreign value>"),
        },
        serialize: |v, sink| {
            let v = v
                .as_any()
                .downcast_ref::<T>()
                .ok_or_else(|| Error::new(ErrorCode::SerializationFailed))?;
            v.serialize(&mut *sink)
        },
        deserialize: |source| {
            let v = T::deserialize(&mut *source)?;
            Ok(Box::new(v) as ErasedValue)
        },
        to_json: |v| {
            let v = v
                .as_any()
                .downcast_ref::<T>()
                .ok_or_else(|| Error::new(ErrorCode::SerializationFailed))?;
            serde_json::to_value(v)
                .map_err(|e| Error::with_message(ErrorCode::SerializationFailed, e.to_string()))
        },
        from_json: |v| {
            let v: T = serde_json::from_value(v.clone())
                .map_err(|e| Error::with_message(ErrorCode::DeserializationFailed, e.to_string()))?;
            Ok(Box::new(v) as ErasedValue)
        },
    }
}

fn opaque_meta<T: Any + Send + Sync + Clone + fmt::Debug>(name: &'static str) -> TypeMeta {
    TypeMeta {
        name,
        padded_size: std::mem::size_of::<T>(),
        rust_id: std::any::TypeId::of::<T>(),
        default_construct: None,
        copy_construct: |v| match v.as_any().downcast_ref::<T>() {
            Some(v) => Box::new(v.clone()) as ErasedValue,
            None => unreachable!("registry meta invoked with a foreign value"),
        },
        stringify: |v| match v.as_any().downcast_ref::<T>() {
            Some(v) => format!("{v:?}"),
            None => String::from("<foreign value>"),
        },
        serialize: |_, _| Err(Error::new(ErrorCode::SerializationFailed)),
        deserialize: |_| Err(Error::new(ErrorCode::DeserializationFailed)),
        to_json: |_| Err(Error::new(ErrorCode::SerializationFailed)),
        from_json: |_| Err(Error::new(ErrorCode::DeserializationFailed)),
    }
}

// ---------------------------------------------------------------------------
// interned type lists

/// An immutable, interned list of type tags. Obtained through [`intern`];
/// two equal lists are always the same allocation, so equality checks are
/// pointer comparisons.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TypeList(Vec<TypeTag>);

/// Reference to an interned type list.
pub type TypeListRef = &'static TypeList;

impl TypeList {
    pub fn tags(&self) -> &[TypeTag] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

static INTERNED_LISTS: Lazy<Mutex<HashMap<Vec<TypeTag>, TypeListRef>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Interns a list of type tags. The returned reference lives for the rest of
/// the process; interning the same tags twice returns the same pointer.
pub fn intern(tags: &[TypeTag]) -> TypeListRef {
    let mut set = INTERNED_LISTS.lock();
    if let Some(list) = set.get(tags) {
        return list;
    }
    let owned = tags.to_vec();
    let leaked: TypeListRef = Box::leak(Box::new(TypeList(owned.clone())));
    set.insert(owned, leaked);
    leaked
}

/// Pointer equality on interned lists.
pub fn same_list(a: TypeListRef, b: TypeListRef) -> bool {
    std::ptr::eq(a, b)
}

// ---------------------------------------------------------------------------
// the registry

/// A mutable registry under construction. Call [`Registry::install`] to make
/// it the process-wide table.
pub struct Registry {
    by_tag: HashMap<u32, TypeMeta>,
    by_rust: HashMap<std::any::TypeId, TypeTag>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            by_tag: HashMap::new(),
            by_rust: HashMap::new(),
        }
    }

    /// Creates a registry pre-filled with the runtime's builtin types.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        // Builtins use reserved tags; none of these calls can conflict.
        let _ = reg.add::<()>(tags::UNIT, "unit");
        let _ = reg.add::<bool>(tags::BOOL, "bool");
        let _ = reg.add::<i64>(tags::I64, "i64");
        let _ = reg.add::<u64>(tags::U64, "u64");
        let _ = reg.add::<f64>(tags::F64, "f64");
        let _ = reg.add::<String>(tags::STRING, "string");
        let _ = reg.add::<Error>(tags::ERROR, "error");
        let _ = reg.add_opaque::<ExitMsg>(tags::EXIT, "exit_msg");
        let _ = reg.add_opaque::<DownMsg>(tags::DOWN, "down_msg");
        let _ = reg.add_opaque::<LinkMsg>(tags::LINK, "link_msg");
        let _ = reg.add_opaque::<UnlinkMsg>(tags::UNLINK, "unlink_msg");
        let _ = reg.add_opaque::<MonitorMsg>(tags::MONITOR, "monitor_msg");
        let _ = reg.add_opaque::<DemonitorMsg>(tags::DEMONITOR, "demonitor_msg");
        let _ = reg.add::<ReceiveTimeout>(tags::RECEIVE_TIMEOUT, "receive_timeout");
        reg
    }

    /// Registers a fully-inspectable type under `tag`.
    ///
    /// Idempotent: registering the same type under the same tag again
    /// succeeds. Registering a *different* type under an occupied tag fails
    /// with `type_registry_conflict`.
    pub fn add<T: Inspectable>(&mut self, tag: TypeTag, name: &'static str) -> Result<()> {
        self.add_meta::<T>(tag, full_meta::<T>(name))
    }

    /// Registers a type that cannot cross a codec boundary (it holds actor
    /// handles or other process-local state). Serialization attempts report
    /// `serialization_failed`.
    pub fn add_opaque<T: Any + Send + Sync + Clone + fmt::Debug>(
        &mut self,
        tag: TypeTag,
        name: &'static str,
    ) -> Result<()> {
        self.add_meta::<T>(tag, opaque_meta::<T>(name))
    }

    fn add_meta<T: Any>(&mut self, tag: TypeTag, meta: TypeMeta) -> Result<()> {
        if let Some(existing) = self.by_tag.get(&tag.0) {
            if existing.describes_same_type(&meta) {
                return Ok(());
            }
            return Err(Error::with_message(
                ErrorCode::TypeRegistryConflict,
                format!(
                    "tag {tag} already maps to '{}', refusing '{}'",
                    existing.name, meta.name
                ),
            ));
        }
        if let Some(prev) = self.by_rust.get(&std::any::TypeId::of::<T>()) {
            return Err(Error::with_message(
                ErrorCode::TypeRegistryConflict,
                format!("type '{}' already registered under {prev}", meta.name),
            ));
        }
        self.by_rust.insert(std::any::TypeId::of::<T>(), tag);
        self.by_tag.insert(tag.0, meta);
        Ok(())
    }

    pub fn meta(&self, tag: TypeTag) -> Option<&TypeMeta> {
        self.by_tag.get(&tag.0)
    }

    pub fn tag_of_rust(&self, id: std::any::TypeId) -> Option<TypeTag> {
        self.by_rust.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Installs this registry as the process-wide table. From here on,
    /// lookups are lock-free and registration is closed.
    ///
    /// Installing twice succeeds only when both registries describe the same
    /// set of types; otherwise the call fails with `type_registry_conflict`.
    pub fn install(self) -> Result<()> {
        match GLOBAL.try_insert(self) {
            Ok(_) => Ok(()),
            Err((installed, candidate)) => {
                if registries_equal(installed, &candidate) {
                    Ok(())
                } else {
                    Err(Error::with_message(
                        ErrorCode::TypeRegistryConflict,
                        "a different type registry is already installed",
                    ))
                }
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn registries_equal(a: &Registry, b: &Registry) -> bool {
    a.by_tag.len() == b.by_tag.len()
        && a.by_tag.iter().all(|(tag, meta)| {
            b.by_tag
                .get(tag)
                .map(|other| other.describes_same_type(meta))
                .unwrap_or(false)
        })
}

static GLOBAL: OnceCell<Registry> = OnceCell::new();

/// Returns the installed registry, or `unknown_type` if none was installed.
pub fn global() -> Result<&'static Registry> {
    GLOBAL
        .get()
        .ok_or_else(|| Error::with_message(ErrorCode::UnknownType, "type registry not installed"))
}

/// True once a registry has been installed.
pub fn is_installed() -> bool {
    GLOBAL.get().is_some()
}

/// Looks up the tag registered for the Rust type `T`.
pub fn tag_of<T: Any>() -> Result<TypeTag> {
    global()?
        .tag_of_rust(std::any::TypeId::of::<T>())
        .ok_or_else(|| {
            Error::with_message(
                ErrorCode::UnknownType,
                format!("type '{}' is not registered", std::any::type_name::<T>()),
            )
        })
}

/// Looks up the metadata registered for `tag`.
pub fn meta_of(tag: TypeTag) -> Result<&'static TypeMeta> {
    global()?
        .meta(tag)
        .ok_or_else(|| Error::with_message(ErrorCode::UnknownType, format!("no meta for {tag}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn interning_yields_pointer_equality() {
        let a = intern(&[tags::I64, tags::STRING]);
        let b = intern(&[tags::I64, tags::STRING]);
        let c = intern(&[tags::STRING, tags::I64]);
        assert!(same_list(a, b));
        assert!(!same_list(a, c));
        assert_eq!(a.tags(), &[tags::I64, tags::STRING]);
    }

    #[test]
    fn double_registration_is_idempotent() {
        let mut reg = Registry::with_builtins();
        assert!(reg.add::<i64>(tags::I64, "i64").is_ok());
    }

    #[test]
    fn conflicting_registration_fails() {
        let mut reg = Registry::with_builtins();
        let err = reg.add::<String>(tags::I64, "not-i64").unwrap_err();
        assert_eq!(err.code(), ErrorCode::TypeRegistryConflict);
    }

    #[test]
    fn binary_round_trip() {
        test_support::boot();
        let meta = meta_of(tags::STRING).unwrap();
        let value: ErasedValue = Box::new(String::from("round trip"));
        let mut sink = BinarySink::new();
        meta.serialize(value.as_ref(), &mut sink).unwrap();
        let bytes = sink.into_bytes();
        let mut source = BinarySource::new(&bytes);
        let back = meta.deserialize(&mut source).unwrap();
        assert_eq!(
            back.as_any().downcast_ref::<String>().unwrap(),
            "round trip"
        );
    }

    #[test]
    fn json_round_trip() {
        test_support::boot();
        let meta = meta_of(tags::ERROR).unwrap();
        let value: ErasedValue = Box::new(Error::user(7, "lucky"));
        let json = meta.to_json(value.as_ref()).unwrap();
        let back = meta.from_json(&json).unwrap();
        assert_eq!(
            back.as_any().downcast_ref::<Error>().unwrap(),
            &Error::user(7, "lucky")
        );
    }

    #[test]
    fn opaque_types_refuse_codecs() {
        test_support::boot();
        let meta = meta_of(tags::EXIT).unwrap();
        let mut sink = BinarySink::new();
        let reason = crate::actor::ExitReason::Normal;
        let value: ErasedValue = Box::new(ExitMsg::new(None, reason));
        let err = meta.serialize(value.as_ref(), &mut sink).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SerializationFailed);
    }

    #[test]
    fn stringify_uses_debug() {
        test_support::boot();
        let meta = meta_of(tags::I64).unwrap();
        let value: ErasedValue = Box::new(42i64);
        assert_eq!(meta.stringify(value.as_ref()), "42");
    }
}
