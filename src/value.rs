use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// The three logical datastores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datastore {
    Startup,
    Running,
    Candidate,
}

impl Datastore {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datastore::Startup => "startup",
            Datastore::Running => "running",
            Datastore::Candidate => "candidate",
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Datastore::Startup => 0,
            Datastore::Running => 1,
            Datastore::Candidate => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, EngineError> {
        match tag {
            0 => Ok(Datastore::Startup),
            1 => Ok(Datastore::Running),
            2 => Ok(Datastore::Candidate),
            other => Err(EngineError::InvalidArg(format!(
                "unknown datastore tag {other}"
            ))),
        }
    }

    pub fn index(&self) -> usize {
        self.tag() as usize
    }

    /// The datastore a commit from `self` actually persists into. Candidate
    /// commits land in running; startup and running persist in place.
    pub fn effective(&self) -> Datastore {
        match self {
            Datastore::Candidate => Datastore::Running,
            other => *other,
        }
    }

    pub const ALL: [Datastore; 3] = [Datastore::Startup, Datastore::Running, Datastore::Candidate];
}

impl std::fmt::Display for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statically-known leaf type of a schema node. `Union` carries its member
/// types so lexical forms can be tried in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LeafType {
    Binary,
    Bits,
    Bool,
    Decimal64,
    Empty,
    Enumeration,
    IdentityRef,
    InstanceId,
    Int8,
    Int16,
    Int32,
    Int64,
    String,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Union(Vec<LeafType>),
}

/// Typed payload of one data element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueData {
    List,
    Container,
    PresenceContainer,
    LeafEmpty,
    Union(String),
    Binary(String),
    Bits(String),
    Bool(bool),
    Decimal64(f64),
    Enum(String),
    IdentityRef(String),
    InstanceId(String),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    String(String),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
}

impl ValueData {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ValueData::List => "list",
            ValueData::Container => "container",
            ValueData::PresenceContainer => "presence-container",
            ValueData::LeafEmpty => "empty-leaf",
            ValueData::Union(_) => "union",
            ValueData::Binary(_) => "binary",
            ValueData::Bits(_) => "bits",
            ValueData::Bool(_) => "bool",
            ValueData::Decimal64(_) => "decimal64",
            ValueData::Enum(_) => "enum",
            ValueData::IdentityRef(_) => "identity-ref",
            ValueData::InstanceId(_) => "instance-id",
            ValueData::Int8(_) => "int8",
            ValueData::Int16(_) => "int16",
            ValueData::Int32(_) => "int32",
            ValueData::Int64(_) => "int64",
            ValueData::String(_) => "string",
            ValueData::Uint8(_) => "uint8",
            ValueData::Uint16(_) => "uint16",
            ValueData::Uint32(_) => "uint32",
            ValueData::Uint64(_) => "uint64",
        }
    }

    /// Canonical lexical form, as stored on disk and compared in list keys.
    pub fn lexical(&self) -> String {
        match self {
            ValueData::List | ValueData::Container | ValueData::PresenceContainer => String::new(),
            ValueData::LeafEmpty => String::new(),
            ValueData::Union(s)
            | ValueData::Binary(s)
            | ValueData::Bits(s)
            | ValueData::Enum(s)
            | ValueData::IdentityRef(s)
            | ValueData::InstanceId(s)
            | ValueData::String(s) => s.clone(),
            ValueData::Bool(b) => b.to_string(),
            ValueData::Decimal64(d) => format!("{d}"),
            ValueData::Int8(v) => v.to_string(),
            ValueData::Int16(v) => v.to_string(),
            ValueData::Int32(v) => v.to_string(),
            ValueData::Int64(v) => v.to_string(),
            ValueData::Uint8(v) => v.to_string(),
            ValueData::Uint16(v) => v.to_string(),
            ValueData::Uint32(v) => v.to_string(),
            ValueData::Uint64(v) => v.to_string(),
        }
    }

    /// Parse a lexical form against a declared leaf type.
    pub fn parse(ty: &LeafType, text: &str) -> Result<ValueData, EngineError> {
        let bad = |what: &str| {
            EngineError::InvalidArg(format!("'{text}' is not a valid {what} value"))
        };
        match ty {
            LeafType::Binary => Ok(ValueData::Binary(text.to_string())),
            LeafType::Bits => Ok(ValueData::Bits(text.to_string())),
            LeafType::Bool => match text {
                "true" => Ok(ValueData::Bool(true)),
                "false" => Ok(ValueData::Bool(false)),
                _ => Err(bad("bool")),
            },
            LeafType::Decimal64 => text
                .parse::<f64>()
                .map(ValueData::Decimal64)
                .map_err(|_| bad("decimal64")),
            LeafType::Empty => {
                if text.is_empty() {
                    Ok(ValueData::LeafEmpty)
                } else {
                    Err(bad("empty"))
                }
            }
            LeafType::Enumeration => Ok(ValueData::Enum(text.to_string())),
            LeafType::IdentityRef => Ok(ValueData::IdentityRef(text.to_string())),
            LeafType::InstanceId => Ok(ValueData::InstanceId(text.to_string())),
            LeafType::Int8 => text.parse().map(ValueData::Int8).map_err(|_| bad("int8")),
            LeafType::Int16 => text.parse().map(ValueData::Int16).map_err(|_| bad("int16")),
            LeafType::Int32 => text.parse().map(ValueData::Int32).map_err(|_| bad("int32")),
            LeafType::Int64 => text.parse().map(ValueData::Int64).map_err(|_| bad("int64")),
            LeafType::String => Ok(ValueData::String(text.to_string())),
            LeafType::Uint8 => text.parse().map(ValueData::Uint8).map_err(|_| bad("uint8")),
            LeafType::Uint16 => text
                .parse()
                .map(ValueData::Uint16)
                .map_err(|_| bad("uint16")),
            LeafType::Uint32 => text
                .parse()
                .map(ValueData::Uint32)
                .map_err(|_| bad("uint32")),
            LeafType::Uint64 => text
                .parse()
                .map(ValueData::Uint64)
                .map_err(|_| bad("uint64")),
            LeafType::Union(members) => {
                for member in members {
                    if let Ok(parsed) = ValueData::parse(member, text) {
                        return Ok(ValueData::Union(parsed.lexical()));
                    }
                }
                Err(bad("union"))
            }
        }
    }

    /// Whether this payload is acceptable for a leaf of the given type.
    pub fn matches_type(&self, ty: &LeafType) -> bool {
        match (ty, self) {
            (LeafType::Binary, ValueData::Binary(_))
            | (LeafType::Bits, ValueData::Bits(_))
            | (LeafType::Bool, ValueData::Bool(_))
            | (LeafType::Decimal64, ValueData::Decimal64(_))
            | (LeafType::Empty, ValueData::LeafEmpty)
            | (LeafType::Enumeration, ValueData::Enum(_))
            | (LeafType::IdentityRef, ValueData::IdentityRef(_))
            | (LeafType::InstanceId, ValueData::InstanceId(_))
            | (LeafType::Int8, ValueData::Int8(_))
            | (LeafType::Int16, ValueData::Int16(_))
            | (LeafType::Int32, ValueData::Int32(_))
            | (LeafType::Int64, ValueData::Int64(_))
            | (LeafType::String, ValueData::String(_))
            | (LeafType::Uint8, ValueData::Uint8(_))
            | (LeafType::Uint16, ValueData::Uint16(_))
            | (LeafType::Uint32, ValueData::Uint32(_))
            | (LeafType::Uint64, ValueData::Uint64(_)) => true,
            (LeafType::Union(_), ValueData::Union(_)) => true,
            (LeafType::Union(members), other) => {
                members.iter().any(|member| other.matches_type(member))
            }
            _ => false,
        }
    }
}

/// One addressed element: the data path, the default flag and the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub xpath: String,
    pub dflt: bool,
    pub data: ValueData,
}

impl Value {
    pub fn new(xpath: impl Into<String>, data: ValueData) -> Self {
        Self {
            xpath: xpath.into(),
            dflt: false,
            data,
        }
    }

    pub fn with_default(mut self, dflt: bool) -> Self {
        self.dflt = dflt;
        self
    }
}
