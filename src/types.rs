use std::fmt;

/// Scalar type of a flattened column.
///
/// `Object` and `Array` mark interior nodes during key discovery; they never
/// survive into the final projection. `Json` is assigned to collapsed
/// high-cardinality subtrees and is terminal: once a column is `Json` it
/// stays `Json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Type {
    #[default]
    Absent,
    Null,
    Bool,
    Int,
    Float,
    String,
    Json,
    Object,
    Array,
}

impl Type {
    /// Merge an observed type into the accumulated one.
    ///
    /// Total over all variants: `Absent` yields to anything, `Null` is
    /// absorbed by any concrete type, `Int ⊕ Float = Float`, a `Bool` mixed
    /// with a non-bool widens to `String`, `Json` absorbs in both
    /// directions, and any remaining mismatch degrades to `String`.
    pub fn merge(self, u: Type) -> Type {
        if self == Type::Absent {
            return u;
        }

        if u == Type::Absent || self == u {
            return self;
        }

        if self == Type::Null {
            return u;
        }

        if u == Type::Null {
            return self;
        }

        if self == Type::Json || u == Type::Json {
            return Type::Json;
        }

        if (self == Type::Int && u == Type::Float) || (self == Type::Float && u == Type::Int) {
            return Type::Float;
        }

        Type::String
    }

    pub fn is_container(self) -> bool {
        matches!(self, Type::Object | Type::Array)
    }

    pub fn name(self) -> &'static str {
        match self {
            Type::Absent => "",
            Type::Null => "null",
            Type::Bool => "bool",
            Type::Int => "int",
            Type::Float => "float",
            Type::String => "string",
            Type::Json => "json",
            Type::Object => "object",
            Type::Array => "array",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One cell of a flattened row.
///
/// Numbers carry the raw digits from the input so integers beyond 64-bit
/// float precision survive verbatim. `dst` names the transpose partition the
/// value belongs to, empty for main-table values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Value {
    pub scalar: Scalar,
    pub dst: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Scalar {
    #[default]
    Absent,
    Null,
    Bool(bool),
    Number {
        value: f64,
        raw: String,
    },
    String(String),
}

impl Value {
    pub fn absent() -> Self {
        Value::default()
    }

    pub fn null() -> Self {
        Value { scalar: Scalar::Null, dst: None }
    }

    pub fn bool(b: bool) -> Self {
        Value { scalar: Scalar::Bool(b), dst: None }
    }

    pub fn number(value: f64, raw: impl Into<String>) -> Self {
        Value { scalar: Scalar::Number { value, raw: raw.into() }, dst: None }
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value { scalar: Scalar::String(s.into()), dst: None }
    }

    pub fn ty(&self) -> Type {
        match &self.scalar {
            Scalar::Absent => Type::Absent,
            Scalar::Null => Type::Null,
            Scalar::Bool(_) => Type::Bool,
            Scalar::Number { .. } => Type::Float,
            Scalar::String(_) => Type::String,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self.scalar, Scalar::Absent)
    }

    /// Render the value for tabular output.
    pub fn format(&self) -> String {
        match &self.scalar {
            Scalar::String(s) => s.clone(),
            Scalar::Number { value, raw } => {
                if raw.is_empty() {
                    format!("{}", value)
                } else {
                    raw.clone()
                }
            }
            Scalar::Bool(b) => b.to_string(),
            Scalar::Null => "NULL".to_string(),
            Scalar::Absent => "ABSENT".to_string(),
        }
    }

    pub fn clear(&mut self) {
        self.scalar = Scalar::Absent;
        self.dst = None;
    }
}
