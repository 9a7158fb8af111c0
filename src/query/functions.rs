use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Integer,
    Float,
    String,
    Boolean,
    Timestamp,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Type {
    pub tag: TypeTag,
    pub nullable: bool,
}

impl Type {
    pub const fn new(tag: TypeTag) -> Self {
        Self { tag, nullable: false }
    }

    pub const fn nullable(tag: TypeTag) -> Self {
        Self { tag, nullable: true }
    }

    /// Numeric tags accept each other at call sites (integers widen to
    /// float); `Any` accepts everything.
    pub fn accepts(&self, other: TypeTag) -> bool {
        if self.tag == TypeTag::Any || other == TypeTag::Any {
            return true;
        }
        if self.tag == other {
            return true;
        }
        matches!(
            (self.tag, other),
            (TypeTag::Float, TypeTag::Integer) | (TypeTag::Integer, TypeTag::Float)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
    Window,
    Fill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == *k,
            Arity::AtLeast(k) => n >= *k,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub name: &'static str,
    pub kind: FunctionKind,
    pub arity: Arity,
    pub params: Vec<Type>,
    pub return_type: Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    UnknownFunction,
    ArityMismatch,
    TypeMismatch,
}

#[derive(Debug, Default)]
pub struct FunctionRegistry {
    signatures: HashMap<&'static str, Signature>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self { signatures: HashMap::new() }
    }

    pub fn register(&mut self, signature: Signature) {
        self.signatures.insert(signature.name, signature);
    }

    pub fn lookup(&self, name: &str) -> Option<&Signature> {
        self.signatures
            .values()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn resolve(&self, name: &str, arg_types: &[Type]) -> Result<&Signature, ResolveError> {
        let sig = self.lookup(name).ok_or(ResolveError::UnknownFunction)?;
        if !sig.arity.accepts(arg_types.len()) {
            return Err(ResolveError::ArityMismatch);
        }
        for (i, arg) in arg_types.iter().enumerate() {
            let expected = sig.params.get(i).or_else(|| sig.params.last());
            if let Some(expected) = expected {
                if !expected.accepts(arg.tag) {
                    return Err(ResolveError::TypeMismatch);
                }
            }
        }
        Ok(sig)
    }

    /// The function set queries can use: aggregates, scalar math/time
    /// helpers, window functions over ordered series, and fill strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let float = Type::new(TypeTag::Float);
        let numeric = Type::new(TypeTag::Any);

        let aggregate = |name, params: Vec<Type>| Signature {
            name,
            kind: FunctionKind::Aggregate,
            arity: Arity::Exact(params.len()),
            params,
            return_type: float,
        };
        for name in ["avg", "sum", "min", "max", "first", "last"] {
            registry.register(aggregate(name, vec![numeric]));
        }
        registry.register(Signature {
            name: "count",
            kind: FunctionKind::Aggregate,
            arity: Arity::Exact(1),
            params: vec![Type::new(TypeTag::Any)],
            return_type: Type::new(TypeTag::Integer),
        });
        registry.register(Signature {
            name: "percentile",
            kind: FunctionKind::Aggregate,
            arity: Arity::Exact(2),
            params: vec![numeric, float],
            return_type: float,
        });

        let scalar_unary = |name| Signature {
            name,
            kind: FunctionKind::Scalar,
            arity: Arity::Exact(1),
            params: vec![numeric],
            return_type: float,
        };
        for name in ["abs", "ceil", "floor", "round", "ln", "sqrt"] {
            registry.register(scalar_unary(name));
        }
        registry.register(Signature {
            name: "pow",
            kind: FunctionKind::Scalar,
            arity: Arity::Exact(2),
            params: vec![numeric, numeric],
            return_type: float,
        });
        registry.register(Signature {
            name: "now",
            kind: FunctionKind::Scalar,
            arity: Arity::Exact(0),
            params: vec![],
            return_type: Type::new(TypeTag::Timestamp),
        });
        registry.register(Signature {
            name: "time_bucket",
            kind: FunctionKind::Scalar,
            arity: Arity::Exact(2),
            params: vec![Type::new(TypeTag::Integer), Type::new(TypeTag::Timestamp)],
            return_type: Type::new(TypeTag::Timestamp),
        });

        let window = |name, arity, params: Vec<Type>| Signature {
            name,
            kind: FunctionKind::Window,
            arity,
            params,
            return_type: float,
        };
        registry.register(window("lag", Arity::AtLeast(1), vec![numeric, Type::new(TypeTag::Integer)]));
        registry.register(window("lead", Arity::AtLeast(1), vec![numeric, Type::new(TypeTag::Integer)]));
        for name in ["rate", "irate", "delta", "integral"] {
            registry.register(window(name, Arity::Exact(1), vec![numeric]));
        }
        registry.register(window("moving_avg", Arity::Exact(2), vec![numeric, Type::new(TypeTag::Integer)]));
        registry.register(window("ema", Arity::Exact(2), vec![numeric, float]));

        registry.register(Signature {
            name: "coalesce",
            kind: FunctionKind::Fill,
            arity: Arity::AtLeast(1),
            params: vec![Type::new(TypeTag::Any)],
            return_type: Type::new(TypeTag::Any),
        });
        registry.register(Signature {
            name: "fill_forward",
            kind: FunctionKind::Fill,
            arity: Arity::Exact(1),
            params: vec![numeric],
            return_type: float,
        });

        registry
    }
}
