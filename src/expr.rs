/// Query Expression Module
///
/// A small typed AST for filters, projections and orderings. Expressions are
/// built with `field`, `param` and `lit` and combined with comparison and
/// logical methods:
///
/// ```ignore
/// let adults = field("Age").ge(18).and(field("Email").is_not_null());
/// let named = field("Name").starts_with(param("Name"));
/// ```
///
/// Expressions are translated to SQL by the `translate` module.
use crate::core::value::Value;
use std::ops;

/// Arithmetic operators over operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Pattern position for LIKE predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeKind {
    Contains,
    StartsWith,
    EndsWith,
}

/// A value-producing expression
#[derive(Debug, Clone)]
pub enum Operand {
    /// Field path, either `Property` or `Type.Property`
    Field(String),
    /// Named parameter, bound from the call's data
    Param(String),
    /// Constant
    Literal(Value),
    /// Binary arithmetic
    Arith {
        op: ArithOp,
        lhs: Box<Operand>,
        rhs: Box<Operand>,
    },
    /// Arithmetic negation
    Neg(Box<Operand>),
}

/// A boolean filter expression
#[derive(Debug, Clone)]
pub enum Predicate {
    Compare {
        op: CompareOp,
        lhs: Operand,
        rhs: Operand,
    },
    Like {
        kind: LikeKind,
        target: Operand,
        pattern: Operand,
    },
    In {
        target: Operand,
        values: Vec<Operand>,
        negated: bool,
    },
    IsNull {
        target: Operand,
        negated: bool,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

/// A field reference
pub fn field(path: &str) -> Operand {
    Operand::Field(path.to_string())
}

/// A named parameter; it must name a mapped field
pub fn param(name: &str) -> Operand {
    Operand::Param(name.trim_start_matches('@').to_string())
}

/// A constant
pub fn lit(value: impl Into<Value>) -> Operand {
    Operand::Literal(value.into())
}

impl Operand {
    fn compare(self, op: CompareOp, rhs: impl Into<Operand>) -> Predicate {
        Predicate::Compare {
            op,
            lhs: self,
            rhs: rhs.into(),
        }
    }

    pub fn eq(self, rhs: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Eq, rhs)
    }

    pub fn ne(self, rhs: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Ne, rhs)
    }

    pub fn lt(self, rhs: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Lt, rhs)
    }

    pub fn le(self, rhs: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Le, rhs)
    }

    pub fn gt(self, rhs: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Gt, rhs)
    }

    pub fn ge(self, rhs: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Ge, rhs)
    }

    fn like(self, kind: LikeKind, pattern: impl Into<Operand>) -> Predicate {
        Predicate::Like {
            kind,
            target: self,
            pattern: pattern.into(),
        }
    }

    /// `target like '%pattern%'`
    pub fn contains(self, pattern: impl Into<Operand>) -> Predicate {
        self.like(LikeKind::Contains, pattern)
    }

    /// `target like 'pattern%'`
    pub fn starts_with(self, pattern: impl Into<Operand>) -> Predicate {
        self.like(LikeKind::StartsWith, pattern)
    }

    /// `target like '%pattern'`
    pub fn ends_with(self, pattern: impl Into<Operand>) -> Predicate {
        self.like(LikeKind::EndsWith, pattern)
    }

    pub fn is_null(self) -> Predicate {
        Predicate::IsNull {
            target: self,
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Predicate {
        Predicate::IsNull {
            target: self,
            negated: true,
        }
    }

    /// `target in (values...)`
    pub fn in_list<I, V>(self, values: I) -> Predicate
    where
        I: IntoIterator<Item = V>,
        V: Into<Operand>,
    {
        Predicate::In {
            target: self,
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    /// `target not in (values...)`
    pub fn not_in_list<I, V>(self, values: I) -> Predicate
    where
        I: IntoIterator<Item = V>,
        V: Into<Operand>,
    {
        Predicate::In {
            target: self,
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    fn arith(self, op: ArithOp, rhs: Operand) -> Operand {
        Operand::Arith {
            op,
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }
}

impl Predicate {
    pub fn and(self, rhs: Predicate) -> Predicate {
        Predicate::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Predicate) -> Predicate {
        Predicate::Or(Box::new(self), Box::new(rhs))
    }

    /// Combines predicates with `and`; `None` when the list is empty
    pub fn all<I: IntoIterator<Item = Predicate>>(preds: I) -> Option<Predicate> {
        preds.into_iter().reduce(Predicate::and)
    }
}

impl ops::BitAnd for Predicate {
    type Output = Predicate;

    fn bitand(self, rhs: Predicate) -> Predicate {
        self.and(rhs)
    }
}

impl ops::BitOr for Predicate {
    type Output = Predicate;

    fn bitor(self, rhs: Predicate) -> Predicate {
        self.or(rhs)
    }
}

impl ops::Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }
}

macro_rules! arith_ops {
    ($($trait:ident :: $method:ident => $op:ident),*) => {
        $(
            impl<R: Into<Operand>> ops::$trait<R> for Operand {
                type Output = Operand;

                fn $method(self, rhs: R) -> Operand {
                    self.arith(ArithOp::$op, rhs.into())
                }
            }
        )*
    };
}

arith_ops!(Add::add => Add, Sub::sub => Sub, Mul::mul => Mul, Div::div => Div);

impl ops::Neg for Operand {
    type Output = Operand;

    fn neg(self) -> Operand {
        Operand::Neg(Box::new(self))
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Literal(v)
    }
}

macro_rules! operand_from_literal {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Operand {
                fn from(v: $ty) -> Self {
                    Operand::Literal(Value::from(v))
                }
            }
        )*
    };
}

operand_from_literal!(bool, i8, i16, i32, i64, u8, u16, u32, f32, f64, &str, String, Vec<u8>);

impl<T: Into<Value>> From<Option<T>> for Operand {
    fn from(v: Option<T>) -> Self {
        Operand::Literal(Value::from(v))
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// An explicit list of selected fields
#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub items: Vec<Operand>,
}

impl Projection {
    /// Projects the named fields in order
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Projection {
            items: names.into_iter().map(|n| field(n.as_ref())).collect(),
        }
    }

    /// Projects arbitrary operands; only field operands translate
    pub fn of(items: Vec<Operand>) -> Self {
        Projection { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Ordering with an explicit direction per item
#[derive(Debug, Clone, Default)]
pub struct OrderBy {
    pub items: Vec<(Operand, Direction)>,
}

impl OrderBy {
    pub fn asc(path: &str) -> Self {
        OrderBy::default().then_asc(path)
    }

    pub fn desc(path: &str) -> Self {
        OrderBy::default().then_desc(path)
    }

    /// Orders by an arbitrary operand; only field operands translate
    pub fn by(item: Operand, direction: Direction) -> Self {
        OrderBy {
            items: vec![(item, direction)],
        }
    }

    pub fn then_asc(mut self, path: &str) -> Self {
        self.items.push((field(path), Direction::Asc));
        self
    }

    pub fn then_desc(mut self, path: &str) -> Self {
        self.items.push((field(path), Direction::Desc));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
