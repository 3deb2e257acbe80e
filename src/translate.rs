/// Expression Translation Module
///
/// Pure translations of the `expr` AST into SQL fragments for one entity's
/// metadata and one dialect:
///
/// - `translate_where`: predicate → WHERE fragment (without the keyword)
/// - `translate_projection`: projection → select list
/// - `translate_order`: ordering → ORDER BY list (without the keyword)
///
/// Field paths resolve to column names; parameters render as `@Name`;
/// constants render as escaped literals, folded where they combine.
use crate::core::db::{Dialect, TableMetadata};
use crate::core::value::Value;
use crate::core::{RelError, Result};
use crate::expr::{ArithOp, CompareOp, Direction, LikeKind, Operand, OrderBy, Predicate, Projection};

/// Deepest predicate/operand nesting accepted
pub const MAX_DEPTH: usize = 64;

/// Escape character used in LIKE patterns built from constants
const LIKE_ESCAPE: char = '!';

/// Translates a predicate into a WHERE fragment
///
/// # Arguments
///
/// * `pred` - Filter expression
/// * `meta` - Metadata of the entity the filter applies to
/// * `dialect` - Target dialect
///
/// # Returns
///
/// The fragment without the `where` keyword, or `RelError::Translation` for
/// shapes outside the supported grammar.
pub fn translate_where(pred: &Predicate, meta: &TableMetadata, dialect: Dialect) -> Result<String> {
    let translator = Translator::new(meta, dialect);
    let sql = translator.predicate(pred, 0)?;
    Ok(translator.strip_marker(&sql))
}

/// Translates a projection into a select list; an empty projection is `*`
pub fn translate_projection(proj: &Projection, meta: &TableMetadata, dialect: Dialect) -> Result<String> {
    if proj.is_empty() {
        return Ok("*".to_string());
    }
    let translator = Translator::new(meta, dialect);
    let columns = proj
        .items
        .iter()
        .map(|item| translator.field_only(item, "projection"))
        .collect::<Result<Vec<_>>>()?;
    Ok(translator.strip_marker(&columns.join(",")))
}

/// Translates an ordering into an ORDER BY list; an empty ordering is `""`
pub fn translate_order(order: &OrderBy, meta: &TableMetadata, dialect: Dialect) -> Result<String> {
    let translator = Translator::new(meta, dialect);
    let items = order
        .items
        .iter()
        .map(|(item, direction)| {
            let column = translator.field_only(item, "order")?;
            Ok(match direction {
                Direction::Asc => format!("{} asc", column),
                Direction::Desc => format!("{} desc", column),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(translator.strip_marker(&items.join(",")))
}

/// Renders a constant as a SQL literal for `dialect`
pub fn render_literal(value: &Value, dialect: Dialect) -> Result<String> {
    match value {
        Value::Null => Ok("null".to_string()),
        Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Real(f) if f.is_finite() => Ok(f.to_string()),
        Value::Real(f) => Err(RelError::Translation(format!(
            "non-finite constant {} has no SQL literal",
            f
        ))),
        Value::Text(s) => {
            let mut escaped = s.replace('\'', "''");
            if dialect == Dialect::MySql {
                escaped = escaped.replace('\\', "\\\\");
            }
            if dialect == Dialect::SqlServer && !s.is_ascii() {
                Ok(format!("N'{}'", escaped))
            } else {
                Ok(format!("'{}'", escaped))
            }
        }
        Value::Blob(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
            if dialect == Dialect::SqlServer {
                Ok(format!("0x{}", hex))
            } else {
                Ok(format!("X'{}'", hex))
            }
        }
    }
}

/// A rendered operand
enum Rendered {
    /// SQL that references a column or parameter
    Sql(String),
    /// A constant, rendered on use
    Const(Value),
}

impl Rendered {
    fn sql(self, dialect: Dialect) -> Result<String> {
        match self {
            Rendered::Sql(sql) => Ok(sql),
            Rendered::Const(value) => render_literal(&value, dialect),
        }
    }
}

struct Translator<'m> {
    meta: &'m TableMetadata,
    dialect: Dialect,
    marker: String,
}

impl<'m> Translator<'m> {
    fn new(meta: &'m TableMetadata, dialect: Dialect) -> Self {
        Translator {
            meta,
            dialect,
            marker: format!("[{}].", meta.type_name),
        }
    }

    /// Removes qualification markers that sit outside string literals
    fn strip_marker(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut in_literal = false;
        let mut rest = sql;
        while let Some(c) = rest.chars().next() {
            if !in_literal && rest.starts_with(&self.marker) {
                rest = &rest[self.marker.len()..];
                continue;
            }
            if c == '\'' {
                in_literal = !in_literal;
            }
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
        out
    }

    fn column(&self, path: &str) -> Result<String> {
        let segments: Vec<&str> = path.split('.').map(str::trim).collect();
        let (qualified, name) = match segments.as_slice() {
            [name] => (false, *name),
            [head, name] if self.meta.is_qualifier(head) => (true, *name),
            [head, _] => {
                return Err(RelError::Translation(format!(
                    "'{}' does not qualify {}",
                    head, self.meta.type_name
                )))
            }
            _ => {
                return Err(RelError::Translation(format!(
                    "member chain '{}' is deeper than Type.Field",
                    path
                )))
            }
        };
        let field = self.meta.field(name).ok_or_else(|| {
            RelError::Translation(format!(
                "unknown field '{}' on {}",
                name, self.meta.type_name
            ))
        })?;
        if qualified {
            Ok(format!("{}{}", self.marker, field.column))
        } else {
            Ok(field.column.clone())
        }
    }

    fn field_only(&self, item: &Operand, context: &str) -> Result<String> {
        match item {
            Operand::Field(path) => self.column(path),
            other => Err(RelError::Translation(format!(
                "{} items must be fields, got {:?}",
                context, other
            ))),
        }
    }

    fn param(&self, name: &str) -> Result<String> {
        self.meta
            .field(name)
            .map(|f| format!("@{}", f.property))
            .ok_or_else(|| {
                RelError::Translation(format!(
                    "parameter @{} does not name a mapped field of {}",
                    name, self.meta.type_name
                ))
            })
    }

    fn check_depth(depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(RelError::Translation(format!(
                "expression nested deeper than {} levels",
                MAX_DEPTH
            )));
        }
        Ok(())
    }

    fn operand(&self, operand: &Operand, depth: usize) -> Result<Rendered> {
        Self::check_depth(depth)?;
        match operand {
            Operand::Field(path) => Ok(Rendered::Sql(self.column(path)?)),
            Operand::Param(name) => Ok(Rendered::Sql(self.param(name)?)),
            Operand::Literal(value) => Ok(Rendered::Const(value.clone())),
            Operand::Arith { op, lhs, rhs } => {
                let lhs = self.operand(lhs, depth + 1)?;
                let rhs = self.operand(rhs, depth + 1)?;
                match (lhs, rhs) {
                    (Rendered::Const(a), Rendered::Const(b)) => Ok(Rendered::Const(fold(*op, &a, &b)?)),
                    (lhs, rhs) => Ok(Rendered::Sql(format!(
                        "({} {} {})",
                        lhs.sql(self.dialect)?,
                        arith_symbol(*op),
                        rhs.sql(self.dialect)?
                    ))),
                }
            }
            Operand::Neg(inner) => match self.operand(inner, depth + 1)? {
                Rendered::Const(value) => Ok(Rendered::Const(negate(&value)?)),
                Rendered::Sql(sql) => Ok(Rendered::Sql(format!("-({})", sql))),
            },
        }
    }

    /// Renders an operand that must reference a field or parameter
    fn reference(&self, operand: &Operand, depth: usize, context: &str) -> Result<String> {
        match self.operand(operand, depth)? {
            Rendered::Sql(sql) => Ok(sql),
            Rendered::Const(value) => Err(RelError::Translation(format!(
                "{} needs a field or parameter, got constant {}",
                context, value
            ))),
        }
    }

    fn predicate(&self, pred: &Predicate, depth: usize) -> Result<String> {
        Self::check_depth(depth)?;
        match pred {
            Predicate::Compare { op, lhs, rhs } => self.compare(*op, lhs, rhs, depth),
            Predicate::Like {
                kind,
                target,
                pattern,
            } => self.like(*kind, target, pattern, depth),
            Predicate::In {
                target,
                values,
                negated,
            } => {
                if values.is_empty() {
                    return Err(RelError::Translation("IN list is empty".to_string()));
                }
                let target = self.reference(target, depth + 1, "IN")?;
                let items = values
                    .iter()
                    .map(|v| match self.operand(v, depth + 1)? {
                        Rendered::Const(Value::Null) => Err(RelError::Translation(
                            "IN list cannot contain null".to_string(),
                        )),
                        rendered => rendered.sql(self.dialect),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let keyword = if *negated { "not in" } else { "in" };
                Ok(format!("{} {} ({})", target, keyword, items.join(",")))
            }
            Predicate::IsNull { target, negated } => {
                let target = self.reference(target, depth + 1, "null test")?;
                let keyword = if *negated { "is not null" } else { "is null" };
                Ok(format!("{} {}", target, keyword))
            }
            Predicate::And(lhs, rhs) => Ok(format!(
                "({} and {})",
                self.predicate(lhs, depth + 1)?,
                self.predicate(rhs, depth + 1)?
            )),
            Predicate::Or(lhs, rhs) => Ok(format!(
                "({} or {})",
                self.predicate(lhs, depth + 1)?,
                self.predicate(rhs, depth + 1)?
            )),
            Predicate::Not(inner) => Ok(format!("not ({})", self.predicate(inner, depth + 1)?)),
        }
    }

    fn compare(&self, op: CompareOp, lhs: &Operand, rhs: &Operand, depth: usize) -> Result<String> {
        let lhs = self.operand(lhs, depth + 1)?;
        let rhs = self.operand(rhs, depth + 1)?;
        match (lhs, rhs) {
            (Rendered::Const(a), Rendered::Const(b)) => Err(RelError::Translation(format!(
                "comparison of constants {} and {} references no field or parameter",
                a, b
            ))),
            (Rendered::Sql(sql), Rendered::Const(Value::Null))
            | (Rendered::Const(Value::Null), Rendered::Sql(sql)) => match op {
                CompareOp::Eq => Ok(format!("{} is null", sql)),
                CompareOp::Ne => Ok(format!("{} is not null", sql)),
                other => Err(RelError::Translation(format!(
                    "{:?} comparison against null",
                    other
                ))),
            },
            (lhs, rhs) => Ok(format!(
                "{} {} {}",
                lhs.sql(self.dialect)?,
                compare_symbol(op),
                rhs.sql(self.dialect)?
            )),
        }
    }

    fn like(&self, kind: LikeKind, target: &Operand, pattern: &Operand, depth: usize) -> Result<String> {
        let target = self.reference(target, depth + 1, "LIKE")?;
        match self.operand(pattern, depth + 1)? {
            Rendered::Const(Value::Text(text)) => {
                let (escaped, needs_escape) = escape_like(&text, self.dialect);
                let pattern = match kind {
                    LikeKind::Contains => format!("%{}%", escaped),
                    LikeKind::StartsWith => format!("{}%", escaped),
                    LikeKind::EndsWith => format!("%{}", escaped),
                };
                let literal = render_literal(&Value::Text(pattern), self.dialect)?;
                if needs_escape {
                    Ok(format!("{} like {} escape '{}'", target, literal, LIKE_ESCAPE))
                } else {
                    Ok(format!("{} like {}", target, literal))
                }
            }
            Rendered::Const(other) => Err(RelError::Translation(format!(
                "LIKE pattern must be text, got {}",
                other
            ))),
            Rendered::Sql(sql) => Ok(format!("{} like {}", target, self.concat_pattern(kind, &sql))),
        }
    }

    /// Wraps a runtime pattern in wildcards with the dialect's concatenation
    fn concat_pattern(&self, kind: LikeKind, sql: &str) -> String {
        let (prefix, suffix) = match kind {
            LikeKind::Contains => (true, true),
            LikeKind::StartsWith => (false, true),
            LikeKind::EndsWith => (true, false),
        };
        match self.dialect {
            Dialect::MySql => {
                let mut parts = Vec::new();
                if prefix {
                    parts.push("'%'");
                }
                parts.push(sql);
                if suffix {
                    parts.push("'%'");
                }
                format!("concat({})", parts.join(","))
            }
            Dialect::SqlServer | Dialect::Sqlite => {
                let op = if self.dialect == Dialect::SqlServer { " + " } else { " || " };
                let mut out = String::new();
                if prefix {
                    out.push_str("'%'");
                    out.push_str(op);
                }
                out.push_str(sql);
                if suffix {
                    out.push_str(op);
                    out.push_str("'%'");
                }
                out
            }
        }
    }
}

/// Escapes LIKE wildcards in a constant pattern
fn escape_like(text: &str, dialect: Dialect) -> (String, bool) {
    let mut out = String::with_capacity(text.len());
    let mut escaped = false;
    for c in text.chars() {
        let special = c == '%' || c == '_' || c == LIKE_ESCAPE || (c == '[' && dialect == Dialect::SqlServer);
        if special {
            out.push(LIKE_ESCAPE);
            escaped = true;
        }
        out.push(c);
    }
    (out, escaped)
}

fn compare_symbol(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "<>",
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
    }
}

fn arith_symbol(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "+",
        ArithOp::Sub => "-",
        ArithOp::Mul => "*",
        ArithOp::Div => "/",
    }
}

/// Folds arithmetic over two constants
fn fold(op: ArithOp, a: &Value, b: &Value) -> Result<Value> {
    let overflow = || RelError::Translation(format!("constant {} {} {} overflows", a, arith_symbol(op), b));
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => {
            let result = match op {
                ArithOp::Add => x.checked_add(*y),
                ArithOp::Sub => x.checked_sub(*y),
                ArithOp::Mul => x.checked_mul(*y),
                ArithOp::Div => {
                    if *y == 0 {
                        return Err(RelError::Translation("constant division by zero".to_string()));
                    }
                    x.checked_div(*y)
                }
            };
            result.map(Value::Integer).ok_or_else(overflow)
        }
        (Value::Integer(_) | Value::Real(_), Value::Integer(_) | Value::Real(_)) => {
            let x = as_real(a);
            let y = as_real(b);
            if op == ArithOp::Div && y == 0.0 {
                return Err(RelError::Translation("constant division by zero".to_string()));
            }
            let result = match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
            };
            if result.is_finite() {
                Ok(Value::Real(result))
            } else {
                Err(overflow())
            }
        }
        _ => Err(RelError::Translation(format!(
            "cannot fold {} {} {}: operands are not numeric",
            a,
            arith_symbol(op),
            b
        ))),
    }
}

fn as_real(v: &Value) -> f64 {
    match v {
        Value::Integer(i) => *i as f64,
        Value::Real(f) => *f,
        _ => f64::NAN,
    }
}

fn negate(value: &Value) -> Result<Value> {
    match value {
        Value::Integer(i) => i
            .checked_neg()
            .map(Value::Integer)
            .ok_or_else(|| RelError::Translation(format!("negating {} overflows", i))),
        Value::Real(f) => Ok(Value::Real(-f)),
        other => Err(RelError::Translation(format!("cannot negate {}", other))),
    }
}
