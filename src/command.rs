/// Command Builder Module
///
/// Assembles complete statements from table metadata and translated
/// fragments. Every builder method returns a `CommandSpec` whose parameter
/// set holds exactly the values the statement references.
///
/// Parameters referenced in a WHERE fragment but not produced by the
/// statement itself are resolved from the caller's data set; a reference the
/// data cannot satisfy is an `ArgumentError`.
use crate::core::db::{CommandSpec, Dialect, TableMetadata};
use crate::core::value::ParameterSet;
use crate::core::{RelError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Quoted SQL string literal, with `''` escapes
static QUOTED_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid literal pattern"));

/// `@name` parameter reference not preceded by another `@` or word character
static PARAM_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^@\w])@([A-Za-z_][A-Za-z0-9_]*)").expect("valid parameter pattern"));

/// Returns the parameter names a fragment references outside string literals
///
/// Names come back bare (without `@`), in order of first use, deduplicated
/// case-insensitively.
pub fn referenced_params(fragment: &str) -> Vec<String> {
    let code = QUOTED_LITERAL.replace_all(fragment, "''");
    let mut names: Vec<String> = Vec::new();
    for cap in PARAM_REFERENCE.captures_iter(&code) {
        let name = &cap[1];
        if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            names.push(name.to_string());
        }
    }
    names
}

/// Adds every parameter `fragment` references but `params` lacks, reading values from `data`
///
/// # Errors
///
/// `RelError::Argument` when `data` has no value for a referenced name.
pub fn resolve_implicit(params: &mut ParameterSet, fragment: &str, data: &ParameterSet) -> Result<()> {
    for name in referenced_params(fragment) {
        if params.contains(&name) {
            continue;
        }
        match data.get(&name) {
            Some(value) => params.insert(&name, value.clone()),
            None => {
                return Err(RelError::Argument(format!(
                    "no value supplied for @{} referenced in the where clause",
                    name
                )))
            }
        }
    }
    Ok(())
}

/// The pieces of a SELECT statement
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectParts<'a> {
    /// Table to read
    pub table: &'a str,
    /// Select list; empty means `*`
    pub fields: &'a str,
    /// WHERE fragment without the keyword; may be empty
    pub filter: &'a str,
    /// ORDER BY list without the keyword; may be empty
    pub order: &'a str,
    /// Limit the result to one row
    pub single: bool,
}

/// Builds dialect-correct statements
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandBuilder {
    dialect: Dialect,
    no_lock: bool,
}

impl CommandBuilder {
    /// Creates a builder for `dialect` with the read hint enabled
    pub fn new(dialect: Dialect) -> Self {
        CommandBuilder {
            dialect,
            no_lock: true,
        }
    }

    /// Enables or disables the `with(nolock)` read hint
    pub fn with_no_lock(mut self, no_lock: bool) -> Self {
        self.no_lock = no_lock;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn no_lock(&self) -> bool {
        self.no_lock
    }

    /// Read hint appended after a table name in selects
    pub fn read_hint(&self) -> &'static str {
        if self.no_lock && self.dialect.supports_read_hint() {
            " with(nolock)"
        } else {
            ""
        }
    }

    /// `insert into t(cols) values(@params)` over the writable mapped fields present in `data`
    ///
    /// # Arguments
    ///
    /// * `table` - Destination table
    /// * `meta` - Entity metadata
    /// * `data` - Caller data, keyed by property name
    /// * `ignore` - Properties to leave out for this call
    pub fn insert(
        &self,
        table: &str,
        meta: &TableMetadata,
        data: &ParameterSet,
        ignore: &[String],
    ) -> Result<CommandSpec> {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut params = ParameterSet::new();
        for field in meta.mapped().filter(|f| f.is_writable()) {
            if is_ignored(ignore, &field.property) {
                continue;
            }
            if let Some(value) = data.get(&field.property) {
                columns.push(field.column.clone());
                values.push(format!("@{}", field.property));
                params.insert(&field.property, value.clone());
            }
        }
        if columns.is_empty() {
            return Err(RelError::Argument(format!(
                "no insertable fields of {} present in the data",
                meta.type_name
            )));
        }
        Ok(CommandSpec::text(format!(
            "insert into {}({}) values({})",
            table,
            columns.join(","),
            values.join(",")
        ))
        .with_params(params))
    }

    /// Insert into a raw table: every entry of `data` becomes a column
    pub fn insert_raw(&self, table: &str, data: &ParameterSet, ignore: &[String]) -> Result<CommandSpec> {
        let params: ParameterSet = data
            .iter()
            .filter(|(name, _)| !is_ignored(ignore, name))
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        if params.is_empty() {
            return Err(RelError::Argument(format!(
                "no columns to insert into {}",
                table
            )));
        }
        let columns: Vec<&str> = params.iter().map(|(n, _)| n.trim_start_matches('@')).collect();
        Ok(CommandSpec::text(format!(
            "insert into {}({}) values({})",
            table,
            columns.join(","),
            params.names().join(",")
        ))
        .with_params(params))
    }

    /// `update t set A=@A,B=@B where …`
    ///
    /// Sets every writable, non-key mapped field present in `values`; WHERE
    /// parameters are resolved from `data`.
    ///
    /// # Errors
    ///
    /// `RelError::Argument` for an empty WHERE fragment, an empty SET list or
    /// an unresolvable WHERE parameter.
    pub fn update(
        &self,
        table: &str,
        meta: &TableMetadata,
        values: &ParameterSet,
        filter: &str,
        data: &ParameterSet,
        ignore: &[String],
    ) -> Result<CommandSpec> {
        require_filter(filter, "update")?;
        let mut assignments = Vec::new();
        let mut params = ParameterSet::new();
        for field in meta.mapped().filter(|f| f.is_writable() && !f.key) {
            if is_ignored(ignore, &field.property) {
                continue;
            }
            if let Some(value) = values.get(&field.property) {
                assignments.push(format!("{}=@{}", field.column, field.property));
                params.insert(&field.property, value.clone());
            }
        }
        if assignments.is_empty() {
            return Err(RelError::Argument(format!(
                "no updatable fields of {} present in the data",
                meta.type_name
            )));
        }
        resolve_implicit(&mut params, filter, data)?;
        Ok(CommandSpec::text(format!(
            "update {} set {} where {}",
            table,
            assignments.join(","),
            filter
        ))
        .with_params(params))
    }

    /// `delete from t where …`
    pub fn delete(&self, table: &str, filter: &str, data: &ParameterSet) -> Result<CommandSpec> {
        require_filter(filter, "delete")?;
        let mut params = ParameterSet::new();
        resolve_implicit(&mut params, filter, data)?;
        Ok(CommandSpec::text(format!("delete from {} where {}", table, filter)).with_params(params))
    }

    /// `select [top 1] fields from t [with(nolock)] [where …] [order by …] [limit 1]`
    pub fn select(&self, parts: SelectParts<'_>, data: &ParameterSet) -> Result<CommandSpec> {
        let fields = if parts.fields.trim().is_empty() {
            "*"
        } else {
            parts.fields
        };
        let top = if parts.single && self.dialect == Dialect::SqlServer {
            "top 1 "
        } else {
            ""
        };
        let mut sql = format!("select {}{} from {}{}", top, fields, parts.table, self.read_hint());
        push_filter(&mut sql, parts.filter);
        if !parts.order.trim().is_empty() {
            sql.push_str(" order by ");
            sql.push_str(parts.order);
        }
        if parts.single && self.dialect != Dialect::SqlServer {
            sql.push_str(" limit 1");
        }
        self.with_implicit(sql, parts.filter, data)
    }

    /// `select count(*) from t [with(nolock)] [where …]`
    pub fn count(&self, table: &str, filter: &str, data: &ParameterSet) -> Result<CommandSpec> {
        let mut sql = format!("select count(*) from {}{}", table, self.read_hint());
        push_filter(&mut sql, filter);
        self.with_implicit(sql, filter, data)
    }

    /// `select case when exists(select 1 from t … where …) then 1 else 0 end`
    pub fn exists(&self, table: &str, filter: &str, data: &ParameterSet) -> Result<CommandSpec> {
        let mut inner = format!("select 1 from {}{}", table, self.read_hint());
        push_filter(&mut inner, filter);
        let sql = format!("select case when exists({}) then 1 else 0 end", inner);
        self.with_implicit(sql, filter, data)
    }

    /// Single-field scalar of the first matching row
    pub fn first(&self, table: &str, field: &str, filter: &str, data: &ParameterSet) -> Result<CommandSpec> {
        if field.trim().is_empty() || field.contains(',') || field.trim() == "*" {
            return Err(RelError::Argument(format!(
                "first needs exactly one field, got '{}'",
                field
            )));
        }
        self.select(
            SelectParts {
                table,
                fields: field,
                filter,
                order: "",
                single: true,
            },
            data,
        )
    }

    fn with_implicit(&self, sql: String, filter: &str, data: &ParameterSet) -> Result<CommandSpec> {
        let mut params = ParameterSet::new();
        resolve_implicit(&mut params, filter, data)?;
        Ok(CommandSpec::text(sql).with_params(params))
    }
}

fn is_ignored(ignore: &[String], property: &str) -> bool {
    let bare = property.trim_start_matches('@');
    ignore.iter().any(|i| i.trim_start_matches('@').eq_ignore_ascii_case(bare))
}

fn require_filter(filter: &str, statement: &str) -> Result<()> {
    if filter.trim().is_empty() {
        return Err(RelError::Argument(format!(
            "{} requires a non-empty where clause",
            statement
        )));
    }
    Ok(())
}

fn push_filter(sql: &mut String, filter: &str) {
    if !filter.trim().is_empty() {
        sql.push_str(" where ");
        sql.push_str(filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::mapping::{data_params, metadata};
    use crate::core::value::Value;
    use crate::test_utils::Person;

    fn ann() -> ParameterSet {
        let person = Person {
            id: 7,
            name: "Ann".to_string(),
            age: 30,
            ..Default::default()
        };
        data_params(&person, &metadata::<Person>().unwrap()).unwrap()
    }

    #[test]
    fn test_referenced_params_skip_literals() {
        assert_eq!(
            referenced_params("Name = @Name and Note = 'mail me @home' and Age > @age or Id = @NAME"),
            vec!["Name".to_string(), "age".to_string()]
        );
        assert_eq!(referenced_params("x = 'it''s @x' and y = @@ROWCOUNT"), Vec::<String>::new());
        assert_eq!(referenced_params("@First=1"), vec!["First".to_string()]);
    }

    #[test]
    fn test_insert_skips_generated_and_ignored() {
        let meta = metadata::<Person>().unwrap();
        let spec = CommandBuilder::new(Dialect::Sqlite)
            .insert("people", &meta, &ann(), &["Email".to_string()])
            .unwrap();
        insta::assert_snapshot!(spec.sql, @"insert into people(Name,Age,CreatedAt) values(@Name,@Age,@CreatedAt)");
        assert_eq!(spec.params.names(), vec!["@Name", "@Age", "@CreatedAt"]);
        assert!(!spec.params.contains("Id"));
    }

    #[test]
    fn test_insert_raw_uses_every_entry() {
        let data = ParameterSet::new().with_value("Name", "Ann").with_value("Age", 3);
        let spec = CommandBuilder::new(Dialect::Sqlite)
            .insert_raw("archive", &data, &[])
            .unwrap();
        insta::assert_snapshot!(spec.sql, @"insert into archive(Name,Age) values(@Name,@Age)");
        assert!(matches!(
            CommandBuilder::new(Dialect::Sqlite).insert_raw("archive", &ParameterSet::new(), &[]),
            Err(RelError::Argument(_))
        ));
    }

    #[test]
    fn test_update_requires_where_and_resolves_params() {
        let meta = metadata::<Person>().unwrap();
        let builder = CommandBuilder::new(Dialect::Sqlite);
        let data = ParameterSet::new().with_value("Age", 31).with_value("Id", 7);

        let spec = builder.update("people", &meta, &data, "Id = @Id", &data, &[]).unwrap();
        insta::assert_snapshot!(spec.sql, @"update people set Age=@Age where Id = @Id");
        assert_eq!(spec.params.get("Id"), Some(&Value::Integer(7)));

        assert!(matches!(
            builder.update("people", &meta, &data, "  ", &data, &[]),
            Err(RelError::Argument(_))
        ));
        assert!(matches!(
            builder.update("people", &meta, &data, "Name = @Name", &data, &[]),
            Err(RelError::Argument(_))
        ));
        assert!(matches!(
            builder.update("people", &meta, &ParameterSet::new(), "Id = @Id", &data, &[]),
            Err(RelError::Argument(_))
        ));
    }

    #[test]
    fn test_delete_requires_where() {
        let builder = CommandBuilder::new(Dialect::Sqlite);
        let spec = builder.delete("people", "Id = @Id", &ann()).unwrap();
        insta::assert_snapshot!(spec.sql, @"delete from people where Id = @Id");
        assert_eq!(spec.params.names(), vec!["@Id"]);
        assert!(matches!(
            builder.delete("people", "", &ann()),
            Err(RelError::Argument(_))
        ));
    }

    #[test]
    fn test_select_variants_per_dialect() {
        let parts = SelectParts {
            table: "people",
            fields: "Name,Age",
            filter: "Age >= @Age",
            order: "Age desc",
            single: true,
        };
        let data = ann();

        let mssql = CommandBuilder::new(Dialect::SqlServer).select(parts, &data).unwrap();
        insta::assert_snapshot!(mssql.sql, @"select top 1 Name,Age from people with(nolock) where Age >= @Age order by Age desc");

        let unlocked = CommandBuilder::new(Dialect::SqlServer)
            .with_no_lock(false)
            .select(SelectParts { single: false, ..parts }, &data)
            .unwrap();
        insta::assert_snapshot!(unlocked.sql, @"select Name,Age from people where Age >= @Age order by Age desc");

        let sqlite = CommandBuilder::new(Dialect::Sqlite)
            .select(SelectParts { fields: "", ..parts }, &data)
            .unwrap();
        insta::assert_snapshot!(sqlite.sql, @"select * from people where Age >= @Age order by Age desc limit 1");
        assert_eq!(sqlite.params.get("Age"), Some(&Value::Integer(30)));
    }

    #[test]
    fn test_count_exists_and_first() {
        let builder = CommandBuilder::new(Dialect::SqlServer);
        let data = ann();

        let count = builder.count("people", "", &data).unwrap();
        insta::assert_snapshot!(count.sql, @"select count(*) from people with(nolock)");
        assert!(count.params.is_empty());

        let exists = builder.exists("people", "Name = @Name", &data).unwrap();
        insta::assert_snapshot!(exists.sql, @"select case when exists(select 1 from people with(nolock) where Name = @Name) then 1 else 0 end");

        let first = CommandBuilder::new(Dialect::MySql)
            .first("people", "Age", "Name = @Name", &data)
            .unwrap();
        insta::assert_snapshot!(first.sql, @"select Age from people where Name = @Name limit 1");
        assert!(matches!(
            builder.first("people", "Name,Age", "", &data),
            Err(RelError::Argument(_))
        ));
    }
}
