/// Pagination Module
///
/// Pages are 1-based. On SqlServer a single script computes the total row
/// count, the page count and the row window, reporting both counters through
/// output parameters. Other dialects run the same `row_number()` window and a
/// separate count on the same connection and compute the page count here.
use crate::command::{resolve_implicit, CommandBuilder};
use crate::core::db::mapping;
use crate::core::db::{CommandSpec, Dialect, Entity, Executor};
use crate::core::value::{ParameterSet, RowSet, Value};
use crate::core::{RelError, Result};
use crate::crud::Query;
use serde::Serialize;

/// Default name of the page-count output parameter
pub const PAGE_COUNT: &str = "PageCount";
/// Default name of the total-count output parameter
pub const TOTAL_COUNT: &str = "TotalCount";

/// One page of a paginated read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number
    pub index: i64,
    /// Rows per page
    pub size: i64,
    pub page_count_name: String,
    pub total_count_name: String,
}

impl PageRequest {
    pub fn new(index: i64, size: i64) -> Self {
        PageRequest {
            index,
            size,
            page_count_name: PAGE_COUNT.to_string(),
            total_count_name: TOTAL_COUNT.to_string(),
        }
    }

    /// Renames the page-count and total-count output parameters
    pub fn output_names(mut self, page_count: &str, total_count: &str) -> Self {
        self.page_count_name = page_count.trim_start_matches('@').to_string();
        self.total_count_name = total_count.trim_start_matches('@').to_string();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.size <= 0 {
            return Err(RelError::Argument(format!(
                "page size must be positive, got {}",
                self.size
            )));
        }
        if self.index < 1 {
            return Err(RelError::Argument(format!(
                "page index starts at 1, got {}",
                self.index
            )));
        }
        if self.index.checked_mul(self.size).is_none() {
            return Err(RelError::Argument(format!(
                "page {} of size {} lies beyond the addressable rows",
                self.index, self.size
            )));
        }
        Ok(())
    }
}

/// Rows of one page plus the counters over the whole filtered set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaginationResult<T> {
    pub rows: Vec<T>,
    pub page_count: i64,
    pub total_count: i64,
}

/// `ceil(total / size)`; zero rows give zero pages
pub fn page_count(total: i64, size: i64) -> i64 {
    if total <= 0 || size <= 0 {
        0
    } else {
        total / size + i64::from(total % size != 0)
    }
}

/// Source of a paginated read expressed as SQL fragments
#[derive(Debug, Clone, Copy, Default)]
pub struct PageSource<'a> {
    /// Main table
    pub table: &'a str,
    /// Key column, used for the default `<key> desc` order
    pub key: &'a str,
    /// Select list; empty means every column
    pub fields: &'a str,
    /// WHERE fragment without the keyword; may be empty
    pub filter: &'a str,
    /// ORDER BY list without the keyword; may be empty
    pub order: &'a str,
    /// Join clause placed after the main table, e.g. `inner join b on …`
    pub join: &'a str,
}

/// Statements that produce one page
#[derive(Debug, Clone, PartialEq)]
pub enum PagePlan {
    /// Single script; counters come back as output parameters
    Script(CommandSpec),
    /// Row window plus a separate count
    Window { rows: CommandSpec, count: CommandSpec },
}

impl CommandBuilder {
    /// Builds the statements for one page of `source`
    ///
    /// # Arguments
    ///
    /// * `source` - Table, key and fragments to page over
    /// * `request` - Page index, size and output names
    /// * `data` - Values for parameters the filter references
    ///
    /// # Errors
    ///
    /// `RelError::Argument` for an invalid page, a missing order with no key
    /// to fall back on, or an unresolvable filter parameter.
    pub fn page(&self, source: PageSource<'_>, request: &PageRequest, data: &ParameterSet) -> Result<PagePlan> {
        request.validate()?;
        let order = if source.order.trim().is_empty() {
            if source.key.trim().is_empty() {
                return Err(RelError::Argument(format!(
                    "paging {} needs an order or a key field",
                    source.table
                )));
            }
            format!("{} desc", source.key)
        } else {
            source.order.to_string()
        };
        let inner_fields = if source.fields.trim().is_empty() {
            format!("{}.*", source.table)
        } else {
            source.fields.to_string()
        };
        let outer_fields = if source.fields.trim().is_empty() {
            "*"
        } else {
            source.fields
        };

        let mut from = format!("{}{}", source.table, self.read_hint());
        if !source.join.trim().is_empty() {
            from.push(' ');
            from.push_str(source.join.trim());
        }
        let mut where_clause = String::new();
        if !source.filter.trim().is_empty() {
            where_clause.push_str(" where ");
            where_clause.push_str(source.filter);
        }

        let window = format!(
            "select {} from (select row_number() over(order by {}) as RowNums,{} from {}{}) as T \
             where RowNums between (@PageIndex-1)*@PageSize+1 and @PageIndex*@PageSize order by RowNums",
            outer_fields, order, inner_fields, from, where_clause
        );

        let mut params = ParameterSet::new()
            .with_value("PageIndex", request.index)
            .with_value("PageSize", request.size);
        resolve_implicit(&mut params, source.filter, data)?;

        if self.dialect() == Dialect::SqlServer {
            let total = &request.total_count_name;
            let pages = &request.page_count_name;
            let script = format!(
                "select @{total} = count(*) from {from}{where_clause};\n\
                 set @{pages} = ceiling(convert(float,@{total})/@PageSize);\n\
                 {window}",
                total = total,
                pages = pages,
                from = from,
                where_clause = where_clause,
                window = window
            );
            return Ok(PagePlan::Script(
                CommandSpec::text(script)
                    .with_params(params)
                    .with_output(pages)
                    .with_output(total),
            ));
        }

        let mut count_params = ParameterSet::new();
        resolve_implicit(&mut count_params, source.filter, data)?;
        let count = CommandSpec::text(format!("select count(*) from {}{}", from, where_clause))
            .with_params(count_params);
        Ok(PagePlan::Window {
            rows: CommandSpec::text(window).with_params(params),
            count,
        })
    }
}

fn output_count(outputs: &ParameterSet, name: &str) -> Result<i64> {
    match outputs.get(name) {
        Some(Value::Null) => Ok(0),
        Some(value) => value.as_i64().ok_or_else(|| {
            RelError::Mapping(format!("output parameter @{} is not a number: {}", name, value))
        }),
        None => Err(RelError::Mapping(format!(
            "output parameter @{} was not returned",
            name
        ))),
    }
}

impl<'c> Executor<'c> {
    /// Reads one page of the rows matched by the query
    ///
    /// The query's projection, filter and order apply; without an order the
    /// key field is sorted descending.
    pub fn paginate<T: Entity>(&mut self, query: &Query<T>, request: &PageRequest) -> Result<PaginationResult<T>> {
        let resolved = query.resolve(self.builder())?;
        let key = resolved
            .meta
            .key()
            .map(|k| k.column.clone())
            .unwrap_or_default();
        let source = PageSource {
            table: &resolved.table,
            key: &key,
            fields: &resolved.fields,
            filter: &resolved.filter,
            order: &resolved.order,
            join: "",
        };
        let plan = resolved.builder.page(source, request, query.bound_params())?;
        let page = self.run_page(&plan, request)?;
        Ok(PaginationResult {
            rows: mapping::rows_to_entities(&page.rows, &resolved.meta)?,
            page_count: page.page_count,
            total_count: page.total_count,
        })
    }

    /// Reads one page of raw rows from SQL fragments
    pub fn paginate_rows(
        &mut self,
        source: PageSource<'_>,
        request: &PageRequest,
        data: &ParameterSet,
    ) -> Result<RowPage> {
        let plan = self.builder().page(source, request, data)?;
        self.run_page(&plan, request)
    }

    /// Runs a caller-written paging command, typically a stored procedure
    ///
    /// `@PageIndex` and `@PageSize` are added to the command's parameters and
    /// the request's counter names are declared as output parameters.
    pub fn paginate_command(&mut self, command: CommandSpec, request: &PageRequest) -> Result<RowPage> {
        request.validate()?;
        let mut command = command
            .with_output(&request.page_count_name)
            .with_output(&request.total_count_name);
        command.params.insert("PageIndex", request.index);
        command.params.insert("PageSize", request.size);
        self.run_page(&PagePlan::Script(command), request)
    }

    fn run_page(&mut self, plan: &PagePlan, request: &PageRequest) -> Result<RowPage> {
        match plan {
            PagePlan::Script(command) => {
                let outcome = self.run(command)?;
                let total_count = output_count(&outcome.outputs, &request.total_count_name)?;
                let page_count = output_count(&outcome.outputs, &request.page_count_name)?;
                Ok(RowPage {
                    rows: outcome.rows,
                    page_count,
                    total_count,
                })
            }
            PagePlan::Window { rows, count } => {
                let total = self.scalar(count)?;
                let total_count = match total {
                    Value::Null => 0,
                    other => other.as_i64().ok_or_else(|| {
                        RelError::Mapping(format!("count returned non-numeric {}", other))
                    })?,
                };
                let rows = self.query(rows)?;
                Ok(RowPage {
                    rows,
                    page_count: page_count(total_count, request.size),
                    total_count,
                })
            }
        }
    }
}

/// One page of untyped rows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowPage {
    pub rows: RowSet,
    pub page_count: i64,
    pub total_count: i64,
}
