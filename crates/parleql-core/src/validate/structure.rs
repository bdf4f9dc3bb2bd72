//! Parser-based structural analysis.
//!
//! Replaces keyword scanning with an AST walk: statement counting, query
//! classification, table and join counting, and cartesian-join detection
//! all come from `sqlparser`'s parse tree.

use sqlparser::ast::{
    Join, JoinConstraint, JoinOperator, Query, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use serde::{Deserialize, Serialize};

use crate::dialect::DatabaseKind;
use crate::error::{ParleQLError, Result};

/// Coarse statement classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryKind {
    /// Read-only query.
    Select,
    /// Schema-changing statement.
    Ddl,
    /// Data-changing statement.
    Dml,
    /// Anything else.
    Other,
}

/// What the walk found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureReport {
    /// Statement classification.
    pub query_kind: QueryKind,
    /// Distinct table names referenced (upper-cased).
    pub tables: Vec<String>,
    /// Number of explicit JOINs plus comma-join pairs.
    pub join_count: usize,
    /// True when a join lacks an ON/USING predicate, or a comma join has
    /// no WHERE clause to link its sides.
    pub has_cartesian_risk: bool,
    /// Whether the query already carries GROUP BY / FETCH / OFFSET
    /// (relevant for the Oracle probe wrapper).
    pub probe_amenable: bool,
}

fn parser_dialect(kind: DatabaseKind) -> Box<dyn Dialect> {
    match kind {
        DatabaseKind::Oracle => Box::new(GenericDialect {}),
        DatabaseKind::Postgres => Box::new(PostgreSqlDialect {}),
        DatabaseKind::Doris => Box::new(MySqlDialect {}),
    }
}

/// Parse and analyze a (single) statement.
///
/// # Errors
///
/// [`ParleQLError::ValidationSqlRejected`] when the text does not parse
/// or contains more than one statement.
pub fn analyze(sql: &str, kind: DatabaseKind) -> Result<StructureReport> {
    let dialect = parser_dialect(kind);
    let statements = Parser::parse_sql(dialect.as_ref(), sql)
        .map_err(|e| ParleQLError::sql_rejected(format!("SQL does not parse: {e}")))?;
    if statements.is_empty() {
        return Err(ParleQLError::sql_rejected("empty statement"));
    }
    if statements.len() > 1 {
        return Err(ParleQLError::sql_rejected(format!(
            "expected a single statement, found {}",
            statements.len()
        )));
    }

    let statement = &statements[0];
    let query_kind = classify(statement);

    let mut walk = Walk::default();
    if let Statement::Query(query) = statement {
        walk.query(query);
    }

    // FETCH/OFFSET presence is checked textually; the probe wrapper only
    // needs to know the query is not already shaped by one.
    let upper = sql.to_ascii_uppercase();
    let has_fetch = upper.contains("FETCH FIRST") || upper.contains(" OFFSET ");
    let probe_amenable = query_kind == QueryKind::Select && !walk.has_group_by && !has_fetch;

    let mut tables = walk.tables;
    tables.sort();
    tables.dedup();

    Ok(StructureReport {
        query_kind,
        tables,
        join_count: walk.join_count,
        has_cartesian_risk: walk.cartesian_risk,
        probe_amenable,
    })
}

fn classify(statement: &Statement) -> QueryKind {
    match statement {
        Statement::Query(_) => QueryKind::Select,
        Statement::Insert(_) | Statement::Update { .. } | Statement::Delete(_) => QueryKind::Dml,
        Statement::CreateTable(_)
        | Statement::CreateView { .. }
        | Statement::CreateIndex(_)
        | Statement::AlterTable { .. }
        | Statement::Drop { .. }
        | Statement::Truncate { .. } => QueryKind::Ddl,
        _ => QueryKind::Other,
    }
}

#[derive(Default)]
struct Walk {
    tables: Vec<String>,
    join_count: usize,
    cartesian_risk: bool,
    has_group_by: bool,
}

impl Walk {
    fn query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.query(&cte.query);
            }
        }
        self.set_expr(&query.body);
    }

    fn set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                let has_where = select.selection.is_some();
                let comma_joined = select.from.len() > 1;
                if comma_joined {
                    // Comma joins pair every extra FROM item.
                    self.join_count += select.from.len() - 1;
                    if !has_where {
                        self.cartesian_risk = true;
                    }
                }
                for table in &select.from {
                    self.table_with_joins(table);
                }
                if !matches!(select.group_by, sqlparser::ast::GroupByExpr::Expressions(ref e, _) if e.is_empty())
                {
                    self.has_group_by = true;
                }
            }
            SetExpr::Query(query) => self.query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left);
                self.set_expr(right);
            }
            _ => {}
        }
    }

    fn table_with_joins(&mut self, table: &TableWithJoins) {
        self.table_factor(&table.relation);
        for join in &table.joins {
            self.join_count += 1;
            self.table_factor(&join.relation);
            if join_lacks_predicate(join) {
                self.cartesian_risk = true;
            }
        }
    }

    fn table_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, .. } => {
                let rendered = name
                    .0
                    .iter()
                    .filter_map(|part| part.as_ident())
                    .map(|ident| ident.value.to_ascii_uppercase())
                    .collect::<Vec<_>>()
                    .join(".");
                if !rendered.is_empty() {
                    self.tables.push(rendered);
                }
            }
            TableFactor::Derived { subquery, .. } => self.query(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.table_with_joins(table_with_joins),
            _ => {}
        }
    }
}

fn join_lacks_predicate(join: &Join) -> bool {
    let constraint = match &join.join_operator {
        JoinOperator::Join(c)
        | JoinOperator::Inner(c)
        | JoinOperator::Left(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::Right(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c)
        | JoinOperator::CrossJoin(c)
        | JoinOperator::Semi(c)
        | JoinOperator::LeftSemi(c)
        | JoinOperator::RightSemi(c)
        | JoinOperator::Anti(c)
        | JoinOperator::LeftAnti(c)
        | JoinOperator::RightAnti(c)
        | JoinOperator::StraightJoin(c) => c,
        JoinOperator::AsOf { constraint, .. } => constraint,
        JoinOperator::CrossApply | JoinOperator::OuterApply => return true,
    };
    matches!(constraint, JoinConstraint::None)
}
