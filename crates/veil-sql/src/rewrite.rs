// SPDX-License-Identifier: Apache-2.0

//! Privacy rewriter
//!
//! Replaces every base-table reference that has encrypted columns with a
//! derived table exposing the same alias, in which each encrypted column is
//! re-emitted as `'ENCRYPT:' || col AS col`. The outer query is untouched, so
//! its output shape and join predicates stay valid.
//!
//! Only query statements are rewritten; DDL and DML pass through unchanged.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use sqlparser::ast::{
    Expr, Ident, ObjectName, ObjectNamePart, Query, Select, SelectItem,
    SelectItemQualifiedWildcardKind, SetExpr, Statement, TableFactor, Visit, VisitMut, Visitor,
    VisitorMut,
};
use sqlparser::dialect::Dialect;
use sqlparser::parser::Parser;
use tracing::debug;
use veil_core::{EngineError, EngineResult, PrivacyRule};

use crate::dialect::{parser_dialect, quote_char};

/// Prefix marking a value that must be pseudonymized after retrieval.
pub const ENCRYPTION_TAG: &str = "ENCRYPT:";

/// Rewritten SQL plus what the rewrite did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub sql: String,
    /// Encrypted column names per rewritten table alias.
    pub encrypted: Vec<(String, Vec<String>)>,
    /// Aliases whose derived table was built with `*`; these return the
    /// plaintext column alongside the tagged override.
    pub star_aliases: Vec<String>,
}

impl RewriteOutcome {
    fn unchanged(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            encrypted: Vec::new(),
            star_aliases: Vec::new(),
        }
    }

    pub fn is_rewritten(&self) -> bool {
        !self.encrypted.is_empty()
    }
}

/// Rewrites `sql` with the generic dialect.
pub fn rewrite_sql(sql: &str, rules: &[PrivacyRule]) -> EngineResult<String> {
    rewrite_sql_for("generic", sql, rules).map(|outcome| outcome.sql)
}

/// Rewrites `sql` for a backend dialect.
///
/// With no rules, or no rule touching a table in the query, the input is
/// returned as-is. SQL that cannot be parsed while rules are active is an
/// error rather than a silent passthrough.
pub fn rewrite_sql_for(
    dialect: &str,
    sql: &str,
    rules: &[PrivacyRule],
) -> EngineResult<RewriteOutcome> {
    if rules.is_empty() {
        return Ok(RewriteOutcome::unchanged(sql));
    }

    let parser = parser_dialect(dialect);
    let statements = Parser::parse_sql(parser.as_ref(), sql).map_err(|e| {
        EngineError::syntax_error(format!("Cannot apply privacy rules to query: {e}"))
    })?;

    let index = RuleIndex::new(rules);
    let mut outcome = RewriteOutcome::unchanged(sql);
    let mut rendered = Vec::with_capacity(statements.len());

    for statement in &statements {
        match rewrite_statement(statement, &index, parser.as_ref(), dialect)? {
            Some((rewritten, encrypted, star_aliases)) => {
                rendered.push(rewritten.to_string());
                outcome.encrypted.extend(encrypted);
                outcome.star_aliases.extend(star_aliases);
            }
            None => rendered.push(statement.to_string()),
        }
    }

    if outcome.is_rewritten() {
        outcome.sql = rendered.join("; ");
        debug!(
            tables = outcome.encrypted.len(),
            "Rewrote query for privacy rules"
        );
    }
    Ok(outcome)
}

type StatementRewrite = (Statement, Vec<(String, Vec<String>)>, Vec<String>);

fn rewrite_statement(
    statement: &Statement,
    index: &RuleIndex,
    parser: &dyn Dialect,
    dialect: &str,
) -> EngineResult<Option<StatementRewrite>> {
    if !matches!(statement, Statement::Query(_)) {
        return Ok(None);
    }

    let scope = QueryScope::collect(statement, index);
    if scope.tables.iter().all(|table| table.encrypted.is_empty()) {
        return Ok(None);
    }

    let mut rewritten = statement.clone();
    let mut rewriter = TableRewriter {
        scope: &scope,
        parser,
        quote: quote_char(dialect),
        dialect,
        next_table: 0,
        open: Vec::new(),
        encrypted: Vec::new(),
        star_aliases: Vec::new(),
    };
    if let ControlFlow::Break(err) = VisitMut::visit(&mut rewritten, &mut rewriter) {
        return Err(err);
    }

    Ok(Some((rewritten, rewriter.encrypted, rewriter.star_aliases)))
}

// --- Rules ---

struct RuleIndex {
    rules: Vec<(Vec<String>, String)>,
}

impl RuleIndex {
    fn new(rules: &[PrivacyRule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| {
                let parts = rule.table.split('.').map(clean).collect();
                (parts, clean(&rule.column))
            })
            .collect();
        Self { rules }
    }

    /// Encrypted columns of a table reference, in rule order, deduplicated.
    fn columns_for(&self, table: &[String]) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for (parts, column) in &self.rules {
            if table_matches(parts, table) && !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        columns
    }
}

/// Names match when the shorter one is a suffix of the longer one.
fn table_matches(rule: &[String], table: &[String]) -> bool {
    let len = rule.len().min(table.len());
    len > 0 && rule[rule.len() - len..] == table[table.len() - len..]
}

fn clean(name: &str) -> String {
    name.trim()
        .trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']')
        .to_lowercase()
}

fn part_value(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(ident) => ident.value.to_lowercase(),
        _ => String::new(),
    }
}

fn name_parts(name: &ObjectName) -> Vec<String> {
    name.0.iter().map(part_value).collect()
}

fn last_ident(name: &ObjectName) -> Option<Ident> {
    match name.0.last() {
        Some(ObjectNamePart::Identifier(ident)) => Some(ident.clone()),
        _ => None,
    }
}

// --- Scope analysis ---

struct TableRef {
    parts: Vec<String>,
    /// Explicit alias or implicit table name, lower-cased.
    key: String,
    scope: usize,
    encrypted: Vec<String>,
}

/// One query node: the outer statement, a CTE, a derived table or a subquery.
#[derive(Default)]
struct Scope {
    parent: Option<usize>,
    first_table: Option<usize>,
    unqualified: Vec<String>,
    output_aliases: HashSet<String>,
    /// Bare `*` in the projection (or a parenthesized body, which passes
    /// every column through).
    star: bool,
    star_qualifiers: HashSet<String>,
    /// Every column of this node reaches the statement's result: it is the
    /// outer query, or a CTE / derived table read by a `*` of such a node.
    feeds_result: bool,
}

/// Everything the rewriter needs to know about one query statement.
///
/// Table references are numbered in visit order, which the rewriter replays
/// on its own copy of the tree.
#[derive(Default)]
struct QueryScope {
    tables: Vec<TableRef>,
    scopes: Vec<Scope>,
    /// Column references qualified by a table or alias.
    qualified: HashMap<String, Vec<String>>,
    /// Original spelling of every referenced column.
    spelling: HashMap<String, Ident>,
}

impl QueryScope {
    fn collect(statement: &Statement, index: &RuleIndex) -> Self {
        let mut collector = ScopeCollector {
            index,
            open: Vec::new(),
            feeding: Vec::new(),
            scope: QueryScope::default(),
        };
        let _ = Visit::visit(statement, &mut collector);
        collector.scope
    }

    /// Whether some table in this statement encrypts `column`.
    fn has_rule_for(&self, column: &str) -> bool {
        self.tables
            .iter()
            .any(|table| table.encrypted.iter().any(|c| c == column))
    }

    /// Whether the derived table may be `*` plus overrides. Only nodes whose
    /// whole output reaches the result qualify; the duplicate plaintext
    /// column is then dropped after execution. Anywhere else a duplicate
    /// name could be resolved to the plaintext copy.
    fn uses_star(&self, table: &TableRef) -> bool {
        let scope = &self.scopes[table.scope];
        scope.feeds_result
            && (scope.star
                || scope.star_qualifiers.contains(&table.key)
                || table
                    .parts
                    .last()
                    .is_some_and(|last| scope.star_qualifiers.contains(last)))
    }

    /// Plain columns the derived table must still expose for a reference.
    ///
    /// Output aliases of the enclosing query are never base columns, so
    /// `SELECT UPPER(name) AS name FROM users` leaves `name` out of the
    /// derived table and the backend rejects the rewritten query.
    ///
    /// A nested `*` that does not reach the result also passes through the
    /// unqualified columns its enclosing queries reference.
    fn passthrough(&self, position: usize) -> Vec<String> {
        let table = &self.tables[position];
        let mut columns = Vec::new();

        let mut qualifiers = vec![table.key.as_str()];
        if let Some(last) = table.parts.last().filter(|last| **last != table.key) {
            qualifiers.push(last.as_str());
        }
        for qualifier in qualifiers {
            for column in self.qualified.get(qualifier).into_iter().flatten() {
                push_unique(&mut columns, column.clone());
            }
        }

        let scope = &self.scopes[table.scope];
        let is_first = scope.first_table == Some(position);
        for column in &scope.unqualified {
            if scope.output_aliases.contains(column) {
                continue;
            }
            // a rule elsewhere claims the column; without one only the first table gets it
            if self.has_rule_for(column) || !is_first {
                continue;
            }
            push_unique(&mut columns, column.clone());
        }

        if scope.star && !scope.feeds_result {
            let mut parent = scope.parent;
            while let Some(index) = parent {
                let enclosing = &self.scopes[index];
                for column in &enclosing.unqualified {
                    if enclosing.output_aliases.contains(column) || self.has_rule_for(column) {
                        continue;
                    }
                    push_unique(&mut columns, column.clone());
                }
                parent = enclosing.parent;
            }
        }

        columns.retain(|column| !table.encrypted.contains(column));
        columns
    }
}

fn collect_stars(body: &SetExpr, scope: &mut Scope) {
    match body {
        SetExpr::Select(select) => collect_select_stars(select, scope),
        SetExpr::Query(_) => scope.star = true,
        SetExpr::SetOperation { left, right, .. } => {
            collect_stars(left, scope);
            collect_stars(right, scope);
        }
        _ => {}
    }
}

fn collect_select_stars(select: &Select, scope: &mut Scope) {
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => scope.star = true,
            SelectItem::QualifiedWildcard(SelectItemQualifiedWildcardKind::ObjectName(name), _) => {
                if let Some(qualifier) = name.0.last().map(part_value) {
                    scope.star_qualifiers.insert(qualifier);
                }
            }
            _ => {}
        }
    }
}

/// Queries nested directly in `body` whose output is the body's output.
fn body_queries(body: &SetExpr, out: &mut Vec<*const Query>) {
    match body {
        SetExpr::Query(query) => out.push(&**query as *const Query),
        SetExpr::SetOperation { left, right, .. } => {
            body_queries(left, out);
            body_queries(right, out);
        }
        _ => {}
    }
}

struct ScopeCollector<'a> {
    index: &'a RuleIndex,
    open: Vec<usize>,
    /// CTE, derived-table and body queries whose rows flow into their parent.
    /// Only compared by address, never dereferenced.
    feeding: Vec<*const Query>,
    scope: QueryScope,
}

impl Visitor for ScopeCollector<'_> {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        let parent = self.open.last().copied();
        let mut scope = Scope {
            parent,
            ..Scope::default()
        };
        collect_output_aliases(&query.body, &mut scope.output_aliases);
        collect_stars(&query.body, &mut scope);
        scope.feeds_result = match parent {
            None => true,
            Some(index) => {
                let enclosing = &self.scope.scopes[index];
                enclosing.feeds_result
                    && enclosing.star
                    && self.feeding.iter().any(|q| std::ptr::eq(*q, query))
            }
        };

        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.feeding.push(&*cte.query as *const Query);
            }
        }
        body_queries(&query.body, &mut self.feeding);

        self.open.push(self.scope.scopes.len());
        self.scope.scopes.push(scope);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.open.pop();
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Derived { subquery, .. } = factor {
            self.feeding.push(&**subquery as *const Query);
        }
        let TableFactor::Table { name, alias, .. } = factor else {
            return ControlFlow::Continue(());
        };
        let Some(&scope) = self.open.last() else {
            return ControlFlow::Continue(());
        };

        let parts = name_parts(name);
        let key = alias
            .as_ref()
            .map(|alias| alias.name.value.to_lowercase())
            .or_else(|| parts.last().cloned())
            .unwrap_or_default();
        let encrypted = self.index.columns_for(&parts);

        let position = self.scope.tables.len();
        self.scope.scopes[scope].first_table.get_or_insert(position);
        self.scope.tables.push(TableRef {
            parts,
            key,
            scope,
            encrypted,
        });
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => {
                let column = ident.value.to_lowercase();
                self.scope
                    .spelling
                    .entry(column.clone())
                    .or_insert_with(|| ident.clone());
                if let Some(&scope) = self.open.last() {
                    push_unique(&mut self.scope.scopes[scope].unqualified, column);
                }
            }
            Expr::CompoundIdentifier(idents) if idents.len() >= 2 => {
                let qualifier = idents[idents.len() - 2].value.to_lowercase();
                let ident = &idents[idents.len() - 1];
                let column = ident.value.to_lowercase();
                self.scope
                    .spelling
                    .entry(column.clone())
                    .or_insert_with(|| ident.clone());
                push_unique(self.scope.qualified.entry(qualifier).or_default(), column);
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn collect_output_aliases(body: &SetExpr, aliases: &mut HashSet<String>) {
    match body {
        SetExpr::Select(select) => {
            for item in &select.projection {
                if let SelectItem::ExprWithAlias { alias, .. } = item {
                    aliases.insert(alias.value.to_lowercase());
                }
            }
        }
        SetExpr::SetOperation { left, right, .. } => {
            collect_output_aliases(left, aliases);
            collect_output_aliases(right, aliases);
        }
        _ => {}
    }
}

fn push_unique(columns: &mut Vec<String>, column: String) {
    if !columns.contains(&column) {
        columns.push(column);
    }
}

// --- Substitution ---

struct TableRewriter<'a> {
    scope: &'a QueryScope,
    parser: &'a dyn Dialect,
    quote: char,
    dialect: &'a str,
    next_table: usize,
    open: Vec<usize>,
    encrypted: Vec<(String, Vec<String>)>,
    star_aliases: Vec<String>,
}

impl TableRewriter<'_> {
    fn column_ident(&self, column: &str) -> Ident {
        if let Some(ident) = self.scope.spelling.get(column) {
            return ident.clone();
        }
        let simple = column
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if simple {
            Ident::new(column)
        } else {
            Ident::with_quote(self.quote, column)
        }
    }

    fn tagged(&self, column: &Ident) -> String {
        match self.dialect.to_ascii_lowercase().as_str() {
            "mysql" => format!("CONCAT('{ENCRYPTION_TAG}', {column}) AS {column}"),
            "bigquery" => {
                format!("CONCAT('{ENCRYPTION_TAG}', CAST({column} AS STRING)) AS {column}")
            }
            "motherduck" | "duckdb" => {
                format!("'{ENCRYPTION_TAG}' || CAST({column} AS VARCHAR) AS {column}")
            }
            _ => format!("'{ENCRYPTION_TAG}' || {column} AS {column}"),
        }
    }

    fn replacement(&self, name: &ObjectName, alias: &Ident, items: &[String]) -> EngineResult<TableFactor> {
        let wrapper = format!(
            "SELECT * FROM (SELECT {} FROM {}) AS {}",
            items.join(", "),
            name,
            alias
        );
        let mut statements = Parser::parse_sql(self.parser, &wrapper).map_err(|e| {
            EngineError::internal(format!("Privacy rewrite produced invalid SQL: {e}"))
        })?;
        match statements.pop() {
            Some(Statement::Query(query)) => match *query.body {
                SetExpr::Select(mut select) if !select.from.is_empty() => {
                    Ok(select.from.swap_remove(0).relation)
                }
                _ => Err(EngineError::internal("Unexpected privacy rewrite shape")),
            },
            _ => Err(EngineError::internal("Unexpected privacy rewrite shape")),
        }
    }
}

impl VisitorMut for TableRewriter<'_> {
    type Break = EngineError;

    fn pre_visit_table_factor(&mut self, factor: &mut TableFactor) -> ControlFlow<Self::Break> {
        if matches!(factor, TableFactor::Table { .. }) {
            self.open.push(self.next_table);
            self.next_table += 1;
        }
        ControlFlow::Continue(())
    }

    fn post_visit_table_factor(&mut self, factor: &mut TableFactor) -> ControlFlow<Self::Break> {
        let TableFactor::Table {
            name, alias, args, ..
        } = factor
        else {
            return ControlFlow::Continue(());
        };
        let Some(position) = self.open.pop() else {
            return ControlFlow::Continue(());
        };
        let Some(table) = self.scope.tables.get(position) else {
            return ControlFlow::Continue(());
        };
        // table-valued functions are not base tables
        if table.encrypted.is_empty() || args.is_some() {
            return ControlFlow::Continue(());
        }
        let Some(alias_ident) = alias
            .as_ref()
            .map(|a| a.name.clone())
            .or_else(|| last_ident(name))
        else {
            return ControlFlow::Continue(());
        };

        let star = self.scope.uses_star(table);
        let mut items: Vec<String> = if star {
            vec!["*".to_string()]
        } else {
            self.scope
                .passthrough(position)
                .iter()
                .map(|column| self.column_ident(column).to_string())
                .collect()
        };
        items.extend(
            table
                .encrypted
                .iter()
                .map(|column| self.tagged(&self.column_ident(column))),
        );

        match self.replacement(name, &alias_ident, &items) {
            Ok(replacement) => {
                if star {
                    self.star_aliases.push(table.key.clone());
                }
                self.encrypted
                    .push((table.key.clone(), table.encrypted.clone()));
                *factor = replacement;
                ControlFlow::Continue(())
            }
            Err(err) => ControlFlow::Break(err),
        }
    }
}
