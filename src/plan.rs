//! Compilation of normalised query expressions to set-algebra SQL.
//!
//! Every leaf predicate becomes a WITH-chained CTE selecting the
//! point-in-time-latest version rows whose annotation matches; `AND` and
//! `OR` become `INTERSECT` and `UNION` over those tables, flattened
//! left-associatively so an n-ary node compiles to n−1 binary set
//! operations. Synthetic annotations are real rows on every version, so
//! user and system predicates share one leaf template.
//!
//! Binding discipline: `?1` is always the at-block; every user-provided
//! value and annotation name follows as its own numbered parameter in CTE
//! definition order; pagination parameters append at the tail. System
//! annotation names (`$owner` and friends) are parser-validated literals,
//! not user input, and are inlined.

use crate::{
    cursor::{Cursor, CursorError, CursorValue},
    parser::{Comparator, Expr, Predicate, PredicateValue},
    store::LATER_VERSION_AT,
    BlockNumber,
};

/// A positional SQL argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqlValue {
    /// Integer bind (numbers, blocks, reinterpreted numeric annotations).
    Int(i64),
    /// Text bind.
    Text(String),
}

/// One caller-requested ordering column: an annotation, typed so the
/// compiler knows which table to join.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    /// Annotation name.
    pub name: String,
    /// Whether the numeric family is meant (else string).
    pub numeric: bool,
    /// Descending order.
    pub descending: bool,
}

/// One column of the plan's full ordering tuple, annotation columns first,
/// then the default `(last_modified_at_block, tx_index, op_index)` tail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderSpec {
    /// Column (or annotation) name; what cursors reference.
    pub column: String,
    /// Numeric or text ordering.
    pub numeric: bool,
    /// Direction.
    pub descending: bool,
    /// Whether the column is an annotation realised through a join.
    pub annotation: bool,
}

/// A compiled, parameterised query plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryPlan {
    /// The full SQL text.
    pub sql: String,
    /// Positional arguments; `args[0]` is the at-block.
    pub args: Vec<SqlValue>,
    /// Snapshot block the plan reads at.
    pub at_block: BlockNumber,
    /// The ordering tuple, for cursor construction and verification.
    pub order: Vec<OrderSpec>,
}

/// Errors compiling an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// The cursor does not fit the request.
    #[error(transparent)]
    Cursor(#[from] CursorError),
    /// A `NOT` node survived normalisation; only hand-built trees can
    /// trigger this.
    #[error("expression contains residual negation")]
    ResidualNegation,
}

// The column tuple every CTE carries; set operations compare whole rows,
// so all tables must project exactly this.
const VERSION_TUPLE: &str = "e.key AS key, e.last_modified_at_block AS last_modified_at_block, \
     e.tx_index AS tx_index, e.op_index AS op_index";

const ANNOTATION_JOIN: &str = "JOIN entities e ON e.key = a.entity_key \
     AND e.last_modified_at_block = a.entity_last_modified_at_block \
     AND e.tx_index = a.entity_tx_index AND e.op_index = a.entity_op_index";

/// Compile `expr` (normalising it first) into a [`QueryPlan`] reading at
/// `at_block`, ordered by `order_by` then the default tuple, resuming
/// after `cursor` if one is given.
pub fn compile(
    expr: &Expr,
    at_block: BlockNumber,
    order_by: &[OrderBy],
    cursor: Option<&Cursor>,
) -> Result<QueryPlan, PlanError> {
    let expr = crate::parser::normalise(expr.clone());

    let mut order: Vec<OrderSpec> = order_by
        .iter()
        .map(|column| OrderSpec {
            column: column.name.clone(),
            numeric: column.numeric,
            descending: column.descending,
            annotation: true,
        })
        .collect();
    for column in ["last_modified_at_block", "tx_index", "op_index"] {
        order.push(OrderSpec {
            column: column.to_owned(),
            numeric: true,
            descending: false,
            annotation: false,
        });
    }
    if let Some(cursor) = cursor {
        cursor.verify(&order)?;
    }

    let mut builder = PlanBuilder {
        ctes: Vec::new(),
        args: vec![SqlValue::Int(at_block.min(i64::MAX as u64) as i64)],
    };
    let root = builder.compile_expr(&expr)?;

    // Final select over the last table, with order-column joins so the
    // ordering tuple is always part of the projection.
    let mut projection = vec![
        "t.key".to_owned(),
        "t.last_modified_at_block".to_owned(),
        "t.tx_index".to_owned(),
        "t.op_index".to_owned(),
    ];
    let mut joins = String::new();
    for (index, spec) in order.iter().filter(|spec| spec.annotation).enumerate() {
        let table = if spec.numeric {
            "numeric_annotations"
        } else {
            "string_annotations"
        };
        let name_sql = builder.name_sql(&spec.column);
        joins.push_str(&format!(
            " JOIN {table} ord_{index} ON ord_{index}.entity_key = t.key \
             AND ord_{index}.entity_last_modified_at_block = t.last_modified_at_block \
             AND ord_{index}.entity_tx_index = t.tx_index \
             AND ord_{index}.entity_op_index = t.op_index \
             AND ord_{index}.annotation_key = {name_sql}"
        ));
        projection.push(format!("ord_{index}.value AS order_{index}"));
    }

    let filter = match cursor {
        Some(cursor) => format!(" WHERE {}", builder.cursor_filter(cursor, &order)),
        None => String::new(),
    };

    // DISTINCT selects may only be ordered by result columns, so the
    // annotation columns are referenced through their projected aliases.
    let order_clause = order
        .iter()
        .scan(0usize, |annotation_index, spec| {
            let reference = if spec.annotation {
                let reference = format!("order_{annotation_index}");
                *annotation_index += 1;
                reference
            } else {
                format!("t.{}", spec.column)
            };
            let direction = if spec.descending { "DESC" } else { "ASC" };
            Some(format!("{reference} {direction}"))
        })
        .collect::<Vec<_>>()
        .join(", ");

    let with = builder
        .ctes
        .iter()
        .enumerate()
        .map(|(index, body)| format!("table_{} AS ({body})", index + 1))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "WITH {with} SELECT DISTINCT {} FROM table_{root} t{joins}{filter} ORDER BY {order_clause}",
        projection.join(", ")
    );

    Ok(QueryPlan {
        sql,
        args: builder.args,
        at_block,
        order,
    })
}

struct PlanBuilder {
    ctes: Vec<String>,
    args: Vec<SqlValue>,
}

impl PlanBuilder {
    fn bind(&mut self, value: SqlValue) -> String {
        self.args.push(value);
        format!("?{}", self.args.len())
    }

    // System annotation names come from the parser's fixed set and are
    // inlined; user names are bound like any other user input.
    fn name_sql(&mut self, name: &str) -> String {
        if name.starts_with('$') {
            format!("'{name}'")
        } else {
            self.bind(SqlValue::Text(name.to_owned()))
        }
    }

    fn push_cte(&mut self, body: String) -> usize {
        self.ctes.push(body);
        self.ctes.len()
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<usize, PlanError> {
        match expr {
            Expr::Leaf(predicate) => {
                let body = self.leaf_cte(predicate);
                Ok(self.push_cte(body))
            }
            Expr::All => {
                let body = format!(
                    "SELECT {VERSION_TUPLE} FROM entities e WHERE e.deleted = 0 \
                     AND e.last_modified_at_block <= ?1 AND NOT {LATER_VERSION_AT}"
                );
                Ok(self.push_cte(body))
            }
            Expr::And(children) => self.compile_chain(children, "INTERSECT"),
            Expr::Or(children) => self.compile_chain(children, "UNION"),
            Expr::Not(_) => Err(PlanError::ResidualNegation),
        }
    }

    // Left-associative fold: n children become n−1 binary set operations.
    fn compile_chain(&mut self, children: &[Expr], set_op: &str) -> Result<usize, PlanError> {
        let mut iter = children.iter();
        let first = iter.next().ok_or(PlanError::ResidualNegation)?;
        let mut accumulator = self.compile_expr(first)?;
        for child in iter {
            let right = self.compile_expr(child)?;
            accumulator = self.push_cte(format!(
                "SELECT * FROM table_{accumulator} {set_op} SELECT * FROM table_{right}"
            ));
        }
        Ok(accumulator)
    }

    fn leaf_cte(&mut self, predicate: &Predicate) -> String {
        let numeric = matches!(
            predicate.value,
            PredicateValue::Num(_) | PredicateValue::NumList(_)
        );
        let table = if numeric {
            "numeric_annotations"
        } else {
            "string_annotations"
        };
        let name_sql = self.name_sql(&predicate.name);
        let value_sql = self.value_condition(predicate);
        format!(
            "SELECT {VERSION_TUPLE} FROM {table} a {ANNOTATION_JOIN} \
             WHERE a.annotation_key = {name_sql} AND {value_sql} AND e.deleted = 0 \
             AND e.last_modified_at_block <= ?1 AND NOT {LATER_VERSION_AT}"
        )
    }

    fn value_condition(&mut self, predicate: &Predicate) -> String {
        match (&predicate.op, &predicate.value) {
            (Comparator::In | Comparator::NotIn, value) => {
                let placeholders: Vec<String> = match value {
                    PredicateValue::StrList(values) => values
                        .iter()
                        .map(|v| self.bind(SqlValue::Text(v.clone())))
                        .collect(),
                    PredicateValue::NumList(values) => values
                        .iter()
                        .map(|v| self.bind(SqlValue::Int(*v as i64)))
                        .collect(),
                    PredicateValue::Str(v) => vec![self.bind(SqlValue::Text(v.clone()))],
                    PredicateValue::Num(v) => vec![self.bind(SqlValue::Int(*v as i64))],
                };
                let keyword = if predicate.op == Comparator::NotIn {
                    "NOT IN"
                } else {
                    "IN"
                };
                format!("a.value {keyword} ({})", placeholders.join(", "))
            }
            (Comparator::Glob | Comparator::NotGlob, value) => {
                let placeholder = match value {
                    PredicateValue::Str(v) => self.bind(SqlValue::Text(v.clone())),
                    // Parser never produces these, but stay total.
                    PredicateValue::Num(v) => self.bind(SqlValue::Text(v.to_string())),
                    PredicateValue::StrList(_) | PredicateValue::NumList(_) => {
                        self.bind(SqlValue::Text(String::new()))
                    }
                };
                let keyword = if predicate.op == Comparator::NotGlob {
                    "NOT GLOB"
                } else {
                    "GLOB"
                };
                format!("a.value {keyword} {placeholder}")
            }
            (op, value) => {
                let operator = match op {
                    Comparator::Eq => "=",
                    Comparator::Ne => "!=",
                    Comparator::Lt => "<",
                    Comparator::Le => "<=",
                    Comparator::Gt => ">",
                    Comparator::Ge => ">=",
                    // Handled by the arms above.
                    _ => "=",
                };
                let placeholder = match value {
                    PredicateValue::Str(v) => self.bind(SqlValue::Text(v.clone())),
                    PredicateValue::Num(v) => self.bind(SqlValue::Int(*v as i64)),
                    PredicateValue::StrList(_) | PredicateValue::NumList(_) => {
                        self.bind(SqlValue::Text(String::new()))
                    }
                };
                format!("a.value {operator} {placeholder}")
            }
        }
    }

    // The decoded cursor tuple becomes a lexicographic strictly-after
    // filter: a disjunction of conjunctions, one per prefix length.
    fn cursor_filter(&mut self, cursor: &Cursor, order: &[OrderSpec]) -> String {
        let mut references = Vec::with_capacity(order.len());
        let mut annotation_index = 0usize;
        for spec in order {
            if spec.annotation {
                references.push(format!("ord_{annotation_index}.value"));
                annotation_index += 1;
            } else {
                references.push(format!("t.{}", spec.column));
            }
        }

        let mut disjuncts = Vec::with_capacity(order.len());
        for prefix in 0..cursor.positions.len() {
            let mut conjuncts = Vec::with_capacity(prefix + 1);
            for (index, position) in cursor.positions.iter().take(prefix + 1).enumerate() {
                let placeholder = self.bind(match &position.value {
                    CursorValue::Num(v) => SqlValue::Int(*v as i64),
                    CursorValue::Text(v) => SqlValue::Text(v.clone()),
                });
                let comparison = if index < prefix {
                    "="
                } else if position.descending {
                    "<"
                } else {
                    ">"
                };
                conjuncts.push(format!("{} {comparison} {placeholder}", references[index]));
            }
            disjuncts.push(format!("({})", conjuncts.join(" AND ")));
        }
        format!("({})", disjuncts.join(" OR "))
    }
}
