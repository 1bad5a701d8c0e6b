//! SQL rendering for model operations.
//!
//! Everything here is pure: statements are built with `?` placeholders and
//! rebound for the target adapter at the end.

use crate::entity::schema::Schema;
use crate::models::{Adapter, Value};

/// A SQL fragment with its arguments, e.g. a where clause.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Fragment {
    pub sql: String,
    pub args: Vec<Value>,
}

impl Fragment {
    pub fn new(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }
}

/// Clauses collected by the model builder.
#[derive(Debug, Clone, Default)]
pub(crate) struct Clauses {
    pub select: Option<String>,
    pub join: Option<Fragment>,
    pub filter: Option<Fragment>,
    pub group: Option<String>,
    pub having: Option<Fragment>,
    pub order: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub set: Option<Fragment>,
}

/// A rendered statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    fn push(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    /// NULL is written inline so the server infers the column type.
    fn push_value(&mut self, value: Value) {
        if value.is_null() {
            self.sql.push_str("NULL");
        } else {
            self.sql.push('?');
            self.params.push(value);
        }
    }

    /// Append a fragment, expanding list arguments into `?, ?, ...`.
    fn push_fragment(&mut self, fragment: &Fragment) {
        let mut args = fragment.args.iter();
        for c in fragment.sql.chars() {
            if c != '?' {
                self.sql.push(c);
                continue;
            }
            match args.next() {
                Some(Value::List(items)) if items.is_empty() => self.sql.push_str("NULL"),
                Some(Value::List(items)) => {
                    let marks = vec!["?"; items.len()];
                    self.sql.push_str(&marks.join(", "));
                    self.params.extend(items.iter().cloned());
                }
                Some(arg) => {
                    self.sql.push('?');
                    self.params.push(arg.clone());
                }
                None => self.sql.push('?'),
            }
        }
        self.params.extend(args.cloned());
    }

    /// Terminate and rebind for `adapter`.
    pub(crate) fn finish(mut self, adapter: Adapter) -> Self {
        self.sql.push(';');
        self.sql = rebind(&self.sql, adapter);
        self
    }
}

/// Rewrite `?` placeholders to the adapter's syntax. Question marks inside
/// single-quoted literals are left alone.
pub(crate) fn rebind(sql: &str, adapter: Adapter) -> String {
    if adapter == Adapter::MySql {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + 8);
    let mut in_literal = false;
    let mut n = 0;
    for c in sql.chars() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '?' if !in_literal => {
                n += 1;
                out.push_str(&adapter.placeholder(n));
            }
            _ => out.push(c),
        }
    }
    out
}

fn qualified_columns(schema: &Schema) -> String {
    schema
        .mapped_columns()
        .map(|c| format!("{}.{}", schema.table(), c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_filter(stmt: &mut Statement, schema: &Schema, filter: Option<&Fragment>) {
    let soft = schema.soft_delete_column();
    match (filter, soft) {
        (Some(filter), Some(column)) => {
            // Parenthesized so an OR in the filter cannot reach soft-deleted rows.
            stmt.push(" WHERE (");
            stmt.push_fragment(filter);
            stmt.push(&format!(") AND {}.{} IS NULL", schema.table(), column));
        }
        (Some(filter), None) => {
            stmt.push(" WHERE ");
            stmt.push_fragment(filter);
        }
        (None, Some(column)) => {
            stmt.push(&format!(" WHERE {}.{} IS NULL", schema.table(), column));
        }
        (None, None) => {}
    }
}

fn push_tail(stmt: &mut Statement, clauses: &Clauses) {
    if let Some(order) = &clauses.order {
        stmt.push(&format!(" ORDER BY {}", order));
    }
    if let Some(limit) = clauses.limit {
        stmt.push(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = clauses.offset {
        stmt.push(&format!(" OFFSET {}", offset));
    }
}

fn push_join(stmt: &mut Statement, clauses: &Clauses) {
    if let Some(join) = &clauses.join {
        stmt.push(" ");
        stmt.push_fragment(join);
    }
}

/// `pk = ? AND ...` over the non-zero keys of one row. `None` when the row
/// has no usable key.
pub(crate) fn key_filter(keys: &[(String, Value)]) -> Option<Fragment> {
    let present: Vec<&(String, Value)> = keys.iter().filter(|(_, v)| !v.is_zero()).collect();
    if present.is_empty() {
        return None;
    }
    let sql = present
        .iter()
        .map(|(column, _)| format!("{} = ?", column))
        .collect::<Vec<_>>()
        .join(" AND ");
    let args = present.into_iter().map(|(_, v)| v.clone()).collect();
    Some(Fragment::new(sql, args))
}

/// `pk IN (?, ?)` or `(a, b) IN ((?, ?), (?, ?))` over rows that have every
/// key set. `None` when no row does.
pub(crate) fn keys_filter(columns: &[String], rows: &[Vec<Value>]) -> Option<Fragment> {
    let rows: Vec<&Vec<Value>> = rows
        .iter()
        .filter(|row| !row.is_empty() && row.iter().all(|v| !v.is_zero()))
        .collect();
    if rows.is_empty() || columns.is_empty() {
        return None;
    }

    if columns.len() == 1 {
        let marks = vec!["?"; rows.len()].join(", ");
        let args = rows.into_iter().map(|row| row[0].clone()).collect();
        return Some(Fragment::new(format!("{} IN ({})", columns[0], marks), args));
    }

    let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
    let tuples = vec![tuple.as_str(); rows.len()].join(", ");
    let args = rows.into_iter().flat_map(|row| row.iter().cloned()).collect();
    Some(Fragment::new(
        format!("({}) IN ({})", columns.join(", "), tuples),
        args,
    ))
}

pub(crate) fn all(schema: &Schema) -> Statement {
    let mut stmt = Statement::default();
    stmt.push(&format!("SELECT {} FROM {}", qualified_columns(schema), schema.table()));
    push_filter(&mut stmt, schema, None);
    stmt
}

/// SELECT with an explicit filter or, failing that, `keys`.
pub(crate) fn find(schema: &Schema, clauses: &Clauses, keys: Option<&Fragment>) -> Statement {
    let mut stmt = Statement::default();
    let columns = clauses
        .select
        .clone()
        .unwrap_or_else(|| qualified_columns(schema));
    stmt.push(&format!("SELECT {} FROM {}", columns, schema.table()));
    push_join(&mut stmt, clauses);
    push_filter(&mut stmt, schema, clauses.filter.as_ref().or(keys));
    push_tail(&mut stmt, clauses);
    stmt
}

pub(crate) fn count(schema: &Schema, clauses: &Clauses) -> Statement {
    let mut stmt = Statement::default();
    let target = clauses.select.as_deref().unwrap_or("*");
    stmt.push(&format!("SELECT COUNT({}) FROM {}", target, schema.table()));
    push_join(&mut stmt, clauses);
    push_filter(&mut stmt, schema, clauses.filter.as_ref());
    stmt
}

/// Free-form SELECT including GROUP BY and HAVING.
pub(crate) fn scan(schema: &Schema, clauses: &Clauses) -> Statement {
    let mut stmt = Statement::default();
    let columns = clauses.select.as_deref().unwrap_or("*");
    stmt.push(&format!("SELECT {} FROM {}", columns, schema.table()));
    push_join(&mut stmt, clauses);
    push_filter(&mut stmt, schema, clauses.filter.as_ref());
    if let Some(group) = &clauses.group {
        stmt.push(&format!(" GROUP BY {}", group));
    }
    if let Some(having) = &clauses.having {
        stmt.push(" HAVING ");
        stmt.push_fragment(having);
    }
    push_tail(&mut stmt, clauses);
    stmt
}

/// One multi-row INSERT. `rows` hold values for [`Schema::writable_columns`]
/// in order.
pub(crate) fn insert(schema: &Schema, adapter: Adapter, rows: Vec<Vec<Value>>) -> Statement {
    let columns: Vec<&str> = schema.writable_columns().collect();
    let mut stmt = Statement::default();
    stmt.push(&format!(
        "INSERT INTO {} ({}) VALUES ",
        schema.table(),
        columns.join(", ")
    ));

    for (i, row) in rows.into_iter().enumerate() {
        if i > 0 {
            stmt.push(", ");
        }
        stmt.push("(");
        for (j, value) in row.into_iter().enumerate() {
            if j > 0 {
                stmt.push(", ");
            }
            stmt.push_value(value);
        }
        stmt.push(")");
    }

    if adapter.supports_returning() && !schema.primary_key_columns().is_empty() {
        stmt.push(&format!(
            " RETURNING {}",
            schema.primary_key_columns().join(", ")
        ));
    }
    stmt
}

/// Reads back the keys of rows inserted from `first_id` on, for adapters that
/// only report the first generated id.
pub(crate) fn inserted_keys(schema: &Schema, auto_increment: &str, first_id: u64, rows: usize) -> Statement {
    let mut stmt = Statement::default();
    stmt.push(&format!(
        "SELECT {} FROM {} WHERE {} >= ",
        schema.primary_key_columns().join(", "),
        schema.table(),
        auto_increment
    ));
    stmt.push_value(Value::Int(first_id as i64));
    stmt.push(&format!(" ORDER BY {} ASC LIMIT {}", auto_increment, rows));
    stmt
}

/// UPDATE of every writable column of one row.
pub(crate) fn update(schema: &Schema, values: Vec<(String, Value)>, keys: &Fragment) -> Statement {
    let mut stmt = Statement::default();
    stmt.push(&format!("UPDATE {} SET ", schema.table()));
    for (i, (column, value)) in values.into_iter().enumerate() {
        if i > 0 {
            stmt.push(", ");
        }
        stmt.push(&format!("{} = ", column));
        stmt.push_value(value);
    }
    stmt.push(" WHERE ");
    stmt.push_fragment(keys);
    stmt
}

/// DELETE of one row, or a soft delete stamping `deleted_at`.
pub(crate) fn delete(schema: &Schema, keys: &Fragment, deleted_at: Option<Value>) -> Statement {
    let mut stmt = Statement::default();
    match (schema.soft_delete_column(), deleted_at) {
        (Some(column), Some(stamp)) => {
            stmt.push(&format!("UPDATE {} SET {} = ", schema.table(), column));
            stmt.push_value(stamp);
            stmt.push(" WHERE ");
            stmt.push_fragment(keys);
            stmt.push(&format!(" AND {} IS NULL", column));
        }
        _ => {
            stmt.push(&format!("DELETE FROM {} WHERE ", schema.table()));
            stmt.push_fragment(keys);
        }
    }
    stmt
}

pub(crate) fn delete_all(
    schema: &Schema,
    clauses: &Clauses,
    keys: Option<&Fragment>,
    deleted_at: Option<Value>,
) -> Statement {
    let mut stmt = Statement::default();
    match (schema.soft_delete_column(), deleted_at) {
        (Some(column), Some(stamp)) => {
            stmt.push(&format!("UPDATE {} SET {} = ", schema.table(), column));
            stmt.push_value(stamp);
        }
        _ => stmt.push(&format!("DELETE FROM {}", schema.table())),
    }
    push_filter(&mut stmt, schema, clauses.filter.as_ref().or(keys));
    stmt
}

pub(crate) fn update_all(schema: &Schema, set: &Fragment, clauses: &Clauses, keys: Option<&Fragment>) -> Statement {
    let mut stmt = Statement::default();
    stmt.push(&format!("UPDATE {} SET ", schema.table()));
    stmt.push_fragment(set);
    push_filter(&mut stmt, schema, clauses.filter.as_ref().or(keys));
    stmt
}

/// Single-statement UPDATE of one owner column, used for `touch`.
pub(crate) fn touch(schema: &Schema, column: &str, stamp: Value, key: &str, id: Value) -> Statement {
    let mut stmt = Statement::default();
    stmt.push(&format!("UPDATE {} SET {} = ", schema.table(), column));
    stmt.push_value(stamp);
    stmt.push(&format!(" WHERE {} = ", key));
    stmt.push_value(id);
    stmt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::schema::Column;

    fn users() -> Schema {
        Schema::new("users")
            .column(Column::new("id").auto_increment())
            .columns(["name", "email"])
            .created_at("created_at")
    }

    fn soft_users() -> Schema {
        users().soft_delete("deleted_at")
    }

    #[test]
    fn test_rebind() {
        assert_eq!(
            rebind("SELECT * FROM t WHERE a = ? AND b = ?", Adapter::Postgres),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
        assert_eq!(
            rebind("SELECT '?' FROM t WHERE a = ?", Adapter::Postgres),
            "SELECT '?' FROM t WHERE a = $1"
        );
        assert_eq!(rebind("a = ?", Adapter::MySql), "a = ?");
    }

    #[test]
    fn test_list_arguments_expand() {
        let clauses = Clauses {
            filter: Some(Fragment::new(
                "name = ? AND id IN (?)",
                vec![Value::from("a"), Value::List(vec![Value::Int(1), Value::Int(2)])],
            )),
            ..Default::default()
        };
        let stmt = find(&users(), &clauses, None).finish(Adapter::Postgres);
        assert!(stmt.sql.ends_with("WHERE name = $1 AND id IN ($2, $3);"));
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let clauses = Clauses {
            filter: Some(Fragment::new("id IN (?)", vec![Value::List(vec![])])),
            ..Default::default()
        };
        let stmt = count(&users(), &clauses).finish(Adapter::MySql);
        assert_eq!(stmt.sql, "SELECT COUNT(*) FROM users WHERE id IN (NULL);");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_all_skips_soft_deleted() {
        let stmt = all(&soft_users()).finish(Adapter::MySql);
        assert_eq!(
            stmt.sql,
            "SELECT users.id, users.name, users.email, users.created_at, users.deleted_at \
             FROM users WHERE users.deleted_at IS NULL;"
        );
    }

    #[test]
    fn test_find_with_filter_and_tail() {
        let clauses = Clauses {
            filter: Some(Fragment::new("name = ?", vec![Value::from("alice")])),
            order: Some("id DESC".to_string()),
            limit: Some(10),
            offset: Some(20),
            ..Default::default()
        };
        let stmt = find(&soft_users(), &clauses, None).finish(Adapter::Postgres);
        assert!(stmt.sql.ends_with(
            "FROM users WHERE (name = $1) AND users.deleted_at IS NULL ORDER BY id DESC LIMIT 10 OFFSET 20;"
        ));
    }

    #[test]
    fn test_or_filter_keeps_soft_delete_condition() {
        let clauses = Clauses {
            filter: Some(Fragment::new(
                "name = ? OR name = ?",
                vec![Value::from("ghost"), Value::from("live")],
            )),
            ..Default::default()
        };
        let expected = "WHERE (name = $1 OR name = $2) AND users.deleted_at IS NULL;";
        let stmt = find(&soft_users(), &clauses, None).finish(Adapter::Postgres);
        assert!(stmt.sql.ends_with(expected), "{}", stmt.sql);
        let stmt = count(&soft_users(), &clauses).finish(Adapter::Postgres);
        assert!(stmt.sql.ends_with(expected), "{}", stmt.sql);

        let set = Fragment::new("email = NULL", vec![]);
        let stmt = update_all(&soft_users(), &set, &clauses, None).finish(Adapter::Postgres);
        assert_eq!(
            stmt.sql,
            "UPDATE users SET email = NULL WHERE (name = $1 OR name = $2) AND users.deleted_at IS NULL;"
        );

        // Without soft delete the filter is used as written.
        let stmt = find(&users(), &clauses, None).finish(Adapter::MySql);
        assert!(stmt.sql.ends_with("WHERE name = ? OR name = ?;"));
    }

    #[test]
    fn test_find_falls_back_to_keys() {
        let keys = keys_filter(
            &["id".to_string()],
            &[vec![Value::Int(1)], vec![Value::Int(0)], vec![Value::Int(3)]],
        );
        let stmt = find(&users(), &Clauses::default(), keys.as_ref()).finish(Adapter::MySql);
        assert!(stmt.sql.ends_with("FROM users WHERE id IN (?, ?);"));
        assert_eq!(stmt.params, vec![Value::Int(1), Value::Int(3)]);
    }

    #[test]
    fn test_composite_keys_filter() {
        let columns = vec!["tenant_id".to_string(), "id".to_string()];
        let filter = keys_filter(
            &columns,
            &[
                vec![Value::Int(1), Value::Int(10)],
                vec![Value::Int(1), Value::Int(11)],
            ],
        )
        .unwrap();
        assert_eq!(filter.sql, "(tenant_id, id) IN ((?, ?), (?, ?))");
        assert_eq!(filter.args.len(), 4);

        assert!(keys_filter(&columns, &[vec![Value::Int(1), Value::Int(0)]]).is_none());
    }

    #[test]
    fn test_key_filter_skips_zero_values() {
        let filter = key_filter(&[
            ("tenant_id".to_string(), Value::Int(0)),
            ("id".to_string(), Value::Int(7)),
        ])
        .unwrap();
        assert_eq!(filter.sql, "id = ?");
        assert!(key_filter(&[("id".to_string(), Value::Null)]).is_none());
    }

    #[test]
    fn test_insert_multi_row() {
        let rows = vec![
            vec![Value::from("a"), Value::from("a@x"), Value::Null],
            vec![Value::from("b"), Value::Null, Value::Null],
        ];
        let pg = insert(&users(), Adapter::Postgres, rows.clone()).finish(Adapter::Postgres);
        assert_eq!(
            pg.sql,
            "INSERT INTO users (name, email, created_at) VALUES ($1, $2, NULL), ($3, NULL, NULL) RETURNING id;"
        );
        assert_eq!(pg.params.len(), 3);

        let my = insert(&users(), Adapter::MySql, rows).finish(Adapter::MySql);
        assert!(!my.sql.contains("RETURNING"));
    }

    #[test]
    fn test_inserted_keys() {
        let stmt = inserted_keys(&users(), "id", 41, 3).finish(Adapter::MySql);
        assert_eq!(
            stmt.sql,
            "SELECT id FROM users WHERE id >= ? ORDER BY id ASC LIMIT 3;"
        );
        assert_eq!(stmt.params, vec![Value::Int(41)]);
    }

    #[test]
    fn test_update_and_delete() {
        let keys = Fragment::new("id = ?", vec![Value::Int(5)]);
        let stmt = update(
            &users(),
            vec![("name".to_string(), Value::from("bob"))],
            &keys,
        )
        .finish(Adapter::Postgres);
        assert_eq!(stmt.sql, "UPDATE users SET name = $1 WHERE id = $2;");

        let hard = delete(&users(), &keys, None).finish(Adapter::MySql);
        assert_eq!(hard.sql, "DELETE FROM users WHERE id = ?;");

        let soft = delete(&soft_users(), &keys, Some(Value::from("now"))).finish(Adapter::MySql);
        assert_eq!(
            soft.sql,
            "UPDATE users SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL;"
        );
    }

    #[test]
    fn test_bulk_statements() {
        let clauses = Clauses {
            filter: Some(Fragment::new("name = ?", vec![Value::from("x")])),
            ..Default::default()
        };
        let stamp = Value::from("2024-01-02 03:04:05");
        let stmt = delete_all(&soft_users(), &clauses, None, Some(stamp.clone())).finish(Adapter::MySql);
        assert_eq!(
            stmt.sql,
            "UPDATE users SET deleted_at = ? WHERE (name = ?) AND users.deleted_at IS NULL;"
        );
        assert_eq!(stmt.params, vec![stamp, Value::from("x")]);

        let stmt = delete_all(&users(), &Clauses::default(), None, None).finish(Adapter::MySql);
        assert_eq!(stmt.sql, "DELETE FROM users;");

        let set = Fragment::new("name = ?", vec![Value::from("y")]);
        let stmt = update_all(&users(), &set, &clauses, None).finish(Adapter::Postgres);
        assert_eq!(stmt.sql, "UPDATE users SET name = $1 WHERE name = $2;");
    }

    #[test]
    fn test_scan_with_group_and_having() {
        let clauses = Clauses {
            select: Some("name, COUNT(*) AS total".to_string()),
            join: Some(Fragment::new("JOIN posts ON posts.user_id = users.id", vec![])),
            group: Some("name".to_string()),
            having: Some(Fragment::new("COUNT(*) > ?", vec![Value::Int(1)])),
            ..Default::default()
        };
        let stmt = scan(&users(), &clauses).finish(Adapter::Postgres);
        assert_eq!(
            stmt.sql,
            "SELECT name, COUNT(*) AS total FROM users JOIN posts ON posts.user_id = users.id \
             GROUP BY name HAVING COUNT(*) > $1;"
        );
    }
}
