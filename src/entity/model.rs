//! The model session: builds one operation over an entity or a batch of
//! entities, routes it to a database and runs hooks around it.

use crate::db::{DB, Engine, Row, Rows, Tx};
use crate::entity::hooks::{self, Action};
use crate::entity::schema::{Dependent, Schema};
use crate::entity::sql::{self, Clauses, Fragment, Statement};
use crate::entity::{Entity, key_values};
use crate::error::{DbError, DbResult, ModelError};
use crate::models::{Adapter, ExecOptions, ExecResult, Value};
use futures_util::future::BoxFuture;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, warn};

enum Dest<'a, E> {
    One(&'a mut E),
    Many(&'a mut Vec<E>),
}

impl<E: Entity> Dest<'_, E> {
    fn items(&self) -> Vec<&dyn Entity> {
        match self {
            Dest::One(e) => vec![&**e as &dyn Entity],
            Dest::Many(v) => v.iter().map(|e| e as &dyn Entity).collect(),
        }
    }

    fn items_mut(&mut self) -> Vec<&mut dyn Entity> {
        match self {
            Dest::One(e) => vec![&mut **e as &mut dyn Entity],
            Dest::Many(v) => v.iter_mut().map(|e| e as &mut dyn Entity).collect(),
        }
    }

    /// Key filter built from the destination itself.
    fn keys(&self, schema: &Schema) -> Option<Fragment> {
        match self {
            Dest::One(e) => sql::key_filter(&key_values(&**e)),
            Dest::Many(v) => {
                let rows: Vec<Vec<Value>> = v
                    .iter()
                    .map(|e| key_values(e).into_iter().map(|(_, v)| v).collect())
                    .collect();
                sql::keys_filter(schema.primary_key_columns(), &rows)
            }
        }
    }
}

/// Where statements run: a pooled database or the model's transaction.
enum Conn<'c> {
    Db(&'c DB),
    Tx(&'c mut Tx),
}

impl Conn<'_> {
    fn adapter(&self) -> Adapter {
        match self {
            Conn::Db(db) => db.adapter(),
            Conn::Tx(tx) => tx.adapter(),
        }
    }

    async fn exec(&mut self, stmt: &Statement) -> DbResult<ExecResult> {
        match self {
            Conn::Db(db) => db.exec(&stmt.sql, &stmt.params).await,
            Conn::Tx(tx) => tx.exec(&stmt.sql, &stmt.params).await,
        }
    }

    async fn query(&mut self, stmt: &Statement) -> DbResult<Rows> {
        match self {
            Conn::Db(db) => db.query(&stmt.sql, &stmt.params).await,
            Conn::Tx(tx) => tx.query(&stmt.sql, &stmt.params).await,
        }
    }
}

/// Affected rows plus everything that went wrong along the way.
#[derive(Debug, Default)]
struct Outcome {
    rows: u64,
    errors: Vec<DbError>,
    hook_failed: bool,
}

impl Outcome {
    fn failed(err: DbError) -> Self {
        Self {
            errors: vec![err],
            ..Default::default()
        }
    }

    fn hook_error(&mut self, err: DbError) {
        self.errors.push(err);
        self.hook_failed = true;
    }

    fn absorb(&mut self, other: Outcome) {
        self.errors.extend(other.errors);
        self.hook_failed |= other.hook_failed;
    }

    fn into_result(self) -> Result<u64, ModelError> {
        if self.errors.is_empty() {
            Ok(self.rows)
        } else {
            Err(ModelError::new(self.rows, self.errors))
        }
    }
}

/// A single-use query session over one entity or a batch of entities.
///
/// ```ignore
/// let mut user = User { name: "alice".into(), ..Default::default() };
/// Model::one(&engine, &mut user).create().exec().await?;
///
/// let mut users = Vec::new();
/// Model::many(&engine, &mut users)
///     .find()
///     .where_("name LIKE ?", &[Value::from("a%")])
///     .order("id")
///     .exec()
///     .await?;
/// ```
pub struct Model<'a, E: Entity + Default> {
    engine: &'a Engine,
    dest: Dest<'a, E>,
    schema: &'static Schema,
    action: Option<Action>,
    last_action: Option<Action>,
    clauses: Clauses,
    tx: Option<Tx>,
}

impl<'a, E: Entity + Default> Model<'a, E> {
    pub fn one(engine: &'a Engine, entity: &'a mut E) -> Self {
        let schema = entity.schema();
        Self::with_dest(engine, schema, Dest::One(entity))
    }

    pub fn many(engine: &'a Engine, entities: &'a mut Vec<E>) -> Self {
        let schema = E::default().schema();
        Self::with_dest(engine, schema, Dest::Many(entities))
    }

    fn with_dest(engine: &'a Engine, schema: &'static Schema, dest: Dest<'a, E>) -> Self {
        Self {
            engine,
            dest,
            schema,
            action: None,
            last_action: None,
            clauses: Clauses::default(),
            tx: None,
        }
    }

    fn set_action(&mut self, action: Action) -> &mut Self {
        self.action = Some(action);
        self
    }

    /// Every row, ignoring other clauses.
    pub fn all(&mut self) -> &mut Self {
        self.set_action(Action::All)
    }

    /// Rows matching the where clause, or the destination's primary keys when
    /// there is none.
    pub fn find(&mut self) -> &mut Self {
        self.set_action(Action::Find)
    }

    /// `SELECT COUNT(...)`; `exec` returns the count.
    pub fn count(&mut self) -> &mut Self {
        self.set_action(Action::Count)
    }

    pub fn create(&mut self) -> &mut Self {
        self.set_action(Action::Create)
    }

    pub fn update(&mut self) -> &mut Self {
        self.set_action(Action::Update)
    }

    pub fn delete(&mut self) -> &mut Self {
        self.set_action(Action::Delete)
    }

    /// Delete every matching row in one statement, without hooks.
    pub fn delete_all(&mut self) -> &mut Self {
        self.set_action(Action::DeleteAll)
    }

    /// `UPDATE <table> SET <set>` over every matching row, without hooks.
    pub fn update_all(&mut self, set: &str, args: &[Value]) -> &mut Self {
        self.clauses.set = Some(Fragment::new(set, args.to_vec()));
        self.set_action(Action::UpdateAll)
    }

    /// Add a condition. Repeated calls are joined with `AND`. List arguments
    /// expand into `?, ?, ...`.
    pub fn where_(&mut self, condition: &str, args: &[Value]) -> &mut Self {
        match &mut self.clauses.filter {
            Some(filter) => {
                filter.sql = format!("({}) AND ({})", filter.sql, condition);
                filter.args.extend_from_slice(args);
            }
            None => self.clauses.filter = Some(Fragment::new(condition, args.to_vec())),
        }
        self
    }

    pub fn join(&mut self, join: &str, args: &[Value]) -> &mut Self {
        self.clauses.join = Some(Fragment::new(join, args.to_vec()));
        self
    }

    pub fn select(&mut self, columns: &str) -> &mut Self {
        self.clauses.select = Some(columns.to_string());
        self
    }

    pub fn group(&mut self, columns: &str) -> &mut Self {
        self.clauses.group = Some(columns.to_string());
        self
    }

    pub fn having(&mut self, condition: &str, args: &[Value]) -> &mut Self {
        self.clauses.having = Some(Fragment::new(condition, args.to_vec()));
        self
    }

    pub fn order(&mut self, order: &str) -> &mut Self {
        self.clauses.order = Some(order.to_string());
        self
    }

    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.clauses.limit = Some(limit);
        self
    }

    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.clauses.offset = Some(offset);
        self
    }

    /// The model's open transaction, for statements outside the mapper.
    pub fn tx(&mut self) -> Option<&mut Tx> {
        self.tx.as_mut()
    }

    fn resolve(&self, names: &[String]) -> Vec<Arc<DB>> {
        names.iter().filter_map(|name| self.engine.db(name)).collect()
    }

    fn route(&self, use_replica: bool) -> DbResult<Arc<DB>> {
        let masters = self.resolve(self.schema.master_names());
        if masters.is_empty() {
            return Err(DbError::MissingMasterDb);
        }

        let candidates = if use_replica {
            let replicas = self.resolve(self.schema.replica_names());
            if replicas.is_empty() {
                return Err(DbError::MissingReplicaDb);
            }
            replicas
        } else {
            masters
        };

        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(DbError::MissingMasterDb)
    }

    fn adapter(&self) -> Adapter {
        self.schema
            .master_names()
            .iter()
            .chain(self.schema.replica_names())
            .find_map(|name| self.engine.db(name))
            .map(|db| db.adapter())
            .unwrap_or(Adapter::MySql)
    }

    pub async fn exec(&mut self) -> Result<u64, ModelError> {
        self.exec_with(ExecOptions::default()).await
    }

    /// Run the built operation and reset the builder.
    ///
    /// Returns the affected rows (the row count for reads, the count for
    /// `count`). Hook errors are collected; after-hook errors come back
    /// together with the rows the statement already changed. Inside
    /// `begin`, a failure leaves the transaction open for `commit` or
    /// `rollback`.
    pub async fn exec_with(&mut self, opts: ExecOptions) -> Result<u64, ModelError> {
        let db = self.route(opts.use_replica)?;
        let action = self.action.take().ok_or(DbError::EmptyQuery)?;
        let clauses = std::mem::take(&mut self.clauses);
        self.last_action = Some(action);

        debug!(
            db = %db.name(),
            table = %self.schema.table(),
            action = %action,
            in_tx = self.tx.is_some(),
            "Model exec"
        );

        let outcome = {
            let mut conn = match self.tx.as_mut() {
                Some(tx) => Conn::Tx(tx),
                None => Conn::Db(&db),
            };
            let run = run_action(action, &mut conn, self.schema, &mut self.dest, &clauses, opts);
            match opts.timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => Outcome::failed(DbError::timeout(
                        format!("{} on {}", action, self.schema.table()),
                        limit.as_secs(),
                    )),
                },
                None => run.await,
            }
        };

        // An open transaction stays open; the caller decides between
        // `commit` and `rollback`.
        if outcome.hook_failed && self.tx.is_some() {
            warn!(
                table = %self.schema.table(),
                action = %action,
                rows = outcome.rows,
                "Hook failed inside an open transaction"
            );
        }
        outcome.into_result()
    }

    pub async fn scan(&mut self) -> Result<Rows, ModelError> {
        self.scan_with(ExecOptions::default()).await
    }

    /// Run a free-form select built from `select`, `join`, `where_`, `group`,
    /// `having`, `order`, `limit` and `offset`, returning the raw rows.
    pub async fn scan_with(&mut self, opts: ExecOptions) -> Result<Rows, ModelError> {
        let db = self.route(opts.use_replica)?;
        let clauses = std::mem::take(&mut self.clauses);
        let mut conn = match self.tx.as_mut() {
            Some(tx) => Conn::Tx(tx),
            None => Conn::Db(&db),
        };
        let stmt = sql::scan(self.schema, &clauses).finish(conn.adapter());

        let rows = match opts.timeout {
            Some(limit) => tokio::time::timeout(limit, conn.query(&stmt))
                .await
                .map_err(|_| DbError::timeout(format!("scan on {}", self.schema.table()), limit.as_secs()))?,
            None => conn.query(&stmt).await,
        };
        Ok(rows?)
    }

    /// Begin a transaction on a randomly chosen master. Every later statement
    /// of this model runs in it until `commit` or `rollback`.
    pub async fn begin(&mut self) -> DbResult<()> {
        if self.tx.is_some() {
            return Ok(());
        }
        let db = self.route(false)?;
        self.tx = Some(db.begin().await?);
        Ok(())
    }

    /// Commit, then run `after_<action>_commit` for every element.
    pub async fn commit(&mut self) -> Result<(), ModelError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        tx.commit().await?;

        let Some(action) = self.last_action.filter(Action::has_hooks) else {
            return Ok(());
        };
        let errors: Vec<DbError> = self
            .dest
            .items_mut()
            .into_iter()
            .filter_map(|item| hooks::after_commit(action, item).err())
            .collect();
        collected(errors)
    }

    /// Roll back, then run `after_rollback` for every element.
    pub async fn rollback(&mut self) -> Result<(), ModelError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        tx.rollback().await?;

        let errors: Vec<DbError> = self
            .dest
            .items_mut()
            .into_iter()
            .filter_map(|item| item.after_rollback().err())
            .collect();
        collected(errors)
    }

    /// The SQL the built operation would run, one statement per line.
    pub fn sql(&self) -> String {
        let Some(action) = self.action else {
            return String::new();
        };
        let schema = self.schema;
        let adapter = self.adapter();
        let items = self.dest.items();

        let statements: Vec<Statement> = match action {
            Action::All => vec![sql::all(schema)],
            Action::Find => vec![sql::find(schema, &self.clauses, self.dest.keys(schema).as_ref())],
            Action::Count => vec![sql::count(schema, &self.clauses)],
            Action::Create => vec![sql::insert(schema, adapter, insert_rows(schema, &items))],
            Action::Update => items
                .iter()
                .filter_map(|item| {
                    let keys = sql::key_filter(&key_values(*item))?;
                    Some(sql::update(schema, update_values(schema, *item), &keys))
                })
                .collect(),
            Action::Delete => items
                .iter()
                .filter_map(|item| {
                    let keys = sql::key_filter(&key_values(*item))?;
                    Some(sql::delete(schema, &keys, soft_delete_stamp(schema)))
                })
                .collect(),
            Action::DeleteAll => vec![sql::delete_all(
                schema,
                &self.clauses,
                self.dest.keys(schema).as_ref(),
                soft_delete_stamp(schema),
            )],
            Action::UpdateAll => {
                let set = self.clauses.set.clone().unwrap_or_default();
                vec![sql::update_all(schema, &set, &self.clauses, self.dest.keys(schema).as_ref())]
            }
        };

        statements
            .into_iter()
            .map(|stmt| stmt.finish(adapter).sql)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn collected(errors: Vec<DbError>) -> Result<(), ModelError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ModelError::new(0, errors))
    }
}

fn missing_key(action: Action, schema: &Schema) -> DbError {
    DbError::MissingPrimaryKey {
        action: action.name().to_string(),
        table: schema.table().to_string(),
    }
}

fn insert_rows(schema: &Schema, items: &[&dyn Entity]) -> Vec<Vec<Value>> {
    items
        .iter()
        .map(|item| schema.writable_columns().map(|c| item.get(c)).collect())
        .collect()
}

fn update_values(schema: &Schema, item: &dyn Entity) -> Vec<(String, Value)> {
    schema
        .writable_columns()
        .map(|c| (c.to_string(), item.get(c)))
        .collect()
}

fn soft_delete_stamp(schema: &Schema) -> Option<Value> {
    schema
        .soft_delete_column()
        .map(|_| Value::Timestamp(schema.tz().now()))
}

/// Copy the mapped columns of `row` onto `item`.
fn load_row<T: Entity + ?Sized>(item: &mut T, row: &Row) -> DbResult<()> {
    let schema = item.schema();
    for (column, value) in row.values() {
        if schema.has_column(&column) {
            item.set(&column, value)?;
        }
    }
    Ok(())
}

async fn run_action<E: Entity + Default>(
    action: Action,
    conn: &mut Conn<'_>,
    schema: &'static Schema,
    dest: &mut Dest<'_, E>,
    clauses: &Clauses,
    opts: ExecOptions,
) -> Outcome {
    let adapter = conn.adapter();
    match action {
        Action::All => read(conn, dest, &sql::all(schema).finish(adapter)).await,
        Action::Find => {
            let keys = dest.keys(schema);
            let stmt = sql::find(schema, clauses, keys.as_ref()).finish(adapter);
            read(conn, dest, &stmt).await
        }
        Action::Count => {
            let stmt = sql::count(schema, clauses).finish(adapter);
            count(conn, &stmt).await
        }
        Action::Create => {
            let mut items = dest.items_mut();
            create_entities(conn, schema, &mut items, opts.skip_validate).await
        }
        Action::Update => {
            let mut items = dest.items_mut();
            update_entities(conn, schema, &mut items, opts.skip_validate).await
        }
        Action::Delete => {
            let mut items = dest.items_mut();
            delete_entities(conn, schema, &mut items).await
        }
        Action::DeleteAll => {
            let keys = dest.keys(schema);
            let stmt = sql::delete_all(schema, clauses, keys.as_ref(), soft_delete_stamp(schema))
                .finish(adapter);
            exec_rows(conn, &stmt).await
        }
        Action::UpdateAll => {
            let Some(set) = &clauses.set else {
                return Outcome::failed(DbError::EmptyQuery);
            };
            let keys = dest.keys(schema);
            let stmt = sql::update_all(schema, set, clauses, keys.as_ref()).finish(adapter);
            exec_rows(conn, &stmt).await
        }
    }
}

async fn exec_rows(conn: &mut Conn<'_>, stmt: &Statement) -> Outcome {
    match conn.exec(stmt).await {
        Ok(result) => Outcome {
            rows: result.rows_affected,
            ..Default::default()
        },
        Err(e) => Outcome::failed(e),
    }
}

async fn count(conn: &mut Conn<'_>, stmt: &Statement) -> Outcome {
    let rows = match conn.query(stmt).await {
        Ok(rows) => rows,
        Err(e) => return Outcome::failed(e),
    };
    let value = match rows.first().map(|row| row.value_at(0)).transpose() {
        Ok(value) => value.unwrap_or(Value::Int(0)),
        Err(e) => return Outcome::failed(e),
    };
    match value.as_i64() {
        Some(n) => Outcome {
            rows: n.max(0) as u64,
            ..Default::default()
        },
        None => Outcome::failed(DbError::decode(
            "count",
            format!("expected an integer, got {}", value.type_name()),
        )),
    }
}

/// Replace the destination with the selected rows.
async fn read<E: Entity + Default>(conn: &mut Conn<'_>, dest: &mut Dest<'_, E>, stmt: &Statement) -> Outcome {
    let rows = match conn.query(stmt).await {
        Ok(rows) => rows,
        Err(e) => return Outcome::failed(e),
    };

    let mut out = Outcome::default();
    match dest {
        Dest::One(entity) => {
            if let Some(row) = rows.first() {
                let mut fresh = E::default();
                match load_row(&mut fresh, row) {
                    Ok(()) => {
                        **entity = fresh;
                        out.rows = 1;
                    }
                    Err(e) => out.errors.push(e),
                }
            }
        }
        Dest::Many(entities) => {
            entities.clear();
            for row in rows.iter() {
                let mut fresh = E::default();
                match load_row(&mut fresh, row) {
                    Ok(()) => entities.push(fresh),
                    Err(e) => out.errors.push(e),
                }
            }
            out.rows = entities.len() as u64;
        }
    }
    out
}

/// Non-optional associations need an owner value or a foreign key.
fn check_owners(schema: &Schema, item: &mut dyn Entity) -> DbResult<()> {
    for assoc in schema.associations().iter().filter(|a| !a.optional) {
        let has_owner = item.owner_mut(&assoc.name).is_some();
        if !has_owner && item.get(&assoc.foreign_key).is_zero() {
            return Err(DbError::owner_nil(&assoc.name));
        }
    }
    Ok(())
}

fn assign_keys(schema: &Schema, items: &mut [&mut dyn Entity], rows: &Rows, out: &mut Outcome) {
    for (item, row) in items.iter_mut().zip(rows.iter()) {
        for (idx, column) in schema.primary_key_columns().iter().enumerate() {
            let assigned = row.value_at(idx).and_then(|value| item.set(column, value));
            if let Err(e) = assigned {
                out.errors.push(e);
            }
        }
    }
}

fn create_entities<'x, 'c: 'x, 'i: 'x>(
    conn: &'x mut Conn<'c>,
    schema: &'static Schema,
    items: &'x mut [&'i mut dyn Entity],
    skip_validate: bool,
) -> BoxFuture<'x, Outcome> {
    Box::pin(async move {
        let mut out = Outcome::default();
        if items.is_empty() {
            return out;
        }

        if let Some(column) = schema.created_at_column() {
            let now = Value::Timestamp(schema.tz().now());
            for item in items.iter_mut() {
                if let Err(e) = item.set(column, now.clone()) {
                    out.errors.push(e);
                }
            }
        }

        for item in items.iter_mut() {
            if let Err(e) = hooks::before(Action::Create, &mut **item, skip_validate) {
                out.hook_error(e);
                continue;
            }
            if let Err(e) = check_owners(schema, &mut **item) {
                out.errors.push(e);
            }
        }
        if !out.errors.is_empty() {
            return out;
        }

        for item in items.iter_mut() {
            for assoc in schema.associations() {
                let owner_key = {
                    let Some(owner) = item.owner_mut(&assoc.name) else {
                        continue;
                    };
                    let owner_schema = owner.schema();
                    let mut owners: [&mut dyn Entity; 1] = [owner];
                    if owners[0].get(&assoc.primary_key).is_zero() {
                        let nested = create_entities(conn, owner_schema, &mut owners, skip_validate).await;
                        if !nested.errors.is_empty() {
                            out.absorb(nested);
                            return out;
                        }
                    }
                    owners[0].get(&assoc.primary_key)
                };
                if let Err(e) = item.set(&assoc.foreign_key, owner_key) {
                    out.errors.push(e);
                    return out;
                }
            }
        }

        let adapter = conn.adapter();
        let rows = {
            let snapshot: Vec<&dyn Entity> = items.iter().map(|item| &**item as &dyn Entity).collect();
            insert_rows(schema, &snapshot)
        };
        let stmt = sql::insert(schema, adapter, rows).finish(adapter);
        let has_keys = !schema.primary_key_columns().is_empty();

        if adapter.supports_returning() && has_keys {
            match conn.query(&stmt).await {
                Ok(returned) => {
                    out.rows = returned.len() as u64;
                    assign_keys(schema, items, &returned, &mut out);
                }
                Err(e) => {
                    out.errors.push(e);
                    return out;
                }
            }
        } else {
            let result = match conn.exec(&stmt).await {
                Ok(result) => result,
                Err(e) => {
                    out.errors.push(e);
                    return out;
                }
            };
            out.rows = result.rows_affected;

            let first_id = result.last_insert_id.filter(|id| *id > 0);
            if let (Some(auto), Some(first_id), true) = (schema.auto_increment_column(), first_id, has_keys) {
                let stmt = sql::inserted_keys(schema, auto, first_id, items.len()).finish(adapter);
                match conn.query(&stmt).await {
                    Ok(returned) => assign_keys(schema, items, &returned, &mut out),
                    Err(e) => out.errors.push(e),
                }
            }
        }

        for item in items.iter_mut() {
            if let Err(e) = hooks::after(Action::Create, &mut **item) {
                out.hook_error(e);
            }
        }
        out
    })
}

async fn update_entities(
    conn: &mut Conn<'_>,
    schema: &'static Schema,
    items: &mut [&mut dyn Entity],
    skip_validate: bool,
) -> Outcome {
    let mut out = Outcome::default();
    let adapter = conn.adapter();
    let stamp = schema
        .updated_at_column()
        .map(|column| (column, Value::Timestamp(schema.tz().now())));

    for item in items.iter_mut() {
        if let Some((column, now)) = &stamp {
            if let Err(e) = item.set(column, now.clone()) {
                out.errors.push(e);
                continue;
            }
        }
        if let Err(e) = hooks::before(Action::Update, &mut **item, skip_validate) {
            out.hook_error(e);
            continue;
        }

        let Some(keys) = sql::key_filter(&key_values(&**item)) else {
            out.errors.push(missing_key(Action::Update, schema));
            continue;
        };
        let stmt = sql::update(schema, update_values(schema, &**item), &keys).finish(adapter);
        match conn.exec(&stmt).await {
            Ok(result) => out.rows += result.rows_affected,
            Err(e) => {
                out.errors.push(e);
                continue;
            }
        }

        if let Err(e) = hooks::after(Action::Update, &mut **item) {
            out.hook_error(e);
        }
    }
    out
}

fn delete_entities<'x, 'c: 'x, 'i: 'x>(
    conn: &'x mut Conn<'c>,
    schema: &'static Schema,
    items: &'x mut [&'i mut dyn Entity],
) -> BoxFuture<'x, Outcome> {
    Box::pin(async move {
        let mut out = Outcome::default();
        let adapter = conn.adapter();

        for item in items.iter_mut() {
            if let Err(e) = hooks::before(Action::Delete, &mut **item, true) {
                out.hook_error(e);
                continue;
            }

            let Some(keys) = sql::key_filter(&key_values(&**item)) else {
                out.errors.push(missing_key(Action::Delete, schema));
                continue;
            };
            let stamp = soft_delete_stamp(schema);
            let stmt = sql::delete(schema, &keys, stamp.clone()).finish(adapter);
            match conn.exec(&stmt).await {
                Ok(result) => out.rows += result.rows_affected,
                Err(e) => {
                    out.errors.push(e);
                    continue;
                }
            }

            if let (Some(column), Some(stamp)) = (schema.soft_delete_column(), stamp) {
                if let Err(e) = item.set(column, stamp) {
                    out.errors.push(e);
                }
            }

            if let Err(e) = hooks::after(Action::Delete, &mut **item) {
                out.hook_error(e);
                continue;
            }

            let cascaded = cascade_owners(conn, schema, &**item).await;
            out.absorb(cascaded);
        }
        out
    })
}

/// `touch` and `dependent` handling for a deleted row.
async fn cascade_owners(conn: &mut Conn<'_>, schema: &'static Schema, item: &dyn Entity) -> Outcome {
    let mut out = Outcome::default();
    let adapter = conn.adapter();

    for assoc in schema.associations() {
        let foreign_key = item.get(&assoc.foreign_key);
        if foreign_key.is_zero() {
            continue;
        }
        let owner_schema = assoc.owner_schema();
        let owner_keys = Fragment::new(format!("{} = ?", assoc.primary_key), vec![foreign_key.clone()]);

        if assoc.touch {
            if let Some(column) = owner_schema.updated_at_column() {
                let stamp = Value::Timestamp(owner_schema.tz().now());
                let stmt = sql::touch(owner_schema, column, stamp, &assoc.primary_key, foreign_key.clone())
                    .finish(adapter);
                if let Err(e) = conn.exec(&stmt).await {
                    out.errors.push(e);
                }
            }
        }

        match assoc.dependent {
            Dependent::None => {}
            Dependent::DeleteWithoutCallbacks => {
                let stmt = sql::delete(owner_schema, &owner_keys, None).finish(adapter);
                if let Err(e) = conn.exec(&stmt).await {
                    out.errors.push(e);
                }
            }
            Dependent::Delete => {
                let stmt = sql::find(owner_schema, &Clauses::default(), Some(&owner_keys)).finish(adapter);
                let rows = match conn.query(&stmt).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        out.errors.push(e);
                        continue;
                    }
                };
                let Some(row) = rows.first() else {
                    debug!(association = %assoc.name, "Owner already gone");
                    continue;
                };

                let mut owner = assoc.new_owner();
                if let Err(e) = load_row(owner.as_mut(), row) {
                    out.errors.push(e);
                    continue;
                }
                let mut owners: [&mut dyn Entity; 1] = [owner.as_mut()];
                let nested = delete_entities(conn, owner_schema, &mut owners).await;
                out.absorb(nested);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_db_configs;
    use crate::entity::schema::{BelongsTo, Column};
    use crate::entity::Hooks;
    use std::sync::LazyLock;

    static ACCOUNT: LazyLock<Schema> = LazyLock::new(|| {
        Schema::new("accounts")
            .column(Column::new("id").auto_increment())
            .columns(["name"])
            .updated_at("updated_at")
    });

    static USER: LazyLock<Schema> = LazyLock::new(|| {
        Schema::new("users")
            .column(Column::new("id").auto_increment())
            .columns(["name", "account_id"])
            .replicas(["primaryReplica"])
            .soft_delete("deleted_at")
            .belongs_to(BelongsTo::new::<Account>("account").touch())
    });

    #[derive(Debug, Default)]
    struct Account {
        id: i64,
        name: String,
    }

    impl Hooks for Account {}

    impl Entity for Account {
        fn schema(&self) -> &'static Schema {
            &ACCOUNT
        }

        fn get(&self, column: &str) -> Value {
            match column {
                "id" => Value::Int(self.id),
                "name" => Value::from(&self.name),
                _ => Value::Null,
            }
        }

        fn set(&mut self, column: &str, value: Value) -> DbResult<()> {
            match column {
                "id" => self.id = value.as_i64().unwrap_or_default(),
                "name" => self.name = value.into_string().unwrap_or_default(),
                _ => {}
            }
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct User {
        id: i64,
        name: String,
        account_id: i64,
    }

    impl Hooks for User {}

    impl Entity for User {
        fn schema(&self) -> &'static Schema {
            &USER
        }

        fn get(&self, column: &str) -> Value {
            match column {
                "id" => Value::Int(self.id),
                "name" => Value::from(&self.name),
                "account_id" => Value::Int(self.account_id),
                _ => Value::Null,
            }
        }

        fn set(&mut self, column: &str, value: Value) -> DbResult<()> {
            match column {
                "id" => self.id = value.as_i64().unwrap_or_default(),
                "name" => self.name = value.into_string().unwrap_or_default(),
                "account_id" => self.account_id = value.as_i64().unwrap_or_default(),
                _ => {}
            }
            Ok(())
        }
    }

    fn engine(vars: &[(&str, &str)]) -> Engine {
        let (configs, errors) = parse_db_configs(vars.iter().map(|(k, v)| (*k, *v)));
        Engine::new(configs, errors)
    }

    fn pg_engine() -> Engine {
        engine(&[("DB_URI_PRIMARY", "postgres://u:p@localhost/app")])
    }

    #[test]
    fn test_find_by_primary_keys() {
        let engine = pg_engine();
        let mut users = vec![
            User { id: 1, ..Default::default() },
            User { id: 2, ..Default::default() },
        ];
        let mut model = Model::many(&engine, &mut users);
        model.find();
        assert_eq!(
            model.sql(),
            "SELECT users.id, users.name, users.account_id, users.deleted_at FROM users \
             WHERE (id IN ($1, $2)) AND users.deleted_at IS NULL;"
        );
    }

    #[test]
    fn test_find_with_where_ignores_keys() {
        let engine = pg_engine();
        let mut user = User { id: 7, ..Default::default() };
        let mut model = Model::one(&engine, &mut user);
        model
            .find()
            .where_("name = ?", &[Value::from("alice")])
            .where_("account_id IN (?)", &[Value::List(vec![Value::Int(1), Value::Int(2)])])
            .limit(1);
        assert!(model.sql().ends_with(
            "WHERE ((name = $1) AND (account_id IN ($2, $3))) AND users.deleted_at IS NULL LIMIT 1;"
        ));
    }

    #[test]
    fn test_create_sql_omits_auto_increment() {
        let engine = engine(&[("DB_URI_PRIMARY", "mysql://root@localhost/app")]);
        let mut users = vec![
            User { name: "a".into(), account_id: 1, ..Default::default() },
            User { name: "b".into(), account_id: 1, ..Default::default() },
        ];
        let mut model = Model::many(&engine, &mut users);
        model.create();
        assert_eq!(
            model.sql(),
            "INSERT INTO users (name, account_id, deleted_at) VALUES (?, ?, NULL), (?, ?, NULL);"
        );
    }

    #[test]
    fn test_soft_delete_sql_per_element() {
        let engine = pg_engine();
        let mut users = vec![
            User { id: 1, ..Default::default() },
            User { id: 0, ..Default::default() },
            User { id: 3, ..Default::default() },
        ];
        let mut model = Model::many(&engine, &mut users);
        model.delete();
        let sql = model.sql();
        let lines: Vec<&str> = sql.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "UPDATE users SET deleted_at = $1 WHERE id = $2 AND deleted_at IS NULL;"
        );
    }

    #[test]
    fn test_count_and_update_all_sql() {
        let engine = pg_engine();
        let mut users: Vec<User> = Vec::new();
        let mut model = Model::many(&engine, &mut users);
        model.count().where_("name = ?", &[Value::from("x")]);
        assert_eq!(
            model.sql(),
            "SELECT COUNT(*) FROM users WHERE (name = $1) AND users.deleted_at IS NULL;"
        );

        let mut users: Vec<User> = Vec::new();
        let mut model = Model::many(&engine, &mut users);
        model.update_all("name = ?", &[Value::from("y")]);
        assert_eq!(
            model.sql(),
            "UPDATE users SET name = $1 WHERE users.deleted_at IS NULL;"
        );
    }

    #[tokio::test]
    async fn test_exec_without_master() {
        let engine = Engine::default();
        let mut user = User::default();
        let err = Model::one(&engine, &mut user).all().exec().await.unwrap_err();
        assert!(matches!(err.first(), Some(DbError::MissingMasterDb)));
    }

    #[tokio::test]
    async fn test_exec_without_replica() {
        let engine = pg_engine();
        let mut user = User::default();
        let opts = ExecOptions {
            use_replica: true,
            ..Default::default()
        };
        let err = Model::one(&engine, &mut user)
            .all()
            .exec_with(opts)
            .await
            .unwrap_err();
        assert!(matches!(err.first(), Some(DbError::MissingReplicaDb)));
    }

    #[tokio::test]
    async fn test_exec_without_action() {
        let engine = pg_engine();
        let mut user = User::default();
        let err = Model::one(&engine, &mut user).exec().await.unwrap_err();
        assert!(matches!(err.first(), Some(DbError::EmptyQuery)));
    }

    #[tokio::test]
    async fn test_create_without_owner_fails_before_sql() {
        // Not connected: reaching SQL would fail with NotConnected instead.
        let engine = pg_engine();
        let mut user = User {
            name: "orphan".into(),
            ..Default::default()
        };
        let err = Model::one(&engine, &mut user)
            .create()
            .exec()
            .await
            .unwrap_err();
        assert_eq!(err.rows_affected, 0);
        assert_eq!(err.to_string(), "account owner cannot be nil");
    }

    #[tokio::test]
    async fn test_update_without_key() {
        let engine = pg_engine();
        let mut user = User {
            account_id: 1,
            ..Default::default()
        };
        let err = Model::one(&engine, &mut user)
            .update()
            .exec()
            .await
            .unwrap_err();
        assert!(matches!(err.first(), Some(DbError::MissingPrimaryKey { .. })));
    }
}
