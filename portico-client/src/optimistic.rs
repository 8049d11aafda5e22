//! Apply-then-reconcile local row sets.
//!
//! Every local edit bumps the entity's epoch before the write goes out. A
//! response reconciles the local row only if no newer edit of that entity
//! started meanwhile; older responses still advance the last confirmed row,
//! which is what a failed current edit rolls back to. A write that matches no
//! row on the server counts as a failure.

use std::sync::{Mutex, MutexGuard};

use portico_core::{Filter, GatewayError, GatewayResult, Mutation, Outcome, Row, TableName, ValidationError};
use portico_gateway::BackendGateway;
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub const DEFAULT_ID_FIELD: &str = "id";

#[derive(Debug, Clone)]
struct Entity {
    id: String,
    /// The id exactly as the server sent it; writes filter on this.
    key: Value,
    local: Row,
    deleted: bool,
    epoch: u64,
    confirmed: Option<Row>,
    confirmed_epoch: u64,
}

/// A table's rows as the UI shows them, edited optimistically.
#[derive(Debug)]
pub struct OptimisticCollection {
    gateway: BackendGateway,
    table: TableName,
    id_field: String,
    entities: Mutex<Vec<Entity>>,
}

impl OptimisticCollection {
    pub fn new(gateway: BackendGateway, table: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            gateway,
            table: TableName::new(table)?,
            id_field: DEFAULT_ID_FIELD.to_string(),
            entities: Mutex::new(Vec::new()),
        })
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Replace every row with server-confirmed `rows`. Rows without an id are skipped.
    pub fn replace_all(&self, rows: Vec<Row>) {
        let entities = rows
            .into_iter()
            .filter_map(|row| {
                let (id, key) = self.id_of(&row)?;
                Some(Entity {
                    id,
                    key,
                    local: row.clone(),
                    deleted: false,
                    epoch: 0,
                    confirmed: Some(row),
                    confirmed_epoch: 0,
                })
            })
            .collect();
        *self.lock() = entities;
    }

    /// Visible rows, in load order.
    pub fn rows(&self) -> Vec<Row> {
        self.lock()
            .iter()
            .filter(|entity| !entity.deleted)
            .map(|entity| entity.local.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Row> {
        self.lock()
            .iter()
            .find(|entity| entity.id == id && !entity.deleted)
            .map(|entity| entity.local.clone())
    }

    /// Merge `patch` into the local row now, then write it through the gateway.
    pub async fn update(&self, id: &str, patch: Map<String, Value>) -> Outcome<Row> {
        let (epoch, key) = {
            let mut entities = self.lock();
            let Some(entity) = entities.iter_mut().find(|e| e.id == id && !e.deleted) else {
                return Outcome::error(format!("no row {} in {}", id, self.table));
            };
            if let Some(local) = entity.local.as_object_mut() {
                local.extend(patch.clone());
            }
            entity.epoch += 1;
            (entity.epoch, entity.key.clone())
        };

        let result = match Mutation::update(self.table.as_str(), self.id_filter(key), patch) {
            Ok(mutation) => self.write(id, &mutation).await,
            Err(err) => return self.rollback_invalid(id, epoch, err),
        };
        self.reconcile(id, epoch, false, result)
    }

    /// Flip a boolean column. A missing or non-boolean value counts as `false`.
    pub async fn toggle(&self, id: &str, field: &str) -> Outcome<Row> {
        let current = self
            .get(id)
            .and_then(|row| row.get(field).and_then(Value::as_bool))
            .unwrap_or(false);
        let mut patch = Map::new();
        patch.insert(field.to_string(), Value::Bool(!current));
        self.update(id, patch).await
    }

    /// Hide the row now, then delete it through the gateway.
    pub async fn remove(&self, id: &str) -> Outcome<Row> {
        let (epoch, key) = {
            let mut entities = self.lock();
            let Some(entity) = entities.iter_mut().find(|e| e.id == id && !e.deleted) else {
                return Outcome::error(format!("no row {} in {}", id, self.table));
            };
            entity.deleted = true;
            entity.epoch += 1;
            (entity.epoch, entity.key.clone())
        };

        let result = match Mutation::delete(self.table.as_str(), self.id_filter(key)) {
            Ok(mutation) => self.write(id, &mutation).await,
            Err(err) => return self.rollback_invalid(id, epoch, err),
        };
        self.reconcile(id, epoch, true, result)
    }

    /// Send a single-row write; zero affected rows is an error.
    async fn write(&self, id: &str, mutation: &Mutation) -> GatewayResult<Vec<Row>> {
        let rows = self.gateway.mutate(mutation).await?;
        if rows.is_empty() {
            return Err(GatewayError::invalid_response(
                self.gateway.provider(),
                format!("no {} row matched id {}", self.table, id),
            ));
        }
        Ok(rows)
    }

    fn reconcile(
        &self,
        id: &str,
        epoch: u64,
        deleting: bool,
        result: GatewayResult<Vec<Row>>,
    ) -> Outcome<Row> {
        let mut entities = self.lock();
        let Some(index) = entities.iter().position(|e| e.id == id) else {
            return result.map(first_row).into();
        };
        let entity = &mut entities[index];

        if let Ok(rows) = &result {
            if epoch > entity.confirmed_epoch {
                entity.confirmed = server_row(rows, deleting);
                entity.confirmed_epoch = epoch;
            }
        }

        if entity.epoch != epoch {
            debug!(table = %self.table, id, epoch, current = entity.epoch, "discarding superseded reconciliation");
            return result.map(first_row).into();
        }

        match &result {
            Ok(rows) => match server_row(rows, deleting) {
                Some(row) => {
                    entity.local = row;
                    entity.deleted = false;
                }
                None => {
                    entities.remove(index);
                }
            },
            Err(err) => {
                warn!(table = %self.table, id, error = %err, "write failed; rolling back");
                match entity.confirmed.clone() {
                    Some(row) => {
                        entity.local = row;
                        entity.deleted = false;
                    }
                    None => entity.deleted = true,
                }
            }
        }
        result.map(first_row).into()
    }

    fn rollback_invalid(&self, id: &str, epoch: u64, err: ValidationError) -> Outcome<Row> {
        let mut entities = self.lock();
        if let Some(entity) = entities.iter_mut().find(|e| e.id == id && e.epoch == epoch) {
            if let Some(row) = entity.confirmed.clone() {
                entity.local = row;
                entity.deleted = false;
            }
        }
        Outcome::error(err.to_string())
    }

    fn id_filter(&self, key: Value) -> Filter {
        let mut filter = Filter::new();
        filter.insert(self.id_field.clone(), key);
        filter
    }

    /// Lookup id and the raw id value. Only string and numeric ids count.
    fn id_of(&self, row: &Row) -> Option<(String, Value)> {
        let key = row.get(&self.id_field)?;
        let id = match key {
            Value::String(id) => id.clone(),
            Value::Number(id) => id.to_string(),
            _ => return None,
        };
        Some((id, key.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entity>> {
        self.entities
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The row the server holds after a successful write; `None` after a delete.
fn server_row(rows: &[Row], deleting: bool) -> Option<Row> {
    if deleting {
        None
    } else {
        rows.first().cloned()
    }
}

fn first_row(rows: Vec<Row>) -> Row {
    rows.into_iter().next().unwrap_or(Value::Null)
}
