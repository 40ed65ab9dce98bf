/// Batch key lookups and batch writes
///
/// Both split their input into chunks the store accepts and re-submit
/// whatever the store reports as unprocessed, backing off per the retry
/// policy. Keys or writes still unprocessed once retries are exhausted fail
/// the statement with `ThroughputExceeded`.

use crate::executor::Executor;
use crate::store::{BatchGetRequest, BatchGetResponse, BatchWriteRequest, BatchWriteResponse, WriteRequest};
use dql_core::expression::ExpressionBuilder;
use dql_core::lang::Path;
use dql_core::schema::TableMeta;
use dql_core::throttle::Capacity;
use dql_core::{Error, Item, Result};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Identity of an item's primary key, for matching results back to keys
pub fn key_id(meta: &TableMeta, item: &Item) -> String {
    meta.primary_key_attributes()
        .into_iter()
        .map(|attr| match item.get(attr) {
            Some(value) => value.key_text(),
            None => String::new(),
        })
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

impl<'a> Executor<'a> {
    /// Fetches items by primary key. Results follow the order of `keys`;
    /// keys with no item are skipped.
    pub fn batch_get(
        &mut self,
        meta: &TableMeta,
        keys: &[Item],
        projection: Option<&[Path]>,
        consistent: bool,
    ) -> Result<Vec<Item>> {
        let mut found: HashMap<String, Item> = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(self.config.batch_get_size.max(1)) {
            let mut builder = ExpressionBuilder::new();
            let projection = projection.map(|paths| {
                // Key attributes are needed to match results to keys
                let mut paths = paths.to_vec();
                for attr in meta.primary_key_attributes() {
                    if !paths.iter().any(|p| p.root() == attr) {
                        paths.push(Path::attribute(attr));
                    }
                }
                builder.projection(&paths)
            });
            let context = builder.finish();

            let mut pending = chunk.to_vec();
            let mut attempt = 0;
            while !pending.is_empty() {
                let request = BatchGetRequest {
                    table: meta.name.clone(),
                    keys: pending,
                    projection: projection.clone(),
                    context: context.clone(),
                    consistent,
                };
                let response = self.call(
                    meta,
                    None,
                    |s| s.batch_get(&request),
                    |r: &BatchGetResponse| r.consumed,
                )?;
                debug!(
                    table = %meta.name,
                    requested = request.keys.len(),
                    found = response.items.len(),
                    unprocessed = response.unprocessed_keys.len(),
                    "batch get"
                );
                for item in response.items {
                    found.insert(key_id(meta, &item), item);
                }
                pending = response.unprocessed_keys;

                if !pending.is_empty() {
                    self.back_off(&meta.name, pending.len(), &mut attempt)?;
                }
            }
        }

        Ok(keys
            .iter()
            .filter_map(|key| found.remove(&key_id(meta, key)))
            .collect())
    }

    /// Writes puts and deletes in chunks; returns the number written.
    pub fn batch_write(&mut self, meta: &TableMeta, requests: Vec<WriteRequest>) -> Result<usize> {
        let total = requests.len();
        let size = self.config.batch_write_size.max(1);
        let mut requests = requests.into_iter().peekable();

        while requests.peek().is_some() {
            let mut pending: Vec<WriteRequest> = requests.by_ref().take(size).collect();
            let mut attempt = 0;
            while !pending.is_empty() {
                let request = BatchWriteRequest {
                    table: meta.name.clone(),
                    requests: pending,
                };
                let response = self.call(
                    meta,
                    None,
                    |s| s.batch_write(&request),
                    |r: &BatchWriteResponse| r.consumed,
                )?;
                pending = response.unprocessed;
                if !pending.is_empty() {
                    self.back_off(&meta.name, pending.len(), &mut attempt)?;
                }
            }
        }
        debug!(table = %meta.name, writes = total, "batch write complete");
        Ok(total)
    }

    /// Inserts items, with a single put for one item.
    pub fn insert(&mut self, meta: &TableMeta, items: Vec<Item>) -> Result<usize> {
        for item in &items {
            meta.primary_key(item)?;
        }
        match items.len() {
            0 => Ok(0),
            1 => {
                let item = &items[0];
                self.call(meta, None, |s| s.put_item(&meta.name, item), |c: &Capacity| *c)?;
                Ok(1)
            }
            _ => self.batch_write(meta, items.into_iter().map(WriteRequest::Put).collect()),
        }
    }

    /// Deletes items by primary key, with a single delete for one key.
    pub fn delete_keys(&mut self, meta: &TableMeta, keys: Vec<Item>) -> Result<usize> {
        match keys.len() {
            0 => Ok(0),
            1 => {
                let key = &keys[0];
                self.call(meta, None, |s| s.delete_item(&meta.name, key), |c: &Capacity| *c)?;
                Ok(1)
            }
            _ => self.batch_write(meta, keys.into_iter().map(WriteRequest::Delete).collect()),
        }
    }

    fn back_off(&self, table: &str, unprocessed: usize, attempt: &mut u32) -> Result<()> {
        let policy = &self.config.retry;
        if *attempt >= policy.max_attempts {
            return Err(Error::ThroughputExceeded(format!(
                "{} requests against table '{}' still unprocessed after {} retries",
                unprocessed, table, policy.max_attempts
            )));
        }
        let backoff = policy.backoff_duration(*attempt);
        warn!(
            table,
            unprocessed,
            attempt = *attempt + 1,
            backoff_ms = backoff.as_millis() as u64,
            "re-submitting unprocessed batch requests"
        );
        std::thread::sleep(backoff);
        *attempt += 1;
        Ok(())
    }
}
