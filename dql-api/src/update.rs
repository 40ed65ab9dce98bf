/// UPDATE execution
///
/// The matching keys are collected first; then each key gets its own
/// `update_item` call carrying the same translated update expression. A
/// condition on the hash key keeps an update from recreating an item that
/// was deleted after its key was read.

use crate::executor::Executor;
use crate::store::{UpdateItemRequest, UpdateItemResponse};
use dql_core::expression::ExpressionBuilder;
use dql_core::lang::{Function, Path, Predicate, Returns, UpdateAction};
use dql_core::schema::TableMeta;
use dql_core::{Error, Item, Result};
use tracing::debug;

/// Remote error code of a failed condition check
pub const CONDITIONAL_CHECK_FAILED: &str = "ConditionalCheckFailedException";

/// Outcome of an UPDATE
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutput {
    pub updated: usize,
    /// Attributes selected by RETURNS, one entry per updated item
    pub items: Vec<Item>,
}

/// Builds the request template shared by every key of one UPDATE.
pub fn update_request(meta: &TableMeta, actions: &[UpdateAction], returns: Returns) -> Result<UpdateItemRequest> {
    let mut builder = ExpressionBuilder::new();
    let update_expression = builder.update(actions)?;
    let guard = Predicate::Function(Function::AttributeExists(Path::attribute(
        meta.hash_key.name.as_str(),
    )));
    let condition = builder.condition(&guard)?;
    Ok(UpdateItemRequest {
        table: meta.name.clone(),
        key: Item::new(),
        update_expression,
        condition: Some(condition),
        context: builder.finish(),
        returns,
    })
}

impl<'a> Executor<'a> {
    /// Applies `actions` to every key.
    pub fn update_keys(
        &mut self,
        meta: &TableMeta,
        keys: Vec<Item>,
        actions: &[UpdateAction],
        returns: Returns,
    ) -> Result<UpdateOutput> {
        let template = update_request(meta, actions, returns)?;
        let mut output = UpdateOutput::default();

        for key in keys {
            let request = UpdateItemRequest {
                key,
                ..template.clone()
            };
            let response = self.call(
                meta,
                None,
                |s| match s.update_item(&request) {
                    Err(Error::Remote { code, .. }) if code == CONDITIONAL_CHECK_FAILED => Ok(None),
                    other => other.map(Some),
                },
                |r: &Option<UpdateItemResponse>| r.as_ref().map(|r| r.consumed).unwrap_or_default(),
            )?;

            match response {
                Some(response) => {
                    output.updated += 1;
                    if let Some(attributes) = response.attributes {
                        output.items.push(attributes);
                    }
                }
                None => debug!(table = %meta.name, "item vanished before update, skipping"),
            }
        }
        Ok(output)
    }
}
