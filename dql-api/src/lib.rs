//! Execution layer for DQL
//!
//! ```ignore
//! let engine = Engine::new(store);
//! engine.execute("CREATE TABLE forum (id STRING HASH KEY, ts NUMBER RANGE KEY)")?;
//! engine.execute("INSERT INTO forum (id, ts, title) VALUES ('a', 1, 'hello')")?;
//! let response = engine.execute("SELECT title FROM forum WHERE id = 'a' DESC LIMIT 10")?;
//! ```

pub mod store;
pub use store::{
    BatchGetRequest, BatchGetResponse, BatchWriteRequest, BatchWriteResponse, IndexUpdate, Page, QueryRequest,
    ScanRequest, Store, UpdateItemRequest, UpdateItemResponse, UpdateTableRequest, WriteRequest,
};

pub mod executor;
pub use executor::{Executor, ReadOutput, Usage};

pub mod batch;
pub mod update;
pub use update::{UpdateOutput, CONDITIONAL_CHECK_FAILED};

pub mod explain;

pub mod engine;
pub use engine::{Engine, ExecuteStatementResponse, Loader, Output};

pub use dql_core::{Error, Item, Result, Value};
