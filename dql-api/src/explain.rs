/// EXPLAIN rendering
///
/// One line per store request a statement would issue, in the store's own
/// terms: expressions with placeholders, their bindings, direction and
/// limits. Work the engine does locally (hydration lookups, client-side
/// filtering and sorting) gets a line of its own.

use crate::executor::{first_pass_projection, query_request, scan_request};
use crate::update::update_request;
use dql_core::config::EngineConfig;
use dql_core::expression::{ExpressionBuilder, ExpressionContext};
use dql_core::lang::{Returns, UpdateAction};
use dql_core::planner::{Plan, PlanKind};
use dql_core::schema::TableMeta;
use dql_core::Result;

fn bindings(context: &ExpressionContext) -> Vec<String> {
    let mut parts = Vec::new();
    if !context.names.is_empty() {
        let names: Vec<String> = context
            .names
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        parts.push(format!("names={{{}}}", names.join(", ")));
    }
    if !context.values.is_empty() {
        let values: Vec<String> = context
            .values
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        parts.push(format!("values={{{}}}", values.join(", ")));
    }
    parts
}

fn call(operation: &str, args: Vec<String>) -> String {
    format!("{}({})", operation, args.join(", "))
}

/// Requests and local steps of a read plan.
pub fn read_lines(meta: &TableMeta, plan: &Plan, config: &EngineConfig) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let projection = first_pass_projection(meta, plan);

    match plan.kind {
        PlanKind::Query | PlanKind::Scan => {
            let mut args = vec![format!("table={}", plan.table)];
            if let Some(index) = &plan.index {
                args.push(format!("index={}", index));
            }
            let (context, select_count) = if plan.kind == PlanKind::Query {
                let request = query_request(plan, projection.as_deref())?;
                args.push(format!("key_condition=\"{}\"", request.key_condition));
                if let Some(filter) = &request.filter {
                    args.push(format!("filter=\"{}\"", filter));
                }
                if let Some(projection) = &request.projection {
                    args.push(format!("projection=\"{}\"", projection));
                }
                if !request.ascending {
                    args.push("ascending=false".to_string());
                }
                (request.context, request.count)
            } else {
                let request = scan_request(plan, projection.as_deref())?;
                if let Some(filter) = &request.filter {
                    args.push(format!("filter=\"{}\"", filter));
                }
                if let Some(projection) = &request.projection {
                    args.push(format!("projection=\"{}\"", projection));
                }
                (request.context, request.count)
            };
            args.extend(bindings(&context));
            if select_count {
                args.push("select=COUNT".to_string());
            }
            if let Some(size) = config.page_size {
                args.push(format!("page_size={}", size));
            }
            if plan.consistent {
                args.push("consistent=true".to_string());
            }
            let operation = if plan.kind == PlanKind::Query { "Query" } else { "Scan" };
            lines.push(call(operation, args));

            if plan.hydrate {
                lines.push(batch_get_line(plan, "per page"));
            }
        }
        PlanKind::BatchGet => {
            lines.push(batch_get_line(plan, &format!("{} keys", plan.keys.len())));
        }
    }

    if let Some(filter) = &plan.client_filter {
        lines.push(format!("Filter(client, \"{}\")", filter));
    }
    if let Some(sort) = &plan.sort {
        lines.push(format!(
            "Sort(attribute={}, ascending={})",
            sort.attribute, sort.ascending
        ));
    }
    if let Some(limit) = plan.limit {
        lines.push(format!("Limit({})", limit));
    }
    if let Some(scan_limit) = plan.scan_limit {
        lines.push(format!("ScanLimit({})", scan_limit));
    }
    Ok(lines)
}

fn batch_get_line(plan: &Plan, keys: &str) -> String {
    let mut args = vec![format!("table={}", plan.table), format!("keys={}", keys)];
    if let Some(fetch) = &plan.fetch {
        let mut builder = ExpressionBuilder::new();
        args.push(format!("projection=\"{}\"", builder.projection(fetch)));
        args.extend(bindings(builder.context()));
    }
    if plan.consistent {
        args.push("consistent=true".to_string());
    }
    call("BatchGetItem", args)
}

/// Writes of an INSERT of `count` items.
pub fn insert_lines(table: &str, count: usize, config: &EngineConfig) -> Vec<String> {
    if count == 1 {
        return vec![call("PutItem", vec![format!("table={}", table)])];
    }
    let calls = count.div_ceil(config.batch_write_size.max(1));
    vec![call(
        "BatchWriteItem",
        vec![
            format!("table={}", table),
            format!("puts={}", count),
            format!("requests={}", calls),
        ],
    )]
}

/// Writes of a DELETE, after its key-collecting read.
pub fn delete_lines(table: &str, config: &EngineConfig) -> Vec<String> {
    vec![call(
        "BatchWriteItem",
        vec![
            format!("table={}", table),
            "deletes=per key".to_string(),
            format!("batch_size={}", config.batch_write_size),
        ],
    )]
}

/// Writes of an UPDATE, after its key-collecting read.
pub fn update_lines(meta: &TableMeta, actions: &[UpdateAction], returns: Returns) -> Result<Vec<String>> {
    let request = update_request(meta, actions, returns)?;
    let mut args = vec![
        format!("table={}", meta.name),
        "key=per key".to_string(),
        format!("update_expression=\"{}\"", request.update_expression),
    ];
    if let Some(condition) = &request.condition {
        args.push(format!("condition=\"{}\"", condition));
    }
    args.extend(bindings(&request.context));
    if returns != Returns::None {
        args.push(format!("returns={}", returns.as_str()));
    }
    Ok(vec![call("UpdateItem", args)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use dql_core::lang::DqlParser;
    use dql_core::planner::{Planner, PlannerOptions};
    use dql_core::schema::{GlobalIndex, KeyAttribute, KeyType};

    fn meta() -> TableMeta {
        TableMeta::new("t", KeyAttribute::new("id", KeyType::S)).with_global_index(
            GlobalIndex::new("bar-index", KeyAttribute::new("bar", KeyType::S)).keys_only(),
        )
    }

    fn lines(text: &str) -> Vec<String> {
        let meta = meta();
        let stmt = DqlParser::parse_statement(text).unwrap();
        let plan = Planner::new(&meta, PlannerOptions::default()).plan(&stmt).unwrap();
        read_lines(&meta, &plan, &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_explain_query() {
        assert_eq!(
            lines("SELECT * FROM t WHERE id = 'a' AND n > 2 LIMIT 3"),
            vec![
                "Query(table=t, key_condition=\"#n0 = :v0\", filter=\"#n1 > :v1\", names={#n0: id, #n1: n}, values={:v0: \"a\", :v1: 2})",
                "Limit(3)",
            ]
        );
    }

    #[test]
    fn test_explain_hydrating_index_query() {
        let lines = lines("SELECT * FROM t WHERE bar = 'x' DESC");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Query(table=t, index=bar-index, key_condition=\"#n0 = :v0\", projection=\"#n1\""));
        assert!(lines[0].contains("ascending=false"));
        assert_eq!(lines[1], "BatchGetItem(table=t, keys=per page)");
    }

    #[test]
    fn test_explain_keys_in_with_filter() {
        let lines = lines("SELECT * FROM t KEYS IN 'a', 'b' FILTER n = 1");
        assert_eq!(
            lines,
            vec!["BatchGetItem(table=t, keys=2 keys)", "Filter(client, \"n = 1\")"]
        );
    }

    #[test]
    fn test_explain_writes() {
        let config = EngineConfig::default();
        assert_eq!(insert_lines("t", 1, &config), vec!["PutItem(table=t)"]);
        assert_eq!(
            insert_lines("t", 60, &config),
            vec!["BatchWriteItem(table=t, puts=60, requests=3)"]
        );

        let actions = DqlParser::parse_update_expression("SET a = 1").unwrap();
        let lines = update_lines(&meta(), &actions, Returns::AllNew).unwrap();
        assert_eq!(
            lines,
            vec!["UpdateItem(table=t, key=per key, update_expression=\"SET #n0 = :v0\", condition=\"attribute_exists(#n1)\", names={#n0: a, #n1: id}, values={:v0: 1}, returns=ALL_NEW)"]
        );
    }
}
