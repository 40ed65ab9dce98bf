/// Table formatting for plans and expression bindings using comfy-table

use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dql_core::expression::ExpressionContext;
use dql_core::planner::Plan;

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Format a plan as a two-column property table
pub fn format_plan(plan: &Plan) -> String {
    let mut table = new_table();
    table.set_header(vec![Cell::new("property"), Cell::new("value")]);

    let attributes = plan.attributes.as_ref().map(|paths| {
        paths
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    });

    let rows: Vec<(&str, String)> = vec![
        ("operation", plan.kind.to_string()),
        ("table", plan.table.clone()),
        ("index", plan.index_label().to_string()),
        ("key condition", optional(plan.key_condition.as_ref())),
        ("filter", optional(plan.filter.as_ref())),
        ("client filter", optional(plan.client_filter.as_ref())),
        ("keys", plan.keys.len().to_string()),
        ("attributes", attributes.unwrap_or_else(|| "*".to_string())),
        ("hydrate", plan.hydrate.to_string()),
        ("ascending", plan.ascending.to_string()),
        (
            "sort",
            optional(plan.sort.as_ref().map(|s| {
                format!("{} {}", s.attribute, if s.ascending { "ASC" } else { "DESC" })
            })),
        ),
        ("limit", optional(plan.limit)),
        ("scan limit", optional(plan.scan_limit)),
        ("count", plan.count.to_string()),
        ("consistent", plan.consistent.to_string()),
    ];

    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }
    table.to_string()
}

/// Format placeholder bindings of a translated expression
pub fn format_bindings(context: &ExpressionContext) -> String {
    if context.names.is_empty() && context.values.is_empty() {
        return "No bindings".to_string();
    }

    let mut table = new_table();
    table.set_header(vec![Cell::new("placeholder"), Cell::new("binding")]);
    for (placeholder, name) in &context.names {
        table.add_row(vec![Cell::new(placeholder), Cell::new(name)]);
    }
    for (placeholder, value) in &context.values {
        table.add_row(vec![Cell::new(placeholder), Cell::new(value.to_string())]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dql_core::expression::translate;
    use dql_core::lang::DqlParser;
    use dql_core::planner::{Planner, PlannerOptions};
    use dql_core::schema::{KeyAttribute, KeyType, TableMeta};

    #[test]
    fn test_format_plan() {
        let meta = TableMeta::new("things", KeyAttribute::new("id", KeyType::S));
        let statement = DqlParser::parse_statement("SELECT * FROM things WHERE id = 'a' LIMIT 2").unwrap();
        let plan = Planner::new(&meta, PlannerOptions::default()).plan(&statement).unwrap();

        let output = format_plan(&plan);
        assert!(output.contains("QUERY"));
        assert!(output.contains("TABLE"));
        assert!(output.contains("id = \"a\""));
        assert!(output.contains("limit"));
    }

    #[test]
    fn test_format_bindings() {
        let pred = DqlParser::parse_condition("size > 3").unwrap();
        let (_, context) = translate(&pred).unwrap();
        let output = format_bindings(&context);
        assert!(output.contains("#n0"));
        assert!(output.contains("size"));
        assert!(output.contains(":v0"));

        assert_eq!(format_bindings(&ExpressionContext::default()), "No bindings");
    }
}
