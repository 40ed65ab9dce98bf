/// Translation of DQL predicates into store-native expressions
///
/// Every attribute name segment becomes a `#nK` name placeholder and every
/// literal becomes a `:vK` value placeholder, so reserved words and special
/// characters never reach the store's expression grammar.
///
/// ```ignore
/// let pred = DqlParser::parse_condition("...")?;
/// let mut builder = ExpressionBuilder::new();
/// let key = builder.key_condition(&key_terms)?;      // "#n0 = :v0"
/// let filter = builder.condition(&filter_terms)?;    // "#n1 > :v1"
/// let context = builder.finish();                    // shared bindings
/// ```
///
/// Placeholders are shared by every expression one builder produces: the
/// same name or the same literal always maps to the same placeholder.
use crate::lang::{Function, Operand, Path, PathElement, Predicate, SetValue, UpdateAction};
use crate::{Error, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Placeholder bindings sent alongside expressions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionContext {
    /// Expression attribute values (:v0 -> Value)
    pub values: BTreeMap<String, Value>,
    /// Expression attribute names (#n0 -> actual_name)
    pub names: BTreeMap<String, String>,
}

impl ExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, placeholder: impl Into<String>, value: Value) -> Self {
        self.values.insert(placeholder.into(), value);
        self
    }

    pub fn with_name(mut self, placeholder: impl Into<String>, name: impl Into<String>) -> Self {
        self.names.insert(placeholder.into(), name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.names.is_empty()
    }

    /// Resolves a `#name` placeholder; plain names pass through.
    pub fn name<'a>(&'a self, name: &'a str) -> Result<&'a str> {
        if !name.starts_with('#') {
            return Ok(name);
        }
        self.names
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::InvalidExpression(format!("name placeholder '{}' not found", name)))
    }

    pub fn value(&self, placeholder: &str) -> Result<&Value> {
        self.values.get(placeholder).ok_or_else(|| {
            Error::InvalidExpression(format!("value placeholder '{}' not found", placeholder))
        })
    }
}

/// Allocates placeholders and renders expressions
#[derive(Debug, Default)]
pub struct ExpressionBuilder {
    context: ExpressionContext,
    name_slots: HashMap<String, String>,
    value_slots: HashMap<String, String>,
}

impl ExpressionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Placeholder for one attribute name segment.
    pub fn name(&mut self, name: &str) -> String {
        if let Some(slot) = self.name_slots.get(name) {
            return slot.clone();
        }
        let slot = format!("#n{}", self.name_slots.len());
        self.name_slots.insert(name.to_string(), slot.clone());
        self.context.names.insert(slot.clone(), name.to_string());
        slot
    }

    /// Placeholder for one literal value. Values are keyed by their literal
    /// rendering, which distinguishes types (`1` vs `"1"`).
    pub fn value(&mut self, value: &Value) -> String {
        let key = value.to_string();
        if let Some(slot) = self.value_slots.get(&key) {
            return slot.clone();
        }
        let slot = format!(":v{}", self.value_slots.len());
        self.value_slots.insert(key, slot.clone());
        self.context.values.insert(slot.clone(), value.clone());
        slot
    }

    pub fn path(&mut self, path: &Path) -> String {
        let mut out = String::new();
        for (i, element) in path.elements.iter().enumerate() {
            match element {
                PathElement::Field(name) => {
                    if i > 0 {
                        out.push('.');
                    }
                    out.push_str(&self.name(name));
                }
                PathElement::Index(idx) => out.push_str(&format!("[{}]", idx)),
            }
        }
        out
    }

    pub fn operand(&mut self, operand: &Operand) -> Result<String> {
        match operand {
            Operand::Value(value) => Ok(self.value(value)),
            Operand::Path(path) => Ok(self.path(path)),
            Operand::Placeholder(p) => Err(Error::InvalidExpression(format!(
                "unbound placeholder '{}' in statement",
                p
            ))),
        }
    }

    fn grouped(&mut self, pred: &Predicate) -> Result<String> {
        let rendered = self.condition(pred)?;
        Ok(match pred {
            Predicate::And(_) | Predicate::Or(_) => format!("({})", rendered),
            _ => rendered,
        })
    }

    fn function(&mut self, function: &Function) -> Result<String> {
        Ok(match function {
            Function::AttributeExists(path) => format!("attribute_exists({})", self.path(path)),
            Function::AttributeNotExists(path) => {
                format!("attribute_not_exists({})", self.path(path))
            }
            Function::AttributeType { path, type_name } => {
                let path = self.path(path);
                format!("attribute_type({}, {})", path, self.operand(type_name)?)
            }
            Function::BeginsWith { path, prefix } => {
                let path = self.path(path);
                format!("begins_with({}, {})", path, self.operand(prefix)?)
            }
            Function::Contains { path, operand } => {
                let path = self.path(path);
                format!("contains({}, {})", path, self.operand(operand)?)
            }
            Function::Size { path, op, operand } => {
                let path = self.path(path);
                format!("size({}) {} {}", path, op.symbol(), self.operand(operand)?)
            }
        })
    }

    /// Renders a condition (filter) expression.
    pub fn condition(&mut self, pred: &Predicate) -> Result<String> {
        match pred {
            Predicate::Compare { path, op, operand } => {
                let path = self.path(path);
                Ok(format!("{} {} {}", path, op.symbol(), self.operand(operand)?))
            }
            Predicate::Between { path, low, high } => {
                let path = self.path(path);
                let low = self.operand(low)?;
                Ok(format!("{} BETWEEN {} AND {}", path, low, self.operand(high)?))
            }
            Predicate::In { path, values } => {
                let path = self.path(path);
                let values = values
                    .iter()
                    .map(|v| self.operand(v))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("{} IN ({})", path, values.join(", ")))
            }
            Predicate::Function(function) => self.function(function),
            Predicate::And(terms) | Predicate::Or(terms) => {
                let joiner = if matches!(pred, Predicate::And(_)) { " AND " } else { " OR " };
                let parts = terms
                    .iter()
                    .map(|t| self.grouped(t))
                    .collect::<Result<Vec<_>>>()?;
                Ok(parts.join(joiner))
            }
            Predicate::Not(inner) => Ok(format!("NOT {}", self.grouped(inner)?)),
        }
    }

    /// Renders a key condition, rejecting anything a key condition cannot hold.
    pub fn key_condition(&mut self, pred: &Predicate) -> Result<String> {
        if !is_key_condition(pred) {
            return Err(Error::InvalidExpression(format!(
                "'{}' cannot be used as a key condition",
                pred
            )));
        }
        self.condition(pred)
    }

    pub fn projection(&mut self, paths: &[Path]) -> String {
        paths
            .iter()
            .map(|p| self.path(p))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn set_value(&mut self, value: &SetValue) -> Result<String> {
        Ok(match value {
            SetValue::Operand(op) => self.operand(op)?,
            SetValue::IfNotExists(path, op) => {
                let path = self.path(path);
                format!("if_not_exists({}, {})", path, self.operand(op)?)
            }
            SetValue::ListAppend(head, tail) => {
                let head = self.operand(head)?;
                format!("list_append({}, {})", head, self.operand(tail)?)
            }
            SetValue::Plus(a, b) => {
                let a = self.set_value(a)?;
                format!("{} + {}", a, self.set_value(b)?)
            }
            SetValue::Minus(a, b) => {
                let a = self.set_value(a)?;
                format!("{} - {}", a, self.set_value(b)?)
            }
        })
    }

    /// Renders an update expression, one section per action kind.
    pub fn update(&mut self, actions: &[UpdateAction]) -> Result<String> {
        let mut set = Vec::new();
        let mut remove = Vec::new();
        let mut add = Vec::new();
        let mut delete = Vec::new();
        for action in actions {
            match action {
                UpdateAction::Set(path, value) => {
                    let path = self.path(path);
                    set.push(format!("{} = {}", path, self.set_value(value)?));
                }
                UpdateAction::Remove(path) => remove.push(self.path(path)),
                UpdateAction::Add(path, op) => {
                    let path = self.path(path);
                    add.push(format!("{} {}", path, self.operand(op)?));
                }
                UpdateAction::Delete(path, op) => {
                    let path = self.path(path);
                    delete.push(format!("{} {}", path, self.operand(op)?));
                }
            }
        }

        let sections: Vec<String> = [("SET", set), ("REMOVE", remove), ("ADD", add), ("DELETE", delete)]
            .into_iter()
            .filter(|(_, parts)| !parts.is_empty())
            .map(|(keyword, parts)| format!("{} {}", keyword, parts.join(", ")))
            .collect();
        if sections.is_empty() {
            return Err(Error::InvalidExpression("empty update expression".to_string()));
        }
        Ok(sections.join(" "))
    }

    /// Bindings accumulated so far
    pub fn context(&self) -> &ExpressionContext {
        &self.context
    }

    pub fn finish(self) -> ExpressionContext {
        self.context
    }
}

/// Translates one predicate into a condition string and its bindings.
pub fn translate(pred: &Predicate) -> Result<(String, ExpressionContext)> {
    let mut builder = ExpressionBuilder::new();
    let expression = builder.condition(pred)?;
    Ok((expression, builder.finish()))
}

/// A single term a key condition can carry
pub fn is_key_term(pred: &Predicate) -> bool {
    match pred {
        Predicate::Compare { op, operand, .. } => op.is_range() && operand.as_value().is_some(),
        Predicate::Between { low, high, .. } => low.as_value().is_some() && high.as_value().is_some(),
        Predicate::Function(Function::BeginsWith { prefix, .. }) => prefix.as_value().is_some(),
        _ => false,
    }
}

/// Whether a predicate is a conjunction of key terms only
pub fn is_key_condition(pred: &Predicate) -> bool {
    pred.conjuncts().into_iter().all(is_key_term)
}

fn resolve_path(path: &Path, context: &ExpressionContext) -> Result<Path> {
    let elements = path
        .elements
        .iter()
        .map(|element| match element {
            PathElement::Field(name) => Ok(PathElement::Field(context.name(name)?.to_string())),
            PathElement::Index(idx) => Ok(PathElement::Index(*idx)),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Path { elements })
}

fn resolve_operand(operand: &Operand, context: &ExpressionContext) -> Result<Operand> {
    match operand {
        Operand::Value(v) => Ok(Operand::Value(v.clone())),
        Operand::Path(p) => Ok(Operand::Path(resolve_path(p, context)?)),
        Operand::Placeholder(p) => Ok(Operand::Value(context.value(p)?.clone())),
    }
}

fn resolve_set_value(value: &SetValue, context: &ExpressionContext) -> Result<SetValue> {
    Ok(match value {
        SetValue::Operand(op) => SetValue::Operand(resolve_operand(op, context)?),
        SetValue::IfNotExists(path, op) => {
            SetValue::IfNotExists(resolve_path(path, context)?, resolve_operand(op, context)?)
        }
        SetValue::ListAppend(a, b) => {
            SetValue::ListAppend(resolve_operand(a, context)?, resolve_operand(b, context)?)
        }
        SetValue::Plus(a, b) => SetValue::Plus(
            Box::new(resolve_set_value(a, context)?),
            Box::new(resolve_set_value(b, context)?),
        ),
        SetValue::Minus(a, b) => SetValue::Minus(
            Box::new(resolve_set_value(a, context)?),
            Box::new(resolve_set_value(b, context)?),
        ),
    })
}

impl Path {
    /// Substitutes name placeholders back into the path.
    pub fn resolve(&self, context: &ExpressionContext) -> Result<Path> {
        resolve_path(self, context)
    }
}

impl Predicate {
    /// Substitutes placeholders back, undoing a translation.
    pub fn resolve(&self, context: &ExpressionContext) -> Result<Predicate> {
        Ok(match self {
            Predicate::Compare { path, op, operand } => Predicate::Compare {
                path: resolve_path(path, context)?,
                op: *op,
                operand: resolve_operand(operand, context)?,
            },
            Predicate::Between { path, low, high } => Predicate::Between {
                path: resolve_path(path, context)?,
                low: resolve_operand(low, context)?,
                high: resolve_operand(high, context)?,
            },
            Predicate::In { path, values } => Predicate::In {
                path: resolve_path(path, context)?,
                values: values
                    .iter()
                    .map(|v| resolve_operand(v, context))
                    .collect::<Result<Vec<_>>>()?,
            },
            Predicate::Function(function) => Predicate::Function(match function {
                Function::AttributeExists(p) => Function::AttributeExists(resolve_path(p, context)?),
                Function::AttributeNotExists(p) => {
                    Function::AttributeNotExists(resolve_path(p, context)?)
                }
                Function::AttributeType { path, type_name } => Function::AttributeType {
                    path: resolve_path(path, context)?,
                    type_name: resolve_operand(type_name, context)?,
                },
                Function::BeginsWith { path, prefix } => Function::BeginsWith {
                    path: resolve_path(path, context)?,
                    prefix: resolve_operand(prefix, context)?,
                },
                Function::Contains { path, operand } => Function::Contains {
                    path: resolve_path(path, context)?,
                    operand: resolve_operand(operand, context)?,
                },
                Function::Size { path, op, operand } => Function::Size {
                    path: resolve_path(path, context)?,
                    op: *op,
                    operand: resolve_operand(operand, context)?,
                },
            }),
            Predicate::And(terms) => Predicate::And(
                terms
                    .iter()
                    .map(|t| t.resolve(context))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Predicate::Or(terms) => Predicate::Or(
                terms
                    .iter()
                    .map(|t| t.resolve(context))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Predicate::Not(inner) => Predicate::Not(Box::new(inner.resolve(context)?)),
        })
    }
}

impl UpdateAction {
    pub fn resolve(&self, context: &ExpressionContext) -> Result<UpdateAction> {
        Ok(match self {
            UpdateAction::Set(path, value) => {
                UpdateAction::Set(resolve_path(path, context)?, resolve_set_value(value, context)?)
            }
            UpdateAction::Remove(path) => UpdateAction::Remove(resolve_path(path, context)?),
            UpdateAction::Add(path, op) => {
                UpdateAction::Add(resolve_path(path, context)?, resolve_operand(op, context)?)
            }
            UpdateAction::Delete(path, op) => {
                UpdateAction::Delete(resolve_path(path, context)?, resolve_operand(op, context)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::DqlParser;

    fn condition(text: &str) -> Predicate {
        let stmt = DqlParser::parse_statement(&format!("SELECT * FROM t WHERE {}", text)).unwrap();
        match stmt {
            crate::lang::Statement::Select(s) => match s.where_clause {
                Some(crate::lang::WhereClause::Predicate(p)) => p,
                other => panic!("expected predicate, got {:?}", other),
            },
            other => panic!("expected SELECT, got {:?}", other),
        }
    }

    #[test]
    fn test_translate_simple_comparison() {
        let (expr, ctx) = translate(&condition("id = 'a'")).unwrap();
        assert_eq!(expr, "#n0 = :v0");
        assert_eq!(ctx.names["#n0"], "id");
        assert_eq!(ctx.values[":v0"], Value::string("a"));
    }

    #[test]
    fn test_repeated_names_and_values_share_placeholders() {
        let (expr, ctx) = translate(&condition("a = 1 OR a = 1 OR b = 1 OR a = '1'")).unwrap();
        assert_eq!(expr, "#n0 = :v0 OR #n0 = :v0 OR #n1 = :v0 OR #n0 = :v1");
        assert_eq!(ctx.names.len(), 2);
        assert_eq!(ctx.values.len(), 2);
    }

    #[test]
    fn test_operator_renderings() {
        let (expr, _) = translate(&condition(
            "a != 1 AND b BETWEEN 1 AND 5 AND c IN (1, 2) AND d BEGINS WITH 'x' AND e NOT CONTAINS 'y' AND f IS NULL AND size(g) >= 2",
        ))
        .unwrap();
        assert_eq!(
            expr,
            "#n0 <> :v0 AND #n1 BETWEEN :v0 AND :v1 AND #n2 IN (:v0, :v2) AND begins_with(#n3, :v3) \
             AND NOT contains(#n4, :v4) AND attribute_not_exists(#n5) AND size(#n6) >= :v2"
        );
    }

    #[test]
    fn test_nested_paths_use_one_placeholder_per_segment() {
        let (expr, ctx) = translate(&condition("profile.name = 'x' AND profile.tags[1] = 'y'")).unwrap();
        assert_eq!(expr, "#n0.#n1 = :v0 AND #n0.#n2[1] = :v1");
        assert_eq!(ctx.names.len(), 3);
    }

    #[test]
    fn test_reserved_words_are_placeholders() {
        let (expr, ctx) = translate(&condition("size = 3")).unwrap();
        assert_eq!(expr, "#n0 = :v0");
        assert_eq!(ctx.names["#n0"], "size");
    }

    #[test]
    fn test_nested_boolean_terms_are_grouped() {
        let (expr, _) = translate(&condition("(a = 1 OR b = 2) AND NOT (c = 3 AND d = 4)")).unwrap();
        assert_eq!(expr, "(#n0 = :v0 OR #n1 = :v1) AND NOT (#n2 = :v2 AND #n3 = :v3)");
    }

    #[test]
    fn test_round_trip_preserves_predicate() {
        let original = condition(
            "(a = 1 OR b <> c) AND d BETWEEN 'x' AND 'z' AND NOT e IN (1, 2) AND attribute_type(f, S) AND size(g.h[0]) < 3",
        );
        let (expr, ctx) = translate(&original).unwrap();
        let parsed = DqlParser::parse_condition(&expr).unwrap();
        assert_eq!(parsed.resolve(&ctx).unwrap(), original);
    }

    #[test]
    fn test_key_condition_rejects_non_key_terms() {
        let mut builder = ExpressionBuilder::new();
        assert!(builder.key_condition(&condition("id = 1 AND ts > 3")).is_ok());
        for text in ["a = 1 OR b = 2", "a != 1", "a IN (1)", "contains(a, 1)", "a IS NULL", "NOT a = 1"] {
            let err = builder.key_condition(&condition(text)).unwrap_err();
            assert!(matches!(err, Error::InvalidExpression(_)), "{}", text);
        }
    }

    #[test]
    fn test_builder_shares_bindings_across_expressions() {
        let mut builder = ExpressionBuilder::new();
        let key = builder.key_condition(&condition("id = 'a'")).unwrap();
        let filter = builder.condition(&condition("id = 'a' AND n > 1")).unwrap();
        let projection = builder.projection(&[Path::attribute("id"), Path::attribute("n")]);
        assert_eq!(key, "#n0 = :v0");
        assert_eq!(filter, "#n0 = :v0 AND #n1 > :v1");
        assert_eq!(projection, "#n0, #n1");
        assert_eq!(builder.finish().values.len(), 2);
    }

    #[test]
    fn test_update_expression() {
        let stmt = DqlParser::parse_statement(
            "UPDATE t SET n = n + 1, l = list_append(l, [1]) REMOVE old ADD tags ('a') WHERE id = 1",
        )
        .unwrap();
        let crate::lang::Statement::Update(update) = stmt else {
            panic!("expected UPDATE");
        };
        let mut builder = ExpressionBuilder::new();
        let expr = builder.update(&update.actions).unwrap();
        assert_eq!(
            expr,
            "SET #n0 = #n0 + :v0, #n1 = list_append(#n1, :v1) REMOVE #n2 ADD #n3 :v2"
        );

        let ctx = builder.finish();
        let actions = DqlParser::parse_update_expression(&expr).unwrap();
        let resolved: Vec<UpdateAction> = actions.iter().map(|a| a.resolve(&ctx).unwrap()).collect();
        assert_eq!(resolved, update.actions);
    }

    #[test]
    fn test_unbound_placeholder_is_an_error() {
        let pred = DqlParser::parse_condition("#n0 = :v0").unwrap();
        assert!(translate(&pred).is_err());
        assert!(pred.resolve(&ExpressionContext::new()).is_err());
    }
}
