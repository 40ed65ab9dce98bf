/// Client-side predicate evaluation and update application
///
/// Used where the store cannot evaluate a condition itself (the filter of a
/// KEYS IN lookup) and by in-memory stores. Operands must already be
/// resolved: a leftover `:name` placeholder is an error.

use crate::lang::{CompareOp, Function, Operand, Path, PathElement, Predicate, SetValue, UpdateAction};
use crate::{Error, Item, Result, Value};
use std::cmp::Ordering;

/// Looks up a (possibly nested) attribute path in an item.
pub fn lookup<'a>(item: &'a Item, path: &Path) -> Option<&'a Value> {
    let mut elements = path.elements.iter();
    let mut current = match elements.next()? {
        PathElement::Field(name) => item.get(name)?,
        PathElement::Index(_) => return None,
    };
    for element in elements {
        current = match (element, current) {
            (PathElement::Field(name), Value::M(map)) => map.get(name)?,
            (PathElement::Index(idx), Value::L(list)) => list.get(*idx)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Predicate evaluator over one item
pub struct Evaluator<'a> {
    item: &'a Item,
}

impl<'a> Evaluator<'a> {
    pub fn new(item: &'a Item) -> Self {
        Self { item }
    }

    /// Evaluate predicate against the item
    pub fn evaluate(&self, pred: &Predicate) -> Result<bool> {
        match pred {
            Predicate::Compare { path, op, operand } => {
                let (Some(left), Some(right)) = (lookup(self.item, path), self.operand(operand)?) else {
                    return Ok(false);
                };
                Ok(compare(left, *op, right))
            }
            Predicate::Between { path, low, high } => {
                let Some(value) = lookup(self.item, path) else {
                    return Ok(false);
                };
                let (Some(low), Some(high)) = (self.operand(low)?, self.operand(high)?) else {
                    return Ok(false);
                };
                Ok(compare(value, CompareOp::Ge, low) && compare(value, CompareOp::Le, high))
            }
            Predicate::In { path, values } => {
                let Some(value) = lookup(self.item, path) else {
                    return Ok(false);
                };
                for candidate in values {
                    if let Some(candidate) = self.operand(candidate)? {
                        if value.loosely_equals(candidate) {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
            Predicate::Function(function) => self.function(function),
            Predicate::And(terms) => {
                for term in terms {
                    if !self.evaluate(term)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(terms) => {
                for term in terms {
                    if self.evaluate(term)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(inner) => Ok(!self.evaluate(inner)?),
        }
    }

    fn operand<'b>(&'b self, operand: &'b Operand) -> Result<Option<&'b Value>> {
        match operand {
            Operand::Value(v) => Ok(Some(v)),
            Operand::Path(p) => Ok(lookup(self.item, p)),
            Operand::Placeholder(p) => Err(Error::InvalidExpression(format!(
                "unresolved placeholder '{}'",
                p
            ))),
        }
    }

    fn function(&self, function: &Function) -> Result<bool> {
        match function {
            Function::AttributeExists(path) => Ok(lookup(self.item, path).is_some()),
            Function::AttributeNotExists(path) => Ok(lookup(self.item, path).is_none()),
            Function::AttributeType { path, type_name } => {
                match (lookup(self.item, path), self.operand(type_name)?) {
                    (Some(value), Some(Value::S(code))) => Ok(value.type_code() == code.as_str()),
                    (_, Some(Value::S(_))) => Ok(false),
                    _ => Err(Error::InvalidExpression(
                        "attribute_type expects a type name string".into(),
                    )),
                }
            }
            Function::BeginsWith { path, prefix } => {
                match (lookup(self.item, path), self.operand(prefix)?) {
                    (Some(Value::S(s)), Some(Value::S(prefix))) => Ok(s.starts_with(prefix.as_str())),
                    (Some(Value::B(b)), Some(Value::B(prefix))) => Ok(b.starts_with(&prefix[..])),
                    _ => Ok(false),
                }
            }
            Function::Contains { path, operand } => {
                let (Some(container), Some(needle)) = (lookup(self.item, path), self.operand(operand)?) else {
                    return Ok(false);
                };
                Ok(contains(container, needle))
            }
            Function::Size { path, op, operand } => {
                let (Some(value), Some(right)) = (lookup(self.item, path), self.operand(operand)?) else {
                    return Ok(false);
                };
                let Some(size) = size_of(value) else {
                    return Ok(false);
                };
                Ok(compare(&Value::number(size), *op, right))
            }
        }
    }
}

/// Evaluates a predicate against an item.
pub fn matches(pred: &Predicate, item: &Item) -> Result<bool> {
    Evaluator::new(item).evaluate(pred)
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match op {
        CompareOp::Eq => left.loosely_equals(right),
        CompareOp::Ne => !left.loosely_equals(right),
        _ => match left.compare(right) {
            Some(ordering) => match op {
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                CompareOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            },
            None => false,
        },
    }
}

fn contains(container: &Value, needle: &Value) -> bool {
    match (container, needle) {
        (Value::S(s), Value::S(sub)) => s.contains(sub.as_str()),
        (Value::B(b), Value::B(sub)) => sub.is_empty() || b.windows(sub.len()).any(|w| w == &sub[..]),
        (Value::SS(set), Value::S(s)) => set.contains(s),
        (Value::NS(set), Value::N(_)) => set.iter().any(|n| Value::N(n.clone()).loosely_equals(needle)),
        (Value::BS(set), Value::B(b)) => set.contains(b),
        (Value::L(list), _) => list.iter().any(|v| v.loosely_equals(needle)),
        _ => false,
    }
}

fn size_of(value: &Value) -> Option<usize> {
    match value {
        Value::S(s) => Some(s.len()),
        Value::B(b) => Some(b.len()),
        Value::L(l) => Some(l.len()),
        Value::M(m) => Some(m.len()),
        Value::NS(s) | Value::SS(s) => Some(s.len()),
        Value::BS(s) => Some(s.len()),
        _ => None,
    }
}

fn number(value: &Value, context: &str) -> Result<f64> {
    value
        .as_number()
        .ok_or_else(|| Error::InvalidExpression(format!("{} requires numbers", context)))
}

fn set_value(item: &Item, value: &SetValue) -> Result<Value> {
    let operand = |op: &Operand| -> Result<Value> {
        match op {
            Operand::Value(v) => Ok(v.clone()),
            Operand::Path(p) => lookup(item, p)
                .cloned()
                .ok_or_else(|| Error::InvalidExpression(format!("attribute '{}' not found", p))),
            Operand::Placeholder(p) => Err(Error::InvalidExpression(format!(
                "unresolved placeholder '{}'",
                p
            ))),
        }
    };
    match value {
        SetValue::Operand(op) => operand(op),
        SetValue::IfNotExists(path, fallback) => match lookup(item, path) {
            Some(existing) => Ok(existing.clone()),
            None => operand(fallback),
        },
        SetValue::ListAppend(head, tail) => match (operand(head)?, operand(tail)?) {
            (Value::L(mut head), Value::L(tail)) => {
                head.extend(tail);
                Ok(Value::L(head))
            }
            _ => Err(Error::InvalidExpression("list_append requires lists".into())),
        },
        SetValue::Plus(a, b) => {
            let sum = number(&set_value(item, a)?, "addition")? + number(&set_value(item, b)?, "addition")?;
            Ok(Value::number(sum))
        }
        SetValue::Minus(a, b) => {
            let diff = number(&set_value(item, a)?, "subtraction")?
                - number(&set_value(item, b)?, "subtraction")?;
            Ok(Value::number(diff))
        }
    }
}

/// Mutable slot addressed by a path; creates nothing.
fn slot<'a>(item: &'a mut Item, path: &Path) -> Option<&'a mut Value> {
    let mut elements = path.elements.iter();
    let mut current = match elements.next()? {
        PathElement::Field(name) => item.get_mut(name)?,
        PathElement::Index(_) => return None,
    };
    for element in elements {
        current = match (element, current) {
            (PathElement::Field(name), Value::M(map)) => map.get_mut(name)?,
            (PathElement::Index(idx), Value::L(list)) => list.get_mut(*idx)?,
            _ => return None,
        };
    }
    Some(current)
}

fn assign(item: &mut Item, path: &Path, value: Value) -> Result<()> {
    let (last, parent) = match path.elements.split_last() {
        Some(split) => split,
        None => return Err(Error::InvalidExpression("empty attribute path".into())),
    };
    if parent.is_empty() {
        return match last {
            PathElement::Field(name) => {
                item.insert(name.clone(), value);
                Ok(())
            }
            PathElement::Index(_) => Err(Error::InvalidExpression(format!("invalid path '{}'", path))),
        };
    }
    let parent_path = Path {
        elements: parent.to_vec(),
    };
    let missing = || Error::InvalidExpression(format!("document path '{}' does not exist", path));
    match (slot(item, &parent_path).ok_or_else(missing)?, last) {
        (Value::M(map), PathElement::Field(name)) => {
            map.insert(name.clone(), value);
            Ok(())
        }
        (Value::L(list), PathElement::Index(idx)) => {
            if *idx < list.len() {
                list[*idx] = value;
            } else {
                list.push(value);
            }
            Ok(())
        }
        _ => Err(missing()),
    }
}

fn remove(item: &mut Item, path: &Path) {
    let Some((last, parent)) = path.elements.split_last() else {
        return;
    };
    if parent.is_empty() {
        if let PathElement::Field(name) = last {
            item.remove(name);
        }
        return;
    }
    let parent_path = Path {
        elements: parent.to_vec(),
    };
    match (slot(item, &parent_path), last) {
        (Some(Value::M(map)), PathElement::Field(name)) => {
            map.remove(name);
        }
        (Some(Value::L(list)), PathElement::Index(idx)) if *idx < list.len() => {
            list.remove(*idx);
        }
        _ => {}
    }
}

fn union(existing: &Value, added: &Value) -> Result<Value> {
    fn merge<T: Clone + PartialEq>(a: &[T], b: &[T]) -> Vec<T> {
        let mut out = a.to_vec();
        for v in b {
            if !out.contains(v) {
                out.push(v.clone());
            }
        }
        out
    }
    match (existing, added) {
        (Value::N(_), Value::N(_)) => Ok(Value::number(number(existing, "ADD")? + number(added, "ADD")?)),
        (Value::NS(a), Value::NS(b)) => Ok(Value::NS(merge(a, b))),
        (Value::SS(a), Value::SS(b)) => Ok(Value::SS(merge(a, b))),
        (Value::BS(a), Value::BS(b)) => Ok(Value::BS(merge(a, b))),
        _ => Err(Error::InvalidExpression("ADD requires a number or a set of the same type".into())),
    }
}

fn difference(existing: &Value, removed: &Value) -> Result<Option<Value>> {
    fn without<T: Clone + PartialEq>(a: &[T], b: &[T]) -> Vec<T> {
        a.iter().filter(|v| !b.contains(v)).cloned().collect()
    }
    let remaining = match (existing, removed) {
        (Value::NS(a), Value::NS(b)) => Value::NS(without(a, b)),
        (Value::SS(a), Value::SS(b)) => Value::SS(without(a, b)),
        (Value::BS(a), Value::BS(b)) => Value::BS(without(a, b)),
        _ => return Err(Error::InvalidExpression("DELETE requires sets of the same type".into())),
    };
    let empty = match &remaining {
        Value::NS(s) | Value::SS(s) => s.is_empty(),
        Value::BS(s) => s.is_empty(),
        _ => false,
    };
    Ok(if empty { None } else { Some(remaining) })
}

/// Applies resolved update actions to a copy of the item.
pub fn apply_update(item: &Item, actions: &[UpdateAction]) -> Result<Item> {
    let mut result = item.clone();

    for action in actions {
        match action {
            UpdateAction::Set(path, value) => {
                // Right-hand sides read the item as it was before the update
                let value = set_value(item, value)?;
                assign(&mut result, path, value)?;
            }
            UpdateAction::Remove(path) => remove(&mut result, path),
            UpdateAction::Add(path, op) => {
                let added = op
                    .as_value()
                    .ok_or_else(|| Error::InvalidExpression("ADD takes a literal value".into()))?;
                let value = match lookup(&result, path) {
                    Some(existing) => union(existing, added)?,
                    None => added.clone(),
                };
                assign(&mut result, path, value)?;
            }
            UpdateAction::Delete(path, op) => {
                let removed = op
                    .as_value()
                    .ok_or_else(|| Error::InvalidExpression("DELETE takes a literal set".into()))?;
                if let Some(existing) = lookup(&result, path) {
                    match difference(existing, removed)? {
                        Some(remaining) => assign(&mut result, path, remaining)?,
                        None => remove(&mut result, path),
                    }
                }
            }
        }
    }

    Ok(result)
}
