/// Abstract syntax tree for DQL statements
///
/// Built once by the parser and never mutated afterwards. The planner derives
/// new predicate trees for the key-condition and filter halves instead of
/// editing these in place.

use crate::schema::{GlobalIndex, TableMeta};
use crate::throttle::Ceiling;
use crate::{Item, Value};
use std::fmt;

/// One step of an attribute path: `a`, `.b` or `[2]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathElement {
    Field(String),
    Index(usize),
}

/// Attribute path such as `profile.emails[0]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    pub elements: Vec<PathElement>,
}

impl Path {
    /// Single top-level attribute
    pub fn attribute(name: impl Into<String>) -> Self {
        Self {
            elements: vec![PathElement::Field(name.into())],
        }
    }

    /// Name of the top-level attribute the path starts at.
    pub fn root(&self) -> &str {
        match self.elements.first() {
            Some(PathElement::Field(name)) => name,
            _ => "",
        }
    }

    /// The attribute name when the path is a bare top-level attribute.
    pub fn as_attribute(&self) -> Option<&str> {
        match self.elements.as_slice() {
            [PathElement::Field(name)] => Some(name),
            _ => None,
        }
    }
}

impl From<&str> for Path {
    fn from(name: &str) -> Self {
        Path::attribute(name)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.elements.iter().enumerate() {
            match element {
                PathElement::Field(name) if i == 0 => f.write_str(name)?,
                PathElement::Field(name) => write!(f, ".{}", name)?,
                PathElement::Index(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}

/// Binary comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Operators a key condition accepts on a range key
    pub fn is_range(&self) -> bool {
        !matches!(self, CompareOp::Ne)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Right-hand side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    Path(Path),
    /// `:name` value placeholder, only produced when reading back
    /// store-native expressions
    Placeholder(String),
}

impl Operand {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Operand::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(v) => write!(f, "{}", v),
            Operand::Path(p) => write!(f, "{}", p),
            Operand::Placeholder(p) => f.write_str(p),
        }
    }
}

/// Condition function call
#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    AttributeExists(Path),
    AttributeNotExists(Path),
    AttributeType { path: Path, type_name: Operand },
    BeginsWith { path: Path, prefix: Operand },
    Contains { path: Path, operand: Operand },
    Size { path: Path, op: CompareOp, operand: Operand },
}

impl Function {
    pub fn path(&self) -> &Path {
        match self {
            Function::AttributeExists(path) | Function::AttributeNotExists(path) => path,
            Function::AttributeType { path, .. }
            | Function::BeginsWith { path, .. }
            | Function::Contains { path, .. }
            | Function::Size { path, .. } => path,
        }
    }
}

/// Boolean predicate tree
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        path: Path,
        op: CompareOp,
        operand: Operand,
    },
    Between {
        path: Path,
        low: Operand,
        high: Operand,
    },
    In {
        path: Path,
        values: Vec<Operand>,
    },
    Function(Function),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Shorthand for `attribute = value`
    pub fn eq(attribute: &str, value: Value) -> Self {
        Predicate::Compare {
            path: Path::attribute(attribute),
            op: CompareOp::Eq,
            operand: Operand::Value(value),
        }
    }

    /// Joins terms with AND. `None` for no terms; a single term is returned as is.
    pub fn all(mut terms: Vec<Predicate>) -> Option<Predicate> {
        match terms.len() {
            0 => None,
            1 => terms.pop(),
            _ => Some(Predicate::And(terms)),
        }
    }

    /// Top-level conjuncts, with nested ANDs flattened.
    pub fn conjuncts(&self) -> Vec<&Predicate> {
        match self {
            Predicate::And(terms) => terms.iter().flat_map(|t| t.conjuncts()).collect(),
            other => vec![other],
        }
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

fn write_grouped(f: &mut fmt::Formatter<'_>, pred: &Predicate) -> fmt::Result {
    match pred {
        Predicate::And(_) | Predicate::Or(_) => write!(f, "({})", pred),
        other => write!(f, "{}", other),
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::AttributeExists(path) => write!(f, "attribute_exists({})", path),
            Function::AttributeNotExists(path) => write!(f, "attribute_not_exists({})", path),
            Function::AttributeType { path, type_name } => {
                write!(f, "attribute_type({}, {})", path, type_name)
            }
            Function::BeginsWith { path, prefix } => write!(f, "begins_with({}, {})", path, prefix),
            Function::Contains { path, operand } => write!(f, "contains({}, {})", path, operand),
            Function::Size { path, op, operand } => {
                write!(f, "size({}) {} {}", path, op.symbol(), operand)
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { path, op, operand } => {
                write!(f, "{} {} {}", path, op.symbol(), operand)
            }
            Predicate::Between { path, low, high } => {
                write!(f, "{} BETWEEN {} AND {}", path, low, high)
            }
            Predicate::In { path, values } => {
                write!(f, "{} IN (", path)?;
                write_list(f, values)?;
                f.write_str(")")
            }
            Predicate::Function(func) => write!(f, "{}", func),
            Predicate::And(terms) | Predicate::Or(terms) => {
                let joiner = if matches!(self, Predicate::And(_)) { " AND " } else { " OR " };
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        f.write_str(joiner)?;
                    }
                    write_grouped(f, term)?;
                }
                Ok(())
            }
            Predicate::Not(inner) => {
                f.write_str("NOT ")?;
                write_grouped(f, inner)
            }
        }
    }
}

/// Row selector of a read or write statement
#[derive(Debug, Clone, PartialEq)]
pub enum WhereClause {
    Predicate(Predicate),
    /// Primary key tuples: one value for hash-only tables, two otherwise
    KeysIn {
        keys: Vec<Vec<Value>>,
        filter: Option<Predicate>,
    },
}

/// Requested output attributes
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Count,
    Attributes(Vec<Path>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    /// `None` when only ASC/DESC was given: direction of the index range key
    pub attribute: Option<Path>,
    pub ascending: bool,
}

/// SELECT, SCAN and COUNT share this shape
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub table: String,
    pub projection: Projection,
    pub where_clause: Option<WhereClause>,
    pub using: Option<String>,
    pub limit: Option<usize>,
    pub scan_limit: Option<usize>,
    pub order_by: Option<OrderBy>,
    pub consistent: bool,
    pub throttle: Option<Ceiling>,
}

impl SelectStatement {
    pub fn new(table: impl Into<String>, projection: Projection) -> Self {
        Self {
            table: table.into(),
            projection,
            where_clause: None,
            using: None,
            limit: None,
            scan_limit: None,
            order_by: None,
            consistent: false,
            throttle: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub items: Vec<Item>,
    pub throttle: Option<Ceiling>,
}

/// Right-hand side of a SET action
#[derive(Debug, Clone, PartialEq)]
pub enum SetValue {
    Operand(Operand),
    IfNotExists(Path, Operand),
    ListAppend(Operand, Operand),
    Plus(Box<SetValue>, Box<SetValue>),
    Minus(Box<SetValue>, Box<SetValue>),
}

impl fmt::Display for SetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetValue::Operand(op) => write!(f, "{}", op),
            SetValue::IfNotExists(path, op) => write!(f, "if_not_exists({}, {})", path, op),
            SetValue::ListAppend(a, b) => write!(f, "list_append({}, {})", a, b),
            SetValue::Plus(a, b) => write!(f, "{} + {}", a, b),
            SetValue::Minus(a, b) => write!(f, "{} - {}", a, b),
        }
    }
}

/// Update expression action
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    Set(Path, SetValue),
    Remove(Path),
    /// ADD to a number or set
    Add(Path, Operand),
    /// DELETE elements from a set
    Delete(Path, Operand),
}

/// What an UPDATE returns per updated item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Returns {
    #[default]
    None,
    AllOld,
    AllNew,
    UpdatedOld,
    UpdatedNew,
}

impl Returns {
    pub fn as_str(&self) -> &'static str {
        match self {
            Returns::None => "NONE",
            Returns::AllOld => "ALL_OLD",
            Returns::AllNew => "ALL_NEW",
            Returns::UpdatedOld => "UPDATED_OLD",
            Returns::UpdatedNew => "UPDATED_NEW",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub actions: Vec<UpdateAction>,
    pub where_clause: Option<WhereClause>,
    pub using: Option<String>,
    pub returns: Returns,
    pub throttle: Option<Ceiling>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub where_clause: Option<WhereClause>,
    pub using: Option<String>,
    pub throttle: Option<Ceiling>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStatement {
    pub table: TableMeta,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlterAction {
    /// `None` leaves that dimension unchanged (`*`)
    SetThroughput {
        index: Option<String>,
        read: Option<u64>,
        write: Option<u64>,
    },
    CreateIndex(GlobalIndex),
    DropIndex {
        name: String,
        if_exists: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlterTableStatement {
    pub table: String,
    pub action: AlterAction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropTableStatement {
    pub table: String,
    pub if_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadStatement {
    pub file: String,
    pub table: String,
    pub throttle: Option<Ceiling>,
}

/// Top-level statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Scan(SelectStatement),
    Count(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Create(CreateTableStatement),
    Alter(AlterTableStatement),
    Drop(DropTableStatement),
    /// DUMP SCHEMA; empty means every table
    Dump(Vec<String>),
    Load(LoadStatement),
    Explain(Box<Statement>),
    Analyze(Box<Statement>),
}

impl Statement {
    /// Statement keyword, for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Select(_) => "SELECT",
            Statement::Scan(_) => "SCAN",
            Statement::Count(_) => "COUNT",
            Statement::Insert(_) => "INSERT",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) => "DELETE",
            Statement::Create(_) => "CREATE",
            Statement::Alter(_) => "ALTER",
            Statement::Drop(_) => "DROP",
            Statement::Dump(_) => "DUMP",
            Statement::Load(_) => "LOAD",
            Statement::Explain(_) => "EXPLAIN",
            Statement::Analyze(_) => "ANALYZE",
        }
    }

    /// Table the statement targets, if it targets exactly one
    pub fn table(&self) -> Option<&str> {
        match self {
            Statement::Select(s) | Statement::Scan(s) | Statement::Count(s) => Some(&s.table),
            Statement::Insert(s) => Some(&s.table),
            Statement::Update(s) => Some(&s.table),
            Statement::Delete(s) => Some(&s.table),
            Statement::Create(s) => Some(&s.table.name),
            Statement::Alter(s) => Some(&s.table),
            Statement::Drop(s) => Some(&s.table),
            Statement::Load(s) => Some(&s.table),
            Statement::Dump(_) => None,
            Statement::Explain(inner) | Statement::Analyze(inner) => inner.table(),
        }
    }
}
