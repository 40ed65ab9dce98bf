/// Recursive-descent parser for DQL
///
/// Statement text is tokenized in normal mode. Store-native condition, update
/// and projection expressions (the output of the translator) are tokenized in
/// condition mode so that `#name` / `:name` placeholders read back as paths and
/// operands.

use super::ast::*;
use super::lexer::{Lexer, Token, TokenKind};
use crate::schema::{
    GlobalIndex, IndexProjection, KeyAttribute, KeyType, LocalIndex, TableMeta, Throughput,
};
use crate::throttle::{Ceiling, Limit};
use crate::{Error, Item, Result, Value};
use std::collections::HashMap;

/// Entry points for parsing DQL text
pub struct DqlParser;

impl DqlParser {
    /// Parses a script of one or more `;`-separated statements.
    pub fn parse(text: &str) -> Result<Vec<Statement>> {
        let tokens = Lexer::new(text).tokenize()?;
        let mut parser = Parser::new(tokens);
        let mut statements = Vec::new();
        loop {
            while parser.eat(&TokenKind::Semicolon) {}
            if parser.at_end() {
                break;
            }
            statements.push(parser.statement()?);
            if !parser.eat(&TokenKind::Semicolon) && !parser.at_end() {
                return Err(parser.unexpected("';' or end of input"));
            }
        }
        if statements.is_empty() {
            return Err(Error::syntax(0, "empty statement"));
        }
        Ok(statements)
    }

    /// Parses exactly one statement.
    pub fn parse_statement(text: &str) -> Result<Statement> {
        let mut statements = Self::parse(text)?;
        if statements.len() > 1 {
            return Err(Error::syntax(0, "expected a single statement"));
        }
        statements
            .pop()
            .ok_or_else(|| Error::syntax(0, "empty statement"))
    }

    /// Parses a store-native condition expression such as
    /// `#n0 = :v0 AND begins_with(#n1, :v1)`.
    pub fn parse_condition(text: &str) -> Result<Predicate> {
        let mut parser = Parser::placeholders(text)?;
        let pred = parser.predicate()?;
        parser.expect_end()?;
        Ok(pred)
    }

    /// Parses a store-native update expression such as
    /// `SET #n0 = #n0 + :v0 REMOVE #n1`.
    pub fn parse_update_expression(text: &str) -> Result<Vec<UpdateAction>> {
        let mut parser = Parser::placeholders(text)?;
        let actions = parser.update_actions()?;
        parser.expect_end()?;
        Ok(actions)
    }

    /// Parses a store-native projection expression such as `#n0, #n1.#n2`.
    pub fn parse_projection(text: &str) -> Result<Vec<Path>> {
        let mut parser = Parser::placeholders(text)?;
        let paths = parser.path_list()?;
        parser.expect_end()?;
        Ok(paths)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Where,
    KeysIn,
    Filter,
    Using,
    Limit,
    ScanLimit,
    OrderBy,
    Throttle,
    Returns,
}

impl Clause {
    fn name(&self) -> &'static str {
        match self {
            Clause::Where => "WHERE",
            Clause::KeysIn => "KEYS IN",
            Clause::Filter => "FILTER",
            Clause::Using => "USING",
            Clause::Limit => "LIMIT",
            Clause::ScanLimit => "SCAN LIMIT",
            Clause::OrderBy => "ORDER BY",
            Clause::Throttle => "THROTTLE",
            Clause::Returns => "RETURNS",
        }
    }
}

const READ_CLAUSES: &[Clause] = &[
    Clause::Where,
    Clause::KeysIn,
    Clause::Filter,
    Clause::Using,
    Clause::Limit,
    Clause::ScanLimit,
    Clause::OrderBy,
    Clause::Throttle,
];

const COUNT_CLAUSES: &[Clause] = &[
    Clause::Where,
    Clause::KeysIn,
    Clause::Filter,
    Clause::Using,
    Clause::ScanLimit,
    Clause::Throttle,
];

const UPDATE_CLAUSES: &[Clause] = &[
    Clause::Where,
    Clause::KeysIn,
    Clause::Filter,
    Clause::Using,
    Clause::Returns,
    Clause::Throttle,
];

const DELETE_CLAUSES: &[Clause] = &[
    Clause::Where,
    Clause::KeysIn,
    Clause::Filter,
    Clause::Using,
    Clause::Throttle,
];

/// Trailing clauses collected in any order
#[derive(Debug, Default)]
struct Clauses {
    where_clause: Option<WhereClause>,
    filter: Option<Predicate>,
    using: Option<String>,
    limit: Option<usize>,
    scan_limit: Option<usize>,
    order_by: Option<OrderBy>,
    throttle: Option<Ceiling>,
    returns: Option<Returns>,
}

impl Clauses {
    /// Folds FILTER into the row selector: it becomes the KEYS IN filter, is
    /// ANDed onto a WHERE predicate, or stands alone.
    fn selector(&mut self) -> Option<WhereClause> {
        let filter = self.filter.take();
        match (self.where_clause.take(), filter) {
            (Some(WhereClause::KeysIn { keys, .. }), filter) => Some(WhereClause::KeysIn { keys, filter }),
            (Some(WhereClause::Predicate(pred)), Some(filter)) => {
                Some(WhereClause::Predicate(Predicate::And(vec![pred, filter])))
            }
            (Some(selector), None) => Some(selector),
            (None, Some(filter)) => Some(WhereClause::Predicate(filter)),
            (None, None) => None,
        }
    }
}

/// Deepest nesting of parentheses, NOT, lists and maps a statement may use
const MAX_NESTING: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0, depth: 0 }
    }

    /// Runs `parse` one nesting level deeper.
    fn nested<T>(&mut self, what: &str, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("{} nested too deeply", what)));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn placeholders(text: &str) -> Result<Self> {
        Ok(Self::new(Lexer::new(text).with_placeholders().tokenize()?))
    }

    // ---- token helpers ----

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + offset).min(last)].kind
    }

    fn kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn at_end(&self) -> bool {
        *self.kind() == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !self.at_end() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.unexpected(&kind.describe()))
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.unexpected("end of expression"))
        }
    }

    fn keyword_at(&self, offset: usize, keyword: &str) -> bool {
        matches!(self.peek_at(offset), TokenKind::Ident(word) if word.eq_ignore_ascii_case(keyword))
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        self.keyword_at(0, keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(keyword))
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::syntax(self.peek().pos, message)
    }

    fn unexpected(&self, expected: &str) -> Error {
        self.error(format!("expected {}, found {}", expected, self.kind().describe()))
    }

    // ---- names and literals ----

    fn identifier(&mut self) -> Result<String> {
        match self.kind().clone() {
            TokenKind::Ident(name) | TokenKind::QuotedIdent(name) | TokenKind::NamePlaceholder(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    /// Index and table names may also be written as string literals.
    fn name(&mut self) -> Result<String> {
        if let TokenKind::Str(name) = self.kind().clone() {
            self.advance();
            return Ok(name);
        }
        self.identifier()
    }

    fn path(&mut self) -> Result<Path> {
        let mut elements = vec![PathElement::Field(self.identifier()?)];
        loop {
            if self.eat(&TokenKind::Dot) {
                elements.push(PathElement::Field(self.identifier()?));
            } else if self.eat(&TokenKind::LeftBracket) {
                let index = self.unsigned("list index")?;
                self.expect(&TokenKind::RightBracket)?;
                elements.push(PathElement::Index(index));
            } else {
                return Ok(Path { elements });
            }
        }
    }

    fn path_list(&mut self) -> Result<Vec<Path>> {
        let mut paths = vec![self.path()?];
        while self.eat(&TokenKind::Comma) {
            paths.push(self.path()?);
        }
        Ok(paths)
    }

    fn unsigned(&mut self, what: &str) -> Result<usize> {
        match self.kind().clone() {
            TokenKind::Number(n) => {
                let value = n
                    .parse::<usize>()
                    .map_err(|_| self.error(format!("{} must be a non-negative integer, got {}", what, n)))?;
                self.advance();
                Ok(value)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn capacity_units(&mut self) -> Result<u64> {
        self.unsigned("capacity units").map(|n| n as u64)
    }

    fn is_value_start(&self) -> bool {
        match self.kind() {
            TokenKind::Number(_)
            | TokenKind::Str(_)
            | TokenKind::Binary(_)
            | TokenKind::LeftBracket
            | TokenKind::LeftBrace
            | TokenKind::LeftParen => true,
            TokenKind::Minus => matches!(self.peek_at(1), TokenKind::Number(_)),
            TokenKind::Ident(word) => {
                ["TRUE", "FALSE", "NULL"].iter().any(|k| word.eq_ignore_ascii_case(k))
            }
            _ => false,
        }
    }

    fn value(&mut self) -> Result<Value> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) => Ok(Value::N(n)),
            TokenKind::Minus => match self.advance().kind {
                TokenKind::Number(n) => Ok(Value::N(format!("-{}", n))),
                _ => Err(Error::syntax(token.pos, "expected a number after '-'")),
            },
            TokenKind::Str(s) => Ok(Value::S(s)),
            TokenKind::Binary(b) => Ok(Value::binary(b)),
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("TRUE") => Ok(Value::Bool(true)),
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("FALSE") => Ok(Value::Bool(false)),
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("NULL") => Ok(Value::Null),
            TokenKind::LeftBracket => self.nested("value", |p| {
                let mut items = Vec::new();
                if !p.eat(&TokenKind::RightBracket) {
                    loop {
                        items.push(p.value()?);
                        if !p.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    p.expect(&TokenKind::RightBracket)?;
                }
                Ok(Value::L(items))
            }),
            TokenKind::LeftBrace => self.nested("value", |p| p.map_body().map(Value::M)),
            TokenKind::LeftParen => self.set_body(token.pos),
            other => Err(Error::syntax(
                token.pos,
                format!("expected a value, found {}", other.describe()),
            )),
        }
    }

    /// Map literal after its opening brace.
    fn map_body(&mut self) -> Result<HashMap<String, Value>> {
        let mut map = HashMap::new();
        if self.eat(&TokenKind::RightBrace) {
            return Ok(map);
        }
        loop {
            let key = match self.kind().clone() {
                TokenKind::Str(key) | TokenKind::Ident(key) | TokenKind::QuotedIdent(key) => {
                    self.advance();
                    key
                }
                _ => return Err(self.unexpected("map key")),
            };
            self.expect(&TokenKind::Colon)?;
            let value = self.value()?;
            map.insert(key, value);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RightBrace)?;
        Ok(map)
    }

    /// Set literal after its opening paren. Sets hold one primitive kind.
    fn set_body(&mut self, start: usize) -> Result<Value> {
        let mut members = Vec::new();
        if *self.kind() != TokenKind::RightParen {
            loop {
                members.push(self.value()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen)?;

        let kind = match members.first() {
            Some(first) => first.type_code(),
            None => return Err(Error::syntax(start, "empty set literal")),
        };
        let mixed = || Error::syntax(start, "set literal mixes value types");
        match kind {
            "N" => members
                .into_iter()
                .map(|v| match v {
                    Value::N(n) => Ok(n),
                    _ => Err(mixed()),
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::NS),
            "S" => members
                .into_iter()
                .map(|v| match v {
                    Value::S(s) => Ok(s),
                    _ => Err(mixed()),
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::SS),
            "B" => members
                .into_iter()
                .map(|v| match v {
                    Value::B(b) => Ok(b),
                    _ => Err(mixed()),
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::BS),
            other => Err(Error::syntax(
                start,
                format!("sets may only hold numbers, strings or binary, found {}", other),
            )),
        }
    }

    fn operand(&mut self) -> Result<Operand> {
        if let TokenKind::ValuePlaceholder(name) = self.kind().clone() {
            self.advance();
            return Ok(Operand::Placeholder(name));
        }
        if self.is_value_start() {
            return Ok(Operand::Value(self.value()?));
        }
        Ok(Operand::Path(self.path()?))
    }

    // ---- predicates ----

    fn predicate(&mut self) -> Result<Predicate> {
        let mut terms = vec![self.conjunction()?];
        while self.eat_keyword("OR") {
            terms.push(self.conjunction()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Predicate::Or(terms) })
    }

    fn conjunction(&mut self) -> Result<Predicate> {
        let mut terms = vec![self.negation()?];
        while self.eat_keyword("AND") {
            terms.push(self.negation()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Predicate::And(terms) })
    }

    fn negation(&mut self) -> Result<Predicate> {
        if self.is_keyword("NOT") {
            return self.nested("predicate", |p| {
                p.advance();
                Ok(Predicate::Not(Box::new(p.negation()?)))
            });
        }
        if *self.kind() == TokenKind::LeftParen {
            return self.nested("predicate", |p| {
                p.advance();
                let inner = p.predicate()?;
                p.expect(&TokenKind::RightParen)?;
                Ok(inner)
            });
        }
        if let Some(function) = self.function()? {
            return Ok(function);
        }
        self.comparison()
    }

    fn function(&mut self) -> Result<Option<Predicate>> {
        let name = match (self.kind(), self.peek_at(1)) {
            (TokenKind::Ident(name), TokenKind::LeftParen) => name.to_ascii_lowercase(),
            _ => return Ok(None),
        };
        let known = [
            "attribute_exists",
            "attribute_not_exists",
            "attribute_type",
            "begins_with",
            "contains",
            "size",
        ];
        if !known.contains(&name.as_str()) {
            return Err(self.error(format!("unknown function '{}'", name)));
        }
        self.advance();
        self.advance();

        let path = self.path()?;
        let function = match name.as_str() {
            "attribute_exists" => Function::AttributeExists(path),
            "attribute_not_exists" => Function::AttributeNotExists(path),
            "attribute_type" => {
                self.expect(&TokenKind::Comma)?;
                Function::AttributeType {
                    path,
                    type_name: self.type_operand()?,
                }
            }
            "begins_with" => {
                self.expect(&TokenKind::Comma)?;
                Function::BeginsWith {
                    path,
                    prefix: self.operand()?,
                }
            }
            "contains" => {
                self.expect(&TokenKind::Comma)?;
                Function::Contains {
                    path,
                    operand: self.operand()?,
                }
            }
            _ => {
                self.expect(&TokenKind::RightParen)?;
                let op = self
                    .compare_op()
                    .ok_or_else(|| self.unexpected("comparison operator after size()"))?;
                let operand = self.operand()?;
                return Ok(Some(Predicate::Function(Function::Size { path, op, operand })));
            }
        };
        self.expect(&TokenKind::RightParen)?;
        Ok(Some(Predicate::Function(function)))
    }

    /// `attribute_type` accepts a bare type code such as `S` or `NS`.
    fn type_operand(&mut self) -> Result<Operand> {
        const CODES: [&str; 10] = ["S", "N", "B", "BOOL", "NULL", "L", "M", "NS", "SS", "BS"];
        if let TokenKind::Ident(word) = self.kind() {
            let upper = word.to_ascii_uppercase();
            if CODES.contains(&upper.as_str()) {
                self.advance();
                return Ok(Operand::Value(Value::S(upper)));
            }
        }
        self.operand()
    }

    fn compare_op(&mut self) -> Option<CompareOp> {
        let op = match self.kind() {
            TokenKind::Equal => CompareOp::Eq,
            TokenKind::NotEqual => CompareOp::Ne,
            TokenKind::LessThan => CompareOp::Lt,
            TokenKind::LessThanOrEqual => CompareOp::Le,
            TokenKind::GreaterThan => CompareOp::Gt,
            TokenKind::GreaterThanOrEqual => CompareOp::Ge,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn comparison(&mut self) -> Result<Predicate> {
        let path = self.path()?;

        if let Some(op) = self.compare_op() {
            let operand = self.operand()?;
            return Ok(Predicate::Compare { path, op, operand });
        }

        let negated = self.is_keyword("NOT")
            && (self.keyword_at(1, "IN") || self.keyword_at(1, "CONTAINS") || self.keyword_at(1, "BETWEEN"));
        if negated {
            self.advance();
        }

        let pred = if self.eat_keyword("BETWEEN") {
            let (low, high) = if self.eat(&TokenKind::LeftParen) {
                let low = self.operand()?;
                self.expect(&TokenKind::Comma)?;
                let high = self.operand()?;
                self.expect(&TokenKind::RightParen)?;
                (low, high)
            } else {
                let low = self.operand()?;
                self.expect_keyword("AND")?;
                (low, self.operand()?)
            };
            Predicate::Between { path, low, high }
        } else if self.eat_keyword("IN") {
            self.expect(&TokenKind::LeftParen)?;
            let mut values = vec![self.operand()?];
            while self.eat(&TokenKind::Comma) {
                values.push(self.operand()?);
            }
            self.expect(&TokenKind::RightParen)?;
            Predicate::In { path, values }
        } else if self.eat_keyword("CONTAINS") {
            Predicate::Function(Function::Contains {
                path,
                operand: self.operand()?,
            })
        } else if !negated && self.eat_keyword("BEGINS") {
            self.expect_keyword("WITH")?;
            Predicate::Function(Function::BeginsWith {
                path,
                prefix: self.operand()?,
            })
        } else if !negated && self.eat_keyword("IS") {
            let not = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            Predicate::Function(if not {
                Function::AttributeExists(path)
            } else {
                Function::AttributeNotExists(path)
            })
        } else {
            return Err(self.unexpected("comparison operator"));
        };

        Ok(if negated { Predicate::Not(Box::new(pred)) } else { pred })
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<Statement> {
        let word = match self.kind() {
            TokenKind::Ident(word) => word.to_ascii_uppercase(),
            _ => return Err(self.unexpected("statement")),
        };
        match word.as_str() {
            "SELECT" => self.select(),
            "SCAN" => self.scan(),
            "COUNT" => self.count(),
            "INSERT" => self.insert(),
            "UPDATE" => self.update(),
            "DELETE" => self.delete(),
            "CREATE" => self.create(),
            "ALTER" => self.alter(),
            "DROP" => self.drop_table(),
            "DUMP" => self.dump(),
            "LOAD" => self.load(),
            "EXPLAIN" => {
                self.advance();
                Ok(Statement::Explain(Box::new(self.statement()?)))
            }
            "ANALYZE" => {
                self.advance();
                Ok(Statement::Analyze(Box::new(self.statement()?)))
            }
            _ => Err(self.error(format!("unknown statement '{}'", word))),
        }
    }

    fn select(&mut self) -> Result<Statement> {
        self.expect_keyword("SELECT")?;
        let consistent = self.eat_keyword("CONSISTENT");
        let projection = if self.eat(&TokenKind::Star) {
            Projection::All
        } else if self.is_keyword("COUNT") && *self.peek_at(1) == TokenKind::LeftParen {
            self.advance();
            self.advance();
            self.expect(&TokenKind::Star)?;
            self.expect(&TokenKind::RightParen)?;
            Projection::Count
        } else {
            Projection::Attributes(self.path_list()?)
        };
        self.expect_keyword("FROM")?;
        let table = self.identifier()?;

        let allowed = if projection == Projection::Count { COUNT_CLAUSES } else { READ_CLAUSES };
        let stmt = self.read_statement(table, projection, consistent, allowed)?;
        Ok(Statement::Select(stmt))
    }

    fn scan(&mut self) -> Result<Statement> {
        self.expect_keyword("SCAN")?;
        let consistent = self.eat_keyword("CONSISTENT");

        // Either `SCAN t ...` or `SCAN <projection> FROM t ...`
        let start = self.pos;
        let projection = if self.eat(&TokenKind::Star) {
            Some(Projection::All)
        } else {
            match self.path_list() {
                Ok(paths) if self.is_keyword("FROM") => Some(Projection::Attributes(paths)),
                _ => None,
            }
        };
        let projection = match projection {
            Some(projection) => {
                self.expect_keyword("FROM")?;
                projection
            }
            None => {
                self.pos = start;
                Projection::All
            }
        };
        let table = self.identifier()?;
        let stmt = self.read_statement(table, projection, consistent, READ_CLAUSES)?;
        Ok(Statement::Scan(stmt))
    }

    fn count(&mut self) -> Result<Statement> {
        self.expect_keyword("COUNT")?;
        let consistent = self.eat_keyword("CONSISTENT");
        let table = self.identifier()?;
        let stmt = self.read_statement(table, Projection::Count, consistent, COUNT_CLAUSES)?;
        Ok(Statement::Count(stmt))
    }

    fn read_statement(
        &mut self,
        table: String,
        projection: Projection,
        consistent: bool,
        allowed: &[Clause],
    ) -> Result<SelectStatement> {
        let mut clauses = self.clauses(allowed)?;
        let mut stmt = SelectStatement::new(table, projection);
        stmt.consistent = consistent;
        stmt.where_clause = clauses.selector();
        stmt.using = clauses.using;
        stmt.limit = clauses.limit;
        stmt.scan_limit = clauses.scan_limit;
        stmt.order_by = clauses.order_by;
        stmt.throttle = clauses.throttle;
        Ok(stmt)
    }

    fn next_clause(&self) -> Option<Clause> {
        if self.is_keyword("WHERE") {
            Some(Clause::Where)
        } else if self.is_keyword("KEYS") && self.keyword_at(1, "IN") {
            Some(Clause::KeysIn)
        } else if self.is_keyword("FILTER") {
            Some(Clause::Filter)
        } else if self.is_keyword("USING") {
            Some(Clause::Using)
        } else if self.is_keyword("LIMIT") {
            Some(Clause::Limit)
        } else if self.is_keyword("SCAN") && self.keyword_at(1, "LIMIT") {
            Some(Clause::ScanLimit)
        } else if self.is_keyword("ORDER") || self.is_keyword("ASC") || self.is_keyword("DESC") {
            Some(Clause::OrderBy)
        } else if self.is_keyword("THROTTLE") {
            Some(Clause::Throttle)
        } else if self.is_keyword("RETURNS") {
            Some(Clause::Returns)
        } else {
            None
        }
    }

    fn clauses(&mut self, allowed: &[Clause]) -> Result<Clauses> {
        let mut clauses = Clauses::default();
        let mut seen: Vec<Clause> = Vec::new();

        while let Some(clause) = self.next_clause() {
            if !allowed.contains(&clause) {
                return Err(self.error(format!("{} is not allowed here", clause.name())));
            }
            // WHERE KEYS IN counts as the KEYS IN clause
            let slot = if clause == Clause::Where && self.keyword_at(1, "KEYS") {
                Clause::KeysIn
            } else {
                clause
            };
            let selector_taken = matches!(slot, Clause::Where | Clause::KeysIn)
                && (seen.contains(&Clause::Where) || seen.contains(&Clause::KeysIn));
            if seen.contains(&slot) || selector_taken {
                return Err(self.error(format!("duplicate {} clause", slot.name())));
            }
            seen.push(slot);

            match clause {
                Clause::Where => {
                    self.advance();
                    if self.is_keyword("KEYS") {
                        clauses.where_clause = Some(self.keys_in()?);
                    } else {
                        clauses.where_clause = Some(WhereClause::Predicate(self.predicate()?));
                    }
                }
                Clause::KeysIn => clauses.where_clause = Some(self.keys_in()?),
                Clause::Filter => {
                    self.advance();
                    clauses.filter = Some(self.predicate()?);
                }
                Clause::Using => {
                    self.advance();
                    clauses.using = Some(self.name()?);
                }
                Clause::Limit => {
                    self.advance();
                    clauses.limit = Some(self.unsigned("LIMIT")?);
                }
                Clause::ScanLimit => {
                    self.advance();
                    self.advance();
                    clauses.scan_limit = Some(self.unsigned("SCAN LIMIT")?);
                }
                Clause::OrderBy => clauses.order_by = Some(self.order_by()?),
                Clause::Throttle => {
                    self.advance();
                    clauses.throttle = Some(self.ceiling()?);
                }
                Clause::Returns => {
                    self.advance();
                    clauses.returns = Some(self.returns()?);
                }
            }
        }
        Ok(clauses)
    }

    fn order_by(&mut self) -> Result<OrderBy> {
        let attribute = if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            Some(self.path()?)
        } else {
            None
        };
        let ascending = if self.eat_keyword("DESC") {
            false
        } else {
            self.eat_keyword("ASC");
            true
        };
        Ok(OrderBy { attribute, ascending })
    }

    /// `KEYS IN ('a', 1), ('b', 2)`, or bare values for hash-only tables.
    fn keys_in(&mut self) -> Result<WhereClause> {
        self.expect_keyword("KEYS")?;
        self.expect_keyword("IN")?;
        let mut keys = Vec::new();
        loop {
            if self.eat(&TokenKind::LeftParen) {
                let mut tuple = vec![self.value()?];
                while self.eat(&TokenKind::Comma) {
                    tuple.push(self.value()?);
                }
                self.expect(&TokenKind::RightParen)?;
                keys.push(tuple);
            } else {
                keys.push(vec![self.value()?]);
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(WhereClause::KeysIn { keys, filter: None })
    }

    fn limit(&mut self) -> Result<Limit> {
        let pos = self.peek().pos;
        let text = match self.advance().kind {
            TokenKind::Star => "*".to_string(),
            TokenKind::Number(n) => {
                if self.eat(&TokenKind::Percent) {
                    format!("{}%", n)
                } else {
                    n
                }
            }
            TokenKind::Str(s) => s,
            other => {
                return Err(Error::syntax(
                    pos,
                    format!("expected a throughput limit, found {}", other.describe()),
                ))
            }
        };
        text.parse::<Limit>()
            .map_err(|e| Error::syntax(pos, e.to_string()))
    }

    fn ceiling(&mut self) -> Result<Ceiling> {
        self.expect(&TokenKind::LeftParen)?;
        let read = self.limit()?;
        self.expect(&TokenKind::Comma)?;
        let write = self.limit()?;
        self.expect(&TokenKind::RightParen)?;
        Ok(Ceiling::new(read, write))
    }

    fn returns(&mut self) -> Result<Returns> {
        let word = self.identifier()?.to_ascii_uppercase();
        let returns = match word.as_str() {
            "NONE" => Returns::None,
            "ALL_NEW" => Returns::AllNew,
            "ALL_OLD" => Returns::AllOld,
            "UPDATED_NEW" => Returns::UpdatedNew,
            "UPDATED_OLD" => Returns::UpdatedOld,
            "ALL" | "UPDATED" => {
                let updated = word == "UPDATED";
                let new = if self.eat_keyword("NEW") {
                    true
                } else {
                    self.expect_keyword("OLD")?;
                    false
                };
                match (updated, new) {
                    (false, true) => Returns::AllNew,
                    (false, false) => Returns::AllOld,
                    (true, true) => Returns::UpdatedNew,
                    (true, false) => Returns::UpdatedOld,
                }
            }
            _ => return Err(self.error(format!("unknown RETURNS value '{}'", word))),
        };
        Ok(returns)
    }

    fn insert(&mut self) -> Result<Statement> {
        self.expect_keyword("INSERT")?;
        self.expect_keyword("INTO")?;
        let table = self.identifier()?;

        let mut items = Vec::new();
        if self.eat_keyword("ITEMS") {
            loop {
                self.expect(&TokenKind::LeftBrace)?;
                items.push(self.map_body()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        } else {
            self.expect(&TokenKind::LeftParen)?;
            let columns = self.path_list()?;
            self.expect(&TokenKind::RightParen)?;
            let names = columns
                .iter()
                .map(|p| {
                    p.as_attribute()
                        .map(str::to_string)
                        .ok_or_else(|| self.error(format!("INSERT column '{}' must be a top-level attribute", p)))
                })
                .collect::<Result<Vec<_>>>()?;

            self.expect_keyword("VALUES")?;
            loop {
                let pos = self.peek().pos;
                self.expect(&TokenKind::LeftParen)?;
                let mut row = vec![self.value()?];
                while self.eat(&TokenKind::Comma) {
                    row.push(self.value()?);
                }
                self.expect(&TokenKind::RightParen)?;
                if row.len() != names.len() {
                    return Err(Error::syntax(
                        pos,
                        format!("expected {} values, found {}", names.len(), row.len()),
                    ));
                }
                let item: Item = names.iter().cloned().zip(row).collect();
                items.push(item);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let throttle = if self.eat_keyword("THROTTLE") {
            Some(self.ceiling()?)
        } else {
            None
        };
        Ok(Statement::Insert(InsertStatement {
            table,
            items,
            throttle,
        }))
    }

    fn set_term(&mut self) -> Result<SetValue> {
        let function = match (self.kind(), self.peek_at(1)) {
            (TokenKind::Ident(name), TokenKind::LeftParen) => Some(name.to_ascii_lowercase()),
            _ => None,
        };
        match function.as_deref() {
            Some("if_not_exists") => {
                self.advance();
                self.advance();
                let path = self.path()?;
                self.expect(&TokenKind::Comma)?;
                let fallback = self.operand()?;
                self.expect(&TokenKind::RightParen)?;
                Ok(SetValue::IfNotExists(path, fallback))
            }
            Some("list_append") => {
                self.advance();
                self.advance();
                let head = self.operand()?;
                self.expect(&TokenKind::Comma)?;
                let tail = self.operand()?;
                self.expect(&TokenKind::RightParen)?;
                Ok(SetValue::ListAppend(head, tail))
            }
            Some(name) => Err(self.error(format!("unknown function '{}'", name))),
            None => Ok(SetValue::Operand(self.operand()?)),
        }
    }

    fn set_value(&mut self) -> Result<SetValue> {
        let left = self.set_term()?;
        if self.eat(&TokenKind::Plus) {
            Ok(SetValue::Plus(Box::new(left), Box::new(self.set_term()?)))
        } else if self.eat(&TokenKind::Minus) {
            Ok(SetValue::Minus(Box::new(left), Box::new(self.set_term()?)))
        } else {
            Ok(left)
        }
    }

    /// SET / REMOVE / ADD / DELETE sections in any order.
    fn update_actions(&mut self) -> Result<Vec<UpdateAction>> {
        let mut actions = Vec::new();
        loop {
            if self.eat_keyword("SET") {
                loop {
                    let path = self.path()?;
                    self.expect(&TokenKind::Equal)?;
                    actions.push(UpdateAction::Set(path, self.set_value()?));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
            } else if self.eat_keyword("REMOVE") {
                for path in self.path_list()? {
                    actions.push(UpdateAction::Remove(path));
                }
            } else if self.eat_keyword("ADD") {
                loop {
                    let path = self.path()?;
                    actions.push(UpdateAction::Add(path, self.operand()?));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
            } else if self.eat_keyword("DELETE") {
                loop {
                    let path = self.path()?;
                    actions.push(UpdateAction::Delete(path, self.operand()?));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
            } else {
                break;
            }
        }
        if actions.is_empty() {
            return Err(self.unexpected("SET, REMOVE, ADD or DELETE"));
        }
        Ok(actions)
    }

    fn update(&mut self) -> Result<Statement> {
        self.expect_keyword("UPDATE")?;
        let table = self.identifier()?;
        let actions = self.update_actions()?;
        let mut clauses = self.clauses(UPDATE_CLAUSES)?;
        Ok(Statement::Update(UpdateStatement {
            table,
            actions,
            where_clause: clauses.selector(),
            using: clauses.using,
            returns: clauses.returns.unwrap_or_default(),
            throttle: clauses.throttle,
        }))
    }

    fn delete(&mut self) -> Result<Statement> {
        self.expect_keyword("DELETE")?;
        self.expect_keyword("FROM")?;
        let table = self.identifier()?;
        let mut clauses = self.clauses(DELETE_CLAUSES)?;
        Ok(Statement::Delete(DeleteStatement {
            table,
            where_clause: clauses.selector(),
            using: clauses.using,
            throttle: clauses.throttle,
        }))
    }

    // ---- DDL ----

    fn key_type(&mut self) -> Result<KeyType> {
        let pos = self.peek().pos;
        let word = self.identifier()?;
        KeyType::from_keyword(&word).ok_or_else(|| {
            Error::syntax(pos, format!("expected STRING, NUMBER or BINARY, found '{}'", word))
        })
    }

    fn throughput(&mut self) -> Result<Throughput> {
        self.expect(&TokenKind::LeftParen)?;
        let read = self.capacity_units()?;
        self.expect(&TokenKind::Comma)?;
        let write = self.capacity_units()?;
        self.expect(&TokenKind::RightParen)?;
        Ok(Throughput::new(read, write))
    }

    /// Optional `ALL` / `KEYS` / `INCLUDE` prefix of `INDEX`.
    fn projection_kind(&mut self) -> &'static str {
        for kind in ["ALL", "KEYS", "INCLUDE"] {
            if self.eat_keyword(kind) {
                return kind;
            }
        }
        "ALL"
    }

    fn include_list(&mut self) -> Result<Vec<String>> {
        self.expect(&TokenKind::LeftBracket)?;
        let mut names = vec![self.name()?];
        while self.eat(&TokenKind::Comma) {
            names.push(self.name()?);
        }
        self.expect(&TokenKind::RightBracket)?;
        Ok(names)
    }

    fn index_projection(&self, kind: &str, includes: Option<Vec<String>>) -> Result<IndexProjection> {
        match (kind, includes) {
            ("INCLUDE", Some(attrs)) => Ok(IndexProjection::Include(attrs)),
            ("INCLUDE", None) => Err(self.error("INCLUDE index needs a list of attributes")),
            (_, Some(_)) => Err(self.error("only INCLUDE indexes take a list of attributes")),
            ("KEYS", None) => Ok(IndexProjection::KeysOnly),
            _ => Ok(IndexProjection::All),
        }
    }

    /// Key attribute of a global index: `name [TYPE]`, falling back to the
    /// type declared among the table's columns.
    fn index_key(&mut self, declared: &HashMap<String, KeyType>) -> Result<KeyAttribute> {
        let pos = self.peek().pos;
        let name = self.identifier()?;
        let typed = matches!(self.kind(), TokenKind::Ident(word)
            if ["STRING", "NUMBER", "BINARY"].iter().any(|k| word.eq_ignore_ascii_case(k)));
        let key_type = if typed {
            self.key_type()?
        } else {
            *declared
                .get(&name)
                .ok_or_else(|| Error::syntax(pos, format!("attribute '{}' has no declared type", name)))?
        };
        Ok(KeyAttribute::new(name, key_type))
    }

    /// `[ALL|KEYS|INCLUDE] INDEX ('name', hash [, range] [, [includes]] [, THROUGHPUT (r, w)])`
    fn global_index(&mut self, declared: &HashMap<String, KeyType>) -> Result<GlobalIndex> {
        let kind = self.projection_kind();
        self.expect_keyword("INDEX")?;
        self.expect(&TokenKind::LeftParen)?;
        let name = self.name()?;
        self.expect(&TokenKind::Comma)?;
        let mut index = GlobalIndex::new(name, self.index_key(declared)?);

        let mut includes = None;
        while self.eat(&TokenKind::Comma) {
            if *self.kind() == TokenKind::LeftBracket {
                includes = Some(self.include_list()?);
            } else if self.eat_keyword("THROUGHPUT") {
                index.throughput = self.throughput()?;
            } else if index.range_key.is_none() && includes.is_none() {
                index.range_key = Some(self.index_key(declared)?);
            } else {
                return Err(self.unexpected("include list or THROUGHPUT"));
            }
        }
        self.expect(&TokenKind::RightParen)?;
        index.projection = self.index_projection(kind, includes)?;
        Ok(index)
    }

    /// `[ALL|KEYS|INCLUDE] INDEX ('name', range [, [includes]])`
    fn local_index(&mut self, declared: &HashMap<String, KeyType>) -> Result<LocalIndex> {
        let kind = self.projection_kind();
        self.expect_keyword("INDEX")?;
        self.expect(&TokenKind::LeftParen)?;
        let name = self.name()?;
        self.expect(&TokenKind::Comma)?;
        let mut index = LocalIndex::new(name, self.index_key(declared)?);
        let includes = if self.eat(&TokenKind::Comma) {
            Some(self.include_list()?)
        } else {
            None
        };
        self.expect(&TokenKind::RightParen)?;
        index.projection = self.index_projection(kind, includes)?;
        Ok(index)
    }

    fn if_exists(&mut self, not: bool) -> Result<bool> {
        if !self.eat_keyword("IF") {
            return Ok(false);
        }
        if not {
            self.expect_keyword("NOT")?;
        }
        self.expect_keyword("EXISTS")?;
        Ok(true)
    }

    fn create(&mut self) -> Result<Statement> {
        self.expect_keyword("CREATE")?;
        self.expect_keyword("TABLE")?;
        let if_not_exists = self.if_exists(true)?;
        let table_pos = self.peek().pos;
        let name = self.identifier()?;
        self.expect(&TokenKind::LeftParen)?;

        let mut declared: HashMap<String, KeyType> = HashMap::new();
        let mut hash_key: Option<KeyAttribute> = None;
        let mut range_key: Option<KeyAttribute> = None;
        let mut local_indexes = Vec::new();
        let mut throughput = Throughput::default();

        loop {
            if self.eat_keyword("THROUGHPUT") {
                throughput = self.throughput()?;
            } else {
                let pos = self.peek().pos;
                let attr = self.identifier()?;
                let key_type = self.key_type()?;
                declared.insert(attr.clone(), key_type);
                let key = KeyAttribute::new(attr, key_type);

                if self.eat_keyword("HASH") {
                    self.expect_keyword("KEY")?;
                    if hash_key.replace(key).is_some() {
                        return Err(Error::syntax(pos, "table already has a hash key"));
                    }
                } else if self.eat_keyword("RANGE") {
                    self.expect_keyword("KEY")?;
                    if range_key.replace(key).is_some() {
                        return Err(Error::syntax(pos, "table already has a range key"));
                    }
                } else if self.is_keyword("INDEX")
                    || (["ALL", "KEYS", "INCLUDE"].iter().any(|k| self.is_keyword(k))
                        && self.keyword_at(1, "INDEX"))
                {
                    let kind = self.projection_kind();
                    self.expect_keyword("INDEX")?;
                    self.expect(&TokenKind::LeftParen)?;
                    let index_name = self.name()?;
                    let includes = if self.eat(&TokenKind::Comma) {
                        Some(self.include_list()?)
                    } else {
                        None
                    };
                    self.expect(&TokenKind::RightParen)?;
                    let mut index = LocalIndex::new(index_name, key);
                    index.projection = self.index_projection(kind, includes)?;
                    local_indexes.push(index);
                }
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RightParen)?;

        let mut global_indexes = Vec::new();
        loop {
            if self.eat_keyword("GLOBAL") {
                global_indexes.push(self.global_index(&declared)?);
            } else if self.eat_keyword("LOCAL") {
                local_indexes.push(self.local_index(&declared)?);
            } else {
                break;
            }
            self.eat(&TokenKind::Comma);
        }

        let hash_key = hash_key.ok_or_else(|| Error::syntax(table_pos, "table has no HASH KEY"))?;
        let table = TableMeta {
            name,
            hash_key,
            range_key,
            local_indexes,
            global_indexes,
            throughput,
        };
        Ok(Statement::Create(CreateTableStatement {
            table,
            if_not_exists,
        }))
    }

    fn optional_units(&mut self) -> Result<Option<u64>> {
        if self.eat(&TokenKind::Star) {
            Ok(None)
        } else {
            self.capacity_units().map(Some)
        }
    }

    fn alter(&mut self) -> Result<Statement> {
        self.expect_keyword("ALTER")?;
        self.expect_keyword("TABLE")?;
        let table = self.identifier()?;

        let action = if self.eat_keyword("SET") {
            let index = if self.eat_keyword("INDEX") {
                Some(self.name()?)
            } else {
                None
            };
            self.expect_keyword("THROUGHPUT")?;
            self.expect(&TokenKind::LeftParen)?;
            let read = self.optional_units()?;
            self.expect(&TokenKind::Comma)?;
            let write = self.optional_units()?;
            self.expect(&TokenKind::RightParen)?;
            AlterAction::SetThroughput { index, read, write }
        } else if self.eat_keyword("DROP") {
            self.expect_keyword("INDEX")?;
            let name = self.name()?;
            let if_exists = self.if_exists(false)?;
            AlterAction::DropIndex { name, if_exists }
        } else if self.eat_keyword("CREATE") {
            self.expect_keyword("GLOBAL")?;
            AlterAction::CreateIndex(self.global_index(&HashMap::new())?)
        } else {
            return Err(self.unexpected("SET, DROP or CREATE"));
        };
        Ok(Statement::Alter(AlterTableStatement { table, action }))
    }

    fn drop_table(&mut self) -> Result<Statement> {
        self.expect_keyword("DROP")?;
        self.expect_keyword("TABLE")?;
        let if_exists = self.if_exists(false)?;
        let table = self.identifier()?;
        Ok(Statement::Drop(DropTableStatement { table, if_exists }))
    }

    fn dump(&mut self) -> Result<Statement> {
        self.expect_keyword("DUMP")?;
        self.expect_keyword("SCHEMA")?;
        let mut tables = Vec::new();
        if matches!(self.kind(), TokenKind::Ident(_) | TokenKind::QuotedIdent(_)) {
            tables.push(self.identifier()?);
            while self.eat(&TokenKind::Comma) {
                tables.push(self.identifier()?);
            }
        }
        Ok(Statement::Dump(tables))
    }

    fn load(&mut self) -> Result<Statement> {
        self.expect_keyword("LOAD")?;
        let file = match self.advance().kind {
            TokenKind::Str(file) => file,
            other => {
                return Err(self.error(format!("expected a file name, found {}", other.describe())))
            }
        };
        self.expect_keyword("INTO")?;
        let table = self.identifier()?;
        let throttle = if self.eat_keyword("THROTTLE") {
            Some(self.ceiling()?)
        } else {
            None
        };
        Ok(Statement::Load(LoadStatement {
            file,
            table,
            throttle,
        }))
    }
}
