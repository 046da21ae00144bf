//! Recursive-descent InfluxQL parser
//!
//! Covers the statements the cluster routes: SELECT, the SHOW family,
//! database/retention/CQ DDL, series deletion and the user/grant statements.

use super::ast::*;
use super::lexer::{Lexer, Spanned, Token};
use crate::auth::Privilege;
use crate::{RelayError, Result};

/// Keywords that terminate an expression list
const CLAUSE_KEYWORDS: &[&str] = &[
    "FROM", "WHERE", "GROUP", "ORDER", "LIMIT", "OFFSET", "SLIMIT", "SOFFSET", "FILL", "INTO",
    "AS", "AND", "OR", "BY", "END",
];

/// Parse a query string holding one or more `;`-separated statements
pub fn parse_query(input: &str) -> Result<Vec<Statement>> {
    let mut parser = Parser::new(input)?;
    let mut statements = Vec::new();
    loop {
        while parser.next_if(&Token::Semicolon) {}
        if parser.peek().is_none() {
            break;
        }
        statements.push(parser.statement()?);
        match parser.peek() {
            None | Some(Token::Semicolon) => {}
            Some(t) => return Err(parser.unexpected(t.clone(), "end of statement")),
        }
    }
    if statements.is_empty() {
        return Err(RelayError::Parse("empty query".into()));
    }
    Ok(statements)
}

/// Parse exactly one statement
pub fn parse_statement(input: &str) -> Result<Statement> {
    let mut statements = parse_query(input)?;
    if statements.len() != 1 {
        return Err(RelayError::Parse(format!(
            "expected one statement, found {}",
            statements.len()
        )));
    }
    Ok(statements.remove(0))
}

/// Parse a standalone expression
pub fn parse_expr(input: &str) -> Result<Expr> {
    let mut parser = Parser::new(input)?;
    let expr = parser.expr()?;
    if let Some(t) = parser.peek() {
        return Err(parser.unexpected(t.clone(), "end of expression"));
    }
    Ok(expr)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self> {
        Ok(Self {
            input,
            tokens: Lexer::new(input).tokenize()?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|s| &s.token)
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        self.peek().map(|t| t.is_keyword(kw)).unwrap_or(false)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .map(|s| s.token.clone())
            .ok_or_else(|| RelayError::Parse("unexpected end of statement".into()))?;
        self.pos += 1;
        Ok(token)
    }

    fn next_if(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn next_if_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self, found: Token, expected: &str) -> RelayError {
        RelayError::Parse(format!("found {}, expected {}", found, expected))
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        let found = self.next()?;
        if found == token {
            Ok(())
        } else {
            Err(self.unexpected(found, &token.to_string()))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        let found = self.next()?;
        if found.is_keyword(kw) {
            Ok(())
        } else {
            Err(self.unexpected(found, kw))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next()? {
            Token::Ident(s) | Token::QuotedIdent(s) => Ok(s),
            other => Err(self.unexpected(other, "identifier")),
        }
    }

    fn string(&mut self) -> Result<String> {
        match self.next()? {
            Token::String(s) => Ok(s),
            other => Err(self.unexpected(other, "string")),
        }
    }

    fn unsigned(&mut self) -> Result<u64> {
        match self.next()? {
            Token::Number(n) => n
                .parse()
                .map_err(|_| RelayError::Parse(format!("invalid integer {}", n))),
            other => Err(self.unexpected(other, "integer")),
        }
    }

    fn duration(&mut self) -> Result<i64> {
        match self.next()? {
            Token::Duration(d) => Ok(d),
            t if t.is_keyword("INF") => Ok(0),
            other => Err(self.unexpected(other, "duration")),
        }
    }

    fn on_clause(&mut self) -> Result<Option<String>> {
        if self.next_if_keyword("ON") {
            Ok(Some(self.ident()?))
        } else {
            Ok(None)
        }
    }

    fn from_clause(&mut self) -> Result<Option<Measurement>> {
        if self.next_if_keyword("FROM") {
            Ok(Some(self.measurement()?))
        } else {
            Ok(None)
        }
    }

    fn where_clause(&mut self) -> Result<Option<Expr>> {
        if self.next_if_keyword("WHERE") {
            Ok(Some(self.expr()?))
        } else {
            Ok(None)
        }
    }

    /// Consume the rest of the statement and return its source text
    fn rest_as_text(&mut self, start: usize) -> String {
        let begin = self.tokens[start].start;
        let mut end = self.tokens[self.pos - 1].end;
        while let Some(spanned) = self.tokens.get(self.pos) {
            if spanned.token == Token::Semicolon {
                break;
            }
            end = spanned.end;
            self.pos += 1;
        }
        self.input[begin..end].to_string()
    }

    fn statement(&mut self) -> Result<Statement> {
        let start = self.pos;
        let head = self.next()?;
        let kw = match &head {
            Token::Ident(s) => s.to_ascii_uppercase(),
            other => return Err(self.unexpected(other.clone(), "statement")),
        };
        match kw.as_str() {
            "SELECT" => Ok(Statement::Select(self.select_body()?)),
            "SHOW" => self.show(start),
            "CREATE" => self.create(),
            "ALTER" => {
                self.expect_keyword("RETENTION")?;
                self.expect_keyword("POLICY")?;
                Ok(Statement::AlterRetentionPolicy(self.retention_policy(false)?))
            }
            "DROP" => self.drop(start),
            "DELETE" => {
                let from = self.from_clause()?;
                let condition = self.where_clause()?;
                Ok(Statement::Delete { from, condition })
            }
            "SET" => {
                self.expect_keyword("PASSWORD")?;
                self.expect_keyword("FOR")?;
                let name = self.ident()?;
                self.expect(Token::Eq)?;
                let password = self.string()?;
                Ok(Statement::SetPassword { name, password })
            }
            "GRANT" => {
                let (privilege, on) = self.privilege_target()?;
                self.expect_keyword("TO")?;
                let user = self.ident()?;
                Ok(Statement::Grant { privilege, on, user })
            }
            "REVOKE" => {
                let (privilege, on) = self.privilege_target()?;
                self.expect_keyword("FROM")?;
                let user = self.ident()?;
                Ok(Statement::Revoke { privilege, on, user })
            }
            "KILL" => Ok(Statement::Diagnostic(self.rest_as_text(start))),
            _ => Err(self.unexpected(head, "SELECT, SHOW, CREATE, DROP, DELETE, ALTER, GRANT, REVOKE, SET")),
        }
    }

    fn show(&mut self, start: usize) -> Result<Statement> {
        let what = self.next()?;
        let kw = match &what {
            Token::Ident(s) => s.to_ascii_uppercase(),
            other => return Err(self.unexpected(other.clone(), "SHOW target")),
        };
        match kw.as_str() {
            "DATABASES" => Ok(Statement::ShowDatabases),
            "MEASUREMENTS" => {
                let on = self.on_clause()?;
                let condition = self.where_clause()?;
                Ok(Statement::ShowMeasurements { on, condition })
            }
            "SERIES" => {
                let on = self.on_clause()?;
                let from = self.from_clause()?;
                let condition = self.where_clause()?;
                Ok(Statement::ShowSeries { on, from, condition })
            }
            "TAG" if self.next_if_keyword("KEYS") => {
                let on = self.on_clause()?;
                let from = self.from_clause()?;
                Ok(Statement::ShowTagKeys { on, from })
            }
            "TAG" => {
                self.expect_keyword("VALUES")?;
                let on = self.on_clause()?;
                let from = self.from_clause()?;
                self.expect_keyword("WITH")?;
                self.expect_keyword("KEY")?;
                let keys = if self.next_if(&Token::Eq) {
                    vec![self.ident()?]
                } else {
                    self.expect_keyword("IN")?;
                    self.expect(Token::OpenParen)?;
                    let mut keys = vec![self.ident()?];
                    while self.next_if(&Token::Comma) {
                        keys.push(self.ident()?);
                    }
                    self.expect(Token::CloseParen)?;
                    keys
                };
                let condition = self.where_clause()?;
                Ok(Statement::ShowTagValues { on, from, keys, condition })
            }
            "FIELD" => {
                self.expect_keyword("KEYS")?;
                let on = self.on_clause()?;
                let from = self.from_clause()?;
                Ok(Statement::ShowFieldKeys { on, from })
            }
            "RETENTION" => {
                self.expect_keyword("POLICIES")?;
                Ok(Statement::ShowRetentionPolicies { on: self.on_clause()? })
            }
            "CONTINUOUS" => {
                self.expect_keyword("QUERIES")?;
                Ok(Statement::ShowContinuousQueries)
            }
            "USERS" => Ok(Statement::ShowUsers),
            "GRANTS" => {
                self.expect_keyword("FOR")?;
                Ok(Statement::ShowGrants { user: self.ident()? })
            }
            "SHARDS" | "SHARD" | "STATS" | "DIAGNOSTICS" | "QUERIES" | "SUBSCRIPTIONS" => {
                Ok(Statement::Diagnostic(self.rest_as_text(start)))
            }
            _ => Err(self.unexpected(what, "SHOW target")),
        }
    }

    fn create(&mut self) -> Result<Statement> {
        let what = self.next()?;
        if what.is_keyword("DATABASE") {
            return Ok(Statement::CreateDatabase { name: self.ident()? });
        }
        if what.is_keyword("RETENTION") {
            self.expect_keyword("POLICY")?;
            return Ok(Statement::CreateRetentionPolicy(self.retention_policy(true)?));
        }
        if what.is_keyword("CONTINUOUS") {
            self.expect_keyword("QUERY")?;
            return self.continuous_query();
        }
        if what.is_keyword("USER") {
            let name = self.ident()?;
            self.expect_keyword("WITH")?;
            self.expect_keyword("PASSWORD")?;
            let password = self.string()?;
            let admin = if self.next_if_keyword("WITH") {
                self.expect_keyword("ALL")?;
                self.expect_keyword("PRIVILEGES")?;
                true
            } else {
                false
            };
            return Ok(Statement::CreateUser { name, password, admin });
        }
        Err(self.unexpected(what, "DATABASE, RETENTION, CONTINUOUS, USER"))
    }

    fn drop(&mut self, start: usize) -> Result<Statement> {
        let what = self.next()?;
        if what.is_keyword("DATABASE") {
            return Ok(Statement::DropDatabase { name: self.ident()? });
        }
        if what.is_keyword("RETENTION") {
            self.expect_keyword("POLICY")?;
            let name = self.ident()?;
            self.expect_keyword("ON")?;
            let database = self.ident()?;
            return Ok(Statement::DropRetentionPolicy { name, database });
        }
        if what.is_keyword("CONTINUOUS") {
            self.expect_keyword("QUERY")?;
            let name = self.ident()?;
            self.expect_keyword("ON")?;
            let database = self.ident()?;
            return Ok(Statement::DropContinuousQuery { name, database });
        }
        if what.is_keyword("SERIES") {
            let from = self.from_clause()?;
            let condition = self.where_clause()?;
            return Ok(Statement::DropSeries { from, condition });
        }
        if what.is_keyword("MEASUREMENT") {
            return Ok(Statement::DropMeasurement { name: self.ident()? });
        }
        if what.is_keyword("USER") {
            return Ok(Statement::DropUser { name: self.ident()? });
        }
        if what.is_keyword("SHARD") {
            return Ok(Statement::Diagnostic(self.rest_as_text(start)));
        }
        Err(self.unexpected(what, "DATABASE, RETENTION, CONTINUOUS, SERIES, MEASUREMENT, USER"))
    }

    fn retention_policy(&mut self, create: bool) -> Result<RetentionPolicyDef> {
        let name = self.ident()?;
        self.expect_keyword("ON")?;
        let database = self.ident()?;
        let mut rp = RetentionPolicyDef {
            name,
            database,
            duration: None,
            replication: None,
            shard_duration: None,
            default: false,
        };
        loop {
            if self.next_if_keyword("DURATION") {
                rp.duration = Some(self.duration()?);
            } else if self.next_if_keyword("REPLICATION") {
                rp.replication = Some(self.unsigned()? as u32);
            } else if self.next_if_keyword("SHARD") {
                self.expect_keyword("DURATION")?;
                rp.shard_duration = Some(self.duration()?);
            } else if self.next_if_keyword("DEFAULT") {
                rp.default = true;
            } else {
                break;
            }
        }
        if create && (rp.duration.is_none() || rp.replication.is_none()) {
            return Err(RelayError::Parse(
                "retention policy requires DURATION and REPLICATION".into(),
            ));
        }
        Ok(rp)
    }

    fn continuous_query(&mut self) -> Result<Statement> {
        let name = self.ident()?;
        self.expect_keyword("ON")?;
        let database = self.ident()?;

        let mut resample = None;
        if self.peek_keyword("RESAMPLE") {
            let begin = self.tokens[self.pos].start;
            let mut end = begin;
            while !self.peek_keyword("BEGIN") {
                if self.peek().is_none() {
                    return Err(RelayError::Parse("expected BEGIN".into()));
                }
                end = self.tokens[self.pos].end;
                self.pos += 1;
            }
            resample = Some(self.input[begin..end].to_string());
        }

        self.expect_keyword("BEGIN")?;
        let body_start = self
            .tokens
            .get(self.pos)
            .map(|s| s.start)
            .ok_or_else(|| RelayError::Parse("expected SELECT".into()))?;
        self.expect_keyword("SELECT")?;
        self.select_body()?;
        let body_end = self.tokens[self.pos - 1].end;
        self.expect_keyword("END")?;

        Ok(Statement::CreateContinuousQuery {
            name,
            database,
            resample,
            body: self.input[body_start..body_end].to_string(),
        })
    }

    fn privilege_target(&mut self) -> Result<(Privilege, Option<String>)> {
        let token = self.next()?;
        let privilege = if token.is_keyword("READ") {
            Privilege::Read
        } else if token.is_keyword("WRITE") {
            Privilege::Write
        } else if token.is_keyword("ALL") {
            self.next_if_keyword("PRIVILEGES");
            Privilege::All
        } else {
            return Err(self.unexpected(token, "READ, WRITE, ALL"));
        };
        let on = self.on_clause()?;
        if on.is_none() && privilege != Privilege::All {
            return Err(RelayError::Parse(format!(
                "{:?} privilege requires ON <database>",
                privilege
            )));
        }
        Ok((privilege, on))
    }

    fn select_body(&mut self) -> Result<SelectStatement> {
        let mut stmt = SelectStatement {
            fields: self.fields()?,
            ..Default::default()
        };
        if self.next_if_keyword("INTO") {
            stmt.into = Some(self.measurement()?);
        }
        self.expect_keyword("FROM")?;
        stmt.sources.push(self.measurement()?);
        while self.next_if(&Token::Comma) {
            stmt.sources.push(self.measurement()?);
        }
        stmt.condition = self.where_clause()?;
        if self.next_if_keyword("GROUP") {
            self.expect_keyword("BY")?;
            stmt.dimensions.push(self.dimension()?);
            while self.next_if(&Token::Comma) {
                stmt.dimensions.push(self.dimension()?);
            }
        }
        if self.next_if_keyword("FILL") {
            stmt.fill = self.fill()?;
        }
        if self.next_if_keyword("ORDER") {
            self.expect_keyword("BY")?;
            self.expect_keyword("TIME")?;
            if self.next_if_keyword("DESC") {
                stmt.order_desc = true;
            } else {
                self.next_if_keyword("ASC");
            }
        }
        loop {
            if self.next_if_keyword("LIMIT") {
                stmt.limit = Some(self.unsigned()?);
            } else if self.next_if_keyword("OFFSET") {
                stmt.offset = Some(self.unsigned()?);
            } else if self.next_if_keyword("SLIMIT") {
                stmt.slimit = Some(self.unsigned()?);
            } else if self.next_if_keyword("SOFFSET") {
                stmt.soffset = Some(self.unsigned()?);
            } else {
                break;
            }
        }
        Ok(stmt)
    }

    fn fields(&mut self) -> Result<Vec<Field>> {
        let mut fields = vec![self.field()?];
        while self.next_if(&Token::Comma) {
            fields.push(self.field()?);
        }
        Ok(fields)
    }

    fn field(&mut self) -> Result<Field> {
        let expr = if self.next_if(&Token::Star) {
            Expr::Wildcard
        } else {
            self.expr()?
        };
        let alias = if self.next_if_keyword("AS") {
            Some(self.ident()?)
        } else {
            None
        };
        Ok(Field { expr, alias })
    }

    fn measurement(&mut self) -> Result<Measurement> {
        if self.next_if(&Token::OpenParen) {
            return Err(RelayError::Unsupported("subqueries are not supported".into()));
        }
        let mut segments: Vec<String> = Vec::new();
        let mut regex = None;
        loop {
            match self.peek() {
                Some(Token::Regex(_)) => {
                    if let Token::Regex(r) = self.next()? {
                        regex = Some(r);
                    }
                    break;
                }
                Some(Token::Dot) => segments.push(String::new()),
                _ => segments.push(self.ident()?),
            }
            if !self.next_if(&Token::Dot) {
                break;
            }
        }
        let mut m = Measurement {
            regex,
            ..Default::default()
        };
        if m.regex.is_none() {
            m.name = segments.pop().unwrap_or_default();
        }
        match segments.len() {
            0 => {}
            1 => m.retention_policy = segments.pop().filter(|s| !s.is_empty()),
            2 => {
                m.retention_policy = segments.pop().filter(|s| !s.is_empty());
                m.database = segments.pop().filter(|s| !s.is_empty());
            }
            _ => return Err(RelayError::Parse("too many segments in measurement name".into())),
        }
        Ok(m)
    }

    fn dimension(&mut self) -> Result<Dimension> {
        if self.next_if(&Token::Star) {
            return Ok(Dimension::Wildcard);
        }
        if let Some(Token::Regex(_)) = self.peek() {
            if let Token::Regex(r) = self.next()? {
                return Ok(Dimension::Regex(r));
            }
        }
        if self.peek_keyword("TIME") && self.peek_at(1) == Some(&Token::OpenParen) {
            self.pos += 2;
            let interval = self.duration()?;
            let mut offset = 0;
            if self.next_if(&Token::Comma) {
                let negative = self.next_if(&Token::Minus);
                offset = self.duration()?;
                if negative {
                    offset = -offset;
                }
            }
            self.expect(Token::CloseParen)?;
            return Ok(Dimension::Time { interval, offset });
        }
        Ok(Dimension::Tag(self.ident()?))
    }

    fn fill(&mut self) -> Result<Fill> {
        self.expect(Token::OpenParen)?;
        let negative = self.next_if(&Token::Minus);
        let fill = match self.next()? {
            t if t.is_keyword("NULL") => Fill::Null,
            t if t.is_keyword("NONE") => Fill::None,
            t if t.is_keyword("PREVIOUS") => Fill::Previous,
            t if t.is_keyword("LINEAR") => Fill::Linear,
            Token::Number(n) => {
                let v: f64 = n
                    .parse()
                    .map_err(|_| RelayError::Parse(format!("invalid fill value {}", n)))?;
                Fill::Value(if negative { -v } else { v })
            }
            other => return Err(self.unexpected(other, "fill option")),
        };
        self.expect(Token::CloseParen)?;
        Ok(fill)
    }

    /// Precedence climbing over binary operators
    fn expr(&mut self) -> Result<Expr> {
        self.expr_prec(1)
    }

    fn peek_operator(&self) -> Option<BinaryOp> {
        Some(match self.peek()? {
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Sub,
            Token::Star => BinaryOp::Mul,
            Token::Slash => BinaryOp::Div,
            Token::Percent => BinaryOp::Mod,
            Token::Eq => BinaryOp::Eq,
            Token::Neq => BinaryOp::Neq,
            Token::Lt => BinaryOp::Lt,
            Token::Lte => BinaryOp::Lte,
            Token::Gt => BinaryOp::Gt,
            Token::Gte => BinaryOp::Gte,
            Token::EqRegex => BinaryOp::EqRegex,
            Token::NeqRegex => BinaryOp::NeqRegex,
            t if t.is_keyword("AND") => BinaryOp::And,
            t if t.is_keyword("OR") => BinaryOp::Or,
            _ => return None,
        })
    }

    fn expr_prec(&mut self, min: u8) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.peek_operator() {
            if op.precedence() < min {
                break;
            }
            self.pos += 1;
            let rhs = self.expr_prec(op.precedence() + 1)?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.next_if(&Token::Minus) {
            return Ok(match self.unary()? {
                Expr::Integer(n) => Expr::Integer(-n),
                Expr::Number(n) => Expr::Number(-n),
                Expr::Duration(d) => Expr::Duration(-d),
                other => Expr::binary(BinaryOp::Mul, Expr::Integer(-1), other),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.next()?;
        let expr = match token {
            Token::OpenParen => {
                let inner = self.expr()?;
                self.expect(Token::CloseParen)?;
                Expr::Paren(Box::new(inner))
            }
            Token::String(s) => Expr::String(s),
            Token::Duration(d) => Expr::Duration(d),
            Token::Regex(r) => Expr::Regex(r),
            Token::Number(n) => number(&n)?,
            Token::QuotedIdent(name) => self.var_ref(name)?,
            Token::Ident(name) if self.peek() == Some(&Token::OpenParen) => {
                self.pos += 1;
                let mut args = Vec::new();
                if !self.next_if(&Token::CloseParen) {
                    loop {
                        if self.next_if(&Token::Star) {
                            args.push(Expr::Wildcard);
                        } else {
                            args.push(self.expr()?);
                        }
                        if !self.next_if(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::CloseParen)?;
                }
                Expr::Call { name, args }
            }
            t if t.is_keyword("TRUE") => Expr::Boolean(true),
            t if t.is_keyword("FALSE") => Expr::Boolean(false),
            Token::Ident(name) => {
                if CLAUSE_KEYWORDS.iter().any(|kw| name.eq_ignore_ascii_case(kw)) {
                    return Err(self.unexpected(Token::Ident(name), "expression"));
                }
                self.var_ref(name)?
            }
            other => return Err(self.unexpected(other, "expression")),
        };
        Ok(expr)
    }

    /// Variable reference with an optional `::type` cast, which is dropped
    fn var_ref(&mut self, name: String) -> Result<Expr> {
        if self.next_if(&Token::DoubleColon) {
            self.ident()?;
        }
        Ok(Expr::VarRef(name))
    }
}

fn number(n: &str) -> Result<Expr> {
    if n.contains(['.', 'e', 'E']) {
        return n
            .parse()
            .map(Expr::Number)
            .map_err(|_| RelayError::Parse(format!("invalid number {}", n)));
    }
    match n.parse::<i64>() {
        Ok(v) => Ok(Expr::Integer(v)),
        Err(_) => n
            .parse()
            .map(Expr::Number)
            .map_err(|_| RelayError::Parse(format!("invalid number {}", n))),
    }
}
