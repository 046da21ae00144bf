//! InfluxQL syntax tree
//!
//! Every node renders back to InfluxQL through `Display`; the coordinator
//! relies on this to forward statements and to send rewritten SELECTs.

use crate::auth::Privilege;
use std::fmt;

/// Statements understood by the cluster
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    ShowDatabases,
    ShowMeasurements {
        on: Option<String>,
        condition: Option<Expr>,
    },
    ShowSeries {
        on: Option<String>,
        from: Option<Measurement>,
        condition: Option<Expr>,
    },
    ShowTagKeys {
        on: Option<String>,
        from: Option<Measurement>,
    },
    ShowTagValues {
        on: Option<String>,
        from: Option<Measurement>,
        keys: Vec<String>,
        condition: Option<Expr>,
    },
    ShowFieldKeys {
        on: Option<String>,
        from: Option<Measurement>,
    },
    ShowRetentionPolicies {
        on: Option<String>,
    },
    ShowContinuousQueries,
    ShowUsers,
    ShowGrants {
        user: String,
    },
    /// Shard-level diagnostics, kept verbatim
    Diagnostic(String),
    CreateDatabase {
        name: String,
    },
    DropDatabase {
        name: String,
    },
    CreateRetentionPolicy(RetentionPolicyDef),
    AlterRetentionPolicy(RetentionPolicyDef),
    DropRetentionPolicy {
        name: String,
        database: String,
    },
    CreateContinuousQuery {
        name: String,
        database: String,
        /// Raw `RESAMPLE ...` clause, if any
        resample: Option<String>,
        /// Raw SELECT between BEGIN and END
        body: String,
    },
    DropContinuousQuery {
        name: String,
        database: String,
    },
    DropSeries {
        from: Option<Measurement>,
        condition: Option<Expr>,
    },
    Delete {
        from: Option<Measurement>,
        condition: Option<Expr>,
    },
    DropMeasurement {
        name: String,
    },
    CreateUser {
        name: String,
        password: String,
        admin: bool,
    },
    DropUser {
        name: String,
    },
    SetPassword {
        name: String,
        password: String,
    },
    /// `on: None` grants admin
    Grant {
        privilege: Privilege,
        on: Option<String>,
        user: String,
    },
    Revoke {
        privilege: Privilege,
        on: Option<String>,
        user: String,
    },
}

/// Retention policy definition (create or alter)
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicyDef {
    pub name: String,
    pub database: String,
    /// Nanoseconds, 0 = infinite
    pub duration: Option<i64>,
    pub replication: Option<u32>,
    pub shard_duration: Option<i64>,
    pub default: bool,
}

/// A SELECT statement
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStatement {
    pub fields: Vec<Field>,
    pub into: Option<Measurement>,
    pub sources: Vec<Measurement>,
    pub condition: Option<Expr>,
    pub dimensions: Vec<Dimension>,
    pub fill: Fill,
    pub order_desc: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub slimit: Option<u64>,
    pub soffset: Option<u64>,
}

/// A selected expression with optional alias
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl Field {
    pub fn new(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }

    /// Column name this field produces
    pub fn name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        self.expr.column_name()
    }
}

/// A measurement reference, optionally qualified or a regex
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Measurement {
    pub database: Option<String>,
    pub retention_policy: Option<String>,
    pub name: String,
    pub regex: Option<String>,
}

impl Measurement {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// GROUP BY dimension
#[derive(Debug, Clone, PartialEq)]
pub enum Dimension {
    Time { interval: i64, offset: i64 },
    Tag(String),
    Regex(String),
    Wildcard,
}

/// fill() option
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Fill {
    /// No fill clause given
    #[default]
    Default,
    Null,
    None,
    Previous,
    Linear,
    Value(f64),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    EqRegex,
    NeqRegex,
    And,
    Or,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "=",
            BinaryOp::Neq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::EqRegex => "=~",
            BinaryOp::NeqRegex => "!~",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }

    /// Higher binds tighter
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::Neq
            | BinaryOp::Lt
            | BinaryOp::Lte
            | BinaryOp::Gt
            | BinaryOp::Gte
            | BinaryOp::EqRegex
            | BinaryOp::NeqRegex => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 5,
        }
    }

    pub fn is_arithmetic(&self) -> bool {
        self.precedence() >= 4
    }
}

/// Expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    VarRef(String),
    Wildcard,
    Call { name: String, args: Vec<Expr> },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Paren(Box<Expr>),
    Integer(i64),
    Number(f64),
    String(String),
    Boolean(bool),
    /// Nanoseconds
    Duration(i64),
    Regex(String),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::VarRef(name.into())
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Default column name, following the TSDB's naming
    pub fn column_name(&self) -> String {
        match self {
            Expr::VarRef(name) => name.clone(),
            Expr::Call { name, .. } => name.to_lowercase(),
            Expr::Paren(inner) => inner.column_name(),
            Expr::Binary { lhs, rhs, .. } => {
                let names: Vec<String> = [lhs, rhs]
                    .iter()
                    .map(|e| e.column_name())
                    .filter(|n| !n.is_empty())
                    .collect();
                names.join("_")
            }
            _ => String::new(),
        }
    }

    /// Strip redundant parentheses
    pub fn unparen(&self) -> &Expr {
        match self {
            Expr::Paren(inner) => inner.unparen(),
            other => other,
        }
    }

    /// Walk every node, depth first
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Call { args, .. } => args.iter().for_each(|a| a.walk(f)),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            Expr::Paren(inner) => inner.walk(f),
            _ => {}
        }
    }
}

impl SelectStatement {
    /// Whether any field is an aggregate or selector call
    pub fn has_calls(&self) -> bool {
        self.fields.iter().any(|f| {
            let mut found = false;
            f.expr.walk(&mut |e| {
                if matches!(e, Expr::Call { .. }) {
                    found = true;
                }
            });
            found
        })
    }

    /// GROUP BY time interval and offset, if any
    pub fn group_by_time(&self) -> Option<(i64, i64)> {
        self.dimensions.iter().find_map(|d| match d {
            Dimension::Time { interval, offset } => Some((*interval, *offset)),
            _ => None,
        })
    }

    /// GROUP BY tag names
    pub fn group_by_tags(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .filter_map(|d| match d {
                Dimension::Tag(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }
}

const RESERVED: &[&str] = &[
    "all", "alter", "and", "as", "asc", "begin", "by", "create", "database", "databases",
    "default", "delete", "desc", "drop", "duration", "end", "field", "fill", "for", "from",
    "grant", "group", "in", "insert", "into", "key", "keys", "limit", "measurement",
    "measurements", "offset", "on", "or", "order", "password", "policy", "privileges",
    "revoke", "select", "series", "set", "show", "slimit", "soffset", "tag", "to", "user",
    "users", "values", "where", "with", "write", "read",
];

/// Render an identifier, quoting when needed
pub fn quote_ident(ident: &str) -> String {
    let plain = ident
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.contains(&ident.to_ascii_lowercase().as_str());
    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// Render a string literal
pub fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Render a duration in its largest exact unit
pub fn format_duration(nanos: i64) -> String {
    if nanos == 0 {
        return "0s".into();
    }
    const UNITS: &[(&str, i64)] = &[
        ("w", 604_800_000_000_000),
        ("d", 86_400_000_000_000),
        ("h", 3_600_000_000_000),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("u", 1_000),
        ("ns", 1),
    ];
    for (unit, size) in UNITS {
        if nanos % size == 0 {
            return format!("{}{}", nanos / size, unit);
        }
    }
    format!("{}ns", nanos)
}

fn format_float(f: f64) -> String {
    let s = format!("{:?}", f);
    s
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::VarRef(name) => f.write_str(&quote_ident(name)),
            Expr::Wildcard => f.write_str("*"),
            Expr::Call { name, args } => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", name, args.join(", "))
            }
            Expr::Binary { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op.as_str(), rhs),
            Expr::Paren(inner) => write!(f, "({})", inner),
            Expr::Integer(n) => write!(f, "{}", n),
            Expr::Number(n) => f.write_str(&format_float(*n)),
            Expr::String(s) => f.write_str(&quote_string(s)),
            Expr::Boolean(b) => write!(f, "{}", b),
            Expr::Duration(d) => f.write_str(&format_duration(*d)),
            Expr::Regex(r) => write!(f, "/{}/", r.replace('/', "\\/")),
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(db) = &self.database {
            write!(f, "{}.", quote_ident(db))?;
            if let Some(rp) = &self.retention_policy {
                f.write_str(&quote_ident(rp))?;
            }
            f.write_str(".")?;
        } else if let Some(rp) = &self.retention_policy {
            write!(f, "{}.", quote_ident(rp))?;
        }
        match &self.regex {
            Some(r) => write!(f, "/{}/", r.replace('/', "\\/")),
            None => f.write_str(&quote_ident(&self.name)),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Time { interval, offset: 0 } => write!(f, "time({})", format_duration(*interval)),
            Dimension::Time { interval, offset } if *offset < 0 => write!(
                f,
                "time({}, -{})",
                format_duration(*interval),
                format_duration(-offset)
            ),
            Dimension::Time { interval, offset } => write!(
                f,
                "time({}, {})",
                format_duration(*interval),
                format_duration(*offset)
            ),
            Dimension::Tag(t) => f.write_str(&quote_ident(t)),
            Dimension::Regex(r) => write!(f, "/{}/", r),
            Dimension::Wildcard => f.write_str("*"),
        }
    }
}

impl fmt::Display for Fill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fill::Default => Ok(()),
            Fill::Null => f.write_str("fill(null)"),
            Fill::None => f.write_str("fill(none)"),
            Fill::Previous => f.write_str("fill(previous)"),
            Fill::Linear => f.write_str("fill(linear)"),
            Fill::Value(v) => write!(f, "fill({})", v),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {}", quote_ident(alias))?;
        }
        Ok(())
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT {}", join(&self.fields))?;
        if let Some(into) = &self.into {
            write!(f, " INTO {}", into)?;
        }
        if !self.sources.is_empty() {
            write!(f, " FROM {}", join(&self.sources))?;
        }
        if let Some(cond) = &self.condition {
            write!(f, " WHERE {}", cond)?;
        }
        if !self.dimensions.is_empty() {
            write!(f, " GROUP BY {}", join(&self.dimensions))?;
        }
        if self.fill != Fill::Default {
            write!(f, " {}", self.fill)?;
        }
        if self.order_desc {
            f.write_str(" ORDER BY time DESC")?;
        }
        for (kw, v) in [
            ("LIMIT", self.limit),
            ("OFFSET", self.offset),
            ("SLIMIT", self.slimit),
            ("SOFFSET", self.soffset),
        ] {
            if let Some(v) = v {
                write!(f, " {} {}", kw, v)?;
            }
        }
        Ok(())
    }
}

fn on_clause(on: &Option<String>) -> String {
    on.as_ref()
        .map(|db| format!(" ON {}", quote_ident(db)))
        .unwrap_or_default()
}

fn from_clause(from: &Option<Measurement>) -> String {
    from.as_ref()
        .map(|m| format!(" FROM {}", m))
        .unwrap_or_default()
}

fn where_clause(cond: &Option<Expr>) -> String {
    cond.as_ref()
        .map(|c| format!(" WHERE {}", c))
        .unwrap_or_default()
}

fn privilege_str(p: Privilege) -> &'static str {
    match p {
        Privilege::Read => "READ",
        Privilege::Write => "WRITE",
        Privilege::All => "ALL",
    }
}

impl fmt::Display for RetentionPolicyDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RETENTION POLICY {} ON {}",
            quote_ident(&self.name),
            quote_ident(&self.database)
        )?;
        if let Some(d) = self.duration {
            if d == 0 {
                f.write_str(" DURATION INF")?;
            } else {
                write!(f, " DURATION {}", format_duration(d))?;
            }
        }
        if let Some(r) = self.replication {
            write!(f, " REPLICATION {}", r)?;
        }
        if let Some(sd) = self.shard_duration {
            write!(f, " SHARD DURATION {}", format_duration(sd))?;
        }
        if self.default {
            f.write_str(" DEFAULT")?;
        }
        Ok(())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(s) => write!(f, "{}", s),
            Statement::ShowDatabases => f.write_str("SHOW DATABASES"),
            Statement::ShowMeasurements { on, condition } => {
                write!(f, "SHOW MEASUREMENTS{}{}", on_clause(on), where_clause(condition))
            }
            Statement::ShowSeries { on, from, condition } => write!(
                f,
                "SHOW SERIES{}{}{}",
                on_clause(on),
                from_clause(from),
                where_clause(condition)
            ),
            Statement::ShowTagKeys { on, from } => {
                write!(f, "SHOW TAG KEYS{}{}", on_clause(on), from_clause(from))
            }
            Statement::ShowTagValues { on, from, keys, condition } => {
                write!(f, "SHOW TAG VALUES{}{}", on_clause(on), from_clause(from))?;
                if keys.len() == 1 {
                    write!(f, " WITH KEY = {}", quote_ident(&keys[0]))?;
                } else {
                    let keys: Vec<String> = keys.iter().map(|k| quote_ident(k)).collect();
                    write!(f, " WITH KEY IN ({})", keys.join(", "))?;
                }
                f.write_str(&where_clause(condition))
            }
            Statement::ShowFieldKeys { on, from } => {
                write!(f, "SHOW FIELD KEYS{}{}", on_clause(on), from_clause(from))
            }
            Statement::ShowRetentionPolicies { on } => {
                write!(f, "SHOW RETENTION POLICIES{}", on_clause(on))
            }
            Statement::ShowContinuousQueries => f.write_str("SHOW CONTINUOUS QUERIES"),
            Statement::ShowUsers => f.write_str("SHOW USERS"),
            Statement::ShowGrants { user } => write!(f, "SHOW GRANTS FOR {}", quote_ident(user)),
            Statement::Diagnostic(text) => f.write_str(text),
            Statement::CreateDatabase { name } => write!(f, "CREATE DATABASE {}", quote_ident(name)),
            Statement::DropDatabase { name } => write!(f, "DROP DATABASE {}", quote_ident(name)),
            Statement::CreateRetentionPolicy(rp) => write!(f, "CREATE {}", rp),
            Statement::AlterRetentionPolicy(rp) => write!(f, "ALTER {}", rp),
            Statement::DropRetentionPolicy { name, database } => write!(
                f,
                "DROP RETENTION POLICY {} ON {}",
                quote_ident(name),
                quote_ident(database)
            ),
            Statement::CreateContinuousQuery { name, database, resample, body } => {
                write!(
                    f,
                    "CREATE CONTINUOUS QUERY {} ON {}",
                    quote_ident(name),
                    quote_ident(database)
                )?;
                if let Some(r) = resample {
                    write!(f, " {}", r)?;
                }
                write!(f, " BEGIN {} END", body)
            }
            Statement::DropContinuousQuery { name, database } => write!(
                f,
                "DROP CONTINUOUS QUERY {} ON {}",
                quote_ident(name),
                quote_ident(database)
            ),
            Statement::DropSeries { from, condition } => {
                write!(f, "DROP SERIES{}{}", from_clause(from), where_clause(condition))
            }
            Statement::Delete { from, condition } => {
                write!(f, "DELETE{}{}", from_clause(from), where_clause(condition))
            }
            Statement::DropMeasurement { name } => {
                write!(f, "DROP MEASUREMENT {}", quote_ident(name))
            }
            Statement::CreateUser { name, password, admin } => {
                write!(
                    f,
                    "CREATE USER {} WITH PASSWORD {}",
                    quote_ident(name),
                    quote_string(password)
                )?;
                if *admin {
                    f.write_str(" WITH ALL PRIVILEGES")?;
                }
                Ok(())
            }
            Statement::DropUser { name } => write!(f, "DROP USER {}", quote_ident(name)),
            Statement::SetPassword { name, password } => write!(
                f,
                "SET PASSWORD FOR {} = {}",
                quote_ident(name),
                quote_string(password)
            ),
            Statement::Grant { privilege, on, user } => match on {
                Some(db) => write!(
                    f,
                    "GRANT {} ON {} TO {}",
                    privilege_str(*privilege),
                    quote_ident(db),
                    quote_ident(user)
                ),
                None => write!(f, "GRANT ALL PRIVILEGES TO {}", quote_ident(user)),
            },
            Statement::Revoke { privilege, on, user } => match on {
                Some(db) => write!(
                    f,
                    "REVOKE {} ON {} FROM {}",
                    privilege_str(*privilege),
                    quote_ident(db),
                    quote_ident(user)
                ),
                None => write!(f, "REVOKE ALL PRIVILEGES FROM {}", quote_ident(user)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("value"), "value");
        assert_eq!(quote_ident("my value"), "\"my value\"");
        assert_eq!(quote_ident("select"), "\"select\"");
        assert_eq!(quote_ident("1abc"), "\"1abc\"");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(86_400_000_000_000), "1d");
        assert_eq!(format_duration(90_000_000_000), "90s");
        assert_eq!(format_duration(1_500), "1500ns");
        assert_eq!(format_duration(0), "0s");
    }

    #[test]
    fn test_select_display() {
        let stmt = SelectStatement {
            fields: vec![
                Field::new(Expr::call("sum", vec![Expr::var("value")])),
                Field::aliased(Expr::call("count", vec![Expr::var("value")]), "n"),
            ],
            sources: vec![Measurement::named("treasures")],
            condition: Some(Expr::binary(
                BinaryOp::Eq,
                Expr::var("type"),
                Expr::String("gold".into()),
            )),
            dimensions: vec![Dimension::Time { interval: 86_400_000_000_000, offset: 0 }],
            fill: Fill::Null,
            limit: Some(10),
            ..Default::default()
        };
        assert_eq!(
            stmt.to_string(),
            "SELECT sum(value), count(value) AS n FROM treasures WHERE type = 'gold' \
             GROUP BY time(1d) fill(null) LIMIT 10"
        );
    }

    #[test]
    fn test_column_names() {
        let f = Field::new(Expr::binary(
            BinaryOp::Add,
            Expr::call("MEAN", vec![Expr::var("a")]),
            Expr::call("max", vec![Expr::var("b")]),
        ));
        assert_eq!(f.name(), "mean_max");
        assert_eq!(Field::new(Expr::var("v")).name(), "v");
    }
}
