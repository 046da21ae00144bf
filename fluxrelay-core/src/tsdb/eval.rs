//! Row-level expression evaluation for the in-memory engine

use crate::influxql::{BinaryOp, Expr};
use crate::{FieldValue, Fields, SeriesKey, Timestamp};
use chrono::DateTime;
use std::cmp::Ordering;

/// One stored point as seen by an expression
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    pub key: &'a SeriesKey,
    pub time: Timestamp,
    pub fields: &'a Fields,
}

/// Evaluate `expr` against a row; `None` is SQL NULL
pub fn eval(expr: &Expr, row: &RowRef<'_>, now: Timestamp) -> Option<FieldValue> {
    match expr {
        Expr::VarRef(name) if name == "time" => Some(FieldValue::Integer(row.time)),
        Expr::VarRef(name) => row
            .fields
            .get(name)
            .cloned()
            .or_else(|| row.key.tags.get(name).map(|v| FieldValue::String(v.clone()))),
        Expr::Integer(n) | Expr::Duration(n) => Some(FieldValue::Integer(*n)),
        Expr::Number(n) => Some(FieldValue::Float(*n)),
        Expr::String(s) => Some(FieldValue::String(s.clone())),
        Expr::Boolean(b) => Some(FieldValue::Boolean(*b)),
        Expr::Paren(inner) => eval(inner, row, now),
        Expr::Call { name, args } if args.is_empty() && name.eq_ignore_ascii_case("now") => {
            Some(FieldValue::Integer(now))
        }
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::And => Some(FieldValue::Boolean(
                truthy(lhs, row, now) && truthy(rhs, row, now),
            )),
            BinaryOp::Or => Some(FieldValue::Boolean(
                truthy(lhs, row, now) || truthy(rhs, row, now),
            )),
            BinaryOp::EqRegex | BinaryOp::NeqRegex => {
                let Expr::Regex(pattern) = rhs.unparen() else {
                    return None;
                };
                let value = match eval(lhs, row, now) {
                    Some(FieldValue::String(s)) => s,
                    None => String::new(),
                    Some(_) => return Some(FieldValue::Boolean(false)),
                };
                let re = regex::Regex::new(pattern).ok()?;
                Some(FieldValue::Boolean(re.is_match(&value) == (*op == BinaryOp::EqRegex)))
            }
            op if op.is_arithmetic() => arith(*op, eval(lhs, row, now)?, eval(rhs, row, now)?),
            op => Some(FieldValue::Boolean(compare(
                *op,
                eval(lhs, row, now),
                eval(rhs, row, now),
            ))),
        },
        _ => None,
    }
}

/// Whether a condition holds for a row
pub fn truthy(expr: &Expr, row: &RowRef<'_>, now: Timestamp) -> bool {
    matches!(eval(expr, row, now), Some(FieldValue::Boolean(true)))
}

/// Evaluate an expression that does not depend on a row
pub fn eval_const(expr: &Expr, now: Timestamp) -> Option<FieldValue> {
    let key = SeriesKey::new("");
    let fields = Fields::new();
    let row = RowRef { key: &key, time: 0, fields: &fields };
    eval(expr, &row, now)
}

fn rfc3339(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s).ok()?.timestamp_nanos_opt()
}

fn ordering(l: &FieldValue, r: &FieldValue) -> Option<Ordering> {
    use FieldValue::*;
    match (l, r) {
        (Integer(a), Integer(b)) => Some(a.cmp(b)),
        (String(a), String(b)) => Some(a.cmp(b)),
        (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
        (Integer(a), String(b)) => rfc3339(b).map(|b| a.cmp(&b)),
        (String(a), Integer(b)) => rfc3339(a).map(|a| a.cmp(b)),
        _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
    }
}

/// Comparison with InfluxQL semantics: a missing tag equals ''
fn compare(op: BinaryOp, l: Option<FieldValue>, r: Option<FieldValue>) -> bool {
    let empty = || FieldValue::String(String::new());
    let (l, r) = match (l, r) {
        (None, None) => return false,
        (None, Some(r @ FieldValue::String(_))) => (empty(), r),
        (Some(l @ FieldValue::String(_)), None) => (l, empty()),
        (Some(l), Some(r)) => (l, r),
        _ => return false,
    };
    let Some(ord) = ordering(&l, &r) else {
        return false;
    };
    match op {
        BinaryOp::Eq => ord == Ordering::Equal,
        BinaryOp::Neq => ord != Ordering::Equal,
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::Lte => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        BinaryOp::Gte => ord != Ordering::Less,
        _ => false,
    }
}

/// Arithmetic on two values; integers stay integers except for division
pub fn arith(op: BinaryOp, l: FieldValue, r: FieldValue) -> Option<FieldValue> {
    if let (FieldValue::Integer(a), FieldValue::Integer(b)) = (&l, &r) {
        let (a, b) = (*a, *b);
        return match op {
            BinaryOp::Add => a.checked_add(b).map(FieldValue::Integer),
            BinaryOp::Sub => a.checked_sub(b).map(FieldValue::Integer),
            BinaryOp::Mul => a.checked_mul(b).map(FieldValue::Integer),
            BinaryOp::Mod => (b != 0).then(|| FieldValue::Integer(a % b)),
            BinaryOp::Div => (b != 0).then(|| FieldValue::Float(a as f64 / b as f64)),
            _ => None,
        };
    }
    let (a, b) = (l.as_f64()?, r.as_f64()?);
    Some(FieldValue::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div if b != 0.0 => a / b,
        BinaryOp::Mod if b != 0.0 => a % b,
        _ => return None,
    }))
}

/// Inclusive time bounds implied by top-level `AND`ed time comparisons
pub fn time_bounds(cond: &Expr, now: Timestamp) -> (Option<i64>, Option<i64>) {
    let mut lower: Option<i64> = None;
    let mut upper: Option<i64> = None;
    collect_bounds(cond, now, &mut lower, &mut upper);
    (lower, upper)
}

fn collect_bounds(expr: &Expr, now: Timestamp, lower: &mut Option<i64>, upper: &mut Option<i64>) {
    let Expr::Binary { op, lhs, rhs } = expr.unparen() else {
        return;
    };
    if *op == BinaryOp::And {
        collect_bounds(lhs, now, lower, upper);
        collect_bounds(rhs, now, lower, upper);
        return;
    }
    let is_time = |e: &Expr| matches!(e.unparen(), Expr::VarRef(n) if n == "time");
    let (op, other) = if is_time(lhs) {
        (*op, rhs.as_ref())
    } else if is_time(rhs) {
        let flipped = match op {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::Lte => BinaryOp::Gte,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::Gte => BinaryOp::Lte,
            other => *other,
        };
        (flipped, lhs.as_ref())
    } else {
        return;
    };
    let value = match eval_const(other, now) {
        Some(FieldValue::Integer(n)) => n,
        Some(FieldValue::Float(f)) => f as i64,
        Some(FieldValue::String(s)) => match rfc3339(&s) {
            Some(n) => n,
            None => return,
        },
        _ => return,
    };
    let raise = |b: &mut Option<i64>, v: i64| *b = Some(b.map_or(v, |c| c.max(v)));
    let cut = |b: &mut Option<i64>, v: i64| *b = Some(b.map_or(v, |c| c.min(v)));
    match op {
        BinaryOp::Gt => raise(lower, value.saturating_add(1)),
        BinaryOp::Gte => raise(lower, value),
        BinaryOp::Lt => cut(upper, value.saturating_sub(1)),
        BinaryOp::Lte => cut(upper, value),
        BinaryOp::Eq => {
            raise(lower, value);
            cut(upper, value);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influxql::parse_expr;

    fn row_eval(cond: &str, key: &SeriesKey, fields: &Fields, time: Timestamp) -> bool {
        let expr = parse_expr(cond).unwrap();
        truthy(&expr, &RowRef { key, time, fields }, 1_000)
    }

    #[test]
    fn test_tag_and_field_conditions() {
        let key = SeriesKey::new("treasures").with_tag("type", "gold");
        let mut fields = Fields::new();
        fields.insert("value", FieldValue::Float(100.0));

        assert!(row_eval("type = 'gold' AND value > 50", &key, &fields, 0));
        assert!(row_eval("type = 'trash' OR type = 'gold'", &key, &fields, 0));
        assert!(!row_eval("type != 'gold'", &key, &fields, 0));
        assert!(row_eval("type =~ /^go/", &key, &fields, 0));
        assert!(row_eval("region = ''", &key, &fields, 0));
        assert!(row_eval("time < now() AND time >= '1970-01-01T00:00:00Z'", &key, &fields, 10));
    }

    #[test]
    fn test_arith() {
        assert_eq!(
            arith(BinaryOp::Add, FieldValue::Integer(2), FieldValue::Integer(3)),
            Some(FieldValue::Integer(5))
        );
        assert_eq!(
            arith(BinaryOp::Div, FieldValue::Integer(3), FieldValue::Integer(2)),
            Some(FieldValue::Float(1.5))
        );
        assert_eq!(arith(BinaryOp::Div, FieldValue::Float(1.0), FieldValue::Float(0.0)), None);
    }

    #[test]
    fn test_time_bounds() {
        let cond = parse_expr("time >= 100 AND time < 200 AND host = 'a'").unwrap();
        assert_eq!(time_bounds(&cond, 0), (Some(100), Some(199)));

        let cond = parse_expr("now() - 1h > time").unwrap();
        let now = 7_200_000_000_000;
        assert_eq!(time_bounds(&cond, now), (None, Some(3_600_000_000_000 - 1)));
    }
}
