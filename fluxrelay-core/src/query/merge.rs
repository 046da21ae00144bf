//! Merging partial SELECT results
//!
//! Each selected field becomes a tree of merge operators over base values
//! that every member can compute locally (`mean(x)` needs `sum(x)` and
//! `count(x)`). The SELECT sent to members asks for the base values under
//! deterministic aliases; the trees then combine the per-member columns
//! row by row.

use crate::influxql::{BinaryOp, Dimension, Expr, Field, Fill, SelectStatement};
use crate::tsdb::eval::arith;
use crate::tsdb::memory::unique_names;
use crate::tsdb::{apply_fill, format_time, parse_time, Series};
use crate::{FieldValue, RelayError, Result, Timestamp};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// How base values from several members combine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    Sum,
    Max,
    Min,
    /// Most frequent of the members' modes
    Mode,
}

/// Merge tree of one output field
#[derive(Debug, Clone, PartialEq)]
pub enum MergeNode {
    Base { column: String, combine: Combine },
    Mean { sum: String, count: String },
    Spread { max: String, min: String },
    Binary {
        op: BinaryOp,
        lhs: Box<MergeNode>,
        rhs: Box<MergeNode>,
    },
    Literal(FieldValue),
}

/// Functions answered with several rows per bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Top(usize),
    Bottom(usize),
    Distinct,
    CountDistinct,
}

#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Raw,
    Scalar(Vec<MergeNode>),
    Rows(Selector),
}

/// Alias under which a member returns `expr`
pub fn base_name(expr: &Expr) -> String {
    let sanitized: String = expr
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("__{}", sanitized.trim_matches('_'))
}

fn value_to_field(v: &Value) -> Option<FieldValue> {
    match v {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(FieldValue::Integer(i)),
            None => n.as_f64().map(FieldValue::Float),
        },
        Value::Bool(b) => Some(FieldValue::Boolean(*b)),
        Value::String(s) => Some(FieldValue::String(s.clone())),
        _ => None,
    }
}

fn to_json(v: Option<FieldValue>) -> Value {
    v.map(|v| v.to_json()).unwrap_or(Value::Null)
}

fn bucket_start(time: Timestamp, interval: i64, offset: i64) -> Timestamp {
    (time - offset).div_euclid(interval) * interval + offset
}

impl Combine {
    fn apply(self, values: Vec<FieldValue>) -> Option<FieldValue> {
        if values.is_empty() {
            return None;
        }
        match self {
            Combine::Sum => {
                if values.iter().all(|v| matches!(v, FieldValue::Integer(_))) {
                    let mut total: i64 = 0;
                    for v in &values {
                        if let FieldValue::Integer(i) = v {
                            total = total.saturating_add(*i);
                        }
                    }
                    Some(FieldValue::Integer(total))
                } else {
                    let total: f64 = values.iter().filter_map(FieldValue::as_f64).sum();
                    Some(FieldValue::Float(total))
                }
            }
            Combine::Max => values
                .into_iter()
                .filter(|v| v.as_f64().is_some())
                .max_by(|a, b| a.as_f64().unwrap_or(0.0).total_cmp(&b.as_f64().unwrap_or(0.0))),
            Combine::Min => values
                .into_iter()
                .filter(|v| v.as_f64().is_some())
                .min_by(|a, b| a.as_f64().unwrap_or(0.0).total_cmp(&b.as_f64().unwrap_or(0.0))),
            Combine::Mode => {
                let mut counts: BTreeMap<String, (usize, FieldValue)> = BTreeMap::new();
                for v in values {
                    counts.entry(v.to_json().to_string()).or_insert((0, v)).0 += 1;
                }
                let best = counts.values().map(|(n, _)| *n).max()?;
                counts.into_values().find(|(n, _)| *n == best).map(|(_, v)| v)
            }
        }
    }
}

type Part<'a> = HashMap<&'a str, &'a Value>;

impl MergeNode {
    fn column(parts: &[Part<'_>], column: &str) -> Vec<FieldValue> {
        parts
            .iter()
            .filter_map(|p| p.get(column))
            .filter_map(|v| value_to_field(v))
            .collect()
    }

    /// Combine the members' base values of one row
    fn eval(&self, parts: &[Part<'_>]) -> Option<FieldValue> {
        match self {
            MergeNode::Base { column, combine } => combine.apply(Self::column(parts, column)),
            MergeNode::Mean { sum, count } => {
                let sum = Combine::Sum.apply(Self::column(parts, sum))?.as_f64()?;
                let count = Combine::Sum.apply(Self::column(parts, count))?.as_f64()?;
                (count > 0.0).then(|| FieldValue::Float(sum / count))
            }
            MergeNode::Spread { max, min } => {
                let max = Combine::Max.apply(Self::column(parts, max))?;
                let min = Combine::Min.apply(Self::column(parts, min))?;
                arith(BinaryOp::Sub, max, min)
            }
            MergeNode::Binary { op, lhs, rhs } => arith(*op, lhs.eval(parts)?, rhs.eval(parts)?),
            MergeNode::Literal(v) => Some(v.clone()),
        }
    }
}

/// Time reported for a bucket collapsed across members
///
/// A lone `max()` or `min()` keeps the time of the winning point; anything
/// else reports the earliest member time.
fn collapsed_time(nodes: &[MergeNode], times: &[Timestamp], parts: &[Part<'_>]) -> Timestamp {
    let earliest = times.iter().copied().min().unwrap_or(0);
    let [node @ MergeNode::Base {
        column,
        combine: Combine::Max | Combine::Min,
    }] = nodes
    else {
        return earliest;
    };
    let Some(best) = node.eval(parts) else {
        return earliest;
    };
    parts
        .iter()
        .zip(times)
        .filter(|(p, _)| p.get(column.as_str()).and_then(|v| value_to_field(v)).as_ref() == Some(&best))
        .map(|(_, t)| *t)
        .min()
        .unwrap_or(earliest)
}

#[derive(Default)]
struct BaseFields {
    fields: Vec<Field>,
    names: HashSet<String>,
}

impl BaseFields {
    fn add(&mut self, expr: Expr) -> String {
        let name = base_name(&expr);
        if self.names.insert(name.clone()) {
            self.fields.push(Field::aliased(expr, name.clone()));
        }
        name
    }

    fn call(&mut self, func: &str, args: &[Expr]) -> String {
        self.add(Expr::call(func, args.to_vec()))
    }

    fn node(&mut self, expr: &Expr) -> Result<MergeNode> {
        match expr.unparen() {
            Expr::Call { name, args } => {
                let lname = name.to_ascii_lowercase();
                match lname.as_str() {
                    "sum" | "count" => {
                        if let Some(Expr::Call { .. }) = args.first().map(|a| a.unparen()) {
                            return Err(RelayError::BadRequest(format!(
                                "{}() over a nested call must be the only field when merging",
                                lname
                            )));
                        }
                        Ok(MergeNode::Base {
                            column: self.call(&lname, args),
                            combine: Combine::Sum,
                        })
                    }
                    "max" => Ok(MergeNode::Base {
                        column: self.call("max", args),
                        combine: Combine::Max,
                    }),
                    "min" => Ok(MergeNode::Base {
                        column: self.call("min", args),
                        combine: Combine::Min,
                    }),
                    "mode" => Ok(MergeNode::Base {
                        column: self.call("mode", args),
                        combine: Combine::Mode,
                    }),
                    "mean" => Ok(MergeNode::Mean {
                        sum: self.call("sum", args),
                        count: self.call("count", args),
                    }),
                    "spread" => Ok(MergeNode::Spread {
                        max: self.call("max", args),
                        min: self.call("min", args),
                    }),
                    "top" | "bottom" | "distinct" => Err(RelayError::BadRequest(format!(
                        "{}() must be the only field when merging",
                        lname
                    ))),
                    other => Err(RelayError::Unsupported(format!(
                        "{}() is not yet supported when merging",
                        other
                    ))),
                }
            }
            Expr::Binary { op, lhs, rhs } if op.is_arithmetic() => Ok(MergeNode::Binary {
                op: *op,
                lhs: Box::new(self.node(lhs)?),
                rhs: Box::new(self.node(rhs)?),
            }),
            Expr::Integer(n) => Ok(MergeNode::Literal(FieldValue::Integer(*n))),
            Expr::Number(n) => Ok(MergeNode::Literal(FieldValue::Float(*n))),
            Expr::VarRef(_) | Expr::Wildcard => Err(RelayError::BadRequest(
                "mixing aggregate and non-aggregate queries is not supported".into(),
            )),
            other => Err(RelayError::BadRequest(format!(
                "cannot merge expression {}",
                other
            ))),
        }
    }
}

fn selector(field: &Field) -> Result<Option<(Selector, Expr)>> {
    let Expr::Call { name, args } = field.expr.unparen() else {
        return Ok(None);
    };
    let lname = name.to_ascii_lowercase();
    let limit = || match args.get(1).map(|a| a.unparen()) {
        Some(Expr::Integer(k)) if *k > 0 && args.len() == 2 => Ok(*k as usize),
        _ => Err(RelayError::BadRequest(format!(
            "{}() requires a field and a positive integer limit when merging",
            lname
        ))),
    };
    Ok(match lname.as_str() {
        "top" => Some((Selector::Top(limit()?), field.expr.clone())),
        "bottom" => Some((Selector::Bottom(limit()?), field.expr.clone())),
        "distinct" => Some((Selector::Distinct, field.expr.clone())),
        "count" => match args.first().map(|a| a.unparen()) {
            Some(Expr::Call { name: inner, .. }) if inner.eq_ignore_ascii_case("distinct") => {
                Some((Selector::CountDistinct, args[0].unparen().clone()))
            }
            _ => None,
        },
        _ => None,
    })
}

/// Plan for running one SELECT on several members and merging the results
#[derive(Debug, Clone)]
pub struct MergePlan {
    original: SelectStatement,
    rewritten: SelectStatement,
    shape: Shape,
    columns: Vec<String>,
}

impl MergePlan {
    pub fn new(select: &SelectStatement) -> Result<Self> {
        if select
            .dimensions
            .iter()
            .any(|d| matches!(d, Dimension::Time { interval, .. } if *interval <= 0))
        {
            return Err(RelayError::BadRequest("GROUP BY time interval must be positive".into()));
        }
        let mut rewritten = select.clone();
        rewritten.offset = None;
        rewritten.limit = None;
        rewritten.soffset = None;
        rewritten.slimit = None;

        if !select.has_calls() {
            // members return their first limit+offset rows in the requested order
            rewritten.limit = select.limit.map(|l| l + select.offset.unwrap_or(0));
            return Ok(Self {
                original: select.clone(),
                rewritten,
                shape: Shape::Raw,
                columns: Vec::new(),
            });
        }

        rewritten.order_desc = false;
        let columns = unique_names(select.fields.iter().map(|f| f.name()).collect());

        if select.fields.len() == 1 {
            if let Some((kind, base)) = selector(&select.fields[0])? {
                rewritten.fields = vec![Field::new(base)];
                return Ok(Self {
                    original: select.clone(),
                    rewritten,
                    shape: Shape::Rows(kind),
                    columns,
                });
            }
        }

        let mut bases = BaseFields::default();
        let nodes = select
            .fields
            .iter()
            .map(|f| bases.node(&f.expr))
            .collect::<Result<Vec<_>>>()?;
        rewritten.fields = bases.fields;
        if select.group_by_time().is_some() {
            rewritten.fill = Fill::Null;
        }
        Ok(Self {
            original: select.clone(),
            rewritten,
            shape: Shape::Scalar(nodes),
            columns,
        })
    }

    /// SELECT to send to every member
    pub fn rewritten(&self) -> &SelectStatement {
        &self.rewritten
    }

    /// Merge per-member results, each queried with nanosecond epochs
    pub fn merge(&self, responses: Vec<Vec<Series>>, epoch: Option<&str>) -> Result<Vec<Series>> {
        let mut groups: BTreeMap<(String, BTreeMap<String, String>), Vec<Series>> = BTreeMap::new();
        for series in responses.into_iter().flatten() {
            groups
                .entry((series.name.clone(), series.tags.clone()))
                .or_default()
                .push(series);
        }

        let mut out = Vec::new();
        for ((name, tags), parts) in groups {
            let (columns, mut rows) = match &self.shape {
                Shape::Raw => self.merge_raw(&parts),
                Shape::Scalar(nodes) => (self.columns.clone(), self.merge_scalar(nodes, &parts)),
                Shape::Rows(kind) => (self.columns.clone(), self.merge_rows(*kind, &parts)),
            };
            self.finish(&mut rows);
            if rows.is_empty() {
                continue;
            }
            let values = rows
                .into_iter()
                .map(|(time, mut row)| {
                    row.insert(0, format_time(time, epoch));
                    row
                })
                .collect();
            let mut all_columns = vec!["time".to_string()];
            all_columns.extend(columns);
            out.push(Series {
                name,
                tags,
                columns: all_columns,
                values,
            });
        }
        let skip = self.original.soffset.unwrap_or(0) as usize;
        let take = self.original.slimit.map(|n| n as usize).unwrap_or(usize::MAX);
        Ok(out.into_iter().skip(skip).take(take).collect())
    }

    fn finish(&self, rows: &mut Vec<(Timestamp, Vec<Value>)>) {
        if self.original.order_desc {
            rows.reverse();
        }
        let offset = self.original.offset.unwrap_or(0) as usize;
        rows.drain(..offset.min(rows.len()));
        if let Some(limit) = self.original.limit {
            rows.truncate(limit as usize);
        }
    }

    fn merge_raw(&self, parts: &[Series]) -> (Vec<String>, Vec<(Timestamp, Vec<Value>)>) {
        let mut columns: Vec<String> = Vec::new();
        for series in parts {
            for c in series.columns.iter().skip(1) {
                if !columns.contains(c) {
                    columns.push(c.clone());
                }
            }
        }
        let mut rows = Vec::new();
        for series in parts {
            let index: Vec<Option<usize>> = columns.iter().map(|c| series.column(c)).collect();
            for row in &series.values {
                let Some(time) = row.first().and_then(parse_time) else {
                    continue;
                };
                let values = index
                    .iter()
                    .map(|i| i.and_then(|i| row.get(i)).cloned().unwrap_or(Value::Null))
                    .collect();
                rows.push((time, values));
            }
        }
        rows.sort_by_key(|(t, _)| *t);
        // replicas return identical rows
        rows.dedup();
        (columns, rows)
    }

    fn merge_scalar(&self, nodes: &[MergeNode], parts: &[Series]) -> Vec<(Timestamp, Vec<Value>)> {
        // without GROUP BY time every member row belongs to the single bucket
        let grouped = self.original.group_by_time().is_some();
        let mut buckets: BTreeMap<Timestamp, (Vec<Timestamp>, Vec<Part<'_>>)> = BTreeMap::new();
        for series in parts {
            for row in &series.values {
                let Some(time) = row.first().and_then(parse_time) else {
                    continue;
                };
                let part: Part<'_> = series
                    .columns
                    .iter()
                    .zip(row.iter())
                    .skip(1)
                    .map(|(c, v)| (c.as_str(), v))
                    .collect();
                let (times, bucket) = buckets.entry(if grouped { time } else { 0 }).or_default();
                times.push(time);
                bucket.push(part);
            }
        }

        let mut rows: Vec<Vec<Value>> = buckets
            .iter()
            .map(|(bucket, (times, parts))| {
                let time = if grouped { *bucket } else { collapsed_time(nodes, times, parts) };
                let mut row = vec![Value::from(time)];
                row.extend(nodes.iter().map(|n| to_json(n.eval(parts))));
                row
            })
            .collect();
        if grouped {
            let fill = match &self.original.fill {
                Fill::Default => Fill::Null,
                other => other.clone(),
            };
            apply_fill(&mut rows, &fill);
        }
        rows.into_iter()
            .filter_map(|mut row| {
                let time = parse_time(&row[0])?;
                row.remove(0);
                Some((time, row))
            })
            .collect()
    }

    fn merge_rows(&self, kind: Selector, parts: &[Series]) -> Vec<(Timestamp, Vec<Value>)> {
        let gbt = self.original.group_by_time();
        let mut buckets: BTreeMap<Timestamp, Vec<(Timestamp, FieldValue)>> = BTreeMap::new();
        for series in parts {
            for row in &series.values {
                let (Some(time), Some(value)) = (
                    row.first().and_then(parse_time),
                    row.get(1).and_then(value_to_field),
                ) else {
                    continue;
                };
                let bucket = gbt.map(|(i, o)| bucket_start(time, i, o)).unwrap_or(0);
                buckets.entry(bucket).or_default().push((time, value));
            }
        }

        let mut rows = Vec::new();
        for (_, mut items) in buckets {
            items.sort_by_key(|(t, _)| *t);
            match kind {
                Selector::Top(k) | Selector::Bottom(k) => {
                    let top = matches!(kind, Selector::Top(_));
                    let mut numeric: Vec<(Timestamp, FieldValue, f64)> = items
                        .into_iter()
                        .filter_map(|(t, v)| v.as_f64().map(|f| (t, v, f)))
                        .collect();
                    numeric.sort_by(|a, b| {
                        let by_value = if top { b.2.total_cmp(&a.2) } else { a.2.total_cmp(&b.2) };
                        by_value.then(a.0.cmp(&b.0))
                    });
                    numeric.truncate(k);
                    numeric.sort_by_key(|(t, _, _)| *t);
                    rows.extend(numeric.into_iter().map(|(t, v, _)| (t, vec![v.to_json()])));
                }
                Selector::Distinct | Selector::CountDistinct => {
                    let Some(first) = items.first().map(|(t, _)| *t) else {
                        continue;
                    };
                    let mut seen = HashSet::new();
                    let distinct: Vec<FieldValue> = items
                        .into_iter()
                        .map(|(_, v)| v)
                        .filter(|v| seen.insert(v.to_json().to_string()))
                        .collect();
                    if kind == Selector::CountDistinct {
                        rows.push((first, vec![Value::from(distinct.len() as i64)]));
                    } else {
                        rows.extend(distinct.into_iter().map(|v| (first, vec![v.to_json()])));
                    }
                }
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influxql::{parse_statement, Statement};
    use serde_json::json;

    fn select(q: &str) -> SelectStatement {
        match parse_statement(q).unwrap() {
            Statement::Select(s) => s,
            other => panic!("not a select: {:?}", other),
        }
    }

    fn series(columns: &[&str], values: Vec<Vec<Value>>) -> Series {
        Series {
            name: "treasures".into(),
            tags: BTreeMap::new(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            values,
        }
    }

    #[test]
    fn test_rewrite_mean_to_base_fields() {
        let plan = MergePlan::new(&select(
            "SELECT mean(value), sum(value) FROM treasures GROUP BY time(1d) LIMIT 5",
        ))
        .unwrap();
        assert_eq!(
            plan.rewritten().to_string(),
            "SELECT sum(value) AS __sum_value, count(value) AS __count_value FROM treasures \
             GROUP BY time(1d) fill(null)"
        );
    }

    #[test]
    fn test_merged_mean_is_global_mean() {
        let plan = MergePlan::new(&select("SELECT mean(value) FROM treasures GROUP BY time(1d)")).unwrap();
        let cols = ["time", "__sum_value", "__count_value"];
        let a = series(&cols, vec![vec![json!(0), json!(150.0), json!(2)]]);
        let b = series(&cols, vec![vec![json!(0), json!(0.0), json!(1)]]);
        let merged = plan.merge(vec![vec![a], vec![b]], Some("ns")).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].columns, vec!["time", "mean"]);
        assert_eq!(merged[0].values, vec![vec![json!(0), json!(50.0)]]);
    }

    #[test]
    fn test_spread_and_arithmetic() {
        let plan = MergePlan::new(&select("SELECT spread(v), max(v) * 2, count(v) FROM m")).unwrap();
        let cols = ["time", "__max_v", "__min_v", "__count_v"];
        let a = series(&cols, vec![vec![json!(0), json!(10), json!(4), json!(3)]]);
        let b = series(&cols, vec![vec![json!(0), json!(7), json!(1), json!(2)]]);
        let merged = plan.merge(vec![vec![a], vec![b]], Some("ns")).unwrap();
        assert_eq!(merged[0].columns, vec!["time", "spread", "max", "count"]);
        assert_eq!(merged[0].values[0], vec![json!(0), json!(9), json!(20), json!(5)]);
    }

    #[test]
    fn test_selector_without_group_by_collapses_members() {
        let plan = MergePlan::new(&select("SELECT max(value) FROM cpu")).unwrap();
        let cols = ["time", "__max_value"];
        let a = series(&cols, vec![vec![json!(5), json!(10.0)]]);
        let b = series(&cols, vec![vec![json!(9), json!(20.0)]]);
        let merged = plan.merge(vec![vec![a], vec![b]], Some("ns")).unwrap();
        assert_eq!(merged[0].columns, vec!["time", "max"]);
        assert_eq!(merged[0].values, vec![vec![json!(9), json!(20.0)]]);

        let plan = MergePlan::new(&select("SELECT min(value), count(value) FROM cpu")).unwrap();
        let cols = ["time", "__min_value", "__count_value"];
        let a = series(&cols, vec![vec![json!(5), json!(10.0), json!(2)]]);
        let b = series(&cols, vec![vec![json!(9), json!(20.0), json!(3)]]);
        let merged = plan.merge(vec![vec![a], vec![b]], Some("ns")).unwrap();
        assert_eq!(merged[0].values, vec![vec![json!(5), json!(10.0), json!(5)]]);
    }

    #[test]
    fn test_unsupported_function() {
        let err = MergePlan::new(&select("SELECT median(value) FROM m")).unwrap_err();
        assert!(matches!(err, RelayError::Unsupported(_)));
        for q in ["SELECT first(value) FROM m", "SELECT last(value) FROM m"] {
            assert!(matches!(MergePlan::new(&select(q)), Err(RelayError::Unsupported(_))));
        }
        assert!(MergePlan::new(&select("SELECT top(value, 2), sum(value) FROM m")).is_err());
    }

    #[test]
    fn test_top_across_members() {
        let plan = MergePlan::new(&select("SELECT top(value, 2) FROM m")).unwrap();
        let a = series(&["time", "top"], vec![vec![json!(1), json!(5)], vec![json!(4), json!(9)]]);
        let b = series(&["time", "top"], vec![vec![json!(2), json!(7)], vec![json!(3), json!(1)]]);
        let merged = plan.merge(vec![vec![a], vec![b]], Some("ns")).unwrap();
        assert_eq!(
            merged[0].values,
            vec![vec![json!(2), json!(7)], vec![json!(4), json!(9)]]
        );
    }

    #[test]
    fn test_count_distinct_is_union() {
        let plan = MergePlan::new(&select("SELECT count(distinct(kind)) FROM m")).unwrap();
        assert_eq!(plan.rewritten().to_string(), "SELECT distinct(kind) FROM m");
        let a = series(&["time", "distinct"], vec![vec![json!(0), json!("x")], vec![json!(0), json!("y")]]);
        let b = series(&["time", "distinct"], vec![vec![json!(0), json!("y")], vec![json!(0), json!("z")]]);
        let merged = plan.merge(vec![vec![a], vec![b]], Some("ns")).unwrap();
        assert_eq!(merged[0].columns, vec!["time", "count"]);
        assert_eq!(merged[0].values, vec![vec![json!(0), json!(3)]]);
    }

    #[test]
    fn test_raw_rows_interleave_and_limit() {
        let plan = MergePlan::new(&select("SELECT * FROM m ORDER BY time DESC LIMIT 2")).unwrap();
        assert_eq!(plan.rewritten().limit, Some(2));
        let a = series(&["time", "v"], vec![vec![json!(1), json!(1)], vec![json!(3), json!(3)]]);
        let b = series(&["time", "w"], vec![vec![json!(2), json!("b")]]);
        let merged = plan.merge(vec![vec![a], vec![b]], Some("ns")).unwrap();
        assert_eq!(merged[0].columns, vec!["time", "v", "w"]);
        assert_eq!(
            merged[0].values,
            vec![
                vec![json!(3), json!(3), Value::Null],
                vec![json!(2), Value::Null, json!("b")]
            ]
        );
    }

    #[test]
    fn test_fill_applies_after_merge() {
        let plan = MergePlan::new(&select("SELECT sum(v) FROM m GROUP BY time(10ns) fill(0)")).unwrap();
        let a = series(&["time", "__sum_v"], vec![vec![json!(0), json!(1)], vec![json!(10), Value::Null]]);
        let b = series(&["time", "__sum_v"], vec![vec![json!(20), json!(2)]]);
        let merged = plan.merge(vec![vec![a], vec![b]], Some("ns")).unwrap();
        assert_eq!(
            merged[0].values,
            vec![
                vec![json!(0), json!(1)],
                vec![json!(10), json!(0)],
                vec![json!(20), json!(2)]
            ]
        );
    }
}
