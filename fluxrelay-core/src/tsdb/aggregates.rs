//! Aggregate function implementations for the in-memory engine

use crate::{FieldValue, RelayError, Result, Timestamp};
use std::collections::HashMap;

/// Accumulator for computing an aggregate incrementally
pub trait Accumulator: Send {
    /// Add a value observed at `time`
    fn add(&mut self, time: Timestamp, value: &FieldValue);

    /// Get the current result, `None` when nothing applicable was added
    fn result(&self) -> Option<FieldValue>;
}

/// Build the accumulator for an aggregate function name
///
/// `param` carries the numeric second argument (`percentile(x, 90)`).
pub fn new_accumulator(name: &str, param: Option<f64>) -> Result<Box<dyn Accumulator>> {
    Ok(match name {
        "count" => Box::<CountAccumulator>::default(),
        "sum" => Box::<SumAccumulator>::default(),
        "mean" => Box::<MeanAccumulator>::default(),
        "min" => Box::new(ExtremeAccumulator::min()),
        "max" => Box::new(ExtremeAccumulator::max()),
        "spread" => Box::<SpreadAccumulator>::default(),
        "first" => Box::new(EdgeAccumulator::first()),
        "last" => Box::new(EdgeAccumulator::last()),
        "stddev" => Box::<StddevAccumulator>::default(),
        "median" => Box::new(PercentileAccumulator::median()),
        "mode" => Box::<ModeAccumulator>::default(),
        "percentile" => {
            let p = param.ok_or_else(|| {
                RelayError::BadRequest("percentile() requires a percentile argument".into())
            })?;
            Box::new(PercentileAccumulator::nearest_rank(p))
        }
        other => return Err(RelayError::Unsupported(format!("unsupported function: {}()", other))),
    })
}

/// Count accumulator
#[derive(Debug, Default)]
pub struct CountAccumulator {
    count: i64,
}

impl Accumulator for CountAccumulator {
    fn add(&mut self, _time: Timestamp, _value: &FieldValue) {
        self.count += 1;
    }

    fn result(&self) -> Option<FieldValue> {
        (self.count > 0).then_some(FieldValue::Integer(self.count))
    }
}

/// Sum accumulator, integer while every input is an integer
#[derive(Debug)]
pub struct SumAccumulator {
    float: f64,
    int: Option<i64>,
    count: u64,
}

impl Default for SumAccumulator {
    fn default() -> Self {
        Self {
            float: 0.0,
            int: Some(0),
            count: 0,
        }
    }
}

impl Accumulator for SumAccumulator {
    fn add(&mut self, _time: Timestamp, value: &FieldValue) {
        let Some(v) = value.as_f64() else { return };
        self.float += v;
        self.int = match (self.int, value) {
            (Some(sum), FieldValue::Integer(n)) => sum.checked_add(*n),
            _ => None,
        };
        self.count += 1;
    }

    fn result(&self) -> Option<FieldValue> {
        if self.count == 0 {
            return None;
        }
        Some(match self.int {
            Some(n) => FieldValue::Integer(n),
            None => FieldValue::Float(self.float),
        })
    }
}

/// Mean accumulator
#[derive(Debug, Default)]
pub struct MeanAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for MeanAccumulator {
    fn add(&mut self, _time: Timestamp, value: &FieldValue) {
        if let Some(v) = value.as_f64() {
            self.sum += v;
            self.count += 1;
        }
    }

    fn result(&self) -> Option<FieldValue> {
        (self.count > 0).then(|| FieldValue::Float(self.sum / self.count as f64))
    }
}

/// Min or max, keeping the input type
#[derive(Debug)]
pub struct ExtremeAccumulator {
    best: Option<FieldValue>,
    want_max: bool,
}

impl ExtremeAccumulator {
    pub fn min() -> Self {
        Self { best: None, want_max: false }
    }

    pub fn max() -> Self {
        Self { best: None, want_max: true }
    }
}

impl Accumulator for ExtremeAccumulator {
    fn add(&mut self, _time: Timestamp, value: &FieldValue) {
        let Some(v) = value.as_f64() else { return };
        let replace = match self.best.as_ref().and_then(|b| b.as_f64()) {
            None => true,
            Some(current) if self.want_max => v > current,
            Some(current) => v < current,
        };
        if replace {
            self.best = Some(value.clone());
        }
    }

    fn result(&self) -> Option<FieldValue> {
        self.best.clone()
    }
}

/// Difference between max and min
#[derive(Debug, Default)]
pub struct SpreadAccumulator {
    min: Option<f64>,
    max: Option<f64>,
    all_int: bool,
}

impl Accumulator for SpreadAccumulator {
    fn add(&mut self, _time: Timestamp, value: &FieldValue) {
        let Some(v) = value.as_f64() else { return };
        let is_int = matches!(value, FieldValue::Integer(_));
        self.all_int = if self.min.is_none() { is_int } else { self.all_int && is_int };
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
    }

    fn result(&self) -> Option<FieldValue> {
        let spread = self.max? - self.min?;
        Some(if self.all_int {
            FieldValue::Integer(spread as i64)
        } else {
            FieldValue::Float(spread)
        })
    }
}

/// Earliest or latest value by time
#[derive(Debug)]
pub struct EdgeAccumulator {
    value: Option<(Timestamp, FieldValue)>,
    latest: bool,
}

impl EdgeAccumulator {
    pub fn first() -> Self {
        Self { value: None, latest: false }
    }

    pub fn last() -> Self {
        Self { value: None, latest: true }
    }
}

impl Accumulator for EdgeAccumulator {
    fn add(&mut self, time: Timestamp, value: &FieldValue) {
        let replace = match &self.value {
            None => true,
            Some((ts, _)) if self.latest => time > *ts,
            Some((ts, _)) => time < *ts,
        };
        if replace {
            self.value = Some((time, value.clone()));
        }
    }

    fn result(&self) -> Option<FieldValue> {
        self.value.as_ref().map(|(_, v)| v.clone())
    }
}

/// Sample standard deviation (Welford's algorithm)
#[derive(Debug, Default)]
pub struct StddevAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Accumulator for StddevAccumulator {
    fn add(&mut self, _time: Timestamp, value: &FieldValue) {
        let Some(v) = value.as_f64() else { return };
        self.count += 1;
        let delta = v - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = v - self.mean;
        self.m2 += delta * delta2;
    }

    fn result(&self) -> Option<FieldValue> {
        (self.count > 1).then(|| FieldValue::Float((self.m2 / (self.count - 1) as f64).sqrt()))
    }
}

/// Median or nearest-rank percentile
#[derive(Debug)]
pub struct PercentileAccumulator {
    values: Vec<FieldValue>,
    /// None selects the median
    percentile: Option<f64>,
}

impl PercentileAccumulator {
    pub fn median() -> Self {
        Self { values: Vec::new(), percentile: None }
    }

    pub fn nearest_rank(percentile: f64) -> Self {
        Self { values: Vec::new(), percentile: Some(percentile) }
    }
}

impl Accumulator for PercentileAccumulator {
    fn add(&mut self, _time: Timestamp, value: &FieldValue) {
        if value.as_f64().is_some() {
            self.values.push(value.clone());
        }
    }

    fn result(&self) -> Option<FieldValue> {
        if self.values.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.values.iter().filter_map(|v| v.as_f64()).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        match self.percentile {
            None => {
                let mid = sorted.len() / 2;
                Some(FieldValue::Float(if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }))
            }
            Some(p) => {
                let rank = (sorted.len() as f64 * p / 100.0 + 0.5).floor() as i64 - 1;
                if rank < 0 || rank as usize >= sorted.len() {
                    return None;
                }
                let target = sorted[rank as usize];
                self.values
                    .iter()
                    .find(|v| v.as_f64() == Some(target))
                    .cloned()
            }
        }
    }
}

/// Most frequent value, ties broken by earliest occurrence
#[derive(Debug, Default)]
pub struct ModeAccumulator {
    counts: HashMap<String, (u64, Timestamp, FieldValue)>,
}

impl Accumulator for ModeAccumulator {
    fn add(&mut self, time: Timestamp, value: &FieldValue) {
        let entry = self
            .counts
            .entry(value.to_json().to_string())
            .or_insert((0, time, value.clone()));
        entry.0 += 1;
        entry.1 = entry.1.min(time);
    }

    fn result(&self) -> Option<FieldValue> {
        self.counts
            .values()
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
            .map(|(_, _, v)| v.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(name: &str, values: &[FieldValue]) -> Option<FieldValue> {
        let mut acc = new_accumulator(name, None).unwrap();
        for (i, v) in values.iter().enumerate() {
            acc.add(i as Timestamp, v);
        }
        acc.result()
    }

    fn floats(values: &[f64]) -> Vec<FieldValue> {
        values.iter().map(|v| FieldValue::Float(*v)).collect()
    }

    #[test]
    fn test_mean_accumulator() {
        assert_eq!(run("mean", &floats(&[10.0, 20.0, 30.0])), Some(FieldValue::Float(20.0)));
        assert_eq!(run("mean", &[]), None);
    }

    #[test]
    fn test_min_max_keep_type() {
        let ints: Vec<FieldValue> = [5, 2, 8, 1, 9].into_iter().map(FieldValue::Integer).collect();
        assert_eq!(run("min", &ints), Some(FieldValue::Integer(1)));
        assert_eq!(run("max", &ints), Some(FieldValue::Integer(9)));
        assert_eq!(run("spread", &ints), Some(FieldValue::Integer(8)));
        assert_eq!(run("sum", &ints), Some(FieldValue::Integer(25)));
        assert_eq!(run("count", &ints), Some(FieldValue::Integer(5)));
    }

    #[test]
    fn test_sum_mixed_is_float() {
        let values = vec![FieldValue::Integer(1), FieldValue::Float(0.5)];
        assert_eq!(run("sum", &values), Some(FieldValue::Float(1.5)));
    }

    #[test]
    fn test_stddev_accumulator() {
        let result = run("stddev", &floats(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]));
        let Some(FieldValue::Float(stddev)) = result else { panic!() };
        assert!((stddev - 2.138).abs() < 0.01);
    }

    #[test]
    fn test_first_last_by_time() {
        let mut first = EdgeAccumulator::first();
        let mut last = EdgeAccumulator::last();
        for (t, v) in [(5, 1.0), (1, 2.0), (9, 3.0)] {
            first.add(t, &FieldValue::Float(v));
            last.add(t, &FieldValue::Float(v));
        }
        assert_eq!(first.result(), Some(FieldValue::Float(2.0)));
        assert_eq!(last.result(), Some(FieldValue::Float(3.0)));
    }

    #[test]
    fn test_median_percentile_mode() {
        assert_eq!(run("median", &floats(&[1.0, 3.0, 2.0, 4.0])), Some(FieldValue::Float(2.5)));
        let mut p = new_accumulator("percentile", Some(50.0)).unwrap();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            p.add(0, &FieldValue::Float(v));
        }
        assert_eq!(p.result(), Some(FieldValue::Float(3.0)));
        assert_eq!(run("mode", &floats(&[2.0, 1.0, 1.0, 2.0, 3.0])), Some(FieldValue::Float(2.0)));
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(new_accumulator("integral", None), Err(RelayError::Unsupported(_))));
        assert!(new_accumulator("percentile", None).is_err());
    }
}
