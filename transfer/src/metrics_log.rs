use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Named series of per-step scalars. Series only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsLog(BTreeMap<String, Vec<f32>>);

impl MetricsLog {
    pub fn push(&mut self, name: &str, value: f32) {
        self.0.entry(name.to_string()).or_default().push(value);
    }

    pub fn extend<I>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = f32>,
    {
        self.0.entry(name.to_string()).or_default().extend(values);
    }

    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// The length of a series, zero if it doesn't exist.
    pub fn series_len(&self, name: &str) -> usize {
        self.get(name).map_or(0, <[f32]>::len)
    }

    /// The last value of a series.
    pub fn last(&self, name: &str) -> Option<f32> {
        self.get(name).and_then(|s| s.last().copied())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// `n` evenly spaced values from `a` to `b`, both included. A single point is `a`.
pub fn linspace(a: f32, b: f32, n: usize) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![a],
        _ => {
            let step = (b - a) / (n - 1) as f32;
            let mut values: Vec<f32> = (0..n).map(|i| a + step * i as f32).collect();
            values[n - 1] = b;
            values
        }
    }
}
