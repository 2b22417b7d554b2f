//! Dropout schedules keyed by the fraction of training data processed.

use serde::{Deserialize, Serialize};

/// A piecewise-linear dropout schedule for one component-name pattern.
///
/// Written as comma-separated proportions, e.g. `0,0.5@0.5,0`. The first
/// value applies at data fraction 0 and the last at 1. Intermediate values
/// take an explicit `@fraction`, defaulting to 0.5.
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentDropout {
    /// Component name pattern, `*` for all components.
    pub pattern: String,
    /// `(data_fraction, proportion)` points with non-decreasing fractions.
    pub points: Vec<(f64, f64)>,
}

impl ComponentDropout {
    /// Dropout proportion at `data_fraction`, linearly interpolated.
    #[must_use]
    pub fn proportion(&self, data_fraction: f64) -> f64 {
        let f = data_fraction.clamp(0.0, 1.0);
        let idx = self
            .points
            .iter()
            .rposition(|&(x, _)| x <= f)
            .unwrap_or(0);
        let (x0, y0) = self.points[idx];
        let Some(&(x1, y1)) = self.points.get(idx + 1) else {
            return y0;
        };
        if x1 <= x0 {
            return y0;
        }
        y0 + (f - x0) * (y1 - y0) / (x1 - x0)
    }

    fn parse(pattern: &str, schedule: &str) -> Result<Self, String> {
        let parts: Vec<&str> = schedule.split(',').map(str::trim).collect();
        if parts.len() < 2 {
            return Err(format!(
                "dropout schedule '{schedule}' must give at least the start and end proportions"
            ));
        }

        let parse_value = |s: &str| -> Result<f64, String> {
            let v: f64 = s
                .parse()
                .map_err(|_| format!("invalid dropout proportion '{s}' in '{schedule}'"))?;
            if !(0.0..=1.0).contains(&v) {
                return Err(format!("dropout proportion {v} in '{schedule}' is not in [0, 1]"));
            }
            Ok(v)
        };

        let mut points = vec![(0.0, parse_value(parts[0])?)];
        for part in &parts[1..parts.len() - 1] {
            let (value, fraction) = match part.split_once('@') {
                Some((v, x)) => (
                    parse_value(v)?,
                    x.trim()
                        .parse::<f64>()
                        .map_err(|_| format!("invalid data fraction '{x}' in '{schedule}'"))?,
                ),
                None => (parse_value(part)?, 0.5),
            };
            let last = points.last().map_or(0.0, |&(x, _)| x);
            if fraction < last || fraction > 1.0 {
                return Err(format!(
                    "data fractions in '{schedule}' must be non-decreasing and within [0, 1]"
                ));
            }
            points.push((fraction, value));
        }
        points.push((1.0, parse_value(parts[parts.len() - 1])?));

        Ok(Self {
            pattern: pattern.to_string(),
            points,
        })
    }
}

/// One `set-dropout-proportion` directive for the trainer.
#[derive(Clone, Debug, PartialEq)]
pub struct DropoutEdit {
    pub pattern: String,
    pub proportion: f64,
}

impl std::fmt::Display for DropoutEdit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "set-dropout-proportion name={} proportion={}",
            self.pattern, self.proportion
        )
    }
}

/// Whitespace-separated list of `[pattern=]schedule` items.
///
/// Examples:
/// - `"0,0.2@0.5,0"` → every component, ramping up then down
/// - `"lstm*=0,0.3,0 tdnn*=0,0.1"` → separate schedules per pattern
#[derive(Clone, Debug, PartialEq)]
pub struct DropoutSchedule(pub Vec<ComponentDropout>);

impl DropoutSchedule {
    /// Edits to apply at the given fraction of data processed.
    #[must_use]
    pub fn edits(&self, data_fraction: f64) -> Vec<DropoutEdit> {
        self.0
            .iter()
            .map(|c| DropoutEdit {
                pattern: c.pattern.clone(),
                proportion: c.proportion(data_fraction),
            })
            .collect()
    }
}

impl std::str::FromStr for DropoutSchedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = s
            .split_whitespace()
            .map(|item| match item.split_once('=') {
                Some((pattern, schedule)) => ComponentDropout::parse(pattern, schedule),
                None => ComponentDropout::parse("*", item),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if components.is_empty() {
            return Err("empty dropout schedule".to_string());
        }
        Ok(Self(components))
    }
}

impl std::fmt::Display for DropoutSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}=", c.pattern)?;
            let last = c.points.len() - 1;
            for (j, (x, y)) in c.points.iter().enumerate() {
                if j > 0 {
                    write!(f, ",")?;
                }
                if j == 0 || j == last {
                    write!(f, "{y}")?;
                } else {
                    write!(f, "{y}@{x}")?;
                }
            }
        }
        Ok(())
    }
}

impl Serialize for DropoutSchedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DropoutSchedule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
