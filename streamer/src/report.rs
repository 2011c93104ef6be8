//! Report snapshots collected from the stream stack.
//!
//! A `Report` command walks every stack node; each node appends
//! [`Statistic`] rows for the requested [`ReportKind`]. The collected rows
//! are delivered as the request's output.

use crate::request::ReportKind;
use std::fmt;
use std::time::Duration;

/// Value of a single statistic.
#[derive(Clone, Debug, PartialEq)]
pub enum StatisticValue {
    Count(u64),
    Bytes(u64),
    /// Ratio in `0.0..=1.0`.
    Ratio(f64),
    Duration(Duration),
    Flag(bool),
    Text(String),
}

impl fmt::Display for StatisticValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{n}"),
            Self::Bytes(n) => write!(f, "{n} B"),
            Self::Ratio(r) => write!(f, "{:.1}%", r * 100.0),
            Self::Duration(d) => write!(f, "{:.3} ms", d.as_secs_f64() * 1000.0),
            Self::Flag(b) => write!(f, "{b}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// One named value reported by a component.
#[derive(Clone, Debug, PartialEq)]
pub struct Statistic {
    /// Reporting component, e.g. `"cache"` or `"scheduler"`.
    pub owner: &'static str,
    pub name: &'static str,
    pub value: StatisticValue,
}

impl Statistic {
    pub fn new(owner: &'static str, name: &'static str, value: StatisticValue) -> Self {
        Self { owner, name, value }
    }
}

/// Collected statistics of one kind.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamerReport {
    pub kind: ReportKind,
    pub statistics: Vec<Statistic>,
}

impl StreamerReport {
    pub fn new(kind: ReportKind) -> Self {
        Self {
            kind,
            statistics: Vec::new(),
        }
    }

    pub fn push(&mut self, owner: &'static str, name: &'static str, value: StatisticValue) {
        self.statistics.push(Statistic::new(owner, name, value));
    }

    /// Looks up a statistic by owner and name.
    pub fn get(&self, owner: &str, name: &str) -> Option<&StatisticValue> {
        self.statistics
            .iter()
            .find(|s| s.owner == owner && s.name == name)
            .map(|s| &s.value)
    }
}

impl fmt::Display for StreamerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?} report", self.kind)?;
        for stat in &self.statistics {
            writeln!(f, "  {}.{} = {}", stat.owner, stat.name, stat.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_owner_and_name() {
        let mut report = StreamerReport::new(ReportKind::Statistics);
        report.push("cache", "hit_rate", StatisticValue::Ratio(0.5));
        report.push("device", "reads_in_flight", StatisticValue::Count(3));

        assert_eq!(
            report.get("device", "reads_in_flight"),
            Some(&StatisticValue::Count(3))
        );
        assert_eq!(report.get("cache", "missing"), None);
    }

    #[test]
    fn test_display() {
        let mut report = StreamerReport::new(ReportKind::Queues);
        report.push("scheduler", "queued", StatisticValue::Count(2));
        let text = report.to_string();
        assert!(text.contains("Queues report"));
        assert!(text.contains("scheduler.queued = 2"));
    }
}
