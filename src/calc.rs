use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;

use crate::error::MarksError;
use crate::store::ScoreStore;

pub const MAX_SESSIONAL: f64 = 70.0;
pub const MAX_ATTENDANCE: f64 = 30.0;

/// 1-decimal rounding used for derived marks:
/// `Int(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Attendance contribution for an attendance percentage.
///
/// The percentage is expected in `0..=100`; the attendance collaborator owns
/// that range, so it is not re-validated here.
pub fn derive_attendance_mark(attendance_percentage: f64) -> f64 {
    let scaled = attendance_percentage / 100.0 * MAX_ATTENDANCE;
    round_off_1_decimal(scaled.min(MAX_ATTENDANCE))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Grade {
    APlus,
    A,
    BPlus,
    B,
    C,
    D,
    F,
}

impl Grade {
    /// Every band, best first.
    pub const ALL: [Grade; 7] = [
        Grade::APlus,
        Grade::A,
        Grade::BPlus,
        Grade::B,
        Grade::C,
        Grade::D,
        Grade::F,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl Serialize for Grade {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Letter grade for a total out of 100. Lower bounds are inclusive.
///
/// | Total  | Grade |
/// |--------|-------|
/// | >= 90  | A+    |
/// | >= 80  | A     |
/// | >= 70  | B+    |
/// | >= 60  | B     |
/// | >= 50  | C     |
/// | >= 40  | D     |
/// | < 40   | F     |
pub fn grade_for_total(total: f64) -> Grade {
    match total {
        t if t >= 90.0 => Grade::APlus,
        t if t >= 80.0 => Grade::A,
        t if t >= 70.0 => Grade::BPlus,
        t if t >= 60.0 => Grade::B,
        t if t >= 50.0 => Grade::C,
        t if t >= 40.0 => Grade::D,
        _ => Grade::F,
    }
}

/// Count of records per grade band. Always carries all seven bands and
/// serializes them in band order, A+ first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GradeDistribution {
    counts: [usize; 7],
}

impl GradeDistribution {
    pub fn record(&mut self, grade: Grade) {
        self.counts[grade.index()] += 1;
    }

    pub fn get(&self, grade: Grade) -> usize {
        self.counts[grade.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Grade, usize)> + '_ {
        Grade::ALL.iter().map(move |g| (*g, self.get(*g)))
    }
}

impl Serialize for GradeDistribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Grade::ALL.len()))?;
        for (grade, count) in self.iter() {
            map.serialize_entry(grade.label(), &count)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub max: f64,
    pub min: f64,
    pub grade_distribution: GradeDistribution,
}

fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

/// Statistics over a set of totals. Empty input is an error rather than NaN.
pub fn summarize_totals(totals: &[f64]) -> Result<CohortStats, MarksError> {
    if totals.is_empty() {
        return Err(MarksError::EmptyCohort);
    }

    let mut sum = 0.0;
    let mut max = f64::MIN;
    let mut min = f64::MAX;
    let mut grade_distribution = GradeDistribution::default();
    for &t in totals {
        sum += t;
        max = max.max(t);
        min = min.min(t);
        grade_distribution.record(grade_for_total(t));
    }

    Ok(CohortStats {
        count: totals.len(),
        mean: sum / totals.len() as f64,
        median: compute_median(totals),
        max,
        min,
        grade_distribution,
    })
}

/// Statistics over the live store, unsaved edits included.
pub fn summarize(store: &ScoreStore) -> Result<CohortStats, MarksError> {
    let totals: Vec<f64> = store.records().iter().map(|r| r.total()).collect();
    summarize_totals(&totals)
}
