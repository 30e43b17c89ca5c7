//! Trend flags over a window of weekly points.
//!
//! Pure functions: every flag is computed independently from the same
//! oldest-first slice of [`WeekPoint`]s. Volume means the target's credited
//! volume ([`WeekPoint::volume_for`]), so the flags agree with the numbers a
//! progress summary reports.

use crate::series::WeekPoint;
use crate::TargetKind;
use serde::{Deserialize, Serialize};

/// Minimum weeks before a plateau can be called
const PLATEAU_MIN_WEEKS: usize = 4;
/// e1RM spread (relative to mean) treated as flat
const PLATEAU_MAX_SPREAD: f64 = 0.02;
/// Week-over-week volume drop that counts as a deload
const DELOAD_DROP: f64 = 0.40;
const OVERREACH_FAILURE_RATE: f64 = 0.35;
const OVERREACH_MAX_AVG_RIR: f64 = 1.0;
/// Relative change inside which a trend is flat
const TREND_BAND: f64 = 0.05;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrendFlags {
    pub plateau: bool,
    pub deload: bool,
    pub overreach: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
    InsufficientData,
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// e1RM has stalled over the last four weeks
pub fn is_plateau(points: &[WeekPoint]) -> bool {
    if points.len() < PLATEAU_MIN_WEEKS {
        return false;
    }
    let recent: Vec<f64> = points[points.len() - PLATEAU_MIN_WEEKS..]
        .iter()
        .filter_map(|p| p.e1rm_max)
        .collect();
    if recent.len() < 3 {
        return false;
    }
    let max = recent.iter().copied().fold(f64::MIN, f64::max);
    let min = recent.iter().copied().fold(f64::MAX, f64::min);
    match mean(&recent) {
        Some(avg) if avg > 0.0 => (max - min) / avg <= PLATEAU_MAX_SPREAD,
        _ => false,
    }
}

/// Volume fell by more than 40% from the previous week
pub fn is_deload(points: &[WeekPoint], kind: TargetKind) -> bool {
    let [.., prev, last] = points else {
        return false;
    };
    let (prev, last) = (prev.volume_for(kind), last.volume_for(kind));
    prev > 0.0 && (prev - last) / prev > DELOAD_DROP
}

/// Grinding to failure at rising volume over the last two weeks
pub fn is_overreach(points: &[WeekPoint], kind: TargetKind) -> bool {
    let [.., prev, last] = points else {
        return false;
    };
    let failure: Vec<f64> = [prev, last].iter().filter_map(|p| p.failure_rate).collect();
    let rir: Vec<f64> = [prev, last].iter().filter_map(|p| p.avg_rir).collect();
    let (Some(failure_rate), Some(avg_rir)) = (mean(&failure), mean(&rir)) else {
        return false;
    };
    failure_rate > OVERREACH_FAILURE_RATE
        && avg_rir < OVERREACH_MAX_AVG_RIR
        && last.volume_for(kind) >= prev.volume_for(kind)
}

pub fn detect_flags(points: &[WeekPoint], kind: TargetKind) -> TrendFlags {
    TrendFlags {
        plateau: is_plateau(points),
        deload: is_deload(points, kind),
        overreach: is_overreach(points, kind),
    }
}

/// Newer half of the window against the older half, by mean volume
pub fn trend_direction(points: &[WeekPoint], kind: TargetKind) -> TrendDirection {
    if points.len() < 2 {
        return TrendDirection::InsufficientData;
    }
    let volumes: Vec<f64> = points.iter().map(|p| p.volume_for(kind)).collect();
    let (older, newer) = volumes.split_at(volumes.len() / 2);
    let (Some(older), Some(newer)) = (mean(older), mean(newer)) else {
        return TrendDirection::InsufficientData;
    };
    if older <= 0.0 {
        return if newer > 0.0 {
            TrendDirection::Up
        } else {
            TrendDirection::Flat
        };
    }
    let change = (newer - older) / older;
    if change > TREND_BAND {
        TrendDirection::Up
    } else if change < -TREND_BAND {
        TrendDirection::Down
    } else {
        TrendDirection::Flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::RepsBuckets;
    use chrono::{Duration, NaiveDate};

    const EX: TargetKind = TargetKind::Exercise;

    fn point(i: i64, volume: f64) -> WeekPoint {
        WeekPoint {
            week_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::weeks(i),
            sets: 10.0,
            hard_sets: 8.0,
            volume,
            effective_volume: volume,
            set_count: 10.0,
            e1rm_max: None,
            load_min: None,
            load_max: None,
            avg_rir: Some(2.0),
            failure_rate: Some(0.0),
            reps_bucket: RepsBuckets::default(),
        }
    }

    fn series(volumes: &[f64]) -> Vec<WeekPoint> {
        volumes
            .iter()
            .enumerate()
            .map(|(i, v)| point(i as i64, *v))
            .collect()
    }

    #[test]
    fn test_deload_threshold() {
        assert!(is_deload(&series(&[1000.0, 550.0]), EX));
        assert!(!is_deload(&series(&[1000.0, 700.0]), EX));
        assert!(!is_deload(&series(&[1000.0]), EX));
        assert!(!is_deload(&series(&[0.0, 0.0]), EX));
    }

    #[test]
    fn test_plateau_needs_four_weeks_and_three_e1rms() {
        let mut points = series(&[1000.0; 4]);
        for (p, e) in points.iter_mut().zip([100.0, 100.5, 101.0, 100.0]) {
            p.e1rm_max = Some(e);
        }
        assert!(is_plateau(&points));
        assert!(!is_plateau(&points[1..]));

        points[3].e1rm_max = None;
        points[2].e1rm_max = None;
        assert!(!is_plateau(&points));

        let mut climbing = series(&[1000.0; 4]);
        for (p, e) in climbing.iter_mut().zip([100.0, 104.0, 108.0, 112.0]) {
            p.e1rm_max = Some(e);
        }
        assert!(!is_plateau(&climbing));
    }

    #[test]
    fn test_overreach() {
        let mut points = series(&[1000.0, 1100.0]);
        for p in points.iter_mut() {
            p.failure_rate = Some(0.5);
            p.avg_rir = Some(0.5);
        }
        assert!(is_overreach(&points, EX));

        points[1].volume = 900.0;
        assert!(!is_overreach(&points, EX));

        points[1].volume = 1100.0;
        points[1].avg_rir = Some(2.5);
        assert!(!is_overreach(&points, EX));
    }

    #[test]
    fn test_flags_are_independent() {
        let mut points = series(&[1000.0, 1000.0, 1000.0, 1000.0, 500.0]);
        for p in points.iter_mut() {
            p.e1rm_max = Some(100.0);
        }
        let flags = detect_flags(&points, EX);
        assert!(flags.plateau);
        assert!(flags.deload);
        assert!(!flags.overreach);
    }

    #[test]
    fn test_trend_direction() {
        assert_eq!(trend_direction(&series(&[1000.0]), EX), TrendDirection::InsufficientData);
        assert_eq!(trend_direction(&series(&[1000.0, 1200.0]), EX), TrendDirection::Up);
        assert_eq!(trend_direction(&series(&[1000.0, 800.0]), EX), TrendDirection::Down);
        assert_eq!(
            trend_direction(&series(&[1000.0, 1020.0, 990.0, 1010.0]), EX),
            TrendDirection::Flat
        );
        assert_eq!(trend_direction(&series(&[0.0, 300.0]), EX), TrendDirection::Up);
    }

    #[test]
    fn test_group_flags_follow_effective_volume() {
        // Raw volume holds steady while the chest-credited share collapses
        let mut points = series(&[1000.0, 1000.0]);
        points[0].effective_volume = 700.0;
        points[1].effective_volume = 300.0;

        assert!(!is_deload(&points, EX));
        assert!(is_deload(&points, TargetKind::MuscleGroup));
        assert_eq!(trend_direction(&points, EX), TrendDirection::Flat);
        assert_eq!(
            trend_direction(&points, TargetKind::Muscle),
            TrendDirection::Down
        );

        for p in points.iter_mut() {
            p.failure_rate = Some(0.5);
            p.avg_rir = Some(0.5);
        }
        assert!(is_overreach(&points, EX));
        assert!(!is_overreach(&points, TargetKind::MuscleGroup));
    }
}
