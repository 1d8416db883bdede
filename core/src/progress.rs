//! Daily, weekly and monthly aggregation of food and exercise logs, plus
//! logging streaks. Everything here is pure; [`crate::db::Database`] feeds it rows.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result, bail};
use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;

use crate::calc::Remaining;
use crate::models::{
    ExerciseLogEntry, FoodLogEntry, GoalHistoryEntry, MEAL_TYPES, MealGroup, StreakInfo,
    format_date,
};

#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub date: String,
    pub meals: Vec<MealGroup>,
    pub exercises: Vec<ExerciseLogEntry>,
    pub total_protein: f64,
    pub total_carbs: f64,
    pub total_fat: f64,
    #[serde(flatten)]
    pub totals: Remaining,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayTotals {
    pub date: NaiveDate,
    pub food_entries: i64,
    pub exercise_entries: i64,
    #[serde(flatten)]
    pub totals: Remaining,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeekBucket {
    pub week_start: NaiveDate,
    pub days: i64,
    #[serde(flatten)]
    pub totals: Remaining,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub period: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days: Vec<DayTotals>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub weeks: Vec<WeekBucket>,
    pub days_logged: i64,
    pub average_consumed: f64,
    #[serde(flatten)]
    pub totals: Remaining,
}

/// Per-day sums straight out of SQL: `(kcal, entry count)`.
pub type DailySums = HashMap<NaiveDate, (f64, i64)>;

/// Group entries by meal type in breakfast, lunch, dinner, snack order; empty meals are skipped.
#[must_use]
pub fn group_meals(entries: &[FoodLogEntry]) -> Vec<MealGroup> {
    let mut meals = Vec::new();
    for meal_type in MEAL_TYPES {
        let meal_entries: Vec<FoodLogEntry> = entries
            .iter()
            .filter(|e| e.meal_type == *meal_type)
            .cloned()
            .collect();

        if meal_entries.is_empty() {
            continue;
        }

        meals.push(MealGroup {
            meal_type: (*meal_type).to_string(),
            subtotal_calories: meal_entries.iter().map(|e| e.calories).sum(),
            subtotal_protein: meal_entries.iter().filter_map(|e| e.protein).sum(),
            subtotal_carbs: meal_entries.iter().filter_map(|e| e.carbs).sum(),
            subtotal_fat: meal_entries.iter().filter_map(|e| e.fat).sum(),
            entries: meal_entries,
        });
    }
    meals
}

#[must_use]
pub fn build_daily_summary(
    date: NaiveDate,
    goal: i64,
    entries: &[FoodLogEntry],
    exercises: Vec<ExerciseLogEntry>,
) -> DailySummary {
    let meals = group_meals(entries);
    let consumed: f64 = meals.iter().map(|m| m.subtotal_calories).sum();
    let burned: f64 = exercises.iter().map(|e| e.calories_burned).sum();

    DailySummary {
        date: format_date(date),
        total_protein: meals.iter().map(|m| m.subtotal_protein).sum(),
        total_carbs: meals.iter().map(|m| m.subtotal_carbs).sum(),
        total_fat: meals.iter().map(|m| m.subtotal_fat).sum(),
        meals,
        exercises,
        totals: Remaining::new(goal, consumed, burned),
    }
}

/// Goal in effect on `date`: the latest history row on or before it, else `current`.
///
/// `history` must be ordered by date, then insertion, ascending.
#[must_use]
pub fn goal_for_date(history: &[GoalHistoryEntry], current: i64, date: NaiveDate) -> i64 {
    let date = format_date(date);
    history
        .iter()
        .rev()
        .find(|h| h.date <= date)
        .map_or(current, |h| h.daily_calorie_goal)
}

/// One [`DayTotals`] per calendar day in `start..=end`, zero-filled.
pub fn fill_days<F>(
    start: NaiveDate,
    end: NaiveDate,
    food: &DailySums,
    exercise: &DailySums,
    goal_on: F,
) -> Vec<DayTotals>
where
    F: Fn(NaiveDate) -> i64,
{
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .map(|date| {
            let (consumed, food_entries) = food.get(&date).copied().unwrap_or((0.0, 0));
            let (burned, exercise_entries) = exercise.get(&date).copied().unwrap_or((0.0, 0));
            DayTotals {
                date,
                food_entries,
                exercise_entries,
                totals: Remaining::new(goal_on(date), consumed, burned),
            }
        })
        .collect()
}

fn sum_totals<'a, I>(days: I) -> Remaining
where
    I: IntoIterator<Item = &'a DayTotals>,
{
    let (goal, consumed, burned) = days.into_iter().fold((0, 0.0, 0.0), |acc, d| {
        (
            acc.0 + d.totals.goal,
            acc.1 + d.totals.consumed,
            acc.2 + d.totals.burned,
        )
    });
    Remaining::new(goal, consumed, burned)
}

/// Monday-start week buckets. Partial weeks at either edge keep only the days given.
#[must_use]
pub fn week_buckets(days: &[DayTotals]) -> Vec<WeekBucket> {
    let mut groups: Vec<(NaiveDate, Vec<&DayTotals>)> = Vec::new();
    for day in days {
        let week_start =
            day.date - Duration::days(i64::from(day.date.weekday().num_days_from_monday()));
        match groups.last_mut() {
            Some((start, group)) if *start == week_start => group.push(day),
            _ => groups.push((week_start, vec![day])),
        }
    }

    groups
        .into_iter()
        .map(|(week_start, group)| WeekBucket {
            week_start,
            days: group.len() as i64,
            totals: sum_totals(group.iter().copied()),
        })
        .collect()
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn build_report(
    period: &str,
    start: NaiveDate,
    end: NaiveDate,
    days: Vec<DayTotals>,
    with_weeks: bool,
) -> ProgressReport {
    let totals = sum_totals(&days);
    let logged: Vec<&DayTotals> = days.iter().filter(|d| d.food_entries > 0).collect();
    let days_logged = logged.len() as i64;
    let average_consumed = if logged.is_empty() {
        0.0
    } else {
        logged.iter().map(|d| d.totals.consumed).sum::<f64>() / logged.len() as f64
    };
    let weeks = if with_weeks {
        week_buckets(&days)
    } else {
        Vec::new()
    };

    ProgressReport {
        period: period.to_string(),
        start,
        end,
        days,
        weeks,
        days_logged,
        average_consumed,
        totals,
    }
}

/// Seven days ending on `end`, inclusive.
#[must_use]
pub fn week_range(end: NaiveDate) -> (NaiveDate, NaiveDate) {
    (end - Duration::days(6), end)
}

/// First and last day of a `YYYY-MM` month.
pub fn month_range(month: &str) -> Result<(NaiveDate, NaiveDate)> {
    let Some((year, mon)) = month.split_once('-') else {
        bail!("Invalid month '{month}'. Use YYYY-MM");
    };
    let year: i32 = year
        .parse()
        .with_context(|| format!("Invalid month '{month}'. Use YYYY-MM"))?;
    let mon: u32 = mon
        .parse()
        .with_context(|| format!("Invalid month '{month}'. Use YYYY-MM"))?;
    let first = NaiveDate::from_ymd_opt(year, mon, 1)
        .with_context(|| format!("Invalid month '{month}'. Use YYYY-MM"))?;
    let next = if mon == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, mon + 1, 1)
    }
    .context("month out of range")?;
    Ok((first, next - Duration::days(1)))
}

/// Streaks over the set of days with any log. Dates after `today` are ignored.
#[must_use]
pub fn compute_streak(dates: &[NaiveDate], today: NaiveDate) -> StreakInfo {
    let days: BTreeSet<NaiveDate> = dates.iter().copied().filter(|d| *d <= today).collect();
    let Some(last) = days.iter().next_back().copied() else {
        return StreakInfo::default();
    };

    let yesterday = today - Duration::days(1);
    let current_streak = if last == today || last == yesterday {
        let mut streak = 0;
        let mut expected = last;
        for day in days.iter().rev() {
            if *day == expected {
                streak += 1;
                expected -= Duration::days(1);
            } else {
                break;
            }
        }
        streak
    } else {
        0
    };

    let mut longest_streak = 0;
    let mut run = 0;
    let mut prev: Option<NaiveDate> = None;
    for day in &days {
        run = match prev {
            Some(p) if *day - p == Duration::days(1) => run + 1,
            _ => 1,
        };
        longest_streak = longest_streak.max(run);
        prev = Some(*day);
    }

    StreakInfo {
        current_streak,
        longest_streak,
        last_logged_date: Some(format_date(last)),
        total_days_logged: days.len() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn history(rows: &[(&str, i64)]) -> Vec<GoalHistoryEntry> {
        rows.iter()
            .enumerate()
            .map(|(i, (d, g))| GoalHistoryEntry {
                id: i as i64 + 1,
                user: "alice".to_string(),
                date: (*d).to_string(),
                daily_calorie_goal: *g,
                created_at: String::new(),
            })
            .collect()
    }

    fn food_entry(meal_type: &str, calories: f64, protein: Option<f64>) -> FoodLogEntry {
        FoodLogEntry {
            id: 1,
            user: "alice".to_string(),
            date: "2024-06-15".to_string(),
            meal_type: meal_type.to_string(),
            food_id: 1,
            serving_g: 100.0,
            created_at: String::new(),
            updated_at: String::new(),
            food_name: "Food".to_string(),
            food_brand: None,
            calories,
            protein,
            carbs: None,
            fat: None,
        }
    }

    fn exercise_entry(calories_burned: f64) -> ExerciseLogEntry {
        ExerciseLogEntry {
            id: 1,
            user: "alice".to_string(),
            date: "2024-06-15".to_string(),
            exercise_id: 1,
            exercise_name: "Running".to_string(),
            duration_min: 30.0,
            calories_burned,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_goal_for_date_falls_back_to_current() {
        let h = history(&[("2024-06-10", 1800), ("2024-06-20", 2200)]);
        assert_eq!(goal_for_date(&h, 2500, date(2024, 6, 1)), 2500);
        assert_eq!(goal_for_date(&h, 2500, date(2024, 6, 10)), 1800);
        assert_eq!(goal_for_date(&h, 2500, date(2024, 6, 19)), 1800);
        assert_eq!(goal_for_date(&h, 2500, date(2024, 6, 25)), 2200);
        assert_eq!(goal_for_date(&[], 2500, date(2024, 6, 25)), 2500);
    }

    #[test]
    fn test_goal_for_date_same_day_latest_insert_wins() {
        let h = history(&[("2024-06-10", 1800), ("2024-06-10", 1900)]);
        assert_eq!(goal_for_date(&h, 2500, date(2024, 6, 10)), 1900);
    }

    #[test]
    fn test_group_meals_order_and_subtotals() {
        let entries = vec![
            food_entry("dinner", 600.0, Some(40.0)),
            food_entry("breakfast", 300.0, Some(10.0)),
            food_entry("dinner", 200.0, None),
        ];
        let meals = group_meals(&entries);
        assert_eq!(meals.len(), 2);
        assert_eq!(meals[0].meal_type, "breakfast");
        assert_eq!(meals[1].meal_type, "dinner");
        assert!((meals[1].subtotal_calories - 800.0).abs() < f64::EPSILON);
        assert!((meals[1].subtotal_protein - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_daily_summary_uses_unified_remaining() {
        let summary = build_daily_summary(
            date(2024, 6, 15),
            2000,
            &[food_entry("lunch", 900.0, None)],
            vec![exercise_entry(250.0)],
        );
        assert_eq!(summary.date, "2024-06-15");
        assert!((summary.totals.consumed - 900.0).abs() < f64::EPSILON);
        assert!((summary.totals.burned - 250.0).abs() < f64::EPSILON);
        assert!((summary.totals.remaining - 1350.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fill_days_zero_fills() {
        let mut food = DailySums::new();
        food.insert(date(2024, 6, 2), (1500.0, 3));
        let mut exercise = DailySums::new();
        exercise.insert(date(2024, 6, 3), (300.0, 1));

        let days = fill_days(date(2024, 6, 1), date(2024, 6, 3), &food, &exercise, |_| 2000);
        assert_eq!(days.len(), 3);
        assert_eq!(days[0].food_entries, 0);
        assert!((days[0].totals.remaining - 2000.0).abs() < f64::EPSILON);
        assert!((days[1].totals.remaining - 500.0).abs() < f64::EPSILON);
        assert!((days[2].totals.remaining - 2300.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_report_totals_and_average() {
        let mut food = DailySums::new();
        food.insert(date(2024, 6, 1), (1000.0, 1));
        food.insert(date(2024, 6, 2), (2000.0, 2));
        let days = fill_days(
            date(2024, 6, 1),
            date(2024, 6, 7),
            &food,
            &DailySums::new(),
            |_| 1800,
        );
        let report = build_report("week", date(2024, 6, 1), date(2024, 6, 7), days, false);
        assert_eq!(report.days.len(), 7);
        assert_eq!(report.days_logged, 2);
        assert!((report.average_consumed - 1500.0).abs() < f64::EPSILON);
        assert_eq!(report.totals.goal, 1800 * 7);
        assert!((report.totals.remaining - (12600.0 - 3000.0)).abs() < f64::EPSILON);
        assert!(report.weeks.is_empty());
    }

    #[test]
    fn test_week_buckets_monday_start() {
        // June 2024: the 1st is a Saturday, the 3rd a Monday.
        let days = fill_days(
            date(2024, 6, 1),
            date(2024, 6, 30),
            &DailySums::new(),
            &DailySums::new(),
            |_| 2000,
        );
        let weeks = week_buckets(&days);
        assert_eq!(weeks.len(), 6);
        assert_eq!(weeks[0].week_start, date(2024, 5, 27));
        assert_eq!(weeks[0].days, 2);
        assert_eq!(weeks[1].week_start, date(2024, 6, 3));
        assert_eq!(weeks[1].days, 7);
        assert_eq!(weeks[1].totals.goal, 14000);
        assert_eq!(weeks.iter().map(|w| w.days).sum::<i64>(), 30);
    }

    #[test]
    fn test_month_range() {
        assert_eq!(
            month_range("2024-02").unwrap(),
            (date(2024, 2, 1), date(2024, 2, 29))
        );
        assert_eq!(
            month_range("2023-12").unwrap(),
            (date(2023, 12, 1), date(2023, 12, 31))
        );
        assert!(month_range("2024-13").is_err());
        assert!(month_range("june").is_err());
    }

    #[test]
    fn test_week_range() {
        assert_eq!(
            week_range(date(2024, 6, 15)),
            (date(2024, 6, 9), date(2024, 6, 15))
        );
    }

    #[test]
    fn test_streak_empty() {
        assert_eq!(compute_streak(&[], date(2024, 6, 15)), StreakInfo::default());
    }

    #[test]
    fn test_streak_counts_from_today() {
        let today = date(2024, 6, 15);
        let dates = vec![date(2024, 6, 15), date(2024, 6, 14), date(2024, 6, 13), date(2024, 6, 10)];
        let s = compute_streak(&dates, today);
        assert_eq!(s.current_streak, 3);
        assert_eq!(s.longest_streak, 3);
        assert_eq!(s.total_days_logged, 4);
        assert_eq!(s.last_logged_date.as_deref(), Some("2024-06-15"));
    }

    #[test]
    fn test_streak_from_yesterday_still_alive() {
        let today = date(2024, 6, 15);
        let dates = vec![date(2024, 6, 14), date(2024, 6, 13)];
        assert_eq!(compute_streak(&dates, today).current_streak, 2);
    }

    #[test]
    fn test_streak_broken_keeps_longest() {
        let today = date(2024, 6, 15);
        let dates = vec![
            date(2024, 6, 1),
            date(2024, 6, 2),
            date(2024, 6, 3),
            date(2024, 6, 4),
            date(2024, 6, 12),
        ];
        let s = compute_streak(&dates, today);
        assert_eq!(s.current_streak, 0);
        assert_eq!(s.longest_streak, 4);
    }

    #[test]
    fn test_streak_ignores_future_and_duplicates() {
        let today = date(2024, 6, 15);
        let dates = vec![date(2024, 6, 20), date(2024, 6, 15), date(2024, 6, 15)];
        let s = compute_streak(&dates, today);
        assert_eq!(s.current_streak, 1);
        assert_eq!(s.total_days_logged, 1);
        assert_eq!(s.last_logged_date.as_deref(), Some("2024-06-15"));
    }
}
