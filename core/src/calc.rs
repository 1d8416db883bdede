//! Calorie arithmetic shared by every endpoint and report.
//!
//! All "remaining calories" figures go through [`remaining_calories`] so the
//! daily summary, the `/remaining` endpoint, progress buckets and the coach
//! context agree on one number.

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{Exercise, Profile, Sex};

/// Goal used when the profile lacks height, weight or birth date.
pub const DEFAULT_DAILY_GOAL: i64 = 2000;
/// Lowest goal the calculator will produce.
pub const MIN_DAILY_GOAL: i64 = 1200;
/// Body weight assumed for MET calculations when none is on record.
pub const DEFAULT_WEIGHT_KG: f64 = 70.0;

/// `goal - consumed + burned`. Negative when the user is over their goal.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn remaining_calories(goal: i64, consumed: f64, burned: f64) -> f64 {
    goal as f64 - consumed + burned
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Remaining {
    pub goal: i64,
    pub consumed: f64,
    pub burned: f64,
    pub remaining: f64,
    pub remaining_clamped: f64,
    pub over_goal: bool,
}

impl Remaining {
    #[must_use]
    pub fn new(goal: i64, consumed: f64, burned: f64) -> Self {
        let remaining = remaining_calories(goal, consumed, burned);
        Self {
            goal,
            consumed,
            burned,
            remaining,
            remaining_clamped: remaining.max(0.0),
            over_goal: remaining < 0.0,
        }
    }
}

/// Mifflin-St Jeor BMR scaled by activity level and offset by the weight goal.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_daily_goal(profile: &Profile, today: NaiveDate) -> i64 {
    let (Some(weight), Some(height), Some(age)) =
        (profile.weight_kg, profile.height_cm, profile.age_on(today))
    else {
        return DEFAULT_DAILY_GOAL;
    };

    let sex_offset = match profile.sex {
        Sex::Male => 5.0,
        Sex::Female => -161.0,
        Sex::Unspecified => -78.0,
    };
    let bmr = 10.0 * weight + 6.25 * height - 5.0 * f64::from(age) + sex_offset;
    let tdee = bmr * profile.activity_level.factor();
    let goal = tdee.round() as i64 + profile.weight_goal.adjustment();
    goal.max(MIN_DAILY_GOAL)
}

/// Fixed per-minute rate when the exercise has one, otherwise `MET * kg * hours`.
#[must_use]
pub fn calories_burned(exercise: &Exercise, duration_min: f64, weight_kg: Option<f64>) -> f64 {
    if let Some(per_minute) = exercise.calories_per_minute {
        return per_minute * duration_min;
    }
    let met = exercise.met.unwrap_or(1.0);
    let weight = weight_kg.unwrap_or(DEFAULT_WEIGHT_KG);
    met * weight * duration_min / 60.0
}

/// Minutes of `exercise` needed to burn `target_kcal`; `None` when the rate is zero.
#[must_use]
pub fn minutes_to_burn(exercise: &Exercise, target_kcal: f64, weight_kg: Option<f64>) -> Option<f64> {
    let per_minute = calories_burned(exercise, 1.0, weight_kg);
    if per_minute <= 0.0 {
        return None;
    }
    Some(target_kcal / per_minute)
}
