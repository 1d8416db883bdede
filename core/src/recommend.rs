//! Food and exercise recommendation filtering and ranking.

use std::cmp::Ordering;

use serde::Serialize;

use crate::calc;
use crate::models::{Exercise, Food};

pub const DEFAULT_FOOD_LIMIT: usize = 10;
pub const MAX_FOOD_LIMIT: usize = 50;
/// Serving ceiling once the day's budget is used up.
pub const OVER_BUDGET_SNACK_KCAL: f64 = 100.0;
pub const DEFAULT_EXERCISE_MINUTES: f64 = 30.0;

#[derive(Debug, Clone, Serialize)]
pub struct FoodRecommendation {
    #[serde(flatten)]
    pub food: Food,
    pub serving_g: f64,
    pub serving_calories: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serving_protein: Option<f64>,
    pub protein_per_kcal: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExerciseRecommendation {
    #[serde(flatten)]
    pub exercise: Exercise,
    pub minutes: f64,
    pub calories: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes_for_target: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ExerciseQuery {
    pub intensity: Option<String>,
    pub category: Option<String>,
    pub minutes: Option<f64>,
    pub target_kcal: Option<f64>,
}

impl ExerciseQuery {
    #[must_use]
    pub fn minutes(&self) -> f64 {
        self.minutes
            .filter(|m| *m > 0.0)
            .unwrap_or(DEFAULT_EXERCISE_MINUTES)
    }

    /// Stable string form used as part of the cache key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!(
            "i={}|c={}|m={}|t={}",
            self.intensity.as_deref().unwrap_or(""),
            self.category.as_deref().unwrap_or(""),
            self.minutes(),
            self.target_kcal.map(|t| t.to_string()).unwrap_or_default()
        )
    }
}

/// `None` gives the default; anything above the maximum is capped; zero counts as one.
#[must_use]
pub fn clamp_food_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_FOOD_LIMIT).clamp(1, MAX_FOOD_LIMIT)
}

/// Largest serving size in kcal a recommended food may have.
#[must_use]
pub fn food_budget(remaining: f64) -> f64 {
    if remaining <= 0.0 {
        OVER_BUDGET_SNACK_KCAL
    } else {
        remaining
    }
}

/// Foods whose serving fits in the remaining budget, most protein per kcal first,
/// then fewest kcal.
#[must_use]
pub fn recommend_foods(candidates: Vec<Food>, remaining: f64, limit: usize) -> Vec<FoodRecommendation> {
    let budget = food_budget(remaining);
    let mut recs: Vec<FoodRecommendation> = candidates
        .into_iter()
        .filter_map(|food| {
            let serving_g = food.serving_or_default();
            let serving_calories = food.calories_for(serving_g);
            if serving_calories > budget {
                return None;
            }
            let serving_protein = food.protein_per_100g.map(|p| p * serving_g / 100.0);
            let protein_per_kcal = match serving_protein {
                Some(p) if serving_calories > 0.0 => p / serving_calories,
                _ => 0.0,
            };
            Some(FoodRecommendation {
                food,
                serving_g,
                serving_calories,
                serving_protein,
                protein_per_kcal,
            })
        })
        .collect();

    recs.sort_by(|a, b| {
        b.protein_per_kcal
            .total_cmp(&a.protein_per_kcal)
            .then_with(|| a.serving_calories.total_cmp(&b.serving_calories))
            .then_with(|| a.food.id.cmp(&b.food.id))
    });
    recs.truncate(limit);
    recs
}

fn matches(filter: Option<&str>, value: &str) -> bool {
    filter.is_none_or(|f| f.eq_ignore_ascii_case(value))
}

/// Exercises matching the query, highest burn for the given duration first.
#[must_use]
pub fn recommend_exercises(
    exercises: Vec<Exercise>,
    query: &ExerciseQuery,
    weight_kg: Option<f64>,
) -> Vec<ExerciseRecommendation> {
    let minutes = query.minutes();
    let mut recs: Vec<ExerciseRecommendation> = exercises
        .into_iter()
        .filter(|e| matches(query.intensity.as_deref(), &e.intensity))
        .filter(|e| matches(query.category.as_deref(), &e.category))
        .map(|exercise| {
            let calories = calc::calories_burned(&exercise, minutes, weight_kg);
            let minutes_for_target = query
                .target_kcal
                .and_then(|target| calc::minutes_to_burn(&exercise, target, weight_kg));
            ExerciseRecommendation {
                exercise,
                minutes,
                calories,
                minutes_for_target,
            }
        })
        .collect();

    recs.sort_by(|a, b| match b.calories.total_cmp(&a.calories) {
        Ordering::Equal => a.exercise.name.cmp(&b.exercise.name),
        other => other,
    });
    recs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn food(id: i64, kcal_100: f64, protein_100: Option<f64>, serving: Option<f64>) -> Food {
        Food {
            id,
            name: format!("food {id}"),
            brand: None,
            barcode: None,
            calories_per_100g: kcal_100,
            protein_per_100g: protein_100,
            carbs_per_100g: None,
            fat_per_100g: None,
            default_serving_g: serving,
            source: "manual".to_string(),
            owner: None,
            created_at: String::new(),
        }
    }

    fn exercise(name: &str, category: &str, intensity: &str, met: f64) -> Exercise {
        Exercise {
            id: 1,
            name: name.to_string(),
            category: category.to_string(),
            intensity: intensity.to_string(),
            met: Some(met),
            calories_per_minute: None,
            owner: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_food_limit_clamp() {
        assert_eq!(clamp_food_limit(None), 10);
        assert_eq!(clamp_food_limit(Some(0)), 1);
        assert_eq!(clamp_food_limit(Some(500)), 50);
        assert_eq!(clamp_food_limit(Some(25)), 25);
    }

    #[test]
    fn test_foods_filtered_by_remaining() {
        let foods = vec![
            food(1, 165.0, Some(31.0), Some(150.0)), // 247.5 kcal serving
            food(2, 52.0, Some(0.3), None),          // 52 kcal
            food(3, 600.0, Some(10.0), Some(100.0)), // 600 kcal
        ];
        let recs = recommend_foods(foods, 300.0, 10);
        let ids: Vec<i64> = recs.iter().map(|r| r.food.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!((recs[0].serving_calories - 247.5).abs() < 1e-9);
        assert!((recs[0].serving_g - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_over_budget_allows_small_snacks_only() {
        let foods = vec![food(1, 52.0, None, None), food(2, 165.0, Some(31.0), Some(150.0))];
        let recs = recommend_foods(foods, -250.0, 10);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].food.id, 1);
        assert!((food_budget(0.0) - OVER_BUDGET_SNACK_KCAL).abs() < f64::EPSILON);
    }

    #[test]
    fn test_foods_ranked_by_protein_density_then_calories() {
        let foods = vec![
            food(1, 100.0, Some(10.0), None), // 0.1 g/kcal, 100 kcal
            food(2, 50.0, Some(5.0), None),   // 0.1 g/kcal, 50 kcal
            food(3, 100.0, Some(20.0), None), // 0.2 g/kcal
            food(4, 80.0, None, None),        // 0
        ];
        let recs = recommend_foods(foods, 1000.0, 3);
        let ids: Vec<i64> = recs.iter().map(|r| r.food.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_exercise_filters_and_sorting() {
        let exercises = vec![
            exercise("Walking", "cardio", "low", 3.5),
            exercise("Running", "cardio", "high", 9.8),
            exercise("Yoga", "flexibility", "low", 2.5),
        ];
        let query = ExerciseQuery {
            intensity: Some("LOW".to_string()),
            ..ExerciseQuery::default()
        };
        let recs = recommend_exercises(exercises.clone(), &query, Some(70.0));
        let names: Vec<&str> = recs.iter().map(|r| r.exercise.name.as_str()).collect();
        assert_eq!(names, vec!["Walking", "Yoga"]);
        // 3.5 * 70 * 30 / 60
        assert!((recs[0].calories - 122.5).abs() < 1e-9);
        assert!(recs[0].minutes_for_target.is_none());

        let query = ExerciseQuery {
            category: Some("cardio".to_string()),
            minutes: Some(60.0),
            target_kcal: Some(686.0),
            ..ExerciseQuery::default()
        };
        let recs = recommend_exercises(exercises, &query, Some(70.0));
        assert_eq!(recs[0].exercise.name, "Running");
        assert!((recs[0].calories - 686.0).abs() < 1e-9);
        assert!((recs[0].minutes_for_target.unwrap() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_cache_key_distinguishes_queries() {
        let a = ExerciseQuery::default();
        let b = ExerciseQuery {
            minutes: Some(30.0),
            ..ExerciseQuery::default()
        };
        let c = ExerciseQuery {
            minutes: Some(45.0),
            ..ExerciseQuery::default()
        };
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
    }
}
