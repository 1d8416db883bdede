use anyhow::{Result, bail};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|_| anyhow::anyhow!("Invalid date '{s}'. Use YYYY-MM-DD"))
}

#[must_use]
pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

// --- Profile enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Male,
    Female,
    #[default]
    Unspecified,
}

impl Sex {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Unspecified => "unspecified",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "male" | "m" => Ok(Self::Male),
            "female" | "f" => Ok(Self::Female),
            "unspecified" | "" => Ok(Self::Unspecified),
            _ => bail!("Invalid sex '{s}'. Must be one of: male, female, unspecified"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    #[default]
    Sedentary,
    Light,
    Moderate,
    Active,
    VeryActive,
}

impl ActivityLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sedentary => "sedentary",
            Self::Light => "light",
            Self::Moderate => "moderate",
            Self::Active => "active",
            Self::VeryActive => "very_active",
        }
    }

    /// TDEE multiplier applied to the basal metabolic rate.
    #[must_use]
    pub const fn factor(self) -> f64 {
        match self {
            Self::Sedentary => 1.2,
            Self::Light => 1.375,
            Self::Moderate => 1.55,
            Self::Active => 1.725,
            Self::VeryActive => 1.9,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "sedentary" => Ok(Self::Sedentary),
            "light" => Ok(Self::Light),
            "moderate" => Ok(Self::Moderate),
            "active" => Ok(Self::Active),
            "very_active" => Ok(Self::VeryActive),
            _ => bail!(
                "Invalid activity level '{s}'. Must be one of: sedentary, light, moderate, active, very_active"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightGoal {
    Lose,
    #[default]
    Maintain,
    Gain,
}

impl WeightGoal {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lose => "lose",
            Self::Maintain => "maintain",
            Self::Gain => "gain",
        }
    }

    /// Daily kcal offset, roughly 0.5 kg per week.
    #[must_use]
    pub const fn adjustment(self) -> i64 {
        match self {
            Self::Lose => -500,
            Self::Maintain => 0,
            Self::Gain => 500,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lose" => Ok(Self::Lose),
            "maintain" => Ok(Self::Maintain),
            "gain" => Ok(Self::Gain),
            _ => bail!("Invalid weight goal '{s}'. Must be one of: lose, maintain, gain"),
        }
    }
}

// --- Users ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub sex: Sex,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub height_cm: Option<f64>,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub activity_level: ActivityLevel,
    #[serde(default)]
    pub weight_goal: WeightGoal,
}

impl Profile {
    /// Age in whole years on `today`.
    #[must_use]
    pub fn age_on(&self, today: NaiveDate) -> Option<i32> {
        let birth = self.birth_date?;
        let mut age = today.year() - birth.year();
        if (today.month(), today.day()) < (birth.month(), birth.day()) {
            age -= 1;
        }
        Some(age)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(flatten)]
    pub profile: Profile,
    pub daily_calorie_goal: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub profile: Profile,
    pub daily_calorie_goal: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoalHistoryEntry {
    pub id: i64,
    pub user: String,
    pub date: String,
    pub daily_calorie_goal: i64,
    pub created_at: String,
}

// --- Foods ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Food {
    pub id: i64,
    pub name: String,
    pub brand: Option<String>,
    pub barcode: Option<String>,
    pub calories_per_100g: f64,
    pub protein_per_100g: Option<f64>,
    pub carbs_per_100g: Option<f64>,
    pub fat_per_100g: Option<f64>,
    pub default_serving_g: Option<f64>,
    pub source: String,
    /// Set on private foods (quick adds); shared catalogue foods have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub created_at: String,
}

impl Food {
    /// Serving used when the caller gives none: the food's default, else 100 g.
    #[must_use]
    pub fn serving_or_default(&self) -> f64 {
        self.default_serving_g.filter(|g| *g > 0.0).unwrap_or(100.0)
    }

    #[must_use]
    pub fn calories_for(&self, serving_g: f64) -> f64 {
        self.calories_per_100g * serving_g / 100.0
    }
}

#[derive(Debug, Clone)]
pub struct NewFood {
    pub name: String,
    pub brand: Option<String>,
    pub barcode: Option<String>,
    pub calories_per_100g: f64,
    pub protein_per_100g: Option<f64>,
    pub carbs_per_100g: Option<f64>,
    pub fat_per_100g: Option<f64>,
    pub default_serving_g: Option<f64>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FoodLogEntry {
    pub id: i64,
    pub user: String,
    pub date: String,
    pub meal_type: String,
    pub food_id: i64,
    pub serving_g: f64,
    pub created_at: String,
    pub updated_at: String,
    // Joined from foods
    pub food_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub food_brand: Option<String>,
    pub calories: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protein: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carbs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fat: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct NewFoodLog {
    pub user: String,
    pub date: NaiveDate,
    pub meal_type: String,
    pub food_id: i64,
    pub serving_g: f64,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateFoodLog {
    pub serving_g: Option<f64>,
    pub meal_type: Option<String>,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MealGroup {
    pub meal_type: String,
    pub entries: Vec<FoodLogEntry>,
    pub subtotal_calories: f64,
    pub subtotal_protein: f64,
    pub subtotal_carbs: f64,
    pub subtotal_fat: f64,
}

// --- Exercises ---

#[derive(Debug, Clone, Serialize)]
pub struct Exercise {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub intensity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub met: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calories_per_minute: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub created_at: String,
}

impl Exercise {
    #[must_use]
    pub fn is_custom(&self) -> bool {
        self.owner.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewExercise {
    pub name: String,
    pub category: String,
    pub intensity: String,
    pub met: Option<f64>,
    pub calories_per_minute: Option<f64>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExerciseLogEntry {
    pub id: i64,
    pub user: String,
    pub date: String,
    pub exercise_id: i64,
    pub exercise_name: String,
    pub duration_min: f64,
    pub calories_burned: f64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewExerciseLog {
    pub user: String,
    pub date: NaiveDate,
    pub exercise_id: i64,
    pub duration_min: f64,
    pub calories_burned: f64,
}

// --- Weight ---

#[derive(Debug, Clone, Serialize)]
pub struct WeightEntry {
    pub id: i64,
    pub user: String,
    pub date: NaiveDate,
    pub weight_kg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewWeightEntry {
    pub user: String,
    pub date: NaiveDate,
    pub weight_kg: f64,
    pub notes: Option<String>,
}

// --- Streaks ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreakInfo {
    pub current_streak: i64,
    pub longest_streak: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_logged_date: Option<String>,
    pub total_days_logged: i64,
}

// --- Coach ---

#[derive(Debug, Clone, Serialize)]
pub struct CoachMessage {
    pub id: i64,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

// --- Validation ---

pub const MEAL_TYPES: &[&str] = &["breakfast", "lunch", "dinner", "snack"];
pub const EXERCISE_CATEGORIES: &[&str] = &["cardio", "strength", "flexibility", "sports", "other"];
pub const INTENSITIES: &[&str] = &["low", "moderate", "high"];

pub fn validate_meal_type(meal: &str) -> Result<String> {
    let lower = meal.to_lowercase();
    if MEAL_TYPES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        bail!(
            "Invalid meal type '{meal}'. Must be one of: {}",
            MEAL_TYPES.join(", ")
        )
    }
}

pub fn validate_category(category: &str) -> Result<String> {
    let lower = category.to_lowercase();
    if EXERCISE_CATEGORIES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        bail!(
            "Invalid category '{category}'. Must be one of: {}",
            EXERCISE_CATEGORIES.join(", ")
        )
    }
}

pub fn validate_intensity(intensity: &str) -> Result<String> {
    let lower = intensity.to_lowercase();
    if INTENSITIES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        bail!(
            "Invalid intensity '{intensity}'. Must be one of: {}",
            INTENSITIES.join(", ")
        )
    }
}

pub fn validate_username(username: &str) -> Result<String> {
    let trimmed = username.trim();
    let len = trimmed.chars().count();
    if !(3..=32).contains(&len) {
        bail!("Username must be between 3 and 32 characters");
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("Username may only contain letters, digits and underscores");
    }
    Ok(trimmed.to_string())
}

/// Returns the lower-cased email.
pub fn validate_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    let Some((local, domain)) = email.split_once('@') else {
        bail!("Invalid email address '{email}'");
    };
    if local.is_empty()
        || domain.contains('@')
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || email.chars().any(char::is_whitespace)
    {
        bail!("Invalid email address '{email}'");
    }
    Ok(email)
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < 8 {
        bail!("Password must be at least 8 characters");
    }
    Ok(())
}

pub fn validate_profile(profile: &Profile, today: NaiveDate) -> Result<()> {
    if let Some(h) = profile.height_cm {
        if !(50.0..=300.0).contains(&h) {
            bail!("height_cm must be between 50 and 300");
        }
    }
    if let Some(w) = profile.weight_kg {
        if !(20.0..=500.0).contains(&w) {
            bail!("weight_kg must be between 20 and 500");
        }
    }
    if let Some(birth) = profile.birth_date {
        if birth >= today {
            bail!("birth_date must be in the past");
        }
        if profile.age_on(today).is_some_and(|age| age > 120) {
            bail!("birth_date is too far in the past");
        }
    }
    Ok(())
}

pub fn validate_new_food(food: &NewFood) -> Result<()> {
    if food.name.trim().is_empty() {
        bail!("name must not be empty");
    }
    if food.calories_per_100g < 0.0 {
        bail!("calories_per_100g must not be negative");
    }
    if food.protein_per_100g.is_some_and(|v| v < 0.0) {
        bail!("protein_per_100g must not be negative");
    }
    if food.carbs_per_100g.is_some_and(|v| v < 0.0) {
        bail!("carbs_per_100g must not be negative");
    }
    if food.fat_per_100g.is_some_and(|v| v < 0.0) {
        bail!("fat_per_100g must not be negative");
    }
    if food.default_serving_g.is_some_and(|v| v <= 0.0) {
        bail!("default_serving_g must be greater than 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_valid_meal_types() {
        assert_eq!(validate_meal_type("breakfast").unwrap(), "breakfast");
        assert_eq!(validate_meal_type("Lunch").unwrap(), "lunch");
        assert!(validate_meal_type("brunch").is_err());
        assert!(validate_meal_type("").is_err());
    }

    #[test]
    fn test_validate_username() {
        assert_eq!(validate_username("  jane_doe ").unwrap(), "jane_doe");
        assert!(validate_username("ab").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("dash-name").is_err());
        assert!(validate_username(&"x".repeat(33)).is_err());
    }

    #[test]
    fn test_validate_email_normalizes() {
        assert_eq!(
            validate_email(" Jane@Example.COM ").unwrap(),
            "jane@example.com"
        );
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("a@b").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("a@@example.com").is_err());
        assert!(validate_email("a@example.").is_err());
    }

    #[test]
    fn test_validate_password_length() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("longenough").is_ok());
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(Sex::parse("F").unwrap(), Sex::Female);
        assert_eq!(
            ActivityLevel::parse("very-active").unwrap(),
            ActivityLevel::VeryActive
        );
        assert_eq!(WeightGoal::parse("Lose").unwrap(), WeightGoal::Lose);
        assert!(ActivityLevel::parse("couch").is_err());
    }

    #[test]
    fn test_age_on_before_and_after_birthday() {
        let profile = Profile {
            birth_date: Some(date(1990, 6, 15)),
            ..Profile::default()
        };
        assert_eq!(profile.age_on(date(2024, 6, 14)), Some(33));
        assert_eq!(profile.age_on(date(2024, 6, 15)), Some(34));
        assert_eq!(Profile::default().age_on(date(2024, 6, 15)), None);
    }

    #[test]
    fn test_validate_profile_bounds() {
        let today = date(2024, 6, 15);
        let mut profile = Profile {
            height_cm: Some(175.0),
            weight_kg: Some(70.0),
            birth_date: Some(date(1990, 1, 1)),
            ..Profile::default()
        };
        assert!(validate_profile(&profile, today).is_ok());

        profile.height_cm = Some(10.0);
        assert!(validate_profile(&profile, today).is_err());

        profile.height_cm = Some(175.0);
        profile.birth_date = Some(date(2025, 1, 1));
        assert!(validate_profile(&profile, today).is_err());
    }

    #[test]
    fn test_profile_deserializes_with_defaults() {
        let profile: Profile =
            serde_json::from_str(r#"{"height_cm": 180, "activity_level": "very_active"}"#)
                .unwrap();
        assert_eq!(profile.sex, Sex::Unspecified);
        assert_eq!(profile.activity_level, ActivityLevel::VeryActive);
        assert_eq!(profile.weight_goal, WeightGoal::Maintain);
        assert_eq!(profile.height_cm, Some(180.0));
    }

    #[test]
    fn test_food_serving_default() {
        let food = Food {
            id: 1,
            name: "Oats".to_string(),
            brand: None,
            barcode: None,
            calories_per_100g: 389.0,
            protein_per_100g: Some(13.0),
            carbs_per_100g: None,
            fat_per_100g: None,
            default_serving_g: None,
            source: "manual".to_string(),
            owner: None,
            created_at: String::new(),
        };
        assert!((food.serving_or_default() - 100.0).abs() < f64::EPSILON);
        assert!((food.calories_for(40.0) - 155.6).abs() < 0.01);
    }
}
