use std::fmt::Write as _;
use std::process;

use anyhow::{Result, bail};
use chrono::Local;

use nourish_core::db::Database;
use nourish_core::models::StreakInfo;
use nourish_core::progress::DailySummary;

use super::helpers::{fmt_remaining, no_neg_zero, parse_date};

pub(crate) fn cmd_summary(
    db: &Database,
    username: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    if db.get_user(username)?.is_none() {
        bail!("User '{username}' not found");
    }
    let date = parse_date(date)?;
    let summary = db.build_daily_summary(username, date)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if summary.meals.is_empty() && summary.exercises.is_empty() {
        let date = &summary.date;
        eprintln!("No entries for {username} on {date}");
        process::exit(2);
    }

    let streak = db.streak(username, Local::now().date_naive())?;
    print!("{}", render_summary(&summary, &streak));
    Ok(())
}

fn render_summary(summary: &DailySummary, streak: &StreakInfo) -> String {
    let mut out = String::new();
    let date = &summary.date;
    let _ = writeln!(out, "=== {date} ===\n");

    for meal in &summary.meals {
        let meal_label = meal.meal_type.to_uppercase();
        let sub_cal = meal.subtotal_calories;
        let _ = writeln!(out, "  {meal_label} ({sub_cal:.0} kcal)");
        for e in &meal.entries {
            let brand = e
                .food_brand
                .as_ref()
                .map(|b| format!(" ({b})"))
                .unwrap_or_default();
            let protein = e.protein.unwrap_or(0.0);
            let carbs = e.carbs.unwrap_or(0.0);
            let fat = e.fat.unwrap_or(0.0);
            let _ = writeln!(
                out,
                "    [{}] {}{brand}, {:.0}g: {:.0} kcal | P:{protein:.0}g C:{carbs:.0}g F:{fat:.0}g",
                e.id, e.food_name, e.serving_g, e.calories
            );
        }
        out.push('\n');
    }

    if !summary.exercises.is_empty() {
        let _ = writeln!(out, "  EXERCISE");
        for e in &summary.exercises {
            let _ = writeln!(
                out,
                "    [{}] {}, {:.0} min: {:.0} kcal",
                e.id, e.exercise_name, e.duration_min, e.calories_burned
            );
        }
        out.push('\n');
    }

    let t = &summary.totals;
    let p = no_neg_zero(summary.total_protein);
    let c = no_neg_zero(summary.total_carbs);
    let f = no_neg_zero(summary.total_fat);
    let _ = writeln!(
        out,
        "  EATEN: {:.0} kcal | P:{p:.0}g C:{c:.0}g F:{f:.0}g",
        t.consumed
    );
    let _ = writeln!(out, "  BURNED: {:.0} kcal", t.burned);
    let _ = writeln!(out, "  GOAL: {} kcal", t.goal);
    let _ = writeln!(out, "  REMAINING: {} kcal", fmt_remaining(t.remaining));
    if streak.current_streak > 0 {
        let _ = writeln!(out, "  STREAK: {} day(s)", streak.current_streak);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use nourish_core::models::{NewFood, NewFoodLog, NewUser, Profile};

    #[test]
    fn test_render_summary_with_entries() {
        let db = Database::open_in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        db.create_user(
            &NewUser {
                username: "alice".to_string(),
                email: "alice@example.com".to_string(),
                password_hash: "x".to_string(),
                profile: Profile::default(),
                daily_calorie_goal: 2000,
            },
            date,
        )
        .unwrap();
        let food = db
            .insert_food(&NewFood {
                name: "Pizza".to_string(),
                brand: Some("Mario's".to_string()),
                barcode: None,
                calories_per_100g: 266.0,
                protein_per_100g: Some(11.0),
                carbs_per_100g: Some(33.0),
                fat_per_100g: Some(10.0),
                default_serving_g: None,
                source: "manual".to_string(),
            })
            .unwrap();
        for _ in 0..3 {
            db.insert_food_log(&NewFoodLog {
                user: "alice".to_string(),
                date,
                meal_type: "dinner".to_string(),
                food_id: food.id,
                serving_g: 300.0,
            })
            .unwrap();
        }

        let summary = db.build_daily_summary("alice", date).unwrap();
        let streak = db.streak("alice", date).unwrap();
        let text = render_summary(&summary, &streak);

        assert!(text.contains("=== 2024-06-01 ==="));
        assert!(text.contains("DINNER (2394 kcal)"));
        assert!(text.contains("Pizza (Mario's)"));
        assert!(text.contains("GOAL: 2000 kcal"));
        assert!(text.contains("REMAINING: -394 (over) kcal"));
        assert!(text.contains("STREAK: 1 day(s)"));
    }

    #[test]
    fn test_unknown_user_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        assert!(cmd_summary(&db, "ghost", None, true).is_err());
    }
}
