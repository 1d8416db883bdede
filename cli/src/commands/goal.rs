use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use nourish_core::db::Database;
use nourish_core::models::format_date;

use super::helpers::parse_date;

pub(crate) fn cmd_goal_history(db: &Database, username: &str, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct GoalRow {
        #[tabled(rename = "Effective")]
        date: String,
        #[tabled(rename = "Daily goal (kcal)")]
        goal: i64,
        #[tabled(rename = "Change")]
        change: String,
    }

    if db.get_user(username)?.is_none() {
        bail!("User '{username}' not found");
    }
    let history = db.goal_history(username)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    let mut previous: Option<i64> = None;
    let rows: Vec<GoalRow> = history
        .iter()
        .map(|h| {
            let change = previous.map_or_else(String::new, |p| format!("{:+}", h.daily_calorie_goal - p));
            previous = Some(h.daily_calorie_goal);
            GoalRow {
                date: h.date.clone(),
                goal: h.daily_calorie_goal,
                change,
            }
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_goal_show(
    db: &Database,
    username: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    if db.get_user(username)?.is_none() {
        bail!("User '{username}' not found");
    }
    let date = parse_date(date)?;
    let goal = db.goal_on(username, date)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "date": format_date(date), "daily_calorie_goal": goal })
        );
    } else {
        println!("{username}'s goal on {}: {goal} kcal", format_date(date));
    }
    Ok(())
}
