use anyhow::{Result, bail};
use chrono::Local;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use nourish_core::db::Database;
use nourish_core::progress::{ProgressReport, build_report, month_range, week_range};

use super::helpers::{fmt_remaining, no_neg_zero, parse_date};

pub(crate) fn cmd_progress_weekly(
    db: &Database,
    username: &str,
    end: Option<String>,
    json: bool,
) -> Result<()> {
    if db.get_user(username)?.is_none() {
        bail!("User '{username}' not found");
    }
    let (start, end) = week_range(parse_date(end)?);
    let report = build_report("weekly", start, end, db.day_totals(username, start, end)?, false);
    print_report(&report, json)
}

pub(crate) fn cmd_progress_monthly(
    db: &Database,
    username: &str,
    month: Option<String>,
    json: bool,
) -> Result<()> {
    if db.get_user(username)?.is_none() {
        bail!("User '{username}' not found");
    }
    let month = month.unwrap_or_else(|| Local::now().format("%Y-%m").to_string());
    let (start, end) = month_range(&month)?;
    let report = build_report("monthly", start, end, db.day_totals(username, start, end)?, true);
    print_report(&report, json)
}

#[derive(Tabled)]
struct DayRow {
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "Eaten")]
    consumed: String,
    #[tabled(rename = "Burned")]
    burned: String,
    #[tabled(rename = "Goal")]
    goal: i64,
    #[tabled(rename = "Remaining")]
    remaining: String,
}

fn report_rows(report: &ProgressReport) -> (Vec<DayRow>, Vec<DayRow>) {
    let days = report
        .days
        .iter()
        .map(|d| DayRow {
            date: d.date.format("%a %Y-%m-%d").to_string(),
            consumed: format!("{:.0}", no_neg_zero(d.totals.consumed)),
            burned: format!("{:.0}", no_neg_zero(d.totals.burned)),
            goal: d.totals.goal,
            remaining: fmt_remaining(d.totals.remaining),
        })
        .collect();
    let weeks = report
        .weeks
        .iter()
        .map(|w| DayRow {
            date: format!("week of {}", w.week_start.format("%Y-%m-%d")),
            consumed: format!("{:.0}", no_neg_zero(w.totals.consumed)),
            burned: format!("{:.0}", no_neg_zero(w.totals.burned)),
            goal: w.totals.goal,
            remaining: fmt_remaining(w.totals.remaining),
        })
        .collect();
    (days, weeks)
}

fn print_report(report: &ProgressReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "=== {} {} to {} ===\n",
        report.period,
        report.start.format("%Y-%m-%d"),
        report.end.format("%Y-%m-%d")
    );

    let (days, weeks) = report_rows(report);
    let table = |rows: &[DayRow]| {
        Table::new(rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
            .to_string()
    };
    println!("{}", table(&days));
    if !weeks.is_empty() {
        println!("\n{}", table(&weeks));
    }

    let t = &report.totals;
    println!(
        "\n  Logged {} of {} days, averaging {:.0} kcal eaten",
        report.days_logged,
        report.days.len(),
        no_neg_zero(report.average_consumed)
    );
    println!(
        "  TOTAL: {:.0} eaten, {:.0} burned, goal {}, remaining {}",
        t.consumed,
        t.burned,
        t.goal,
        fmt_remaining(t.remaining)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use nourish_core::models::{NewUser, Profile};

    fn db_with_user() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user(
            &NewUser {
                username: "alice".to_string(),
                email: "alice@example.com".to_string(),
                password_hash: "x".to_string(),
                profile: Profile::default(),
                daily_calorie_goal: 1800,
            },
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )
        .unwrap();
        db
    }

    #[test]
    fn test_monthly_rows_include_weeks() {
        let db = db_with_user();
        let (start, end) = month_range("2024-02").unwrap();
        let report = build_report("monthly", start, end, db.day_totals("alice", start, end).unwrap(), true);
        let (days, weeks) = report_rows(&report);
        assert_eq!(days.len(), 29);
        // Feb 2024 starts on a Thursday: weeks of Jan 29, Feb 5, 12, 19, 26.
        assert_eq!(weeks.len(), 5);
        assert_eq!(weeks[0].date, "week of 2024-01-29");
        assert_eq!(days[0].goal, 1800);
        assert_eq!(days[0].remaining, "1800");
    }

    #[test]
    fn test_commands_validate_input() {
        let db = db_with_user();
        assert!(cmd_progress_monthly(&db, "alice", Some("2024-13".to_string()), true).is_err());
        assert!(cmd_progress_weekly(&db, "ghost", None, true).is_err());
        cmd_progress_weekly(&db, "alice", Some("2024-03-10".to_string()), true).unwrap();
    }
}
