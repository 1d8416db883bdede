use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Args;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use nourish_core::auth::hash_password;
use nourish_core::calc::compute_daily_goal;
use nourish_core::db::Database;
use nourish_core::models::{
    ActivityLevel, NewUser, Profile, Sex, WeightGoal, validate_email, validate_password,
    validate_profile, validate_username,
};

use super::helpers::{fmt_opt, prompt_line, truncate};

/// Body profile used to compute the starting calorie goal.
#[derive(Args, Debug, Default)]
pub(crate) struct ProfileArgs {
    /// male, female or unspecified
    #[arg(long)]
    sex: Option<String>,
    /// Birth date (YYYY-MM-DD)
    #[arg(long)]
    birth_date: Option<String>,
    /// Height in cm
    #[arg(long)]
    height: Option<f64>,
    /// Weight in kg
    #[arg(long)]
    weight: Option<f64>,
    /// sedentary, light, moderate, active, very_active
    #[arg(long)]
    activity: Option<String>,
    /// lose, maintain or gain
    #[arg(long)]
    goal: Option<String>,
}

impl ProfileArgs {
    fn into_profile(self) -> Result<Profile> {
        Ok(Profile {
            sex: self.sex.as_deref().map(Sex::parse).transpose()?.unwrap_or_default(),
            birth_date: self
                .birth_date
                .as_deref()
                .map(nourish_core::models::parse_date)
                .transpose()?,
            height_cm: self.height,
            weight_kg: self.weight,
            activity_level: self
                .activity
                .as_deref()
                .map(ActivityLevel::parse)
                .transpose()?
                .unwrap_or_default(),
            weight_goal: self
                .goal
                .as_deref()
                .map(WeightGoal::parse)
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

pub(crate) fn cmd_user_create(
    db: &Database,
    username: &str,
    email: &str,
    password: Option<String>,
    profile: ProfileArgs,
    json: bool,
) -> Result<()> {
    let today = Local::now().date_naive();
    let username = validate_username(username)?;
    let email = validate_email(email)?;
    let profile = profile.into_profile()?;
    validate_profile(&profile, today)?;

    if db.get_user(&username)?.is_some() {
        bail!("Username '{username}' is already taken");
    }
    if db.get_user_by_email(&email)?.is_some() {
        bail!("Email address '{email}' is already registered");
    }

    let password = match password {
        Some(p) => p,
        None => prompt_line("Password")?,
    };
    validate_password(&password)?;

    let daily_calorie_goal = compute_daily_goal(&profile, today);
    let user = db
        .create_user(
            &NewUser {
                username,
                email,
                password_hash: hash_password(&password)?,
                profile,
                daily_calorie_goal,
            },
            today,
        )
        .context("failed to create user")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&user)?);
    } else {
        println!(
            "Created user '{}' <{}> with a daily goal of {} kcal",
            user.username, user.email, user.daily_calorie_goal
        );
    }
    Ok(())
}

pub(crate) fn cmd_user_list(db: &Database, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct UserRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Username")]
        username: String,
        #[tabled(rename = "Email")]
        email: String,
        #[tabled(rename = "Weight (kg)")]
        weight: String,
        #[tabled(rename = "Goal (kcal)")]
        goal: i64,
        #[tabled(rename = "Since")]
        since: String,
    }

    let users = db.list_users()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&users)?);
        return Ok(());
    }
    if users.is_empty() {
        println!("No users yet. Create one with `nourish user create`.");
        return Ok(());
    }

    let rows: Vec<UserRow> = users
        .iter()
        .map(|u| UserRow {
            id: u.id,
            username: u.username.clone(),
            email: truncate(&u.email, 30),
            weight: fmt_opt(u.profile.weight_kg),
            goal: u.daily_calorie_goal,
            since: u.created_at.chars().take(10).collect(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..5)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_user_delete(db: &Database, username: &str, json: bool) -> Result<()> {
    if !db.delete_user(username)? {
        bail!("User '{username}' not found");
    }
    if json {
        println!("{}", serde_json::json!({ "deleted": username }));
    } else {
        println!("Deleted user '{username}' and all of their data");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_args() -> ProfileArgs {
        ProfileArgs {
            sex: Some("f".to_string()),
            birth_date: Some("1990-05-01".to_string()),
            height: Some(165.0),
            weight: Some(60.0),
            activity: Some("light".to_string()),
            goal: Some("lose".to_string()),
        }
    }

    #[test]
    fn test_profile_args_parse() {
        let profile = profile_args().into_profile().unwrap();
        assert_eq!(profile.sex, Sex::Female);
        assert_eq!(profile.activity_level, ActivityLevel::Light);
        assert_eq!(profile.weight_goal, WeightGoal::Lose);
        assert_eq!(profile.height_cm, Some(165.0));

        let bad = ProfileArgs {
            activity: Some("couch".to_string()),
            ..ProfileArgs::default()
        };
        assert!(bad.into_profile().is_err());
    }

    #[test]
    fn test_create_list_delete() {
        let db = Database::open_in_memory().unwrap();
        cmd_user_create(
            &db,
            "alice",
            "alice@example.com",
            Some("password123".to_string()),
            profile_args(),
            false,
        )
        .unwrap();

        let user = db.get_user("alice").unwrap().unwrap();
        assert_ne!(user.daily_calorie_goal, 0);
        assert_eq!(db.goal_history("alice").unwrap().len(), 1);

        let dup = cmd_user_create(
            &db,
            "alice",
            "other@example.com",
            Some("password123".to_string()),
            ProfileArgs::default(),
            false,
        );
        assert!(dup.unwrap_err().to_string().contains("already taken"));

        cmd_user_list(&db, true).unwrap();
        cmd_user_delete(&db, "alice", false).unwrap();
        assert!(db.get_user("alice").unwrap().is_none());
        assert!(cmd_user_delete(&db, "alice", false).is_err());
    }

    #[test]
    fn test_create_rejects_short_password() {
        let db = Database::open_in_memory().unwrap();
        let err = cmd_user_create(
            &db,
            "bob",
            "bob@example.com",
            Some("short".to_string()),
            ProfileArgs::default(),
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least 8"));
        assert!(db.get_user("bob").unwrap().is_none());
    }
}
