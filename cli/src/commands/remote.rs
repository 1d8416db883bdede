use anyhow::{Context, Result, bail};
use serde::Deserialize;

use nourish_core::models::format_date;

use crate::remote::RemoteClient;

use super::helpers::{fmt_remaining, parse_date};

/// The subset of a daily summary the CLI prints.
#[derive(Debug, Deserialize)]
struct RemoteSummary {
    date: String,
    goal: i64,
    consumed: f64,
    burned: f64,
    remaining: f64,
    #[serde(default)]
    meals: Vec<serde_json::Value>,
    #[serde(default)]
    exercises: Vec<serde_json::Value>,
}

pub(crate) async fn cmd_remote_status(url: &str, json: bool) -> Result<()> {
    let client = RemoteClient::new(url, None).context("failed to build HTTP client")?;
    let online = client.is_online().await;

    if json {
        println!("{}", serde_json::json!({ "url": url, "online": online }));
    } else if online {
        println!("{url} is online");
    } else {
        println!("{url} is unreachable");
    }
    if !online {
        std::process::exit(2);
    }
    Ok(())
}

pub(crate) async fn cmd_remote_summary(
    url: &str,
    token: Option<String>,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
        bail!("A session token is required (--token)");
    };
    let date = format_date(parse_date(date)?);
    let client = RemoteClient::new(url, Some(token)).context("failed to build HTTP client")?;
    let path = format!("/progress/daily-summary?date={date}");

    if json {
        let value: serde_json::Value = client.get(&path).await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let summary: RemoteSummary = client.get(&path).await?;
    println!("=== {} ({url}) ===", summary.date);
    println!(
        "  {} meal(s), {} exercise(s)",
        summary.meals.len(),
        summary.exercises.len()
    );
    println!("  EATEN: {:.0} kcal", summary.consumed);
    println!("  BURNED: {:.0} kcal", summary.burned);
    println!("  GOAL: {} kcal", summary.goal);
    println!("  REMAINING: {} kcal", fmt_remaining(summary.remaining));
    Ok(())
}
