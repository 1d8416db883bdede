//! Prompt construction for the AI coach, and the deterministic summary used
//! when no model is configured or the model call fails.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::models::{CoachMessage, StreakInfo};
use crate::progress::DailySummary;

/// Messages of prior conversation sent along with a new chat turn.
pub const CHAT_CONTEXT_LIMIT: i64 = 20;

const SYSTEM_PROMPT: &str = "You are a supportive nutrition and fitness coach. \
Use the user's logged data to give short, specific, practical advice. \
Never give medical diagnoses. Answer in at most three short paragraphs.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Unknown stored roles are treated as user text.
    #[must_use]
    pub fn from_stored(role: &str) -> Self {
        match role {
            "assistant" => Self::Assistant,
            "system" => Self::System,
            _ => Self::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }
}

/// Plain-text snapshot of the day fed to the model as context.
#[must_use]
pub fn day_context(summary: &DailySummary, streak: &StreakInfo) -> String {
    let t = &summary.totals;
    let mut out = String::new();
    let _ = writeln!(out, "Date: {}", summary.date);
    let _ = writeln!(out, "Daily goal: {} kcal", t.goal);
    let _ = writeln!(out, "Consumed: {:.0} kcal", t.consumed);
    let _ = writeln!(out, "Burned through exercise: {:.0} kcal", t.burned);
    let _ = writeln!(out, "Remaining: {:.0} kcal", t.remaining);
    let _ = writeln!(
        out,
        "Macros: protein {:.0} g, carbs {:.0} g, fat {:.0} g",
        summary.total_protein, summary.total_carbs, summary.total_fat
    );
    for meal in &summary.meals {
        let foods: Vec<&str> = meal.entries.iter().map(|e| e.food_name.as_str()).collect();
        let _ = writeln!(
            out,
            "{}: {:.0} kcal ({})",
            meal.meal_type,
            meal.subtotal_calories,
            foods.join(", ")
        );
    }
    for ex in &summary.exercises {
        let _ = writeln!(
            out,
            "Exercise: {} for {:.0} min, {:.0} kcal",
            ex.exercise_name, ex.duration_min, ex.calories_burned
        );
    }
    let _ = writeln!(
        out,
        "Logging streak: {} days (longest {})",
        streak.current_streak, streak.longest_streak
    );
    out
}

#[must_use]
pub fn daily_summary_prompt(summary: &DailySummary, streak: &StreakInfo) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Here is my day:\n{}\nSummarize how the day went and suggest one thing to do next.",
            day_context(summary, streak)
        )),
    ]
}

/// System prompt with today's context, prior transcript, then the new message.
#[must_use]
pub fn chat_prompt(
    summary: &DailySummary,
    streak: &StreakInfo,
    history: &[CoachMessage],
    message: &str,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(format!(
        "{SYSTEM_PROMPT}\n\nToday's data:\n{}",
        day_context(summary, streak)
    ))];
    let skip = history.len().saturating_sub(CHAT_CONTEXT_LIMIT as usize);
    messages.extend(
        history
            .iter()
            .skip(skip)
            .map(|m| ChatMessage::new(MessageRole::from_stored(&m.role), m.content.clone())),
    );
    messages.push(ChatMessage::user(message));
    messages
}

#[must_use]
pub fn fallback_daily_summary(summary: &DailySummary, streak: &StreakInfo) -> String {
    let t = &summary.totals;
    if summary.meals.is_empty() && summary.exercises.is_empty() {
        return format!(
            "Nothing logged for {} yet. Your goal is {} kcal; log a meal to get started.",
            summary.date, t.goal
        );
    }

    let mut text = format!(
        "On {} you ate {:.0} kcal and burned {:.0} kcal against a goal of {} kcal. ",
        summary.date, t.consumed, t.burned, t.goal
    );
    if t.over_goal {
        let _ = write!(text, "You are {:.0} kcal over your goal.", -t.remaining);
    } else {
        let _ = write!(text, "You have {:.0} kcal remaining.", t.remaining);
    }
    if streak.current_streak > 1 {
        let _ = write!(
            text,
            " You have logged {} days in a row, keep it going!",
            streak.current_streak
        );
    }
    text
}
