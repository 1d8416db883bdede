use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, SecondsFormat, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::calc::Remaining;
use crate::coach::MessageRole;
use crate::models::{
    ActivityLevel, CoachMessage, Exercise, ExerciseLogEntry, Food, FoodLogEntry,
    GoalHistoryEntry, NewExercise, NewExerciseLog, NewFood, NewFoodLog, NewUser, NewWeightEntry,
    Profile, Sex, StreakInfo, UpdateFoodLog, User, WeightEntry, WeightGoal, format_date,
    parse_date,
};
use crate::progress::{self, DailySums, DailySummary, DayTotals};

/// Built-in exercise catalog: name, category, intensity, MET.
const BUILTIN_EXERCISES: &[(&str, &str, &str, f64)] = &[
    ("Walking", "cardio", "low", 3.5),
    ("Brisk walking", "cardio", "moderate", 4.3),
    ("Running", "cardio", "high", 9.8),
    ("Cycling", "cardio", "moderate", 7.5),
    ("Swimming", "cardio", "high", 8.0),
    ("Jump rope", "cardio", "high", 12.3),
    ("Rowing", "cardio", "moderate", 7.0),
    ("Elliptical", "cardio", "moderate", 5.0),
    ("Weight training", "strength", "moderate", 5.0),
    ("Bodyweight circuit", "strength", "high", 8.0),
    ("Yoga", "flexibility", "low", 2.5),
    ("Pilates", "flexibility", "low", 3.0),
    ("Stretching", "flexibility", "low", 2.3),
    ("Basketball", "sports", "high", 6.5),
    ("Soccer", "sports", "high", 7.0),
    ("Tennis", "sports", "moderate", 7.3),
    ("Hiking", "other", "moderate", 6.0),
    ("Dancing", "other", "moderate", 5.0),
];

/// Candidate cap for food recommendations before ranking.
const RECOMMENDATION_CANDIDATES: i64 = 500;

const USER_COLUMNS: &str = "id, username, email, password_hash, sex, birth_date, height_cm, \
     weight_kg, activity_level, weight_goal, daily_calorie_goal, created_at, updated_at";

const FOOD_COLUMNS: &str = "id, name, brand, barcode, calories_per_100g, protein_per_100g, \
     carbs_per_100g, fat_per_100g, default_serving_g, source, owner, created_at";

const FOOD_LOG_SELECT: &str = "SELECT fl.id, fl.username, fl.date, fl.meal_type, fl.food_id, fl.serving_g,
            fl.created_at, fl.updated_at,
            f.name, f.brand, f.calories_per_100g, f.protein_per_100g, f.carbs_per_100g, f.fat_per_100g
     FROM food_logs fl
     JOIN foods f ON fl.food_id = f.id";

const EXERCISE_LOG_SELECT: &str = "SELECT el.id, el.username, el.date, el.exercise_id, e.name,
            el.duration_min, el.calories_burned, el.created_at
     FROM exercise_logs el
     JOIN exercises e ON el.exercise_id = e.id";

/// UTC, second precision, `Z` suffix. Lexicographic order matches time order.
fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    #[allow(clippy::too_many_lines)]
    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    email TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    sex TEXT NOT NULL DEFAULT 'unspecified',
                    birth_date TEXT,
                    height_cm REAL,
                    weight_kg REAL,
                    activity_level TEXT NOT NULL DEFAULT 'sedentary',
                    weight_goal TEXT NOT NULL DEFAULT 'maintain',
                    daily_calorie_goal INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token_hash TEXT PRIMARY KEY,
                    username TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE ON UPDATE CASCADE,
                    created_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS goal_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE ON UPDATE CASCADE,
                    date TEXT NOT NULL,
                    daily_calorie_goal INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS foods (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    brand TEXT,
                    barcode TEXT UNIQUE,
                    calories_per_100g REAL NOT NULL,
                    protein_per_100g REAL,
                    carbs_per_100g REAL,
                    fat_per_100g REAL,
                    default_serving_g REAL,
                    source TEXT NOT NULL,
                    owner TEXT REFERENCES users(username) ON DELETE CASCADE ON UPDATE CASCADE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS food_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE ON UPDATE CASCADE,
                    date TEXT NOT NULL,
                    meal_type TEXT NOT NULL,
                    food_id INTEGER NOT NULL REFERENCES foods(id) ON DELETE CASCADE,
                    serving_g REAL NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS exercises (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    category TEXT NOT NULL,
                    intensity TEXT NOT NULL,
                    met REAL,
                    calories_per_minute REAL,
                    owner TEXT REFERENCES users(username) ON DELETE CASCADE ON UPDATE CASCADE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS exercise_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE ON UPDATE CASCADE,
                    date TEXT NOT NULL,
                    exercise_id INTEGER NOT NULL REFERENCES exercises(id) ON DELETE CASCADE,
                    duration_min REAL NOT NULL,
                    calories_burned REAL NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS weight_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE ON UPDATE CASCADE,
                    date TEXT NOT NULL,
                    weight_kg REAL NOT NULL,
                    notes TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(username, date)
                );

                CREATE TABLE IF NOT EXISTS coach_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE ON UPDATE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_username ON sessions(username);
                CREATE INDEX IF NOT EXISTS idx_goal_history_user_date ON goal_history(username, date);
                CREATE INDEX IF NOT EXISTS idx_goal_history_user ON goal_history(username);
                CREATE INDEX IF NOT EXISTS idx_goal_history_date ON goal_history(date);
                CREATE INDEX IF NOT EXISTS idx_foods_barcode ON foods(barcode);
                CREATE INDEX IF NOT EXISTS idx_foods_name ON foods(name);
                CREATE INDEX IF NOT EXISTS idx_foods_owner ON foods(owner);
                CREATE INDEX IF NOT EXISTS idx_food_logs_user_date ON food_logs(username, date);
                CREATE INDEX IF NOT EXISTS idx_exercise_logs_user_date ON exercise_logs(username, date);
                CREATE INDEX IF NOT EXISTS idx_exercises_owner ON exercises(owner);
                CREATE INDEX IF NOT EXISTS idx_coach_messages_user ON coach_messages(username);

                PRAGMA user_version = 1;",
            )?;
            self.seed_exercises()?;
        }

        Ok(())
    }

    fn seed_exercises(&self) -> Result<()> {
        let now = now();
        let mut stmt = self.conn.prepare(
            "INSERT INTO exercises (name, category, intensity, met, calories_per_minute, owner, created_at)
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5)",
        )?;
        for (name, category, intensity, met) in BUILTIN_EXERCISES {
            stmt.execute(params![name, category, intensity, met, now])?;
        }
        Ok(())
    }

    // --- Row mapping helpers ---

    // Column order matches USER_COLUMNS.
    fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
        let sex: String = row.get(4)?;
        let birth_date: Option<String> = row.get(5)?;
        let activity_level: String = row.get(8)?;
        let weight_goal: String = row.get(9)?;
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            password_hash: row.get(3)?,
            profile: Profile {
                sex: Sex::parse(&sex).unwrap_or_default(),
                birth_date: birth_date.and_then(|d| parse_date(&d).ok()),
                height_cm: row.get(6)?,
                weight_kg: row.get(7)?,
                activity_level: ActivityLevel::parse(&activity_level).unwrap_or_default(),
                weight_goal: WeightGoal::parse(&weight_goal).unwrap_or_default(),
            },
            daily_calorie_goal: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn goal_from_row(row: &rusqlite::Row) -> rusqlite::Result<GoalHistoryEntry> {
        Ok(GoalHistoryEntry {
            id: row.get(0)?,
            user: row.get(1)?,
            date: row.get(2)?,
            daily_calorie_goal: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn food_from_row(row: &rusqlite::Row) -> rusqlite::Result<Food> {
        Ok(Food {
            id: row.get(0)?,
            name: row.get(1)?,
            brand: row.get(2)?,
            barcode: row.get(3)?,
            calories_per_100g: row.get(4)?,
            protein_per_100g: row.get(5)?,
            carbs_per_100g: row.get(6)?,
            fat_per_100g: row.get(7)?,
            default_serving_g: row.get(8)?,
            source: row.get(9)?,
            owner: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    // Expects FOOD_LOG_SELECT columns:
    // 0: fl.id, 1: fl.username, 2: fl.date, 3: fl.meal_type, 4: fl.food_id,
    // 5: fl.serving_g, 6: fl.created_at, 7: fl.updated_at,
    // 8: f.name, 9: f.brand, 10: f.calories_per_100g, 11: f.protein_per_100g,
    // 12: f.carbs_per_100g, 13: f.fat_per_100g
    fn food_log_from_row(row: &rusqlite::Row) -> rusqlite::Result<FoodLogEntry> {
        let serving_g: f64 = row.get(5)?;
        let cal_100: f64 = row.get(10)?;
        let pro_100: Option<f64> = row.get(11)?;
        let carb_100: Option<f64> = row.get(12)?;
        let fat_100: Option<f64> = row.get(13)?;
        Ok(FoodLogEntry {
            id: row.get(0)?,
            user: row.get(1)?,
            date: row.get(2)?,
            meal_type: row.get(3)?,
            food_id: row.get(4)?,
            serving_g,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            food_name: row.get(8)?,
            food_brand: row.get(9)?,
            calories: cal_100 * serving_g / 100.0,
            protein: pro_100.map(|v| v * serving_g / 100.0),
            carbs: carb_100.map(|v| v * serving_g / 100.0),
            fat: fat_100.map(|v| v * serving_g / 100.0),
        })
    }

    fn exercise_from_row(row: &rusqlite::Row) -> rusqlite::Result<Exercise> {
        Ok(Exercise {
            id: row.get(0)?,
            name: row.get(1)?,
            category: row.get(2)?,
            intensity: row.get(3)?,
            met: row.get(4)?,
            calories_per_minute: row.get(5)?,
            owner: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn exercise_log_from_row(row: &rusqlite::Row) -> rusqlite::Result<ExerciseLogEntry> {
        Ok(ExerciseLogEntry {
            id: row.get(0)?,
            user: row.get(1)?,
            date: row.get(2)?,
            exercise_id: row.get(3)?,
            exercise_name: row.get(4)?,
            duration_min: row.get(5)?,
            calories_burned: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn weight_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<WeightEntry> {
        let date_str: String = row.get(2)?;
        let date = parse_date(&date_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?;
        Ok(WeightEntry {
            id: row.get(0)?,
            user: row.get(1)?,
            date,
            weight_kg: row.get(3)?,
            notes: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    // --- Users ---

    /// Creates the account and records its starting goal effective `today`.
    pub fn create_user(&self, user: &NewUser, today: NaiveDate) -> Result<User> {
        let now = now();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO users (username, email, password_hash, sex, birth_date, height_cm, weight_kg,
                                activity_level, weight_goal, daily_calorie_goal, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                user.username,
                user.email,
                user.password_hash,
                user.profile.sex.as_str(),
                user.profile.birth_date.map(format_date),
                user.profile.height_cm,
                user.profile.weight_kg,
                user.profile.activity_level.as_str(),
                user.profile.weight_goal.as_str(),
                user.daily_calorie_goal,
                now,
                now,
            ],
        )?;
        tx.execute(
            "INSERT INTO goal_history (username, date, daily_calorie_goal, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user.username, format_date(today), user.daily_calorie_goal, now],
        )?;
        tx.commit()?;
        tracing::info!(username = %user.username, goal = user.daily_calorie_goal, "user created");
        self.get_user(&user.username)?
            .context("User not found after insert")
    }

    pub fn get_user(&self, username: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                Self::user_from_row,
            )
            .optional()
            .context("Failed to load user")
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
                Self::user_from_row,
            )
            .optional()
            .context("Failed to load user")
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY username"))?;
        let users = stmt
            .query_map([], Self::user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn update_email(&self, username: &str, email: &str) -> Result<User> {
        let rows = self.conn.execute(
            "UPDATE users SET email = ?1, updated_at = ?2 WHERE username = ?3",
            params![email, now(), username],
        )?;
        if rows == 0 {
            bail!("User not found");
        }
        self.get_user(username)?.context("User not found")
    }

    pub fn update_password_hash(&self, username: &str, password_hash: &str) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE username = ?3",
            params![password_hash, now(), username],
        )?;
        if rows == 0 {
            bail!("User not found");
        }
        Ok(())
    }

    /// Stores the profile. When `goal` differs from the current goal it is applied and
    /// recorded in the goal history as of `effective`.
    pub fn update_profile(
        &self,
        username: &str,
        profile: &Profile,
        goal: i64,
        effective: NaiveDate,
    ) -> Result<User> {
        let current = self.get_user(username)?.context("User not found")?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE users SET sex = ?1, birth_date = ?2, height_cm = ?3, weight_kg = ?4,
                              activity_level = ?5, weight_goal = ?6, updated_at = ?7
             WHERE username = ?8",
            params![
                profile.sex.as_str(),
                profile.birth_date.map(format_date),
                profile.height_cm,
                profile.weight_kg,
                profile.activity_level.as_str(),
                profile.weight_goal.as_str(),
                now(),
                username,
            ],
        )?;
        if goal != current.daily_calorie_goal {
            self.apply_goal(username, goal, effective)?;
        }
        tx.commit()?;
        self.get_user(username)?.context("User not found")
    }

    /// Manual goal change. Returns the new history row, or `None` if the goal is unchanged.
    pub fn set_daily_goal(
        &self,
        username: &str,
        goal: i64,
        effective: NaiveDate,
    ) -> Result<Option<GoalHistoryEntry>> {
        let current = self.get_user(username)?.context("User not found")?;
        if goal == current.daily_calorie_goal {
            return Ok(None);
        }
        let tx = self.conn.unchecked_transaction()?;
        let entry = self.apply_goal(username, goal, effective)?;
        tx.commit()?;
        Ok(Some(entry))
    }

    fn apply_goal(&self, username: &str, goal: i64, effective: NaiveDate) -> Result<GoalHistoryEntry> {
        let entry = self.append_goal(username, effective, goal)?;
        self.conn.execute(
            "UPDATE users SET daily_calorie_goal = ?1, updated_at = ?2 WHERE username = ?3",
            params![goal, now(), username],
        )?;
        tracing::info!(%username, goal, date = %entry.date, "daily goal changed");
        Ok(entry)
    }

    /// Deletes the account and, by cascade, every row attributed to it.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM users WHERE username = ?1", params![username])?;
        if rows > 0 {
            tracing::info!(%username, "user deleted");
        }
        Ok(rows > 0)
    }

    // --- Sessions ---

    /// Stores a session expiring `ttl_days` from now. Returns the expiry timestamp.
    pub fn create_session(&self, token_hash: &str, username: &str, ttl_days: i64) -> Result<String> {
        if ttl_days < 1 {
            bail!("Session lifetime must be at least one day, got {ttl_days}");
        }
        let created = Utc::now();
        let expires_at = TimeDelta::try_days(ttl_days)
            .and_then(|ttl| created.checked_add_signed(ttl))
            .with_context(|| format!("Session lifetime of {ttl_days} days is out of range"))?
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        self.conn.execute(
            "INSERT INTO sessions (token_hash, username, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                token_hash,
                username,
                created.to_rfc3339_opts(SecondsFormat::Secs, true),
                expires_at,
            ],
        )?;
        Ok(expires_at)
    }

    /// Username owning a live session, if any.
    pub fn session_user(&self, token_hash: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT username FROM sessions WHERE token_hash = ?1 AND expires_at > ?2",
                params![token_hash, now()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up session")
    }

    pub fn delete_session(&self, token_hash: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            params![token_hash],
        )?;
        Ok(rows > 0)
    }

    /// Revokes every session of `username` except `keep`.
    pub fn delete_other_sessions(&self, username: &str, keep: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM sessions WHERE username = ?1 AND token_hash != ?2",
            params![username, keep],
        )?;
        Ok(rows)
    }

    pub fn purge_expired_sessions(&self) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now()])?;
        Ok(rows)
    }

    // --- Goal history ---

    pub fn latest_goal_date(&self, username: &str) -> Result<Option<NaiveDate>> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(date) FROM goal_history WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )?;
        latest.map(|d| parse_date(&d)).transpose()
    }

    /// Appends a history row. Rejects dates earlier than the user's latest row.
    pub fn append_goal(&self, username: &str, date: NaiveDate, goal: i64) -> Result<GoalHistoryEntry> {
        if let Some(latest) = self.latest_goal_date(username)? {
            if date < latest {
                bail!(
                    "Goal date {} is earlier than the latest goal change ({})",
                    format_date(date),
                    format_date(latest)
                );
            }
        }
        self.conn.execute(
            "INSERT INTO goal_history (username, date, daily_calorie_goal, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![username, format_date(date), goal, now()],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, username, date, daily_calorie_goal, created_at FROM goal_history WHERE id = ?1",
                params![id],
                Self::goal_from_row,
            )
            .context("Goal history entry not found after insert")
    }

    /// Goal in effect on `date`; the user's current goal when no history row applies.
    pub fn goal_on(&self, username: &str, date: NaiveDate) -> Result<i64> {
        let from_history: Option<i64> = self
            .conn
            .query_row(
                "SELECT daily_calorie_goal FROM goal_history
                 WHERE username = ?1 AND date <= ?2
                 ORDER BY date DESC, id DESC
                 LIMIT 1",
                params![username, format_date(date)],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(goal) = from_history {
            return Ok(goal);
        }
        let user = self.get_user(username)?.context("User not found")?;
        Ok(user.daily_calorie_goal)
    }

    pub fn goal_history(&self, username: &str) -> Result<Vec<GoalHistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, username, date, daily_calorie_goal, created_at FROM goal_history
             WHERE username = ?1 ORDER BY date, id",
        )?;
        let entries = stmt
            .query_map(params![username], Self::goal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // --- Foods ---

    /// Adds a shared catalogue food.
    pub fn insert_food(&self, food: &NewFood) -> Result<Food> {
        self.insert_food_owned(food, None)
    }

    /// Adds a food only `owner` can see, search or log.
    pub fn insert_private_food(&self, food: &NewFood, owner: &str) -> Result<Food> {
        self.insert_food_owned(food, Some(owner))
    }

    fn insert_food_owned(&self, food: &NewFood, owner: Option<&str>) -> Result<Food> {
        self.conn.execute(
            "INSERT INTO foods (name, brand, barcode, calories_per_100g, protein_per_100g, carbs_per_100g, fat_per_100g, default_serving_g, source, owner, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                food.name,
                food.brand,
                food.barcode,
                food.calories_per_100g,
                food.protein_per_100g,
                food.carbs_per_100g,
                food.fat_per_100g,
                food.default_serving_g,
                food.source,
                owner,
                now(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_food_by_id(id)
    }

    pub fn upsert_food_by_barcode(&self, food: &NewFood) -> Result<Food> {
        if let Some(barcode) = &food.barcode {
            if let Some(existing) = self.get_food_by_barcode(barcode)? {
                return Ok(existing);
            }
        }
        self.insert_food(food)
    }

    pub fn get_food_by_id(&self, id: i64) -> Result<Food> {
        self.conn
            .query_row(
                &format!("SELECT {FOOD_COLUMNS} FROM foods WHERE id = ?1"),
                params![id],
                Self::food_from_row,
            )
            .context("Food not found")
    }

    /// The food if it is shared or owned by `username`.
    pub fn find_food(&self, username: &str, id: i64) -> Result<Option<Food>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {FOOD_COLUMNS} FROM foods WHERE id = ?1 AND (owner IS NULL OR owner = ?2)"
                ),
                params![id, username],
                Self::food_from_row,
            )
            .optional()
            .context("Failed to load food")
    }

    pub fn get_food_by_barcode(&self, barcode: &str) -> Result<Option<Food>> {
        self.conn
            .query_row(
                &format!("SELECT {FOOD_COLUMNS} FROM foods WHERE barcode = ?1 AND owner IS NULL"),
                params![barcode],
                Self::food_from_row,
            )
            .optional()
            .context("Failed to load food")
    }

    /// Name or brand match among the foods visible to `username`.
    pub fn search_foods_local(&self, username: &str, query: &str) -> Result<Vec<Food>> {
        let escaped = query
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{escaped}%");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FOOD_COLUMNS} FROM foods
             WHERE (name LIKE ?1 ESCAPE '\\' OR brand LIKE ?1 ESCAPE '\\')
               AND (owner IS NULL OR owner = ?2)
             ORDER BY name LIMIT 20"
        ))?;
        let foods = stmt
            .query_map(params![pattern, username], Self::food_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(foods)
    }

    /// Foods visible to `username` whose default serving (100 g when unset) is at most
    /// `max_kcal`.
    pub fn foods_within_serving_kcal(&self, username: &str, max_kcal: f64) -> Result<Vec<Food>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FOOD_COLUMNS} FROM foods
             WHERE calories_per_100g * COALESCE(NULLIF(default_serving_g, 0), 100.0) / 100.0 <= ?1
               AND (owner IS NULL OR owner = ?3)
             ORDER BY id
             LIMIT ?2"
        ))?;
        let foods = stmt
            .query_map(
                params![max_kcal, RECOMMENDATION_CANDIDATES, username],
                Self::food_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(foods)
    }

    // --- Food logs ---

    pub fn insert_food_log(&self, entry: &NewFoodLog) -> Result<FoodLogEntry> {
        let now = now();
        self.conn.execute(
            "INSERT INTO food_logs (username, date, meal_type, food_id, serving_g, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.user,
                format_date(entry.date),
                entry.meal_type,
                entry.food_id,
                entry.serving_g,
                now,
                now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_food_log(&entry.user, id)?
            .context("Food log not found after insert")
    }

    /// The entry if it exists and belongs to `username`.
    pub fn get_food_log(&self, username: &str, id: i64) -> Result<Option<FoodLogEntry>> {
        self.conn
            .query_row(
                &format!("{FOOD_LOG_SELECT} WHERE fl.id = ?1 AND fl.username = ?2"),
                params![id, username],
                Self::food_log_from_row,
            )
            .optional()
            .context("Failed to load food log")
    }

    pub fn update_food_log(
        &self,
        username: &str,
        id: i64,
        update: &UpdateFoodLog,
    ) -> Result<Option<FoodLogEntry>> {
        if self.get_food_log(username, id)?.is_none() {
            return Ok(None);
        }

        let now = now();
        if let Some(serving_g) = update.serving_g {
            self.conn.execute(
                "UPDATE food_logs SET serving_g = ?1, updated_at = ?2 WHERE id = ?3",
                params![serving_g, now, id],
            )?;
        }
        if let Some(ref meal_type) = update.meal_type {
            self.conn.execute(
                "UPDATE food_logs SET meal_type = ?1, updated_at = ?2 WHERE id = ?3",
                params![meal_type, now, id],
            )?;
        }
        if let Some(date) = update.date {
            self.conn.execute(
                "UPDATE food_logs SET date = ?1, updated_at = ?2 WHERE id = ?3",
                params![format_date(date), now, id],
            )?;
        }

        self.get_food_log(username, id)
    }

    pub fn delete_food_log(&self, username: &str, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM food_logs WHERE id = ?1 AND username = ?2",
            params![id, username],
        )?;
        Ok(rows > 0)
    }

    pub fn food_logs_for_date(&self, username: &str, date: NaiveDate) -> Result<Vec<FoodLogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "{FOOD_LOG_SELECT} WHERE fl.username = ?1 AND fl.date = ?2 ORDER BY fl.id"
        ))?;
        let entries = stmt
            .query_map(params![username, format_date(date)], Self::food_log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // --- Exercises ---

    /// Built-in exercises plus the custom ones owned by `username`.
    pub fn visible_exercises(&self, username: &str) -> Result<Vec<Exercise>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, category, intensity, met, calories_per_minute, owner, created_at
             FROM exercises WHERE owner IS NULL OR owner = ?1
             ORDER BY category, name",
        )?;
        let exercises = stmt
            .query_map(params![username], Self::exercise_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(exercises)
    }

    /// The exercise if it is a built-in or owned by `username`.
    pub fn get_exercise(&self, username: &str, id: i64) -> Result<Option<Exercise>> {
        self.conn
            .query_row(
                "SELECT id, name, category, intensity, met, calories_per_minute, owner, created_at
                 FROM exercises WHERE id = ?1 AND (owner IS NULL OR owner = ?2)",
                params![id, username],
                Self::exercise_from_row,
            )
            .optional()
            .context("Failed to load exercise")
    }

    /// Case-insensitive lookup among the exercises visible to `username`. Custom wins.
    pub fn find_exercise_by_name(&self, username: &str, name: &str) -> Result<Option<Exercise>> {
        self.conn
            .query_row(
                "SELECT id, name, category, intensity, met, calories_per_minute, owner, created_at
                 FROM exercises
                 WHERE lower(name) = lower(?1) AND (owner IS NULL OR owner = ?2)
                 ORDER BY owner IS NULL, id
                 LIMIT 1",
                params![name.trim(), username],
                Self::exercise_from_row,
            )
            .optional()
            .context("Failed to load exercise")
    }

    pub fn insert_exercise(&self, exercise: &NewExercise) -> Result<Exercise> {
        self.conn.execute(
            "INSERT INTO exercises (name, category, intensity, met, calories_per_minute, owner, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                exercise.name,
                exercise.category,
                exercise.intensity,
                exercise.met,
                exercise.calories_per_minute,
                exercise.owner,
                now(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, name, category, intensity, met, calories_per_minute, owner, created_at
                 FROM exercises WHERE id = ?1",
                params![id],
                Self::exercise_from_row,
            )
            .context("Exercise not found after insert")
    }

    // --- Exercise logs ---

    pub fn insert_exercise_log(&self, entry: &NewExerciseLog) -> Result<ExerciseLogEntry> {
        self.conn.execute(
            "INSERT INTO exercise_logs (username, date, exercise_id, duration_min, calories_burned, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.user,
                format_date(entry.date),
                entry.exercise_id,
                entry.duration_min,
                entry.calories_burned,
                now(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                &format!("{EXERCISE_LOG_SELECT} WHERE el.id = ?1"),
                params![id],
                Self::exercise_log_from_row,
            )
            .context("Exercise log not found after insert")
    }

    pub fn exercise_logs_for_date(
        &self,
        username: &str,
        date: NaiveDate,
    ) -> Result<Vec<ExerciseLogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EXERCISE_LOG_SELECT} WHERE el.username = ?1 AND el.date = ?2 ORDER BY el.id"
        ))?;
        let entries = stmt
            .query_map(params![username, format_date(date)], Self::exercise_log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_exercise_log(&self, username: &str, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM exercise_logs WHERE id = ?1 AND username = ?2",
            params![id, username],
        )?;
        Ok(rows > 0)
    }

    // --- Weight logs ---

    pub fn upsert_weight(&self, entry: &NewWeightEntry) -> Result<WeightEntry> {
        let now = now();
        self.conn.execute(
            "INSERT INTO weight_logs (username, date, weight_kg, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(username, date) DO UPDATE SET
                weight_kg = excluded.weight_kg,
                notes = excluded.notes,
                updated_at = excluded.updated_at",
            params![
                entry.user,
                format_date(entry.date),
                entry.weight_kg,
                entry.notes,
                now,
                now
            ],
        )?;
        self.get_weight(&entry.user, entry.date)?
            .context("Weight entry not found after upsert")
    }

    pub fn get_weight(&self, username: &str, date: NaiveDate) -> Result<Option<WeightEntry>> {
        self.conn
            .query_row(
                "SELECT id, username, date, weight_kg, notes, created_at, updated_at
                 FROM weight_logs WHERE username = ?1 AND date = ?2",
                params![username, format_date(date)],
                Self::weight_entry_from_row,
            )
            .optional()
            .context("Failed to load weight entry")
    }

    /// Newest first; `limit` of `None` returns everything.
    pub fn weight_history(&self, username: &str, limit: Option<i64>) -> Result<Vec<WeightEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, username, date, weight_kg, notes, created_at, updated_at
             FROM weight_logs WHERE username = ?1
             ORDER BY date DESC
             LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![username, limit.unwrap_or(-1)], Self::weight_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_weight(&self, username: &str, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM weight_logs WHERE id = ?1 AND username = ?2",
            params![id, username],
        )?;
        Ok(rows > 0)
    }

    /// Latest logged weight, falling back to the profile weight.
    pub fn current_weight_kg(&self, username: &str) -> Result<Option<f64>> {
        let logged: Option<f64> = self
            .conn
            .query_row(
                "SELECT weight_kg FROM weight_logs WHERE username = ?1 ORDER BY date DESC LIMIT 1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        if logged.is_some() {
            return Ok(logged);
        }
        Ok(self.get_user(username)?.and_then(|u| u.profile.weight_kg))
    }

    // --- Aggregation ---

    fn daily_sums(&self, sql: &str, username: &str, start: NaiveDate, end: NaiveDate) -> Result<DailySums> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(
                params![username, format_date(start), format_date(end)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut sums = DailySums::new();
        for (date, kcal, count) in rows {
            sums.insert(parse_date(&date)?, (kcal, count));
        }
        Ok(sums)
    }

    fn food_sums(&self, username: &str, start: NaiveDate, end: NaiveDate) -> Result<DailySums> {
        self.daily_sums(
            "SELECT fl.date, SUM(f.calories_per_100g * fl.serving_g / 100.0), COUNT(*)
             FROM food_logs fl
             JOIN foods f ON fl.food_id = f.id
             WHERE fl.username = ?1 AND fl.date BETWEEN ?2 AND ?3
             GROUP BY fl.date",
            username,
            start,
            end,
        )
    }

    fn exercise_sums(&self, username: &str, start: NaiveDate, end: NaiveDate) -> Result<DailySums> {
        self.daily_sums(
            "SELECT date, SUM(calories_burned), COUNT(*)
             FROM exercise_logs
             WHERE username = ?1 AND date BETWEEN ?2 AND ?3
             GROUP BY date",
            username,
            start,
            end,
        )
    }

    /// Per-day totals for `start..=end`, each day against the goal in effect on it.
    pub fn day_totals(&self, username: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DayTotals>> {
        let user = self.get_user(username)?.context("User not found")?;
        let history = self.goal_history(username)?;
        let food = self.food_sums(username, start, end)?;
        let exercise = self.exercise_sums(username, start, end)?;
        Ok(progress::fill_days(start, end, &food, &exercise, |date| {
            progress::goal_for_date(&history, user.daily_calorie_goal, date)
        }))
    }

    pub fn remaining_for_date(&self, username: &str, date: NaiveDate) -> Result<Remaining> {
        let goal = self.goal_on(username, date)?;
        let consumed = self
            .food_sums(username, date, date)?
            .get(&date)
            .map_or(0.0, |(kcal, _)| *kcal);
        let burned = self
            .exercise_sums(username, date, date)?
            .get(&date)
            .map_or(0.0, |(kcal, _)| *kcal);
        Ok(Remaining::new(goal, consumed, burned))
    }

    pub fn build_daily_summary(&self, username: &str, date: NaiveDate) -> Result<DailySummary> {
        let goal = self.goal_on(username, date)?;
        let entries = self.food_logs_for_date(username, date)?;
        let exercises = self.exercise_logs_for_date(username, date)?;
        Ok(progress::build_daily_summary(date, goal, &entries, exercises))
    }

    /// Distinct days with at least one food or exercise log, newest first.
    pub fn logging_dates(&self, username: &str) -> Result<Vec<NaiveDate>> {
        let mut stmt = self.conn.prepare(
            "SELECT date FROM food_logs WHERE username = ?1
             UNION
             SELECT date FROM exercise_logs WHERE username = ?1
             ORDER BY date DESC",
        )?;
        let dates = stmt
            .query_map(params![username], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        dates.iter().map(|d| parse_date(d)).collect()
    }

    pub fn streak(&self, username: &str, today: NaiveDate) -> Result<StreakInfo> {
        let dates = self.logging_dates(username)?;
        Ok(progress::compute_streak(&dates, today))
    }

    // --- Coach transcript ---

    pub fn insert_coach_message(&self, username: &str, role: &str, content: &str) -> Result<CoachMessage> {
        let now = now();
        self.conn.execute(
            "INSERT INTO coach_messages (username, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![username, role, content, now],
        )?;
        Ok(CoachMessage {
            id: self.conn.last_insert_rowid(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: now,
        })
    }

    /// Stores a user message and the reply to it together. Returns the reply.
    pub fn record_coach_exchange(
        &self,
        username: &str,
        message: &str,
        reply: &str,
    ) -> Result<CoachMessage> {
        let tx = self.conn.unchecked_transaction()?;
        self.insert_coach_message(username, MessageRole::User.as_str(), message)?;
        let stored = self.insert_coach_message(username, MessageRole::Assistant.as_str(), reply)?;
        tx.commit()?;
        Ok(stored)
    }

    /// The last `limit` messages in chronological order.
    pub fn recent_coach_messages(&self, username: &str, limit: i64) -> Result<Vec<CoachMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, role, content, created_at FROM (
                 SELECT id, role, content, created_at FROM coach_messages
                 WHERE username = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id",
        )?;
        let messages = stmt
            .query_map(params![username, limit], |row| {
                Ok(CoachMessage {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }
}
