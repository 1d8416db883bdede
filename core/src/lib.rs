pub mod auth;
pub mod cache;
pub mod calc;
pub mod coach;
pub mod db;
pub mod models;
pub mod openfoodfacts;
pub mod progress;
pub mod recommend;
