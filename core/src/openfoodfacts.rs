//! Open Food Facts response shapes and their mapping onto catalog foods.

use anyhow::{Result, bail};
use serde::Deserialize;

use crate::models::{Food, NewFood};

/// Remote search only kicks in when local search returns fewer hits than this.
pub const LOCAL_RESULTS_ENOUGH: usize = 5;

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub products: Vec<ProductData>,
}

#[derive(Debug, Deserialize)]
pub struct ProductResponse {
    pub status: i32,
    pub product: Option<ProductData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProductData {
    pub product_name: Option<String>,
    pub brands: Option<String>,
    pub code: Option<String>,
    pub serving_quantity: Option<ServingQuantity>,
    pub nutriments: Option<Nutriments>,
}

/// The API returns `serving_quantity` as either a number or a numeric string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServingQuantity {
    Number(f64),
    Text(String),
}

impl ServingQuantity {
    #[must_use]
    pub fn grams(&self) -> Option<f64> {
        let g = match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse().ok()?,
        };
        (g > 0.0).then_some(g)
    }
}

#[derive(Debug, Default, Deserialize)]
#[allow(clippy::struct_field_names)]
pub struct Nutriments {
    #[serde(rename = "energy-kcal_100g")]
    pub energy_kcal_100g: Option<f64>,
    pub proteins_100g: Option<f64>,
    pub carbohydrates_100g: Option<f64>,
    pub fat_100g: Option<f64>,
}

/// `None` when the product lacks a name or an energy value.
#[must_use]
pub fn product_to_food(p: ProductData) -> Option<NewFood> {
    let name = p.product_name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())?;
    let nutriments = p.nutriments?;
    let calories = nutriments.energy_kcal_100g.filter(|c| *c >= 0.0)?;

    Some(NewFood {
        name,
        brand: p
            .brands
            .and_then(|b| b.split(',').next().map(|s| s.trim().to_string()))
            .filter(|b| !b.is_empty()),
        barcode: p.code.filter(|c| !c.is_empty()),
        calories_per_100g: calories,
        protein_per_100g: nutriments.proteins_100g,
        carbs_per_100g: nutriments.carbohydrates_100g,
        fat_per_100g: nutriments.fat_100g,
        default_serving_g: p.serving_quantity.as_ref().and_then(ServingQuantity::grams),
        source: "openfoodfacts".to_string(),
    })
}

/// EAN-8, UPC-A, EAN-13 and GTIN-14 are all digit strings of 8 to 14 characters.
pub fn validate_barcode(code: &str) -> Result<String> {
    let code = code.trim();
    if !(8..=14).contains(&code.len()) || !code.chars().all(|c| c.is_ascii_digit()) {
        bail!("Invalid barcode '{code}'. Expected 8 to 14 digits");
    }
    Ok(code.to_string())
}

/// Appends `remote` to `local`, skipping foods already present by id.
#[must_use]
pub fn merge_results(mut local: Vec<Food>, remote: Vec<Food>) -> Vec<Food> {
    for food in remote {
        if !local.iter().any(|f| f.id == food.id) {
            local.push(food);
        }
    }
    local
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_product() -> ProductData {
        ProductData {
            product_name: Some("Nutella".to_string()),
            brands: Some("Ferrero, Ferrero Italia".to_string()),
            code: Some("3017620422003".to_string()),
            serving_quantity: Some(ServingQuantity::Text("15".to_string())),
            nutriments: Some(Nutriments {
                energy_kcal_100g: Some(539.0),
                proteins_100g: Some(6.3),
                carbohydrates_100g: Some(57.5),
                fat_100g: Some(30.9),
            }),
        }
    }

    fn food(id: i64, name: &str) -> Food {
        Food {
            id,
            name: name.to_string(),
            brand: None,
            barcode: None,
            calories_per_100g: 100.0,
            protein_per_100g: None,
            carbs_per_100g: None,
            fat_per_100g: None,
            default_serving_g: None,
            source: "manual".to_string(),
            owner: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_product_to_food_complete() {
        let food = product_to_food(full_product()).unwrap();
        assert_eq!(food.name, "Nutella");
        assert_eq!(food.brand.as_deref(), Some("Ferrero"));
        assert_eq!(food.barcode.as_deref(), Some("3017620422003"));
        assert_eq!(food.calories_per_100g, 539.0);
        assert_eq!(food.default_serving_g, Some(15.0));
        assert_eq!(food.source, "openfoodfacts");
    }

    #[test]
    fn test_product_to_food_requires_name_and_energy() {
        let mut p = full_product();
        p.product_name = Some("  ".to_string());
        assert!(product_to_food(p).is_none());

        let mut p = full_product();
        p.nutriments.as_mut().unwrap().energy_kcal_100g = None;
        assert!(product_to_food(p).is_none());

        let mut p = full_product();
        p.nutriments = None;
        assert!(product_to_food(p).is_none());
    }

    #[test]
    fn test_serving_quantity_forms() {
        let p: ProductData = serde_json::from_str(
            r#"{"product_name": "Oats", "serving_quantity": 40, "nutriments": {"energy-kcal_100g": 389}}"#,
        )
        .unwrap();
        assert_eq!(product_to_food(p).unwrap().default_serving_g, Some(40.0));

        assert_eq!(ServingQuantity::Text("abc".to_string()).grams(), None);
        assert_eq!(ServingQuantity::Number(0.0).grams(), None);
    }

    #[test]
    fn test_search_response_tolerates_missing_products() {
        let resp: SearchResponse = serde_json::from_str(r#"{"count": 0}"#).unwrap();
        assert!(resp.products.is_empty());
    }

    #[test]
    fn test_validate_barcode() {
        assert_eq!(validate_barcode(" 3017620422003 ").unwrap(), "3017620422003");
        assert!(validate_barcode("1234567").is_err());
        assert!(validate_barcode("12345678901234567").is_err());
        assert!(validate_barcode("30176204220ab").is_err());
    }

    #[test]
    fn test_merge_results_dedupes_by_id() {
        let merged = merge_results(
            vec![food(1, "Apple"), food(2, "Banana")],
            vec![food(2, "Banana"), food(3, "Cherry")],
        );
        let ids: Vec<i64> = merged.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
