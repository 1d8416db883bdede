use std::time::Duration;

use anyhow::{Context, Result};

use nourish_core::models::NewFood;
use nourish_core::openfoodfacts::{ProductResponse, SearchResponse, product_to_food};

const DEFAULT_BASE_URL: &str = "https://world.openfoodfacts.org";

pub struct OpenFoodFactsClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenFoodFactsClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "nourish/{} (nutrition tracker)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn search(&self, query: &str) -> Result<Vec<NewFood>> {
        let resp = self
            .client
            .get(format!("{}/cgi/search.pl", self.base_url))
            .query(&[
                ("search_terms", query),
                ("search_simple", "1"),
                ("json", "1"),
                ("page_size", "10"),
            ])
            .send()
            .await
            .context("Failed to reach OpenFoodFacts API")?
            .error_for_status()
            .context("OpenFoodFacts search failed")?;

        let data: SearchResponse = resp
            .json()
            .await
            .context("Failed to parse OpenFoodFacts search response")?;

        let foods: Vec<NewFood> = data
            .products
            .into_iter()
            .filter_map(product_to_food)
            .collect();
        tracing::debug!(query, results = foods.len(), "openfoodfacts search");

        Ok(foods)
    }

    pub async fn lookup_barcode(&self, barcode: &str) -> Result<Option<NewFood>> {
        let url = format!("{}/api/v0/product/{barcode}.json", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach OpenFoodFacts API")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let data: ProductResponse = resp
            .error_for_status()
            .context("OpenFoodFacts barcode lookup failed")?
            .json()
            .await
            .context("Failed to parse OpenFoodFacts barcode response")?;

        if data.status != 1 {
            return Ok(None);
        }

        Ok(data.product.and_then(product_to_food))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Path;
    use axum::routing::get;

    async fn spawn_mock() -> String {
        let app = Router::new()
            .route(
                "/api/v0/product/{file}",
                get(|Path(file): Path<String>| async move {
                    if file == "3017620422003.json" {
                        axum::Json(serde_json::json!({
                            "status": 1,
                            "product": {
                                "product_name": "Nutella",
                                "brands": "Ferrero",
                                "code": "3017620422003",
                                "serving_quantity": "15",
                                "nutriments": {"energy-kcal_100g": 539, "proteins_100g": 6.3}
                            }
                        }))
                    } else {
                        axum::Json(serde_json::json!({"status": 0, "status_verbose": "product not found"}))
                    }
                }),
            )
            .route(
                "/cgi/search.pl",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "products": [
                            {"product_name": "Greek Yogurt", "nutriments": {"energy-kcal_100g": 97}},
                            {"product_name": "", "nutriments": {"energy-kcal_100g": 10}},
                            {"product_name": "No energy"}
                        ]
                    }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_lookup_barcode_against_mock() {
        let client = OpenFoodFactsClient::with_base_url(&spawn_mock().await).unwrap();
        let food = client.lookup_barcode("3017620422003").await.unwrap().unwrap();
        assert_eq!(food.name, "Nutella");
        assert_eq!(food.default_serving_g, Some(15.0));
        assert!(client.lookup_barcode("0000000000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_skips_incomplete_products() {
        let client = OpenFoodFactsClient::with_base_url(&spawn_mock().await).unwrap();
        let results = client.search("yogurt").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Greek Yogurt");
    }

    // --- Integration tests (hit real OpenFoodFacts API) ---

    #[tokio::test]
    #[ignore = "hits OpenFoodFacts API"]
    async fn test_lookup_barcode_known_product() {
        let client = OpenFoodFactsClient::new().unwrap();
        let result = client.lookup_barcode("3017620422003").await.unwrap();
        let food = result.expect("Nutella should exist in OpenFoodFacts");
        assert!(food.name.to_lowercase().contains("nutella"));
        assert!(food.calories_per_100g > 0.0);
    }

    #[tokio::test]
    #[ignore = "hits OpenFoodFacts API"]
    async fn test_search_returns_results() {
        let client = OpenFoodFactsClient::new().unwrap();
        let results = client.search("nutella").await.unwrap();
        assert!(!results.is_empty());
        for food in &results {
            assert!(!food.name.is_empty());
        }
    }
}
