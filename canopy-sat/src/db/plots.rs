//! Plot persistence
//!
//! Plot administration is owned elsewhere; this module only reads the fields
//! the estimation pipeline needs (boundary vertices, area) and can seed
//! plots for tests and bootstrap tooling.

use canopy_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// A monitoring plot, reduced to what the pipeline consumes
#[derive(Debug, Clone)]
pub struct Plot {
    pub id: Uuid,
    pub name: String,
    pub vertex1_lat: Option<f64>,
    pub vertex1_lon: Option<f64>,
    pub vertex2_lat: Option<f64>,
    pub vertex2_lon: Option<f64>,
    pub vertex3_lat: Option<f64>,
    pub vertex3_lon: Option<f64>,
    pub vertex4_lat: Option<f64>,
    pub vertex4_lon: Option<f64>,
    pub area_hectares: f64,
}

impl Plot {
    /// The four boundary vertices as [lat, lon] pairs, or `None` when any
    /// coordinate is missing. An incomplete boundary cannot be submitted
    /// for extraction.
    pub fn boundary_vertices(&self) -> Option<[[f64; 2]; 4]> {
        Some([
            [self.vertex1_lat?, self.vertex1_lon?],
            [self.vertex2_lat?, self.vertex2_lon?],
            [self.vertex3_lat?, self.vertex3_lon?],
            [self.vertex4_lat?, self.vertex4_lon?],
        ])
    }
}

/// Load a plot by id
pub async fn load_plot(pool: &SqlitePool, plot_id: Uuid) -> Result<Option<Plot>> {
    let row = sqlx::query(
        r#"
        SELECT id, name,
               vertex1_lat, vertex1_lon, vertex2_lat, vertex2_lon,
               vertex3_lat, vertex3_lon, vertex4_lat, vertex4_lon,
               area_hectares
        FROM plots
        WHERE id = ?
        "#,
    )
    .bind(plot_id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let id_str: String = row.get("id");
            let id = Uuid::parse_str(&id_str).map_err(|e| {
                canopy_common::Error::Internal(format!("Failed to parse plot id: {}", e))
            })?;

            Ok(Some(Plot {
                id,
                name: row.get("name"),
                vertex1_lat: row.get("vertex1_lat"),
                vertex1_lon: row.get("vertex1_lon"),
                vertex2_lat: row.get("vertex2_lat"),
                vertex2_lon: row.get("vertex2_lon"),
                vertex3_lat: row.get("vertex3_lat"),
                vertex3_lon: row.get("vertex3_lon"),
                vertex4_lat: row.get("vertex4_lat"),
                vertex4_lon: row.get("vertex4_lon"),
                area_hectares: row.get("area_hectares"),
            }))
        }
        None => Ok(None),
    }
}

/// Insert a plot (bootstrap/test seeding; plot CRUD lives outside this service)
pub async fn insert_plot(pool: &SqlitePool, plot: &Plot) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO plots (
            id, name,
            vertex1_lat, vertex1_lon, vertex2_lat, vertex2_lon,
            vertex3_lat, vertex3_lon, vertex4_lat, vertex4_lon,
            area_hectares
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(plot.id.to_string())
    .bind(&plot.name)
    .bind(plot.vertex1_lat)
    .bind(plot.vertex1_lon)
    .bind(plot.vertex2_lat)
    .bind(plot.vertex2_lon)
    .bind(plot.vertex3_lat)
    .bind(plot.vertex3_lon)
    .bind(plot.vertex4_lat)
    .bind(plot.vertex4_lon)
    .bind(plot.area_hectares)
    .execute(pool)
    .await?;

    Ok(())
}
