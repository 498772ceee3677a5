//! Cargo manager: persistent workspace volumes.
//!
//! A managed cargo is created alongside its sandbox and cascade-deleted
//! with it; an external cargo is pre-created by the user and survives
//! sandbox deletion.

use std::sync::Arc;

use bay_db::{CargoRecord, Database, NewCargo};
use bay_driver::{labels, labels::LabelMap, Driver};
use tracing::info;

use crate::error::{BayError, BayResult};

/// Deterministic, known-prefix volume naming (`bay-cargo-<hex>`), shared
/// with the GC and tests.
pub fn volume_name_for(cargo_id: &str) -> String {
    format!("bay-{cargo_id}")
}

#[derive(Clone)]
pub struct CargoManager {
    driver: Arc<dyn Driver>,
    db: Database,
}

impl CargoManager {
    pub fn new(driver: Arc<dyn Driver>, db: Database) -> Self {
        Self { driver, db }
    }

    /// Creates the volume and its catalog row.
    pub async fn create(
        &self,
        owner: &str,
        managed: bool,
        managed_by_sandbox_id: Option<&str>,
    ) -> BayResult<CargoRecord> {
        let cargo_id = bay_db::short_id("cargo");
        let volume_name = volume_name_for(&cargo_id);

        info!(
            cargo_id = %cargo_id,
            owner = %owner,
            managed,
            "cargo create"
        );

        let mut volume_labels = LabelMap::new();
        volume_labels.insert(labels::OWNER.to_string(), owner.to_string());
        volume_labels.insert(labels::CARGO_ID.to_string(), cargo_id.clone());
        if let Some(sandbox_id) = managed_by_sandbox_id {
            volume_labels.insert(labels::SANDBOX_ID.to_string(), sandbox_id.to_string());
        }

        let driver_ref = self.driver.create_volume(&volume_name, &volume_labels).await?;

        Ok(self
            .db
            .create_cargo(NewCargo {
                id: &cargo_id,
                owner,
                driver_ref: &driver_ref,
                managed,
                managed_by_sandbox_id,
            })
            .await?)
    }

    /// Owner-scoped lookup.
    pub async fn get(&self, cargo_id: &str, owner: &str) -> BayResult<CargoRecord> {
        self.db
            .fetch_cargo_owned(cargo_id, owner)
            .await?
            .ok_or_else(|| BayError::NotFound(format!("cargo not found: {cargo_id}")))
    }

    /// Unscoped lookup used inside sandbox critical sections.
    pub async fn get_by_id(&self, cargo_id: &str) -> BayResult<Option<CargoRecord>> {
        Ok(self.db.fetch_cargo(cargo_id).await?)
    }

    /// Deletes the volume and the row. Managed cargos refuse deletion unless
    /// forced (the sandbox delete cascade forces).
    pub async fn delete(&self, cargo_id: &str, owner: &str, force: bool) -> BayResult<()> {
        let cargo = self.get(cargo_id, owner).await?;

        if cargo.managed && !force {
            return Err(BayError::Conflict(format!(
                "cargo {cargo_id} is managed by its sandbox; delete the sandbox instead"
            )));
        }

        info!(cargo_id = %cargo_id, force, "cargo delete");

        // The driver swallows a missing volume; GC may have been here first.
        self.driver.delete_volume(&cargo.driver_ref).await?;
        self.db.delete_cargo(cargo_id).await?;
        Ok(())
    }

    /// Paginated list by ascending id.
    pub async fn list(
        &self,
        owner: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> BayResult<(Vec<CargoRecord>, Option<String>)> {
        let limit = limit.max(1);
        let mut batch = self
            .db
            .list_cargo_batch(owner, cursor, limit as i64 + 1)
            .await?;

        let next_cursor = if batch.len() > limit {
            batch.truncate(limit);
            batch.last().map(|cargo| cargo.id.clone())
        } else {
            None
        };
        Ok((batch, next_cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_names_carry_the_known_prefix() {
        assert_eq!(
            volume_name_for("cargo-a1b2c3d4e5f6"),
            "bay-cargo-a1b2c3d4e5f6"
        );
    }
}
