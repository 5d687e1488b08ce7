//! Capacity report

use super::migrate::LOCATION_PREFIX;
use super::ArrayDriver;
use crate::cli::ArrayCommand;
use crate::domain::{VolumeStats, GIB};
use crate::error::{Error, Result};
use chrono::Utc;
use tracing::{debug, instrument};

const VENDOR_NAME: &str = "IBM";

impl ArrayDriver {
    /// Capacity and capabilities of the configured pool. The last report is
    /// returned unless `refresh` is set or none exists yet.
    pub async fn get_volume_stats(&self, refresh: bool) -> Result<VolumeStats> {
        if !refresh {
            let cached = self.stats.read().clone();
            if let Some(stats) = cached {
                return Ok(stats);
            }
        }
        let stats = self.update_volume_stats().await?;
        *self.stats.write() = Some(stats.clone());
        Ok(stats)
    }

    #[instrument(skip(self))]
    async fn update_volume_stats(&self) -> Result<VolumeStats> {
        debug!("Updating volume stats");
        let profile = self.profile()?;
        let view = self
            .client
            .detail(&ArrayCommand::ShowPool {
                name: profile.pool.clone(),
            })
            .await?;
        let pool = view
            .first()
            .ok_or_else(|| Error::backend("lsmdiskgrp", format!("pool {} not listed", profile.pool)))?;
        let capacity = pool.require_u64("capacity", "lsmdiskgrp")?;
        let free = pool.require_u64("free_capacity", "lsmdiskgrp")?;
        let (total_capacity_gb, free_capacity_gb) = capacity_gb(capacity, free);

        let backend_name = self
            .config
            .volume_backend_name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", profile.system_name, profile.pool));

        Ok(VolumeStats {
            volume_backend_name: backend_name,
            vendor_name: VENDOR_NAME.to_string(),
            driver_version: crate::VERSION.to_string(),
            storage_protocol: self.config.protocol()?.to_string(),
            total_capacity_gb,
            free_capacity_gb,
            reserved_percentage: self.config.reserved_percentage,
            qos_support: false,
            easytier_support: true,
            compression_support: self.licenses().await?.compression,
            extent_size: profile.extent_size,
            location_info: format!("{}:{}:{}", LOCATION_PREFIX, profile.system_id, profile.pool),
            updated_at: Utc::now(),
        })
    }
}

/// Bytes to GiB; free never exceeds total
fn capacity_gb(capacity: u64, free: u64) -> (f64, f64) {
    let total = capacity as f64 / GIB as f64;
    let free = free.min(capacity) as f64 / GIB as f64;
    (total, free)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::setup_driver;

    #[test]
    fn test_free_never_exceeds_total() {
        assert_eq!(capacity_gb(10 * GIB, 20 * GIB), (10.0, 10.0));
        assert_eq!(capacity_gb(0, 5), (0.0, 0.0));
        let (total, free) = capacity_gb(3 * GIB, GIB / 2);
        assert_eq!(total, 3.0);
        assert_eq!(free, 0.5);
    }

    #[tokio::test]
    async fn test_stats_of_fresh_array() {
        let (driver, _sim, _) = setup_driver().await;
        let stats = driver.get_volume_stats(true).await.unwrap();
        assert_eq!(stats.volume_backend_name, "flash-array-sim_volpool");
        assert_eq!(stats.total_capacity_gb, 3328.0);
        assert_eq!(stats.free_capacity_gb, 3287.5);
        assert_eq!(stats.extent_size, 256);
        assert!(stats.compression_support);
        assert_eq!(stats.location_info, "ArrayDriver:0123456789ABCDEF:volpool");
    }

    #[tokio::test]
    async fn test_stats_are_cached_until_refresh() {
        let (driver, sim, _) = setup_driver().await;
        let first = driver.get_volume_stats(false).await.unwrap();
        let queries = sim.issued("lsmdiskgrp");

        let cached = driver.get_volume_stats(false).await.unwrap();
        assert_eq!(cached, first);
        assert_eq!(sim.issued("lsmdiskgrp"), queries);

        driver.get_volume_stats(true).await.unwrap();
        assert_eq!(sim.issued("lsmdiskgrp"), queries + 1);
    }
}
