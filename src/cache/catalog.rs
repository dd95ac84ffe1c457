// Cached reference lists backing the stream request form
//
// One catalog is built at startup and shared by handle; nothing here is
// process-global.

use super::metadata_cache::MetadataCache;
use crate::remote::{RemoteError, RemoteResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Where reference lists come from
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn fetch_sites(&self) -> RemoteResult<Vec<String>>;
    async fn fetch_projects(&self, site: &str) -> RemoteResult<Vec<String>>;
    async fn fetch_stations(&self, site: &str, project: &str) -> RemoteResult<Vec<String>>;
}

/// Cache key for a site/project pair
pub fn catalog_key(site: &str, project: &str) -> String {
    format!("{}::{}", site, project)
}

const SITES_KEY: &str = "sites";

pub struct ReferenceCatalog {
    source: Arc<dyn ReferenceSource>,
    sites: MetadataCache<Vec<String>, RemoteError>,
    projects: MetadataCache<Vec<String>, RemoteError>,
    stations: MetadataCache<Vec<String>, RemoteError>,
}

impl ReferenceCatalog {
    pub fn new(source: Arc<dyn ReferenceSource>, ttl: Duration) -> Self {
        Self {
            source,
            sites: MetadataCache::new(ttl),
            projects: MetadataCache::new(ttl),
            stations: MetadataCache::new(ttl),
        }
    }

    pub async fn sites(&self, force_refresh: bool) -> RemoteResult<Vec<String>> {
        self.sites
            .get_or_load(SITES_KEY, force_refresh, || self.source.fetch_sites())
            .await
    }

    pub async fn projects(&self, site: &str, force_refresh: bool) -> RemoteResult<Vec<String>> {
        self.projects
            .get_or_load(site, force_refresh, || self.source.fetch_projects(site))
            .await
    }

    pub async fn stations(
        &self,
        site: &str,
        project: &str,
        force_refresh: bool,
    ) -> RemoteResult<Vec<String>> {
        self.stations
            .get_or_load(&catalog_key(site, project), force_refresh, || {
                self.source.fetch_stations(site, project)
            })
            .await
    }

    /// Drop every cached list, e.g. after switching API endpoints
    pub fn invalidate_all(&self) {
        self.sites.clear();
        self.projects.clear();
        self.stations.clear();
        log::info!("[METADATA CACHE] Reference catalog cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSource {
        station_calls: AtomicUsize,
        fail_stations: bool,
    }

    #[async_trait]
    impl ReferenceSource for FakeSource {
        async fn fetch_sites(&self) -> RemoteResult<Vec<String>> {
            Ok(vec!["PTB".to_string(), "RMS".to_string()])
        }

        async fn fetch_projects(&self, site: &str) -> RemoteResult<Vec<String>> {
            Ok(vec![format!("{}-ProjectX", site)])
        }

        async fn fetch_stations(&self, _site: &str, project: &str) -> RemoteResult<Vec<String>> {
            self.station_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_stations {
                return Err(RemoteError::Status {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            Ok(vec![format!("{}-FCT", project), format!("{}-SWDL", project)])
        }
    }

    #[test]
    fn test_catalog_key() {
        assert_eq!(catalog_key("PTB", "ProjectX"), "PTB::ProjectX");
    }

    #[tokio::test(start_paused = true)]
    async fn test_station_lists_are_shared() {
        let source = Arc::new(FakeSource::default());
        let catalog = ReferenceCatalog::new(source.clone(), Duration::from_secs(300));

        let (a, b) = tokio::join!(
            catalog.stations("PTB", "ProjectX", false),
            catalog.stations("PTB", "ProjectX", false)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(source.station_calls.load(Ordering::SeqCst), 1);

        catalog.stations("PTB", "ProjectY", false).await.unwrap();
        assert_eq!(source.station_calls.load(Ordering::SeqCst), 2);

        assert_eq!(catalog.sites(false).await.unwrap().len(), 2);
        assert_eq!(
            catalog.projects("RMS", false).await.unwrap(),
            vec!["RMS-ProjectX".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_propagate() {
        let source = Arc::new(FakeSource {
            fail_stations: true,
            ..Default::default()
        });
        let catalog = ReferenceCatalog::new(source, Duration::from_secs(300));

        let result = catalog.stations("PTB", "ProjectX", false).await;
        assert!(matches!(result, Err(RemoteError::Status { status: 503, .. })));
    }
}
