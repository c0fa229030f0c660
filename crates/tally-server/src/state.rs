//! Shared application state

use std::sync::Arc;
use tally_browser::SessionLauncher;
use tally_core::{Credentials, Result, TallyConfig};
use tally_workflow::{ArtifactRegistry, DebugStore, Orchestrator, OrchestratorConfig, PortalProfile};
use tracing::info;

/// Cookie-capture portal and its defaults
pub struct CookieService {
    pub orchestrator: Orchestrator,
    pub target_url: String,
    pub defaults: Credentials,
}

/// Everything the handlers need, built once at startup and read-only afterwards
pub struct AppState {
    pub reports: Orchestrator,
    pub cookies: Option<CookieService>,
    pub registry: Arc<ArtifactRegistry>,
    pub debug_store: Arc<DebugStore>,
    pub defaults: Credentials,
    /// Prefix for `report_url`, `debug_files` and `view_all_url`
    pub base_url: String,
    pub portal_utc_offset_minutes: Option<i32>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire orchestrators, registry and debug store from configuration.
    ///
    /// Both orchestrators share one run limit so the cookie portal cannot push the
    /// process past `workflow.max_concurrent_runs` browsers.
    pub fn from_config(config: &TallyConfig, launcher: Arc<dyn SessionLauncher>) -> Result<Self> {
        let registry = Arc::new(ArtifactRegistry::new());
        let debug_store = DebugStore::shared(config.storage.debug_dir());

        let profile = PortalProfile::from_selection(&config.portal)?;
        profile.validate()?;
        info!("Report portal: {} ({})", profile.name, profile.login_url);
        let reports = Orchestrator::new(
            OrchestratorConfig::new(config, profile),
            launcher.clone(),
            registry.clone(),
            debug_store.clone(),
        );

        let cookies = match &config.cookie_portal {
            Some(settings) => {
                let profile = PortalProfile::builtin(&settings.profile)?;
                info!("Cookie portal: {} -> {}", profile.name, settings.target_url);
                let orchestrator = Orchestrator::new(
                    OrchestratorConfig::new(config, profile),
                    launcher,
                    registry.clone(),
                    debug_store.clone(),
                )
                .with_run_limit(reports.run_limit());
                Some(CookieService {
                    orchestrator,
                    target_url: settings.target_url.clone(),
                    defaults: Credentials::new("", &settings.email, &settings.password),
                })
            }
            None => None,
        };

        Ok(Self {
            reports,
            cookies,
            registry,
            debug_store,
            defaults: config.defaults.credentials(),
            base_url: config.server.public_base_url(),
            portal_utc_offset_minutes: config.workflow.portal_utc_offset_minutes,
        })
    }

    pub fn download_url(&self, token: &str) -> String {
        format!("{}/download/{}", self.base_url, token)
    }

    pub fn debug_file_url(&self, dir_name: &str, file_name: &str) -> String {
        format!("{}/files/{}/{}", self.base_url, dir_name, file_name)
    }

    pub fn debug_index_url(&self) -> String {
        format!("{}/debug", self.base_url)
    }
}
