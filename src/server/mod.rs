pub mod api;

use crate::report::Analyst;
use self::api::{ build_router, AppState };
use log::{ error, info, warn };
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

pub struct Server {
    addr: String,
    state: AppState,
    tls: TlsSettings,
}

impl Server {
    pub fn new(addr: String, analyst: Option<Arc<Analyst>>, api_key: Option<String>, tls: TlsSettings) -> Self {
        let state = AppState::new(analyst, api_key);
        if state.analyst.is_none() {
            warn!("No report pipeline configured. POST /report will answer 503.");
        }
        if state.api_key.is_some() {
            info!("POST /report requires the X-API-Key header.");
        }
        Self { addr, state, tls }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let addr = self.addr.parse::<SocketAddr>()?;
        let app = build_router(self.state.clone());

        if self.tls.enabled {
            let (cert_path, key_path) = match (&self.tls.cert_path, &self.tls.key_path) {
                (Some(cert), Some(key)) => (cert, key),
                _ => {
                    error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                    return Err("TLS enabled without cert/key".into());
                }
            };
            info!("TLS enabled. Loading certificate from '{}' and key from '{}'", cert_path, key_path);
            let tls_config = axum_server::tls_rustls::RustlsConfig
                ::from_pem_file(cert_path, key_path).await
                .map_err(|e| format!("Failed to load TLS certificate/key: {}", e))?;

            info!("HTTPS server listening on: https://{}", addr);
            axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
        } else {
            let listener = tokio::net::TcpListener
                ::bind(addr).await
                .map_err(|e| format!("Failed to bind HTTP server to {}: {}", addr, e))?;
            info!("HTTP server listening on: http://{}", addr);
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown_signal()).await?;
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received, stopping server");
}
