//! Discovery commands for homeserver-auth
//!
//! Show a domain's client well-known document and the domains the remote
//! settings probe would visit for a homeserver.

use serde_json::json;

use crate::config::Config;
use crate::error::Result;
use crate::well_known::{candidate_domains, normalize_url, WellKnownLookup, WellKnownResolver};

/// Fetch and print the client well-known document of `domain`
///
/// # Arguments
///
/// * `config` - Configuration providing the discovery settings
/// * `domain` - Domain to query
/// * `json` - Print JSON instead of text
///
/// # Errors
///
/// Returns error if the HTTP client cannot be built. A missing or invalid
/// document is reported, not returned as an error.
pub async fn discover(config: &Config, domain: &str, json: bool) -> Result<()> {
    let resolver = WellKnownResolver::new(&config.discovery)?;
    tracing::info!("Fetching client well-known for {}", domain);

    let Some(document) = resolver.fetch_client_well_known(domain).await else {
        if json {
            println!("null");
        } else {
            println!("No usable client well-known document for {}", domain);
        }
        return Ok(());
    };

    let call_url = document.call_service_url.as_ref().map(normalize_url);
    if json {
        let value = json!({
            "domain": domain,
            "homeserver_base_url": document.homeserver_base_url,
            "oidc_authentication": document.oidc_authentication,
            "call_service_url": call_url,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Domain:            {}", domain);
    println!(
        "Homeserver:        {}",
        document.homeserver_base_url.as_deref().unwrap_or("-")
    );
    match &document.oidc_authentication {
        Some(oidc) => {
            println!("OIDC issuer:       {}", oidc.issuer);
            println!(
                "OIDC client id:    {}",
                oidc.client_id.as_deref().unwrap_or("-")
            );
        }
        None => println!("OIDC issuer:       -"),
    }
    println!("Call service URL:  {}", call_url.as_deref().unwrap_or("-"));
    Ok(())
}

/// Print the remote settings candidate domains of `homeserver`
pub fn candidates(homeserver: &str) {
    let domains = candidate_domains(homeserver);
    if domains.is_empty() {
        tracing::warn!("No candidate domains for {:?}", homeserver);
    }
    for domain in domains {
        println!("{}", domain);
    }
}
