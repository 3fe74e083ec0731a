//! Basic example listing workspaces and reading a state file.
//!
//! This example shows how to:
//! - Create a client from `TFE_ADDRESS` / `TFE_TOKEN`
//! - Configure the rate limiter from the server's ping endpoint
//! - Fetch JSON-API documents into typed models
//! - Stream a raw download into a file
//! - Handle the not-found and cancellation errors
//!
//! Run with: `TFE_TOKEN=... cargo run --example basic_call -- <organization>`

use serde::Deserialize;
use std::time::Duration;
use tfe_core::jsonapi::Collection;
use tfe_core::{Client, ClientBuilder, Context, Error, RetryPolicy, Target};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct Workspace {
    name: String,
    terraform_version: String,
    locked: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter("tfe_core=debug,basic_call=info")
        .init();

    let organization = std::env::args().nth(1).unwrap_or_else(|| "acme".to_string());

    let client: Client = ClientBuilder::from_env()?
        .retry_policy(RetryPolicy::default().max_attempts(10))
        .timeout(Duration::from_secs(20))
        .build()?;

    // Whole run bounded to two minutes; Ctrl-C cancels it.
    let ctx = Context::background().with_timeout(Duration::from_secs(120));
    let canceller = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    println!("=== Ping ===");
    let meta = client.ping(&ctx).await?;
    println!("API version: {:?}", meta.api_version);
    println!("Rate limit: {:?}", client.rate_limiter().rate());

    println!("\n=== Workspaces ===");
    let mut page = 1;
    let mut current_state = None;
    loop {
        let call = client
            .call(
                http::Method::GET,
                &format!("organizations/{}/workspaces", organization),
            )?
            .query_pairs([("page[number]", page.to_string()), ("page[size]", "20".to_string())]);
        let workspaces: Collection<Workspace> = client.fetch(&ctx, call).await?;

        for ws in &workspaces.items {
            println!(
                "{} {} (terraform {}){}",
                ws.id,
                ws.attributes.name,
                ws.attributes.terraform_version,
                if ws.attributes.locked { " [locked]" } else { "" }
            );
            if current_state.is_none() {
                current_state = Some(ws.id.clone());
            }
        }

        match workspaces.pagination.and_then(|p| p.next_page) {
            Some(next) => page = next,
            None => break,
        }
    }

    println!("\n=== Current state ===");
    if let Some(workspace_id) = current_state {
        let call = client.call(
            http::Method::GET,
            &format!("workspaces/{}/current-state-version", workspace_id),
        )?;
        let version: tfe_core::jsonapi::Document = match client.fetch(&ctx, call).await {
            Ok(version) => version,
            Err(Error::NotFound) => {
                println!("{} has no state yet", workspace_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let download = version
            .data
            .as_ref()
            .and_then(|data| match data {
                tfe_core::jsonapi::PrimaryData::One(resource) => resource
                    .attributes
                    .get("hosted-state-download-url")
                    .and_then(|url| url.as_str())
                    .map(str::to_string),
                tfe_core::jsonapi::PrimaryData::Many(_) => None,
            });

        if let Some(url) = download {
            let call = tfe_core::Call::new(
                http::Method::GET,
                url.parse().map_err(Error::InvalidUrl)?,
            );
            let mut file = tokio::fs::File::create("terraform.tfstate")
                .await
                .map_err(Error::RawSink)?;
            match client.execute(&ctx, call, Target::Raw(&mut file)).await {
                Ok(()) => println!("State written to terraform.tfstate"),
                Err(e) if e.is_cancelled() => println!("Download cancelled"),
                Err(e) => return Err(e),
            }
        }
    }

    Ok(())
}
