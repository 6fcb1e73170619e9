//! Command implementations behind the CLI

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::apps::manifest::Manifest;
use crate::deploy::deployment::Status;
use crate::deploy::docker::DockerBackend;
use crate::deploy::lifecycle::{self, AppSummary};
use crate::deploy::orchestrator::{DeployOptions, DeployReport};
use crate::errors::EnvError;
use crate::filesys::file::File;
use crate::storage::layout::StateLayout;
use crate::storage::settings::Settings;
use crate::storage::spec::Spec;

/// Everything a command needs: resolved settings, where the state lives and
/// the scope that interrupts it
#[derive(Debug, Clone)]
pub struct Context {
    pub settings: Settings,
    pub layout: StateLayout,
    pub cancel: CancellationToken,
}

impl Context {
    pub fn new(settings: Settings, cancel: CancellationToken) -> Self {
        let layout = StateLayout::new(settings.state_dir.clone(), settings.env.clone());
        Self {
            settings,
            layout,
            cancel,
        }
    }

    async fn load_spec(&self) -> Result<Spec, EnvError> {
        Spec::load(
            &self.layout.spec_file(),
            &self.settings.env,
            &self.settings.profiles,
        )
        .await
    }

    fn backend(&self) -> DockerBackend {
        DockerBackend::new(self.settings.docker_bin.clone(), self.settings.env.clone())
    }
}

/// Deploy the apps the manifest selects for the configured profiles
pub async fn deploy(ctx: &Context, manifest_file: &File) -> Result<DeployReport, EnvError> {
    let manifest = Manifest::load(manifest_file).await?;
    let spec = ctx.load_spec().await?;

    let default_timeout = Duration::from_secs(ctx.settings.default_prerequisite_timeout_secs);
    let set = manifest.app_set(&spec, &ctx.layout, default_timeout)?;
    info!(
        "Deploying {} apps to environment {}",
        set.len(),
        ctx.settings.env
    );

    let backend = ctx.backend();
    backend.ensure_network().await?;

    let options = DeployOptions::from(&ctx.settings);
    set.deploy(
        &spec,
        &ctx.layout.spec_file(),
        Arc::new(backend),
        &options,
        &ctx.cancel,
    )
    .await
}

pub async fn stop(ctx: &Context) -> Result<Vec<String>, EnvError> {
    let spec = ctx.load_spec().await?;
    lifecycle::stop(&spec, &ctx.layout, &ctx.backend()).await
}

pub async fn remove(ctx: &Context) -> Result<Vec<String>, EnvError> {
    let spec = ctx.load_spec().await?;
    lifecycle::remove(&spec, &ctx.layout, &ctx.backend()).await
}

pub async fn inspect(ctx: &Context) -> Result<Vec<AppSummary>, EnvError> {
    let spec = ctx.load_spec().await?;
    Ok(lifecycle::inspect(&spec))
}

/// Human readable summary of a deploy run
pub fn render_report(report: &DeployReport) -> String {
    let mut out = String::new();
    for name in &report.deployed {
        out.push_str(&format!("{} {}\n", "✓".green().bold(), name.bold()));
    }
    for name in &report.already_running {
        out.push_str(&format!(
            "{} {} {}\n",
            "•".dimmed(),
            name,
            "(already running)".dimmed()
        ));
    }
    out
}

/// Aligned table of the environment's apps
pub fn render_summary(rows: &[AppSummary]) -> String {
    if rows.is_empty() {
        return "No apps recorded.\n".to_string();
    }

    let headers = ["NAME", "TYPE", "STATUS", "CONTAINER", "ENDPOINTS"];
    let cells: Vec<[String; 5]> = rows
        .iter()
        .map(|row| {
            let endpoints = row
                .endpoints
                .iter()
                .map(|(port, addr)| format!("{}={}", port, addr))
                .collect::<Vec<_>>()
                .join(" ");
            [
                row.name.clone(),
                row.app_type.clone(),
                row.status.to_string(),
                row.container.clone().unwrap_or_else(|| "-".to_string()),
                if endpoints.is_empty() {
                    "-".to_string()
                } else {
                    endpoints
                },
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let header: Vec<String> = headers
        .iter()
        .zip(widths)
        .map(|(h, w)| format!("{:<w$}", h, w = w))
        .collect();
    out.push_str(&format!("{}\n", header.join("  ").trim_end().bold()));

    for (row, summary) in cells.iter().zip(rows) {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .enumerate()
            .map(|(i, (cell, w))| {
                let padded = format!("{:<w$}", cell, w = w);
                if i == 2 {
                    colorize_status(summary.status, &padded)
                } else {
                    padded
                }
            })
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }
    out
}

fn colorize_status(status: Status, text: &str) -> String {
    match status {
        Status::Running => text.green().to_string(),
        Status::Stopped => text.yellow().to_string(),
        Status::NotDeployed => text.dimmed().to_string(),
    }
}
