// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use ganeti_instance_config::Config;
use ganeti_rapi_client::{Client, RapiGateway, Secret};
use ganeti_reconciler::{InvocationOutput, Reconciler};
use slog::{error, info, o, Drain, Logger};

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Converge a Ganeti instance toward the state declared in a TOML file
struct Opt {
    /// Invocation file with [connection], [options] and [instance] tables
    #[clap(action)]
    config: PathBuf,

    /// Override the instance name
    #[clap(long, action)]
    name: Option<String>,

    /// Override the requested state (present, absent, started, stopped,
    /// restarted, migrated)
    #[clap(long, action)]
    state: Option<String>,

    /// RAPI daemon address
    #[clap(long, action)]
    address: Option<String>,

    /// RAPI daemon port
    #[clap(long, action)]
    port: Option<u16>,

    /// RAPI user
    #[clap(long, action)]
    user: Option<String>,

    /// Environment variable holding the RAPI password
    #[clap(long, action)]
    password_env: Option<String>,

    /// Submit jobs without waiting for them to finish
    #[clap(long, action)]
    no_wait: bool,

    /// Report the planned operations without submitting anything
    #[clap(long, action)]
    check: bool,

    /// Seconds to wait for any single job
    #[clap(long, action)]
    job_timeout: Option<u64>,

    /// Logging level
    #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
    log_level: slog::Level,
}

impl Opt {
    /// Command-line flags win over the file.
    fn apply(&self, cfg: &mut Config) {
        if let Some(name) = &self.name {
            cfg.instance.name = Some(name.clone());
        }
        if let Some(state) = &self.state {
            cfg.instance.state = Some(state.clone());
        }
        if let Some(address) = &self.address {
            cfg.connection.address = address.clone();
        }
        if let Some(port) = self.port {
            cfg.connection.port = port;
        }
        if let Some(user) = &self.user {
            cfg.connection.user = Some(user.clone());
        }
        if let Some(var) = &self.password_env {
            cfg.connection.password_env = var.clone();
        }
        if let Some(secs) = self.job_timeout {
            cfg.options.job_timeout = secs;
        }
        if self.no_wait {
            cfg.options.wait = false;
        }
        if self.check {
            cfg.options.check_mode = true;
        }
    }
}

/// Logs go to stderr; stdout carries only the JSON result.
fn build_logger(level: slog::Level) -> Logger {
    let drain = if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name("ganeti-instance", std::io::stderr())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };
    let drain = slog::LevelFilter::new(drain, level).fuse();
    Logger::root(drain, o!())
}

async fn run(cfg: Config, log: &Logger) -> anyhow::Result<InvocationOutput> {
    let password = std::env::var(&cfg.connection.password_env)
        .ok()
        .map(Secret::new);
    let client_config = cfg.connection.client_config(password);
    let client_log = log.new(o!("component" => "rapi"));
    let client = Client::new(&client_config, client_log)
        .context("failed to build RAPI client")?;
    info!(log, "connecting"; "baseurl" => client.baseurl());

    let reconciler =
        Reconciler::new(RapiGateway::new(client), cfg.options, log.clone());
    let result = reconciler.reconcile(&cfg.instance).await;
    Ok(result.into())
}

/// Result reported when the pass never got as far as the cluster.
fn setup_failure(err: &anyhow::Error) -> InvocationOutput {
    InvocationOutput {
        changed: false,
        failed: true,
        msg: format!("{err:#}"),
        error_kind: None,
        requires_restart: false,
        operations: Vec::new(),
        instance: None,
    }
}

async fn invoke(opt: &Opt, log: &Logger) -> anyhow::Result<InvocationOutput> {
    let mut cfg = ganeti_instance_config::parse(&opt.config).with_context(
        || format!("failed to read {}", opt.config.display()),
    )?;
    opt.apply(&mut cfg);
    run(cfg, log).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let opt = Opt::parse();
    let log = build_logger(opt.log_level);

    let output = match invoke(&opt, &log).await {
        Ok(output) => output,
        Err(e) => {
            error!(log, "setup failed"; "error" => format!("{e:#}"));
            setup_failure(&e)
        }
    };
    let code = match serde_json::to_string_pretty(&output) {
        Ok(json) => {
            println!("{json}");
            if output.failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!(log, "failed to serialize result"; "error" => %e);
            ExitCode::FAILURE
        }
    };

    // The last handle on the async drain; dropping it flushes pending
    // records before the process exits.
    drop(log);
    code
}
