use crate::cli::app_config::Cli;
use clap::Parser;
use http_body_util::BodyExt;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use traceview::{
    spawn_trace_worker, InfluxHttpBackend, InfluxOptions, TraceConfig, TraceInfo, TracedClient,
    WorkerOptions,
};

pub async fn main_with_error() -> Result<(), anyhow::Error> {
    let cli: Cli = Cli::parse();
    init_logging(cli.verbosity)?;
    let config = load_config(&cli)?;
    do_request(cli, config).await
}

fn init_logging(verbosity: u8) -> Result<(), anyhow::Error> {
    let log_level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy()
        .add_directive("hyper_util=off".parse()?)
        .add_directive("rustls=off".parse()?);
    let subscriber = tracing_subscriber::fmt()
        .without_time()
        .with_level(verbosity > 0)
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<TraceConfig, anyhow::Error> {
    let mut config = match &cli.config_path {
        Some(path) => TraceConfig::from_json_file(path)?,
        None => TraceConfig::default(),
    };
    if cli.skip_certificate_validate {
        config.client.skip_certificate_validate = true;
    }
    if cli.http2 {
        config.client.http2 = true;
    }
    if let Some(path) = &cli.certificate_path_option {
        config.client.certificate_path = Some(path.clone());
    }
    if let Some(url) = &cli.influx_url {
        match config.influx.as_mut() {
            Some(influx) => influx.url = url.clone(),
            None => {
                config.influx = Some(InfluxOptions {
                    url: url.clone(),
                    username: None,
                    password: None,
                })
            }
        }
    }
    if let Some(database) = &cli.database {
        config.worker.database = database.clone();
    }
    Ok(config)
}

async fn do_request(cli: Cli, config: TraceConfig) -> Result<(), anyhow::Error> {
    let client = TracedClient::new(&config.client)?;
    let max_time = Duration::try_from_secs_f64(cli.max_time)
        .map_err(|e| anyhow!("invalid max time {}: {}", cli.max_time, e))?;
    let (request, _guard) = client.new_traced_request_with_timeout(
        cli.method_option.as_deref().unwrap_or(""),
        &cli.url,
        cli.body_option.clone().unwrap_or_default(),
        max_time,
    )?;
    if cli.verbosity > 0 {
        println!("> {} {}", request.method(), request.uri());
        for (key, value) in request.headers().iter() {
            println!("> {}: {}", key, value.to_str()?);
        }
    }

    let res = client.execute_with_deadline(request).await?;
    let trace = res.extensions().get::<TraceInfo>().cloned();
    println!("< {:?} {}", res.version(), res.status());
    if cli.verbosity > 0 {
        for (key, value) in res.headers().iter() {
            println!("< {}: {}", key, value.to_str()?);
        }
    }
    let body = res.into_body().collect().await?.to_bytes();
    debug!("received {} byte(s) of body", body.len());

    let Some(info) = trace else {
        warn!("no trace was captured for {}", cli.url);
        return Ok(());
    };
    if cli.json {
        println!("{}", info.to_json());
    } else {
        println!("{}", info);
    }
    if let Some(influx) = &config.influx {
        report(influx, &config.worker, info).await?;
    }
    Ok(())
}

async fn report(
    influx: &InfluxOptions,
    worker: &WorkerOptions,
    info: TraceInfo,
) -> Result<(), anyhow::Error> {
    let backend = InfluxHttpBackend::new(influx)?;
    let (sink, handle) = spawn_trace_worker(backend, worker.clone());
    if !sink.deliver(info) {
        return Err(anyhow!("trace could not be queued for {}", influx.url));
    }
    handle.shutdown().await;
    info!("trace written to {} database {}", influx.url, worker.database);
    Ok(())
}
