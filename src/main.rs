#[cfg(target_os = "espidf")]
use esp_idf_sys as _; // Binstart

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use std::sync::Arc;
    use std::time::Duration;

    use esp_ota_updater::network::OtaHttpServer;
    use esp_ota_updater::ota::{apply_verdict, OtaService, PostBootVerifier};
    use esp_ota_updater::platform::{EspOtaPlatform, GpioDiagnostic};
    use esp_ota_updater::{config, logging, system, version};
    use log::{error, info, warn};

    esp_idf_svc::sys::link_patches();

    logging::init_logger(log::LevelFilter::Info).map_err(|e| anyhow::anyhow!("logger: {}", e))?;
    info!("{}", version::version_info());
    info!("Boot reason: {}", system::reset::get_reset_reason());

    let config = config::load_or_default()?;
    if !logging::set_max_level_from_str(&config.log_level) {
        warn!("Ignoring unknown log level '{}'", config.log_level);
    }

    let mut platform = EspOtaPlatform::new();
    let mut diagnostic = GpioDiagnostic {
        pin: config.diagnostic_pin,
        duration_ms: config.diagnostic_duration_ms,
    };
    // A failed check must not keep the OTA endpoint from starting
    match PostBootVerifier::new(&mut platform).run(&mut diagnostic) {
        Ok(verdict) => {
            info!("Post-boot check: {:?}", verdict);
            if let Err(e) = apply_verdict(&mut platform, verdict) {
                error!("{}", e);
            }
        }
        Err(e) => error!("Post-boot check failed: {}", e),
    }

    // Network bring-up is owned by the application embedding this updater
    let service = Arc::new(OtaService::new(platform, config.policy()));
    let _server = OtaHttpServer::start(service, config.reset_delay())?;

    loop {
        std::thread::sleep(Duration::from_secs(10));
    }
}

/// Runs an image through the simulated device: transfer, restart, post-boot check.
#[cfg(not(target_os = "espidf"))]
#[derive(clap::Parser, Debug)]
#[command(name = "esp-ota-updater", version, about = "Simulate an OTA update on the host")]
struct Args {
    /// Firmware image to upload (a generated one if omitted)
    image: Option<std::path::PathBuf>,

    /// Version of the image currently running on the device
    #[arg(long, default_value = "1.0.0")]
    running_version: String,

    /// Version recorded as having failed its health check
    #[arg(long)]
    last_invalid: Option<String>,

    /// Version embedded in the generated image
    #[arg(long, default_value = "2.0.0")]
    version: String,

    /// Bytes delivered per read
    #[arg(long, default_value_t = 1024)]
    chunk: usize,

    /// Buffer header bytes across chunks instead of requiring them in the first one
    #[arg(long)]
    accumulate: bool,

    /// Refuse an image carrying the running version
    #[arg(long)]
    reject_running: bool,

    /// Make the post-boot health check fail
    #[arg(long)]
    unhealthy: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    use anyhow::{anyhow, Context};
    use clap::Parser;
    use serde_json::{Map, Value};

    use esp_ota_updater::config::OtaConfig;
    use esp_ota_updater::logging;
    use esp_ota_updater::ota::sim::{firmware_image, ScriptedSource, SimDevice};
    use esp_ota_updater::ota::{apply_verdict, HeaderMode, OtaService, PostBootVerifier};
    use esp_ota_updater::system::reset_device;

    let args = Args::parse();
    let level = logging::parse_level(&args.log_level).ok_or_else(|| anyhow!("unknown log level '{}'", args.log_level))?;
    logging::init_logger(level).map_err(|e| anyhow!("logger: {}", e))?;

    let config = OtaConfig {
        recv_buffer_size: args.chunk.clamp(256, 16 * 1024),
        header_mode: if args.accumulate { HeaderMode::Accumulate } else { HeaderMode::FirstChunk },
        reject_running_version: args.reject_running,
        reset_delay_ms: 0,
        log_level: args.log_level.clone(),
        ..Default::default()
    };
    config.validate()?;

    let image = match &args.image {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        None => firmware_image(&args.version, 64 * 1024),
    };

    let mut device = SimDevice::new(&args.running_version);
    if let Some(invalid) = &args.last_invalid {
        device.set_last_invalid(invalid);
    }

    let service = OtaService::new(device, config.policy());
    let mut source = ScriptedSource::chunked(&image, args.chunk);
    let mut response = Map::new();
    let result = service.handle_update(&mut source, &mut response);
    println!("{}", serde_json::to_string_pretty(&Value::Object(response))?);

    let mut device = service.into_platform();
    match result {
        Ok(report) if report.is_committed() => {}
        Ok(_) => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    reset_device(&mut device, config.reset_delay());

    let healthy = !args.unhealthy;
    let mut health_check = || healthy;
    let verdict = PostBootVerifier::new(&mut device).run(&mut health_check)?;
    println!("post-boot verdict: {:?}", verdict);
    apply_verdict(&mut device, verdict)?;

    println!(
        "running version: {}",
        device.running_version().unwrap_or_else(|| "unknown".into())
    );
    Ok(())
}
