use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use linux_embedded_hal::I2cdev;
use rover_core::utils::{
    camera::{
        demux::DEFAULT_MAX_BUFFER,
        still::RpicamStill,
        stream::{RpicamVid, StreamLimits},
    },
    connection::server::{AppState, ServerConfig},
    controllers::{i2c::DEFAULT_PWM_ADDRESS, DriveConfig, LogActuator, Pca9685Actuator},
    math::mixing::MixPolicy,
    serve,
    DriveHandle,
    MotorDrive,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Slack on top of the stream stop budget for sessions to flush and unregister.
const SESSION_SLACK: Duration = Duration::from_secs(2);
const SELF_TEST_DUTY: f32 = 30.0;
const SELF_TEST_PULSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ActuatorKind {
    /// log every motor command, drive nothing
    Log,
    /// H-bridge behind a PCA9685 PWM expander on I2C
    Pca9685,
}

#[derive(Parser)]
#[clap(version = "1.0", about = "Differential-drive rover control and camera server")]
struct Opts {
    /// address to listen on
    #[clap(long, default_value = "0.0.0.0")]
    bind: IpAddr,
    #[clap(long, default_value_t = 8765)]
    port: u16,
    /// starting speed in percent
    #[clap(long, default_value_t = 80)]
    default_speed: u8,
    /// joystick dead-zone radius
    #[clap(long, default_value_t = 0.05)]
    dead_zone: f32,
    /// joystick normalization: clamp | scale
    #[clap(long, default_value = "scale")]
    mix_policy: MixPolicy,
    /// time a video process gets to exit after SIGTERM
    #[clap(long, default_value_t = 2000)]
    stop_timeout_ms: u64,
    /// bytes buffered without a complete frame before a stream is dropped
    #[clap(long, default_value_t = DEFAULT_MAX_BUFFER)]
    max_buffer: usize,
    #[clap(long, default_value = "rpicam-vid")]
    video_program: PathBuf,
    #[clap(long, default_value = "rpicam-still")]
    still_program: PathBuf,
    /// pulse each motor once at startup
    #[clap(long)]
    self_test: bool,
    /// motor backend
    #[clap(long, value_enum, default_value_t = ActuatorKind::Log)]
    actuator: ActuatorKind,
    #[clap(long, default_value = "/dev/i2c-1")]
    i2c_bus: PathBuf,
    /// I2C address of the PWM expander, decimal or 0x-prefixed
    #[clap(long, default_value_t = DEFAULT_PWM_ADDRESS, value_parser = parse_address)]
    pwm_address: u8,
    /// swap forward/backward on the left motor
    #[clap(long)]
    invert_left: bool,
    /// swap forward/backward on the right motor
    #[clap(long)]
    invert_right: bool,
}

fn parse_address(arg: &str) -> Result<u8, std::num::ParseIntError> {
    match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => arg.parse(),
    }
}

/// Build the drive on the selected backend. Missing hardware fails here.
fn build_drive(opts: &Opts) -> anyhow::Result<MotorDrive> {
    let config = DriveConfig::new(
        Some(opts.default_speed),
        Some(opts.dead_zone),
        Some(opts.mix_policy),
    );
    let drive = match opts.actuator {
        ActuatorKind::Log => {
            info!("no motor hardware selected, motor commands are only logged");
            MotorDrive::new(LogActuator::default(), config)
        }
        ActuatorKind::Pca9685 => {
            let bus = I2cdev::new(&opts.i2c_bus)
                .with_context(|| format!("failed to open I2C bus {}", opts.i2c_bus.display()))?;
            let mut motors = Pca9685Actuator::new(bus, opts.pwm_address)
                .context("failed to create PCA9685 driver")?
                .with_inverted(opts.invert_left, opts.invert_right);
            motors.configure().with_context(|| {
                format!("no PCA9685 answering at {:#04x}", opts.pwm_address)
            })?;
            info!(
                bus = %opts.i2c_bus.display(),
                address = opts.pwm_address,
                "PCA9685 motor driver ready"
            );
            MotorDrive::new(motors, config)
        }
    };
    Ok(drive)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opts: Opts = Opts::parse();

    let drive = DriveHandle::new(build_drive(&opts)?);
    if opts.self_test {
        info!("Running startup motor diagnostic...");
        drive.self_test(SELF_TEST_DUTY, SELF_TEST_PULSE).await;
    }

    let limits = StreamLimits::new(
        Some(Duration::from_millis(opts.stop_timeout_ms)),
        Some(opts.max_buffer),
    );
    let state = Arc::new(AppState::new(
        drive.clone(),
        Arc::new(RpicamVid::new(opts.video_program.clone())),
        Arc::new(RpicamStill::new(opts.still_program.clone())),
        limits,
    ));
    let config = ServerConfig {
        bind: opts.bind,
        port: opts.port,
    };

    let server_stop = CancellationToken::new();
    let mut server = tokio::spawn(serve(config, state.clone(), server_stop.clone()));

    tokio::select! {
        _ = shutdown_signal() => info!("Shutting down..."),
        result = &mut server => {
            // the server only returns on its own when it failed
            state.shutdown.cancel();
            drive.stop();
            return result
                .context("server task panicked")?
                .with_context(|| format!("server on {} failed", config.addr()));
        }
    }

    // sessions stop their streams, then the motors
    state.shutdown.cancel();
    state.tracker.close();
    let drain = limits.stop_budget() + SESSION_SLACK;
    if tokio::time::timeout(drain, state.tracker.wait()).await.is_err() {
        warn!(remaining = state.tracker.len(), "sessions did not finish cleanup in time");
    }
    drive.stop();

    server_stop.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(%err, "server error during shutdown"),
        Err(err) => error!(%err, "server task failed"),
    }
    info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pwm_address_forms() {
        assert_eq!(parse_address("0x41"), Ok(0x41));
        assert_eq!(parse_address("64"), Ok(0x40));
        assert!(parse_address("0x1ff").is_err());
    }

    #[test]
    fn test_actuator_selection() {
        let opts = Opts::try_parse_from(["rover-pi"]).unwrap();
        assert_eq!(opts.actuator, ActuatorKind::Log);
        assert_eq!(opts.pwm_address, DEFAULT_PWM_ADDRESS);
        assert!(build_drive(&opts).is_ok());

        let opts = Opts::try_parse_from([
            "rover-pi",
            "--actuator",
            "pca9685",
            "--i2c-bus",
            "/nonexistent/i2c-9",
            "--pwm-address",
            "0x41",
            "--invert-left",
        ])
        .unwrap();
        assert_eq!(opts.actuator, ActuatorKind::Pca9685);
        assert_eq!(opts.pwm_address, 0x41);
        assert!(opts.invert_left && !opts.invert_right);

        let err = build_drive(&opts).err().unwrap();
        assert!(err.to_string().contains("/nonexistent/i2c-9"), "{err:#}");
    }
}
