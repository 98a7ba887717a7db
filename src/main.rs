//! # squall
//!
//! Brings up the Vulkan native compositor under a system compositor and
//! drives a built in client that shows a blank projection layer. Useful
//! for checking a headset's display path without a real application.
use clap::Parser;
use squall::compositor::*;
use squall::native::setup::{create_device, create_native_compositor};
use squall::{Config, SessionInfo, SimulatedHmd, SystemCompositor};

use strata::{BlendMode, DirectTarget, HeadDevice, LayerData, LayerKind, ProjectionView, Rect};
use utils::{log, logging};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Parser, Debug)]
#[command(name = "squall", about = "XR compositor test driver")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frames the built in client submits before exiting
    #[arg(short, long, default_value_t = 600)]
    frames: u32,

    /// Render without a display
    #[arg(long)]
    headless: bool,

    /// Composite with compute shaders
    #[arg(long)]
    use_compute: bool,

    /// List the direct mode displays and exit
    #[arg(long)]
    print_modes: bool,

    /// Overrides the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match args.config.as_ref() {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_process_env();

    if args.headless {
        config.target = squall::config::TargetKind::Headless;
    }
    if args.use_compute {
        config.use_compute = true;
    }
    if args.print_modes {
        config.print_modes = true;
    }
    if let Some(level) = args.log_level.as_ref() {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Submit `frames` frames of a single projection layer
fn run_client(
    system: &SystemCompositor,
    hmd: &Arc<dyn HeadDevice>,
    frames: u32,
) -> anyhow::Result<()> {
    let client = system.create_client(SessionInfo::default())?;
    client.begin_session(ViewType::Stereo)?;
    client.set_state(true, true)?;

    let info = client.info();
    let (width, height) = info.views[0].recommended;
    let format = *info
        .formats
        .first()
        .ok_or_else(|| anyhow::anyhow!("The compositor supports no formats"))?;
    let sc = client.create_swapchain(&SwapchainCreateInfo::new(width, height, format))?;

    let views = hmd.views();
    let view = |i: usize| ProjectionView {
        sub: strata::SubImage {
            image_index: 0,
            array_index: 0,
            rect: Rect::new(0, 0, width as i32, height as i32),
        },
        fov: views[i].fov,
        pose: hmd.eye_poses()[i],
    };

    for _ in 0..frames {
        let t = client.wait_frame()?;
        client.begin_frame(t.frame_id)?;

        let index = sc.acquire_image()?;
        sc.wait_image(100_000_000, index)?;
        sc.release_image(index)?;

        let mut l = view(0);
        let mut r = view(1);
        l.sub.image_index = index;
        r.sub.image_index = index;
        let data = LayerData::new(LayerKind::StereoProjection { l: l, r: r });

        client.layer_begin(t.frame_id, t.predicted_display_time, BlendMode::Opaque)?;
        client.layer_stereo_projection(hmd, &sc, &sc, &data)?;
        client.layer_commit(t.frame_id, GraphicsSyncHandle::invalid())?;

        while client.poll_events()? != Event::None {}
    }

    client.end_session()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    logging::init(config.log_level()?);

    if config.print_modes {
        let dev = create_device(&config)?;
        DirectTarget::print_modes(&dev)?;
        return Ok(());
    }

    let hmd: Arc<dyn HeadDevice> = Arc::new(SimulatedHmd::from_config(&config));
    let native = create_native_compositor(&config, hmd.clone(), None)?;
    let system = SystemCompositor::new(Arc::new(native), &config)?;

    log::info!("Running {} frames", args.frames);
    let start = SystemTime::now();
    run_client(&system, &hmd, args.frames)?;

    log::info!(
        "Done after {:.2}s",
        start.elapsed().map(|d| d.as_secs_f32()).unwrap_or(0.0)
    );
    Ok(())
}
