//! Windowed triangle demo for the glaze layer.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod render;

use std::fs::{self, File};
use std::sync::Arc;

use clap::Parser;
use eyre::WrapErr;
use glaze::ash::vk;
use glaze::device::Device;
use glaze::instance::{DebugLevel, Instance, InstanceDesc};
use glaze::surface::Surface;
use glaze::swapchain::{PresentPolicy, Swapchain};
use render::{FrameOutcome, Renderer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowAttributes, WindowId};

const TINT: [f32; 4] = [1.0, 1.0, 0.92, 1.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum LogLevel {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> Option<tracing::Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(tracing::Level::ERROR),
            LogLevel::Warn => Some(tracing::Level::WARN),
            LogLevel::Info => Some(tracing::Level::INFO),
            LogLevel::Debug => Some(tracing::Level::DEBUG),
            LogLevel::Trace => Some(tracing::Level::TRACE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliDebugLevel {
    Error,
    Warning,
    Info,
    Verbose,
}

impl From<CliDebugLevel> for DebugLevel {
    fn from(value: CliDebugLevel) -> Self {
        match value {
            CliDebugLevel::Error => DebugLevel::Error,
            CliDebugLevel::Warning => DebugLevel::Warning,
            CliDebugLevel::Info => DebugLevel::Info,
            CliDebugLevel::Verbose => DebugLevel::Verbose,
        }
    }
}

#[derive(Debug, Parser)]
struct Cli {
    /// Stdout log verbosity.
    #[arg(long, default_value = "warn")]
    log: LogLevel,

    /// Enable the Vulkan validation messenger at the given severity.
    #[arg(long)]
    vulkan_debug: Option<CliDebugLevel>,

    /// Prefer mailbox presentation over strict FIFO when available.
    #[arg(long)]
    low_latency: bool,
}

fn init_logging(level: LogLevel) -> eyre::Result<()> {
    let Some(filter_level) = level.as_filter() else {
        return Ok(());
    };

    let log_dir = directories::ProjectDirs::from("", "", "glaze-app")
        .map(|dirs| dirs.data_dir().to_owned())
        .map_or_else(std::env::current_dir, Ok)?;
    fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join("glaze-app.log");
    let log_file = File::create(&log_path)?;
    eprintln!("logging to {}", log_path.display());

    let stdout_layer = tracing_subscriber::fmt::layer().pretty().with_filter(
        tracing_subscriber::filter::LevelFilter::from_level(filter_level),
    );
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    tracing_subscriber::registry()
        .with(stdout_layer.and_then(file_layer))
        .init();
    Ok(())
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log)?;

    let event_loop = EventLoop::builder().build()?;

    // SAFETY: loading the system Vulkan library is the point of the program.
    let instance = Arc::new(unsafe {
        Instance::new(InstanceDesc {
            app_name: "glaze-app",
            windowing: Some(&event_loop),
            debug: cli.vulkan_debug.map(Into::into),
        })
    }?);

    let policy = PresentPolicy {
        low_latency: cli.low_latency,
        ..Default::default()
    };

    let mut shell = Shell(Some(AppState::Boot(BootState { instance, policy })));
    event_loop.run_app(&mut shell)?;
    Ok(())
}

struct BootState {
    instance: Arc<Instance>,
    policy: PresentPolicy,
}

struct ActiveState {
    window: Arc<Window>,
    surface: Arc<Surface<Window>>,
    device: Arc<Device>,
    policy: PresentPolicy,
    /// `None` while the window is zero-sized.
    swapchain: Option<Swapchain<Window>>,
    renderer: Option<Renderer>,
}

struct ParkedState {
    instance: Arc<Instance>,
    window: Arc<Window>,
    device: Arc<Device>,
    policy: PresentPolicy,
}

enum AppState {
    Boot(BootState),
    Active(ActiveState),
    Parked(ParkedState),
    Finished,
}

struct Shell(Option<AppState>);

impl Shell {
    fn fail(&mut self, event_loop: &ActiveEventLoop, context: &str, error: impl std::fmt::Display) {
        tracing::error!("{context}: {error}");
        self.0 = Some(AppState::Finished);
        event_loop.exit();
    }
}

impl ActiveState {
    fn window_extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    /// Replace (or park) the swapchain for `extent`, then bring the renderer
    /// in line with the new images.
    fn rebuild_swapchain(&mut self, extent: vk::Extent2D) -> eyre::Result<()> {
        if extent.width == 0 || extent.height == 0 {
            tracing::debug!("zero extent, parking swapchain");
            self.device.wait_idle()?;
            self.swapchain = None;
            return Ok(());
        }

        // Idling here keeps semaphore and image-view replacement trivially
        // safe; resize is nowhere near a hot path.
        self.device.wait_idle()?;
        let swapchain = Swapchain::new_with_old(
            &self.device,
            &self.surface,
            extent,
            &self.policy,
            self.swapchain.as_ref(),
        )
        .wrap_err("recreating swapchain")?;

        let format = swapchain.format().format;
        match self.renderer.as_mut() {
            Some(renderer) if renderer.color_format() == format => {
                renderer.reset_present_targets(swapchain.image_count())?;
            }
            _ => {
                self.renderer = Some(Renderer::new(
                    &self.device,
                    format,
                    swapchain.image_count(),
                    TINT,
                )?);
            }
        }
        self.swapchain = Some(swapchain);
        Ok(())
    }

    fn draw_frame(&mut self) -> eyre::Result<()> {
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(());
        };
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };
        match renderer.draw(swapchain)? {
            FrameOutcome::Drawn => Ok(()),
            FrameOutcome::NeedsRecreation => {
                let extent = self.window_extent();
                self.rebuild_swapchain(extent)
            }
        }
    }
}

fn activate(
    instance: &Arc<Instance>,
    window: Arc<Window>,
    device: Option<Arc<Device>>,
    policy: PresentPolicy,
) -> eyre::Result<ActiveState> {
    // SAFETY: the surface is torn down in `suspended` before the window's
    // native handle can go away, and `rebuild_swapchain` idles the device
    // before replacing anything derived from it.
    let surface = Arc::new(unsafe { Surface::new(instance, Arc::clone(&window)) }?);
    let device = match device {
        Some(existing) => existing,
        None => Device::new_presentable(instance, &surface)?,
    };

    let mut state = ActiveState {
        window,
        surface,
        device,
        policy,
        swapchain: None,
        renderer: None,
    };
    let extent = state.window_extent();
    state.rebuild_swapchain(extent)?;
    Ok(state)
}

impl ApplicationHandler for Shell {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        match self.0.take() {
            Some(AppState::Boot(boot)) => {
                event_loop.set_control_flow(ControlFlow::Poll);
                let attributes = WindowAttributes::default()
                    .with_title("glaze")
                    .with_inner_size(LogicalSize::new(1280, 720));
                let window = match event_loop.create_window(attributes) {
                    Ok(window) => Arc::new(window),
                    Err(e) => return self.fail(event_loop, "creating window", e),
                };
                match activate(&boot.instance, window, None, boot.policy) {
                    Ok(active) => {
                        tracing::debug!("state: Boot -> Active");
                        self.0 = Some(AppState::Active(active));
                    }
                    Err(e) => self.fail(event_loop, "initializing renderer", e),
                }
            }
            Some(AppState::Parked(parked)) => {
                event_loop.set_control_flow(ControlFlow::Poll);
                match activate(
                    &parked.instance,
                    parked.window,
                    Some(parked.device),
                    parked.policy,
                ) {
                    Ok(active) => {
                        tracing::debug!("state: Parked -> Active");
                        self.0 = Some(AppState::Active(active));
                    }
                    Err(e) => self.fail(event_loop, "resuming renderer", e),
                }
            }
            other => self.0 = other,
        }
    }

    fn suspended(&mut self, event_loop: &ActiveEventLoop) {
        match self.0.take() {
            Some(AppState::Active(active)) => {
                event_loop.set_control_flow(ControlFlow::Wait);
                if let Err(e) = active.device.wait_idle() {
                    return self.fail(event_loop, "idling device for suspend", e);
                }
                tracing::debug!("state: Active -> Parked");
                // Dropping `active` below tears down the swapchain and the
                // surface before the platform invalidates the window handle.
                self.0 = Some(AppState::Parked(ParkedState {
                    instance: Arc::clone(active.surface.instance()),
                    window: Arc::clone(&active.window),
                    device: Arc::clone(&active.device),
                    policy: active.policy.clone(),
                }));
            }
            other => self.0 = other,
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        let Some(AppState::Active(active)) = self.0.as_mut() else {
            return;
        };
        if active.window.id() != window_id {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                tracing::debug!("close requested");
                if let Err(e) = active.device.wait_idle() {
                    tracing::error!("idling device on close: {e}");
                }
                self.0 = Some(AppState::Finished);
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                let extent = vk::Extent2D {
                    width: size.width,
                    height: size.height,
                };
                let unchanged = active
                    .swapchain
                    .as_ref()
                    .is_some_and(|s| s.extent() == extent);
                if unchanged {
                    return;
                }
                if let Err(e) = active.rebuild_swapchain(extent) {
                    self.fail(event_loop, "handling resize", e);
                }
            }
            WindowEvent::ScaleFactorChanged { .. } => {
                let extent = active.window_extent();
                if let Err(e) = active.rebuild_swapchain(extent) {
                    self.fail(event_loop, "handling scale change", e);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = active.draw_frame() {
                    self.fail(event_loop, "drawing frame", e);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(AppState::Active(active)) = self.0.as_ref() {
            active.window.request_redraw();
        }
    }
}
