#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::{fs, path::PathBuf, sync::Arc};

use clap::Parser;
use onyx_gpu::{
    BufferCreateInfo, GpuDevice, GpuDeviceConfig, MemoryUsage, ResultCode,
    TextureCreateInfo, VulkanGpuDevice, WindowSource, ash::vk,
    debug::VulkanLogLevel,
};
use onyx_log::{LogConfig, SeverityFlags};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle,
    WindowHandle,
};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window as WinitWindow, WindowId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliSeverity {
    All,
    None,
    General,
    Debug,
    Status,
    Warnings,
    Errors,
    Validation,
}

impl From<CliSeverity> for SeverityFlags {
    fn from(value: CliSeverity) -> Self {
        match value {
            CliSeverity::All => SeverityFlags::ALL,
            CliSeverity::None => SeverityFlags::NONE,
            CliSeverity::General => SeverityFlags::GENERAL,
            CliSeverity::Debug => SeverityFlags::DEBUG,
            CliSeverity::Status => SeverityFlags::STATUS,
            CliSeverity::Warnings => SeverityFlags::WARNINGS,
            CliSeverity::Errors => SeverityFlags::ERRORS,
            CliSeverity::Validation => SeverityFlags::VALIDATION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => VulkanLogLevel::Error,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    /// Comma-separated severity channels to print.
    #[arg(short, long, value_delimiter = ',', default_value = "all")]
    log_severity: Vec<CliSeverity>,
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    #[arg(long)]
    no_validation: bool,
    /// Frames to run before exiting.
    #[arg(short, long, default_value_t = 1_000_000)]
    frames: u64,
    #[arg(long)]
    log_to_file: bool,
    #[arg(long, default_value_t = 1600)]
    width: u32,
    #[arg(long, default_value_t = 900)]
    height: u32,
}

impl CliArgs {
    fn severity(&self) -> SeverityFlags {
        self.log_severity
            .iter()
            .fold(SeverityFlags::NONE, |mask, &s| {
                mask | SeverityFlags::from(s)
            })
    }

    fn device_config(&self) -> GpuDeviceConfig {
        let defaults = GpuDeviceConfig::default();
        GpuDeviceConfig {
            app_name: "testbed".to_owned(),
            validation: defaults.validation && !self.no_validation,
            messenger_log_level: self
                .graphics_debug_level
                .map_or(defaults.messenger_log_level, Into::into),
            ..defaults
        }
    }
}

fn log_file_path() -> eyre::Result<PathBuf> {
    let app_dirs = directories::ProjectDirs::from("", "onyx", "testbed");
    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    fs::create_dir_all(&log_dir)?;

    let mut log_file_path = log_dir;
    log_file_path.push("log-file");
    log_file_path.set_extension("txt");
    Ok(log_file_path)
}

fn main() -> eyre::Result<()> {
    let cli_args = CliArgs::parse();

    let log_file = if cli_args.log_to_file {
        Some(log_file_path()?)
    } else {
        None
    };
    let logger = onyx_log::init(LogConfig {
        severity: cli_args.severity(),
        log_file,
        ..Default::default()
    })?;
    if let Some(path) = logger.log_file() {
        tracing::info!("log_file_path: {}", path.display());
    }
    tracing::debug!("cli_args: {:#?}", cli_args);

    onyx_gpu::initialize();
    let result = run(&cli_args);
    if let Err(e) = &result {
        onyx_log::fatal!("{e:?}");
    }
    onyx_gpu::terminate();
    result
}

fn run(cli_args: &CliArgs) -> eyre::Result<()> {
    let event_loop = EventLoop::builder().build()?;

    let mut app = AppRunner {
        app: Some(App::Initializing(InitializingState {
            gpu: Box::new(VulkanGpuDevice::new(cli_args.device_config())),
            frame_budget: cli_args.frames,
            size: LogicalSize::new(cli_args.width, cli_args.height),
        })),
        failure: None,
    };

    tracing::trace!("Entering main event loop");
    event_loop.run_app(&mut app)?;
    app.finish()
}

/// The winit window as the device sees it.
#[derive(Debug)]
struct AppWindow(WinitWindow);

impl HasDisplayHandle for AppWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.0.display_handle()
    }
}

impl HasWindowHandle for AppWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.0.window_handle()
    }
}

impl WindowSource for AppWindow {
    fn width(&self) -> u32 {
        self.0.inner_size().width
    }

    fn height(&self) -> u32 {
        self.0.inner_size().height
    }
}

type Gpu = Box<dyn GpuDevice<AppWindow>>;

struct AppRunner {
    app: Option<App>,
    failure: Option<eyre::Report>,
}

enum App {
    Initializing(InitializingState),
    Running(RunningState),
    Exiting,
}

struct InitializingState {
    gpu: Gpu,
    frame_budget: u64,
    size: LogicalSize<u32>,
}

struct RunningState {
    win: Arc<AppWindow>,
    gpu: Gpu,
    frame: u64,
    frame_budget: u64,
}

/// Create and destroy one buffer and one texture, logging the result
/// code of each step.
fn resource_round_trip(gpu: &dyn GpuDevice<AppWindow>) -> eyre::Result<()> {
    let buffer = gpu.create_buffer(&BufferCreateInfo {
        name: "Testbed Staging Buffer",
        size: 64 * 1024,
        usage: vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST,
        memory: MemoryUsage::CpuToGpu,
    });
    tracing::info!("CreateBuffer: {:?}", ResultCode::of(&buffer));
    let buffer = buffer?;

    let texture = gpu.create_texture(&TextureCreateInfo {
        name: "Testbed Texture",
        width: 256,
        height: 256,
        usage: vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_DST,
        ..Default::default()
    });
    tracing::info!("CreateTexture: {:?}", ResultCode::of(&texture));
    let texture = texture?;

    gpu.destroy_texture(&texture)?;
    gpu.destroy_buffer(&buffer)?;
    Ok(())
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let Some(App::Initializing(_)) = &self.app else {
            return;
        };
        let Some(App::Initializing(state)) = self.app.take() else {
            return;
        };
        let InitializingState {
            mut gpu,
            frame_budget,
            size,
        } = state;

        let win = match event_loop.create_window(
            WinitWindow::default_attributes()
                .with_title("Onyx Testbed")
                .with_inner_size(size),
        ) {
            Ok(w) => Arc::new(AppWindow(w)),
            Err(e) => {
                self.fail(eyre::eyre!("Error while creating window: {e}"));
                self.exit(gpu, event_loop);
                return;
            }
        };

        if let Err(e) = gpu.init(Arc::clone(&win)) {
            self.fail(e.into());
            self.exit(gpu, event_loop);
            return;
        }

        match resource_round_trip(gpu.as_ref()) {
            Ok(()) => onyx_log::success!("Resource round trip"),
            Err(e) => onyx_log::failure!("Resource round trip: {e}"),
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        tracing::debug!("State transition: Initializing -> Running");
        self.app = Some(App::Running(RunningState {
            win,
            gpu,
            frame: 0,
            frame_budget,
        }));
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        window_event: WindowEvent,
    ) {
        let Some(App::Running(running)) = &mut self.app else {
            return;
        };
        if window_id != running.win.0.id() {
            return;
        }

        match window_event {
            WindowEvent::CloseRequested => {
                tracing::trace!("Close window request received for window");
                self.exit_from_running(event_loop);
            }
            WindowEvent::Resized(_)
            | WindowEvent::ScaleFactorChanged { .. } => {
                if let Err(e) = running.gpu.create_swapchain() {
                    self.fail(e.into());
                    self.exit_from_running(event_loop);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(App::Running(running)) = &mut self.app else {
            return;
        };
        running.frame += 1;
        if running.frame >= running.frame_budget {
            onyx_log::success!("Ran {} frames", running.frame);
            self.exit_from_running(event_loop);
        }
    }
}

impl AppRunner {
    /// Keep the first failure; `main` reports it.
    fn fail(&mut self, report: eyre::Report) {
        match &self.failure {
            Some(_) => tracing::debug!("Dropping follow-up failure: {report}"),
            None => self.failure = Some(report),
        }
    }

    fn exit(&mut self, mut gpu: Gpu, event_loop: &ActiveEventLoop) {
        gpu.shutdown();
        self.app = Some(App::Exiting);
        event_loop.exit();
    }

    fn exit_from_running(&mut self, event_loop: &ActiveEventLoop) {
        match self.app.take() {
            Some(App::Running(running)) => {
                tracing::debug!("State transition: Running -> Exiting");
                self.exit(running.gpu, event_loop);
            }
            other => {
                tracing::warn!(
                    "Requested Running -> Exiting transition while not in \
                     Running state"
                );
                self.app = other;
                event_loop.exit();
            }
        }
    }

    /// Shut down whatever is still alive and surface the first failure.
    fn finish(mut self) -> eyre::Result<()> {
        match self.app.take() {
            Some(App::Running(RunningState { mut gpu, .. }))
            | Some(App::Initializing(InitializingState { mut gpu, .. })) => {
                gpu.shutdown()
            }
            Some(App::Exiting) | None => {}
        }
        match self.failure.take() {
            Some(report) => Err(report),
            None => Ok(()),
        }
    }
}
