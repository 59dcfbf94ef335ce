#[cfg(not(target_arch = "wasm32"))]
fn main() {
    env_logger::init();
    if let Err(err) = native::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

#[cfg(target_arch = "wasm32")]
fn main() {}

/// Command-line runner; the wasm32 build is driven from `model_viewer::web`.
#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::any::Any;
    use std::env;
    use std::fmt;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;

    use anyhow::{anyhow, Context, Result};
    use log::info;
    use pollster::block_on;
    use winit::dpi::LogicalSize;
    use winit::event_loop::EventLoop;
    use winit::window::WindowBuilder;

    use model_viewer::app::{self, HeadlessBackend};
    use model_viewer::{
        DeviceProfile, DeviceSignals, GpuBackend, LaunchContext, NativeTransport, NavigationContext,
        RenderBackend, ViewState, Viewer, ViewerConfig, Viewport,
    };

    const USAGE: &str = "Usage: model-viewer [--model URL|PATH] [--uuid ID] [--ext EXT] [--launch PARAM] \
    [--route PATH] [--base-url URL] [--summary-only] [--debug]";

    pub fn run() -> Result<()> {
        let options = CliOptions::parse(env::args().skip(1))?;
        let mut config = ViewerConfig::from_env()?;
        if let Some(base_url) = &options.base_url {
            config.base_url = base_url.clone();
        }
        let transport = NativeTransport::new()?;
        let profile = DeviceProfile::classify(&DeviceSignals::native());
        info!("Device profile: {profile:?}");

        if options.summary_only {
            return run_headless(&options, config, profile, &transport);
        }
        match run_interactive(&options, config.clone(), profile, &transport) {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.downcast_ref::<WindowInitError>().is_some() {
                    eprintln!(
                        "{err}. Falling back to --summary-only mode (set DISPLAY or install X11 libs to enable rendering)."
                    );
                    run_headless(&options, config, profile, &transport)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn run_headless(
        options: &CliOptions,
        config: ViewerConfig,
        profile: DeviceProfile,
        transport: &NativeTransport,
    ) -> Result<()> {
        let mut viewer: Viewer<HeadlessBackend> =
            Viewer::new(config, profile, Viewport::new(1280.0, 720.0, 1.0));
        app::load_model(
            &mut viewer,
            transport,
            &options.navigation(),
            options.launch().as_ref(),
            || Ok(HeadlessBackend::default()),
        );
        app::print_summary(&viewer, options.launch.is_some());
        finish(options, &viewer)
    }

    fn run_interactive(
        options: &CliOptions,
        config: ViewerConfig,
        profile: DeviceProfile,
        transport: &NativeTransport,
    ) -> Result<()> {
        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        let event_loop = panic::catch_unwind(AssertUnwindSafe(EventLoop::new));
        panic::set_hook(default_hook);
        let mut event_loop = event_loop
            .map_err(|panic| WindowInitError::from_panic("event loop", panic))?
            .map_err(|err| WindowInitError::from_error("event loop", err))?;
        let window = Arc::new(
            WindowBuilder::new()
                .with_title("Model Viewer")
                .with_inner_size(LogicalSize::new(1280.0, 720.0))
                .build(&event_loop)
                .map_err(|err| WindowInitError::from_error("window", err))?,
        );

        let mut viewer: Viewer<GpuBackend> = Viewer::new(config, profile, app::window_viewport(&window));
        let surface_window = Arc::clone(&window);
        app::load_model(
            &mut viewer,
            transport,
            &options.navigation(),
            options.launch().as_ref(),
            move || {
                let size = surface_window.inner_size();
                block_on(GpuBackend::new(surface_window, size.width, size.height))
            },
        );
        app::print_summary(&viewer, options.launch.is_some());
        if !matches!(viewer.state(), ViewState::Ready) {
            return finish(options, &viewer);
        }

        if let Some(url) = viewer.download_url() {
            window.set_title(&format!("Model Viewer - {url}"));
        }
        app::run_window(&mut event_loop, window, &mut viewer)?;
        finish(options, &viewer)
    }

    /// Prints the diagnostics trace when asked and turns a failed load into an
    /// error exit.
    fn finish<B: RenderBackend>(options: &CliOptions, viewer: &Viewer<B>) -> Result<()> {
        if options.debug {
            eprintln!("{}", viewer.diagnostics().render_trace());
        }
        match viewer.state() {
            ViewState::Failed(err) => Err(anyhow::Error::new(err.clone())).context("model could not be shown"),
            _ => Ok(()),
        }
    }

    #[derive(Debug)]
    struct WindowInitError {
        message: String,
    }

    impl WindowInitError {
        fn from_panic(stage: &str, panic: Box<dyn Any + Send>) -> Self {
            Self {
                message: format!("failed to initialize {stage}: {}", panic_message(panic)),
            }
        }

        fn from_error(stage: &str, err: impl fmt::Display) -> Self {
            Self {
                message: format!("failed to initialize {stage}: {err}"),
            }
        }
    }

    impl fmt::Display for WindowInitError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.message)
        }
    }

    impl std::error::Error for WindowInitError {}

    fn panic_message(panic: Box<dyn Any + Send>) -> String {
        match panic.downcast::<String>() {
            Ok(msg) => *msg,
            Err(panic) => match panic.downcast::<&'static str>() {
                Ok(msg) => (*msg).to_string(),
                Err(_) => "unknown panic".into(),
            },
        }
    }

    #[derive(Debug, Default)]
    struct CliOptions {
        model: Option<String>,
        uuid: Option<String>,
        ext: Option<String>,
        launch: Option<String>,
        route: Option<String>,
        base_url: Option<String>,
        summary_only: bool,
        debug: bool,
    }

    impl CliOptions {
        fn parse(args: impl Iterator<Item = String>) -> Result<Self> {
            let mut options = Self::default();
            let mut args = args;
            while let Some(arg) = args.next() {
                let slot = match arg.as_str() {
                    "--summary-only" => {
                        options.summary_only = true;
                        continue;
                    }
                    "--debug" => {
                        options.debug = true;
                        continue;
                    }
                    "--help" | "-h" => return Err(anyhow!(USAGE)),
                    "--model" => &mut options.model,
                    "--uuid" => &mut options.uuid,
                    "--ext" => &mut options.ext,
                    "--launch" => &mut options.launch,
                    "--route" => &mut options.route,
                    "--base-url" => &mut options.base_url,
                    other => return Err(anyhow!("Unknown argument: {other}. {USAGE}")),
                };
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("{arg} expects a value. {USAGE}"))?;
                *slot = Some(value);
            }
            Ok(options)
        }

        /// The navigation a browser would see for the same request.
        fn navigation(&self) -> NavigationContext {
            let mut query = Vec::new();
            for (key, value) in [("model", &self.model), ("uuid", &self.uuid), ("ext", &self.ext)] {
                if let Some(value) = value {
                    query.push((key.to_string(), value.clone()));
                }
            }
            if self.debug {
                query.push(("debug".to_string(), "1".to_string()));
            }
            NavigationContext {
                path: self.route.clone().unwrap_or_else(|| "/".to_string()),
                query,
            }
        }

        fn launch(&self) -> Option<LaunchContext> {
            self.launch.as_ref().map(|param| LaunchContext {
                start_param: Some(param.clone()),
                start_command: None,
            })
        }
    }
}
