// lsv-renderer - Vulkan frame orchestration engine
//
// The host loop lives here: it owns the window, forwards resize/quit
// signals, asks the overlay layer for its per-frame draw data, and calls
// `Renderer::draw` once per redraw. Everything GPU-side is owned by the
// renderer.
//
// FRAME FLOW:
// 1. Poll window events (resize marks the swapchain stale, close quits)
// 2. Rebuild the swapchain if it was flagged stale
// 3. Ask the overlay collaborator for this frame's draw data
// 4. draw(): wait slot fence -> acquire -> record -> submit -> present

mod backend;
mod config;
mod overlay;
mod renderer;

use anyhow::{Context, Result};
use config::Config;
use overlay::{OverlayLayer, StatsOverlay};
use renderer::Renderer;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

fn main() -> Result<()> {
    let config = Config::load();

    init_logging();
    log::info!("Starting {}", config.window.title);
    log::info!("Window: {}x{}", config.window.width, config.window.height);
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // A fatal graphics error terminates with a nonzero exit code after the
    // error chain has been logged.
    match app.fatal_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

/// Host application state: the window, the renderer, and the overlay
/// collaborator producing per-frame draw data.
struct App {
    config: Config,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    stats: StatsOverlay,
    is_minimized: bool,
    last_frame_time: Instant,
    fatal_error: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        let stats = StatsOverlay::new(config.debug.show_fps);
        Self {
            config,
            window: None,
            renderer: None,
            stats,
            is_minimized: false,
            last_frame_time: Instant::now(),
            fatal_error: None,
        }
    }

    fn redraw(&mut self) -> Result<()> {
        let window = self.window.clone().context("Window not created")?;
        let renderer = self.renderer.as_mut().context("Renderer not created")?;

        // A stale swapchain is rebuilt here, between frames, never inside
        // a frame that already started.
        if renderer.swapchain_stale {
            let size = window.inner_size();
            if size.width == 0 || size.height == 0 {
                self.is_minimized = true;
                return Ok(());
            }
            renderer.rebuild_swapchain(size.width, size.height)?;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time);
        self.last_frame_time = now;

        let overlay_data = self.stats.prepare(renderer.scene_view(), frame_time);
        renderer.draw(overlay_data)?;

        Ok(())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(self.config.window.title.clone())
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.fatal_error = Some(anyhow::Error::new(e).context("Failed to create window"));
                event_loop.exit();
                return;
            }
        };

        let size = window.inner_size();
        match Renderer::new(&self.config, window.as_ref(), size.width, size.height) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                self.window = Some(window);
            }
            Err(e) => {
                log::error!("Failed to initialize renderer: {:#}", e);
                self.fatal_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    if let Some(renderer) = self.renderer.as_mut() {
                        renderer.swapchain_stale = true;
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.is_minimized {
                    return;
                }

                if let Err(e) = self.redraw() {
                    log::error!("Fatal render error: {:#}", e);
                    self.fatal_error = Some(e);
                    event_loop.exit();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("ESC pressed, exiting...");
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
