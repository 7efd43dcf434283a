//! The per-view worker thread: exclusive owner of the graphics device,
//! driven by a small command channel plus an atomically published
//! monitor rectangle.
//!
//! The loop interleaves three duties: pumping this thread's window
//! messages (the legacy communicator and its timers live here),
//! dispatching commands, and rendering. A frame that finishes in under
//! 10 ms earns a sleep so a broken vsync cannot spin the thread at
//! unbounded rates.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::monitor::MonitorRect;
use crate::pacing::FrameLimiter;

use super::com::CoInitGuard;
use super::duplication::DuplicationSource;
use super::legacy::DwmSource;
use super::renderer::{client_size, Renderer};
use super::source::CaptureSource;
use super::win32::{pump_pending_messages, SendHwnd};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SourceKind {
    Duplication,
    LegacyDwm,
}

#[derive(Debug)]
enum RenderCommand {
    Resize,
    SetScreen,
    Quit,
}

/// The current monitor rectangle, published by the view window's
/// message handler and read by the render thread on `SetScreen`. Four
/// independent words; each field stands alone.
#[derive(Default)]
struct SharedScreen {
    left: AtomicI32,
    top: AtomicI32,
    right: AtomicI32,
    bottom: AtomicI32,
}

impl SharedScreen {
    fn publish(&self, rect: MonitorRect) {
        self.left.store(rect.left, Ordering::SeqCst);
        self.top.store(rect.top, Ordering::SeqCst);
        self.right.store(rect.right, Ordering::SeqCst);
        self.bottom.store(rect.bottom, Ordering::SeqCst);
    }

    fn load(&self) -> MonitorRect {
        MonitorRect {
            left: self.left.load(Ordering::SeqCst),
            top: self.top.load(Ordering::SeqCst),
            right: self.right.load(Ordering::SeqCst),
            bottom: self.bottom.load(Ordering::SeqCst),
        }
    }
}

pub(crate) struct RenderThread {
    sender: mpsc::Sender<RenderCommand>,
    screen: Arc<SharedScreen>,
    join_handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    pub(crate) fn spawn(hwnd: SendHwnd, rect: MonitorRect, kind: SourceKind) -> Self {
        let (sender, receiver) = mpsc::channel();
        let screen = Arc::new(SharedScreen::default());
        screen.publish(rect);

        let thread_screen = screen.clone();
        let join_handle = std::thread::Builder::new()
            .name("screen-view-render".to_string())
            .spawn(move || render_loop(hwnd, kind, &thread_screen, &receiver))
            .map_err(|e| log::error!("failed to spawn render thread: {e}"))
            .ok();

        Self {
            sender,
            screen,
            join_handle,
        }
    }

    pub(crate) fn send_resize(&self) {
        let _ = self.sender.send(RenderCommand::Resize);
    }

    pub(crate) fn send_new_screen(&self, rect: MonitorRect) {
        self.screen.publish(rect);
        let _ = self.sender.send(RenderCommand::SetScreen);
        log::info!("Posted screen change: {rect}");
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        let _ = self.sender.send(RenderCommand::Quit);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

fn build_source(kind: SourceKind) -> Box<dyn CaptureSource> {
    match kind {
        SourceKind::Duplication => Box::new(DuplicationSource::new()),
        SourceKind::LegacyDwm => Box::new(DwmSource::new()),
    }
}

fn render_loop(
    hwnd: SendHwnd,
    kind: SourceKind,
    screen: &SharedScreen,
    receiver: &mpsc::Receiver<RenderCommand>,
) {
    let _com = match CoInitGuard::init_multithreaded() {
        Ok(guard) => Some(guard),
        Err(e) => {
            log::warn!("render thread COM init failed: {e}");
            None
        }
    };

    let source = build_source(kind);
    let mut renderer = match Renderer::new(hwnd.0, screen.load(), source) {
        Ok(renderer) => Some(renderer),
        Err(e) => {
            // The view window still exists; it just stays empty.
            log::error!("renderer initialization failed: {e}");
            None
        }
    };

    let mut limiter = FrameLimiter::new();
    loop {
        // Windows created on this thread (the legacy communicator and
        // the keep-alive timer) only run if someone pumps.
        if !pump_pending_messages() {
            break;
        }

        match receiver.try_recv() {
            Ok(RenderCommand::Resize) => {
                if let Some(renderer) = renderer.as_mut() {
                    let (width, height) = client_size(renderer.hwnd());
                    renderer.resize(width, height);
                }
            }
            Ok(RenderCommand::SetScreen) => {
                if let Some(renderer) = renderer.as_mut() {
                    renderer.reset(screen.load());
                }
            }
            Ok(RenderCommand::Quit) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {
                match renderer.as_mut() {
                    Some(renderer) => renderer.render(),
                    None => std::thread::sleep(FrameLimiter::MIN_FRAME_INTERVAL),
                }
                let pause = limiter.frame_finished(Instant::now());
                if !pause.is_zero() {
                    std::thread::sleep(pause);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_screen_round_trips_the_published_rect() {
        let screen = SharedScreen::default();
        let rect = MonitorRect::from_position_and_size(-1920, 0, 1920, 1200);
        screen.publish(rect);
        assert_eq!(screen.load(), rect);
    }
}
