//! SDL2 Window Display Module
//! Raw preview on the left, latest annotated result on the right.

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use flume::Receiver;
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::PixelFormatEnum;
use sdl2::rect::Rect;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tracing::{error, info};

use super::EventTally;
use crate::capture::{Frame, PixelFormat};
use crate::pipeline::{Pipeline, PipelineEvent, ShutdownReport};
use crate::DisplayConfig;

/// Pause between UI iterations when nothing arrived.
const IDLE_TICK: Duration = Duration::from_millis(5);

pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    title: String,
    width: u32,
    height: u32,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl, config: &DisplayConfig) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window = video_subsystem
            .window(&config.title, config.width, config.height)
            .position_centered()
            .build()?;

        let canvas = window.into_canvas().present_vsync().build()?;
        let texture_creator = canvas.texture_creator();

        Ok(Self {
            canvas,
            texture_creator,
            title: config.title.clone(),
            width: config.width,
            height: config.height,
        })
    }

    fn pane(&self, index: i32) -> Rect {
        let half = self.width / 2;
        Rect::new(index * half as i32, 0, half, self.height)
    }

    fn draw(&mut self, frame: &Frame, dst: Rect) -> Result<()> {
        let format = match frame.format() {
            PixelFormat::Rgb24 => PixelFormatEnum::RGB24,
            PixelFormat::Bgr24 => PixelFormatEnum::BGR24,
        };
        let mut texture = self
            .texture_creator
            .create_texture_streaming(format, frame.width(), frame.height())
            .map_err(|e| eyre!(e))?;
        texture
            .update(None, frame.data(), frame.meta.stride as usize)
            .map_err(|e| eyre!(e))?;

        self.canvas.copy(&texture, None, dst).map_err(|e| eyre!(e))?;
        Ok(())
    }

    fn set_status(&mut self, status: &str) {
        let title = format!("{} | {}", self.title, status);
        if let Err(e) = self.canvas.window_mut().set_title(&title) {
            error!("Could not update window title: {}", e);
        }
    }

    /// Drive the window until it is closed, then shut the pipeline down.
    ///
    /// The loop only ever drains what is already queued, so a slow pipeline
    /// never stalls window handling.
    pub fn run(
        &mut self,
        sdl_context: &sdl2::Sdl,
        pipeline: &Pipeline,
        events: Receiver<PipelineEvent>,
    ) -> Result<(EventTally, ShutdownReport)> {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;
        let mut tally = EventTally::default();
        let mut raw: Option<Frame> = None;
        let mut annotated: Option<Frame> = None;

        'running: loop {
            for event in event_pump.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        keycode: Some(Keycode::Escape),
                        ..
                    } => {
                        info!("Window closed");
                        break 'running;
                    }
                    _ => {}
                }
            }

            let mut dirty = false;
            for event in events.try_iter() {
                tally.record(&event);
                match event {
                    PipelineEvent::RawFrame(frame) => {
                        raw = Some(frame);
                        dirty = true;
                    }
                    PipelineEvent::Annotated(result) => {
                        annotated = Some(result.frame);
                        dirty = true;
                    }
                    PipelineEvent::Error { stage, error } => {
                        self.set_status(&format!("{} error: {}", stage, error));
                    }
                    PipelineEvent::Finished { .. } => {}
                }
            }

            if dirty {
                self.canvas.clear();
                if let Some(frame) = &raw {
                    self.draw(frame, self.pane(0))?;
                }
                if let Some(frame) = &annotated {
                    self.draw(frame, self.pane(1))?;
                }
                self.canvas.present();
            } else {
                std::thread::sleep(IDLE_TICK);
            }
        }

        let report = pipeline.shutdown();
        Ok((tally, report))
    }
}
