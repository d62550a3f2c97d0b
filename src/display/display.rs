//! SDL2 preview window
//! Shows BGR frames received over a channel until the window is closed or Esc is pressed.

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use flume::{Receiver, RecvTimeoutError};
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};

use tracing::info;

use crate::capture::Frame;

/// SDL2 Window Display
pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    width: u32,
    height: u32,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl, title: &str, width: u32, height: u32) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window = video_subsystem
            .window(title, width, height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas = window.into_canvas().present_vsync().build()?;
        let texture_creator = canvas.texture_creator();

        Ok(Self {
            canvas,
            texture_creator,
            width,
            height,
        })
    }

    pub fn render_frame(&mut self, frame: &Frame) -> Result<()> {
        // Texture follows the stream size
        self.width = frame.width();
        self.height = frame.height();
        let mut texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::BGR24, self.width, self.height)
            .map_err(|e| eyre!(e))?;

        texture
            .update(None, &frame.data, frame.meta.stride as usize)
            .map_err(|e| eyre!(e))?;

        self.canvas.clear();
        self.canvas
            .copy(&texture, None, None)
            .map_err(|e| eyre!(e))?;

        self.canvas.present();
        Ok(())
    }

    /// Render frames from `rx` until the window closes, Esc is pressed or all senders are gone
    pub fn run(&mut self, sdl_context: &sdl2::Sdl, rx: Receiver<Frame>) -> Result<()> {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;

        'running: loop {
            for event in event_pump.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        keycode: Some(Keycode::Escape),
                        ..
                    } => {
                        info!("Quit event received");
                        break 'running;
                    }
                    _ => {}
                }
            }

            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(frame) if !frame.is_empty() => self.render_frame(&frame)?,
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        Ok(())
    }
}
